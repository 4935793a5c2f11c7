//! Two-sided messaging: every client message is answered with [`ACK`].

use std::io::Write;

use rdmx_verbs::{Provider, Session};
use tracing::{debug, info};

use crate::{c_message, until_nul, DriverStats, ModeError, Result};

/// The server's reply, NUL included.
pub const ACK: &[u8] = b"ACK\0";

/// Receives messages and acknowledges each one until shutdown.
pub fn run_send_recv_server<P: Provider, W: Write>(
    session: &mut Session<P>,
    out: &mut W,
) -> Result<DriverStats> {
    writeln!(out, "Send-Receive Server ready.")?;
    out.flush()?;
    let mut stats = DriverStats::default();
    loop {
        match serve_message(session, out) {
            Ok(len) => {
                stats.messages += 1;
                stats.bytes += len as u64;
            }
            Err(e) if e.is_cancelled() => {
                info!(messages = stats.messages, "send/receive server stopping");
                return Ok(stats);
            }
            Err(e) => return Err(e),
        }
    }
}

fn serve_message<P: Provider, W: Write>(session: &mut Session<P>, out: &mut W) -> Result<usize> {
    session.post_receive()?;
    let wc = session.await_completion()?;
    let len = (wc.byte_len as usize).min(session.capacity());
    let text = until_nul(&session.buffer()?.as_slice()[..len]).into_owned();
    debug!(bytes = len, "message received");
    writeln!(out, "Received: {text}")?;
    out.flush()?;

    session.post_send(ACK)?;
    session.await_completion()?;
    Ok(len)
}

/// Sends each non-empty line and waits for the acknowledgement.
///
/// Returns when the lines run out or on shutdown.
pub fn run_send_recv_client<P, I, W>(
    session: &mut Session<P>,
    lines: I,
    out: &mut W,
) -> Result<DriverStats>
where
    P: Provider,
    I: IntoIterator<Item = String>,
    W: Write,
{
    writeln!(out, "Connected to server. Enter messages (Ctrl+D to stop):")?;
    out.flush()?;
    let mut stats = DriverStats::default();
    for line in lines {
        let Some(msg) = c_message(&line) else {
            continue;
        };
        if msg.len() > session.capacity() {
            writeln!(
                out,
                "Message too long ({} bytes, limit {})",
                msg.len(),
                session.capacity()
            )?;
            continue;
        }
        match round_trip(session, &msg) {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => break,
            Err(e) => return Err(e),
        }
        stats.messages += 1;
        stats.bytes += msg.len() as u64;
        writeln!(out, "Server acknowledged")?;
        out.flush()?;
    }
    Ok(stats)
}

fn round_trip<P: Provider>(session: &mut Session<P>, msg: &[u8]) -> Result<()> {
    session.post_send(msg)?;
    session.await_completion()?;

    session.post_receive()?;
    let wc = session.await_completion()?;
    let len = (wc.byte_len as usize).min(session.capacity());
    let reply = until_nul(&session.buffer()?.as_slice()[..len]);
    if reply.as_bytes() != ACK.strip_suffix(&[0]).unwrap_or(ACK) {
        return Err(ModeError::UnexpectedReply(reply.into_owned()));
    }
    Ok(())
}
