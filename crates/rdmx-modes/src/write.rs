//! One-sided writes: the client writes straight into the server's buffer and
//! the immediate value tells the server how many bytes arrived.

use std::io::Write;

use rdmx_verbs::{Provider, Session};
use tracing::{debug, info, warn};

use crate::{c_message, until_nul, DriverStats, Result};

/// Prints every message written into the buffer until shutdown.
pub fn run_write_server<P: Provider, W: Write>(
    session: &mut Session<P>,
    out: &mut W,
) -> Result<DriverStats> {
    writeln!(out, "Write Server ready.")?;
    out.flush()?;
    let mut stats = DriverStats::default();
    loop {
        match receive_write(session, out) {
            Ok(len) => {
                stats.messages += 1;
                stats.bytes += len as u64;
            }
            Err(e) if e.is_cancelled() => {
                info!(messages = stats.messages, "write server stopping");
                return Ok(stats);
            }
            Err(e) => return Err(e),
        }
    }
}

fn receive_write<P: Provider, W: Write>(session: &mut Session<P>, out: &mut W) -> Result<u32> {
    session.post_receive()?;
    let wc = session.await_completion()?;
    let len = match wc.imm {
        Some(len) => len,
        None => {
            warn!(opcode = ?wc.opcode, "completion without immediate data");
            wc.byte_len
        }
    };
    let shown = (len as usize).min(session.capacity());
    let text = until_nul(&session.buffer()?.as_slice()[..shown]).into_owned();
    debug!(bytes = len, "write received");
    writeln!(out, "Received ({len} bytes): {text}")?;
    out.flush()?;
    Ok(len)
}

/// Writes each non-empty line, NUL included, into the server's buffer.
pub fn run_write_client<P, I, W>(
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
    let target = session.remote_target();
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
        let sent = session
            .post_write(&msg, target)
            .and_then(|_| session.await_completion());
        match sent {
            Ok(_) => {}
            Err(e) if e.is_cancelled() => break,
            Err(e) => return Err(e.into()),
        }
        stats.messages += 1;
        stats.bytes += msg.len() as u64;
        writeln!(out, "Message sent successfully")?;
        out.flush()?;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::thread;

    use rdmx_verbs::test_utils::loopback_pair;
    use rdmx_verbs::{Mode, RdmaConfig};

    use super::*;

    #[test]
    fn test_server_reports_immediate_length() {
        let (mut server, mut client) = loopback_pair(Mode::Write, &RdmaConfig::default()).unwrap();
        let stop = server.shutdown_signal().clone();
        let handle = thread::spawn(move || {
            let mut out = Vec::new();
            let stats = run_write_server(&mut server, &mut out).unwrap();
            (stats, String::from_utf8(out).unwrap())
        });

        let lines = ["hello", "rdma write"].map(String::from);
        let mut out = Vec::new();
        let stats = run_write_client(&mut client, lines, &mut out).unwrap();
        assert_eq!(stats.messages, 2);
        assert!(String::from_utf8(out)
            .unwrap()
            .ends_with("Message sent successfully\nMessage sent successfully\n"));

        stop.trigger();
        let (stats, printed) = handle.join().unwrap();
        assert_eq!(stats.messages, 2);
        assert_eq!(stats.bytes, 6 + 11);
        assert_eq!(
            printed,
            "Write Server ready.\nReceived (6 bytes): hello\nReceived (11 bytes): rdma write\n"
        );
    }

    #[test]
    fn test_shorter_message_overwrites_prefix() {
        let (mut server, mut client) = loopback_pair(Mode::Write, &RdmaConfig::default()).unwrap();
        let writer = thread::spawn(move || {
            let target = client.remote_target();
            for msg in [&b"a long first message\0"[..], b"short\0"] {
                client.post_write(msg, target).unwrap();
                client.await_completion().unwrap();
            }
        });

        let mut out = Vec::new();
        receive_write(&mut server, &mut out).unwrap();
        receive_write(&mut server, &mut out).unwrap();
        writer.join().unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Received (21 bytes): a long first message\nReceived (6 bytes): short\n"
        );
    }
}
