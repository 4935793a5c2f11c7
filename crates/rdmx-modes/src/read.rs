//! One-sided reads: the server publishes a line of text and the client pulls
//! arbitrary byte ranges of it without the server's CPU taking part.

use std::fmt;
use std::io::Write;
use std::time::Duration;

use rdmx_verbs::{Provider, Session};
use tracing::{debug, info};

use crate::{until_nul, DriverStats, Result};

/// An inclusive byte range `start..=end` of the server buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRange {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// The line did not start with two integers.
    Malformed,
    /// Two integers, but not `0 <= start <= end < capacity`.
    OutOfBounds { capacity: usize },
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeError::Malformed => {
                f.write_str("Invalid input. Please enter two numbers: start_pos end_pos")
            }
            RangeError::OutOfBounds { capacity } => write!(
                f,
                "Invalid range. start must be >= 0, end must be >= start and < {capacity}"
            ),
        }
    }
}

impl ReadRange {
    /// Parses `"start end"`; anything after the second number is ignored.
    pub fn parse(line: &str, capacity: usize) -> Result<Self, RangeError> {
        let mut fields = line.split_whitespace().map(str::parse::<i64>);
        let (Some(Ok(start)), Some(Ok(end))) = (fields.next(), fields.next()) else {
            return Err(RangeError::Malformed);
        };
        if start < 0 || end < start || end >= capacity as i64 {
            return Err(RangeError::OutOfBounds { capacity });
        }
        Ok(Self {
            start: start as usize,
            end: end as usize,
        })
    }

    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Copies one line of text, NUL-terminated, to the start of the buffer.
/// Text that does not fit is cut to `capacity - 1` bytes.
pub fn store_text<P: Provider>(session: &mut Session<P>, text: &str) -> Result<usize> {
    let text = text.trim_end_matches(['\r', '\n']).as_bytes();
    let keep = text.len().min(session.capacity().saturating_sub(1));
    let buffer = session.buffer_mut()?;
    buffer.write_at(0, &text[..keep])?;
    buffer.write_at(keep, &[0])?;
    debug!(bytes = keep, "text stored for remote reads");
    Ok(keep)
}

/// Stores the first line and then stays connected until shutdown so the
/// client can read it.
pub fn run_read_server<P, I, W>(
    session: &mut Session<P>,
    lines: I,
    out: &mut W,
) -> Result<DriverStats>
where
    P: Provider,
    I: IntoIterator<Item = String>,
    W: Write,
{
    writeln!(out, "Read Server ready.")?;
    write!(out, "Enter text to store: ")?;
    out.flush()?;
    let Some(line) = lines.into_iter().next() else {
        return Ok(DriverStats::default());
    };
    let stored = store_text(session, &line)?;
    writeln!(out, "Waiting for client read requests...")?;
    out.flush()?;

    let shutdown = session.shutdown_signal().clone();
    while shutdown.sleep(Duration::from_secs(1)).is_ok() {}
    info!(bytes = stored, "read server stopping");
    Ok(DriverStats {
        messages: 1,
        bytes: stored as u64,
    })
}

/// Reads each requested range from the server's buffer and prints it.
pub fn run_read_client<P, I, W>(
    session: &mut Session<P>,
    lines: I,
    out: &mut W,
) -> Result<DriverStats>
where
    P: Provider,
    I: IntoIterator<Item = String>,
    W: Write,
{
    writeln!(out, "Connected to server.")?;
    writeln!(out, "Enter character range to read (format: start_pos end_pos):")?;
    writeln!(out, "Example: 0 5 to read first 6 characters")?;
    out.flush()?;
    let target = session.remote_target();
    let mut stats = DriverStats::default();
    for line in lines {
        let range = match ReadRange::parse(&line, session.capacity()) {
            Ok(range) => range,
            Err(e) => {
                writeln!(out, "{e}")?;
                continue;
            }
        };
        let len = range.len();
        let read = session
            .post_read(len, target.at(range.start as u64))
            .and_then(|_| session.await_completion());
        match read {
            Ok(_) => {}
            Err(e) if e.is_cancelled() => break,
            Err(e) => return Err(e.into()),
        }
        let text = until_nul(&session.buffer()?.as_slice()[..len]).into_owned();
        writeln!(
            out,
            "Read data ({len} bytes from position {}): {text}",
            range.start
        )?;
        out.flush()?;
        stats.messages += 1;
        stats.bytes += len as u64;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use rdmx_verbs::test_utils::loopback_pair;
    use rdmx_verbs::{Mode, RdmaConfig};

    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(
            ReadRange::parse("0 5", 4096),
            Ok(ReadRange { start: 0, end: 5 })
        );
        assert_eq!(ReadRange::parse(" 7   7 trailing", 4096).unwrap().len(), 1);
        assert_eq!(ReadRange::parse("0 4095", 4096).unwrap().len(), 4096);
        assert_eq!(ReadRange::parse("abc", 4096), Err(RangeError::Malformed));
        assert_eq!(ReadRange::parse("5", 4096), Err(RangeError::Malformed));
        assert_eq!(ReadRange::parse("1 x", 4096), Err(RangeError::Malformed));
        for bad in ["-1 3", "4 3", "0 4096"] {
            assert_eq!(
                ReadRange::parse(bad, 4096),
                Err(RangeError::OutOfBounds { capacity: 4096 })
            );
        }
    }

    #[test]
    fn test_range_error_messages() {
        assert_eq!(
            RangeError::OutOfBounds { capacity: 4096 }.to_string(),
            "Invalid range. start must be >= 0, end must be >= start and < 4096"
        );
        assert_eq!(
            RangeError::Malformed.to_string(),
            "Invalid input. Please enter two numbers: start_pos end_pos"
        );
    }

    #[test]
    fn test_client_reads_ranges() {
        let (mut server, mut client) = loopback_pair(Mode::Read, &RdmaConfig::default()).unwrap();
        assert_eq!(store_text(&mut server, "hello world\n").unwrap(), 11);

        let lines = ["0 4", "6 10", "3 2", "abc", "0 20"].map(String::from);
        let mut out = Vec::new();
        let stats = run_read_client(&mut client, lines, &mut out).unwrap();
        assert_eq!(stats.messages, 3);
        assert_eq!(stats.bytes, 5 + 5 + 21);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Connected to server.\n\
             Enter character range to read (format: start_pos end_pos):\n\
             Example: 0 5 to read first 6 characters\n\
             Read data (5 bytes from position 0): hello\n\
             Read data (5 bytes from position 6): world\n\
             Invalid range. start must be >= 0, end must be >= start and < 4096\n\
             Invalid input. Please enter two numbers: start_pos end_pos\n\
             Read data (21 bytes from position 0): hello world\n"
        );
    }

    #[test]
    fn test_server_stores_first_line_and_idles_until_shutdown() {
        let (mut server, _client) = loopback_pair(Mode::Read, &RdmaConfig::default()).unwrap();
        server.shutdown_signal().trigger();
        let mut out = Vec::new();
        let lines = ["stored text", "ignored"].map(String::from);
        let stats = run_read_server(&mut server, lines, &mut out).unwrap();
        assert_eq!(stats.bytes, 11);
        assert_eq!(&server.buffer().unwrap().as_slice()[..12], b"stored text\0");
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Read Server ready.\nEnter text to store: Waiting for client read requests...\n"
        );
    }

    #[test]
    fn test_server_without_input_returns() {
        let (mut server, _client) = loopback_pair(Mode::Read, &RdmaConfig::default()).unwrap();
        let mut out = Vec::new();
        let stats = run_read_server(&mut server, Vec::<String>::new(), &mut out).unwrap();
        assert_eq!(stats, DriverStats::default());
    }

    #[test]
    fn test_long_text_is_cut_to_capacity() {
        let config = RdmaConfig {
            buffer_size: 256,
            ..Default::default()
        };
        let (mut server, _client) = loopback_pair(Mode::Read, &config).unwrap();
        assert_eq!(store_text(&mut server, &"y".repeat(1000)).unwrap(), 255);
        assert_eq!(server.buffer().unwrap().as_slice()[255], 0);
    }
}
