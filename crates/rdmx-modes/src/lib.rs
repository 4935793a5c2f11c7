//! Drivers for the three interactive modes.
//!
//! Each driver runs one role of one mode over an established [`Session`].
//! Input lines come from an iterator and user-facing text goes to a
//! [`Write`] sink, so the binary can hand in stdin/stdout and tests can hand
//! in vectors and byte buffers.
//!
//! [`Session`]: rdmx_verbs::Session
//! [`Write`]: std::io::Write

use std::borrow::Cow;
use std::io;

use rdmx_verbs::RdmaError;
use thiserror::Error;

pub mod read;
pub mod send_recv;
pub mod write;

pub use read::{run_read_client, run_read_server, store_text, RangeError, ReadRange};
pub use send_recv::{run_send_recv_client, run_send_recv_server, ACK};
pub use write::{run_write_client, run_write_server};

pub type Result<T, E = ModeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ModeError {
    #[error(transparent)]
    Rdma(#[from] RdmaError),

    #[error("console output failed: {0}")]
    Output(#[from] io::Error),

    #[error("expected acknowledgement, got {0:?}")]
    UnexpectedReply(String),
}

impl ModeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ModeError::Rdma(e) if e.is_cancelled())
    }
}

/// What a driver did before it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverStats {
    /// Messages received (servers) or completed round trips (clients).
    pub messages: u64,
    pub bytes: u64,
}

/// Bytes up to the first NUL, as text.
pub(crate) fn until_nul(bytes: &[u8]) -> Cow<'_, str> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end])
}

/// The line as a NUL-terminated message, or `None` for blank lines.
pub(crate) fn c_message(line: &str) -> Option<Vec<u8>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return None;
    }
    let mut msg = Vec::with_capacity(line.len() + 1);
    msg.extend_from_slice(line.as_bytes());
    msg.push(0);
    Some(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_until_nul() {
        assert_eq!(until_nul(b"ACK\0junk"), "ACK");
        assert_eq!(until_nul(b"no terminator"), "no terminator");
        assert_eq!(until_nul(b"\0"), "");
    }

    #[test]
    fn test_c_message() {
        assert_eq!(c_message("hello\n").unwrap(), b"hello\0");
        assert_eq!(c_message("hi\r\n").unwrap(), b"hi\0");
        assert!(c_message("").is_none());
        assert!(c_message("\n").is_none());
    }

    #[test]
    fn test_cancelled_classification() {
        assert!(ModeError::Rdma(RdmaError::Cancelled).is_cancelled());
        assert!(!ModeError::Rdma(RdmaError::SessionPoisoned).is_cancelled());
        assert!(!ModeError::UnexpectedReply("NAK".into()).is_cancelled());
    }
}
