use std::io;

use thiserror::Error;

use crate::provider::WcStatus;
use crate::qp::QpState;
use crate::wire::WireError;

pub type Result<T, E = RdmaError> = std::result::Result<T, E>;

/// Coarse classification every [`RdmaError`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Device discovery, context, address resolution or QP transitions.
    Device,
    /// Allocation, registration and buffer bounds.
    Resource,
    /// Control channel and completion failures.
    Communication,
}

#[derive(Debug, Error)]
pub enum RdmaError {
    #[error("no RDMA devices found")]
    NoDevice,

    #[error("RDMA device {0:?} not found")]
    DeviceNotFound(String),

    #[error("{op} failed: {source}")]
    Device {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to move queue pair to {to}: {source}")]
    Transition {
        to: QpState,
        #[source]
        source: io::Error,
    },

    #[error("queue pair transition {from} -> {to} is not allowed")]
    InvalidTransition { from: QpState, to: QpState },

    #[error("RDMA support is not compiled in (rebuild with the `rdma` feature)")]
    Unsupported,

    #[error("{op} failed: {source}")]
    Resource {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("length {length} exceeds buffer capacity {capacity}")]
    LengthExceedsBuffer { length: usize, capacity: usize },

    #[error("queue pair is not ready for data operations (state {state})")]
    QpNotReady { state: QpState },

    #[error("handshake {op} failed: {source}")]
    Handshake {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("could not connect to {addr} after {attempts} attempts: {source}")]
    ConnectExhausted {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("short handshake record: expected {expected} bytes, got {actual}")]
    ShortRecord { expected: usize, actual: usize },

    #[error("malformed peer record: {0}")]
    Wire(#[from] WireError),

    /// A post or poll call on the data path was refused.
    #[error("{op} failed: {source}")]
    DataPath {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("work request {wr_id} completed with status {status}")]
    Completion { status: WcStatus, wr_id: u64 },

    #[error("session is unusable after an earlier completion error")]
    SessionPoisoned,

    #[error("cancelled by shutdown")]
    Cancelled,
}

impl RdmaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RdmaError::NoDevice
            | RdmaError::DeviceNotFound(_)
            | RdmaError::Device { .. }
            | RdmaError::Transition { .. }
            | RdmaError::InvalidTransition { .. }
            | RdmaError::Unsupported => ErrorKind::Device,
            RdmaError::Resource { .. }
            | RdmaError::LengthExceedsBuffer { .. }
            | RdmaError::QpNotReady { .. } => ErrorKind::Resource,
            RdmaError::Handshake { .. }
            | RdmaError::ConnectExhausted { .. }
            | RdmaError::ShortRecord { .. }
            | RdmaError::Wire(_)
            | RdmaError::DataPath { .. }
            | RdmaError::Completion { .. }
            | RdmaError::SessionPoisoned
            | RdmaError::Cancelled => ErrorKind::Communication,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RdmaError::Cancelled)
    }

    pub(crate) fn device(op: &'static str) -> impl FnOnce(io::Error) -> RdmaError {
        move |source| RdmaError::Device { op, source }
    }

    pub(crate) fn resource(op: &'static str) -> impl FnOnce(io::Error) -> RdmaError {
        move |source| RdmaError::Resource { op, source }
    }

    pub(crate) fn data_path(op: &'static str) -> impl FnOnce(io::Error) -> RdmaError {
        move |source| RdmaError::DataPath { op, source }
    }

    pub(crate) fn handshake(op: &'static str) -> impl FnOnce(io::Error) -> RdmaError {
        move |source| RdmaError::Handshake { op, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(RdmaError::NoDevice.kind(), ErrorKind::Device);
        assert_eq!(
            RdmaError::Transition {
                to: QpState::ReadyToReceive,
                source: io::Error::from_raw_os_error(libc::EINVAL),
            }
            .kind(),
            ErrorKind::Device
        );
        assert_eq!(
            RdmaError::LengthExceedsBuffer {
                length: 5000,
                capacity: 4096
            }
            .kind(),
            ErrorKind::Resource
        );
        assert_eq!(
            RdmaError::ShortRecord {
                expected: 32,
                actual: 7
            }
            .kind(),
            ErrorKind::Communication
        );
        assert_eq!(
            RdmaError::Completion {
                status: WcStatus::RemoteAccess,
                wr_id: 3
            }
            .kind(),
            ErrorKind::Communication
        );
    }

    #[test]
    fn test_display_length_exceeds_buffer() {
        let err = RdmaError::LengthExceedsBuffer {
            length: 5000,
            capacity: 4096,
        };
        assert_eq!(err.to_string(), "length 5000 exceeds buffer capacity 4096");
    }

    #[test]
    fn test_display_connect_exhausted() {
        let err = RdmaError::ConnectExhausted {
            addr: "10.0.0.2:18515".into(),
            attempts: 3,
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        let s = err.to_string();
        assert!(s.contains("10.0.0.2:18515"));
        assert!(s.contains("3 attempts"));
    }

    #[test]
    fn test_helper_constructors() {
        let err = RdmaError::resource("ibv_reg_mr")(io::Error::from_raw_os_error(libc::ENOMEM));
        assert!(matches!(err, RdmaError::Resource { op: "ibv_reg_mr", .. }));
        assert_eq!(err.kind(), ErrorKind::Resource);
        let err = RdmaError::device("ibv_open_device")(io::Error::from_raw_os_error(libc::ENODEV));
        assert_eq!(err.kind(), ErrorKind::Device);
    }
}
