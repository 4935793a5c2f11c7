//! Reliable-Connection RDMA engine.
//!
//! This crate owns everything between "pick a device" and "a queue pair that
//! can move bytes": the per-session resource set, the out-of-band TCP
//! handshake, the Reset → Init → RTR → RTS state machine and the blocking
//! operation executor.
//!
//! Hardware access goes through the [`Provider`] trait. The `ibv` provider
//! talks to libibverbs and needs the `rdma` feature; the [`SoftProvider`]
//! is an in-process fabric with the same semantics, used by tests and by
//! builds without RDMA support.
//!
//! # Lifecycle
//!
//! - [`ConnectionContext::initialize`] allocates device, PD, CQ, QP and the
//!   registered buffer for one [`Mode`].
//! - [`ConnectionContext::accept`] / [`ConnectionContext::connect`] run the
//!   handshake and the three QP transitions, yielding a [`Session`].
//! - A [`Session`] is the only type that can post work, so nothing is posted
//!   before the QP reaches ready-to-send.
//! - Dropping either type tears everything down in reverse order.

pub mod buf;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod handshake;
pub mod provider;
pub mod qp;
pub mod shutdown;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod wire;

pub use buf::{RegionView, RegisteredBuffer, RemoteTarget};
pub use config::{HandshakeConfig, PathMtu, RdmaConfig};
pub use context::ConnectionContext;
pub use error::{ErrorKind, RdmaError, Result};
pub use executor::{Completion, OpKind, OperationDescriptor, Session};
pub use handshake::{ControlChannel, ControlListener};
#[cfg(feature = "rdma")]
pub use provider::ibv::IbvProvider;
pub use provider::soft::SoftProvider;
pub use provider::Provider;
pub use qp::{QpState, QpStateMachine};
pub use shutdown::ShutdownSignal;
pub use types::{AccessFlags, Gid, Mode, Role};
pub use wire::{PeerAddressRecord, WireError};
