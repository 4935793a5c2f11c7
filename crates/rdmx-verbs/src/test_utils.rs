//! Helpers for tests in this and downstream crates.

use std::io;
use std::thread;
use std::time::Duration;

use crate::config::{HandshakeConfig, RdmaConfig};
use crate::context::ConnectionContext;
use crate::error::{RdmaError, Result};
use crate::executor::Session;
use crate::handshake::ControlListener;
use crate::provider::soft::SoftProvider;
use crate::shutdown::ShutdownSignal;
use crate::types::Mode;

/// Handshake settings for a loopback pair on an ephemeral port.
pub fn loopback_handshake() -> HandshakeConfig {
    HandshakeConfig {
        bind_addr: "127.0.0.1".into(),
        port: 0,
        io_timeout: Duration::from_secs(5),
        connect_attempts: 3,
        retry_backoff: Duration::from_millis(50),
    }
}

/// Connects a server and a client session over one in-process fabric and a
/// real loopback control socket. Returns `(server, client)`.
pub fn loopback_pair(
    mode: Mode,
    config: &RdmaConfig,
) -> Result<(Session<SoftProvider>, Session<SoftProvider>)> {
    loopback_pair_on(SoftProvider::new(), mode, config)
}

/// As [`loopback_pair`], on a caller-supplied fabric.
pub fn loopback_pair_on(
    provider: SoftProvider,
    mode: Mode,
    config: &RdmaConfig,
) -> Result<(Session<SoftProvider>, Session<SoftProvider>)> {
    let mut handshake = loopback_handshake();
    let listener = ControlListener::bind(&handshake)?;
    handshake.port = listener.local_addr().port();

    let server_ctx = ConnectionContext::initialize(provider.clone(), mode, config)?;
    let server = thread::spawn(move || server_ctx.accept(listener, &ShutdownSignal::new()));

    let client = ConnectionContext::initialize(provider, mode, config)?.connect(
        "127.0.0.1",
        &handshake,
        &ShutdownSignal::new(),
    );
    let server = server.join().map_err(|_| RdmaError::Handshake {
        op: "accept",
        source: io::Error::other("server thread panicked"),
    })?;
    Ok((server?, client?))
}
