//! Out-of-band TCP channel for swapping [`PeerAddressRecord`]s.
//!
//! The client always writes first and the server always reads first, so the
//! two sides never block on simultaneous writes.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::HandshakeConfig;
use crate::error::{RdmaError, Result};
use crate::shutdown::ShutdownSignal;
use crate::types::Role;
use crate::wire::{PeerAddressRecord, WireRecord};

const ACCEPT_POLL: Duration = Duration::from_millis(20);
const BARRIER_BYTE: u8 = b'Q';

/// Server side: listens for exactly one client.
pub struct ControlListener {
    inner: TcpListener,
    local_addr: SocketAddr,
    io_timeout: Duration,
}

impl ControlListener {
    pub fn bind(config: &HandshakeConfig) -> Result<Self> {
        let inner = TcpListener::bind((config.bind_addr.as_str(), config.port))
            .map_err(RdmaError::handshake("bind"))?;
        inner
            .set_nonblocking(true)
            .map_err(RdmaError::handshake("bind"))?;
        let local_addr = inner.local_addr().map_err(RdmaError::handshake("bind"))?;
        info!(%local_addr, "control listener bound");
        Ok(Self {
            inner,
            local_addr,
            io_timeout: config.io_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for one connection, then closes the listening socket.
    pub fn accept(self, shutdown: &ShutdownSignal) -> Result<ControlChannel> {
        loop {
            match self.inner.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted control connection");
                    return ControlChannel::from_stream(stream, peer, Role::Server, self.io_timeout);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    shutdown.check()?;
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(RdmaError::handshake("accept")(e)),
            }
        }
    }
}

/// One established control connection.
#[derive(Debug)]
pub struct ControlChannel {
    stream: TcpStream,
    peer: SocketAddr,
    role: Role,
}

impl ControlChannel {
    fn from_stream(
        stream: TcpStream,
        peer: SocketAddr,
        role: Role,
        io_timeout: Duration,
    ) -> Result<Self> {
        let configure = || -> io::Result<()> {
            stream.set_nonblocking(false)?;
            stream.set_nodelay(true)?;
            stream.set_read_timeout(Some(io_timeout))?;
            stream.set_write_timeout(Some(io_timeout))
        };
        configure().map_err(RdmaError::handshake("configure socket"))?;
        Ok(Self { stream, peer, role })
    }

    /// Connects to `host`, retrying with a fixed backoff.
    pub fn connect(host: &str, config: &HandshakeConfig, shutdown: &ShutdownSignal) -> Result<Self> {
        let addrs: Vec<SocketAddr> = (host, config.port)
            .to_socket_addrs()
            .map_err(RdmaError::handshake("resolve"))?
            .collect();
        if addrs.is_empty() {
            return Err(RdmaError::handshake("resolve")(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{host} did not resolve to any address"),
            )));
        }

        let mut last_err = io::Error::from(io::ErrorKind::NotConnected);
        for attempt in 1..=config.connect_attempts {
            shutdown.check()?;
            for addr in &addrs {
                match TcpStream::connect_timeout(addr, config.io_timeout) {
                    Ok(stream) => {
                        debug!(%addr, attempt, "control connection established");
                        return Self::from_stream(stream, *addr, Role::Client, config.io_timeout);
                    }
                    Err(e) => last_err = e,
                }
            }
            warn!(
                host,
                port = config.port,
                attempt,
                max_attempts = config.connect_attempts,
                error = %last_err,
                "connect attempt failed"
            );
            if attempt < config.connect_attempts {
                shutdown.sleep(config.retry_backoff)?;
            }
        }
        Err(RdmaError::ConnectExhausted {
            addr: format!("{host}:{}", config.port),
            attempts: config.connect_attempts,
            source: last_err,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Swaps address records with the peer.
    pub fn exchange(&mut self, local: &PeerAddressRecord) -> Result<PeerAddressRecord> {
        let mut out = [0u8; PeerAddressRecord::SIZE];
        local.encode_into(&mut out)?;
        let mut incoming = [0u8; PeerAddressRecord::SIZE];
        match self.role {
            Role::Client => {
                self.send_all(&out)?;
                self.recv_exact(&mut incoming)?;
            }
            Role::Server => {
                self.recv_exact(&mut incoming)?;
                self.send_all(&out)?;
            }
        }
        Ok(PeerAddressRecord::decode(&incoming)?)
    }

    /// Returns once the peer has reached the same point.
    pub fn barrier(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        match self.role {
            Role::Client => {
                self.send_all(&[BARRIER_BYTE])?;
                self.recv_exact(&mut byte)?;
            }
            Role::Server => {
                self.recv_exact(&mut byte)?;
                self.send_all(&[BARRIER_BYTE])?;
            }
        }
        if byte[0] != BARRIER_BYTE {
            return Err(RdmaError::handshake("barrier")(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected barrier byte {:#04x}", byte[0]),
            )));
        }
        Ok(())
    }

    /// Closes both directions. Errors are ignored; the peer may be gone.
    pub fn close(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn send_all(&mut self, data: &[u8]) -> Result<()> {
        let mut sent = 0;
        while sent < data.len() {
            match self.stream.write(&data[sent..]) {
                Ok(0) => {
                    return Err(RdmaError::ShortRecord {
                        expected: data.len(),
                        actual: sent,
                    })
                }
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(RdmaError::handshake("send")(e)),
            }
        }
        Ok(())
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut got = 0;
        while got < buf.len() {
            match self.stream.read(&mut buf[got..]) {
                Ok(0) => {
                    return Err(RdmaError::ShortRecord {
                        expected: buf.len(),
                        actual: got,
                    })
                }
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(RdmaError::handshake("recv")(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::Gid;
    use std::thread;

    fn loopback_config() -> HandshakeConfig {
        HandshakeConfig {
            bind_addr: "127.0.0.1".into(),
            port: 0,
            io_timeout: Duration::from_secs(5),
            connect_attempts: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }

    fn record(qp_num: u32) -> PeerAddressRecord {
        PeerAddressRecord {
            qp_num,
            gid: Gid::new([qp_num as u8; 16]),
            buffer_addr: 0x1000 * qp_num as u64,
            rkey: qp_num + 100,
        }
    }

    #[test]
    fn test_exchange_swaps_records() {
        let listener = ControlListener::bind(&loopback_config()).unwrap();
        let config = HandshakeConfig {
            port: listener.local_addr().port(),
            ..loopback_config()
        };
        let server = thread::spawn(move || {
            let mut channel = listener.accept(&ShutdownSignal::new()).unwrap();
            assert_eq!(channel.role(), Role::Server);
            let remote = channel.exchange(&record(1)).unwrap();
            channel.barrier().unwrap();
            remote
        });
        let mut client = ControlChannel::connect("127.0.0.1", &config, &ShutdownSignal::new()).unwrap();
        let from_server = client.exchange(&record(2)).unwrap();
        client.barrier().unwrap();
        assert_eq!(from_server, record(1));
        assert_eq!(server.join().unwrap(), record(2));
    }

    #[test]
    fn test_short_record_is_communication_error() {
        let listener = ControlListener::bind(&loopback_config()).unwrap();
        let port = listener.local_addr().port();
        let server = thread::spawn(move || {
            let mut channel = listener.accept(&ShutdownSignal::new()).unwrap();
            channel.exchange(&record(1))
        });
        let mut raw = TcpStream::connect(("127.0.0.1", port)).unwrap();
        raw.write_all(&[0u8; 7]).unwrap();
        drop(raw);
        let err = server.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            RdmaError::ShortRecord {
                expected: 32,
                actual: 7
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Communication);
    }

    #[test]
    fn test_connect_exhausts_attempts() {
        // Bind then drop to find a port with nobody listening.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = HandshakeConfig {
            port,
            connect_attempts: 2,
            retry_backoff: Duration::from_millis(10),
            ..loopback_config()
        };
        let err = ControlChannel::connect("127.0.0.1", &config, &ShutdownSignal::new()).unwrap_err();
        match err {
            RdmaError::ConnectExhausted { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_accept_observes_shutdown() {
        let listener = ControlListener::bind(&loopback_config()).unwrap();
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        assert!(matches!(
            listener.accept(&shutdown),
            Err(RdmaError::Cancelled)
        ));
    }
}
