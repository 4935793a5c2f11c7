//! Small value types shared across the engine.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// A 128-bit global address identifier, stored in network order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    pub const fn new(raw: [u8; 16]) -> Self {
        Gid(raw)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for Gid {
    /// Colon-separated 16-bit groups, the way `ibv_devinfo -v` prints them.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pair) in self.0.chunks_exact(2).enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}{:02x}", pair[0], pair[1])?;
        }
        Ok(())
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gid({self})")
    }
}

bitflags! {
    /// Access rights for a memory registration and for the QP's Init transition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1 << 0;
        /// Requires `LOCAL_WRITE`.
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
    }
}

/// The four communication patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[serde(rename = "send")]
    SendRecv,
    Write,
    Read,
    Lambda,
}

impl Mode {
    /// Local write always; peers may write into write/lambda buffers and read
    /// from read-mode buffers.
    pub fn access_flags(self) -> AccessFlags {
        match self {
            Mode::SendRecv => AccessFlags::LOCAL_WRITE,
            Mode::Write | Mode::Lambda => AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
            Mode::Read => AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::SendRecv => "send",
            Mode::Write => "write",
            Mode::Read => "read",
            Mode::Lambda => "lambda",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send" => Ok(Mode::SendRecv),
            "write" => Ok(Mode::Write),
            "read" => Ok(Mode::Read),
            "lambda" => Ok(Mode::Lambda),
            other => Err(format!(
                "unknown mode {other:?} (expected send, write, read or lambda)"
            )),
        }
    }
}

/// Which side of the handshake this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Client => f.write_str("client"),
        }
    }
}
