//! Engine configuration: QP tunables and handshake channel settings.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid {section} config: {reason}")]
pub struct InvalidConfig {
    pub section: &'static str,
    pub reason: String,
}

impl InvalidConfig {
    pub fn new(section: &'static str, reason: impl Into<String>) -> Self {
        Self {
            section,
            reason: reason.into(),
        }
    }
}

/// Path MTU negotiated in the Init → RTR transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PathMtu {
    #[serde(rename = "256")]
    Mtu256,
    #[serde(rename = "512")]
    Mtu512,
    #[default]
    #[serde(rename = "1024")]
    Mtu1024,
    #[serde(rename = "2048")]
    Mtu2048,
    #[serde(rename = "4096")]
    Mtu4096,
}

impl PathMtu {
    pub fn bytes(self) -> u32 {
        match self {
            PathMtu::Mtu256 => 256,
            PathMtu::Mtu512 => 512,
            PathMtu::Mtu1024 => 1024,
            PathMtu::Mtu2048 => 2048,
            PathMtu::Mtu4096 => 4096,
        }
    }
}

impl fmt::Display for PathMtu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// Resource sizing and queue-pair attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RdmaConfig {
    /// Device to open. The first device is used when unset.
    #[serde(default)]
    pub device_name: Option<String>,

    #[serde(default = "default_ib_port")]
    pub ib_port: u8,

    #[serde(default = "default_gid_index")]
    pub gid_index: u8,

    /// Size of the single registered buffer in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_queue_depth")]
    pub cq_depth: u32,

    #[serde(default = "default_queue_depth")]
    pub max_send_wr: u32,

    #[serde(default = "default_queue_depth")]
    pub max_recv_wr: u32,

    #[serde(default)]
    pub path_mtu: PathMtu,

    #[serde(default)]
    pub pkey_index: u16,

    /// Initial send and receive packet sequence number.
    #[serde(default)]
    pub start_psn: u32,

    /// Minimum RNR NAK timer (encoded IB value, not milliseconds).
    #[serde(default = "default_min_rnr_timer")]
    pub min_rnr_timer: u8,

    /// Local ACK timeout exponent: `4.096us * 2^timeout`.
    #[serde(default = "default_timeout")]
    pub timeout: u8,

    #[serde(default = "default_retry")]
    pub retry_cnt: u8,

    /// 7 means retry forever.
    #[serde(default = "default_retry")]
    pub rnr_retry: u8,

    #[serde(default = "default_one")]
    pub hop_limit: u8,

    /// Outstanding RDMA read/atomic credits, both directions.
    #[serde(default = "default_one")]
    pub max_rd_atomic: u8,
}

fn default_ib_port() -> u8 {
    1
}
fn default_gid_index() -> u8 {
    1
}
fn default_buffer_size() -> usize {
    4096
}
fn default_queue_depth() -> u32 {
    10
}
fn default_min_rnr_timer() -> u8 {
    12
}
fn default_timeout() -> u8 {
    14
}
fn default_retry() -> u8 {
    7
}
fn default_one() -> u8 {
    1
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            ib_port: default_ib_port(),
            gid_index: default_gid_index(),
            buffer_size: default_buffer_size(),
            cq_depth: default_queue_depth(),
            max_send_wr: default_queue_depth(),
            max_recv_wr: default_queue_depth(),
            path_mtu: PathMtu::default(),
            pkey_index: 0,
            start_psn: 0,
            min_rnr_timer: default_min_rnr_timer(),
            timeout: default_timeout(),
            retry_cnt: default_retry(),
            rnr_retry: default_retry(),
            hop_limit: default_one(),
            max_rd_atomic: default_one(),
        }
    }
}

impl RdmaConfig {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        let fail = |reason: String| Err(InvalidConfig::new("rdma", reason));
        if self.ib_port == 0 {
            return fail("ib_port must be at least 1".into());
        }
        if self.buffer_size == 0 || self.buffer_size > u32::MAX as usize {
            return fail(format!(
                "buffer_size {} must be in 1..={}",
                self.buffer_size,
                u32::MAX
            ));
        }
        if self.cq_depth == 0 || self.max_send_wr == 0 || self.max_recv_wr == 0 {
            return fail("cq_depth, max_send_wr and max_recv_wr must be non-zero".into());
        }
        if self.cq_depth < self.max_send_wr.max(self.max_recv_wr) {
            return fail(format!(
                "cq_depth {} is smaller than the work request depth",
                self.cq_depth
            ));
        }
        if self.retry_cnt > 7 || self.rnr_retry > 7 {
            return fail("retry_cnt and rnr_retry are 3-bit values (max 7)".into());
        }
        if self.timeout > 31 || self.min_rnr_timer > 31 {
            return fail("timeout and min_rnr_timer are 5-bit values (max 31)".into());
        }
        if self.max_rd_atomic == 0 {
            return fail("max_rd_atomic must be at least 1".into());
        }
        Ok(())
    }
}

/// Out-of-band TCP channel used to swap peer address records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Address the server listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Connect, send and receive timeout on the control socket.
    #[serde(default = "default_io_timeout", with = "secs_f64")]
    pub io_timeout: Duration,

    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    #[serde(default = "default_retry_backoff", with = "secs_f64")]
    pub retry_backoff: Duration,
}

fn default_bind_addr() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    18515
}
fn default_io_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_connect_attempts() -> u32 {
    3
}
fn default_retry_backoff() -> Duration {
    Duration::from_secs(1)
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            io_timeout: default_io_timeout(),
            connect_attempts: default_connect_attempts(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

impl HandshakeConfig {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.connect_attempts == 0 {
            return Err(InvalidConfig::new(
                "handshake",
                "connect_attempts must be at least 1",
            ));
        }
        if self.io_timeout.is_zero() {
            return Err(InvalidConfig::new("handshake", "io_timeout must be positive"));
        }
        Ok(())
    }
}

/// Durations as floating-point seconds (`io_timeout = 2.5`).
pub mod secs_f64 {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| D::Error::custom(format!("invalid duration {secs}: {e}")))
    }
}
