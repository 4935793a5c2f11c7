//! The seam between the engine and a verbs implementation.
//!
//! Handles are opaque associated types. Destruction takes handles by value
//! so a handle cannot be used after it has been released.

use std::fmt;

use crate::buf::RemoteTarget;
use crate::error::Result;
use crate::qp::QpTransition;
use crate::types::{AccessFlags, Gid};

#[cfg(feature = "rdma")]
pub mod ibv;
pub mod soft;

/// Identifies an opened device in logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
}

impl Default for QpCaps {
    fn default() -> Self {
        Self {
            max_send_wr: 10,
            max_recv_wr: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrKeys {
    pub lkey: u32,
    pub rkey: u32,
}

/// One scatter/gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOpcode {
    Send,
    Write,
    WriteWithImm,
    Read,
}

/// A signaled send-queue work request.
#[derive(Debug, Clone, Copy)]
pub struct SendRequest {
    pub wr_id: u64,
    pub opcode: SendOpcode,
    pub local: Sge,
    /// Required for `Write`, `WriteWithImm` and `Read`.
    pub remote: Option<RemoteTarget>,
    /// Host order; providers transmit it in network byte order.
    pub imm: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct RecvRequest {
    pub wr_id: u64,
    pub local: Sge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocalLength,
    LocalProtection,
    WrFlush,
    RemoteInvalidRequest,
    RemoteAccess,
    RemoteOperation,
    RetryExceeded,
    RnrRetryExceeded,
    Other(u32),
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WcStatus::Success => f.write_str("success"),
            WcStatus::LocalLength => f.write_str("local length error"),
            WcStatus::LocalProtection => f.write_str("local protection error"),
            WcStatus::WrFlush => f.write_str("Work Request Flushed Error"),
            WcStatus::RemoteInvalidRequest => f.write_str("remote invalid request error"),
            WcStatus::RemoteAccess => f.write_str("remote access error"),
            WcStatus::RemoteOperation => f.write_str("remote operation error"),
            WcStatus::RetryExceeded => f.write_str("transport retry counter exceeded"),
            WcStatus::RnrRetryExceeded => f.write_str("RNR retry counter exceeded"),
            WcStatus::Other(code) => write!(f, "status {code}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
    RecvRdmaWithImm,
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
    /// Host order.
    pub imm: Option<u32>,
}

/// A verbs implementation.
///
/// Every method maps onto one libibverbs call. Errors carry the failing
/// call's name and are already classified as device, resource or
/// communication errors.
pub trait Provider: Send + Sync + 'static {
    type Device: Send;
    type Pd: Send;
    type Cq: Send;
    type Qp: Send;
    type Mr: Send;

    /// Opens `name`, or the first device when `None`.
    fn open_device(&self, name: Option<&str>) -> Result<(Self::Device, DeviceInfo)>;
    fn query_gid(&self, device: &Self::Device, port: u8, index: u8) -> Result<Gid>;
    fn alloc_pd(&self, device: &Self::Device) -> Result<Self::Pd>;
    fn create_cq(&self, device: &Self::Device, depth: u32) -> Result<Self::Cq>;
    fn create_qp(&self, pd: &Self::Pd, cq: &Self::Cq, caps: QpCaps) -> Result<Self::Qp>;
    fn qp_num(&self, qp: &Self::Qp) -> u32;

    /// # Safety
    ///
    /// `addr..addr + len` must stay valid and must not move until the
    /// returned region is passed to [`Provider::dereg_mr`].
    unsafe fn reg_mr(
        &self,
        pd: &Self::Pd,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<Self::Mr>;
    fn mr_keys(&self, mr: &Self::Mr) -> MrKeys;

    fn modify_qp(&self, qp: &Self::Qp, transition: &QpTransition) -> Result<()>;
    fn post_send(&self, qp: &Self::Qp, wr: &SendRequest) -> Result<()>;
    fn post_recv(&self, qp: &Self::Qp, wr: &RecvRequest) -> Result<()>;
    /// Non-blocking; `None` when the queue is empty.
    fn poll_cq(&self, cq: &Self::Cq) -> Result<Option<WorkCompletion>>;

    fn destroy_qp(&self, qp: Self::Qp) -> Result<()>;
    fn dereg_mr(&self, mr: Self::Mr) -> Result<()>;
    fn destroy_cq(&self, cq: Self::Cq) -> Result<()>;
    fn dealloc_pd(&self, pd: Self::Pd) -> Result<()>;
    fn close_device(&self, device: Self::Device) -> Result<()>;
}
