//! Posting work and waiting for completions on a connected queue pair.

use std::fmt;

use tracing::{trace, warn};

use crate::buf::{RegionView, RegisteredBuffer, RemoteTarget};
use crate::context::ConnectionContext;
use crate::error::{RdmaError, Result};
use crate::provider::{
    Provider, RecvRequest, SendOpcode, SendRequest, Sge, WcOpcode, WcStatus,
};
use crate::qp::QpState;
use crate::shutdown::ShutdownSignal;
use crate::types::Mode;
use crate::wire::PeerAddressRecord;

/// Spins before the poll loop starts yielding the CPU.
const SPIN_POLLS: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Two-sided; needs a receive posted on the peer.
    Send,
    /// One-sided write that also carries its length as immediate data.
    WriteWithImm,
    /// One-sided read into the local buffer.
    Read,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpKind::Send => "send",
            OpKind::WriteWithImm => "write",
            OpKind::Read => "read",
        })
    }
}

/// One unit of work against the session buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub kind: OpKind,
    /// Region of the local buffer sent from or read into.
    pub local: RegionView,
    /// Required for writes and reads.
    pub remote: Option<RemoteTarget>,
    /// Immediate value for writes; defaults to the length.
    pub imm: Option<u32>,
}

impl OperationDescriptor {
    pub fn send(len: usize) -> Self {
        Self {
            kind: OpKind::Send,
            local: RegionView::new(0, len),
            remote: None,
            imm: None,
        }
    }

    pub fn write(len: usize, target: RemoteTarget) -> Self {
        Self {
            kind: OpKind::WriteWithImm,
            local: RegionView::new(0, len),
            remote: Some(target),
            imm: Some(len as u32),
        }
    }

    pub fn read(len: usize, target: RemoteTarget) -> Self {
        Self {
            kind: OpKind::Read,
            local: RegionView::new(0, len),
            remote: Some(target),
            imm: None,
        }
    }

    /// Moves the local side to `view`; write immediates follow the new length.
    pub fn from_region(mut self, view: RegionView) -> Self {
        self.local = view;
        if self.kind == OpKind::WriteWithImm {
            self.imm = Some(view.len as u32);
        }
        self
    }
}

/// A successful work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub wr_id: u64,
    pub opcode: WcOpcode,
    pub byte_len: u32,
    /// Host order.
    pub imm: Option<u32>,
}

/// A connected queue pair in the ready-to-send state.
///
/// Only [`ConnectionContext::establish`] creates sessions, so every post
/// happens after all three transitions. A failed completion poisons the
/// session; later calls return [`RdmaError::SessionPoisoned`].
pub struct Session<P: Provider> {
    ctx: ConnectionContext<P>,
    remote: PeerAddressRecord,
    shutdown: ShutdownSignal,
    poisoned: bool,
    next_wr_id: u64,
}

impl<P: Provider> Session<P> {
    pub(crate) fn new(
        ctx: ConnectionContext<P>,
        remote: PeerAddressRecord,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            ctx,
            remote,
            shutdown,
            poisoned: false,
            next_wr_id: 1,
        }
    }

    pub fn mode(&self) -> Mode {
        self.ctx.mode()
    }

    pub fn capacity(&self) -> usize {
        self.ctx.config().buffer_size
    }

    pub fn remote(&self) -> &PeerAddressRecord {
        &self.remote
    }

    /// Base of the peer's registered buffer.
    pub fn remote_target(&self) -> RemoteTarget {
        self.remote.remote_target()
    }

    pub fn local_record(&self) -> Result<PeerAddressRecord> {
        self.ctx.local_record()
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn qp_state(&self) -> QpState {
        self.ctx.qp_state()
    }

    pub fn buffer(&self) -> Result<&RegisteredBuffer> {
        self.ctx.buffer().ok_or(RdmaError::SessionPoisoned)
    }

    pub fn buffer_mut(&mut self) -> Result<&mut RegisteredBuffer> {
        self.ctx.buffer_mut().ok_or(RdmaError::SessionPoisoned)
    }

    /// `post(kind, data?, length, target?)`: stages `data` at the start of
    /// the buffer (sends and writes) and posts `length` bytes.
    pub fn post(
        &mut self,
        kind: OpKind,
        data: Option<&[u8]>,
        length: usize,
        target: Option<RemoteTarget>,
    ) -> Result<u64> {
        self.buffer()?.check_len(length)?;
        let desc = match (kind, target) {
            (OpKind::Send, _) => OperationDescriptor::send(length),
            (OpKind::WriteWithImm, Some(t)) => OperationDescriptor::write(length, t),
            (OpKind::Read, Some(t)) => OperationDescriptor::read(length, t),
            (_, None) => {
                return Err(RdmaError::DataPath {
                    op: "post",
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("{kind} needs a remote target"),
                    ),
                })
            }
        };
        if let Some(data) = data {
            if kind != OpKind::Read {
                let staged = &data[..data.len().min(length)];
                self.buffer_mut()?.write_at(0, staged)?;
            }
        }
        self.post_staged(&desc)
    }

    /// Copies `data` into the buffer and sends it.
    pub fn post_send(&mut self, data: &[u8]) -> Result<u64> {
        self.post(OpKind::Send, Some(data), data.len(), None)
    }

    /// Copies `data` into the buffer and writes it to `target`, with the
    /// length as immediate data.
    pub fn post_write(&mut self, data: &[u8], target: RemoteTarget) -> Result<u64> {
        self.post(OpKind::WriteWithImm, Some(data), data.len(), Some(target))
    }

    /// Reads `length` bytes from `target` into the start of the buffer.
    pub fn post_read(&mut self, length: usize, target: RemoteTarget) -> Result<u64> {
        self.post(OpKind::Read, None, length, Some(target))
    }

    /// Posts a descriptor whose bytes are already in the buffer.
    pub fn post_staged(&mut self, desc: &OperationDescriptor) -> Result<u64> {
        self.ensure_usable()?;
        let buffer = self.buffer()?;
        let capacity = buffer.capacity();
        if desc.local.end() > capacity {
            return Err(RdmaError::LengthExceedsBuffer {
                length: desc.local.end(),
                capacity,
            });
        }
        let addr = buffer.addr() + desc.local.offset as u64;
        let (provider, qp, _, mr) = self.ctx.data_path()?;
        let opcode = match desc.kind {
            OpKind::Send => SendOpcode::Send,
            OpKind::WriteWithImm => SendOpcode::WriteWithImm,
            OpKind::Read => SendOpcode::Read,
        };
        let wr_id = self.next_wr_id;
        let wr = SendRequest {
            wr_id,
            opcode,
            local: Sge {
                addr,
                length: desc.local.len as u32,
                lkey: provider.mr_keys(mr).lkey,
            },
            remote: desc.remote,
            imm: if opcode == SendOpcode::WriteWithImm {
                Some(desc.imm.unwrap_or(desc.local.len as u32))
            } else {
                None
            },
        };
        provider.post_send(qp, &wr)?;
        trace!(wr_id, kind = %desc.kind, len = desc.local.len, "posted");
        self.next_wr_id += 1;
        Ok(wr_id)
    }

    /// Posts a receive covering the whole buffer.
    pub fn post_receive(&mut self) -> Result<u64> {
        self.ensure_usable()?;
        let buffer = self.buffer()?;
        let (addr, len) = (buffer.addr(), buffer.capacity());
        let (provider, qp, _, mr) = self.ctx.data_path()?;
        let wr_id = self.next_wr_id;
        let wr = RecvRequest {
            wr_id,
            local: Sge {
                addr,
                length: len as u32,
                lkey: provider.mr_keys(mr).lkey,
            },
        };
        provider.post_recv(qp, &wr)?;
        trace!(wr_id, "posted receive");
        self.next_wr_id += 1;
        Ok(wr_id)
    }

    /// Blocks until one completion is available.
    ///
    /// There is no timeout; only the shutdown signal interrupts the wait.
    pub fn await_completion(&mut self) -> Result<Completion> {
        if self.poisoned {
            return Err(RdmaError::SessionPoisoned);
        }
        let mut idle = 0u32;
        loop {
            let polled = {
                let (provider, _, cq, _) = self.ctx.data_path()?;
                provider.poll_cq(cq)
            };
            match polled {
                Ok(Some(wc)) if wc.status == WcStatus::Success => {
                    trace!(wr_id = wc.wr_id, opcode = ?wc.opcode, len = wc.byte_len, "completion");
                    return Ok(Completion {
                        wr_id: wc.wr_id,
                        opcode: wc.opcode,
                        byte_len: wc.byte_len,
                        imm: wc.imm,
                    });
                }
                Ok(Some(wc)) => {
                    warn!(wr_id = wc.wr_id, status = %wc.status, "work completion failed");
                    self.poison();
                    return Err(RdmaError::Completion {
                        status: wc.status,
                        wr_id: wc.wr_id,
                    });
                }
                Ok(None) => {
                    self.shutdown.check()?;
                    if idle < SPIN_POLLS {
                        idle += 1;
                        std::hint::spin_loop();
                    } else {
                        std::thread::yield_now();
                    }
                }
                Err(e) => {
                    self.poison();
                    return Err(e);
                }
            }
        }
    }

    /// Tears the session down now instead of on drop.
    pub fn close(mut self) {
        self.ctx.teardown();
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(RdmaError::SessionPoisoned);
        }
        self.ctx.qp_state_machine().ensure_ready()
    }

    fn poison(&mut self) {
        self.poisoned = true;
        self.ctx.qp_state_machine_mut().mark_error();
    }
}
