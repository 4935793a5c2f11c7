//! In-process Reliable-Connection fabric.
//!
//! Devices, protection domains, queues and memory registrations live in one
//! shared table. Two queue pairs opened on the same [`SoftProvider`] (or a
//! clone of it) can be connected and exchange traffic exactly like two hosts
//! on a real fabric:
//!
//! - sends and writes-with-immediate consume a posted receive on the
//!   responder; until one is posted they wait, as with an infinite RNR retry
//!   count, and the requester's completion is only generated on delivery;
//! - plain writes and reads complete immediately;
//! - rkeys are checked for existence, protection domain, access rights and
//!   bounds, and violations produce error completions that move the QP to
//!   the error state.
//!
//! Registered memory is accessed through the raw addresses given to
//! [`Provider::reg_mr`], so the usual registration contract applies.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::{
    DeviceInfo, MrKeys, Provider, QpCaps, RecvRequest, SendOpcode, SendRequest, Sge, WcOpcode,
    WcStatus, WorkCompletion,
};
use crate::error::{RdmaError, Result};
use crate::qp::{QpState, QpTransition};
use crate::types::{AccessFlags, Gid};

/// Operations that can be told to fail once via [`SoftProvider::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    OpenDevice,
    QueryGid,
    AllocPd,
    CreateCq,
    CreateQp,
    RegMr,
    ModifyQp,
    PostSend,
    PostRecv,
    PollCq,
}

/// Count of objects not yet released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LiveHandles {
    pub devices: usize,
    pub pds: usize,
    pub cqs: usize,
    pub qps: usize,
    pub mrs: usize,
}

impl LiveHandles {
    pub fn total(&self) -> usize {
        self.devices + self.pds + self.cqs + self.qps + self.mrs
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[derive(Debug)]
pub struct SoftDevice(u32);
#[derive(Debug)]
pub struct SoftPd(u32);
#[derive(Debug)]
pub struct SoftCq(u32);
#[derive(Debug)]
pub struct SoftQp(u32);
#[derive(Debug)]
pub struct SoftMr {
    lkey: u32,
    rkey: u32,
}

struct DeviceEntry {
    gid: Gid,
    pds: usize,
    cqs: usize,
}

struct PdEntry {
    device: u32,
    qps: usize,
    mrs: usize,
}

struct CqEntry {
    device: u32,
    qps: usize,
    entries: VecDeque<WorkCompletion>,
}

enum Payload {
    Send { data: Vec<u8> },
    WriteWithImm { dest: u64, data: Vec<u8>, imm_be: u32 },
}

struct Inbound {
    payload: Payload,
    sender_qpn: u32,
    sender_wr_id: u64,
}

struct QpEntry {
    pd: u32,
    cq: u32,
    state: QpState,
    remote_qpn: Option<u32>,
    recv_queue: VecDeque<RecvRequest>,
    inbound: VecDeque<Inbound>,
}

struct MrEntry {
    pd: u32,
    addr: u64,
    len: usize,
    access: AccessFlags,
}

impl MrEntry {
    fn covers(&self, addr: u64, len: usize) -> bool {
        let Some(end) = addr.checked_add(len as u64) else {
            return false;
        };
        addr >= self.addr && end <= self.addr + self.len as u64
    }
}

#[derive(Default)]
struct Fabric {
    device_names: Vec<String>,
    next_id: u32,
    devices: HashMap<u32, DeviceEntry>,
    pds: HashMap<u32, PdEntry>,
    cqs: HashMap<u32, CqEntry>,
    qps: HashMap<u32, QpEntry>,
    mrs: HashMap<u32, MrEntry>,
    rkeys: HashMap<u32, u32>,
    fail_points: Vec<FailPoint>,
}

const RKEY_TAG: u32 = 0x5a00_0000;

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl Fabric {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn take_fail(&mut self, point: FailPoint) -> bool {
        match self.fail_points.iter().position(|p| *p == point) {
            Some(i) => {
                self.fail_points.remove(i);
                true
            }
            None => false,
        }
    }

    /// Queues `wc` on the QP's CQ. Error completions move the QP to error.
    fn complete(&mut self, qpn: u32, wc: WorkCompletion) {
        let Some(qp) = self.qps.get_mut(&qpn) else {
            return;
        };
        if wc.status != WcStatus::Success {
            qp.state = QpState::Error;
        }
        let cq = qp.cq;
        if let Some(cq) = self.cqs.get_mut(&cq) {
            trace!(qpn, wr_id = wc.wr_id, status = %wc.status, "soft completion");
            cq.entries.push_back(wc);
        }
    }

    fn fail_wr(&mut self, qpn: u32, wr_id: u64, status: WcStatus, opcode: WcOpcode) {
        self.complete(
            qpn,
            WorkCompletion {
                wr_id,
                status,
                opcode,
                byte_len: 0,
                imm: None,
            },
        );
    }

    /// The local MR an SGE refers to, if the SGE is fully inside it.
    fn local_mr(&self, pd: u32, sge: &Sge) -> Option<&MrEntry> {
        self.mrs
            .get(&sge.lkey)
            .filter(|mr| mr.pd == pd && mr.covers(sge.addr, sge.length as usize))
    }

    fn remote_mr(&self, pd: u32, rkey: u32, addr: u64, len: usize, need: AccessFlags) -> bool {
        self.rkeys
            .get(&rkey)
            .and_then(|lkey| self.mrs.get(lkey))
            .is_some_and(|mr| mr.pd == pd && mr.access.contains(need) && mr.covers(addr, len))
    }

    fn post_send(&mut self, qpn: u32, wr: &SendRequest) -> Result<()> {
        let post_err = RdmaError::data_path("ibv_post_send");
        let Some((state, pd, remote_qpn)) = self.qps.get(&qpn).map(|q| (q.state, q.pd, q.remote_qpn))
        else {
            return Err(post_err(errno(libc::EINVAL)));
        };
        let sender_opcode = match wr.opcode {
            SendOpcode::Send => WcOpcode::Send,
            SendOpcode::Write | SendOpcode::WriteWithImm => WcOpcode::RdmaWrite,
            SendOpcode::Read => WcOpcode::RdmaRead,
        };
        match state {
            QpState::ReadyToSend => {}
            QpState::Error => {
                self.fail_wr(qpn, wr.wr_id, WcStatus::WrFlush, sender_opcode);
                return Ok(());
            }
            _ => return Err(post_err(errno(libc::EINVAL))),
        }
        if wr.opcode != SendOpcode::Send && wr.remote.is_none() {
            return Err(post_err(errno(libc::EINVAL)));
        }

        let local_ok = self.local_mr(pd, &wr.local).is_some_and(|mr| {
            wr.opcode != SendOpcode::Read || mr.access.contains(AccessFlags::LOCAL_WRITE)
        });
        if !local_ok {
            self.fail_wr(qpn, wr.wr_id, WcStatus::LocalProtection, sender_opcode);
            return Ok(());
        }

        let peer = remote_qpn.and_then(|r| {
            self.qps
                .get(&r)
                .map(|p| (r, p.state, p.remote_qpn, p.pd))
        });
        let (peer_qpn, peer_pd) = match peer {
            Some((r, peer_state, back, peer_pd))
                if matches!(peer_state, QpState::ReadyToReceive | QpState::ReadyToSend)
                    && back == Some(qpn) =>
            {
                (r, peer_pd)
            }
            _ => {
                self.fail_wr(qpn, wr.wr_id, WcStatus::RetryExceeded, sender_opcode);
                return Ok(());
            }
        };

        let len = wr.local.length as usize;
        if let Some(remote) = wr.remote {
            let need = if wr.opcode == SendOpcode::Read {
                AccessFlags::REMOTE_READ
            } else {
                AccessFlags::REMOTE_WRITE
            };
            if wr.opcode != SendOpcode::Send
                && !self.remote_mr(peer_pd, remote.rkey, remote.addr, len, need)
            {
                self.fail_wr(qpn, wr.wr_id, WcStatus::RemoteAccess, sender_opcode);
                return Ok(());
            }
        }

        // SAFETY: the local range was checked against a live registration.
        let local_bytes = || unsafe {
            std::slice::from_raw_parts(wr.local.addr as *const u8, len).to_vec()
        };
        match (wr.opcode, wr.remote) {
            (SendOpcode::Send, _) => {
                let data = local_bytes();
                self.enqueue(peer_qpn, qpn, wr.wr_id, Payload::Send { data });
            }
            (SendOpcode::WriteWithImm, Some(remote)) => {
                let data = local_bytes();
                let imm_be = wr.imm.unwrap_or(0).to_be();
                self.enqueue(
                    peer_qpn,
                    qpn,
                    wr.wr_id,
                    Payload::WriteWithImm {
                        dest: remote.addr,
                        data,
                        imm_be,
                    },
                );
            }
            (SendOpcode::Write, Some(remote)) => {
                // SAFETY: both ranges were checked against live registrations.
                unsafe {
                    std::ptr::copy(wr.local.addr as *const u8, remote.addr as *mut u8, len)
                };
                self.complete(qpn, success(wr.wr_id, WcOpcode::RdmaWrite, len, None));
            }
            (SendOpcode::Read, Some(remote)) => {
                // SAFETY: as above; the local region has local-write access.
                unsafe {
                    std::ptr::copy(remote.addr as *const u8, wr.local.addr as *mut u8, len)
                };
                self.complete(qpn, success(wr.wr_id, WcOpcode::RdmaRead, len, None));
            }
            (_, None) => return Err(post_err(errno(libc::EINVAL))),
        }
        Ok(())
    }

    fn enqueue(&mut self, to: u32, from: u32, wr_id: u64, payload: Payload) {
        if let Some(peer) = self.qps.get_mut(&to) {
            peer.inbound.push_back(Inbound {
                payload,
                sender_qpn: from,
                sender_wr_id: wr_id,
            });
        }
        self.deliver(to);
    }

    /// Matches queued inbound messages with posted receives, in order.
    fn deliver(&mut self, qpn: u32) {
        loop {
            let Some(qp) = self.qps.get_mut(&qpn) else {
                return;
            };
            if qp.state == QpState::Error || qp.recv_queue.is_empty() || qp.inbound.is_empty() {
                return;
            }
            let (Some(recv), Some(msg)) = (qp.recv_queue.pop_front(), qp.inbound.pop_front())
            else {
                return;
            };
            match msg.payload {
                Payload::Send { data } => {
                    if data.len() > recv.local.length as usize {
                        self.fail_wr(qpn, recv.wr_id, WcStatus::LocalLength, WcOpcode::Recv);
                        self.fail_wr(
                            msg.sender_qpn,
                            msg.sender_wr_id,
                            WcStatus::RemoteInvalidRequest,
                            WcOpcode::Send,
                        );
                        return;
                    }
                    // SAFETY: the receive SGE was validated when it was posted.
                    unsafe {
                        std::ptr::copy(data.as_ptr(), recv.local.addr as *mut u8, data.len())
                    };
                    self.complete(qpn, success(recv.wr_id, WcOpcode::Recv, data.len(), None));
                    self.complete(
                        msg.sender_qpn,
                        success(msg.sender_wr_id, WcOpcode::Send, data.len(), None),
                    );
                }
                Payload::WriteWithImm { dest, data, imm_be } => {
                    // SAFETY: the destination was checked against the rkey at post time.
                    unsafe { std::ptr::copy(data.as_ptr(), dest as *mut u8, data.len()) };
                    self.complete(
                        qpn,
                        success(
                            recv.wr_id,
                            WcOpcode::RecvRdmaWithImm,
                            data.len(),
                            Some(u32::from_be(imm_be)),
                        ),
                    );
                    self.complete(
                        msg.sender_qpn,
                        success(msg.sender_wr_id, WcOpcode::RdmaWrite, data.len(), None),
                    );
                }
            }
        }
    }
}

fn success(wr_id: u64, opcode: WcOpcode, len: usize, imm: Option<u32>) -> WorkCompletion {
    WorkCompletion {
        wr_id,
        status: WcStatus::Success,
        opcode,
        byte_len: len as u32,
        imm,
    }
}

/// Shared handle to an in-process fabric. Clones see the same fabric.
#[derive(Clone)]
pub struct SoftProvider {
    fabric: Arc<Mutex<Fabric>>,
}

impl Default for SoftProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SoftProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftProvider")
            .field("live", &self.live_handles())
            .finish()
    }
}

impl SoftProvider {
    /// A fabric with a single device named `soft0`.
    pub fn new() -> Self {
        Self::with_devices(&["soft0"])
    }

    pub fn with_devices(names: &[&str]) -> Self {
        let fabric = Fabric {
            device_names: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        };
        Self {
            fabric: Arc::new(Mutex::new(fabric)),
        }
    }

    /// Makes the next call of `point` fail.
    pub fn fail_next(&self, point: FailPoint) {
        self.fabric.lock().fail_points.push(point);
    }

    pub fn live_handles(&self) -> LiveHandles {
        let f = self.fabric.lock();
        LiveHandles {
            devices: f.devices.len(),
            pds: f.pds.len(),
            cqs: f.cqs.len(),
            qps: f.qps.len(),
            mrs: f.mrs.len(),
        }
    }

    pub fn qp_state(&self, qp: &SoftQp) -> Option<QpState> {
        self.fabric.lock().qps.get(&qp.0).map(|q| q.state)
    }
}

impl Provider for SoftProvider {
    type Device = SoftDevice;
    type Pd = SoftPd;
    type Cq = SoftCq;
    type Qp = SoftQp;
    type Mr = SoftMr;

    fn open_device(&self, name: Option<&str>) -> Result<(SoftDevice, DeviceInfo)> {
        let mut f = self.fabric.lock();
        if f.take_fail(FailPoint::OpenDevice) {
            return Err(RdmaError::device("ibv_open_device")(errno(libc::EIO)));
        }
        let chosen = match name {
            Some(name) => f
                .device_names
                .iter()
                .find(|n| n.as_str() == name)
                .cloned()
                .ok_or_else(|| RdmaError::DeviceNotFound(name.to_string()))?,
            None => f.device_names.first().cloned().ok_or(RdmaError::NoDevice)?,
        };
        let id = f.alloc_id();
        let mut gid = [0u8; 16];
        gid[0] = 0xfe;
        gid[1] = 0x80;
        gid[12..16].copy_from_slice(&id.to_be_bytes());
        f.devices.insert(
            id,
            DeviceEntry {
                gid: Gid::new(gid),
                pds: 0,
                cqs: 0,
            },
        );
        Ok((SoftDevice(id), DeviceInfo { name: chosen }))
    }

    fn query_gid(&self, device: &SoftDevice, port: u8, index: u8) -> Result<Gid> {
        let mut f = self.fabric.lock();
        let fail = f.take_fail(FailPoint::QueryGid);
        match f.devices.get(&device.0) {
            Some(dev) if !fail && port == 1 && index <= 1 => {
                let mut gid = dev.gid;
                gid.0[2] = index;
                Ok(gid)
            }
            _ => Err(RdmaError::device("ibv_query_gid")(errno(libc::EINVAL))),
        }
    }

    fn alloc_pd(&self, device: &SoftDevice) -> Result<SoftPd> {
        let mut f = self.fabric.lock();
        if f.take_fail(FailPoint::AllocPd) || !f.devices.contains_key(&device.0) {
            return Err(RdmaError::resource("ibv_alloc_pd")(errno(libc::ENOMEM)));
        }
        let id = f.alloc_id();
        f.pds.insert(
            id,
            PdEntry {
                device: device.0,
                qps: 0,
                mrs: 0,
            },
        );
        if let Some(dev) = f.devices.get_mut(&device.0) {
            dev.pds += 1;
        }
        Ok(SoftPd(id))
    }

    fn create_cq(&self, device: &SoftDevice, depth: u32) -> Result<SoftCq> {
        let mut f = self.fabric.lock();
        if f.take_fail(FailPoint::CreateCq) || depth == 0 || !f.devices.contains_key(&device.0) {
            return Err(RdmaError::resource("ibv_create_cq")(errno(libc::EINVAL)));
        }
        let id = f.alloc_id();
        f.cqs.insert(
            id,
            CqEntry {
                device: device.0,
                qps: 0,
                entries: VecDeque::new(),
            },
        );
        if let Some(dev) = f.devices.get_mut(&device.0) {
            dev.cqs += 1;
        }
        Ok(SoftCq(id))
    }

    fn create_qp(&self, pd: &SoftPd, cq: &SoftCq, caps: QpCaps) -> Result<SoftQp> {
        let mut f = self.fabric.lock();
        let same_device = match (f.pds.get(&pd.0), f.cqs.get(&cq.0)) {
            (Some(p), Some(c)) => p.device == c.device,
            _ => false,
        };
        if f.take_fail(FailPoint::CreateQp)
            || !same_device
            || caps.max_send_wr == 0
            || caps.max_recv_wr == 0
        {
            return Err(RdmaError::resource("ibv_create_qp")(errno(libc::EINVAL)));
        }
        let qpn = f.alloc_id();
        f.qps.insert(
            qpn,
            QpEntry {
                pd: pd.0,
                cq: cq.0,
                state: QpState::Reset,
                remote_qpn: None,
                recv_queue: VecDeque::new(),
                inbound: VecDeque::new(),
            },
        );
        if let Some(p) = f.pds.get_mut(&pd.0) {
            p.qps += 1;
        }
        if let Some(c) = f.cqs.get_mut(&cq.0) {
            c.qps += 1;
        }
        Ok(SoftQp(qpn))
    }

    fn qp_num(&self, qp: &SoftQp) -> u32 {
        qp.0
    }

    unsafe fn reg_mr(
        &self,
        pd: &SoftPd,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<SoftMr> {
        let mut f = self.fabric.lock();
        let bad_access = access.contains(AccessFlags::REMOTE_WRITE)
            && !access.contains(AccessFlags::LOCAL_WRITE);
        if f.take_fail(FailPoint::RegMr)
            || addr.is_null()
            || len == 0
            || bad_access
            || !f.pds.contains_key(&pd.0)
        {
            return Err(RdmaError::resource("ibv_reg_mr")(errno(libc::EINVAL)));
        }
        let lkey = f.alloc_id();
        let rkey = lkey | RKEY_TAG;
        f.mrs.insert(
            lkey,
            MrEntry {
                pd: pd.0,
                addr: addr as u64,
                len,
                access,
            },
        );
        f.rkeys.insert(rkey, lkey);
        if let Some(p) = f.pds.get_mut(&pd.0) {
            p.mrs += 1;
        }
        Ok(SoftMr { lkey, rkey })
    }

    fn mr_keys(&self, mr: &SoftMr) -> MrKeys {
        MrKeys {
            lkey: mr.lkey,
            rkey: mr.rkey,
        }
    }

    fn modify_qp(&self, qp: &SoftQp, transition: &QpTransition) -> Result<()> {
        let mut f = self.fabric.lock();
        let to = transition.target();
        let fail = f.take_fail(FailPoint::ModifyQp);
        let Some(entry) = f.qps.get_mut(&qp.0) else {
            return Err(RdmaError::Transition {
                to,
                source: errno(libc::EINVAL),
            });
        };
        if fail || entry.state.next() != Some(to) {
            return Err(RdmaError::Transition {
                to,
                source: errno(libc::EINVAL),
            });
        }
        if let QpTransition::ToRtr { remote_qpn, .. } = transition {
            entry.remote_qpn = Some(*remote_qpn);
        }
        entry.state = to;
        Ok(())
    }

    fn post_send(&self, qp: &SoftQp, wr: &SendRequest) -> Result<()> {
        let mut f = self.fabric.lock();
        if f.take_fail(FailPoint::PostSend) {
            return Err(RdmaError::data_path("ibv_post_send")(errno(libc::ENOMEM)));
        }
        f.post_send(qp.0, wr)
    }

    fn post_recv(&self, qp: &SoftQp, wr: &RecvRequest) -> Result<()> {
        let mut f = self.fabric.lock();
        let post_err = RdmaError::data_path("ibv_post_recv");
        if f.take_fail(FailPoint::PostRecv) {
            return Err(post_err(errno(libc::ENOMEM)));
        }
        let (state, pd) = match f.qps.get(&qp.0) {
            Some(q) => (q.state, q.pd),
            None => return Err(post_err(errno(libc::EINVAL))),
        };
        match state {
            QpState::Reset => return Err(post_err(errno(libc::EINVAL))),
            QpState::Error => {
                f.fail_wr(qp.0, wr.wr_id, WcStatus::WrFlush, WcOpcode::Recv);
                return Ok(());
            }
            _ => {}
        }
        let writable = f
            .local_mr(pd, &wr.local)
            .is_some_and(|mr| mr.access.contains(AccessFlags::LOCAL_WRITE));
        if !writable {
            return Err(post_err(errno(libc::EINVAL)));
        }
        if let Some(q) = f.qps.get_mut(&qp.0) {
            q.recv_queue.push_back(*wr);
        }
        f.deliver(qp.0);
        Ok(())
    }

    fn poll_cq(&self, cq: &SoftCq) -> Result<Option<WorkCompletion>> {
        let mut f = self.fabric.lock();
        if f.take_fail(FailPoint::PollCq) {
            return Err(RdmaError::data_path("ibv_poll_cq")(errno(libc::EIO)));
        }
        match f.cqs.get_mut(&cq.0) {
            Some(c) => Ok(c.entries.pop_front()),
            None => Err(RdmaError::data_path("ibv_poll_cq")(errno(libc::EINVAL))),
        }
    }

    fn destroy_qp(&self, qp: SoftQp) -> Result<()> {
        let mut f = self.fabric.lock();
        let Some(entry) = f.qps.remove(&qp.0) else {
            return Err(RdmaError::resource("ibv_destroy_qp")(errno(libc::EINVAL)));
        };
        if let Some(p) = f.pds.get_mut(&entry.pd) {
            p.qps -= 1;
        }
        if let Some(c) = f.cqs.get_mut(&entry.cq) {
            c.qps -= 1;
        }
        // Requesters still waiting on this responder give up.
        for msg in entry.inbound {
            let opcode = match msg.payload {
                Payload::Send { .. } => WcOpcode::Send,
                Payload::WriteWithImm { .. } => WcOpcode::RdmaWrite,
            };
            f.fail_wr(msg.sender_qpn, msg.sender_wr_id, WcStatus::RetryExceeded, opcode);
        }
        Ok(())
    }

    fn dereg_mr(&self, mr: SoftMr) -> Result<()> {
        let mut f = self.fabric.lock();
        let Some(entry) = f.mrs.remove(&mr.lkey) else {
            return Err(RdmaError::resource("ibv_dereg_mr")(errno(libc::EINVAL)));
        };
        f.rkeys.remove(&mr.rkey);
        if let Some(p) = f.pds.get_mut(&entry.pd) {
            p.mrs -= 1;
        }
        Ok(())
    }

    fn destroy_cq(&self, cq: SoftCq) -> Result<()> {
        let mut f = self.fabric.lock();
        match f.cqs.get(&cq.0) {
            Some(c) if c.qps > 0 => Err(RdmaError::resource("ibv_destroy_cq")(errno(libc::EBUSY))),
            Some(c) => {
                let device = c.device;
                f.cqs.remove(&cq.0);
                if let Some(dev) = f.devices.get_mut(&device) {
                    dev.cqs -= 1;
                }
                Ok(())
            }
            None => Err(RdmaError::resource("ibv_destroy_cq")(errno(libc::EINVAL))),
        }
    }

    fn dealloc_pd(&self, pd: SoftPd) -> Result<()> {
        let mut f = self.fabric.lock();
        match f.pds.get(&pd.0) {
            Some(p) if p.qps > 0 || p.mrs > 0 => {
                Err(RdmaError::resource("ibv_dealloc_pd")(errno(libc::EBUSY)))
            }
            Some(p) => {
                let device = p.device;
                f.pds.remove(&pd.0);
                if let Some(dev) = f.devices.get_mut(&device) {
                    dev.pds -= 1;
                }
                Ok(())
            }
            None => Err(RdmaError::resource("ibv_dealloc_pd")(errno(libc::EINVAL))),
        }
    }

    fn close_device(&self, device: SoftDevice) -> Result<()> {
        let mut f = self.fabric.lock();
        match f.devices.get(&device.0) {
            Some(d) if d.pds > 0 || d.cqs > 0 => {
                Err(RdmaError::device("ibv_close_device")(errno(libc::EBUSY)))
            }
            Some(_) => {
                f.devices.remove(&device.0);
                Ok(())
            }
            None => Err(RdmaError::device("ibv_close_device")(errno(libc::EINVAL))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::{RegisteredBuffer, RemoteTarget};
    use crate::config::RdmaConfig;
    use crate::wire::PeerAddressRecord;

    struct End {
        cq: SoftCq,
        qp: SoftQp,
        mr: SoftMr,
        buf: RegisteredBuffer,
    }

    fn end(p: &SoftProvider, access: AccessFlags) -> End {
        let (dev, _) = p.open_device(None).unwrap();
        let pd = p.alloc_pd(&dev).unwrap();
        let cq = p.create_cq(&dev, 10).unwrap();
        let qp = p.create_qp(&pd, &cq, QpCaps::default()).unwrap();
        let mut buf = RegisteredBuffer::allocate(256).unwrap();
        let mr = unsafe { p.reg_mr(&pd, buf.as_mut_ptr(), 256, access).unwrap() };
        End { cq, qp, mr, buf }
    }

    fn connect(p: &SoftProvider, a: &End, b: &End) {
        let config = RdmaConfig::default();
        for (me, peer) in [(a, b), (b, a)] {
            let remote = PeerAddressRecord {
                qp_num: p.qp_num(&peer.qp),
                ..Default::default()
            };
            p.modify_qp(&me.qp, &QpTransition::init(&config, AccessFlags::LOCAL_WRITE))
                .unwrap();
            p.modify_qp(&me.qp, &QpTransition::rtr(&config, &remote)).unwrap();
            p.modify_qp(&me.qp, &QpTransition::rts(&config)).unwrap();
        }
    }

    fn sge(e: &End, offset: usize, len: usize) -> Sge {
        Sge {
            addr: e.buf.addr() + offset as u64,
            length: len as u32,
            lkey: e.mr.lkey,
        }
    }

    fn target(e: &End) -> RemoteTarget {
        RemoteTarget::new(e.buf.addr(), e.mr.rkey)
    }

    #[test]
    fn test_send_waits_for_receive() {
        let p = SoftProvider::new();
        let rw = AccessFlags::LOCAL_WRITE;
        let mut a = end(&p, rw);
        let b = end(&p, rw);
        connect(&p, &a, &b);

        a.buf.write_at(0, b"hello\0").unwrap();
        let wr = SendRequest {
            wr_id: 1,
            opcode: SendOpcode::Send,
            local: sge(&a, 0, 6),
            remote: None,
            imm: None,
        };
        p.post_send(&a.qp, &wr).unwrap();
        // No receive posted yet: nothing completes on either side.
        assert!(p.poll_cq(&a.cq).unwrap().is_none());
        assert!(p.poll_cq(&b.cq).unwrap().is_none());

        p.post_recv(
            &b.qp,
            &RecvRequest {
                wr_id: 9,
                local: sge(&b, 0, 256),
            },
        )
        .unwrap();
        let wc = p.poll_cq(&b.cq).unwrap().unwrap();
        assert_eq!(wc.wr_id, 9);
        assert_eq!(wc.opcode, WcOpcode::Recv);
        assert_eq!(wc.byte_len, 6);
        assert_eq!(&b.buf.as_slice()[..6], b"hello\0");
        let wc = p.poll_cq(&a.cq).unwrap().unwrap();
        assert_eq!((wc.wr_id, wc.status), (1, WcStatus::Success));
    }

    #[test]
    fn test_write_with_imm_carries_value() {
        let p = SoftProvider::new();
        let rw = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE;
        let mut a = end(&p, rw);
        let b = end(&p, rw);
        connect(&p, &a, &b);

        p.post_recv(
            &b.qp,
            &RecvRequest {
                wr_id: 2,
                local: sge(&b, 0, 256),
            },
        )
        .unwrap();
        a.buf.write_at(0, b"payload").unwrap();
        p.post_send(
            &a.qp,
            &SendRequest {
                wr_id: 3,
                opcode: SendOpcode::WriteWithImm,
                local: sge(&a, 0, 7),
                remote: Some(target(&b).at(16)),
                imm: Some(7),
            },
        )
        .unwrap();
        let wc = p.poll_cq(&b.cq).unwrap().unwrap();
        assert_eq!(wc.opcode, WcOpcode::RecvRdmaWithImm);
        assert_eq!(wc.imm, Some(7));
        assert_eq!(&b.buf.as_slice()[16..23], b"payload");
        assert_eq!(p.poll_cq(&a.cq).unwrap().unwrap().status, WcStatus::Success);
    }

    #[test]
    fn test_read_requires_remote_read() {
        let p = SoftProvider::new();
        let mut a = end(&p, AccessFlags::LOCAL_WRITE);
        let mut b = end(&p, AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ);
        let c = end(&p, AccessFlags::LOCAL_WRITE);
        connect(&p, &a, &b);

        b.buf.write_at(0, b"0123456789").unwrap();
        p.post_send(
            &a.qp,
            &SendRequest {
                wr_id: 4,
                opcode: SendOpcode::Read,
                local: sge(&a, 0, 4),
                remote: Some(target(&b).at(3)),
                imm: None,
            },
        )
        .unwrap();
        let wc = p.poll_cq(&a.cq).unwrap().unwrap();
        assert_eq!((wc.status, wc.opcode), (WcStatus::Success, WcOpcode::RdmaRead));
        assert_eq!(&a.buf.as_slice()[..4], b"3456");

        // An rkey without remote-read rights (and from another PD) is refused.
        a.buf.write_at(0, b"....").unwrap();
        p.post_send(
            &a.qp,
            &SendRequest {
                wr_id: 5,
                opcode: SendOpcode::Read,
                local: sge(&a, 0, 4),
                remote: Some(target(&c)),
                imm: None,
            },
        )
        .unwrap();
        let wc = p.poll_cq(&a.cq).unwrap().unwrap();
        assert_eq!(wc.status, WcStatus::RemoteAccess);
        assert_eq!(p.qp_state(&a.qp), Some(QpState::Error));
        assert_eq!(&a.buf.as_slice()[..4], b"....");
    }

    #[test]
    fn test_write_out_of_bounds_is_remote_access_error() {
        let p = SoftProvider::new();
        let rw = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE;
        let a = end(&p, rw);
        let b = end(&p, rw);
        connect(&p, &a, &b);
        p.post_send(
            &a.qp,
            &SendRequest {
                wr_id: 6,
                opcode: SendOpcode::Write,
                local: sge(&a, 0, 16),
                remote: Some(target(&b).at(250)),
                imm: None,
            },
        )
        .unwrap();
        assert_eq!(
            p.poll_cq(&a.cq).unwrap().unwrap().status,
            WcStatus::RemoteAccess
        );
        // Later work on an errored QP is flushed.
        p.post_send(
            &a.qp,
            &SendRequest {
                wr_id: 7,
                opcode: SendOpcode::Write,
                local: sge(&a, 0, 1),
                remote: Some(target(&b)),
                imm: None,
            },
        )
        .unwrap();
        assert_eq!(p.poll_cq(&a.cq).unwrap().unwrap().status, WcStatus::WrFlush);
    }

    #[test]
    fn test_post_before_rts_refused() {
        let p = SoftProvider::new();
        let a = end(&p, AccessFlags::LOCAL_WRITE);
        let err = p
            .post_send(
                &a.qp,
                &SendRequest {
                    wr_id: 1,
                    opcode: SendOpcode::Send,
                    local: sge(&a, 0, 1),
                    remote: None,
                    imm: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, RdmaError::DataPath { op: "ibv_post_send", .. }));
        assert!(p
            .post_recv(
                &a.qp,
                &RecvRequest {
                    wr_id: 1,
                    local: sge(&a, 0, 1)
                }
            )
            .is_err());
    }

    #[test]
    fn test_destroy_order_enforced() {
        let p = SoftProvider::new();
        let (dev, _) = p.open_device(None).unwrap();
        let pd = p.alloc_pd(&dev).unwrap();
        let cq = p.create_cq(&dev, 4).unwrap();
        let qp = p.create_qp(&pd, &cq, QpCaps::default()).unwrap();
        assert_eq!(p.live_handles().total(), 4);

        // Parents cannot go while children are alive.
        let pd_id = pd.0;
        assert!(p.dealloc_pd(pd).is_err());
        let pd = SoftPd(pd_id);
        let cq_id = cq.0;
        assert!(p.destroy_cq(cq).is_err());
        let cq = SoftCq(cq_id);

        p.destroy_qp(qp).unwrap();
        p.destroy_cq(cq).unwrap();
        p.dealloc_pd(pd).unwrap();
        p.close_device(dev).unwrap();
        assert!(p.live_handles().is_empty());
    }

    #[test]
    fn test_device_selection() {
        let p = SoftProvider::with_devices(&["mlx5_0", "mlx5_1"]);
        let (_d, info) = p.open_device(None).unwrap();
        assert_eq!(info.name, "mlx5_0");
        let (_d, info) = p.open_device(Some("mlx5_1")).unwrap();
        assert_eq!(info.name, "mlx5_1");
        assert!(matches!(
            p.open_device(Some("mlx4_0")),
            Err(RdmaError::DeviceNotFound(_))
        ));
        let empty = SoftProvider::with_devices(&[]);
        assert!(matches!(empty.open_device(None), Err(RdmaError::NoDevice)));
    }

    #[test]
    fn test_gids_are_unique_per_device() {
        let p = SoftProvider::new();
        let (d1, _) = p.open_device(None).unwrap();
        let (d2, _) = p.open_device(None).unwrap();
        let g1 = p.query_gid(&d1, 1, 1).unwrap();
        let g2 = p.query_gid(&d2, 1, 1).unwrap();
        assert_ne!(g1, g2);
        assert!(p.query_gid(&d1, 2, 1).is_err());
        assert!(p.query_gid(&d1, 1, 5).is_err());
    }

    #[test]
    fn test_fail_next_fires_once() {
        let p = SoftProvider::new();
        let (dev, _) = p.open_device(None).unwrap();
        p.fail_next(FailPoint::AllocPd);
        assert!(matches!(
            p.alloc_pd(&dev),
            Err(RdmaError::Resource { op: "ibv_alloc_pd", .. })
        ));
        assert!(p.alloc_pd(&dev).is_ok());
    }

    #[test]
    fn test_destroying_responder_fails_waiting_sender() {
        let p = SoftProvider::new();
        let rw = AccessFlags::LOCAL_WRITE;
        let a = end(&p, rw);
        let b = end(&p, rw);
        connect(&p, &a, &b);
        p.post_send(
            &a.qp,
            &SendRequest {
                wr_id: 11,
                opcode: SendOpcode::Send,
                local: sge(&a, 0, 4),
                remote: None,
                imm: None,
            },
        )
        .unwrap();
        p.dereg_mr(b.mr).unwrap();
        p.destroy_qp(b.qp).unwrap();
        let wc = p.poll_cq(&a.cq).unwrap().unwrap();
        assert_eq!((wc.wr_id, wc.status), (11, WcStatus::RetryExceeded));
    }
}
