//! libibverbs provider.

use std::ffi::{c_void, CStr};
use std::io;
use std::ptr::{self, NonNull};

use rdma_sys::*;
use tracing::{debug, trace};

use crate::config::PathMtu;
use crate::error::{RdmaError, Result};
use crate::provider::{
    DeviceInfo, MrKeys, Provider, QpCaps, RecvRequest, SendOpcode, SendRequest, WcOpcode,
    WcStatus, WorkCompletion,
};
use crate::qp::QpTransition;
use crate::types::{AccessFlags, Gid};

macro_rules! handle {
    ($name:ident, $raw:ty) => {
        #[derive(Debug)]
        pub struct $name(NonNull<$raw>);

        // SAFETY: verbs objects may be used from any thread; the context
        // owning the handle serialises access.
        unsafe impl Send for $name {}

        impl $name {
            fn as_ptr(&self) -> *mut $raw {
                self.0.as_ptr()
            }
        }
    };
}

handle!(IbvDevice, ibv_context);
handle!(IbvPd, ibv_pd);
handle!(IbvCq, ibv_cq);
handle!(IbvQp, ibv_qp);
handle!(IbvMr, ibv_mr);

/// Real hardware through rdma-sys.
#[derive(Debug, Clone, Copy, Default)]
pub struct IbvProvider;

impl IbvProvider {
    pub fn new() -> Self {
        Self
    }
}

fn check(ret: i32, wrap: impl FnOnce(io::Error) -> RdmaError) -> Result<()> {
    match ret {
        0 => Ok(()),
        e if e > 0 => Err(wrap(io::Error::from_raw_os_error(e))),
        _ => Err(wrap(io::Error::last_os_error())),
    }
}

fn non_null<T>(raw: *mut T, wrap: impl FnOnce(io::Error) -> RdmaError) -> Result<NonNull<T>> {
    NonNull::new(raw).ok_or_else(|| wrap(io::Error::last_os_error()))
}

fn ibv_access(flags: AccessFlags) -> ibv_access_flags {
    let mut out = ibv_access_flags(0);
    if flags.contains(AccessFlags::LOCAL_WRITE) {
        out = out | ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
    }
    if flags.contains(AccessFlags::REMOTE_WRITE) {
        out = out | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
    }
    if flags.contains(AccessFlags::REMOTE_READ) {
        out = out | ibv_access_flags::IBV_ACCESS_REMOTE_READ;
    }
    out
}

fn ibv_path_mtu(mtu: PathMtu) -> ibv_mtu::Type {
    match mtu {
        PathMtu::Mtu256 => ibv_mtu::IBV_MTU_256,
        PathMtu::Mtu512 => ibv_mtu::IBV_MTU_512,
        PathMtu::Mtu1024 => ibv_mtu::IBV_MTU_1024,
        PathMtu::Mtu2048 => ibv_mtu::IBV_MTU_2048,
        PathMtu::Mtu4096 => ibv_mtu::IBV_MTU_4096,
    }
}

fn wc_status(status: ibv_wc_status::Type) -> WcStatus {
    match status {
        ibv_wc_status::IBV_WC_SUCCESS => WcStatus::Success,
        ibv_wc_status::IBV_WC_LOC_LEN_ERR => WcStatus::LocalLength,
        ibv_wc_status::IBV_WC_LOC_PROT_ERR => WcStatus::LocalProtection,
        ibv_wc_status::IBV_WC_WR_FLUSH_ERR => WcStatus::WrFlush,
        ibv_wc_status::IBV_WC_REM_INV_REQ_ERR => WcStatus::RemoteInvalidRequest,
        ibv_wc_status::IBV_WC_REM_ACCESS_ERR => WcStatus::RemoteAccess,
        ibv_wc_status::IBV_WC_REM_OP_ERR => WcStatus::RemoteOperation,
        ibv_wc_status::IBV_WC_RETRY_EXC_ERR => WcStatus::RetryExceeded,
        ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR => WcStatus::RnrRetryExceeded,
        other => WcStatus::Other(other),
    }
}

fn wc_opcode(opcode: ibv_wc_opcode::Type) -> WcOpcode {
    match opcode {
        ibv_wc_opcode::IBV_WC_SEND => WcOpcode::Send,
        ibv_wc_opcode::IBV_WC_RDMA_WRITE => WcOpcode::RdmaWrite,
        ibv_wc_opcode::IBV_WC_RDMA_READ => WcOpcode::RdmaRead,
        ibv_wc_opcode::IBV_WC_RECV => WcOpcode::Recv,
        ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => WcOpcode::RecvRdmaWithImm,
        other => WcOpcode::Other(other),
    }
}

impl Provider for IbvProvider {
    type Device = IbvDevice;
    type Pd = IbvPd;
    type Cq = IbvCq;
    type Qp = IbvQp;
    type Mr = IbvMr;

    fn open_device(&self, name: Option<&str>) -> Result<(IbvDevice, DeviceInfo)> {
        let mut num = 0;
        // SAFETY: `num` is a valid out pointer.
        let list = unsafe { ibv_get_device_list(&mut num) };
        let list = non_null(list, RdmaError::device("ibv_get_device_list"))?;
        // SAFETY: the list holds `num` device pointers until it is freed below.
        let devices = unsafe { std::slice::from_raw_parts(list.as_ptr(), num.max(0) as usize) };

        let mut found = None;
        for &dev in devices {
            // SAFETY: `dev` comes from the live device list.
            let dev_name = unsafe { CStr::from_ptr(ibv_get_device_name(dev)) }
                .to_string_lossy()
                .into_owned();
            debug!(device = %dev_name, "found RDMA device");
            if name.map_or(true, |n| n == dev_name) {
                found = Some((dev, dev_name));
                break;
            }
        }

        let opened = match found {
            Some((dev, dev_name)) => {
                // SAFETY: `dev` is still owned by the list.
                let ctx = unsafe { ibv_open_device(dev) };
                non_null(ctx, RdmaError::device("ibv_open_device"))
                    .map(|ctx| (IbvDevice(ctx), DeviceInfo { name: dev_name }))
            }
            None => match name {
                Some(n) => Err(RdmaError::DeviceNotFound(n.to_string())),
                None => Err(RdmaError::NoDevice),
            },
        };
        // SAFETY: opened contexts stay valid after the list is freed.
        unsafe { ibv_free_device_list(list.as_ptr()) };
        opened
    }

    fn query_gid(&self, device: &IbvDevice, port: u8, index: u8) -> Result<Gid> {
        // SAFETY: ibv_gid is plain data.
        let mut gid = unsafe { std::mem::zeroed::<ibv_gid>() };
        // SAFETY: valid context and out pointer.
        let ret = unsafe { ibv_query_gid(device.as_ptr(), port, index as i32, &mut gid) };
        check(ret, RdmaError::device("ibv_query_gid"))?;
        // SAFETY: every bit pattern is a valid raw gid.
        Ok(Gid::new(unsafe { gid.raw }))
    }

    fn alloc_pd(&self, device: &IbvDevice) -> Result<IbvPd> {
        // SAFETY: valid context.
        let pd = unsafe { ibv_alloc_pd(device.as_ptr()) };
        non_null(pd, RdmaError::resource("ibv_alloc_pd")).map(IbvPd)
    }

    fn create_cq(&self, device: &IbvDevice, depth: u32) -> Result<IbvCq> {
        // SAFETY: valid context; no completion channel.
        let cq = unsafe {
            ibv_create_cq(
                device.as_ptr(),
                depth as i32,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };
        non_null(cq, RdmaError::resource("ibv_create_cq")).map(IbvCq)
    }

    fn create_qp(&self, pd: &IbvPd, cq: &IbvCq, caps: QpCaps) -> Result<IbvQp> {
        // SAFETY: ibv_qp_init_attr is plain data.
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr>() };
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        attr.sq_sig_all = 1;
        attr.send_cq = cq.as_ptr();
        attr.recv_cq = cq.as_ptr();
        attr.cap.max_send_wr = caps.max_send_wr;
        attr.cap.max_recv_wr = caps.max_recv_wr;
        attr.cap.max_send_sge = 1;
        attr.cap.max_recv_sge = 1;
        // SAFETY: valid PD and attributes.
        let qp = unsafe { ibv_create_qp(pd.as_ptr(), &mut attr) };
        non_null(qp, RdmaError::resource("ibv_create_qp")).map(IbvQp)
    }

    fn qp_num(&self, qp: &IbvQp) -> u32 {
        // SAFETY: live QP.
        unsafe { (*qp.as_ptr()).qp_num }
    }

    unsafe fn reg_mr(
        &self,
        pd: &IbvPd,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<IbvMr> {
        let mr = ibv_reg_mr(
            pd.as_ptr(),
            addr as *mut c_void,
            len,
            ibv_access(access).0 as i32,
        );
        non_null(mr, RdmaError::resource("ibv_reg_mr")).map(IbvMr)
    }

    fn mr_keys(&self, mr: &IbvMr) -> MrKeys {
        // SAFETY: live MR.
        let raw = unsafe { &*mr.as_ptr() };
        MrKeys {
            lkey: raw.lkey,
            rkey: raw.rkey,
        }
    }

    fn modify_qp(&self, qp: &IbvQp, transition: &QpTransition) -> Result<()> {
        // SAFETY: ibv_qp_attr is plain data.
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        let mask = match *transition {
            QpTransition::ToInit {
                port,
                pkey_index,
                access,
            } => {
                attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
                attr.port_num = port;
                attr.pkey_index = pkey_index;
                attr.qp_access_flags = ibv_access(access).0;
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                    | ibv_qp_attr_mask::IBV_QP_PORT
                    | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS
            }
            QpTransition::ToRtr {
                port,
                remote_qpn,
                remote_gid,
                sgid_index,
                hop_limit,
                path_mtu,
                rq_psn,
                max_dest_rd_atomic,
                min_rnr_timer,
            } => {
                attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
                attr.path_mtu = ibv_path_mtu(path_mtu);
                attr.dest_qp_num = remote_qpn;
                attr.rq_psn = rq_psn;
                attr.max_dest_rd_atomic = max_dest_rd_atomic;
                attr.min_rnr_timer = min_rnr_timer;
                attr.ah_attr.is_global = 1;
                attr.ah_attr.port_num = port;
                attr.ah_attr.grh.dgid.raw = *remote_gid.as_bytes();
                attr.ah_attr.grh.sgid_index = sgid_index;
                attr.ah_attr.grh.hop_limit = hop_limit;
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_AV
                    | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                    | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                    | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                    | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER
            }
            QpTransition::ToRts {
                sq_psn,
                max_rd_atomic,
                timeout,
                retry_cnt,
                rnr_retry,
            } => {
                attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
                attr.sq_psn = sq_psn;
                attr.max_rd_atomic = max_rd_atomic;
                attr.timeout = timeout;
                attr.retry_cnt = retry_cnt;
                attr.rnr_retry = rnr_retry;
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                    | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                    | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                    | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC
            }
        };
        // SAFETY: live QP and attributes matching `mask`.
        let ret = unsafe { ibv_modify_qp(qp.as_ptr(), &mut attr, mask.0 as _) };
        let to = transition.target();
        check(ret, |source| RdmaError::Transition { to, source })?;
        trace!(qpn = self.qp_num(qp), %to, "modified queue pair");
        Ok(())
    }

    fn post_send(&self, qp: &IbvQp, wr: &SendRequest) -> Result<()> {
        // SAFETY: plain data.
        let mut sge = unsafe { std::mem::zeroed::<ibv_sge>() };
        sge.addr = wr.local.addr;
        sge.length = wr.local.length;
        sge.lkey = wr.local.lkey;

        // SAFETY: plain data.
        let mut sr = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        sr.wr_id = wr.wr_id;
        sr.next = ptr::null_mut();
        sr.sg_list = &mut sge;
        sr.num_sge = 1;
        sr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        sr.opcode = match wr.opcode {
            SendOpcode::Send => ibv_wr_opcode::IBV_WR_SEND,
            SendOpcode::Write => ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            SendOpcode::WriteWithImm => ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM,
            SendOpcode::Read => ibv_wr_opcode::IBV_WR_RDMA_READ,
        };
        if let Some(remote) = wr.remote {
            sr.wr.rdma.remote_addr = remote.addr;
            sr.wr.rdma.rkey = remote.rkey;
        }
        if let Some(imm) = wr.imm {
            sr.imm_data_invalidated_rkey_union = imm_data_invalidated_rkey_union_t {
                imm_data: imm.to_be(),
            };
        }
        let mut bad_wr = ptr::null_mut::<ibv_send_wr>();
        // SAFETY: `sr` and `sge` outlive the call; the registered range was
        // checked by the caller.
        let ret = unsafe { ibv_post_send(qp.as_ptr(), &mut sr, &mut bad_wr) };
        check(ret, RdmaError::data_path("ibv_post_send"))
    }

    fn post_recv(&self, qp: &IbvQp, wr: &RecvRequest) -> Result<()> {
        // SAFETY: plain data.
        let mut sge = unsafe { std::mem::zeroed::<ibv_sge>() };
        sge.addr = wr.local.addr;
        sge.length = wr.local.length;
        sge.lkey = wr.local.lkey;

        // SAFETY: plain data.
        let mut rr = unsafe { std::mem::zeroed::<ibv_recv_wr>() };
        rr.wr_id = wr.wr_id;
        rr.next = ptr::null_mut();
        rr.sg_list = &mut sge;
        rr.num_sge = 1;
        let mut bad_wr = ptr::null_mut::<ibv_recv_wr>();
        // SAFETY: as in post_send.
        let ret = unsafe { ibv_post_recv(qp.as_ptr(), &mut rr, &mut bad_wr) };
        check(ret, RdmaError::data_path("ibv_post_recv"))
    }

    fn poll_cq(&self, cq: &IbvCq) -> Result<Option<WorkCompletion>> {
        // SAFETY: plain data.
        let mut wc = unsafe { std::mem::zeroed::<ibv_wc>() };
        // SAFETY: live CQ and room for one entry.
        let n = unsafe { ibv_poll_cq(cq.as_ptr(), 1, &mut wc) };
        if n < 0 {
            return Err(RdmaError::data_path("ibv_poll_cq")(io::Error::new(
                io::ErrorKind::Other,
                format!("ibv_poll_cq returned {n}"),
            )));
        }
        if n == 0 {
            return Ok(None);
        }
        let opcode = wc_opcode(wc.opcode);
        let imm = if opcode == WcOpcode::RecvRdmaWithImm {
            // SAFETY: the provider filled imm_data for this opcode.
            Some(u32::from_be(unsafe { wc.imm_data_invalidated_rkey_union.imm_data }))
        } else {
            None
        };
        Ok(Some(WorkCompletion {
            wr_id: wc.wr_id,
            status: wc_status(wc.status),
            opcode,
            byte_len: wc.byte_len,
            imm,
        }))
    }

    fn destroy_qp(&self, qp: IbvQp) -> Result<()> {
        // SAFETY: the handle is consumed.
        check(
            unsafe { ibv_destroy_qp(qp.as_ptr()) },
            RdmaError::resource("ibv_destroy_qp"),
        )
    }

    fn dereg_mr(&self, mr: IbvMr) -> Result<()> {
        // SAFETY: the handle is consumed.
        check(
            unsafe { ibv_dereg_mr(mr.as_ptr()) },
            RdmaError::resource("ibv_dereg_mr"),
        )
    }

    fn destroy_cq(&self, cq: IbvCq) -> Result<()> {
        // SAFETY: the handle is consumed.
        check(
            unsafe { ibv_destroy_cq(cq.as_ptr()) },
            RdmaError::resource("ibv_destroy_cq"),
        )
    }

    fn dealloc_pd(&self, pd: IbvPd) -> Result<()> {
        // SAFETY: the handle is consumed.
        check(
            unsafe { ibv_dealloc_pd(pd.as_ptr()) },
            RdmaError::resource("ibv_dealloc_pd"),
        )
    }

    fn close_device(&self, device: IbvDevice) -> Result<()> {
        // SAFETY: the handle is consumed.
        check(
            unsafe { ibv_close_device(device.as_ptr()) },
            RdmaError::device("ibv_close_device"),
        )
    }
}
