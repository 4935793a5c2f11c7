//! Per-session resource set.
//!
//! Every resource is held in an `Option` so that a context can be torn down
//! from any partially initialised state, any number of times.

use std::io;

use tracing::{debug, info, warn};

use crate::buf::RegisteredBuffer;
use crate::config::{HandshakeConfig, RdmaConfig};
use crate::error::{RdmaError, Result};
use crate::executor::Session;
use crate::handshake::{ControlChannel, ControlListener};
use crate::provider::{DeviceInfo, Provider, QpCaps};
use crate::qp::{QpState, QpStateMachine};
use crate::shutdown::ShutdownSignal;
use crate::types::{Gid, Mode};
use crate::wire::PeerAddressRecord;

pub struct ConnectionContext<P: Provider> {
    provider: P,
    mode: Mode,
    config: RdmaConfig,
    device: Option<P::Device>,
    device_info: Option<DeviceInfo>,
    pd: Option<P::Pd>,
    cq: Option<P::Cq>,
    qp: Option<P::Qp>,
    mr: Option<P::Mr>,
    buffer: Option<RegisteredBuffer>,
    gid: Option<Gid>,
    control: Option<ControlChannel>,
    qp_state: QpStateMachine,
}

impl<P: Provider> ConnectionContext<P> {
    /// A context that owns nothing yet.
    pub fn empty(provider: P, mode: Mode, config: RdmaConfig) -> Self {
        Self {
            provider,
            mode,
            config,
            device: None,
            device_info: None,
            pd: None,
            cq: None,
            qp: None,
            mr: None,
            buffer: None,
            gid: None,
            control: None,
            qp_state: QpStateMachine::new(),
        }
    }

    /// Allocates device, PD, CQ, QP and the registered buffer for `mode`.
    ///
    /// On failure everything allocated so far is released before the error
    /// is returned.
    pub fn initialize(provider: P, mode: Mode, config: &RdmaConfig) -> Result<Self> {
        let mut ctx = Self::empty(provider, mode, config.clone());
        if let Err(e) = ctx.allocate() {
            warn!(%mode, error = %e, "resource initialization failed, tearing down");
            ctx.teardown();
            return Err(e);
        }
        info!(
            %mode,
            device = ctx.device_name().unwrap_or("?"),
            gid = %ctx.gid.unwrap_or_default(),
            buffer_size = ctx.config.buffer_size,
            "RDMA resources initialized"
        );
        Ok(ctx)
    }

    fn allocate(&mut self) -> Result<()> {
        let p = &self.provider;
        let config = &self.config;

        let (device, info) = p.open_device(config.device_name.as_deref())?;
        debug!(device = %info.name, "opened device");
        let device = self.device.insert(device);
        self.device_info = Some(info);

        self.pd = Some(p.alloc_pd(device)?);
        self.cq = Some(p.create_cq(device, config.cq_depth)?);

        let (Some(pd), Some(cq)) = (self.pd.as_ref(), self.cq.as_ref()) else {
            return Err(missing("protection domain or completion queue"));
        };
        let caps = QpCaps {
            max_send_wr: config.max_send_wr,
            max_recv_wr: config.max_recv_wr,
        };
        let qp = p.create_qp(pd, cq, caps)?;
        debug!(qpn = p.qp_num(&qp), "created queue pair");
        self.qp = Some(qp);

        let buffer = self
            .buffer
            .insert(RegisteredBuffer::allocate(config.buffer_size)?);
        // SAFETY: the buffer is owned by this context and is only freed after
        // the registration has been released in `teardown`.
        let mr = unsafe {
            p.reg_mr(
                pd,
                buffer.as_mut_ptr(),
                buffer.capacity(),
                self.mode.access_flags(),
            )?
        };
        self.mr = Some(mr);

        self.gid = Some(p.query_gid(device, config.ib_port, config.gid_index)?);
        Ok(())
    }

    /// Releases everything in reverse creation order. Safe to call on a
    /// partially initialised or already torn-down context.
    pub fn teardown(&mut self) {
        let p = &self.provider;
        if let Some(qp) = self.qp.take() {
            if let Err(e) = p.destroy_qp(qp) {
                warn!(error = %e, "failed to destroy queue pair");
            }
        }
        if let Some(mr) = self.mr.take() {
            if let Err(e) = p.dereg_mr(mr) {
                warn!(error = %e, "failed to deregister memory region");
            }
        }
        self.buffer = None;
        if let Some(cq) = self.cq.take() {
            if let Err(e) = p.destroy_cq(cq) {
                warn!(error = %e, "failed to destroy completion queue");
            }
        }
        if let Some(pd) = self.pd.take() {
            if let Err(e) = p.dealloc_pd(pd) {
                warn!(error = %e, "failed to deallocate protection domain");
            }
        }
        if let Some(device) = self.device.take() {
            if let Err(e) = p.close_device(device) {
                warn!(error = %e, "failed to close device");
            }
        }
        if let Some(control) = self.control.take() {
            control.close();
        }
        self.gid = None;
    }

    pub fn is_torn_down(&self) -> bool {
        self.device.is_none()
            && self.pd.is_none()
            && self.cq.is_none()
            && self.qp.is_none()
            && self.mr.is_none()
            && self.buffer.is_none()
            && self.control.is_none()
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn config(&self) -> &RdmaConfig {
        &self.config
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_info.as_ref().map(|i| i.name.as_str())
    }

    pub fn gid(&self) -> Option<Gid> {
        self.gid
    }

    pub fn qp_state(&self) -> QpState {
        self.qp_state.state()
    }

    pub fn buffer(&self) -> Option<&RegisteredBuffer> {
        self.buffer.as_ref()
    }

    pub fn buffer_mut(&mut self) -> Option<&mut RegisteredBuffer> {
        self.buffer.as_mut()
    }

    /// What this side publishes to its peer.
    pub fn local_record(&self) -> Result<PeerAddressRecord> {
        match (&self.qp, &self.mr, &self.buffer, self.gid) {
            (Some(qp), Some(mr), Some(buffer), Some(gid)) => Ok(PeerAddressRecord {
                qp_num: self.provider.qp_num(qp),
                gid,
                buffer_addr: buffer.addr(),
                rkey: self.provider.mr_keys(mr).rkey,
            }),
            _ => Err(missing("queue pair, memory region or gid")),
        }
    }

    /// Server side: waits for the client, then connects the queue pair.
    pub fn accept(self, listener: ControlListener, shutdown: &ShutdownSignal) -> Result<Session<P>> {
        let channel = listener.accept(shutdown)?;
        self.establish(channel, shutdown.clone())
    }

    /// Client side: dials `host`, then connects the queue pair.
    pub fn connect(
        self,
        host: &str,
        handshake: &HandshakeConfig,
        shutdown: &ShutdownSignal,
    ) -> Result<Session<P>> {
        let channel = ControlChannel::connect(host, handshake, shutdown)?;
        self.establish(channel, shutdown.clone())
    }

    /// Exchanges records over `channel`, runs Init → RTR → RTS and waits
    /// until the peer is ready too.
    pub fn establish(
        mut self,
        mut channel: ControlChannel,
        shutdown: ShutdownSignal,
    ) -> Result<Session<P>> {
        let local = self.local_record()?;
        let remote = channel.exchange(&local)?;
        debug!(
            local_qpn = local.qp_num,
            remote_qpn = remote.qp_num,
            remote_gid = %remote.gid,
            remote_addr = format_args!("{:#x}", remote.buffer_addr),
            "peer record received"
        );

        let Some(qp) = self.qp.as_ref() else {
            return Err(missing("queue pair"));
        };
        self.qp_state.bring_up(
            &self.provider,
            qp,
            &self.config,
            self.mode.access_flags(),
            &remote,
        )?;
        channel.barrier()?;

        info!(
            mode = %self.mode,
            role = %channel.role(),
            peer = %channel.peer_addr(),
            local_qpn = local.qp_num,
            remote_qpn = remote.qp_num,
            "queue pair connected"
        );
        self.control = Some(channel);
        Ok(Session::new(self, remote, shutdown))
    }

    /// Borrowed view of the parts the executor needs.
    pub(crate) fn data_path(&self) -> Result<(&P, &P::Qp, &P::Cq, &P::Mr)> {
        match (&self.qp, &self.cq, &self.mr) {
            (Some(qp), Some(cq), Some(mr)) => Ok((&self.provider, qp, cq, mr)),
            _ => Err(missing("queue pair, completion queue or memory region")),
        }
    }

    pub(crate) fn qp_state_machine(&self) -> &QpStateMachine {
        &self.qp_state
    }

    pub(crate) fn qp_state_machine_mut(&mut self) -> &mut QpStateMachine {
        &mut self.qp_state
    }
}

impl<P: Provider> Drop for ConnectionContext<P> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn missing(what: &str) -> RdmaError {
    RdmaError::Resource {
        op: "session resources",
        source: io::Error::new(io::ErrorKind::NotFound, format!("{what} not allocated")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::provider::soft::{FailPoint, SoftProvider};
    use crate::types::AccessFlags;

    #[test]
    fn test_initialize_allocates_everything() {
        let provider = SoftProvider::new();
        let ctx =
            ConnectionContext::initialize(provider.clone(), Mode::Write, &RdmaConfig::default())
                .unwrap();
        let live = provider.live_handles();
        assert_eq!(
            (live.devices, live.pds, live.cqs, live.qps, live.mrs),
            (1, 1, 1, 1, 1)
        );
        assert_eq!(ctx.device_name(), Some("soft0"));
        assert_eq!(ctx.qp_state(), QpState::Reset);
        assert_eq!(ctx.buffer().unwrap().capacity(), 4096);
        let record = ctx.local_record().unwrap();
        assert_eq!(record.buffer_addr, ctx.buffer().unwrap().addr());
        assert!(!record.gid.is_zero());
        drop(ctx);
        assert!(provider.live_handles().is_empty());
    }

    #[test]
    fn test_every_failure_point_unwinds() {
        let cases = [
            (FailPoint::OpenDevice, ErrorKind::Device),
            (FailPoint::AllocPd, ErrorKind::Resource),
            (FailPoint::CreateCq, ErrorKind::Resource),
            (FailPoint::CreateQp, ErrorKind::Resource),
            (FailPoint::RegMr, ErrorKind::Resource),
            (FailPoint::QueryGid, ErrorKind::Device),
        ];
        for (point, kind) in cases {
            let provider = SoftProvider::new();
            provider.fail_next(point);
            let err = match ConnectionContext::initialize(
                provider.clone(),
                Mode::Lambda,
                &RdmaConfig::default(),
            ) {
                Ok(_) => panic!("{point:?} did not fail initialization"),
                Err(e) => e,
            };
            assert_eq!(err.kind(), kind, "{point:?}");
            assert!(
                provider.live_handles().is_empty(),
                "{point:?} leaked {:?}",
                provider.live_handles()
            );
        }
    }

    #[test]
    fn test_missing_device() {
        let provider = SoftProvider::with_devices(&[]);
        let err = match ConnectionContext::initialize(provider, Mode::Read, &RdmaConfig::default())
        {
            Ok(_) => panic!("initialized without a device"),
            Err(e) => e,
        };
        assert!(matches!(err, RdmaError::NoDevice));
        assert_eq!(err.kind(), ErrorKind::Device);
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let provider = SoftProvider::new();
        let mut ctx =
            ConnectionContext::initialize(provider.clone(), Mode::Read, &RdmaConfig::default())
                .unwrap();
        ctx.teardown();
        assert!(ctx.is_torn_down());
        assert!(provider.live_handles().is_empty());
        ctx.teardown();
        assert!(ctx.local_record().is_err());
        drop(ctx);
        assert!(provider.live_handles().is_empty());
    }

    #[test]
    fn test_teardown_of_partial_context() {
        let provider = SoftProvider::new();
        let mut ctx = ConnectionContext::empty(provider.clone(), Mode::Write, RdmaConfig::default());
        let (device, info) = provider.open_device(None).unwrap();
        ctx.pd = Some(provider.alloc_pd(&device).unwrap());
        ctx.device = Some(device);
        ctx.device_info = Some(info);
        assert_eq!(provider.live_handles().total(), 2);
        ctx.teardown();
        ctx.teardown();
        assert!(provider.live_handles().is_empty());
        assert!(ctx.is_torn_down());
    }

    #[test]
    fn test_registration_uses_mode_access() {
        // A read-mode buffer must not be remotely writable; the fabric
        // enforces this, so just confirm the flags chosen per mode.
        assert!(!Mode::Read
            .access_flags()
            .contains(AccessFlags::REMOTE_WRITE));
        let provider = SoftProvider::new();
        let ctx =
            ConnectionContext::initialize(provider, Mode::SendRecv, &RdmaConfig::default()).unwrap();
        assert_eq!(ctx.mode(), Mode::SendRecv);
    }

    #[test]
    fn test_device_name_filter() {
        let provider = SoftProvider::with_devices(&["mlx5_0", "mlx5_1"]);
        let config = RdmaConfig {
            device_name: Some("mlx5_1".into()),
            ..Default::default()
        };
        let ctx = ConnectionContext::initialize(provider.clone(), Mode::Write, &config).unwrap();
        assert_eq!(ctx.device_name(), Some("mlx5_1"));

        let config = RdmaConfig {
            device_name: Some("mlx4_0".into()),
            ..Default::default()
        };
        assert!(matches!(
            ConnectionContext::initialize(provider, Mode::Write, &config),
            Err(RdmaError::DeviceNotFound(_))
        ));
    }
}
