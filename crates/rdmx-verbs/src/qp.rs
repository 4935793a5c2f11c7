//! The Reset → Init → RTR → RTS state machine.

use std::fmt;

use tracing::debug;

use crate::config::{PathMtu, RdmaConfig};
use crate::error::{RdmaError, Result};
use crate::provider::Provider;
use crate::types::{AccessFlags, Gid};
use crate::wire::PeerAddressRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QpState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    /// Terminal; entered when a transition or a completion fails.
    Error,
}

impl QpState {
    /// The only state reachable from `self`, if any.
    pub fn next(self) -> Option<QpState> {
        match self {
            QpState::Reset => Some(QpState::Init),
            QpState::Init => Some(QpState::ReadyToReceive),
            QpState::ReadyToReceive => Some(QpState::ReadyToSend),
            QpState::ReadyToSend | QpState::Error => None,
        }
    }
}

impl fmt::Display for QpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QpState::Reset => "RESET",
            QpState::Init => "INIT",
            QpState::ReadyToReceive => "RTR",
            QpState::ReadyToSend => "RTS",
            QpState::Error => "ERR",
        })
    }
}

/// Attributes for one `modify_qp` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QpTransition {
    ToInit {
        port: u8,
        pkey_index: u16,
        access: AccessFlags,
    },
    ToRtr {
        port: u8,
        remote_qpn: u32,
        remote_gid: Gid,
        sgid_index: u8,
        hop_limit: u8,
        path_mtu: PathMtu,
        rq_psn: u32,
        max_dest_rd_atomic: u8,
        min_rnr_timer: u8,
    },
    ToRts {
        sq_psn: u32,
        max_rd_atomic: u8,
        timeout: u8,
        retry_cnt: u8,
        rnr_retry: u8,
    },
}

impl QpTransition {
    pub fn init(config: &RdmaConfig, access: AccessFlags) -> Self {
        QpTransition::ToInit {
            port: config.ib_port,
            pkey_index: config.pkey_index,
            access,
        }
    }

    pub fn rtr(config: &RdmaConfig, remote: &PeerAddressRecord) -> Self {
        QpTransition::ToRtr {
            port: config.ib_port,
            remote_qpn: remote.qp_num,
            remote_gid: remote.gid,
            sgid_index: config.gid_index,
            hop_limit: config.hop_limit,
            path_mtu: config.path_mtu,
            rq_psn: config.start_psn,
            max_dest_rd_atomic: config.max_rd_atomic,
            min_rnr_timer: config.min_rnr_timer,
        }
    }

    pub fn rts(config: &RdmaConfig) -> Self {
        QpTransition::ToRts {
            sq_psn: config.start_psn,
            max_rd_atomic: config.max_rd_atomic,
            timeout: config.timeout,
            retry_cnt: config.retry_cnt,
            rnr_retry: config.rnr_retry,
        }
    }

    pub fn target(&self) -> QpState {
        match self {
            QpTransition::ToInit { .. } => QpState::Init,
            QpTransition::ToRtr { .. } => QpState::ReadyToReceive,
            QpTransition::ToRts { .. } => QpState::ReadyToSend,
        }
    }
}

/// Tracks the QP's state and only lets transitions happen in order.
#[derive(Debug)]
pub struct QpStateMachine {
    state: QpState,
}

impl Default for QpStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl QpStateMachine {
    pub fn new() -> Self {
        Self {
            state: QpState::Reset,
        }
    }

    pub fn state(&self) -> QpState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == QpState::ReadyToSend
    }

    pub fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(RdmaError::QpNotReady { state: self.state })
        }
    }

    pub fn mark_error(&mut self) {
        self.state = QpState::Error;
    }

    /// Applies `transition` through `provider`. Out-of-order requests are
    /// refused without touching the QP; a provider failure is terminal.
    pub fn apply<P: Provider>(
        &mut self,
        provider: &P,
        qp: &P::Qp,
        transition: &QpTransition,
    ) -> Result<()> {
        let to = transition.target();
        if self.state.next() != Some(to) {
            return Err(RdmaError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        match provider.modify_qp(qp, transition) {
            Ok(()) => {
                debug!(from = %self.state, %to, "queue pair transition");
                self.state = to;
                Ok(())
            }
            Err(e) => {
                self.state = QpState::Error;
                Err(e)
            }
        }
    }

    /// Runs all three transitions against the peer's record.
    pub fn bring_up<P: Provider>(
        &mut self,
        provider: &P,
        qp: &P::Qp,
        config: &RdmaConfig,
        access: AccessFlags,
        remote: &PeerAddressRecord,
    ) -> Result<()> {
        self.apply(provider, qp, &QpTransition::init(config, access))?;
        self.apply(provider, qp, &QpTransition::rtr(config, remote))?;
        self.apply(provider, qp, &QpTransition::rts(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::soft::{FailPoint, SoftProvider};
    use crate::provider::QpCaps;

    fn setup(provider: &SoftProvider) -> (
        <SoftProvider as Provider>::Device,
        <SoftProvider as Provider>::Pd,
        <SoftProvider as Provider>::Cq,
        <SoftProvider as Provider>::Qp,
    ) {
        let (dev, _) = provider.open_device(None).unwrap();
        let pd = provider.alloc_pd(&dev).unwrap();
        let cq = provider.create_cq(&dev, 10).unwrap();
        let qp = provider.create_qp(&pd, &cq, QpCaps::default()).unwrap();
        (dev, pd, cq, qp)
    }

    #[test]
    fn test_transition_builders_use_config() {
        let config = RdmaConfig::default();
        let remote = PeerAddressRecord {
            qp_num: 77,
            ..Default::default()
        };
        match QpTransition::rtr(&config, &remote) {
            QpTransition::ToRtr {
                remote_qpn,
                path_mtu,
                min_rnr_timer,
                hop_limit,
                sgid_index,
                rq_psn,
                max_dest_rd_atomic,
                ..
            } => {
                assert_eq!(remote_qpn, 77);
                assert_eq!(path_mtu, PathMtu::Mtu1024);
                assert_eq!(min_rnr_timer, 12);
                assert_eq!(hop_limit, 1);
                assert_eq!(sgid_index, 1);
                assert_eq!(rq_psn, 0);
                assert_eq!(max_dest_rd_atomic, 1);
            }
            other => panic!("unexpected transition {other:?}"),
        }
        assert_eq!(
            QpTransition::rts(&config),
            QpTransition::ToRts {
                sq_psn: 0,
                max_rd_atomic: 1,
                timeout: 14,
                retry_cnt: 7,
                rnr_retry: 7,
            }
        );
    }

    #[test]
    fn test_out_of_order_transition_refused() {
        let provider = SoftProvider::new();
        let (_dev, _pd, _cq, qp) = setup(&provider);
        let mut sm = QpStateMachine::new();
        let config = RdmaConfig::default();
        let err = sm
            .apply(&provider, &qp, &QpTransition::rts(&config))
            .unwrap_err();
        assert!(matches!(
            err,
            RdmaError::InvalidTransition {
                from: QpState::Reset,
                to: QpState::ReadyToSend
            }
        ));
        assert_eq!(sm.state(), QpState::Reset);
        assert!(sm.ensure_ready().is_err());
    }

    #[test]
    fn test_bring_up_reaches_rts() {
        let provider = SoftProvider::new();
        let (_dev, _pd, _cq, qp) = setup(&provider);
        let (_dev2, _pd2, _cq2, peer) = setup(&provider);
        let remote = PeerAddressRecord {
            qp_num: provider.qp_num(&peer),
            ..Default::default()
        };
        let mut sm = QpStateMachine::new();
        sm.bring_up(
            &provider,
            &qp,
            &RdmaConfig::default(),
            AccessFlags::LOCAL_WRITE,
            &remote,
        )
        .unwrap();
        assert!(sm.is_ready());
        assert!(sm.ensure_ready().is_ok());
        // No way back.
        assert!(sm
            .apply(
                &provider,
                &qp,
                &QpTransition::init(&RdmaConfig::default(), AccessFlags::LOCAL_WRITE)
            )
            .is_err());
    }

    #[test]
    fn test_failed_transition_is_terminal() {
        let provider = SoftProvider::new();
        let (_dev, _pd, _cq, qp) = setup(&provider);
        let config = RdmaConfig::default();
        let mut sm = QpStateMachine::new();
        sm.apply(&provider, &qp, &QpTransition::init(&config, AccessFlags::LOCAL_WRITE))
            .unwrap();
        provider.fail_next(FailPoint::ModifyQp);
        let err = sm
            .apply(
                &provider,
                &qp,
                &QpTransition::rtr(&config, &PeerAddressRecord::default()),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            RdmaError::Transition {
                to: QpState::ReadyToReceive,
                ..
            }
        ));
        assert_eq!(sm.state(), QpState::Error);
        assert!(sm.apply(&provider, &qp, &QpTransition::rts(&config)).is_err());
    }
}
