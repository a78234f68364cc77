// src/session/delegate.rs
//! Session delegate: the session manager's only view of the charging core.
//! Two construction paths share one contract — `direct` calls the in-process
//! responder, `rpc` goes through the TCP JSON-RPC client.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{LoopVerdict, Session, DEBIT_PERIOD};
use crate::error::EngineResult;
use crate::models::{CallCost, CallDescriptor};
use crate::rpc::{Responder, RpcClient};

enum DelegateKind {
    Direct(Arc<Responder>),
    Rpc(Arc<RpcClient>),
}

pub struct SessionDelegate {
    kind: DelegateKind,
    debit_period: Duration,
}

impl SessionDelegate {
    pub fn direct(responder: Arc<Responder>) -> Self {
        SessionDelegate {
            kind: DelegateKind::Direct(responder),
            debit_period: DEBIT_PERIOD,
        }
    }

    pub fn rpc(client: Arc<RpcClient>) -> Self {
        SessionDelegate {
            kind: DelegateKind::Rpc(client),
            debit_period: DEBIT_PERIOD,
        }
    }

    pub fn with_debit_period(mut self, period: Duration) -> Self {
        self.debit_period = period;
        self
    }

    pub fn debit_period(&self) -> Duration {
        self.debit_period
    }

    pub async fn on_answer(&self, session: &Session) {
        match self.kind {
            DelegateKind::Direct(_) => info!("📞 Session {} answered (direct)", session.uuid),
            DelegateKind::Rpc(_) => info!("📞 Session {} answered (rpc)", session.uuid),
        }
    }

    /// Hangup gives back the unused tail of the last debited slice.
    pub async fn on_hangup(&self, session: &Session) {
        info!("📴 Session {} hung up", session.uuid);
        session.refund_last().await;
    }

    async fn debit(&self, cd: &CallDescriptor) -> EngineResult<CallCost> {
        match &self.kind {
            DelegateKind::Direct(responder) => responder.debit(cd).await,
            DelegateKind::Rpc(client) => client.call("Responder.Debit", cd).await,
        }
    }

    async fn max_session_time(&self, cd: &CallDescriptor) -> EngineResult<f64> {
        match &self.kind {
            DelegateKind::Direct(responder) => responder.get_max_session_time(cd).await,
            DelegateKind::Rpc(client) => {
                client.call("Responder.GetMaxSessionTime", cd).await
            }
        }
    }

    pub(crate) async fn refund_increments(&self, cc: &mut CallCost) -> EngineResult<()> {
        match &self.kind {
            DelegateKind::Direct(responder) => {
                responder.refund_increments(cc).await?;
            }
            DelegateKind::Rpc(client) => {
                let _: String = client
                    .call("Responder.RefundIncrements", cc.clone())
                    .await?;
            }
        }
        Ok(())
    }

    /// One debit-loop step: debit the slice, then check affordability of
    /// the next one. `-1` means postpaid (no disconnect checks); zero, an
    /// error, or less than a full period means disconnect.
    pub async fn loop_action(&self, session: &Session, cd: &CallDescriptor) -> LoopVerdict {
        let cc = match self.debit(cd).await {
            Ok(cc) => cc,
            Err(e) => {
                warn!("Could not complete debit operation: {}", e);
                return LoopVerdict::Disconnect;
            }
        };
        let capped = cc.max_cost_disconnect;
        session.push_call_cost(cc).await;
        if capped {
            info!("Max cost reached: disconnect {}", session.uuid);
            return LoopVerdict::Disconnect;
        }

        let period_secs = self.debit_period.as_secs_f64();
        let mut probe = cd.clone();
        probe.time_start = cd.time_end;
        probe.time_end = cd.time_end + chrono::Duration::seconds(period_secs as i64);
        probe.amount = period_secs;
        probe.loop_index = cd.loop_index + 1;

        match self.max_session_time(&probe).await {
            Ok(remaining) if remaining == -1.0 => {
                debug!("Postpaying client: happy talking");
                LoopVerdict::Continue
            }
            Ok(remaining) if remaining <= 0.0 => {
                info!("No credit left: disconnect {}", session.uuid);
                LoopVerdict::Disconnect
            }
            Ok(remaining) if remaining < period_secs => {
                info!(
                    "Not enough credit for another debit period ({}s left): disconnect {}",
                    remaining, session.uuid
                );
                LoopVerdict::Disconnect
            }
            Ok(_) => LoopVerdict::Continue,
            Err(e) => {
                warn!("Could not get max session time: {}", e);
                LoopVerdict::Disconnect
            }
        }
    }
}
