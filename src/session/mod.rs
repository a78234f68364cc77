// src/session/mod.rs
//! Per-call session state machine.
//!
//! A session lives from the switch's answer event to its hangup event. An
//! active session debits one slice per period on its own task; credit
//! exhaustion or a max-cost cap disconnects it, and hangup refunds the
//! unused tail of the last slice. Hangup waits for an in-flight tick, so a
//! debit is never interrupted half-way.

mod delegate;

pub use delegate::SessionDelegate;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{CallCost, CallDescriptor};

/// Default interval between prepaid debit ticks.
pub const DEBIT_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Active,
    Disconnecting,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopVerdict {
    Continue,
    Disconnect,
}

pub struct Session {
    pub uuid: String,
    template: CallDescriptor,
    delegate: Arc<SessionDelegate>,
    state: watch::Sender<SessionState>,
    call_costs: Mutex<Vec<CallCost>>,
    tick_gate: Mutex<()>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    loop_index: AtomicU64,
}

impl Session {
    pub fn new(uuid: &str, template: CallDescriptor, delegate: Arc<SessionDelegate>) -> Self {
        let (state, _) = watch::channel(SessionState::Init);
        Session {
            uuid: uuid.to_string(),
            template,
            delegate,
            state,
            call_costs: Mutex::new(Vec::new()),
            tick_gate: Mutex::new(()),
            loop_handle: Mutex::new(None),
            loop_index: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub async fn call_costs(&self) -> Vec<CallCost> {
        self.call_costs.lock().await.clone()
    }

    pub(crate) async fn push_call_cost(&self, cc: CallCost) {
        self.call_costs.lock().await.push(cc);
    }

    /// Answer: become active and start the periodic debit loop. The first
    /// slice is debited immediately.
    pub async fn answer(self: &Arc<Self>) {
        self.state.send_replace(SessionState::Active);
        self.delegate.on_answer(self).await;

        let session = self.clone();
        let period = self.delegate.debit_period();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if session.state() != SessionState::Active {
                    break;
                }
                if session.run_tick().await == LoopVerdict::Disconnect {
                    session.disconnect().await;
                    break;
                }
            }
        });
        *self.loop_handle.lock().await = Some(handle);
    }

    /// One debit-loop tick over `[now, now + period)`.
    pub async fn run_tick(&self) -> LoopVerdict {
        let _gate = self.tick_gate.lock().await;
        let now = Utc::now();
        let period = self.delegate.debit_period();
        let mut cd = self.template.clone();
        cd.time_start = now;
        cd.time_end = now + chrono::Duration::seconds(period.as_secs() as i64);
        cd.loop_index = self.loop_index.fetch_add(1, Ordering::SeqCst);
        self.delegate.loop_action(self, &cd).await
    }

    /// Credit exhaustion path: stop looping, give back the unused tail.
    pub async fn disconnect(&self) {
        if matches!(
            self.state(),
            SessionState::Disconnecting | SessionState::Ended
        ) {
            return;
        }
        info!("🔌 Disconnecting session {}", self.uuid);
        self.state.send_replace(SessionState::Disconnecting);
        self.refund_last().await;
        self.state.send_replace(SessionState::Ended);
    }

    /// Switch hangup: waits for any in-flight debit, stops the loop and
    /// refunds through the delegate.
    pub async fn hangup(&self) {
        {
            let _gate = self.tick_gate.lock().await;
            if self.state() == SessionState::Ended {
                return;
            }
            self.state.send_replace(SessionState::Disconnecting);
        }
        if let Some(handle) = self.loop_handle.lock().await.take() {
            handle.abort();
        }
        self.delegate.on_hangup(self).await;
        self.state.send_replace(SessionState::Ended);
    }

    /// Refund the unconsumed part of the last debited slice.
    pub(crate) async fn refund_last(&self) {
        let mut costs = self.call_costs.lock().await;
        let Some(mut last) = costs.pop() else {
            return;
        };
        if let Err(e) = self.delegate.refund_increments(&mut last).await {
            warn!("Refund for session {} failed: {}", self.uuid, e);
        }
        costs.push(last);
    }
}

/// Registry of live sessions, driven by switch events.
pub struct SessionManager {
    delegate: Arc<SessionDelegate>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(delegate: Arc<SessionDelegate>) -> Self {
        SessionManager {
            delegate,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// The switch supplies the channel uuid; events without one get a
    /// generated id.
    pub async fn on_channel_answer(
        &self,
        uuid: &str,
        template: CallDescriptor,
    ) -> Arc<Session> {
        let uuid = if uuid.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            uuid.to_string()
        };
        let session = Arc::new(Session::new(&uuid, template, self.delegate.clone()));
        session.answer().await;
        self.sessions
            .write()
            .await
            .insert(uuid, session.clone());
        session
    }

    pub async fn on_channel_hangup_complete(&self, uuid: &str) {
        let session = self.sessions.write().await.remove(uuid);
        match session {
            Some(session) => session.hangup().await,
            None => warn!("Hangup for unknown session {}", uuid),
        }
    }

    pub async fn session(&self, uuid: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(uuid).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
