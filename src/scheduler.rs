// src/scheduler.rs
//! Action plan scheduler: a timer task draining a priority queue ordered by
//! next fire time, feeding a single executor through a bounded channel.
//! `*asap` plans execute inline during load; overdue recurring plans are
//! caught up tick by tick, never coalesced.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::accounts::AccountEngine;
use crate::error::{EngineError, EngineResult};
use crate::models::action::LOG;
use crate::models::{ActionPlan, Timing};
use crate::storage::{AccountingStorage, RatingStorage};

/// Capacity of the execution queue. When it is full, `*log`-only action
/// sets are shed with `scheduler-overloaded`; balance mutating sets always
/// queue, back-pressuring the timer loop instead.
const EXECUTION_QUEUE_DEPTH: usize = 64;

struct ScheduledTask {
    next: DateTime<Utc>,
    timing: Timing,
    plan: ActionPlan,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.next == other.next && self.plan.id == other.plan.id
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    // reversed: the binary heap must pop the earliest fire time first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .next
            .cmp(&self.next)
            .then_with(|| {
                self.plan
                    .weight
                    .partial_cmp(&other.plan.weight)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| other.plan.id.cmp(&self.plan.id))
    }
}

pub struct Scheduler {
    engine: Arc<AccountEngine>,
    accounting: Arc<dyn AccountingStorage>,
    rating: Arc<dyn RatingStorage>,
    queue: Mutex<BinaryHeap<ScheduledTask>>,
    exec_tx: mpsc::Sender<ActionPlan>,
    exec_rx: Mutex<Option<mpsc::Receiver<ActionPlan>>>,
    kick: Notify,
    stopped: AtomicBool,
}

impl Scheduler {
    pub fn new(
        engine: Arc<AccountEngine>,
        accounting: Arc<dyn AccountingStorage>,
        rating: Arc<dyn RatingStorage>,
    ) -> Self {
        let (exec_tx, exec_rx) = mpsc::channel(EXECUTION_QUEUE_DEPTH);
        Scheduler {
            engine,
            accounting,
            rating,
            queue: Mutex::new(BinaryHeap::new()),
            exec_tx,
            exec_rx: Mutex::new(Some(exec_rx)),
            kick: Notify::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Rebuild the queue from the persisted action plans. `*asap` plans
    /// run once, inline, before this returns; recurring plans are queued
    /// at their next fire time. Idempotent, so it doubles as `reload`.
    pub async fn load_action_plans(&self) -> EngineResult<()> {
        let plans = self.accounting.all_action_plans().await?;
        let now = Utc::now();
        let mut queue = self.queue.lock().await;
        queue.clear();

        for plan in plans {
            if plan.account_ids.is_empty() {
                continue;
            }
            let timing = match self.rating.get_timing(&plan.timing_id).await? {
                Some(timing) => timing,
                None => {
                    warn!(
                        "Action plan {} references unknown timing {}",
                        plan.id, plan.timing_id
                    );
                    continue;
                }
            };
            if timing.is_asap() {
                drop(queue);
                self.execute_plan(&plan).await;
                queue = self.queue.lock().await;
                continue;
            }
            if let Some(next) = timing.next_fire_after(now) {
                debug!("Scheduling plan {} at {}", plan.id, next);
                queue.push(ScheduledTask { next, timing, plan });
            }
        }
        drop(queue);
        self.kick.notify_waiters();
        info!("✅ Action plans loaded into scheduler");
        Ok(())
    }

    /// Reload is the same queue rebuild; safe to race with `stop`.
    pub async fn reload(&self) -> EngineResult<()> {
        self.load_action_plans().await
    }

    pub fn stop(&self) {
        self.stopped.store(true, AtomicOrdering::SeqCst);
        self.kick.notify_waiters();
    }

    /// The scheduler loop. Runs until `stop`; fires every due tick exactly
    /// once, including ticks missed while the loop was busy. Executions
    /// drain on their own task so a slow action set delays, never skips,
    /// the ticks behind it.
    pub async fn run(self: Arc<Self>) {
        info!("⏲️  Scheduler started");
        if let Some(mut rx) = self.exec_rx.lock().await.take() {
            let scheduler = self.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        plan = rx.recv() => match plan {
                            Some(plan) => scheduler.execute_plan(&plan).await,
                            None => break,
                        },
                        _ = scheduler.kick.notified() => {
                            if scheduler.stopped.load(AtomicOrdering::SeqCst) {
                                break;
                            }
                        }
                    }
                }
            });
        }
        loop {
            if self.stopped.load(AtomicOrdering::SeqCst) {
                break;
            }
            let next = {
                let queue = self.queue.lock().await;
                queue.peek().map(|task| task.next)
            };
            match next {
                None => {
                    // nothing scheduled; wait for a reload
                    self.kick.notified().await;
                }
                Some(at) => {
                    let now = Utc::now();
                    if at > now {
                        let wait = (at - now)
                            .to_std()
                            .unwrap_or_else(|_| std::time::Duration::from_millis(10));
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = self.kick.notified() => continue,
                        }
                    }
                    self.fire_due().await;
                }
            }
        }
        info!("Scheduler stopped");
    }

    /// Pop and queue every due task, requeueing each at its next fire
    /// time. Each overdue tick is queued exactly once.
    async fn fire_due(&self) {
        loop {
            let task = {
                let mut queue = self.queue.lock().await;
                match queue.peek() {
                    Some(task) if task.next <= Utc::now() => queue.pop(),
                    _ => None,
                }
            };
            let Some(mut task) = task else {
                break;
            };

            let log_only = self.plan_is_log_only(&task.plan).await.unwrap_or(false);
            match self.enqueue_execution(task.plan.clone(), log_only).await {
                Ok(()) => {}
                Err(e @ EngineError::SchedulerOverloaded) => {
                    warn!(
                        "{}: shedding log-only plan {} tick at {}",
                        e, task.plan.id, task.next
                    );
                }
                Err(e) => {
                    warn!("Could not queue plan {}: {}", task.plan.id, e);
                }
            }

            if let Some(next) = task.timing.next_fire_after(task.next) {
                task.next = next;
                let mut queue = self.queue.lock().await;
                queue.push(task);
            }
        }
    }

    /// Hand a due plan to the executor. Log-only sets are dropped with
    /// `scheduler-overloaded` when the queue is full; mutating sets wait
    /// for a slot.
    async fn enqueue_execution(&self, plan: ActionPlan, log_only: bool) -> EngineResult<()> {
        if log_only {
            return self.exec_tx.try_send(plan).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => EngineError::SchedulerOverloaded,
                mpsc::error::TrySendError::Closed(_) => {
                    EngineError::Internal("scheduler executor stopped".to_string())
                }
            });
        }
        self.exec_tx
            .send(plan)
            .await
            .map_err(|_| EngineError::Internal("scheduler executor stopped".to_string()))
    }

    async fn plan_is_log_only(&self, plan: &ActionPlan) -> EngineResult<bool> {
        Ok(self
            .accounting
            .get_actions(&plan.actions_id)
            .await?
            .map(|actions| {
                !actions.is_empty() && actions.iter().all(|a| a.action_type == LOG)
            })
            .unwrap_or(false))
    }

    async fn execute_plan(&self, plan: &ActionPlan) {
        let actions = match self.accounting.get_actions(&plan.actions_id).await {
            Ok(Some(actions)) => actions,
            Ok(None) => {
                warn!(
                    "Action plan {} references unknown action set {}",
                    plan.id, plan.actions_id
                );
                return;
            }
            Err(e) => {
                warn!("Could not load actions for plan {}: {}", plan.id, e);
                return;
            }
        };
        for account_id in &plan.account_ids {
            if let Err(e) = self
                .engine
                .apply_actions_to_account(account_id, &actions)
                .await
            {
                warn!(
                    "Plan {} failed on account {}: {}",
                    plan.id, account_id, e
                );
            }
        }
    }
}
