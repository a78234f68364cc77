// src/accounts/mod.rs
//! The account and balance engine.
//!
//! Every operation on an account happens under that account's async lock,
//! held across rate, debit and trigger firing. Debits run against a clone
//! of the account and commit whole, so a failed debit leaves no partial
//! mutation behind. Multi-account operations take their locks in ascending
//! account-id order.

mod actions;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::models::{
    Account, Action, AttrExecuteAction, Balance, CallCost, CallDescriptor, DestinationMatch,
    MinuteInfo, TimeSpan, MONETARY, VOICE,
};
use crate::rating::{price_span, round_amount, Rater};
use crate::storage::{AccountingStorage, RatingStorage};

const MAX_TRIGGER_DEPTH: usize = 5;

/// Per-account async locks, created on first use.
struct AccountLocks {
    inner: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

impl AccountLocks {
    fn new() -> Self {
        AccountLocks {
            inner: StdMutex::new(HashMap::new()),
        }
    }

    fn handle(&self, id: &str) -> Arc<TokioMutex<()>> {
        let mut inner = self.inner.lock().expect("lock registry poisoned");
        inner
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone()
    }

    async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
        self.handle(id).lock_owned().await
    }

    /// Deadlock-free multi-lock: ids are sorted and deduplicated before the
    /// guards are taken one by one.
    async fn acquire_many(&self, ids: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<String> = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for id in &sorted {
            guards.push(self.acquire(id).await);
        }
        guards
    }
}

/// One balance change, kept for trigger evaluation after commit.
#[derive(Debug, Clone)]
pub(crate) struct Mutation {
    pub chain_key: String,
    /// Post-mutation snapshot of the touched balance.
    pub balance: Balance,
    pub post_value: Decimal,
    pub delta: Decimal,
}

pub(crate) struct DebitOutcome {
    pub covered_seconds: f64,
    pub mutations: Vec<Mutation>,
}

pub struct AccountEngine {
    accounting: Arc<dyn AccountingStorage>,
    rating: Arc<dyn RatingStorage>,
    rater: Arc<Rater>,
    locks: AccountLocks,
    http: reqwest::Client,
}

impl AccountEngine {
    pub fn new(
        accounting: Arc<dyn AccountingStorage>,
        rating: Arc<dyn RatingStorage>,
        rater: Arc<Rater>,
    ) -> Self {
        AccountEngine {
            accounting,
            rating,
            rater,
            locks: AccountLocks::new(),
            http: reqwest::Client::new(),
        }
    }

    pub fn rater(&self) -> &Arc<Rater> {
        &self.rater
    }

    /// Rate and debit atomically: the whole call cost is paid from the
    /// account's balance chains or the operation fails without effect.
    pub async fn debit(&self, cd: &CallDescriptor) -> EngineResult<CallCost> {
        cd.validate().map_err(EngineError::InvalidInput)?;
        let key = cd.account_key();
        let _guard = self.locks.acquire(&key).await;

        let account = self
            .accounting
            .get_account(&key)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("account {}", key)))?;
        if account.disabled {
            return Err(EngineError::InvalidInput(format!(
                "account {} is disabled",
                key
            )));
        }

        let mut cc = self.rater.get_cost(cd).await?;
        let mut work = account.clone();
        let outcome = self.apply_call_cost(&mut work, &mut cc, true).await?;
        cc.recompute_cost();

        self.accounting.set_account(&work).await?;
        self.process_triggers(&mut work, outcome.mutations).await?;

        debug!(
            "💰 Debited {} for {}: cost {}",
            key, cc.destination, cc.cost
        );
        Ok(cc)
    }

    /// Largest number of seconds of the requested window the account can
    /// pay for, simulated on a clone. `-1` marks unmetered accounts.
    pub async fn max_session_time(&self, cd: &CallDescriptor) -> EngineResult<f64> {
        cd.validate().map_err(EngineError::InvalidInput)?;
        let key = cd.account_key();
        let _guard = self.locks.acquire(&key).await;

        let account = self
            .accounting
            .get_account(&key)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("account {}", key)))?;
        if account.allow_negative {
            return Ok(-1.0);
        }
        if account.disabled {
            return Ok(0.0);
        }

        let requested = cd.seconds_amount();
        let mut probe = cd.clone();
        probe.time_end = probe.time_start + Duration::seconds(requested as i64);

        let mut cc = self.rater.get_cost(&probe).await?;
        let mut work = account.clone();
        let outcome = self.apply_call_cost(&mut work, &mut cc, false).await?;
        Ok(outcome.covered_seconds.min(requested))
    }

    /// Proportional tail refund: spans are walked last to first, fully
    /// refunded spans are dropped, the crossing span gives back the
    /// time-proportional share of its cost and voice seconds and ends now.
    pub async fn refund(
        &self,
        cc: &mut CallCost,
        refund_seconds: f64,
        now: DateTime<Utc>,
    ) -> EngineResult<(Decimal, f64)> {
        if refund_seconds <= 0.0 {
            return Ok((Decimal::ZERO, 0.0));
        }
        let key = cc.account_key();
        let _guard = self.locks.acquire(&key).await;

        let mut account = self
            .accounting
            .get_account(&key)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("account {}", key)))?;

        let mut refund = refund_seconds;
        let mut cost_back = Decimal::ZERO;
        let mut seconds_back = 0.0f64;
        while refund > 0.0 {
            let Some(ts) = cc.timespans.last_mut() else {
                break;
            };
            let dur = ts.seconds();
            if dur <= 0.0 {
                cc.timespans.pop();
                continue;
            }
            if refund < dur {
                let share = Decimal::from_f64(refund / dur).unwrap_or_default();
                let tmp_cost = ts.cost * share;
                ts.cost -= tmp_cost;
                cost_back += tmp_cost;
                if let Some(mi) = ts.minute_info.as_mut() {
                    let q = mi.quantity * (refund / dur);
                    mi.quantity -= q;
                    seconds_back += q;
                }
                ts.time_end = now;
                break;
            } else {
                cost_back += ts.cost;
                if let Some(mi) = &ts.minute_info {
                    seconds_back += mi.quantity;
                }
                refund -= dur;
                cc.timespans.pop();
            }
        }

        let mut mutations = Vec::new();
        if seconds_back > 0.0 {
            let matches = self.rater.match_destinations(&cc.destination).await?;
            self.credit_units(&mut account, cc, &matches, seconds_back, &mut mutations);
        }
        if cost_back > Decimal::ZERO {
            let direction = cc.direction.clone();
            let balance = account.default_monetary_mut(&direction);
            balance.value += cost_back;
            mutations.push(Mutation {
                chain_key: format!("{}{}", MONETARY, direction),
                balance: balance.clone(),
                post_value: balance.value,
                delta: cost_back,
            });
        }
        cc.recompute_cost();

        self.accounting.set_account(&account).await?;
        self.process_triggers(&mut account, mutations).await?;

        debug!(
            "Refunded {} money and {} seconds to {}",
            cost_back, seconds_back, key
        );
        Ok((cost_back, seconds_back))
    }

    /// Execute a stored action set against an account (RPC surface and the
    /// scheduler both land here).
    pub async fn execute_actions(&self, attr: &AttrExecuteAction) -> EngineResult<()> {
        let actions = self
            .accounting
            .get_actions(&attr.actions_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("actions {}", attr.actions_id)))?;
        self.apply_actions_to_account(&attr.account_key(), &actions)
            .await
    }

    pub async fn apply_actions_to_account(
        &self,
        account_id: &str,
        actions: &[Action],
    ) -> EngineResult<()> {
        let lock_ids = self.lock_set_for(account_id, actions).await?;
        let _guards = self.locks.acquire_many(&lock_ids).await;

        let mut account = self
            .accounting
            .get_account(account_id)
            .await?
            .unwrap_or_else(|| Account::new(account_id));

        let result = self.run_actions_locked(&mut account, actions).await;
        // successful steps before a failure stay committed
        let mutations = match result {
            Ok(mutations) => mutations,
            Err(e) => {
                self.accounting.set_account(&account).await?;
                return Err(e);
            }
        };
        self.accounting.set_account(&account).await?;
        self.process_triggers(&mut account, mutations).await?;
        Ok(())
    }

    /// Accounts to lock for an action set: the target plus, for shared
    /// group actions, every member, in ascending id order.
    async fn lock_set_for(
        &self,
        account_id: &str,
        actions: &[Action],
    ) -> EngineResult<Vec<String>> {
        let mut ids = vec![account_id.to_string()];
        for action in actions {
            if action.balance.shared_group.is_empty() {
                continue;
            }
            if let Some(group) = self
                .accounting
                .get_shared_group(&action.balance.shared_group)
                .await?
            {
                for member in &group.members {
                    ids.push(sibling_account_id(account_id, member));
                }
            }
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Evaluate triggers for the given mutations and fire their action
    /// sets, bounded in depth so trigger actions cannot loop forever.
    async fn process_triggers(
        &self,
        account: &mut Account,
        mutations: Vec<Mutation>,
    ) -> EngineResult<()> {
        let mut pending = mutations;
        let mut depth = 0;
        while !pending.is_empty() && depth < MAX_TRIGGER_DEPTH {
            let fired = evaluate_triggers(account, &pending);
            pending = Vec::new();
            for actions_id in fired {
                let actions = match self.accounting.get_actions(&actions_id).await {
                    Ok(Some(actions)) => actions,
                    Ok(None) => {
                        warn!("Trigger references unknown action set {}", actions_id);
                        continue;
                    }
                    Err(e) => {
                        warn!("Trigger action lookup failed for {}: {}", actions_id, e);
                        continue;
                    }
                };
                match self.run_actions_locked(account, &actions).await {
                    Ok(mut more) => pending.append(&mut more),
                    Err(e) => {
                        // trigger failures never abort the debit that caused them
                        warn!("Trigger action set {} failed: {}", actions_id, e);
                    }
                }
            }
            depth += 1;
        }
        self.accounting.set_account(account).await?;
        Ok(())
    }

    /// Pay a rated call cost from the account's chains. In strict mode the
    /// whole cost must be payable; otherwise consumption stops at
    /// exhaustion and the covered duration is reported.
    async fn apply_call_cost(
        &self,
        account: &mut Account,
        cc: &mut CallCost,
        strict: bool,
    ) -> EngineResult<DebitOutcome> {
        let matches = self.rater.match_destinations(&cc.destination).await?;
        let mut mutations = Vec::new();
        let mut covered = 0.0f64;

        if cc.connect_fee > Decimal::ZERO {
            let remaining = pay_monetary(
                account,
                &cc.direction,
                &cc.category,
                cc.connect_fee,
                &matches,
                strict,
                &mut mutations,
            );
            if remaining > Decimal::ZERO {
                if strict {
                    return Err(EngineError::InsufficientCredit {
                        required: cc.connect_fee.to_string(),
                        available: (cc.connect_fee - remaining).to_string(),
                    });
                }
                return Ok(DebitOutcome {
                    covered_seconds: 0.0,
                    mutations,
                });
            }
        }

        let mut i = 0;
        while i < cc.timespans.len() {
            let span = cc.timespans[i].clone();
            let parts = if cc.tor == VOICE {
                self.pay_span_with_units(account, cc, span, &matches, &mut mutations)
                    .await?
            } else {
                vec![span]
            };
            let parts_len = parts.len();
            cc.timespans.splice(i..=i, parts);

            for j in i..i + parts_len {
                let part = cc.timespans[j].clone();
                let cost = part.cost;
                if cost > Decimal::ZERO {
                    let remaining = pay_monetary(
                        account,
                        &cc.direction,
                        &cc.category,
                        cost,
                        &matches,
                        strict,
                        &mut mutations,
                    );
                    if remaining > Decimal::ZERO {
                        if strict {
                            return Err(EngineError::InsufficientCredit {
                                required: cost.to_string(),
                                available: (cost - remaining).to_string(),
                            });
                        }
                        // partially affordable span: count the payable
                        // prefix of whole increments
                        let paid = cost - remaining;
                        if let Some(interval) = &part.rate_interval {
                            let inc_cost = interval.increment_cost();
                            if inc_cost > Decimal::ZERO {
                                let incs = (paid / inc_cost)
                                    .floor()
                                    .to_i64()
                                    .unwrap_or(0);
                                covered += ((incs * interval.increment()) as f64)
                                    .min(part.seconds());
                            }
                        }
                        return Ok(DebitOutcome {
                            covered_seconds: covered,
                            mutations,
                        });
                    }
                }
                covered += part.seconds();
            }
            i += parts_len;
        }

        Ok(DebitOutcome {
            covered_seconds: covered,
            mutations,
        })
    }

    /// Try to cover a voice span from the unit chain. Returns the span's
    /// replacement parts: covered parts carry MinuteInfo and the re-rated
    /// cost to charge against the monetary chain; an uncovered tail keeps
    /// its monetary price.
    async fn pay_span_with_units(
        &self,
        account: &mut Account,
        cc: &CallCost,
        span: TimeSpan,
        matches: &[DestinationMatch],
        mutations: &mut Vec<Mutation>,
    ) -> EngineResult<Vec<TimeSpan>> {
        let chain_key = format!("{}{}", cc.tor, cc.direction);
        if account.chain(&chain_key).map_or(true, |c| c.is_empty()) {
            return Ok(vec![span]);
        }
        let now = Utc::now();

        // refresh precisions before sorting the chain
        {
            let chain = account.chain_mut(&chain_key);
            for b in chain.iter_mut() {
                b.precision = b.matches_destination(matches).unwrap_or(0);
            }
            chain.sort();
        }

        let mut parts: Vec<TimeSpan> = Vec::new();
        let mut rest = span;
        let chain_len = account.chain(&chain_key).map_or(0, |c| c.len());
        let mut fully_covered = false;

        for idx in 0..chain_len {
            let rest_secs = rest.duration().num_seconds();
            if rest_secs <= 0 {
                fully_covered = true;
                break;
            }
            let candidate = {
                let chain = account.chain(&chain_key).expect("chain exists");
                chain.0[idx].clone()
            };
            if candidate.value <= Decimal::ZERO || candidate.is_expired(&now) {
                continue;
            }
            if !candidate.category.is_empty() && candidate.category != cc.category {
                continue;
            }
            if candidate.matches_destination(matches).is_none() {
                continue;
            }
            if !self
                .balance_timing_admits(&candidate, &rest.time_start)
                .await?
            {
                continue;
            }

            // pricing for time covered by this balance: free for plain
            // included seconds, re-rated under the balance's own subject
            // for package balances
            let (increment, inc_cost, rounding_decimals, rounding_method) =
                if candidate.rating_subject.is_empty() {
                    let interval = rest.rate_interval.clone();
                    let increment = interval.as_ref().map_or(1, |iv| iv.increment());
                    let decimals = interval.as_ref().map_or(4, |iv| iv.rounding_decimals);
                    let method = interval
                        .as_ref()
                        .map_or(Default::default(), |iv| iv.rounding_method);
                    (increment, Decimal::ZERO, decimals, method)
                } else {
                    let mut sub_cd = CallDescriptor {
                        tor: VOICE.to_string(),
                        direction: cc.direction.clone(),
                        tenant: cc.tenant.clone(),
                        category: cc.category.clone(),
                        subject: candidate.rating_subject.clone(),
                        account: cc.account.clone(),
                        destination: cc.destination.clone(),
                        time_start: rest.time_start,
                        time_end: rest.time_end,
                        ..Default::default()
                    };
                    // package re-rating never re-applies a connect fee
                    sub_cd.loop_index = 1;
                    let rcc = match self.rater.get_cost(&sub_cd).await {
                        Ok(rcc) => rcc,
                        Err(e) => {
                            warn!(
                                "Could not re-rate balance {} under subject {}: {}",
                                candidate.id, candidate.rating_subject, e
                            );
                            continue;
                        }
                    };
                    let Some(interval) = rcc
                        .timespans
                        .first()
                        .and_then(|ts| ts.rate_interval.clone())
                    else {
                        continue;
                    };
                    (
                        interval.increment(),
                        interval.increment_cost(),
                        interval.rounding_decimals,
                        interval.rounding_method,
                    )
                };

            let needed_incs = (rest_secs + increment - 1) / increment;
            let needed_secs = Decimal::from(needed_incs * increment);
            let afford_incs = if candidate.value >= needed_secs {
                needed_incs
            } else {
                (candidate.value / Decimal::from(increment))
                    .floor()
                    .to_i64()
                    .unwrap_or(0)
            };
            if afford_incs <= 0 {
                continue;
            }

            let consumed_secs = afford_incs * increment;
            let covered_secs = consumed_secs.min(rest_secs);
            let part_cost = round_amount(
                inc_cost * Decimal::from(afford_incs),
                rounding_decimals,
                rounding_method,
            );
            let per_second_price = if increment > 0 {
                inc_cost / Decimal::from(increment)
            } else {
                Decimal::ZERO
            };

            {
                let chain = account.chain_mut(&chain_key);
                let b = &mut chain.0[idx];
                b.value -= Decimal::from(consumed_secs);
                mutations.push(Mutation {
                    chain_key: chain_key.clone(),
                    balance: b.clone(),
                    post_value: b.value,
                    delta: -Decimal::from(consumed_secs),
                });
            }

            let minute_info = MinuteInfo {
                destination_id: matched_destination_id(&candidate, matches),
                quantity: consumed_secs as f64,
                price: per_second_price,
            };
            if covered_secs >= rest_secs {
                rest.cost = part_cost;
                rest.minute_info = Some(minute_info);
                parts.push(rest.clone());
                fully_covered = true;
                break;
            } else {
                let split_t = rest.time_start + Duration::seconds(covered_secs);
                let tail = rest.split_at(split_t);
                rest.cost = part_cost;
                rest.minute_info = Some(minute_info);
                parts.push(rest);
                rest = tail;
            }
        }

        if !fully_covered {
            // the tail stays payable in money at its own rate
            let rest_secs = rest.duration().num_seconds();
            if rest_secs > 0 {
                if let Some(interval) = &rest.rate_interval {
                    rest.cost = price_span(interval, rest_secs);
                }
                parts.push(rest.clone());
            }
        }
        if parts.is_empty() {
            return Ok(vec![rest]);
        }
        Ok(parts)
    }

    /// Balances restricted by timing ids only pay inside their windows.
    async fn balance_timing_admits(
        &self,
        balance: &Balance,
        at: &DateTime<Utc>,
    ) -> EngineResult<bool> {
        if balance.timing_ids.is_empty() {
            return Ok(true);
        }
        for id in balance.timing_ids.split(';') {
            if id.is_empty() {
                continue;
            }
            if let Some(timing) = self.rating.get_timing(id).await? {
                if timing.contains(at) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Return refunded seconds to the first unit balance admitting the
    /// call's destination, creating a default bucket when none matches.
    fn credit_units(
        &self,
        account: &mut Account,
        cc: &CallCost,
        matches: &[DestinationMatch],
        seconds: f64,
        mutations: &mut Vec<Mutation>,
    ) {
        let chain_key = format!("{}{}", cc.tor, cc.direction);
        let amount = Decimal::from_f64(seconds).unwrap_or_default();
        let chain = account.chain_mut(&chain_key);
        if let Some(b) = chain
            .iter_mut()
            .find(|b| b.matches_destination(matches).is_some())
        {
            b.value += amount;
            mutations.push(Mutation {
                chain_key,
                balance: b.clone(),
                post_value: b.value,
                delta: amount,
            });
            return;
        }
        let balance = Balance {
            value: amount,
            ..Default::default()
        };
        chain.push(balance.clone());
        mutations.push(Mutation {
            chain_key,
            balance,
            post_value: amount,
            delta: amount,
        });
    }
}

/// Consume `amount` from the matching monetary balances, best first.
/// Returns the unpaid remainder; in strict mode the remainder may be booked
/// onto the default balance (going negative) when the account allows it or
/// carries no explicit monetary balance.
fn pay_monetary(
    account: &mut Account,
    direction: &str,
    category: &str,
    amount: Decimal,
    matches: &[DestinationMatch],
    strict: bool,
    mutations: &mut Vec<Mutation>,
) -> Decimal {
    if amount <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let chain_key = format!("{}{}", MONETARY, direction);
    let now = Utc::now();
    let mut remaining = amount;

    if let Some(chain) = account.balance_map.get_mut(&chain_key) {
        for b in chain.iter_mut() {
            b.precision = b.matches_destination(matches).unwrap_or(0);
        }
        chain.sort();
        for b in chain.iter_mut() {
            if remaining <= Decimal::ZERO {
                break;
            }
            if b.value <= Decimal::ZERO || b.is_expired(&now) {
                continue;
            }
            if b.matches_destination(matches).is_none() {
                continue;
            }
            if !b.category.is_empty() && b.category != category {
                continue;
            }
            let take = b.value.min(remaining);
            b.value -= take;
            remaining -= take;
            mutations.push(Mutation {
                chain_key: chain_key.clone(),
                balance: b.clone(),
                post_value: b.value,
                delta: -take,
            });
        }
    }

    if remaining > Decimal::ZERO && strict {
        let may_go_negative = account.allow_negative
            || account
                .balance_map
                .get(&chain_key)
                .map_or(true, |c| c.has_only_defaults());
        if may_go_negative {
            let balance = account.default_monetary_mut(direction);
            balance.value -= remaining;
            mutations.push(Mutation {
                chain_key,
                balance: balance.clone(),
                post_value: balance.value,
                delta: -remaining,
            });
            remaining = Decimal::ZERO;
        }
    }
    remaining
}

/// The destination id recorded in MinuteInfo: the balance's best matching
/// id, or the overall longest match for wildcard balances.
fn matched_destination_id(balance: &Balance, matches: &[DestinationMatch]) -> String {
    if !balance.destination_ids.is_empty() && balance.destination_ids != crate::models::ANY {
        let ids: Vec<&str> = balance.destination_ids.split(';').collect();
        if let Some(m) = matches
            .iter()
            .filter(|m| ids.contains(&m.destination_id.as_str()))
            .max_by_key(|m| m.precision())
        {
            return m.destination_id.clone();
        }
    }
    matches
        .first()
        .map(|m| m.destination_id.clone())
        .unwrap_or_default()
}

/// Update counters and executed flags for every trigger observing the
/// mutations; returns the action set ids to fire, in evaluation order.
fn evaluate_triggers(account: &mut Account, mutations: &[Mutation]) -> Vec<String> {
    let mut fired = Vec::new();
    for m in mutations {
        for trg in account.action_triggers.iter_mut() {
            if !trg.balance_type.is_empty() && !m.chain_key.starts_with(&trg.balance_type) {
                continue;
            }
            if !trg.direction.is_empty() && !m.chain_key.ends_with(&trg.direction) {
                continue;
            }
            if !m.balance.match_action_trigger(trg) {
                continue;
            }
            if m.delta < Decimal::ZERO {
                trg.usage_counter += -m.delta;
            }
            if trg.is_crossed(m.post_value) {
                if !trg.executed {
                    trg.executed = true;
                    trg.times_fired += 1;
                    fired.push(trg.actions_id.clone());
                }
            } else if trg.recurrent {
                // re-arm once the value moves back across the threshold
                trg.executed = false;
            }
        }
    }
    fired
}

/// Member accounts of a shared group live under the same direction and
/// tenant as the target account.
fn sibling_account_id(target_id: &str, member: &str) -> String {
    let mut parts: Vec<&str> = target_id.split(':').collect();
    if parts.len() == 3 {
        parts[2] = member;
        parts.join(":")
    } else {
        member.to_string()
    }
}
