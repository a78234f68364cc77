// src/rating/mod.rs
//! The rating engine: prices a call descriptor into a CallCost whose time
//! spans cover the requested window exactly, with no gaps or overlaps.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::models::tariff::next_timing_boundary;
use crate::models::{
    CallCost, CallDescriptor, DestinationMatch, DestinationRateBinding, MaxCostStrategy, Rate,
    RateInterval, RatingProfile, RoundingMethod, TimeSpan, Timing, ANY,
};
use crate::storage::RatingStorage;

pub struct Rater {
    storage: Arc<dyn RatingStorage>,
}

/// One plan binding resolved against the catalogue, applicable to the
/// dialed destination.
struct ResolvedBinding {
    timing: Timing,
    weight: f64,
    precision: usize,
    binding: DestinationRateBinding,
    rate: Rate,
}

pub fn round_amount(value: Decimal, decimals: u32, method: RoundingMethod) -> Decimal {
    let strategy = match method {
        RoundingMethod::Up => RoundingStrategy::ToPositiveInfinity,
        RoundingMethod::Down => RoundingStrategy::ToNegativeInfinity,
        RoundingMethod::Middle => RoundingStrategy::MidpointAwayFromZero,
    };
    value.round_dp_with_strategy(decimals, strategy)
}

/// Cost of a span: full increments at the unit price, rounded with the
/// destination rate's policy.
pub fn price_span(interval: &RateInterval, duration_secs: i64) -> Decimal {
    if duration_secs <= 0 {
        return Decimal::ZERO;
    }
    let increment = interval.increment();
    let increments = (duration_secs + increment - 1) / increment;
    round_amount(
        Decimal::from(increments) * interval.increment_cost(),
        interval.rounding_decimals,
        interval.rounding_method,
    )
}

/// Increment-aligned seconds needed to cover a duration.
pub fn aligned_seconds(interval: &RateInterval, duration_secs: i64) -> i64 {
    let increment = interval.increment();
    ((duration_secs + increment - 1) / increment) * increment
}

impl Rater {
    pub fn new(storage: Arc<dyn RatingStorage>) -> Self {
        Rater { storage }
    }

    pub async fn match_destinations(
        &self,
        number: &str,
    ) -> EngineResult<Vec<DestinationMatch>> {
        self.storage.match_destinations(number).await
    }

    /// Rating profile for the descriptor's subject, falling back to the
    /// `*any` profile when no subject-specific one exists.
    async fn resolve_profile(&self, cd: &CallDescriptor) -> EngineResult<RatingProfile> {
        let key = cd.rating_key(&cd.subject);
        if let Some(profile) = self.storage.get_rating_profile(&key).await? {
            return Ok(profile);
        }
        if cd.subject != ANY {
            let fallback = cd.rating_key(ANY);
            if let Some(profile) = self.storage.get_rating_profile(&fallback).await? {
                return Ok(profile);
            }
        }
        Err(EngineError::NotFound(format!("rating profile {}", key)))
    }

    async fn resolve_bindings(
        &self,
        plan_id: &str,
        matches: &[DestinationMatch],
    ) -> EngineResult<Vec<ResolvedBinding>> {
        let plan = self
            .storage
            .get_rating_plan(plan_id)
            .await?
            .ok_or_else(|| EngineError::RatingPlanMissing(plan_id.to_string()))?;

        let mut resolved = Vec::new();
        for pb in &plan.bindings {
            let timing = self
                .storage
                .get_timing(&pb.timing_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("timing {}", pb.timing_id)))?;
            let dr = self
                .storage
                .get_destination_rate(&pb.destination_rate_id)
                .await?
                .ok_or_else(|| {
                    EngineError::NotFound(format!(
                        "destination rate {}",
                        pb.destination_rate_id
                    ))
                })?;
            for binding in &dr.bindings {
                let precision = matches
                    .iter()
                    .filter(|m| m.destination_id == binding.destination_id)
                    .map(|m| m.precision())
                    .max();
                let Some(precision) = precision else {
                    continue;
                };
                let rate = self
                    .storage
                    .get_rate(&binding.rate_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::NotFound(format!("rate {}", binding.rate_id))
                    })?;
                resolved.push(ResolvedBinding {
                    timing: timing.clone(),
                    weight: pb.weight,
                    precision,
                    binding: binding.clone(),
                    rate,
                });
            }
        }
        Ok(resolved)
    }

    /// The applicable binding at `t`: greatest weight, ties broken by the
    /// longest matched prefix, then by the latest start time.
    fn choose_binding<'a>(
        resolved: &'a [ResolvedBinding],
        t: &DateTime<Utc>,
    ) -> Option<&'a ResolvedBinding> {
        resolved
            .iter()
            .filter(|b| b.timing.contains(t))
            .max_by(|a, b| {
                a.weight
                    .partial_cmp(&b.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.precision.cmp(&b.precision))
                    .then(a.timing.start_time.cmp(&b.timing.start_time))
            })
    }

    /// Price `cd` into a CallCost. The connect fee applies only to the
    /// first slice of a call (loop index zero).
    pub async fn get_cost(&self, cd: &CallDescriptor) -> EngineResult<CallCost> {
        cd.validate().map_err(EngineError::InvalidInput)?;

        let matches = self.storage.match_destinations(&cd.destination).await?;
        if matches.is_empty() {
            return Err(EngineError::DestinationNotMatched(cd.destination.clone()));
        }

        let profile = self.resolve_profile(cd).await?;
        let activation = profile.active_plan_at(&cd.time_start).ok_or_else(|| {
            EngineError::RatingPlanMissing(format!(
                "no active rating plan for {} at {}",
                profile.key(),
                cd.time_start
            ))
        })?;

        let resolved = self
            .resolve_bindings(&activation.rating_plan_id, &matches)
            .await?;
        if resolved.is_empty() {
            return Err(EngineError::DestinationNotMatched(cd.destination.clone()));
        }
        let timings: Vec<&Timing> = resolved.iter().map(|b| &b.timing).collect();

        let mut cc = CallCost {
            tor: cd.tor().to_string(),
            direction: cd.direction.clone(),
            tenant: cd.tenant.clone(),
            category: cd.category.clone(),
            subject: cd.subject.clone(),
            account: cd.account.clone(),
            destination: cd.destination.clone(),
            ..Default::default()
        };

        let mut t = cd.time_start;
        let mut first_binding_connect_fee = None;
        while t < cd.time_end {
            let chosen = Self::choose_binding(&resolved, &t).ok_or_else(|| {
                EngineError::RatingPlanMissing(format!(
                    "no rate interval applicable at {}",
                    t
                ))
            })?;
            if first_binding_connect_fee.is_none() {
                first_binding_connect_fee = Some(chosen.rate.connect_fee);
            }

            let elapsed = (t - cd.time_start).num_seconds();
            let slot = chosen
                .rate
                .slot_for(elapsed)
                .or_else(|| chosen.rate.slots.first())
                .ok_or_else(|| {
                    EngineError::RatingPlanMissing(format!(
                        "rate {} has no price slots",
                        chosen.rate.id
                    ))
                })?;

            let mut end = cd.time_end;
            if let Some(next_gis) = chosen.rate.next_group_boundary(elapsed) {
                let boundary = cd.time_start + chrono::Duration::seconds(next_gis);
                if boundary > t && boundary < end {
                    end = boundary;
                }
            }
            let timing_boundary = next_timing_boundary(&timings, &t);
            if timing_boundary > t && timing_boundary < end {
                end = timing_boundary;
            }

            let interval = RateInterval {
                timing_id: chosen.timing.id.clone(),
                weight: chosen.weight,
                rounding_method: chosen.binding.rounding_method,
                rounding_decimals: chosen.binding.rounding_decimals,
                max_cost: chosen.binding.max_cost,
                max_cost_strategy: chosen.binding.max_cost_strategy,
                price: slot.price,
                rate_unit: slot.rate_unit,
                rate_increment: slot.rate_increment,
                group_interval_start: slot.group_interval_start,
            };
            let duration = (end - t).num_seconds();
            cc.timespans.push(TimeSpan {
                time_start: t,
                time_end: end,
                cost: price_span(&interval, duration),
                rate_interval: Some(interval),
                minute_info: None,
            });
            t = end;
        }

        if cd.loop_index == 0 {
            cc.connect_fee = first_binding_connect_fee.unwrap_or_default();
        }
        self.apply_max_cost(&mut cc);
        cc.recompute_cost();
        debug!(
            "Rated {} -> {}: cost {} over {} span(s)",
            cc.subject,
            cc.destination,
            cc.cost,
            cc.timespans.len()
        );
        Ok(cc)
    }

    /// Cap the accumulated cost at each span's max-cost, zero-pricing the
    /// overflow (`*free`) or additionally flagging the call for disconnect.
    fn apply_max_cost(&self, cc: &mut CallCost) {
        let mut running = cc.connect_fee;
        for span in cc.timespans.iter_mut() {
            let Some(interval) = &span.rate_interval else {
                running += span.cost;
                continue;
            };
            if interval.max_cost > Decimal::ZERO && running + span.cost > interval.max_cost {
                let allowed = (interval.max_cost - running).max(Decimal::ZERO);
                span.cost = allowed;
                if interval.max_cost_strategy == Some(MaxCostStrategy::Disconnect) {
                    cc.max_cost_disconnect = true;
                }
            }
            running += span.cost;
        }
    }
}
