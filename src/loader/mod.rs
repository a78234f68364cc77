// src/loader/mod.rs
//! CSV tariff loader. One entity per file, comma separated, no header.
//! Sources can be in-memory strings (tests) or a data directory with the
//! conventional file names.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::DateTime;
use csv::{ReaderBuilder, StringRecord, Trim};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::models::{
    Account, Action, ActionPlan, ActionTrigger, Balance, Destination, DestinationRate,
    DestinationRateBinding, MaxCostStrategy, PlanBinding, Rate, RateSlot, RatingPlan,
    RatingPlanActivation, RatingProfile, RoundingMethod, SharedGroup, Timing, ANY,
    UNLIMITED,
};
use crate::storage::{AccountingStorage, RatingStorage};

/// The fourteen tariff files, held as raw CSV text.
#[derive(Debug, Clone, Default)]
pub struct CsvSource {
    pub timings: String,
    pub destinations: String,
    pub rates: String,
    pub destination_rates: String,
    pub rating_plans: String,
    pub rating_profiles: String,
    pub shared_groups: String,
    pub lcrs: String,
    pub actions: String,
    pub action_plans: String,
    pub action_triggers: String,
    pub account_actions: String,
    pub derived_chargers: String,
    pub cdr_stats: String,
}

impl CsvSource {
    #[allow(clippy::too_many_arguments)]
    pub fn from_strings(
        destinations: &str,
        timings: &str,
        rates: &str,
        destination_rates: &str,
        rating_plans: &str,
        rating_profiles: &str,
        shared_groups: &str,
        lcrs: &str,
        actions: &str,
        action_plans: &str,
        action_triggers: &str,
        account_actions: &str,
        derived_chargers: &str,
        cdr_stats: &str,
    ) -> Self {
        CsvSource {
            timings: timings.to_string(),
            destinations: destinations.to_string(),
            rates: rates.to_string(),
            destination_rates: destination_rates.to_string(),
            rating_plans: rating_plans.to_string(),
            rating_profiles: rating_profiles.to_string(),
            shared_groups: shared_groups.to_string(),
            lcrs: lcrs.to_string(),
            actions: actions.to_string(),
            action_plans: action_plans.to_string(),
            action_triggers: action_triggers.to_string(),
            account_actions: account_actions.to_string(),
            derived_chargers: derived_chargers.to_string(),
            cdr_stats: cdr_stats.to_string(),
        }
    }

    pub fn from_dir(dir: &Path) -> EngineResult<Self> {
        let read = |name: &str| -> EngineResult<String> {
            let path = dir.join(name);
            if !path.exists() {
                return Ok(String::new());
            }
            std::fs::read_to_string(&path)
                .map_err(|e| EngineError::InvalidInput(format!("{}: {}", path.display(), e)))
        };
        Ok(CsvSource {
            timings: read("Timings.csv")?,
            destinations: read("Destinations.csv")?,
            rates: read("Rates.csv")?,
            destination_rates: read("DestinationRates.csv")?,
            rating_plans: read("RatingPlans.csv")?,
            rating_profiles: read("RatingProfiles.csv")?,
            shared_groups: read("SharedGroups.csv")?,
            lcrs: read("LCRs.csv")?,
            actions: read("Actions.csv")?,
            action_plans: read("ActionPlans.csv")?,
            action_triggers: read("ActionTriggers.csv")?,
            account_actions: read("AccountActions.csv")?,
            derived_chargers: read("DerivedChargers.csv")?,
            cdr_stats: read("CdrStats.csv")?,
        })
    }
}

pub struct TpReader {
    rating: Arc<dyn RatingStorage>,
    accounting: Arc<dyn AccountingStorage>,
    source: CsvSource,
}

fn records(input: &str) -> EngineResult<Vec<StringRecord>> {
    if input.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(input.as_bytes());
    let mut out = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| EngineError::InvalidInput(format!("csv parse: {}", e)))?;
        if record.iter().all(|f| f.is_empty()) {
            continue;
        }
        out.push(record);
    }
    Ok(out)
}

fn field<'a>(record: &'a StringRecord, idx: usize) -> &'a str {
    record.get(idx).unwrap_or("")
}

fn parse_decimal(s: &str, what: &str) -> EngineResult<Decimal> {
    if s.is_empty() {
        return Ok(Decimal::ZERO);
    }
    s.parse()
        .map_err(|_| EngineError::InvalidInput(format!("bad {}: {}", what, s)))
}

fn parse_f64(s: &str, what: &str) -> EngineResult<f64> {
    if s.is_empty() {
        return Ok(0.0);
    }
    s.parse()
        .map_err(|_| EngineError::InvalidInput(format!("bad {}: {}", what, s)))
}

/// Durations in the tariff files come as `20s`, `1m`, `1h` or a bare
/// number of seconds.
fn parse_duration_secs(s: &str, what: &str) -> EngineResult<i64> {
    if s.is_empty() {
        return Ok(0);
    }
    let (digits, multiplier) = match s.as_bytes().last() {
        Some(b's') => (&s[..s.len() - 1], 1),
        Some(b'm') => (&s[..s.len() - 1], 60),
        Some(b'h') => (&s[..s.len() - 1], 3600),
        _ => (s, 1),
    };
    digits
        .parse::<i64>()
        .map(|n| n * multiplier)
        .map_err(|_| EngineError::InvalidInput(format!("bad {}: {}", what, s)))
}

fn parse_int_list<T: std::str::FromStr>(s: &str) -> Vec<T> {
    if s.is_empty() || s == ANY {
        return Vec::new();
    }
    s.split(';').filter_map(|p| p.parse().ok()).collect()
}

fn parse_expiration(s: &str) -> EngineResult<Option<DateTime<chrono::Utc>>> {
    if s.is_empty() || s == UNLIMITED {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|t| Some(t.with_timezone(&chrono::Utc)))
        .map_err(|_| EngineError::InvalidInput(format!("bad expiration time: {}", s)))
}

impl TpReader {
    pub fn new(
        rating: Arc<dyn RatingStorage>,
        accounting: Arc<dyn AccountingStorage>,
        source: CsvSource,
    ) -> Self {
        TpReader {
            rating,
            accounting,
            source,
        }
    }

    pub async fn load_timings(&self) -> EngineResult<()> {
        for record in records(&self.source.timings)? {
            let timing = Timing {
                id: field(&record, 0).to_string(),
                years: parse_int_list(field(&record, 1)),
                months: parse_int_list(field(&record, 2)),
                month_days: parse_int_list(field(&record, 3)),
                week_days: parse_int_list(field(&record, 4)),
                start_time: field(&record, 5).to_string(),
            };
            self.rating.set_timing(&timing).await?;
        }
        Ok(())
    }

    pub async fn load_destinations(&self) -> EngineResult<()> {
        let mut dests: HashMap<String, Destination> = HashMap::new();
        for record in records(&self.source.destinations)? {
            let tag = field(&record, 0).to_string();
            let prefix = field(&record, 1).to_string();
            let dest = dests.entry(tag.clone()).or_insert_with(|| Destination {
                id: tag,
                prefixes: Vec::new(),
            });
            if !prefix.is_empty() && !dest.prefixes.contains(&prefix) {
                dest.prefixes.push(prefix);
            }
        }
        for dest in dests.values() {
            self.rating.set_destination(dest).await?;
        }
        Ok(())
    }

    pub async fn load_rates(&self) -> EngineResult<()> {
        let mut rates: HashMap<String, Rate> = HashMap::new();
        for record in records(&self.source.rates)? {
            let tag = field(&record, 0).to_string();
            let connect_fee = parse_decimal(field(&record, 1), "connect fee")?;
            let slot = RateSlot {
                price: parse_decimal(field(&record, 2), "rate price")?,
                rate_unit: parse_duration_secs(field(&record, 3), "rate unit")?,
                rate_increment: parse_duration_secs(field(&record, 4), "rate increment")?,
                group_interval_start: parse_duration_secs(
                    field(&record, 5),
                    "group interval start",
                )?,
            };
            let rate = rates.entry(tag.clone()).or_insert_with(|| Rate {
                id: tag,
                connect_fee,
                slots: Vec::new(),
            });
            rate.slots.push(slot);
        }
        for rate in rates.values_mut() {
            rate.slots.sort_by_key(|s| s.group_interval_start);
            self.rating.set_rate(rate).await?;
        }
        Ok(())
    }

    pub async fn load_destination_rates(&self) -> EngineResult<()> {
        let mut drs: HashMap<String, DestinationRate> = HashMap::new();
        for record in records(&self.source.destination_rates)? {
            let tag = field(&record, 0).to_string();
            let binding = DestinationRateBinding {
                destination_id: field(&record, 1).to_string(),
                rate_id: field(&record, 2).to_string(),
                rounding_method: RoundingMethod::from_tag(field(&record, 3)),
                rounding_decimals: field(&record, 4).parse().unwrap_or(4),
                max_cost: parse_decimal(field(&record, 5), "max cost")?,
                max_cost_strategy: MaxCostStrategy::from_tag(field(&record, 6)),
            };
            drs.entry(tag.clone())
                .or_insert_with(|| DestinationRate {
                    id: tag,
                    bindings: Vec::new(),
                })
                .bindings
                .push(binding);
        }
        for dr in drs.values() {
            self.rating.set_destination_rate(dr).await?;
        }
        Ok(())
    }

    pub async fn load_rating_plans(&self) -> EngineResult<()> {
        let mut plans: HashMap<String, RatingPlan> = HashMap::new();
        for record in records(&self.source.rating_plans)? {
            let tag = field(&record, 0).to_string();
            let binding = PlanBinding {
                destination_rate_id: field(&record, 1).to_string(),
                timing_id: field(&record, 2).to_string(),
                weight: parse_f64(field(&record, 3), "plan weight")?,
            };
            plans
                .entry(tag.clone())
                .or_insert_with(|| RatingPlan {
                    id: tag,
                    bindings: Vec::new(),
                })
                .bindings
                .push(binding);
        }
        for plan in plans.values() {
            self.rating.set_rating_plan(plan).await?;
        }
        Ok(())
    }

    pub async fn load_rating_profiles(&self) -> EngineResult<()> {
        let mut profiles: HashMap<String, RatingProfile> = HashMap::new();
        for record in records(&self.source.rating_profiles)? {
            let activation_time = field(&record, 4);
            let activation = RatingPlanActivation {
                activation_time: DateTime::parse_from_rfc3339(activation_time)
                    .map_err(|_| {
                        EngineError::InvalidInput(format!(
                            "bad activation time: {}",
                            activation_time
                        ))
                    })?
                    .with_timezone(&chrono::Utc),
                rating_plan_id: field(&record, 5).to_string(),
                fallback_subjects: field(&record, 6).to_string(),
            };
            let profile = profiles
                .entry(format!(
                    "{}:{}:{}:{}",
                    field(&record, 0),
                    field(&record, 1),
                    field(&record, 2),
                    field(&record, 3)
                ))
                .or_insert_with(|| RatingProfile {
                    direction: field(&record, 0).to_string(),
                    tenant: field(&record, 1).to_string(),
                    category: field(&record, 2).to_string(),
                    subject: field(&record, 3).to_string(),
                    activations: Vec::new(),
                });
            profile.activations.push(activation);
        }
        for profile in profiles.values() {
            self.rating.set_rating_profile(profile).await?;
        }
        Ok(())
    }

    pub async fn load_shared_groups(&self) -> EngineResult<()> {
        let mut groups: HashMap<String, SharedGroup> = HashMap::new();
        for record in records(&self.source.shared_groups)? {
            let tag = field(&record, 0).to_string();
            let group = groups.entry(tag.clone()).or_insert_with(|| SharedGroup {
                id: tag,
                members: Vec::new(),
                strategy: field(&record, 2).to_string(),
                rating_subject: field(&record, 3).to_string(),
            });
            let member = field(&record, 1).to_string();
            if !member.is_empty() && !group.members.contains(&member) {
                group.members.push(member);
            }
        }
        for group in groups.values_mut() {
            group.members.sort_unstable();
            self.accounting.set_shared_group(group).await?;
        }
        Ok(())
    }

    pub async fn load_lcrs(&self) -> EngineResult<()> {
        let count = records(&self.source.lcrs)?.len();
        if count > 0 {
            debug!("Skipping {} LCR rows (not part of the rating core)", count);
        }
        Ok(())
    }

    pub async fn load_actions(&self) -> EngineResult<()> {
        let mut sets: HashMap<String, Vec<Action>> = HashMap::new();
        for record in records(&self.source.actions)? {
            let tag = field(&record, 0).to_string();
            let action = Action {
                id: tag.clone(),
                action_type: field(&record, 1).to_string(),
                extra_parameters: field(&record, 2).to_string(),
                balance_type: field(&record, 4).to_string(),
                direction: field(&record, 5).to_string(),
                units: parse_decimal(field(&record, 12), "action units")?,
                expiration: field(&record, 10).to_string(),
                balance: Balance {
                    id: field(&record, 3).to_string(),
                    weight: parse_f64(field(&record, 13), "balance weight")?,
                    destination_ids: field(&record, 7).to_string(),
                    rating_subject: field(&record, 8).to_string(),
                    category: field(&record, 6).to_string(),
                    shared_group: field(&record, 9).to_string(),
                    timing_ids: field(&record, 11).to_string(),
                    expiration_date: parse_expiration(field(&record, 10))?,
                    ..Default::default()
                },
                weight: parse_f64(field(&record, 14), "action weight")?,
            };
            sets.entry(tag).or_default().push(action);
        }
        for (tag, mut actions) in sets {
            actions.sort_by(|a, b| {
                b.weight
                    .partial_cmp(&a.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            self.accounting.set_actions(&tag, &actions).await?;
        }
        Ok(())
    }

    pub async fn load_action_plans(&self) -> EngineResult<()> {
        let mut plans: HashMap<String, Vec<ActionPlan>> = HashMap::new();
        for record in records(&self.source.action_plans)? {
            let tag = field(&record, 0).to_string();
            plans.entry(tag.clone()).or_default().push(ActionPlan {
                id: tag,
                actions_id: field(&record, 1).to_string(),
                timing_id: field(&record, 2).to_string(),
                weight: parse_f64(field(&record, 3), "plan weight")?,
                account_ids: Vec::new(),
            });
        }
        for (tag, batch) in plans {
            self.accounting.set_action_plans(&tag, &batch).await?;
        }
        Ok(())
    }

    pub async fn load_action_triggers(&self) -> EngineResult<()> {
        let mut sets: HashMap<String, Vec<ActionTrigger>> = HashMap::new();
        for record in records(&self.source.action_triggers)? {
            let tag = field(&record, 0).to_string();
            let trigger = ActionTrigger {
                id: tag.clone(),
                threshold_type: field(&record, 1).to_string(),
                threshold_value: parse_decimal(field(&record, 2), "threshold value")?,
                recurrent: field(&record, 3) == "true",
                balance_id: field(&record, 4).to_string(),
                balance_type: field(&record, 5).to_string(),
                direction: field(&record, 6).to_string(),
                balance_destination_ids: field(&record, 7).to_string(),
                balance_weight: parse_f64(field(&record, 8), "balance weight")?,
                balance_rating_subject: field(&record, 9).to_string(),
                balance_shared_group: field(&record, 10).to_string(),
                actions_id: field(&record, 11).to_string(),
                weight: parse_f64(field(&record, 12), "trigger weight")?,
                ..Default::default()
            };
            sets.entry(tag).or_default().push(trigger);
        }
        for (tag, triggers) in sets {
            self.accounting.set_action_triggers(&tag, &triggers).await?;
        }
        Ok(())
    }

    pub async fn load_account_actions(&self) -> EngineResult<()> {
        for record in records(&self.source.account_actions)? {
            let tenant = field(&record, 0);
            let account = field(&record, 1);
            let direction = field(&record, 2);
            let plan_tag = field(&record, 3);
            let triggers_tag = field(&record, 4);
            let account_id = format!("{}:{}:{}", direction, tenant, account);

            let mut acc = self
                .accounting
                .get_account(&account_id)
                .await?
                .unwrap_or_else(|| Account::new(&account_id));

            if !triggers_tag.is_empty() {
                let triggers = self
                    .accounting
                    .get_action_triggers(triggers_tag)
                    .await?
                    .ok_or_else(|| {
                        EngineError::NotFound(format!("action triggers {}", triggers_tag))
                    })?;
                for trigger in triggers {
                    if !acc.action_triggers.iter().any(|t| t.id == trigger.id) {
                        acc.action_triggers.push(trigger);
                    }
                }
            }
            self.accounting.set_account(&acc).await?;

            if !plan_tag.is_empty() {
                let mut plans = self
                    .accounting
                    .get_action_plans(plan_tag)
                    .await?
                    .ok_or_else(|| {
                        EngineError::NotFound(format!("action plan {}", plan_tag))
                    })?;
                for plan in plans.iter_mut() {
                    if !plan.account_ids.contains(&account_id) {
                        plan.account_ids.push(account_id.clone());
                    }
                }
                self.accounting.set_action_plans(plan_tag, &plans).await?;
            }
        }
        Ok(())
    }

    pub async fn load_derived_chargers(&self) -> EngineResult<()> {
        let count = records(&self.source.derived_chargers)?.len();
        if count > 0 {
            debug!(
                "Skipping {} derived charger rows (not part of the rating core)",
                count
            );
        }
        Ok(())
    }

    pub async fn load_cdr_stats(&self) -> EngineResult<()> {
        let count = records(&self.source.cdr_stats)?.len();
        if count > 0 {
            debug!("Skipping {} CDR stat rows (not part of the rating core)", count);
        }
        Ok(())
    }

    /// Load every file in dependency order, then publish the caches.
    pub async fn load_all(&self) -> EngineResult<()> {
        self.load_destinations().await?;
        self.load_timings().await?;
        self.load_rates().await?;
        self.load_destination_rates().await?;
        self.load_rating_plans().await?;
        self.load_rating_profiles().await?;
        self.load_shared_groups().await?;
        self.load_lcrs().await?;
        self.load_actions().await?;
        self.load_action_plans().await?;
        self.load_action_triggers().await?;
        self.load_account_actions().await?;
        self.load_derived_chargers().await?;
        self.load_cdr_stats().await?;
        self.rating.cache_rating().await?;
        self.accounting.cache_accounting().await?;
        info!("✅ Tariff data loaded");
        Ok(())
    }
}
