// src/models/tariff.rs
//! Tariff catalogue entities: timings, destinations, rates, destination
//! rates, rating plans and rating profiles. All of them are read-mostly and
//! served through the prefix cache once loaded.

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ASAP;

/// Time window definition. Empty date vectors are wildcards (`*any`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timing {
    pub id: String,
    pub years: Vec<i32>,
    pub months: Vec<u32>,
    pub month_days: Vec<u32>,
    pub week_days: Vec<u32>,
    /// `HH:MM:SS` start of the active window, or `*asap`
    pub start_time: String,
}

impl Timing {
    pub fn is_asap(&self) -> bool {
        self.start_time == ASAP
    }

    fn start_naive(&self) -> NaiveTime {
        NaiveTime::parse_from_str(&self.start_time, "%H:%M:%S")
            .unwrap_or_else(|_| NaiveTime::from_hms_opt(0, 0, 0).unwrap())
    }

    pub fn matches_date(&self, t: &DateTime<Utc>) -> bool {
        // week day numbering: 0 = Sunday, matching the loader input
        let week_day = t.weekday().num_days_from_sunday();
        (self.years.is_empty() || self.years.contains(&t.year()))
            && (self.months.is_empty() || self.months.contains(&t.month()))
            && (self.month_days.is_empty() || self.month_days.contains(&t.day()))
            && (self.week_days.is_empty() || self.week_days.contains(&week_day))
    }

    /// A timing contains `t` when the date fields admit it and the time of
    /// day has passed the start time.
    pub fn contains(&self, t: &DateTime<Utc>) -> bool {
        if self.is_asap() {
            return true;
        }
        self.matches_date(t) && t.time() >= self.start_naive()
    }

    /// Next fire time strictly after `after`. `*asap` timings fire
    /// immediately and are handled by the scheduler as one-shots.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_asap() {
            return Some(after);
        }
        let start = self.start_naive();
        let mut day = after.date_naive();
        // bounded search: four years of days covers every date pattern
        for _ in 0..(366 * 4) {
            let candidate = Utc
                .from_utc_datetime(&day.and_time(start));
            if candidate > after && self.matches_date(&candidate) {
                return Some(candidate);
            }
            day = day.succ_opt()?;
        }
        None
    }
}

/// A set of numeric prefixes sharing one symbolic id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Destination {
    pub id: String,
    pub prefixes: Vec<String>,
}

/// One prefix hit for a dialed number. `precision` (the matched prefix
/// length) breaks ties between rating plan bindings.
#[derive(Debug, Clone)]
pub struct DestinationMatch {
    pub destination_id: String,
    pub prefix: String,
}

impl DestinationMatch {
    pub fn precision(&self) -> usize {
        self.prefix.len()
    }
}

/// One price slot of a rate; `group_interval_start` is the offset from the
/// beginning of the call where the slot becomes applicable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateSlot {
    pub group_interval_start: i64,
    pub price: Decimal,
    pub rate_unit: i64,
    pub rate_increment: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rate {
    pub id: String,
    pub connect_fee: Decimal,
    pub slots: Vec<RateSlot>,
}

impl Rate {
    /// The slot applicable at `elapsed` seconds into the call.
    pub fn slot_for(&self, elapsed: i64) -> Option<&RateSlot> {
        self.slots
            .iter()
            .filter(|s| s.group_interval_start <= elapsed)
            .max_by_key(|s| s.group_interval_start)
    }

    /// Offset of the next slot boundary after `elapsed`, if any.
    pub fn next_group_boundary(&self, elapsed: i64) -> Option<i64> {
        self.slots
            .iter()
            .map(|s| s.group_interval_start)
            .filter(|gis| *gis > elapsed)
            .min()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundingMethod {
    #[serde(rename = "*up")]
    Up,
    #[serde(rename = "*middle")]
    Middle,
    #[serde(rename = "*down")]
    Down,
}

impl RoundingMethod {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "*down" => RoundingMethod::Down,
            "*middle" => RoundingMethod::Middle,
            _ => RoundingMethod::Up,
        }
    }
}

impl Default for RoundingMethod {
    fn default() -> Self {
        RoundingMethod::Up
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaxCostStrategy {
    #[serde(rename = "*free")]
    Free,
    #[serde(rename = "*disconnect")]
    Disconnect,
}

impl MaxCostStrategy {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "*free" => Some(MaxCostStrategy::Free),
            "*disconnect" => Some(MaxCostStrategy::Disconnect),
            _ => None,
        }
    }
}

/// Binds one destination to one rate, with the rounding policy applied to
/// every span priced through it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationRateBinding {
    pub destination_id: String,
    pub rate_id: String,
    pub rounding_method: RoundingMethod,
    pub rounding_decimals: u32,
    pub max_cost: Decimal,
    pub max_cost_strategy: Option<MaxCostStrategy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestinationRate {
    pub id: String,
    pub bindings: Vec<DestinationRateBinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanBinding {
    pub timing_id: String,
    pub destination_rate_id: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatingPlan {
    pub id: String,
    pub bindings: Vec<PlanBinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingPlanActivation {
    pub activation_time: DateTime<Utc>,
    pub rating_plan_id: String,
    pub fallback_subjects: String,
}

/// Rating profile: which rating plan applies for a
/// (direction, tenant, category, subject) starting at each activation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatingProfile {
    pub direction: String,
    pub tenant: String,
    pub category: String,
    pub subject: String,
    pub activations: Vec<RatingPlanActivation>,
}

impl RatingProfile {
    pub fn key(&self) -> String {
        rating_profile_key(&self.direction, &self.tenant, &self.category, &self.subject)
    }

    /// The activation with the largest activation time not after `t`.
    pub fn active_plan_at(&self, t: &DateTime<Utc>) -> Option<&RatingPlanActivation> {
        self.activations
            .iter()
            .filter(|a| a.activation_time <= *t)
            .max_by_key(|a| a.activation_time)
    }
}

pub fn rating_profile_key(direction: &str, tenant: &str, category: &str, subject: &str) -> String {
    format!("{}:{}:{}:{}", direction, tenant, category, subject)
}

/// Pricing snapshot attached to a TimeSpan: everything needed to price or
/// re-price the span without another catalogue lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateInterval {
    pub timing_id: String,
    pub weight: f64,
    pub rounding_method: RoundingMethod,
    pub rounding_decimals: u32,
    pub max_cost: Decimal,
    pub max_cost_strategy: Option<MaxCostStrategy>,
    pub price: Decimal,
    pub rate_unit: i64,
    pub rate_increment: i64,
    pub group_interval_start: i64,
}

impl RateInterval {
    pub fn increment(&self) -> i64 {
        if self.rate_increment > 0 {
            self.rate_increment
        } else {
            1
        }
    }

    pub fn unit(&self) -> i64 {
        if self.rate_unit > 0 {
            self.rate_unit
        } else {
            1
        }
    }

    /// Cost of one billing increment.
    pub fn increment_cost(&self) -> Decimal {
        self.price * Decimal::from(self.increment()) / Decimal::from(self.unit())
    }
}

/// Earliest boundary after `t` where a different timing window may become
/// active: the next start time of any binding today, else next midnight.
pub fn next_timing_boundary(timings: &[&Timing], t: &DateTime<Utc>) -> DateTime<Utc> {
    let midnight = Utc
        .from_utc_datetime(
            &t.date_naive()
                .succ_opt()
                .expect("date overflow")
                .and_hms_opt(0, 0, 0)
                .expect("valid midnight"),
        );
    let mut boundary = midnight;
    for timing in timings {
        if timing.is_asap() {
            continue;
        }
        let start = Utc.from_utc_datetime(&t.date_naive().and_time(timing.start_naive()));
        if start > *t && start < boundary {
            boundary = start;
        }
    }
    boundary
}

pub fn duration_seconds(start: &DateTime<Utc>, end: &DateTime<Utc>) -> i64 {
    (*end - *start).num_seconds()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn always() -> Timing {
        Timing {
            id: "ALWAYS".to_string(),
            start_time: "00:00:00".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_timing_contains_always() {
        let t = always();
        assert!(t.contains(&Utc.with_ymd_and_hms(2014, 3, 4, 6, 0, 0).unwrap()));
    }

    #[test]
    fn test_timing_contains_start_time() {
        let mut t = always();
        t.start_time = "08:00:00".to_string();
        assert!(!t.contains(&Utc.with_ymd_and_hms(2014, 3, 4, 6, 0, 0).unwrap()));
        assert!(t.contains(&Utc.with_ymd_and_hms(2014, 3, 4, 9, 0, 0).unwrap()));
    }

    #[test]
    fn test_timing_next_fire_daily() {
        let t = always();
        let after = Utc.with_ymd_and_hms(2014, 3, 4, 6, 0, 0).unwrap();
        let next = t.next_fire_after(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2014, 3, 5, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_timing_next_fire_month_day() {
        let mut t = always();
        t.month_days = vec![15];
        t.start_time = "10:30:00".to_string();
        let after = Utc.with_ymd_and_hms(2014, 3, 16, 0, 0, 0).unwrap();
        let next = t.next_fire_after(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2014, 4, 15, 10, 30, 0).unwrap());
    }

    #[test]
    fn test_rate_slot_selection() {
        let rate = Rate {
            id: "RT_TIERED".to_string(),
            connect_fee: Decimal::ZERO,
            slots: vec![
                RateSlot {
                    group_interval_start: 0,
                    price: Decimal::new(2, 1),
                    rate_unit: 60,
                    rate_increment: 60,
                },
                RateSlot {
                    group_interval_start: 60,
                    price: Decimal::new(1, 1),
                    rate_unit: 60,
                    rate_increment: 1,
                },
            ],
        };
        assert_eq!(rate.slot_for(30).unwrap().group_interval_start, 0);
        assert_eq!(rate.slot_for(60).unwrap().group_interval_start, 60);
        assert_eq!(rate.next_group_boundary(0), Some(60));
        assert_eq!(rate.next_group_boundary(60), None);
    }

    #[test]
    fn test_profile_activation_selection() {
        let profile = RatingProfile {
            direction: "*out".to_string(),
            tenant: "cgrates.org".to_string(),
            category: "call".to_string(),
            subject: "*any".to_string(),
            activations: vec![
                RatingPlanActivation {
                    activation_time: Utc.with_ymd_and_hms(2013, 1, 6, 0, 0, 0).unwrap(),
                    rating_plan_id: "RP_OLD".to_string(),
                    fallback_subjects: String::new(),
                },
                RatingPlanActivation {
                    activation_time: Utc.with_ymd_and_hms(2014, 1, 6, 0, 0, 0).unwrap(),
                    rating_plan_id: "RP_NEW".to_string(),
                    fallback_subjects: String::new(),
                },
            ],
        };
        let at = Utc.with_ymd_and_hms(2013, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(profile.active_plan_at(&at).unwrap().rating_plan_id, "RP_OLD");
        let at = Utc.with_ymd_and_hms(2014, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(profile.active_plan_at(&at).unwrap().rating_plan_id, "RP_NEW");
        let at = Utc.with_ymd_and_hms(2012, 6, 1, 0, 0, 0).unwrap();
        assert!(profile.active_plan_at(&at).is_none());
    }
}
