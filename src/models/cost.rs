// src/models/cost.rs
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::tariff::RateInterval;

/// Seconds drawn from a voice balance to cover (part of) a time span.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MinuteInfo {
    pub destination_id: String,
    /// Seconds consumed, increment-aligned at debit time.
    pub quantity: f64,
    /// Per-second price charged for the covered time.
    pub price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TimeSpan {
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub cost: Decimal,
    pub rate_interval: Option<RateInterval>,
    pub minute_info: Option<MinuteInfo>,
}

impl TimeSpan {
    pub fn duration(&self) -> Duration {
        self.time_end - self.time_start
    }

    pub fn seconds(&self) -> f64 {
        self.duration().num_seconds() as f64
    }

    /// Split at `at`, keeping the head in place and returning the tail.
    /// The caller re-prices both halves.
    pub fn split_at(&mut self, at: DateTime<Utc>) -> TimeSpan {
        let tail = TimeSpan {
            time_start: at,
            time_end: self.time_end,
            cost: Decimal::ZERO,
            rate_interval: self.rate_interval.clone(),
            minute_info: None,
        };
        self.time_end = at;
        tail
    }
}

/// Priced result of rating a call descriptor: an ordered, gapless cover of
/// the requested window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CallCost {
    #[serde(rename = "TOR")]
    pub tor: String,
    pub direction: String,
    pub tenant: String,
    pub category: String,
    pub subject: String,
    pub account: String,
    pub destination: String,
    pub cost: Decimal,
    pub connect_fee: Decimal,
    /// Set when a `*disconnect` max-cost cap was reached during rating.
    pub max_cost_disconnect: bool,
    pub timespans: Vec<TimeSpan>,
}

impl CallCost {
    pub fn total_duration(&self) -> Duration {
        self.timespans
            .iter()
            .fold(Duration::zero(), |acc, ts| acc + ts.duration())
    }

    /// Recompute the aggregate cost from the spans plus the connect fee.
    pub fn recompute_cost(&mut self) {
        self.cost = self.connect_fee
            + self
                .timespans
                .iter()
                .map(|ts| ts.cost)
                .sum::<Decimal>();
    }

    pub fn account_key(&self) -> String {
        format!("{}:{}:{}", self.direction, self.tenant, self.account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_split_and_recompute() {
        let start = Utc.with_ymd_and_hms(2014, 3, 4, 6, 0, 0).unwrap();
        let mut span = TimeSpan {
            time_start: start,
            time_end: start + Duration::seconds(20),
            cost: Decimal::new(20, 2),
            rate_interval: None,
            minute_info: None,
        };
        let tail = span.split_at(start + Duration::seconds(5));
        assert_eq!(span.seconds(), 5.0);
        assert_eq!(tail.seconds(), 15.0);

        let mut cc = CallCost {
            connect_fee: Decimal::new(1, 2),
            timespans: vec![span, tail],
            ..Default::default()
        };
        cc.timespans[0].cost = Decimal::new(5, 2);
        cc.timespans[1].cost = Decimal::new(15, 2);
        cc.recompute_cost();
        assert_eq!(cc.cost, Decimal::new(21, 2));
        assert_eq!(cc.total_duration(), Duration::seconds(20));
    }
}
