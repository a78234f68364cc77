// src/models/cdr.rs
//! Call Detail Records and the filter grammar used by the CDR queries.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Cost value marking a CDR whose rating attempt failed.
pub fn error_cost() -> Decimal {
    Decimal::NEGATIVE_ONE
}

/// Canonical string form of a setup time, the exact shape hashed into the
/// cgr-id: `YYYY-MM-DD HH:MM:SS +0000 UTC`.
pub fn canonical_time(t: &DateTime<Utc>) -> String {
    format!("{} +0000 UTC", t.format("%Y-%m-%d %H:%M:%S"))
}

/// Deterministic CDR id: SHA1 over the access id concatenated with the
/// canonical setup time.
pub fn cgr_id(acc_id: &str, setup_time: &DateTime<Utc>) -> String {
    let mut hasher = Sha1::new();
    hasher.update(acc_id.as_bytes());
    hasher.update(canonical_time(setup_time).as_bytes());
    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(40), |mut acc, byte| {
            acc.push_str(&format!("{:02x}", byte));
            acc
        })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StoredCdr {
    pub cgr_id: String,
    pub order_id: i64,
    #[serde(rename = "TOR")]
    pub tor: String,
    pub acc_id: String,
    pub cdr_host: String,
    pub cdr_source: String,
    pub req_type: String,
    pub direction: String,
    pub tenant: String,
    pub category: String,
    pub account: String,
    pub subject: String,
    pub destination: String,
    pub setup_time: DateTime<Utc>,
    pub answer_time: DateTime<Utc>,
    /// Billable usage in seconds.
    pub usage: f64,
    pub extra_fields: HashMap<String, String>,
    pub mediation_run_id: String,
    pub rated_account: String,
    pub rated_subject: String,
    pub cost: Decimal,
    pub rated: bool,
    /// Rating error detail when the cost is the error marker.
    pub extra_info: String,
}

impl Default for StoredCdr {
    fn default() -> Self {
        StoredCdr {
            cgr_id: String::new(),
            order_id: 0,
            tor: String::new(),
            acc_id: String::new(),
            cdr_host: String::new(),
            cdr_source: String::new(),
            req_type: String::new(),
            direction: String::new(),
            tenant: String::new(),
            category: String::new(),
            account: String::new(),
            subject: String::new(),
            destination: String::new(),
            setup_time: DateTime::<Utc>::default(),
            answer_time: DateTime::<Utc>::default(),
            usage: 0.0,
            extra_fields: HashMap::new(),
            mediation_run_id: String::new(),
            rated_account: String::new(),
            rated_subject: String::new(),
            cost: Decimal::ZERO,
            rated: false,
            extra_info: String::new(),
        }
    }
}

impl StoredCdr {
    pub fn compute_cgr_id(&self) -> String {
        cgr_id(&self.acc_id, &self.setup_time)
    }

    pub fn is_errored(&self) -> bool {
        self.cost < Decimal::ZERO
    }
}

/// CDR query filter. The cost pair carries special markers:
/// `(-1, 0)` selects only errored records, `(0, -1)` skips them,
/// a lone `-1` min selects rated records, a lone `-1` max non-rated ones;
/// any other pair is a plain `[min, max)` range.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CdrFilter {
    pub cgr_ids: Vec<String>,
    pub accounts: Vec<String>,
    pub subjects: Vec<String>,
    pub destination_prefixes: Vec<String>,
    pub min_cost: Option<f64>,
    pub max_cost: Option<f64>,
    pub answer_time_start: Option<DateTime<Utc>>,
    pub answer_time_end: Option<DateTime<Utc>>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl CdrFilter {
    fn cost_matches(&self, cdr: &StoredCdr) -> bool {
        match (self.min_cost, self.max_cost) {
            (None, None) => true,
            (Some(min), Some(max)) if min == -1.0 && max == 0.0 => cdr.is_errored(),
            (Some(min), Some(max)) if min == 0.0 && max == -1.0 => !cdr.is_errored(),
            (Some(min), None) if min == -1.0 => cdr.rated,
            (None, Some(max)) if max == -1.0 => !cdr.rated,
            (min, max) => {
                let cost = cdr.cost.to_f64().unwrap_or(0.0);
                min.map_or(true, |m| cost >= m) && max.map_or(true, |m| cost < m)
            }
        }
    }

    /// Whether a CDR passes every filter field (paging excluded).
    pub fn matches(&self, cdr: &StoredCdr) -> bool {
        (self.cgr_ids.is_empty() || self.cgr_ids.contains(&cdr.cgr_id))
            && (self.accounts.is_empty() || self.accounts.contains(&cdr.account))
            && (self.subjects.is_empty() || self.subjects.contains(&cdr.subject))
            && (self.destination_prefixes.is_empty()
                || self
                    .destination_prefixes
                    .iter()
                    .any(|p| cdr.destination.starts_with(p.as_str())))
            && self
                .answer_time_start
                .map_or(true, |t| cdr.answer_time >= t)
            && self.answer_time_end.map_or(true, |t| cdr.answer_time < t)
            && self.cost_matches(cdr)
    }
}
