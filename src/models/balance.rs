// src/models/balance.rs
//! Balance buckets and the per-account balance chains.
//!
//! A chain holds the balances of one type of record and direction, kept in
//! decreasing (weight, precision) order so the highest priority bucket pays
//! first. Matching rules:
//!   * `equal` compares (weight, rating subject, sorted destination ids)
//!   * `match_filter` is asymmetric: non-empty filter fields must equal the
//!     candidate's, empty fields are wildcards, a non-empty filter id
//!     short-circuits to an id comparison
//!   * `match_action_trigger` is the conjunctive wildcard form used when
//!     deciding which triggers observe a mutation

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::action::ActionTrigger;
use super::tariff::DestinationMatch;
use super::ANY;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Balance {
    pub id: String,
    pub value: Decimal,
    pub expiration_date: Option<DateTime<Utc>>,
    pub weight: f64,
    /// Semicolon-joined destination ids; empty or `*any` admits everything.
    pub destination_ids: String,
    pub rating_subject: String,
    pub category: String,
    pub shared_group: String,
    pub timing_ids: String,
    /// Matched prefix length, set transiently during destination matching.
    #[serde(skip)]
    pub precision: usize,
}

impl Balance {
    pub fn sort_destination_ids(&self) -> String {
        if self.destination_ids.is_empty() || self.destination_ids == ANY {
            return self.destination_ids.clone();
        }
        let mut ids: Vec<&str> = self.destination_ids.split(';').collect();
        ids.sort_unstable();
        ids.join(";")
    }

    pub fn equal(&self, other: &Balance) -> bool {
        self.weight == other.weight
            && self.rating_subject == other.rating_subject
            && self.sort_destination_ids() == other.sort_destination_ids()
    }

    /// Asymmetric filter match: every non-empty field of `filter` must equal
    /// this balance's field. A non-empty filter id decides on its own.
    pub fn match_filter(&self, filter: &Balance) -> bool {
        if !filter.id.is_empty() {
            return self.id == filter.id;
        }
        (filter.destination_ids.is_empty()
            || self.sort_destination_ids() == filter.sort_destination_ids())
            && (filter.rating_subject.is_empty()
                || self.rating_subject == filter.rating_subject)
            && (filter.category.is_empty() || self.category == filter.category)
            && (filter.shared_group.is_empty() || self.shared_group == filter.shared_group)
    }

    pub fn match_action_trigger(&self, at: &ActionTrigger) -> bool {
        (at.balance_id.is_empty() || self.id == at.balance_id)
            && (at.balance_destination_ids.is_empty()
                || self.destination_ids == at.balance_destination_ids)
            && (at.balance_weight == 0.0 || self.weight == at.balance_weight)
            && (at.balance_rating_subject.is_empty()
                || self.rating_subject == at.balance_rating_subject)
            && (at.balance_shared_group.is_empty()
                || self.shared_group == at.balance_shared_group)
    }

    pub fn is_default(&self) -> bool {
        self.weight == 0.0
            && self.destination_ids.is_empty()
            && self.rating_subject.is_empty()
            && self.category.is_empty()
    }

    pub fn is_expired(&self, now: &DateTime<Utc>) -> bool {
        matches!(self.expiration_date, Some(exp) if exp <= *now)
    }

    /// Whether this balance admits a dialed number, given its destination
    /// matches. Returns the matched precision, 0 for wildcard balances.
    pub fn matches_destination(&self, matches: &[DestinationMatch]) -> Option<usize> {
        if self.destination_ids.is_empty() || self.destination_ids == ANY {
            return Some(0);
        }
        let ids: Vec<&str> = self.destination_ids.split(';').collect();
        matches
            .iter()
            .filter(|m| ids.contains(&m.destination_id.as_str()))
            .map(|m| m.precision())
            .max()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BalanceChain(pub Vec<Balance>);

impl BalanceChain {
    /// Stable sort by weight descending, then precision descending.
    pub fn sort(&mut self) {
        self.0.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.precision.cmp(&a.precision))
        });
    }

    pub fn total(&self) -> Decimal {
        self.0.iter().map(|b| b.value).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Balance> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Balance> {
        self.0.iter_mut()
    }

    pub fn push(&mut self, balance: Balance) {
        self.0.push(balance);
        self.sort();
    }

    /// True when every balance in the chain is a default bucket.
    pub fn has_only_defaults(&self) -> bool {
        self.0.iter().all(|b| b.is_default())
    }
}
