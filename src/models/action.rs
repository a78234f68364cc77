// src/models/action.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::balance::Balance;

// Action types
pub const TOPUP: &str = "*topup";
pub const TOPUP_RESET: &str = "*topup_reset";
pub const DEBIT: &str = "*debit";
pub const RESET_COUNTERS: &str = "*reset_counters";
pub const ENABLE_ACCOUNT: &str = "*enable_account";
pub const DISABLE_ACCOUNT: &str = "*disable_account";
pub const CALL_URL: &str = "*call_url";
pub const CALL_URL_ASYNC: &str = "*call_url_async";
pub const LOG: &str = "*log";

// Trigger threshold types
pub const TRIGGER_MIN_COUNTER: &str = "*min_counter";
pub const TRIGGER_MAX_COUNTER: &str = "*max_counter";
pub const TRIGGER_MIN_BALANCE: &str = "*min_balance";
pub const TRIGGER_MAX_BALANCE: &str = "*max_balance";

/// One step of an action set. The embedded `balance` carries the filter
/// selecting the target balances and doubles as the template when a topup
/// has to create one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub action_type: String,
    pub extra_parameters: String,
    pub balance_type: String,
    pub direction: String,
    pub units: Decimal,
    pub expiration: String,
    pub balance: Balance,
    pub weight: f64,
}

/// Threshold predicate attached to an account. Fires its action set once
/// per crossing; non-recurrent triggers stay executed until counters reset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionTrigger {
    pub id: String,
    pub threshold_type: String,
    pub threshold_value: Decimal,
    pub recurrent: bool,
    pub balance_id: String,
    pub balance_type: String,
    pub direction: String,
    pub balance_destination_ids: String,
    pub balance_weight: f64,
    pub balance_rating_subject: String,
    pub balance_shared_group: String,
    pub actions_id: String,
    pub weight: f64,
    pub executed: bool,
    /// Units debited from matching balances, for the counter thresholds.
    pub usage_counter: Decimal,
    pub times_fired: u64,
}

impl ActionTrigger {
    /// Whether the predicate holds for the given post-mutation value.
    pub fn is_crossed(&self, balance_value: Decimal) -> bool {
        match self.threshold_type.as_str() {
            TRIGGER_MIN_BALANCE => balance_value <= self.threshold_value,
            TRIGGER_MAX_BALANCE => balance_value >= self.threshold_value,
            TRIGGER_MIN_COUNTER => self.usage_counter <= self.threshold_value,
            TRIGGER_MAX_COUNTER => self.usage_counter >= self.threshold_value,
            _ => false,
        }
    }
}

/// Scheduled application of an action set to a list of accounts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionPlan {
    pub id: String,
    pub actions_id: String,
    pub timing_id: String,
    pub weight: f64,
    pub account_ids: Vec<String>,
}

/// Accounts pooling balances under one group id. Members are kept sorted so
/// multi-account operations always lock in the same order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedGroup {
    pub id: String,
    pub members: Vec<String>,
    pub strategy: String,
    pub rating_subject: String,
}

/// RPC attributes for `ApierV1.ExecuteAction`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AttrExecuteAction {
    pub direction: String,
    pub tenant: String,
    pub account: String,
    pub actions_id: String,
}

impl AttrExecuteAction {
    pub fn account_key(&self) -> String {
        format!("{}:{}:{}", self.direction, self.tenant, self.account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trigger_min_balance_crossing() {
        let at = ActionTrigger {
            threshold_type: TRIGGER_MIN_BALANCE.to_string(),
            threshold_value: dec!(5),
            ..Default::default()
        };
        assert!(at.is_crossed(dec!(4)));
        assert!(at.is_crossed(dec!(5)));
        assert!(!at.is_crossed(dec!(6)));
    }

    #[test]
    fn test_trigger_max_counter_crossing() {
        let at = ActionTrigger {
            threshold_type: TRIGGER_MAX_COUNTER.to_string(),
            threshold_value: dec!(100),
            usage_counter: dec!(101),
            ..Default::default()
        };
        assert!(at.is_crossed(Decimal::ZERO));
    }

    #[test]
    fn test_execute_action_attrs_key() {
        let attr = AttrExecuteAction {
            direction: "*out".to_string(),
            tenant: "cgrates.org".to_string(),
            account: "12346".to_string(),
            actions_id: "TOPUP10_AC1".to_string(),
        };
        assert_eq!(attr.account_key(), "*out:cgrates.org:12346");
    }
}
