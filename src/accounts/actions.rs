// src/accounts/actions.rs
//! Action set execution: the dispatch table behind `ExecuteAction`,
//! action plans and trigger firings. The caller holds the account lock.

use rust_decimal::Decimal;
use tracing::{error, info, warn};

use super::{AccountEngine, Mutation};
use crate::error::{EngineError, EngineResult};
use crate::models::action::{
    CALL_URL, CALL_URL_ASYNC, DEBIT, DISABLE_ACCOUNT, ENABLE_ACCOUNT, LOG, RESET_COUNTERS,
    TOPUP, TOPUP_RESET,
};
use crate::models::{Account, Action};

impl AccountEngine {
    /// Run an action set on a locked account, in stored (weight) order.
    /// The first failing step stops the set.
    pub(crate) async fn run_actions_locked(
        &self,
        account: &mut Account,
        actions: &[Action],
    ) -> EngineResult<Vec<Mutation>> {
        let mut mutations = Vec::new();
        for action in actions {
            self.run_single_action(account, action, &mut mutations)
                .await
                .map_err(|e| {
                    error!(
                        "Action {} ({}) failed on {}: {}",
                        action.id, action.action_type, account.id, e
                    );
                    e
                })?;
        }
        Ok(mutations)
    }

    async fn run_single_action(
        &self,
        account: &mut Account,
        action: &Action,
        mutations: &mut Vec<Mutation>,
    ) -> EngineResult<()> {
        match action.action_type.as_str() {
            TOPUP_RESET => {
                apply_topup(account, action, true, mutations);
                Ok(())
            }
            TOPUP => {
                apply_topup(account, action, false, mutations);
                Ok(())
            }
            DEBIT => {
                apply_debit_units(account, action, mutations);
                Ok(())
            }
            RESET_COUNTERS => {
                reset_counters(account, action);
                Ok(())
            }
            ENABLE_ACCOUNT => {
                account.disabled = false;
                Ok(())
            }
            DISABLE_ACCOUNT => {
                account.disabled = true;
                Ok(())
            }
            CALL_URL => self.call_url(account, action).await,
            CALL_URL_ASYNC => {
                self.call_url_async(account, action);
                Ok(())
            }
            LOG => {
                let state = serde_json::to_string(account).unwrap_or_default();
                info!("Account state {}: {}", account.id, state);
                Ok(())
            }
            other => Err(EngineError::InvalidInput(format!(
                "unsupported action type {}",
                other
            ))),
        }
    }

    /// Synchronous HTTP GET of the action's URL, expanded with account
    /// fields; non-2xx responses are failures.
    async fn call_url(&self, account: &Account, action: &Action) -> EngineResult<()> {
        let url = expand_url(&action.extra_parameters, account);
        let response = self
            .http_client()
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::TriggerExecutionFailed(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(EngineError::TriggerExecutionFailed(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }

    /// Fire-and-forget variant; failures are logged only.
    fn call_url_async(&self, account: &Account, action: &Action) {
        let url = expand_url(&action.extra_parameters, account);
        let client = self.http_client().clone();
        tokio::spawn(async move {
            match client.get(&url).send().await {
                Ok(response) if !response.status().is_success() => {
                    warn!("Async url call {} returned {}", url, response.status());
                }
                Err(e) => warn!("Async url call {} failed: {}", url, e),
                _ => {}
            }
        });
    }

    pub(crate) fn http_client(&self) -> &reqwest::Client {
        &self.http
    }
}

fn chain_key_for(account: &Account, action: &Action) -> String {
    let direction = if action.direction.is_empty() {
        account.direction().to_string()
    } else {
        action.direction.clone()
    };
    format!("{}{}", action.balance_type, direction)
}

/// `*topup` adds units to every matching balance, `*topup_reset` sets them;
/// both create the balance from the action's template when nothing matches.
fn apply_topup(
    account: &mut Account,
    action: &Action,
    reset: bool,
    mutations: &mut Vec<Mutation>,
) {
    let chain_key = chain_key_for(account, action);
    let chain = account.chain_mut(&chain_key);
    let mut matched = false;
    for b in chain.iter_mut() {
        if !b.match_filter(&action.balance) {
            continue;
        }
        matched = true;
        let delta = if reset {
            let delta = action.units - b.value;
            b.value = action.units;
            delta
        } else {
            b.value += action.units;
            action.units
        };
        mutations.push(Mutation {
            chain_key: chain_key.clone(),
            balance: b.clone(),
            post_value: b.value,
            delta,
        });
    }
    if !matched {
        let mut balance = action.balance.clone();
        balance.value = action.units;
        chain.push(balance.clone());
        mutations.push(Mutation {
            chain_key,
            balance,
            post_value: action.units,
            delta: action.units,
        });
        return;
    }
    chain.sort();
}

/// `*debit` subtracts units from matching balances and never creates one.
fn apply_debit_units(account: &mut Account, action: &Action, mutations: &mut Vec<Mutation>) {
    let chain_key = chain_key_for(account, action);
    let Some(chain) = account.balance_map.get_mut(&chain_key) else {
        return;
    };
    for b in chain.iter_mut() {
        if !b.match_filter(&action.balance) {
            continue;
        }
        b.value -= action.units;
        mutations.push(Mutation {
            chain_key: chain_key.clone(),
            balance: b.clone(),
            post_value: b.value,
            delta: -action.units,
        });
    }
}

/// Zero the usage counters and re-arm every trigger the action's filter
/// admits.
fn reset_counters(account: &mut Account, action: &Action) {
    for trg in account.action_triggers.iter_mut() {
        if !action.balance.id.is_empty() && trg.balance_id != action.balance.id {
            continue;
        }
        if !action.balance_type.is_empty()
            && !trg.balance_type.is_empty()
            && trg.balance_type != action.balance_type
        {
            continue;
        }
        trg.usage_counter = Decimal::ZERO;
        trg.executed = false;
    }
}

fn expand_url(template: &str, account: &Account) -> String {
    template
        .replace("{account}", &account.id)
        .replace("{disabled}", if account.disabled { "true" } else { "false" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::action::TRIGGER_MIN_BALANCE;
    use crate::models::{ActionTrigger, Balance, VOICE};
    use rust_decimal_macros::dec;

    fn topup_action(units: Decimal, reset: bool) -> Action {
        Action {
            id: "TOPUP10_AC1".to_string(),
            action_type: (if reset { TOPUP_RESET } else { TOPUP }).to_string(),
            balance_type: VOICE.to_string(),
            direction: "*out".to_string(),
            units,
            balance: Balance {
                weight: 10.0,
                destination_ids: "DST_UK_Mobile_BIG5".to_string(),
                rating_subject: "discounted_minutes".to_string(),
                ..Default::default()
            },
            weight: 10.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_topup_reset_creates_then_sets() {
        let mut account = Account::new("*out:cgrates.org:12346");
        let mut mutations = Vec::new();

        apply_topup(&mut account, &topup_action(dec!(40), true), true, &mut mutations);
        let chain = &account.balance_map["*voice*out"];
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.0[0].value, dec!(40));
        assert_eq!(chain.0[0].weight, 10.0);

        // drain, then reset back to the action's units
        account.chain_mut("*voice*out").0[0].value = dec!(12);
        let mut mutations = Vec::new();
        apply_topup(&mut account, &topup_action(dec!(40), true), true, &mut mutations);
        let chain = &account.balance_map["*voice*out"];
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.0[0].value, dec!(40));
        assert_eq!(mutations[0].delta, dec!(28));
    }

    #[test]
    fn test_topup_adds() {
        let mut account = Account::new("*out:cgrates.org:12346");
        let mut mutations = Vec::new();
        apply_topup(&mut account, &topup_action(dec!(40), false), false, &mut mutations);
        apply_topup(&mut account, &topup_action(dec!(5), false), false, &mut mutations);
        assert_eq!(account.balance_map["*voice*out"].0[0].value, dec!(45));
    }

    #[test]
    fn test_debit_units_never_creates() {
        let mut account = Account::new("*out:cgrates.org:12346");
        let mut action = topup_action(dec!(5), false);
        action.action_type = DEBIT.to_string();
        let mut mutations = Vec::new();
        apply_debit_units(&mut account, &action, &mut mutations);
        assert!(account.balance_map.get("*voice*out").is_none());
        assert!(mutations.is_empty());
    }

    #[test]
    fn test_reset_counters_rearms_matching_trigger() {
        let mut account = Account::new("*out:cgrates.org:12346");
        account.action_triggers.push(ActionTrigger {
            id: "AT1".to_string(),
            balance_id: "T1".to_string(),
            threshold_type: TRIGGER_MIN_BALANCE.to_string(),
            threshold_value: dec!(5),
            executed: true,
            usage_counter: dec!(7),
            ..Default::default()
        });
        let action = Action {
            action_type: RESET_COUNTERS.to_string(),
            balance: Balance {
                id: "T1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        reset_counters(&mut account, &action);
        assert!(!account.action_triggers[0].executed);
        assert_eq!(account.action_triggers[0].usage_counter, Decimal::ZERO);
    }

    #[test]
    fn test_expand_url() {
        let account = Account::new("*out:cgrates.org:12346");
        assert_eq!(
            expand_url("http://host/notify?acc={account}", &account),
            "http://host/notify?acc=*out:cgrates.org:12346"
        );
    }
}
