// src/models/account.rs
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::action::ActionTrigger;
use super::balance::{Balance, BalanceChain};
use super::MONETARY;

/// A billing account, identified by `direction:tenant:account`.
///
/// Balances live in chains keyed by `TOR+direction` (e.g. `*voice*out`).
/// Every mutation happens under the owning account's lock in the account
/// engine; the struct itself is plain data so it can be cloned for dry-run
/// simulations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub balance_map: HashMap<String, BalanceChain>,
    pub action_triggers: Vec<ActionTrigger>,
    pub allow_negative: bool,
    pub disabled: bool,
}

impl Account {
    pub fn new(id: &str) -> Self {
        Account {
            id: id.to_string(),
            ..Default::default()
        }
    }

    /// The `direction` component of the account id.
    pub fn direction(&self) -> &str {
        self.id.split(':').next().unwrap_or_default()
    }

    pub fn chain(&self, key: &str) -> Option<&BalanceChain> {
        self.balance_map.get(key)
    }

    pub fn chain_mut(&mut self, key: &str) -> &mut BalanceChain {
        self.balance_map.entry(key.to_string()).or_default()
    }

    /// The default monetary balance for the given direction, created on
    /// demand. Residual charges that no explicit balance covers land here.
    pub fn default_monetary_mut(&mut self, direction: &str) -> &mut Balance {
        let key = format!("{}{}", MONETARY, direction);
        let chain = self.balance_map.entry(key).or_default();
        if !chain.0.iter().any(|b| b.is_default()) {
            chain.0.push(Balance::default());
            chain.sort();
        }
        chain
            .0
            .iter_mut()
            .find(|b| b.is_default())
            .expect("default balance just ensured")
    }
}
