// src/storage/mod.rs
//! Key-value facade over the rating and accounting data.
//!
//! Storage handles are explicit dependencies, injected into the rater, the
//! account engine and the scheduler at construction time. Entities are
//! JSON-encoded under prefixed keys so the in-memory and Redis backends
//! share one layout.

mod memory;
mod redis_store;

pub use memory::MapStorage;
pub use redis_store::RedisStorage;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::Cache;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    Account, Action, ActionPlan, ActionTrigger, CdrFilter, Destination, DestinationMatch,
    DestinationRate, Rate, RatingPlan, RatingProfile, SharedGroup, StoredCdr, Timing,
};

pub const DESTINATION_PREFIX: &str = "dst_";
pub const PREFIX_INDEX_PREFIX: &str = "pfx_";
pub const TIMING_PREFIX: &str = "tmg_";
pub const RATE_PREFIX: &str = "rat_";
pub const DESTINATION_RATE_PREFIX: &str = "drt_";
pub const RATING_PLAN_PREFIX: &str = "rpl_";
pub const RATING_PROFILE_PREFIX: &str = "rpf_";
pub const ACTION_PREFIX: &str = "act_";
pub const ACTION_PLAN_PREFIX: &str = "apl_";
pub const ACTION_TRIGGER_PREFIX: &str = "atr_";
pub const SHARED_GROUP_PREFIX: &str = "shg_";
pub const ACCOUNT_PREFIX: &str = "acc_";
pub const CDR_PREFIX: &str = "cdr_";

/// Prefixes rebuilt by `cache_rating`. The destination cache is keyed by
/// numeric prefix (the `pfx_` index), matching how lookups arrive.
pub const RATING_CACHE_PREFIXES: &[&str] = &[
    DESTINATION_PREFIX,
    TIMING_PREFIX,
    RATE_PREFIX,
    DESTINATION_RATE_PREFIX,
    RATING_PLAN_PREFIX,
    RATING_PROFILE_PREFIX,
];

pub const ACCOUNTING_CACHE_PREFIXES: &[&str] =
    &[ACTION_PREFIX, ACTION_PLAN_PREFIX, SHARED_GROUP_PREFIX];

#[async_trait]
pub trait RatingStorage: Send + Sync {
    async fn get_timing(&self, id: &str) -> EngineResult<Option<Timing>>;
    async fn set_timing(&self, timing: &Timing) -> EngineResult<()>;

    async fn get_destination(&self, id: &str) -> EngineResult<Option<Destination>>;
    async fn set_destination(&self, dest: &Destination) -> EngineResult<()>;
    /// Every destination hit for a dialed number, longest prefix first.
    async fn match_destinations(&self, number: &str) -> EngineResult<Vec<DestinationMatch>>;

    async fn get_rate(&self, id: &str) -> EngineResult<Option<Rate>>;
    async fn set_rate(&self, rate: &Rate) -> EngineResult<()>;

    async fn get_destination_rate(&self, id: &str) -> EngineResult<Option<DestinationRate>>;
    async fn set_destination_rate(&self, dr: &DestinationRate) -> EngineResult<()>;

    async fn get_rating_plan(&self, id: &str) -> EngineResult<Option<RatingPlan>>;
    async fn set_rating_plan(&self, plan: &RatingPlan) -> EngineResult<()>;

    async fn get_rating_profile(&self, key: &str) -> EngineResult<Option<RatingProfile>>;
    async fn set_rating_profile(&self, profile: &RatingProfile) -> EngineResult<()>;

    /// Rebuild the rating cache from the backend in one snapshot swap.
    async fn cache_rating(&self) -> EngineResult<()>;

    fn cache(&self) -> &Cache;
}

#[async_trait]
pub trait AccountingStorage: Send + Sync {
    async fn get_account(&self, id: &str) -> EngineResult<Option<Account>>;
    async fn set_account(&self, account: &Account) -> EngineResult<()>;

    async fn get_actions(&self, id: &str) -> EngineResult<Option<Vec<Action>>>;
    async fn set_actions(&self, id: &str, actions: &[Action]) -> EngineResult<()>;

    async fn get_action_plans(&self, id: &str) -> EngineResult<Option<Vec<ActionPlan>>>;
    async fn set_action_plans(&self, id: &str, plans: &[ActionPlan]) -> EngineResult<()>;
    async fn all_action_plans(&self) -> EngineResult<Vec<ActionPlan>>;

    async fn get_action_triggers(&self, id: &str) -> EngineResult<Option<Vec<ActionTrigger>>>;
    async fn set_action_triggers(&self, id: &str, triggers: &[ActionTrigger])
        -> EngineResult<()>;

    async fn get_shared_group(&self, id: &str) -> EngineResult<Option<SharedGroup>>;
    async fn set_shared_group(&self, group: &SharedGroup) -> EngineResult<()>;

    /// Rebuild the accounting cache from the backend.
    async fn cache_accounting(&self) -> EngineResult<()>;
}

#[async_trait]
pub trait CdrStorage: Send + Sync {
    async fn set_cdr(&self, cdr: &StoredCdr) -> EngineResult<()>;
    async fn get_cdrs(&self, filter: &CdrFilter) -> EngineResult<Vec<StoredCdr>>;
    async fn count_cdrs(&self, filter: &CdrFilter) -> EngineResult<i64>;
}

const STORAGE_RETRIES: u32 = 4;
const STORAGE_RETRY_BASE: Duration = Duration::from_millis(50);

/// Retry a storage operation on transient unavailability with bounded
/// exponential backoff. Every other error surfaces immediately.
pub async fn with_retries<T, F, Fut>(mut op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut delay = STORAGE_RETRY_BASE;
    let mut attempt = 0;
    loop {
        match op().await {
            Err(EngineError::StorageUnavailable(reason)) => {
                attempt += 1;
                if attempt >= STORAGE_RETRIES {
                    return Err(EngineError::StorageUnavailable(reason));
                }
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_retries_recovers() {
        let attempts = AtomicU32::new(0);
        let result: EngineResult<u32> = with_retries(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::StorageUnavailable("flaky".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retries_gives_up() {
        let result: EngineResult<u32> = with_retries(|| async {
            Err(EngineError::StorageUnavailable("down".to_string()))
        })
        .await;
        assert!(matches!(result, Err(EngineError::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn test_with_retries_does_not_retry_data_errors() {
        let attempts = AtomicU32::new(0);
        let result: EngineResult<u32> = with_retries(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::NotFound("x".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
