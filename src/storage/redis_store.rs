// src/storage/redis_store.rs
//! Redis-backed rating and accounting storage, sharing the key layout of
//! the in-memory backend. Transient connection failures are retried with
//! bounded exponential backoff before surfacing as storage-unavailable.
//! CDRs are not kept in Redis; their warehousing is an external concern.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use super::*;
use crate::cache::Cache;

pub struct RedisStorage {
    manager: ConnectionManager,
    cache: Cache,
}

fn unavailable(e: redis::RedisError) -> EngineError {
    EngineError::StorageUnavailable(e.to_string())
}

impl RedisStorage {
    pub async fn new(redis_url: &str) -> EngineResult<Self> {
        let client = redis::Client::open(redis_url).map_err(unavailable)?;
        let manager = ConnectionManager::new(client).await.map_err(unavailable)?;

        // Test connection
        let mut conn = manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(RedisStorage {
            manager,
            cache: Cache::new(),
        })
    }

    async fn get_raw(&self, key: &str) -> EngineResult<Option<String>> {
        with_retries(|| {
            let mut conn = self.manager.clone();
            let key = key.to_string();
            async move {
                conn.get::<_, Option<String>>(&key)
                    .await
                    .map_err(unavailable)
            }
        })
        .await
    }

    async fn set_raw(&self, key: &str, value: &str) -> EngineResult<()> {
        with_retries(|| {
            let mut conn = self.manager.clone();
            let key = key.to_string();
            let value = value.to_string();
            async move { conn.set::<_, _, ()>(&key, &value).await.map_err(unavailable) }
        })
        .await
    }

    async fn keys(&self, pattern: &str) -> EngineResult<Vec<String>> {
        with_retries(|| {
            let mut conn = self.manager.clone();
            let pattern = pattern.to_string();
            async move {
                conn.keys::<_, Vec<String>>(&pattern)
                    .await
                    .map_err(unavailable)
            }
        })
        .await
    }

    async fn get_cached<T: DeserializeOwned>(
        &self,
        cache_prefix: &str,
        data_prefix: &str,
        id: &str,
    ) -> EngineResult<Option<T>> {
        if let Some(json) = self.cache.get(cache_prefix, id) {
            return Ok(Some(serde_json::from_str(&json)?));
        }
        match self.get_raw(&format!("{}{}", data_prefix, id)).await? {
            Some(json) => {
                let value = serde_json::from_str(&json)?;
                self.cache.set(cache_prefix, id, json);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn get_entity<T: DeserializeOwned>(
        &self,
        prefix: &str,
        id: &str,
    ) -> EngineResult<Option<T>> {
        self.get_cached(prefix, prefix, id).await
    }

    async fn get_plain<T: DeserializeOwned>(
        &self,
        prefix: &str,
        id: &str,
    ) -> EngineResult<Option<T>> {
        match self.get_raw(&format!("{}{}", prefix, id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set_entity<T: Serialize + ?Sized>(
        &self,
        prefix: &str,
        id: &str,
        value: &T,
    ) -> EngineResult<()> {
        let json = serde_json::to_string(value)?;
        self.set_raw(&format!("{}{}", prefix, id), &json).await
    }

    async fn snapshot_for(
        &self,
        prefixes: &[&str],
        aliases: &[(&str, &str)],
    ) -> EngineResult<()> {
        let mut snapshot: HashMap<String, HashMap<String, Arc<String>>> = HashMap::new();
        for (data_prefix, cache_prefix) in aliases {
            for key in self.keys(&format!("{}*", data_prefix)).await? {
                let id = key
                    .strip_prefix(data_prefix)
                    .unwrap_or(key.as_str())
                    .to_string();
                if let Some(json) = self.get_raw(&key).await? {
                    snapshot
                        .entry(cache_prefix.to_string())
                        .or_default()
                        .insert(id, Arc::new(json));
                }
            }
        }
        self.cache.publish(prefixes, snapshot);
        Ok(())
    }
}

#[async_trait]
impl RatingStorage for RedisStorage {
    async fn get_timing(&self, id: &str) -> EngineResult<Option<Timing>> {
        self.get_entity(TIMING_PREFIX, id).await
    }

    async fn set_timing(&self, timing: &Timing) -> EngineResult<()> {
        self.set_entity(TIMING_PREFIX, &timing.id, timing).await
    }

    async fn get_destination(&self, id: &str) -> EngineResult<Option<Destination>> {
        self.get_plain(DESTINATION_PREFIX, id).await
    }

    async fn set_destination(&self, dest: &Destination) -> EngineResult<()> {
        self.set_entity(DESTINATION_PREFIX, &dest.id, dest).await?;
        for prefix in &dest.prefixes {
            let mut ids: Vec<String> = self
                .get_plain(PREFIX_INDEX_PREFIX, prefix)
                .await?
                .unwrap_or_default();
            if !ids.contains(&dest.id) {
                ids.push(dest.id.clone());
                self.set_entity(PREFIX_INDEX_PREFIX, prefix, &ids).await?;
            }
        }
        Ok(())
    }

    async fn match_destinations(&self, number: &str) -> EngineResult<Vec<DestinationMatch>> {
        let mut matches = Vec::new();
        for len in (1..=number.len()).rev() {
            let prefix = &number[..len];
            let ids: Option<Vec<String>> = self
                .get_cached(DESTINATION_PREFIX, PREFIX_INDEX_PREFIX, prefix)
                .await?;
            if let Some(ids) = ids {
                for id in ids {
                    matches.push(DestinationMatch {
                        destination_id: id,
                        prefix: prefix.to_string(),
                    });
                }
            }
        }
        Ok(matches)
    }

    async fn get_rate(&self, id: &str) -> EngineResult<Option<Rate>> {
        self.get_entity(RATE_PREFIX, id).await
    }

    async fn set_rate(&self, rate: &Rate) -> EngineResult<()> {
        self.set_entity(RATE_PREFIX, &rate.id, rate).await
    }

    async fn get_destination_rate(&self, id: &str) -> EngineResult<Option<DestinationRate>> {
        self.get_entity(DESTINATION_RATE_PREFIX, id).await
    }

    async fn set_destination_rate(&self, dr: &DestinationRate) -> EngineResult<()> {
        self.set_entity(DESTINATION_RATE_PREFIX, &dr.id, dr).await
    }

    async fn get_rating_plan(&self, id: &str) -> EngineResult<Option<RatingPlan>> {
        self.get_entity(RATING_PLAN_PREFIX, id).await
    }

    async fn set_rating_plan(&self, plan: &RatingPlan) -> EngineResult<()> {
        self.set_entity(RATING_PLAN_PREFIX, &plan.id, plan).await
    }

    async fn get_rating_profile(&self, key: &str) -> EngineResult<Option<RatingProfile>> {
        self.get_entity(RATING_PROFILE_PREFIX, key).await
    }

    async fn set_rating_profile(&self, profile: &RatingProfile) -> EngineResult<()> {
        self.set_entity(RATING_PROFILE_PREFIX, &profile.key(), profile)
            .await
    }

    async fn cache_rating(&self) -> EngineResult<()> {
        self.snapshot_for(
            RATING_CACHE_PREFIXES,
            &[
                (PREFIX_INDEX_PREFIX, DESTINATION_PREFIX),
                (TIMING_PREFIX, TIMING_PREFIX),
                (RATE_PREFIX, RATE_PREFIX),
                (DESTINATION_RATE_PREFIX, DESTINATION_RATE_PREFIX),
                (RATING_PLAN_PREFIX, RATING_PLAN_PREFIX),
                (RATING_PROFILE_PREFIX, RATING_PROFILE_PREFIX),
            ],
        )
        .await
    }

    fn cache(&self) -> &Cache {
        &self.cache
    }
}

#[async_trait]
impl AccountingStorage for RedisStorage {
    async fn get_account(&self, id: &str) -> EngineResult<Option<Account>> {
        self.get_plain(ACCOUNT_PREFIX, id).await
    }

    async fn set_account(&self, account: &Account) -> EngineResult<()> {
        self.set_entity(ACCOUNT_PREFIX, &account.id, account).await
    }

    async fn get_actions(&self, id: &str) -> EngineResult<Option<Vec<Action>>> {
        self.get_entity(ACTION_PREFIX, id).await
    }

    async fn set_actions(&self, id: &str, actions: &[Action]) -> EngineResult<()> {
        self.set_entity(ACTION_PREFIX, id, actions).await
    }

    async fn get_action_plans(&self, id: &str) -> EngineResult<Option<Vec<ActionPlan>>> {
        self.get_entity(ACTION_PLAN_PREFIX, id).await
    }

    async fn set_action_plans(&self, id: &str, plans: &[ActionPlan]) -> EngineResult<()> {
        self.set_entity(ACTION_PLAN_PREFIX, id, plans).await
    }

    async fn all_action_plans(&self) -> EngineResult<Vec<ActionPlan>> {
        let mut plans = Vec::new();
        for key in self.keys(&format!("{}*", ACTION_PLAN_PREFIX)).await? {
            if let Some(json) = self.get_raw(&key).await? {
                let mut batch: Vec<ActionPlan> = serde_json::from_str(&json)?;
                plans.append(&mut batch);
            }
        }
        Ok(plans)
    }

    async fn get_action_triggers(&self, id: &str) -> EngineResult<Option<Vec<ActionTrigger>>> {
        self.get_plain(ACTION_TRIGGER_PREFIX, id).await
    }

    async fn set_action_triggers(
        &self,
        id: &str,
        triggers: &[ActionTrigger],
    ) -> EngineResult<()> {
        self.set_entity(ACTION_TRIGGER_PREFIX, id, triggers).await
    }

    async fn get_shared_group(&self, id: &str) -> EngineResult<Option<SharedGroup>> {
        self.get_entity(SHARED_GROUP_PREFIX, id).await
    }

    async fn set_shared_group(&self, group: &SharedGroup) -> EngineResult<()> {
        self.set_entity(SHARED_GROUP_PREFIX, &group.id, group).await
    }

    async fn cache_accounting(&self) -> EngineResult<()> {
        self.snapshot_for(
            ACCOUNTING_CACHE_PREFIXES,
            &[
                (ACTION_PREFIX, ACTION_PREFIX),
                (ACTION_PLAN_PREFIX, ACTION_PLAN_PREFIX),
                (SHARED_GROUP_PREFIX, SHARED_GROUP_PREFIX),
            ],
        )
        .await
    }
}
