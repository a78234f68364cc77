// src/storage/memory.rs
//! In-memory KV backend holding JSON-encoded entities, the default for
//! tests and single-node deployments.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::*;
use crate::cache::Cache;

pub struct MapStorage {
    data: RwLock<HashMap<String, String>>,
    cache: Cache,
}

impl MapStorage {
    pub fn new() -> Self {
        MapStorage {
            data: RwLock::new(HashMap::new()),
            cache: Cache::new(),
        }
    }

    fn read_key(&self, key: &str) -> Option<String> {
        let data = self.data.read().expect("storage lock poisoned");
        data.get(key).cloned()
    }

    fn write_key(&self, key: String, json: String) {
        let mut data = self.data.write().expect("storage lock poisoned");
        data.insert(key, json);
    }

    /// Cache-through read: serve from the cache shard when present, fall
    /// back to the backend and warm the cache on a hit.
    fn get_cached<T: DeserializeOwned>(
        &self,
        cache_prefix: &str,
        data_prefix: &str,
        id: &str,
    ) -> EngineResult<Option<T>> {
        if let Some(json) = self.cache.get(cache_prefix, id) {
            return Ok(Some(serde_json::from_str(&json)?));
        }
        match self.read_key(&format!("{}{}", data_prefix, id)) {
            Some(json) => {
                let value = serde_json::from_str(&json)?;
                self.cache.set(cache_prefix, id, json);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn set_entity<T: Serialize + ?Sized>(&self, prefix: &str, id: &str, value: &T) -> EngineResult<()> {
        let json = serde_json::to_string(value)?;
        self.write_key(format!("{}{}", prefix, id), json);
        Ok(())
    }

    fn get_entity<T: DeserializeOwned>(&self, prefix: &str, id: &str) -> EngineResult<Option<T>> {
        self.get_cached(prefix, prefix, id)
    }

    /// Uncached read, used for entities that are not cache-fronted.
    fn get_plain<T: DeserializeOwned>(&self, prefix: &str, id: &str) -> EngineResult<Option<T>> {
        match self.read_key(&format!("{}{}", prefix, id)) {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn snapshot_for(&self, prefixes: &[&str], aliases: &[(&str, &str)]) {
        use std::sync::Arc;
        let data = self.data.read().expect("storage lock poisoned");
        let mut snapshot: HashMap<String, HashMap<String, Arc<String>>> = HashMap::new();
        for (key, json) in data.iter() {
            for (data_prefix, cache_prefix) in aliases {
                if let Some(id) = key.strip_prefix(data_prefix) {
                    snapshot
                        .entry(cache_prefix.to_string())
                        .or_default()
                        .insert(id.to_string(), Arc::new(json.clone()));
                }
            }
        }
        drop(data);
        self.cache.publish(prefixes, snapshot);
    }
}

impl Default for MapStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RatingStorage for MapStorage {
    async fn get_timing(&self, id: &str) -> EngineResult<Option<Timing>> {
        self.get_entity(TIMING_PREFIX, id)
    }

    async fn set_timing(&self, timing: &Timing) -> EngineResult<()> {
        self.set_entity(TIMING_PREFIX, &timing.id, timing)
    }

    async fn get_destination(&self, id: &str) -> EngineResult<Option<Destination>> {
        self.get_plain(DESTINATION_PREFIX, id)
    }

    async fn set_destination(&self, dest: &Destination) -> EngineResult<()> {
        self.set_entity(DESTINATION_PREFIX, &dest.id, dest)?;
        // maintain the reverse prefix index used by lookups
        for prefix in &dest.prefixes {
            let mut ids: Vec<String> = self
                .get_plain(PREFIX_INDEX_PREFIX, prefix)?
                .unwrap_or_default();
            if !ids.contains(&dest.id) {
                ids.push(dest.id.clone());
                self.set_entity(PREFIX_INDEX_PREFIX, prefix, &ids)?;
            }
        }
        Ok(())
    }

    async fn match_destinations(&self, number: &str) -> EngineResult<Vec<DestinationMatch>> {
        let mut matches = Vec::new();
        for len in (1..=number.len()).rev() {
            let prefix = &number[..len];
            let ids: Option<Vec<String>> =
                self.get_cached(DESTINATION_PREFIX, PREFIX_INDEX_PREFIX, prefix)?;
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
        self.get_entity(RATE_PREFIX, id)
    }

    async fn set_rate(&self, rate: &Rate) -> EngineResult<()> {
        self.set_entity(RATE_PREFIX, &rate.id, rate)
    }

    async fn get_destination_rate(&self, id: &str) -> EngineResult<Option<DestinationRate>> {
        self.get_entity(DESTINATION_RATE_PREFIX, id)
    }

    async fn set_destination_rate(&self, dr: &DestinationRate) -> EngineResult<()> {
        self.set_entity(DESTINATION_RATE_PREFIX, &dr.id, dr)
    }

    async fn get_rating_plan(&self, id: &str) -> EngineResult<Option<RatingPlan>> {
        self.get_entity(RATING_PLAN_PREFIX, id)
    }

    async fn set_rating_plan(&self, plan: &RatingPlan) -> EngineResult<()> {
        self.set_entity(RATING_PLAN_PREFIX, &plan.id, plan)
    }

    async fn get_rating_profile(&self, key: &str) -> EngineResult<Option<RatingProfile>> {
        self.get_entity(RATING_PROFILE_PREFIX, key)
    }

    async fn set_rating_profile(&self, profile: &RatingProfile) -> EngineResult<()> {
        self.set_entity(RATING_PROFILE_PREFIX, &profile.key(), profile)
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
        );
        Ok(())
    }

    fn cache(&self) -> &Cache {
        &self.cache
    }
}

#[async_trait]
impl AccountingStorage for MapStorage {
    async fn get_account(&self, id: &str) -> EngineResult<Option<Account>> {
        self.get_plain(ACCOUNT_PREFIX, id)
    }

    async fn set_account(&self, account: &Account) -> EngineResult<()> {
        self.set_entity(ACCOUNT_PREFIX, &account.id, account)
    }

    async fn get_actions(&self, id: &str) -> EngineResult<Option<Vec<Action>>> {
        self.get_entity(ACTION_PREFIX, id)
    }

    async fn set_actions(&self, id: &str, actions: &[Action]) -> EngineResult<()> {
        self.set_entity(ACTION_PREFIX, id, actions)
    }

    async fn get_action_plans(&self, id: &str) -> EngineResult<Option<Vec<ActionPlan>>> {
        self.get_entity(ACTION_PLAN_PREFIX, id)
    }

    async fn set_action_plans(&self, id: &str, plans: &[ActionPlan]) -> EngineResult<()> {
        self.set_entity(ACTION_PLAN_PREFIX, id, plans)
    }

    async fn all_action_plans(&self) -> EngineResult<Vec<ActionPlan>> {
        let data = self.data.read().expect("storage lock poisoned");
        let mut plans = Vec::new();
        for (key, json) in data.iter() {
            if key.starts_with(ACTION_PLAN_PREFIX) {
                let mut batch: Vec<ActionPlan> = serde_json::from_str(json)?;
                plans.append(&mut batch);
            }
        }
        Ok(plans)
    }

    async fn get_action_triggers(&self, id: &str) -> EngineResult<Option<Vec<ActionTrigger>>> {
        self.get_plain(ACTION_TRIGGER_PREFIX, id)
    }

    async fn set_action_triggers(
        &self,
        id: &str,
        triggers: &[ActionTrigger],
    ) -> EngineResult<()> {
        self.set_entity(ACTION_TRIGGER_PREFIX, id, triggers)
    }

    async fn get_shared_group(&self, id: &str) -> EngineResult<Option<SharedGroup>> {
        self.get_entity(SHARED_GROUP_PREFIX, id)
    }

    async fn set_shared_group(&self, group: &SharedGroup) -> EngineResult<()> {
        self.set_entity(SHARED_GROUP_PREFIX, &group.id, group)
    }

    async fn cache_accounting(&self) -> EngineResult<()> {
        self.snapshot_for(
            ACCOUNTING_CACHE_PREFIXES,
            &[
                (ACTION_PREFIX, ACTION_PREFIX),
                (ACTION_PLAN_PREFIX, ACTION_PLAN_PREFIX),
                (SHARED_GROUP_PREFIX, SHARED_GROUP_PREFIX),
            ],
        );
        Ok(())
    }
}

#[async_trait]
impl CdrStorage for MapStorage {
    async fn set_cdr(&self, cdr: &StoredCdr) -> EngineResult<()> {
        self.set_entity(CDR_PREFIX, &cdr.cgr_id, cdr)
    }

    async fn get_cdrs(&self, filter: &CdrFilter) -> EngineResult<Vec<StoredCdr>> {
        let data = self.data.read().expect("storage lock poisoned");
        let mut cdrs = Vec::new();
        for (key, json) in data.iter() {
            if key.starts_with(CDR_PREFIX) {
                let cdr: StoredCdr = serde_json::from_str(json)?;
                if filter.matches(&cdr) {
                    cdrs.push(cdr);
                }
            }
        }
        drop(data);
        cdrs.sort_by(|a, b| {
            a.order_id
                .cmp(&b.order_id)
                .then_with(|| a.cgr_id.cmp(&b.cgr_id))
        });
        let offset = filter.offset.unwrap_or(0);
        let cdrs: Vec<StoredCdr> = cdrs.into_iter().skip(offset).collect();
        match filter.limit {
            Some(limit) => Ok(cdrs.into_iter().take(limit).collect()),
            None => Ok(cdrs),
        }
    }

    async fn count_cdrs(&self, filter: &CdrFilter) -> EngineResult<i64> {
        let data = self.data.read().expect("storage lock poisoned");
        let mut count = 0i64;
        for (key, json) in data.iter() {
            if key.starts_with(CDR_PREFIX) {
                let cdr: StoredCdr = serde_json::from_str(json)?;
                if filter.matches(&cdr) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}
