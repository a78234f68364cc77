// src/cdrs.rs
//! CDR processing: ingest externally produced records, rate the ones not
//! already rated, and serve filtered queries.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Duration;
use tracing::{info, warn};

use crate::error::EngineResult;
use crate::models::cdr::error_cost;
use crate::models::{
    CallDescriptor, CdrFilter, StoredCdr, DEFAULT_RUNID, META_NONE, OUTBOUND,
};
use crate::rating::Rater;
use crate::storage::CdrStorage;

pub struct CdrEngine {
    storage: Arc<dyn CdrStorage>,
    rater: Arc<Rater>,
    order_seq: AtomicI64,
    host: String,
}

impl CdrEngine {
    pub fn new(storage: Arc<dyn CdrStorage>, rater: Arc<Rater>) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "rating-engine".to_string());
        CdrEngine {
            storage,
            rater,
            order_seq: AtomicI64::new(1),
            host,
        }
    }

    /// Ingest one CDR: fill derived fields, rate it unless already rated,
    /// persist. Rating failures are recorded on the CDR (error cost and
    /// detail), not surfaced to the submitter.
    pub async fn process_cdr(&self, cdr: &StoredCdr) -> EngineResult<String> {
        let mut cdr = cdr.clone();
        if cdr.cgr_id.is_empty() {
            cdr.cgr_id = cdr.compute_cgr_id();
        }
        if cdr.order_id == 0 {
            cdr.order_id = self.order_seq.fetch_add(1, Ordering::SeqCst);
        }
        if cdr.cdr_host.is_empty() {
            cdr.cdr_host = self.host.clone();
        }
        if cdr.mediation_run_id.is_empty() {
            cdr.mediation_run_id = DEFAULT_RUNID.to_string();
        }

        if !cdr.rated && cdr.req_type != META_NONE {
            self.rate_cdr(&mut cdr).await;
        }

        self.storage.set_cdr(&cdr).await?;
        info!(
            "📝 Processed CDR {}: account {}, cost {}",
            cdr.cgr_id, cdr.account, cdr.cost
        );
        Ok(crate::models::OK.to_string())
    }

    async fn rate_cdr(&self, cdr: &mut StoredCdr) {
        let direction = if cdr.direction.is_empty() {
            OUTBOUND.to_string()
        } else {
            cdr.direction.clone()
        };
        let subject = if cdr.subject.is_empty() {
            cdr.account.clone()
        } else {
            cdr.subject.clone()
        };
        let cd = CallDescriptor {
            tor: cdr.tor.clone(),
            direction,
            tenant: cdr.tenant.clone(),
            category: cdr.category.clone(),
            subject: subject.clone(),
            account: cdr.account.clone(),
            destination: cdr.destination.clone(),
            time_start: cdr.answer_time,
            time_end: cdr.answer_time + Duration::seconds(cdr.usage as i64),
            ..Default::default()
        };
        match self.rater.get_cost(&cd).await {
            Ok(cc) => {
                cdr.cost = cc.cost;
                cdr.rated_account = cdr.account.clone();
                cdr.rated_subject = subject;
            }
            Err(e) => {
                warn!("Rating CDR {} failed: {}", cdr.cgr_id, e);
                cdr.cost = error_cost();
                cdr.extra_info = e.to_string();
            }
        }
        cdr.rated = true;
    }

    pub async fn get_cdrs(&self, filter: &CdrFilter) -> EngineResult<Vec<StoredCdr>> {
        self.storage.get_cdrs(filter).await
    }

    pub async fn count_cdrs(&self, filter: &CdrFilter) -> EngineResult<i64> {
        self.storage.count_cdrs(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cdr::cgr_id;
    use crate::models::META_RATED;
    use crate::storage::MapStorage;
    use chrono::TimeZone;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn engine() -> (Arc<MapStorage>, CdrEngine) {
        let storage = Arc::new(MapStorage::new());
        let rater = Arc::new(Rater::new(storage.clone()));
        let engine = CdrEngine::new(storage.clone(), rater);
        (storage, engine)
    }

    fn sample_cdr(acc_id: &str, rated: bool) -> StoredCdr {
        let setup = Utc.with_ymd_and_hms(2013, 11, 7, 8, 42, 26).unwrap();
        StoredCdr {
            cgr_id: cgr_id(acc_id, &setup),
            tor: "*voice".to_string(),
            acc_id: acc_id.to_string(),
            cdr_source: "test".to_string(),
            req_type: META_RATED.to_string(),
            direction: "*out".to_string(),
            tenant: "cgrates.org".to_string(),
            category: "call".to_string(),
            account: "1001".to_string(),
            subject: "1001".to_string(),
            destination: "1002".to_string(),
            setup_time: setup,
            answer_time: setup,
            usage: 10.0,
            mediation_run_id: DEFAULT_RUNID.to_string(),
            cost: dec!(1.01),
            rated,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_process_keeps_pre_rated_cost() {
        let (_storage, engine) = engine();
        let reply = engine.process_cdr(&sample_cdr("dsafdsaf", true)).await.unwrap();
        assert_eq!(reply, "OK");
        let cdrs = engine.get_cdrs(&CdrFilter::default()).await.unwrap();
        assert_eq!(cdrs.len(), 1);
        assert_eq!(cdrs[0].cost, dec!(1.01));
    }

    #[tokio::test]
    async fn test_process_marks_failed_rating_as_errored() {
        // no tariff data loaded, so the rating attempt must fail
        let (_storage, engine) = engine();
        engine
            .process_cdr(&sample_cdr("abcdeftg", false))
            .await
            .unwrap();
        let cdrs = engine.get_cdrs(&CdrFilter::default()).await.unwrap();
        assert_eq!(cdrs.len(), 1);
        assert!(cdrs[0].is_errored());
        assert!(cdrs[0].rated);
        assert!(!cdrs[0].extra_info.is_empty());
    }
}
