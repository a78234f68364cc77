// tests/cdrs_test.rs
//
// CDR ingestion and filtering over a real TCP JSON-RPC round trip: one
// record injected straight into storage, three submitted through
// CdrsV2.ProcessCdr, then the five filter shapes of the query surface.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;

use apolo_rating_engine::accounts::AccountEngine;
use apolo_rating_engine::cdrs::CdrEngine;
use apolo_rating_engine::models::cdr::cgr_id;
use apolo_rating_engine::models::{CdrFilter, StoredCdr, DEFAULT_RUNID, META_RATED};
use apolo_rating_engine::rating::Rater;
use apolo_rating_engine::rpc::{Responder, RpcClient, RpcServer};
use apolo_rating_engine::storage::{CdrStorage, MapStorage};

async fn start_server() -> (Arc<MapStorage>, RpcClient) {
    let storage = Arc::new(MapStorage::new());
    let rater = Arc::new(Rater::new(storage.clone()));
    let accounts = Arc::new(AccountEngine::new(
        storage.clone(),
        storage.clone(),
        rater.clone(),
    ));
    let cdrs = Arc::new(CdrEngine::new(storage.clone(), rater));
    let responder = Arc::new(Responder::new(accounts, cdrs));

    let server = RpcServer::new(responder);
    let (addr, _handle) = server.listen("127.0.0.1:0").await.unwrap();
    let client = RpcClient::connect(&addr.to_string()).await.unwrap();
    (storage, client)
}

fn processed_cdr(acc_id: &str, account: &str, rated: bool) -> StoredCdr {
    let at = Utc.with_ymd_and_hms(2013, 11, 7, 8, 42, 26).unwrap();
    StoredCdr {
        cgr_id: cgr_id(acc_id, &at),
        order_id: 123,
        tor: "*voice".to_string(),
        acc_id: acc_id.to_string(),
        cdr_host: "192.168.1.1".to_string(),
        cdr_source: "test".to_string(),
        req_type: META_RATED.to_string(),
        direction: "*out".to_string(),
        tenant: "cgrates.org".to_string(),
        category: "call".to_string(),
        account: account.to_string(),
        subject: account.to_string(),
        destination: "1002".to_string(),
        setup_time: at,
        answer_time: at,
        usage: 10.0,
        extra_fields: [
            ("field_extr1".to_string(), "val_extr1".to_string()),
            ("fieldextr2".to_string(), "valextr2".to_string()),
        ]
        .into_iter()
        .collect(),
        mediation_run_id: DEFAULT_RUNID.to_string(),
        rated_account: "dan".to_string(),
        rated_subject: "dans".to_string(),
        cost: dec!(1.01),
        rated,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_cdr_filters_over_rpc() {
    let (storage, client) = start_server().await;

    // pre-rated CDR injected straight into the store, never processed
    let setup = Utc.with_ymd_and_hms(2013, 12, 7, 8, 42, 24).unwrap();
    let injected = StoredCdr {
        cgr_id: cgr_id("bbb1", &setup),
        tor: "*voice".to_string(),
        acc_id: "bbb1".to_string(),
        cdr_host: "192.168.1.1".to_string(),
        cdr_source: "UNKNOWN".to_string(),
        req_type: META_RATED.to_string(),
        direction: "*out".to_string(),
        tenant: "cgrates.org".to_string(),
        category: "call".to_string(),
        account: "1001".to_string(),
        subject: "1001".to_string(),
        destination: "1002".to_string(),
        setup_time: setup,
        answer_time: Utc.with_ymd_and_hms(2013, 12, 7, 8, 42, 26).unwrap(),
        usage: 10.0,
        mediation_run_id: DEFAULT_RUNID.to_string(),
        cost: dec!(1.201),
        ..Default::default()
    };
    storage.set_cdr(&injected).await.unwrap();

    // three processed CDRs; the unrated two hit the empty catalogue and
    // come out errored
    for cdr in [
        processed_cdr("dsafdsaf", "1001", true),
        processed_cdr("abcdeftg", "1002", false),
        processed_cdr("aererfddf", "1003", false),
    ] {
        let reply: String = client.call("CdrsV2.ProcessCdr", &cdr).await.unwrap();
        assert_eq!(reply, "OK");
    }

    let all: Vec<StoredCdr> = client
        .call("ApierV2.GetCdrs", CdrFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 4);

    // CDRs with errors
    let errored: Vec<StoredCdr> = client
        .call(
            "ApierV2.GetCdrs",
            CdrFilter {
                min_cost: Some(-1.0),
                max_cost: Some(0.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(errored.len(), 2);

    // CDRs rated
    let rated: Vec<StoredCdr> = client
        .call(
            "ApierV2.GetCdrs",
            CdrFilter {
                min_cost: Some(-1.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rated.len(), 3);

    // CDRs non rated
    let non_rated: Vec<StoredCdr> = client
        .call(
            "ApierV2.GetCdrs",
            CdrFilter {
                max_cost: Some(-1.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(non_rated.len(), 1);
    assert_eq!(non_rated[0].cost, dec!(1.201));

    // skip errors
    let no_errors: Vec<StoredCdr> = client
        .call(
            "ApierV2.GetCdrs",
            CdrFilter {
                min_cost: Some(0.0),
                max_cost: Some(-1.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(no_errors.len(), 2);

    let count: i64 = client
        .call("ApierV2.CountCdrs", CdrFilter::default())
        .await
        .unwrap();
    assert_eq!(count, 4);
}

#[tokio::test]
async fn test_unknown_method_is_an_rpc_error() {
    let (_storage, client) = start_server().await;
    let result: Result<String, _> = client.call("Responder.NoSuchMethod", ()).await;
    assert!(result.is_err());
}
