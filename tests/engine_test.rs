// tests/engine_test.rs
//
// End-to-end engine scenarios: CSV load through scheduler topup and debit,
// proportional refunds, trigger firing, and the non-mutating max session
// time query.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use apolo_rating_engine::accounts::AccountEngine;
use apolo_rating_engine::loader::{CsvSource, TpReader};
use apolo_rating_engine::models::action::{DEBIT, RESET_COUNTERS, TOPUP, TRIGGER_MIN_BALANCE};
use apolo_rating_engine::models::{
    Account, Action, ActionTrigger, Balance, CallCost, CallDescriptor, Destination,
    DestinationRate, DestinationRateBinding, MinuteInfo, PlanBinding, Rate, RateSlot,
    RatingPlan, RatingPlanActivation, RatingProfile, RoundingMethod, TimeSpan, Timing,
};
use apolo_rating_engine::rating::Rater;
use apolo_rating_engine::scheduler::Scheduler;
use apolo_rating_engine::storage::{
    AccountingStorage, MapStorage, RatingStorage, ACTION_PREFIX, DESTINATION_PREFIX,
    RATING_PLAN_PREFIX, RATING_PROFILE_PREFIX,
};

fn uk_source() -> CsvSource {
    let timings = "ALWAYS,*any,*any,*any,*any,00:00:00\nASAP,*any,*any,*any,*any,*asap";
    let destinations = "DST_UK_Mobile_BIG5,447596\nDST_UK_Mobile_BIG5,447956";
    let rates = "RT_UK_Mobile_BIG5_PKG,0.01,0,20s,20s,0s\nRT_UK_Mobile_BIG5,0.01,0.10,1s,1s,0s";
    let destination_rates = "DR_UK_Mobile_BIG5_PKG,DST_UK_Mobile_BIG5,RT_UK_Mobile_BIG5_PKG,*up,8,0,\nDR_UK_Mobile_BIG5,DST_UK_Mobile_BIG5,RT_UK_Mobile_BIG5,*up,8,0,";
    let rating_plans = "RP_UK_Mobile_BIG5_PKG,DR_UK_Mobile_BIG5_PKG,ALWAYS,10\nRP_UK,DR_UK_Mobile_BIG5,ALWAYS,10";
    let rating_profiles = "*out,cgrates.org,call,*any,2013-01-06T00:00:00Z,RP_UK,,\n*out,cgrates.org,call,discounted_minutes,2013-01-06T00:00:00Z,RP_UK_Mobile_BIG5_PKG,,";
    let actions =
        "TOPUP10_AC1,*topup_reset,,,*voice,*out,,DST_UK_Mobile_BIG5,discounted_minutes,,*unlimited,,40,10,10";
    let action_plans = "TOPUP10_AT,TOPUP10_AC1,ASAP,10";
    let account_actions = "cgrates.org,12346,*out,TOPUP10_AT,";

    CsvSource::from_strings(
        destinations,
        timings,
        rates,
        destination_rates,
        rating_plans,
        rating_profiles,
        "",
        "",
        actions,
        action_plans,
        "",
        account_actions,
        "",
        "",
    )
}

struct Fixture {
    storage: Arc<MapStorage>,
    engine: Arc<AccountEngine>,
    scheduler: Scheduler,
}

async fn loaded_fixture() -> Fixture {
    let storage = Arc::new(MapStorage::new());
    let reader = TpReader::new(storage.clone(), storage.clone(), uk_source());
    reader.load_all().await.unwrap();

    let rater = Arc::new(Rater::new(storage.clone()));
    let engine = Arc::new(AccountEngine::new(
        storage.clone(),
        storage.clone(),
        rater,
    ));
    let scheduler = Scheduler::new(engine.clone(), storage.clone(), storage.clone());
    Fixture {
        storage,
        engine,
        scheduler,
    }
}

fn uk_descriptor() -> CallDescriptor {
    CallDescriptor {
        direction: "*out".to_string(),
        category: "call".to_string(),
        tenant: "cgrates.org".to_string(),
        subject: "12346".to_string(),
        account: "12346".to_string(),
        destination: "447956933443".to_string(),
        time_start: Utc.with_ymd_and_hms(2014, 3, 4, 6, 0, 0).unwrap(),
        time_end: Utc.with_ymd_and_hms(2014, 3, 4, 6, 0, 10).unwrap(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_load_csv_populates_caches_and_account() {
    let f = loaded_fixture().await;

    let account = f
        .storage
        .get_account("*out:cgrates.org:12346")
        .await
        .unwrap();
    assert!(account.is_some(), "no account saved");

    let cache = f.storage.cache();
    assert_eq!(cache.count_entries(DESTINATION_PREFIX), 2);
    assert_eq!(cache.count_entries(RATING_PLAN_PREFIX), 2);
    assert_eq!(cache.count_entries(RATING_PROFILE_PREFIX), 2);
    assert_eq!(cache.count_entries(ACTION_PREFIX), 1);
}

#[tokio::test]
async fn test_scheduler_asap_topup_then_debit() {
    let f = loaded_fixture().await;

    // the ASAP action plan runs inline during load
    f.scheduler.load_action_plans().await.unwrap();
    let account = f
        .storage
        .get_account("*out:cgrates.org:12346")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.balance_map.len(), 1);
    let voice = &account.balance_map["*voice*out"];
    assert_eq!(voice.0[0].value, dec!(40));

    // ten seconds against a 20 s package increment consumes 20 voice
    // seconds; only the connect fee hits the monetary chain
    let cc = f.engine.debit(&uk_descriptor()).await.unwrap();
    assert_eq!(cc.cost, dec!(0.01));

    let account = f
        .storage
        .get_account("*out:cgrates.org:12346")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.balance_map.len(), 2);
    assert_eq!(account.balance_map["*voice*out"].0[0].value, dec!(20));
    assert_eq!(account.balance_map["*monetary*out"].0[0].value, dec!(-0.01));

    let minute_info = cc.timespans[0].minute_info.as_ref().unwrap();
    assert_eq!(minute_info.quantity, 20.0);
    assert_eq!(minute_info.destination_id, "DST_UK_Mobile_BIG5");
}

#[tokio::test]
async fn test_max_session_time_is_non_mutating() {
    let f = loaded_fixture().await;
    f.scheduler.load_action_plans().await.unwrap();
    f.engine.debit(&uk_descriptor()).await.unwrap();

    let mut probe = uk_descriptor();
    probe.time_start = Utc.with_ymd_and_hms(2014, 3, 4, 6, 0, 10).unwrap();
    probe.time_end = Utc.with_ymd_and_hms(2014, 3, 4, 6, 0, 20).unwrap();
    probe.amount = 10.0;
    probe.loop_index = 1;

    let first = f.engine.max_session_time(&probe).await.unwrap();
    let second = f.engine.max_session_time(&probe).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first, 10.0);

    // the account itself is untouched
    let account = f
        .storage
        .get_account("*out:cgrates.org:12346")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.balance_map["*voice*out"].0[0].value, dec!(20));
}

async fn simple_german_fixture(storage: &Arc<MapStorage>) {
    storage
        .set_timing(&Timing {
            id: "ALWAYS".to_string(),
            start_time: "00:00:00".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    storage
        .set_destination(&Destination {
            id: "DST_DE".to_string(),
            prefixes: vec!["49".to_string()],
        })
        .await
        .unwrap();
    storage
        .set_rate(&Rate {
            id: "RT_DE".to_string(),
            connect_fee: Decimal::ZERO,
            slots: vec![RateSlot {
                group_interval_start: 0,
                price: dec!(0.01),
                rate_unit: 1,
                rate_increment: 1,
            }],
        })
        .await
        .unwrap();
    storage
        .set_destination_rate(&DestinationRate {
            id: "DR_DE".to_string(),
            bindings: vec![DestinationRateBinding {
                destination_id: "DST_DE".to_string(),
                rate_id: "RT_DE".to_string(),
                rounding_method: RoundingMethod::Up,
                rounding_decimals: 8,
                max_cost: Decimal::ZERO,
                max_cost_strategy: None,
            }],
        })
        .await
        .unwrap();
    storage
        .set_rating_plan(&RatingPlan {
            id: "RP_DE".to_string(),
            bindings: vec![PlanBinding {
                timing_id: "ALWAYS".to_string(),
                destination_rate_id: "DR_DE".to_string(),
                weight: 10.0,
            }],
        })
        .await
        .unwrap();
    storage
        .set_rating_profile(&RatingProfile {
            direction: "*out".to_string(),
            tenant: "cgrates.org".to_string(),
            category: "call".to_string(),
            subject: "*any".to_string(),
            activations: vec![RatingPlanActivation {
                activation_time: Utc.with_ymd_and_hms(2013, 1, 6, 0, 0, 0).unwrap(),
                rating_plan_id: "RP_DE".to_string(),
                fallback_subjects: String::new(),
            }],
        })
        .await
        .unwrap();
    storage.cache_rating().await.unwrap();
}

#[tokio::test]
async fn test_debit_then_full_refund_restores_account() {
    let storage = Arc::new(MapStorage::new());
    simple_german_fixture(&storage).await;

    let mut account = Account::new("*out:cgrates.org:roundtrip");
    account.chain_mut("*monetary*out").push(Balance {
        value: dec!(5),
        ..Default::default()
    });
    storage.set_account(&account).await.unwrap();

    let rater = Arc::new(Rater::new(storage.clone()));
    let engine = AccountEngine::new(storage.clone(), storage.clone(), rater);

    let start = Utc.with_ymd_and_hms(2014, 3, 4, 6, 0, 0).unwrap();
    let cd = CallDescriptor {
        direction: "*out".to_string(),
        category: "call".to_string(),
        tenant: "cgrates.org".to_string(),
        subject: "roundtrip".to_string(),
        account: "roundtrip".to_string(),
        destination: "4915117070000".to_string(),
        time_start: start,
        time_end: start + Duration::seconds(10),
        ..Default::default()
    };
    let mut cc = engine.debit(&cd).await.unwrap();
    assert_eq!(cc.cost, dec!(0.10));
    let drained = storage
        .get_account("*out:cgrates.org:roundtrip")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(drained.balance_map["*monetary*out"].0[0].value, dec!(4.90));

    let (cost_back, seconds_back) = engine
        .refund(&mut cc, 10.0, start + Duration::seconds(10))
        .await
        .unwrap();
    assert_eq!(cost_back, dec!(0.10));
    assert_eq!(seconds_back, 0.0);

    let restored = storage
        .get_account("*out:cgrates.org:roundtrip")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(restored.balance_map["*monetary*out"].0[0].value, dec!(5));
    assert_eq!(cc.cost, Decimal::ZERO);
    assert!(cc.timespans.is_empty());
}

#[tokio::test]
async fn test_refund_partial_span_is_proportional() {
    let storage = Arc::new(MapStorage::new());
    simple_german_fixture(&storage).await;
    storage
        .set_destination(&Destination {
            id: "DST_UK_Mobile_BIG5".to_string(),
            prefixes: vec!["447956".to_string()],
        })
        .await
        .unwrap();

    let mut account = Account::new("*out:cgrates.org:s4");
    account.chain_mut("*voice*out").push(Balance {
        value: dec!(10),
        weight: 10.0,
        destination_ids: "DST_UK_Mobile_BIG5".to_string(),
        ..Default::default()
    });
    storage.set_account(&account).await.unwrap();

    let rater = Arc::new(Rater::new(storage.clone()));
    let engine = AccountEngine::new(storage.clone(), storage.clone(), rater);

    let start = Utc.with_ymd_and_hms(2014, 3, 4, 6, 0, 0).unwrap();
    let now = start + Duration::seconds(15);
    let mut cc = CallCost {
        tor: "*voice".to_string(),
        direction: "*out".to_string(),
        tenant: "cgrates.org".to_string(),
        category: "call".to_string(),
        subject: "s4".to_string(),
        account: "s4".to_string(),
        destination: "447956933443".to_string(),
        timespans: vec![TimeSpan {
            time_start: start,
            time_end: start + Duration::seconds(20),
            cost: dec!(0.20),
            rate_interval: None,
            minute_info: Some(MinuteInfo {
                destination_id: "DST_UK_Mobile_BIG5".to_string(),
                quantity: 20.0,
                price: dec!(0.01),
            }),
        }],
        ..Default::default()
    };
    cc.recompute_cost();

    let (cost_back, seconds_back) = engine.refund(&mut cc, 5.0, now).await.unwrap();
    assert_eq!(cost_back, dec!(0.05));
    assert_eq!(seconds_back, 5.0);

    let span = &cc.timespans[0];
    assert_eq!(span.cost, dec!(0.15));
    assert_eq!(span.minute_info.as_ref().unwrap().quantity, 15.0);
    assert_eq!(span.time_end, now);
    assert_eq!(cc.cost, dec!(0.15));

    let account = storage
        .get_account("*out:cgrates.org:s4")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.balance_map["*voice*out"].0[0].value, dec!(15));
    assert_eq!(account.balance_map["*monetary*out"].0[0].value, dec!(0.05));
}

#[tokio::test]
async fn test_trigger_fires_once_until_counters_reset() {
    let storage = Arc::new(MapStorage::new());
    let rater = Arc::new(Rater::new(storage.clone()));
    let engine = AccountEngine::new(storage.clone(), storage.clone(), rater);

    let mut account = Account::new("*out:cgrates.org:trig");
    account.chain_mut("*monetary*out").push(Balance {
        id: "T1".to_string(),
        value: dec!(10),
        weight: 10.0,
        ..Default::default()
    });
    account.action_triggers.push(ActionTrigger {
        id: "AT_T1".to_string(),
        balance_id: "T1".to_string(),
        threshold_type: TRIGGER_MIN_BALANCE.to_string(),
        threshold_value: dec!(5),
        actions_id: "BONUS_SMS".to_string(),
        ..Default::default()
    });
    storage.set_account(&account).await.unwrap();

    storage
        .set_actions(
            "BONUS_SMS",
            &[Action {
                id: "BONUS_SMS".to_string(),
                action_type: TOPUP.to_string(),
                balance_type: "*sms".to_string(),
                direction: "*out".to_string(),
                units: dec!(1),
                balance: Balance {
                    id: "bonus".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            }],
        )
        .await
        .unwrap();
    let debit_action = |id: &str, units: Decimal| Action {
        id: id.to_string(),
        action_type: DEBIT.to_string(),
        balance_type: "*monetary".to_string(),
        direction: "*out".to_string(),
        units,
        balance: Balance {
            id: "T1".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    storage
        .set_actions("DEBIT6", &[debit_action("DEBIT6", dec!(6))])
        .await
        .unwrap();
    storage
        .set_actions("DEBIT1", &[debit_action("DEBIT1", dec!(1))])
        .await
        .unwrap();
    storage
        .set_actions(
            "RESET",
            &[Action {
                id: "RESET".to_string(),
                action_type: RESET_COUNTERS.to_string(),
                balance: Balance {
                    id: "T1".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            }],
        )
        .await
        .unwrap();

    let exec = |actions_id: &str| apolo_rating_engine::models::AttrExecuteAction {
        direction: "*out".to_string(),
        tenant: "cgrates.org".to_string(),
        account: "trig".to_string(),
        actions_id: actions_id.to_string(),
    };

    // 10 - 6 = 4 crosses the min-balance threshold of 5: fires once
    engine.execute_actions(&exec("DEBIT6")).await.unwrap();
    let account = storage
        .get_account("*out:cgrates.org:trig")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.balance_map["*monetary*out"].0[0].value, dec!(4));
    assert_eq!(account.balance_map["*sms*out"].0[0].value, dec!(1));
    assert!(account.action_triggers[0].executed);
    assert_eq!(account.action_triggers[0].times_fired, 1);

    // still below threshold: no second firing
    engine.execute_actions(&exec("DEBIT1")).await.unwrap();
    let account = storage
        .get_account("*out:cgrates.org:trig")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.balance_map["*monetary*out"].0[0].value, dec!(3));
    assert_eq!(account.balance_map["*sms*out"].0[0].value, dec!(1));
    assert_eq!(account.action_triggers[0].times_fired, 1);

    // after a counter reset the trigger is armed again
    engine.execute_actions(&exec("RESET")).await.unwrap();
    engine.execute_actions(&exec("DEBIT1")).await.unwrap();
    let account = storage
        .get_account("*out:cgrates.org:trig")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.balance_map["*sms*out"].0[0].value, dec!(2));
    assert_eq!(account.action_triggers[0].times_fired, 2);
}

#[tokio::test]
async fn test_insufficient_credit_leaves_no_partial_mutation() {
    let storage = Arc::new(MapStorage::new());
    simple_german_fixture(&storage).await;

    let mut account = Account::new("*out:cgrates.org:poor");
    account.chain_mut("*monetary*out").push(Balance {
        id: "M1".to_string(),
        value: dec!(0.05),
        weight: 10.0,
        ..Default::default()
    });
    storage.set_account(&account).await.unwrap();

    let rater = Arc::new(Rater::new(storage.clone()));
    let engine = AccountEngine::new(storage.clone(), storage.clone(), rater);

    let start = Utc.with_ymd_and_hms(2014, 3, 4, 6, 0, 0).unwrap();
    let cd = CallDescriptor {
        direction: "*out".to_string(),
        category: "call".to_string(),
        tenant: "cgrates.org".to_string(),
        subject: "poor".to_string(),
        account: "poor".to_string(),
        destination: "4915117070000".to_string(),
        time_start: start,
        time_end: start + Duration::seconds(10),
        ..Default::default()
    };
    let err = engine.debit(&cd).await.unwrap_err();
    assert!(matches!(
        err,
        apolo_rating_engine::error::EngineError::InsufficientCredit { .. }
    ));

    // explicit chain, no allow-negative: untouched
    let account = storage
        .get_account("*out:cgrates.org:poor")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.balance_map["*monetary*out"].0[0].value, dec!(0.05));
}

#[tokio::test]
async fn test_balance_chain_stays_sorted_after_mutations() {
    let storage = Arc::new(MapStorage::new());
    let rater = Arc::new(Rater::new(storage.clone()));
    let engine = AccountEngine::new(storage.clone(), storage.clone(), rater);

    let mut account = Account::new("*out:cgrates.org:sorted");
    let chain = account.chain_mut("*monetary*out");
    chain.push(Balance {
        id: "low".to_string(),
        value: dec!(1),
        weight: 1.0,
        ..Default::default()
    });
    chain.push(Balance {
        id: "high".to_string(),
        value: dec!(1),
        weight: 2.0,
        ..Default::default()
    });
    storage.set_account(&account).await.unwrap();

    storage
        .set_actions(
            "TOPUP_HIGH",
            &[Action {
                id: "TOPUP_HIGH".to_string(),
                action_type: TOPUP.to_string(),
                balance_type: "*monetary".to_string(),
                direction: "*out".to_string(),
                units: dec!(3),
                balance: Balance {
                    id: "high".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            }],
        )
        .await
        .unwrap();
    engine
        .execute_actions(&apolo_rating_engine::models::AttrExecuteAction {
            direction: "*out".to_string(),
            tenant: "cgrates.org".to_string(),
            account: "sorted".to_string(),
            actions_id: "TOPUP_HIGH".to_string(),
        })
        .await
        .unwrap();

    let account = storage
        .get_account("*out:cgrates.org:sorted")
        .await
        .unwrap()
        .unwrap();
    let chain = &account.balance_map["*monetary*out"];
    assert_eq!(chain.0[0].id, "high");
    assert_eq!(chain.0[0].value, dec!(4));
    assert_eq!(chain.0[1].id, "low");
}
