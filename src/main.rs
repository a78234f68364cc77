// src/main.rs
use std::process::ExitCode;
use std::sync::Arc;

use actix_web::{middleware, web, App, HttpServer};
use clap::Parser;
use tracing::{error, info};

use apolo_rating_engine::accounts::AccountEngine;
use apolo_rating_engine::api;
use apolo_rating_engine::cdrs::CdrEngine;
use apolo_rating_engine::config::{CliArgs, Config};
use apolo_rating_engine::error::EngineError;
use apolo_rating_engine::loader::{CsvSource, TpReader};
use apolo_rating_engine::rating::Rater;
use apolo_rating_engine::rpc::{Responder, RpcServer};
use apolo_rating_engine::scheduler::Scheduler;
use apolo_rating_engine::storage::{
    AccountingStorage, CdrStorage, MapStorage, RatingStorage, RedisStorage,
};

#[actix_web::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    info!("🚀 Starting Apolo Rating Engine (Rust)");

    let config = match Config::from_env() {
        Ok(config) => config.merge_args(CliArgs::parse()),
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::from(1);
        }
    };
    info!("Environment: {}", config.environment);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(Fatal::Init(e)) => {
            error!("Fatal during initialization: {}", e);
            ExitCode::from(1)
        }
        Err(Fatal::Runtime(e)) => {
            error!("Fatal at runtime: {}", e);
            ExitCode::from(2)
        }
    }
}

enum Fatal {
    Init(EngineError),
    Runtime(EngineError),
}

async fn run(config: Config) -> Result<(), Fatal> {
    // Storage backends: Redis when configured, in-memory otherwise. CDRs
    // always live in the in-memory store (warehousing is external).
    let memory = Arc::new(MapStorage::new());
    let (rating_store, accounting_store): (Arc<dyn RatingStorage>, Arc<dyn AccountingStorage>) =
        match &config.redis_url {
            Some(url) => {
                let redis = Arc::new(
                    RedisStorage::new(url)
                        .await
                        .map_err(Fatal::Init)?,
                );
                info!("✅ Redis backend connected");
                (redis.clone(), redis)
            }
            None => {
                info!("Using in-memory storage backend");
                (memory.clone(), memory.clone())
            }
        };
    let cdr_store: Arc<dyn CdrStorage> = memory.clone();

    // Core engines
    let rater = Arc::new(Rater::new(rating_store.clone()));
    let accounts = Arc::new(AccountEngine::new(
        accounting_store.clone(),
        rating_store.clone(),
        rater.clone(),
    ));
    let cdr_engine = Arc::new(CdrEngine::new(cdr_store, rater.clone()));
    let responder = Arc::new(Responder::new(accounts.clone(), cdr_engine));

    // Tariff data
    if let Some(dir) = &config.data_dir {
        let source = CsvSource::from_dir(dir).map_err(Fatal::Init)?;
        let reader = TpReader::new(rating_store.clone(), accounting_store.clone(), source);
        reader.load_all().await.map_err(Fatal::Init)?;
    }

    // Scheduler
    let scheduler = Arc::new(Scheduler::new(
        accounts.clone(),
        accounting_store.clone(),
        rating_store.clone(),
    ));
    scheduler.load_action_plans().await.map_err(Fatal::Init)?;
    tokio::spawn(scheduler.clone().run());

    // JSON-RPC over TCP
    let rpc_server = RpcServer::new(responder.clone());
    rpc_server
        .listen(&config.rpc_listen)
        .await
        .map_err(Fatal::Init)?;

    // Admin HTTP surface
    info!("🌐 Starting HTTP server on {}", config.http_listen);
    let http_responder = responder.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .wrap(tracing_actix_web::TracingLogger::default())
            .app_data(web::Data::new(http_responder.clone()))
            .configure(api::routes::configure)
    })
    .bind(&config.http_listen)
    .map_err(|e| Fatal::Init(EngineError::Internal(e.to_string())))?
    .run()
    .await
    .map_err(|e| Fatal::Runtime(EngineError::Internal(e.to_string())))?;

    scheduler.stop();
    Ok(())
}
