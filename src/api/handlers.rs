// src/api/handlers.rs
use std::sync::Arc;

use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::Value;

use crate::rpc::{dispatch, JsonRpcRequest, JsonRpcResponse, Responder};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy".to_string(),
        service: "apolo-rating-engine".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// The same JSON-RPC dispatch as the TCP transport, for clients that speak
/// HTTP (`POST /jsonrpc`).
pub async fn jsonrpc(
    request: web::Json<JsonRpcRequest<Value>>,
    responder: web::Data<Arc<Responder>>,
) -> HttpResponse {
    let request = request.into_inner();
    let response = match dispatch(&responder, &request.method, &request.params).await {
        Ok(result) => JsonRpcResponse::result(result, request.id),
        Err(error) => JsonRpcResponse::error(error, request.id),
    };
    HttpResponse::Ok().json(response)
}
