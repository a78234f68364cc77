// src/rpc/mod.rs
mod client;
mod responder;
mod server;
mod types;

pub use client::RpcClient;
pub use responder::{dispatch, Responder};
pub use server::RpcServer;
pub use types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
