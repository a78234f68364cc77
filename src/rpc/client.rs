// src/rpc/client.rs
//! TCP JSON-RPC client, used by the remote session delegate and by
//! integration tooling. One in-flight request per connection; calls are
//! serialised behind the stream lock.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::types::{JsonRpcRequest, JsonRpcResponse};
use crate::error::{EngineError, EngineResult};

pub struct RpcClient {
    stream: Mutex<BufReader<TcpStream>>,
    request_id: AtomicU64,
}

impl RpcClient {
    pub async fn connect(addr: &str) -> EngineResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| EngineError::StorageUnavailable(format!("connect {}: {}", addr, e)))?;
        Ok(RpcClient {
            stream: Mutex::new(BufReader::new(stream)),
            request_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// One JSON-RPC round trip. Known engine error markers in the reply
    /// are mapped back onto the local error taxonomy.
    pub async fn call<T, R>(&self, method: &str, params: T) -> EngineResult<R>
    where
        T: Serialize + std::fmt::Debug,
        R: DeserializeOwned,
    {
        let request_id = self.next_id();
        let request = JsonRpcRequest::new(
            method,
            vec![serde_json::to_value(params)?],
            request_id,
        );
        let mut wire = serde_json::to_string(&request)?;
        wire.push('\n');

        debug!("RPC request: method={}, id={}", method, request_id);

        let mut stream = self.stream.lock().await;
        stream
            .get_mut()
            .write_all(wire.as_bytes())
            .await
            .map_err(|e| EngineError::StorageUnavailable(format!("rpc write: {}", e)))?;

        let mut line = String::new();
        let bytes_read = stream
            .read_line(&mut line)
            .await
            .map_err(|e| EngineError::StorageUnavailable(format!("rpc read: {}", e)))?;
        drop(stream);
        if bytes_read == 0 {
            return Err(EngineError::StorageUnavailable(
                "rpc connection closed".to_string(),
            ));
        }

        let response: JsonRpcResponse<R> = serde_json::from_str(line.trim())?;
        if let Some(err) = response.error {
            let message = err.message.to_uppercase();
            if message.contains("INSUFFICIENT_CREDIT") {
                return Err(EngineError::InsufficientCredit {
                    required: String::new(),
                    available: String::new(),
                });
            }
            if message.contains("NOT_FOUND") {
                return Err(EngineError::NotFound(err.message));
            }
            if message.contains("DESTINATION_NOT_MATCHED") {
                return Err(EngineError::DestinationNotMatched(err.message));
            }
            return Err(EngineError::Internal(format!(
                "rpc error {}: {}",
                err.code, err.message
            )));
        }
        response
            .result
            .ok_or_else(|| EngineError::Internal("empty rpc response".to_string()))
    }
}
