// src/rpc/server.rs
//! Newline-framed JSON-RPC 2.0 over TCP: one request object per line, one
//! response object per line. Each connection gets its own task.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::responder::{dispatch, Responder};
use super::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, ERR_PARSE};
use crate::error::{EngineError, EngineResult};

pub struct RpcServer {
    responder: Arc<Responder>,
}

impl RpcServer {
    pub fn new(responder: Arc<Responder>) -> Self {
        RpcServer { responder }
    }

    /// Bind and start serving; returns the bound address and the accept
    /// loop's task handle.
    pub async fn listen(&self, addr: &str) -> EngineResult<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| EngineError::Internal(format!("bind {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        info!("🎧 JSON-RPC server listening on {}", local_addr);

        let responder = self.responder.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        info!("RPC connection accepted from {}", peer);
                        let responder = responder.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(socket, responder).await {
                                error!("Error handling RPC connection from {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept RPC connection: {}", e);
                    }
                }
            }
        });
        Ok((local_addr, handle))
    }
}

async fn handle_connection(
    socket: TcpStream,
    responder: Arc<Responder>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(socket);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JsonRpcRequest<serde_json::Value>>(trimmed)
        {
            Ok(request) => {
                match dispatch(&responder, &request.method, &request.params).await {
                    Ok(result) => JsonRpcResponse::result(result, request.id),
                    Err(error) => JsonRpcResponse::error(error, request.id),
                }
            }
            Err(e) => {
                warn!("Unparseable RPC request: {}", e);
                JsonRpcResponse::error(
                    JsonRpcError {
                        code: ERR_PARSE,
                        message: format!("parse error: {}", e),
                    },
                    0,
                )
            }
        };

        let mut wire = serde_json::to_string(&response).unwrap_or_else(|_| {
            r#"{"jsonrpc":"2.0","error":{"code":-32000,"message":"encode error"},"id":0}"#
                .to_string()
        });
        wire.push('\n');
        let socket = reader.get_mut();
        socket.write_all(wire.as_bytes()).await?;
    }

    info!("RPC connection closed");
    Ok(())
}
