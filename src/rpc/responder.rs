// src/rpc/responder.rs
//! The Responder facade bundles the rating, accounting and CDR engines
//! behind the RPC method surface. The same dispatch serves the TCP
//! transport and the HTTP `/jsonrpc` endpoint, and the in-process session
//! delegate calls the facade directly.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use super::types::{JsonRpcError, ERR_INVALID_PARAMS, ERR_METHOD_NOT_FOUND, ERR_SERVER};
use crate::accounts::AccountEngine;
use crate::cdrs::CdrEngine;
use crate::error::{EngineError, EngineResult};
use crate::models::{AttrExecuteAction, CallCost, CallDescriptor, CdrFilter, StoredCdr, OK};

pub struct Responder {
    accounts: Arc<AccountEngine>,
    cdrs: Arc<CdrEngine>,
}

impl Responder {
    pub fn new(accounts: Arc<AccountEngine>, cdrs: Arc<CdrEngine>) -> Self {
        Responder { accounts, cdrs }
    }

    pub async fn debit(&self, cd: &CallDescriptor) -> EngineResult<CallCost> {
        self.accounts.debit(cd).await
    }

    pub async fn get_cost(&self, cd: &CallDescriptor) -> EngineResult<CallCost> {
        self.accounts.rater().get_cost(cd).await
    }

    pub async fn get_max_session_time(&self, cd: &CallDescriptor) -> EngineResult<f64> {
        self.accounts.max_session_time(cd).await
    }

    /// Refund the unconsumed tail of the last debited slice: everything
    /// between now and the slice's paid-up end.
    pub async fn refund_increments(&self, cc: &mut CallCost) -> EngineResult<String> {
        let now = Utc::now();
        let refund_seconds = cc
            .timespans
            .last()
            .map(|ts| (ts.time_end - now).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);
        self.accounts.refund(cc, refund_seconds, now).await?;
        Ok(OK.to_string())
    }

    pub async fn execute_action(&self, attr: &AttrExecuteAction) -> EngineResult<String> {
        self.accounts.execute_actions(attr).await?;
        Ok(OK.to_string())
    }

    pub async fn process_cdr(&self, cdr: &StoredCdr) -> EngineResult<String> {
        self.cdrs.process_cdr(cdr).await
    }

    pub async fn get_cdrs(&self, filter: &CdrFilter) -> EngineResult<Vec<StoredCdr>> {
        self.cdrs.get_cdrs(filter).await
    }

    pub async fn count_cdrs(&self, filter: &CdrFilter) -> EngineResult<i64> {
        self.cdrs.count_cdrs(filter).await
    }
}

fn parse_param<T: serde::de::DeserializeOwned>(params: &[Value]) -> Result<T, JsonRpcError> {
    let param = params.first().cloned().unwrap_or(Value::Null);
    serde_json::from_value(param).map_err(|e| JsonRpcError {
        code: ERR_INVALID_PARAMS,
        message: format!("invalid params: {}", e),
    })
}

fn to_rpc_error(e: EngineError) -> JsonRpcError {
    JsonRpcError {
        code: ERR_SERVER,
        message: format!("{}: {}", e.error_code().to_uppercase(), e),
    }
}

fn serialize<T: serde::Serialize>(value: T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError {
        code: ERR_SERVER,
        message: format!("serialization: {}", e),
    })
}

/// Method dispatch shared by every transport.
pub async fn dispatch(
    responder: &Responder,
    method: &str,
    params: &[Value],
) -> Result<Value, JsonRpcError> {
    debug!("RPC dispatch: {}", method);
    match method {
        "Responder.Debit" => {
            let cd: CallDescriptor = parse_param(params)?;
            serialize(responder.debit(&cd).await.map_err(to_rpc_error)?)
        }
        "Responder.GetCost" => {
            let cd: CallDescriptor = parse_param(params)?;
            serialize(responder.get_cost(&cd).await.map_err(to_rpc_error)?)
        }
        "Responder.GetMaxSessionTime" => {
            let cd: CallDescriptor = parse_param(params)?;
            serialize(
                responder
                    .get_max_session_time(&cd)
                    .await
                    .map_err(to_rpc_error)?,
            )
        }
        "Responder.RefundIncrements" => {
            let mut cc: CallCost = parse_param(params)?;
            serialize(
                responder
                    .refund_increments(&mut cc)
                    .await
                    .map_err(to_rpc_error)?,
            )
        }
        "ApierV1.ExecuteAction" => {
            let attr: AttrExecuteAction = parse_param(params)?;
            serialize(responder.execute_action(&attr).await.map_err(to_rpc_error)?)
        }
        "ApierV2.GetCdrs" => {
            let filter: CdrFilter = parse_param(params)?;
            serialize(responder.get_cdrs(&filter).await.map_err(to_rpc_error)?)
        }
        "ApierV2.CountCdrs" => {
            let filter: CdrFilter = parse_param(params)?;
            serialize(responder.count_cdrs(&filter).await.map_err(to_rpc_error)?)
        }
        "CdrsV2.ProcessCdr" => {
            let cdr: StoredCdr = parse_param(params)?;
            serialize(responder.process_cdr(&cdr).await.map_err(to_rpc_error)?)
        }
        other => Err(JsonRpcError {
            code: ERR_METHOD_NOT_FOUND,
            message: format!("unknown method {}", other),
        }),
    }
}
