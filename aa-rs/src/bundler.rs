use crate::encoding::{
    fmt_address, fmt_h256, operation_from_json, parse_h256, parse_quantity_value, user_op_to_json,
};
use crate::error::{Error, RelayError, RpcError};
use crate::types::{GasEstimate, UserOperation};
use anyhow::anyhow;
use async_trait::async_trait;
use ethers::types::{Address, Log, H256, U256, U64};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// The bundler JSON-RPC surface the pipeline depends on.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<GasEstimate, RelayError>;

    async fn send_user_operation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<H256, RelayError>;

    /// `None` while the operation is still pending.
    async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<UserOperationReceipt>, RelayError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationReceipt {
    pub user_op_hash: H256,
    #[serde(default)]
    pub sender: Option<Address>,
    pub success: bool,
    #[serde(default)]
    pub actual_gas_cost: U256,
    #[serde(default)]
    pub actual_gas_used: U256,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub logs: Vec<Log>,
    pub receipt: SettlementReceipt,
}

/// The bundle transaction that carried the operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    pub transaction_hash: H256,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub logs: Vec<Log>,
}

impl UserOperationReceipt {
    /// Operation-scoped logs plus the bundle transaction's logs.
    pub fn all_logs(&self) -> impl Iterator<Item = &Log> {
        self.logs.iter().chain(self.receipt.logs.iter())
    }
}

/// `eth_getUserOperationByHash` result: the operation as the relay holds it, plus the
/// bundle coordinates once included.
#[derive(Debug, Clone, PartialEq)]
pub struct UserOperationLookup {
    pub user_operation: UserOperation,
    pub entry_point: Address,
    pub transaction_hash: Option<H256>,
    pub block_hash: Option<H256>,
    pub block_number: Option<U64>,
}

impl UserOperationLookup {
    pub fn is_included(&self) -> bool {
        self.transaction_hash.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReceiptPolling {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReceiptPolling {
    fn default() -> Self {
        Self {
            attempts: 40,
            interval: Duration::from_millis(1500),
        }
    }
}

/// Result of a bounded receipt wait. `Pending` is inconclusive, not a failure.
#[derive(Debug, Clone)]
pub enum ReceiptOutcome {
    Included(Box<UserOperationReceipt>),
    Pending { user_op_hash: H256, attempts: u32 },
}

impl ReceiptOutcome {
    pub fn into_result(self) -> Result<UserOperationReceipt, Error> {
        match self {
            ReceiptOutcome::Included(r) => Ok(*r),
            ReceiptOutcome::Pending {
                user_op_hash,
                attempts,
            } => Err(Error::ReceiptTimeout {
                hash: user_op_hash,
                attempts,
            }),
        }
    }
}

/// Polls `eth_getUserOperationReceipt` at a fixed interval, at most `polling.attempts` times.
pub async fn wait_for_receipt(
    relay: &dyn Relay,
    user_op_hash: H256,
    polling: ReceiptPolling,
) -> ReceiptOutcome {
    for attempt in 1..=polling.attempts {
        match relay.get_user_operation_receipt(user_op_hash).await {
            Ok(Some(r)) => return ReceiptOutcome::Included(Box::new(r)),
            Ok(None) => {}
            Err(e) => {
                // transient errors are common on free-tier bundlers; keep polling
                tracing::warn!(attempt, error = %e, "bundler receipt poll error");
            }
        }
        if attempt < polling.attempts {
            tokio::time::sleep(polling.interval).await;
        }
    }
    ReceiptOutcome::Pending {
        user_op_hash,
        attempts: polling.attempts,
    }
}

#[derive(Debug, Clone)]
pub struct BundlerClient {
    url: String,
    http: reqwest::Client,
}

impl BundlerClient {
    /// Every request made by this client is bounded by `timeout`.
    pub fn new(url: String, timeout: Duration) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Transport(e.into()))?;
        Ok(Self { url, http })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn supported_entry_points(&self) -> Result<Vec<Address>, RelayError> {
        let res = self
            .rpc("eth_supportedEntryPoints", serde_json::json!([]))
            .await?;
        serde_json::from_value(res.clone())
            .map_err(|_| RelayError::Malformed(format!("eth_supportedEntryPoints: {res}")))
    }

    /// `None` when the relay has never seen the hash or has dropped it.
    pub async fn get_user_operation_by_hash(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<UserOperationLookup>, RelayError> {
        let params = serde_json::json!([fmt_h256(user_op_hash)]);
        let res = self.rpc("eth_getUserOperationByHash", params).await?;
        if res.is_null() {
            return Ok(None);
        }
        parse_user_operation_lookup(&res).map(Some)
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, RelayError> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| RelayError::Transport(anyhow!(e).context(format!("POST {method}"))))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| RelayError::Transport(anyhow!(e).context("failed to decode JSON")))?;

        // Some relays answer JSON-RPC errors with a 4xx status; the error object wins.
        if let Some(err) = body.get("error") {
            let rpc: RpcError = serde_json::from_value(err.clone())
                .map_err(|_| RelayError::Malformed(format!("{method}: error object {err}")))?;
            return Err(rpc.into());
        }

        if !status.is_success() {
            return Err(RelayError::Transport(anyhow!("HTTP {status}: {body}")));
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| RelayError::Malformed(format!("{method}: missing result field")))
    }
}

#[async_trait]
impl Relay for BundlerClient {
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<GasEstimate, RelayError> {
        let params = serde_json::json!([user_op_to_json(op), fmt_address(entry_point)]);
        let res = self.rpc("eth_estimateUserOperationGas", params).await?;
        parse_gas_estimate(&res)
    }

    async fn send_user_operation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<H256, RelayError> {
        let params = serde_json::json!([user_op_to_json(op), fmt_address(entry_point)]);
        let res = self.rpc("eth_sendUserOperation", params).await?;
        parse_userop_hash(&res)
    }

    async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<UserOperationReceipt>, RelayError> {
        let params = serde_json::json!([fmt_h256(user_op_hash)]);
        let res = self.rpc("eth_getUserOperationReceipt", params).await?;
        if res.is_null() {
            return Ok(None);
        }
        serde_json::from_value(res)
            .map(Some)
            .map_err(|e| RelayError::Malformed(format!("eth_getUserOperationReceipt: {e}")))
    }
}

fn parse_u256_field(v: &Value, key: &'static str) -> Result<U256, RelayError> {
    let raw = v
        .get(key)
        .ok_or_else(|| RelayError::Malformed(format!("missing field {key}")))?;
    parse_quantity_value(key, raw).map_err(|e| RelayError::Malformed(e.to_string()))
}

fn parse_optional_u256_field(v: &Value, key: &'static str) -> Result<U256, RelayError> {
    match v.get(key) {
        None | Some(Value::Null) => Ok(U256::zero()),
        Some(_) => parse_u256_field(v, key),
    }
}

pub(crate) fn parse_gas_estimate(res: &Value) -> Result<GasEstimate, RelayError> {
    Ok(GasEstimate {
        pre_verification_gas: parse_u256_field(res, "preVerificationGas")?,
        verification_gas_limit: parse_u256_field(res, "verificationGasLimit")?,
        call_gas_limit: parse_u256_field(res, "callGasLimit")?,
        paymaster_verification_gas_limit: parse_optional_u256_field(
            res,
            "paymasterVerificationGasLimit",
        )?,
        paymaster_post_op_gas_limit: parse_optional_u256_field(res, "paymasterPostOpGasLimit")?,
    })
}

fn optional_h256(v: &Value, key: &'static str) -> Result<Option<H256>, RelayError> {
    match v.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => parse_h256(key, s)
            .map(Some)
            .map_err(|e| RelayError::Malformed(e.to_string())),
        Some(other) => Err(RelayError::Malformed(format!("{key}: {other}"))),
    }
}

fn parse_user_operation_lookup(res: &Value) -> Result<UserOperationLookup, RelayError> {
    let malformed = |e: crate::error::CodecError| {
        RelayError::Malformed(format!("eth_getUserOperationByHash: {e}"))
    };
    let op = res
        .get("userOperation")
        .ok_or_else(|| RelayError::Malformed("eth_getUserOperationByHash: missing userOperation".into()))?;
    let user_operation = operation_from_json(op)
        .and_then(|o| o.into_unpacked())
        .map_err(malformed)?;
    let entry_point = res
        .get("entryPoint")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::Malformed("eth_getUserOperationByHash: missing entryPoint".into()))
        .and_then(|s| crate::codec::decode_address("entryPoint", s).map_err(malformed))?;
    let block_number = match res.get("blockNumber") {
        None | Some(Value::Null) => None,
        Some(v) => Some(U64::from(
            parse_quantity_value("blockNumber", v).map_err(malformed)?.low_u64(),
        )),
    };

    Ok(UserOperationLookup {
        user_operation,
        entry_point,
        transaction_hash: optional_h256(res, "transactionHash")?,
        block_hash: optional_h256(res, "blockHash")?,
        block_number,
    })
}

fn parse_userop_hash(res: &Value) -> Result<H256, RelayError> {
    // Most bundlers return the userOpHash directly as a JSON string; some wrap it.
    let hash_str = if let Some(s) = res.as_str() {
        s
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOpHash").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOperationHash").and_then(|v| v.as_str()) {
        s
    } else {
        return Err(RelayError::Malformed(format!(
            "unexpected eth_sendUserOperation result shape (expected string or {{result: ...}}): {res}"
        )));
    };

    parse_h256("userOpHash", hash_str).map_err(|e| RelayError::Malformed(e.to_string()))
}
