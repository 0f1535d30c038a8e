//! Multi-endpoint JSON-RPC adapter built on alloy's HTTP provider

use super::retry::{retry_rotating, EndpointCursor, RetryPolicy};
use super::{ChainClient, LatestBlock, ReceiptSummary};
use crate::config::RpcConfig;
use crate::error::{Error, Result};
use alloy::dyn_abi::{DynSolType, DynSolValue};
use alloy::eips::BlockNumberOrTag;
use alloy::hex;
use alloy::network::{Ethereum, ReceiptResponse};
use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::TransactionRequest;
use alloy::transports::TransportError;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Node responses that no amount of retrying or rotating will change
const DETERMINISTIC_FAILURES: &[&str] = &[
    "execution reverted",
    "insufficient funds",
    "nonce too low",
    "replacement transaction underpriced",
    "intrinsic gas too low",
    "invalid sender",
];

struct Endpoint {
    url: String,
    provider: RootProvider<Ethereum>,
}

/// Rotating, retrying client over an ordered endpoint list
pub struct RpcAdapter {
    endpoints: Vec<Endpoint>,
    cursor: EndpointCursor,
    retry: RetryPolicy,
}

impl fmt::Debug for RpcAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcAdapter")
            .field("endpoints", &self.endpoints.len())
            .field("current", &self.cursor.current(self.endpoints.len()))
            .field("retry", &self.retry)
            .finish()
    }
}

impl RpcAdapter {
    /// Build providers for every configured endpoint. Unparseable URLs are
    /// skipped; an empty result is a configuration error.
    pub fn new(config: &RpcConfig) -> Result<Self> {
        let mut endpoints = Vec::new();
        for raw in config.urls() {
            match Url::parse(raw) {
                Ok(url) => endpoints.push(Endpoint {
                    url: raw.clone(),
                    provider: RootProvider::new_http(url),
                }),
                Err(e) => warn!(error = %e, "Skipping invalid RPC URL"),
            }
        }
        if endpoints.is_empty() {
            return Err(Error::Config("no valid RPC endpoints configured".to_string()));
        }
        info!(endpoints = endpoints.len(), "RPC adapter initialized");
        Ok(Self {
            endpoints,
            cursor: EndpointCursor::default(),
            retry: config.retry,
        })
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, call: F) -> Result<T>
    where
        F: Fn(RootProvider<Ethereum>) -> Fut,
        Fut: Future<Output = std::result::Result<T, TransportError>>,
    {
        retry_rotating(op, &self.cursor, self.endpoints.len(), &self.retry, |index| {
            call(self.endpoints[index].provider.clone())
        })
        .await
        .map_err(|e| Error::Rpc(format!("{} failed on all endpoints: {}", op, e)))
    }
}

fn is_deterministic(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    DETERMINISTIC_FAILURES.iter().any(|m| message.contains(m))
}

/// Split transport errors into "retry elsewhere" (outer `Err`) and final
/// node verdicts (inner `Err`).
fn classify<T>(
    result: std::result::Result<T, TransportError>,
) -> std::result::Result<std::result::Result<T, String>, TransportError> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(e) if is_deterministic(&e.to_string()) => Ok(Err(e.to_string())),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl ChainClient for RpcAdapter {
    async fn ensure_connection(&self) -> Result<String> {
        let len = self.endpoints.len();
        let start = self.cursor.current(len);
        let mut last_error = String::new();
        for offset in 0..len {
            let index = (start + offset) % len;
            let endpoint = &self.endpoints[index];
            match endpoint.provider.get_chain_id().await {
                Ok(chain_id) => {
                    self.cursor.set(index);
                    debug!(endpoint = index, chain_id, "RPC endpoint reachable");
                    return Ok(endpoint.url.clone());
                }
                Err(e) => {
                    warn!(endpoint = index, error = %e, "RPC endpoint unreachable");
                    last_error = e.to_string();
                }
            }
        }
        Err(Error::Rpc(format!(
            "no RPC endpoint reachable ({} tried): {}",
            len, last_error
        )))
    }

    fn current_endpoint(&self) -> String {
        self.endpoints[self.cursor.current(self.endpoints.len())]
            .url
            .clone()
    }

    async fn chain_id(&self) -> Result<u64> {
        self.with_retry("eth_chainId", |p| async move { p.get_chain_id().await })
            .await
    }

    async fn client_version(&self) -> Result<String> {
        self.with_retry("web3_clientVersion", |p| async move {
            p.get_client_version().await
        })
        .await
    }

    async fn get_nonce(&self, address: Address) -> Result<u64> {
        self.with_retry("eth_getTransactionCount", |p| async move {
            p.get_transaction_count(address).pending().await
        })
        .await
    }

    async fn get_block_latest(&self) -> Result<LatestBlock> {
        let block = self
            .with_retry("eth_getBlockByNumber", |p| async move {
                p.get_block_by_number(BlockNumberOrTag::Latest).await
            })
            .await?
            .ok_or_else(|| Error::Rpc("latest block unavailable".to_string()))?;
        Ok(LatestBlock {
            number: block.header.number,
            timestamp: block.header.timestamp,
            base_fee_per_gas: block.header.base_fee_per_gas.map(u128::from),
        })
    }

    async fn max_priority_fee(&self) -> Result<u128> {
        self.with_retry("eth_maxPriorityFeePerGas", |p| async move {
            p.get_max_priority_fee_per_gas().await
        })
        .await
    }

    async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64> {
        self.with_retry("eth_estimateGas", |p| {
            let tx = tx.clone();
            async move { classify(p.estimate_gas(tx).await) }
        })
        .await?
        .map_err(|msg| Error::Rpc(format!("gas estimation failed: {}", parse_revert_reason(&msg))))
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256> {
        let local_hash = keccak256(raw);
        let raw = raw.to_vec();
        self.with_retry("eth_sendRawTransaction", |p| {
            let raw = raw.clone();
            async move {
                match p.send_raw_transaction(&raw).await {
                    Ok(pending) => Ok(Ok(*pending.tx_hash())),
                    // an earlier attempt reached the node before timing out
                    Err(e) if e.to_string().to_ascii_lowercase().contains("already known") => {
                        Ok(Ok(local_hash))
                    }
                    Err(e) => classify::<B256>(Err(e)),
                }
            }
        })
        .await?
        .map_err(|msg| Error::Rpc(format!("broadcast rejected: {}", msg)))
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: B256,
        timeout: Duration,
    ) -> Result<Option<ReceiptSummary>> {
        let poll = async {
            loop {
                let receipt = self
                    .with_retry("eth_getTransactionReceipt", |p| async move {
                        p.get_transaction_receipt(tx_hash).await
                    })
                    .await?;
                if let Some(receipt) = receipt {
                    return Ok::<_, Error>(ReceiptSummary {
                        success: receipt.status(),
                        block_number: receipt.block_number(),
                        gas_used: receipt.gas_used(),
                    });
                }
                tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(receipt) => receipt.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn get_balance(&self, address: Address) -> Result<U256> {
        self.with_retry("eth_getBalance", |p| async move {
            p.get_balance(address).await
        })
        .await
    }

    async fn get_code(&self, address: Address) -> Result<Bytes> {
        self.with_retry("eth_getCode", |p| async move {
            p.get_code_at(address).await
        })
        .await
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let tx = TransactionRequest::default().to(to).input(data.into());
        self.with_retry("eth_call", |p| {
            let tx = tx.clone();
            async move { classify(p.call(tx).await) }
        })
        .await?
        .map_err(|msg| Error::Rpc(format!("call reverted: {}", parse_revert_reason(&msg))))
    }
}

/// Parse revert reason from RPC error message
pub fn parse_revert_reason(error: &str) -> String {
    if !error.contains("execution reverted") {
        return error.to_string();
    }
    if let Some(start) = error.find("revert: ") {
        let reason = &error[start + 8..];
        return match reason.find('"') {
            Some(end) => reason[..end].to_string(),
            None => reason.to_string(),
        };
    }
    if let Some(start) = error.find("0x") {
        let data = &error[start + 2..];
        let end = data
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(data.len());
        let data = &data[..end];
        if let Some(reason) = decode_error_string(data) {
            return reason;
        }
        if !data.is_empty() {
            return format!("Reverted with data: 0x{}", data);
        }
    }
    if let Some(start) = error.find("execution reverted: ") {
        return error[start + 20..].trim().to_string();
    }
    "execution reverted".to_string()
}

/// Decode `Error(string)` revert data (selector 0x08c379a0).
fn decode_error_string(hex_data: &str) -> Option<String> {
    let bytes = hex::decode(hex_data).ok()?;
    let payload = bytes.strip_prefix(&[0x08, 0xc3, 0x79, 0xa0][..])?;
    match DynSolType::String.abi_decode(payload).ok()? {
        DynSolValue::String(reason) => Some(reason),
        _ => None,
    }
}
