//! Chain access
//!
//! [`ChainClient`] is the seam every chain round-trip goes through. The
//! production implementation is [`RpcAdapter`], which rotates across several
//! JSON-RPC endpoints with bounded retries. Tests plug in an in-memory chain.

mod adapter;
mod retry;

pub use adapter::{parse_revert_reason, RpcAdapter};
pub use retry::{retry_rotating, EndpointCursor, RetryPolicy};

use crate::error::Result;
use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Fields of the latest block the fee model needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatestBlock {
    pub number: u64,
    pub timestamp: u64,
    /// `None` on pre-London chains
    pub base_fee_per_gas: Option<u128>,
}

/// Outcome of a mined transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReceiptSummary {
    pub success: bool,
    pub block_number: Option<u64>,
    pub gas_used: u64,
}

#[async_trait]
pub trait ChainClient: Send + Sync + fmt::Debug {
    /// Try endpoints in order until one answers; returns the endpoint in use.
    async fn ensure_connection(&self) -> Result<String>;

    /// Endpoint the next call will go to
    fn current_endpoint(&self) -> String;

    async fn chain_id(&self) -> Result<u64>;

    async fn client_version(&self) -> Result<String>;

    /// Pending transaction count for `address`
    async fn get_nonce(&self, address: Address) -> Result<u64>;

    async fn get_block_latest(&self) -> Result<LatestBlock>;

    async fn max_priority_fee(&self) -> Result<u128>;

    async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64>;

    /// Broadcast a signed EIP-2718 envelope.
    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256>;

    /// Poll for the receipt until `timeout`. `Ok(None)` means the deadline
    /// passed with no receipt.
    async fn wait_for_receipt(
        &self,
        tx_hash: B256,
        timeout: Duration,
    ) -> Result<Option<ReceiptSummary>>;

    async fn get_balance(&self, address: Address) -> Result<U256>;

    async fn get_code(&self, address: Address) -> Result<Bytes>;

    /// Read-only `eth_call` against the latest block.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes>;

    /// Call a zero-argument view function by its signature, e.g. `symbol()`.
    async fn call_contract_function(&self, to: Address, signature: &str) -> Result<Bytes> {
        self.call(to, Bytes::copy_from_slice(&selector(signature))).await
    }
}

/// First four bytes of the keccak hash of a function signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}
