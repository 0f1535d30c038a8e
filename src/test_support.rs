//! In-memory chain and clock for tests

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::rpc::{selector, ChainClient, LatestBlock, ReceiptSummary};
use alloy::consensus::transaction::SignerRecoverable;
use alloy::consensus::{Transaction, TxEnvelope};
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptMode {
    Success,
    Revert,
    /// The receipt never shows up
    Never,
}

#[derive(Debug)]
struct ChainState {
    base_fee: u128,
    priority_fee: u128,
    block_number: u64,
    balances: HashMap<Address, U256>,
    nonces: HashMap<Address, u64>,
    sent: Vec<(Address, u64, B256)>,
    code: HashMap<Address, Bytes>,
    calls: HashMap<(Address, [u8; 4]), Bytes>,
    receipt_mode: ReceiptMode,
}

/// A single-node chain that accepts signed EIP-1559 transfers, tracks
/// pending nonces and balances, and mines instantly.
#[derive(Debug)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub const CHAIN_ID: u64 = 11_155_111;

    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState {
                base_fee: 1_000_000_000,
                priority_fee: 1_000_000_000,
                block_number: 1,
                balances: HashMap::new(),
                nonces: HashMap::new(),
                sent: Vec::new(),
                code: HashMap::new(),
                calls: HashMap::new(),
                receipt_mode: ReceiptMode::Success,
            }),
        }
    }

    pub fn with_base_fee(self, wei: u128) -> Self {
        self.set_base_fee(wei);
        self
    }

    pub fn with_balance(self, address: Address, wei: U256) -> Self {
        self.set_balance(address, wei);
        self
    }

    pub fn set_base_fee(&self, wei: u128) {
        self.state.lock().unwrap().base_fee = wei;
    }

    pub fn priority_fee(&self) -> u128 {
        self.state.lock().unwrap().priority_fee
    }

    pub fn set_balance(&self, address: Address, wei: U256) {
        self.state.lock().unwrap().balances.insert(address, wei);
    }

    pub fn balance(&self, address: Address) -> U256 {
        self.state
            .lock()
            .unwrap()
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.state.lock().unwrap().nonces.insert(address, nonce);
    }

    pub fn set_receipt_mode(&self, mode: ReceiptMode) {
        self.state.lock().unwrap().receipt_mode = mode;
    }

    pub fn set_code(&self, address: Address, code: Bytes) {
        self.state.lock().unwrap().code.insert(address, code);
    }

    pub fn set_call_result(&self, address: Address, signature: &str, result: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .calls
            .insert((address, selector(signature)), Bytes::from(result));
    }

    /// Nonces of every transaction broadcast from `address`, in arrival order
    pub fn broadcast_nonces(&self, address: Address) -> Vec<u64> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(from, _, _)| *from == address)
            .map(|(_, nonce, _)| *nonce)
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().unwrap().sent.len()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn ensure_connection(&self) -> Result<String> {
        Ok(self.current_endpoint())
    }

    fn current_endpoint(&self) -> String {
        "mock://chain".to_string()
    }

    async fn chain_id(&self) -> Result<u64> {
        Ok(Self::CHAIN_ID)
    }

    async fn client_version(&self) -> Result<String> {
        Ok("mock/v1".to_string())
    }

    async fn get_nonce(&self, address: Address) -> Result<u64> {
        // give concurrent senders a chance to interleave
        tokio::task::yield_now().await;
        Ok(self.state.lock().unwrap().nonces.get(&address).copied().unwrap_or(0))
    }

    async fn get_block_latest(&self) -> Result<LatestBlock> {
        let state = self.state.lock().unwrap();
        Ok(LatestBlock {
            number: state.block_number,
            timestamp: 1_700_000_000 + state.block_number * 12,
            base_fee_per_gas: Some(state.base_fee),
        })
    }

    async fn max_priority_fee(&self) -> Result<u128> {
        Ok(self.priority_fee())
    }

    async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64> {
        tokio::task::yield_now().await;
        let value = tx.value.unwrap_or_default();
        if let Some(from) = tx.from {
            if self.balance(from) < value {
                return Err(Error::Rpc("insufficient funds for transfer".to_string()));
            }
        }
        Ok(21_000)
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256> {
        let envelope = TxEnvelope::decode_2718(&mut &raw[..])
            .map_err(|e| Error::Rpc(format!("invalid transaction: {}", e)))?;
        let from = envelope
            .recover_signer()
            .map_err(|e| Error::Rpc(format!("invalid sender: {}", e)))?;
        let hash = *envelope.tx_hash();

        let mut state = self.state.lock().unwrap();
        let expected = state.nonces.get(&from).copied().unwrap_or(0);
        if envelope.nonce() != expected {
            return Err(Error::Rpc(format!(
                "nonce mismatch: expected {}, got {}",
                expected,
                envelope.nonce()
            )));
        }
        let cost = envelope.value()
            + U256::from(envelope.gas_limit()) * U256::from(envelope.max_fee_per_gas());
        let balance = state.balances.get(&from).copied().unwrap_or_default();
        if balance < cost {
            return Err(Error::Rpc("insufficient funds for gas * price + value".to_string()));
        }
        state.balances.insert(from, balance - cost);
        if let Some(to) = envelope.to() {
            *state.balances.entry(to).or_default() += envelope.value();
        }
        state.nonces.insert(from, expected + 1);
        state.sent.push((from, expected, hash));
        state.block_number += 1;
        Ok(hash)
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: B256,
        _timeout: Duration,
    ) -> Result<Option<ReceiptSummary>> {
        let state = self.state.lock().unwrap();
        if !state.sent.iter().any(|(_, _, hash)| *hash == tx_hash) {
            return Ok(None);
        }
        Ok(match state.receipt_mode {
            ReceiptMode::Never => None,
            mode => Some(ReceiptSummary {
                success: mode == ReceiptMode::Success,
                block_number: Some(state.block_number),
                gas_used: 21_000,
            }),
        })
    }

    async fn get_balance(&self, address: Address) -> Result<U256> {
        Ok(self.balance(address))
    }

    async fn get_code(&self, address: Address) -> Result<Bytes> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .code
            .get(&address)
            .cloned()
            .unwrap_or_default())
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let key: [u8; 4] = data
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| Error::Rpc("execution reverted".to_string()))?;
        self.state
            .lock()
            .unwrap()
            .calls
            .get(&(to, key))
            .cloned()
            .ok_or_else(|| Error::Rpc("execution reverted".to_string()))
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
