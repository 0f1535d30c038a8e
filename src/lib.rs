//! Agent Vault
//!
//! Custodial wallet control plane for autonomous agents:
//! - Encrypted key custody, signing and native transfers per agent
//! - Recurring payment strategies with gas and daily spend guards
//! - Per-tool rate limiting and an audit trail of every invocation
//!
//! # Security Model
//!
//! - Keys are encrypted at rest and decrypted only for one signing operation
//! - Every tool call passes through the policy engine
//! - Secrets are redacted before anything is logged or audited

pub mod clock;
pub mod config;
pub mod context;
pub mod policy;
pub mod rpc;
pub mod store;
pub mod strategy;
pub mod tools;
pub mod units;
pub mod wallet;

mod error;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::{AppConfig, RpcConfig, TransferGuard};
pub use context::AppContext;
pub use error::{Error, Result, WalletError};
pub use policy::{PolicyConfig, PolicyEngine, RateLimitRule};
pub use store::{Store, TenantId};
pub use strategy::{StrategyEngine, StrategyScheduler, TickOutcome, TickReport};
pub use tools::Tools;
pub use wallet::WalletManager;
