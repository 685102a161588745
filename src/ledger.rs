//! Ledger connection capability
//!
//! The sync engine never talks to a node directly. Everything that crosses
//! the ledger boundary goes through [`Ledger`], so the engine can run against
//! the JSON-RPC adapter in [`crate::rpc`] or an in-memory ledger in tests.

use crate::types::{Block, Receipt, TxHash};
use alloy_primitives::Address;
use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised by a ledger connection.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("ABI error: {0}")]
    Abi(String),
    #[error("unknown contract: {0}")]
    UnknownContract(String),
    #[error("not found: {0}")]
    NotFound(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// A decoded event as returned by the ledger, before it is tagged with the
/// name of the contract that emitted it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    /// Event name from the contract ABI (e.g. `Transfer`)
    pub event: String,
    /// Decoded arguments keyed by ABI parameter name
    pub args: Map<String, Value>,
    /// Hash of the emitting transaction
    pub transaction_hash: TxHash,
    /// Position of the log within its block
    pub log_index: u64,
}

/// Already-initialized connection to the ledger.
///
/// Contract instances are addressed by their configured name; binding names
/// to deployed addresses and ABIs is the implementation's concern.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Current chain height.
    async fn current_height(&self) -> LedgerResult<u64>;

    /// Block header and transaction hashes for `number`.
    async fn get_block(&self, number: u64) -> LedgerResult<Block>;

    /// All events emitted by `contract` in `[from_block, to_block]`.
    async fn get_logs(
        &self,
        contract: &str,
        from_block: u64,
        to_block: u64,
    ) -> LedgerResult<Vec<RawEvent>>;

    /// Receipt for `hash`, or `None` if the node does not know it yet.
    async fn get_transaction_receipt(&self, hash: TxHash) -> LedgerResult<Option<Receipt>>;

    /// Invoke a read-only contract method.
    async fn call_read(&self, contract: &str, method: &str, args: &[Value]) -> LedgerResult<Value>;

    /// Submit a state-changing contract call signed by `signer`.
    async fn send_transaction(
        &self,
        contract: &str,
        method: &str,
        args: &[Value],
        signer: Address,
    ) -> LedgerResult<TxHash>;

    /// Identity currently selected for signing, if any.
    async fn current_signing_identity(&self) -> LedgerResult<Option<Address>>;

    /// Names of the contract instances this ledger can read events from.
    fn contract_names(&self) -> Vec<String>;
}
