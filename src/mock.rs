//! In-memory ledger for tests.

use crate::ledger::{Ledger, LedgerError, LedgerResult, RawEvent};
use crate::model::ModelDefinition;
use crate::types::{Block, Receipt, TxHash};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// Deterministic transaction hash for test fixtures.
pub fn tx_hash(n: u64) -> TxHash {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&n.to_be_bytes());
    B256::from(bytes)
}

/// Deterministic address for test fixtures.
pub fn addr(byte: u8) -> Address {
    Address::from_slice(&[byte; 20])
}

/// `Widget` objects live in `Factory`; `Factory.Created` announces them and
/// `Registry.Updated` / `Registry.Touched` signal changes.
pub fn widget_definition() -> ModelDefinition {
    serde_json::from_value(json!({
        "name": "Widget",
        "primaryKey": "id",
        "primaryContract": "Factory",
        "properties": {
            "id": { "type": "integer" },
            "owner": { "type": "address", "getter": "ownerOf", "setter": "setOwner" },
            "level": { "type": "integer", "getter": "levelOf" }
        },
        "events": {
            "Factory": {
                "Created": { "indicatesCreation": true, "indexField": "id" }
            },
            "Registry": {
                "Updated": { "indicatesUpdate": true, "indexField": "id" },
                "Touched": { "indicatesUpdate": true }
            }
        },
        "actions": {
            "burn": { "method": "burn", "title": "Burn widget" }
        },
        "constructor": { "method": "mint", "title": "Mint widget" },
        "enumerators": {
            "all": { "method": "totalSupply", "parameters": [] }
        },
        "defaultEnumerator": "all"
    }))
    .unwrap()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentTx {
    pub contract: String,
    pub method: String,
    pub args: Vec<Value>,
    pub signer: Address,
    pub hash: TxHash,
}

#[derive(Default)]
struct MockState {
    height: u64,
    scripted_heights: VecDeque<u64>,
    height_fails: bool,
    blocks: HashMap<u64, Vec<TxHash>>,
    logs: HashMap<(String, u64), Vec<RawEvent>>,
    failing_logs: HashSet<String>,
    receipts: HashMap<TxHash, Receipt>,
    receipts_fail: bool,
    failing_reads: HashSet<String>,
    reads: HashMap<(String, String, String), Value>,
    read_calls: usize,
    sent: Vec<SentTx>,
    identity: Option<Address>,
    next_tx: u64,
}

pub struct MockLedger {
    contracts: Vec<String>,
    state: Mutex<MockState>,
}

impl MockLedger {
    pub fn new(contracts: &[&str]) -> Self {
        Self {
            contracts: contracts.iter().map(|c| c.to_string()).collect(),
            state: Mutex::new(MockState {
                next_tx: 0x1000,
                ..MockState::default()
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_height(&self, height: u64) {
        self.with(|s| s.height = height);
    }

    /// Queue height responses returned ahead of the steady `height`.
    pub fn script_heights(&self, heights: &[u64]) {
        self.with(|s| s.scripted_heights.extend(heights.iter().copied()));
    }

    pub fn fail_height(&self, fail: bool) {
        self.with(|s| s.height_fails = fail);
    }

    /// Make `number` known with the given transactions and raise the height to it.
    pub fn add_block(&self, number: u64, transactions: &[TxHash]) {
        self.with(|s| {
            s.blocks
                .entry(number)
                .or_default()
                .extend(transactions.iter().copied());
            s.height = s.height.max(number);
        });
    }

    pub fn add_event(&self, contract: &str, block: u64, event: &str, args: Value, tx: TxHash) {
        self.with(|s| {
            let entry = s.logs.entry((contract.to_string(), block)).or_default();
            let log_index = entry.len() as u64;
            entry.push(RawEvent {
                event: event.to_string(),
                args: args.as_object().cloned().unwrap_or_default(),
                transaction_hash: tx,
                log_index,
            });
        });
    }

    pub fn fail_logs(&self, contract: &str) {
        self.with(|s| s.failing_logs.insert(contract.to_string()));
    }

    pub fn heal_logs(&self, contract: &str) {
        self.with(|s| s.failing_logs.remove(contract));
    }

    pub fn add_receipt(&self, hash: TxHash, block_number: u64) {
        let receipt = Receipt {
            transaction_hash: hash,
            block_number,
            from: addr(0x11),
            status: Some(1),
        };
        self.with(|s| s.receipts.insert(hash, receipt));
    }

    pub fn fail_receipts(&self, fail: bool) {
        self.with(|s| s.receipts_fail = fail);
    }

    /// Make every read of `method` fail until healed.
    pub fn fail_reads(&self, method: &str) {
        self.with(|s| s.failing_reads.insert(method.to_string()));
    }

    pub fn heal_reads(&self, method: &str) {
        self.with(|s| s.failing_reads.remove(method));
    }

    pub fn set_read(&self, contract: &str, method: &str, args: &[Value], value: Value) {
        let key = (contract.to_string(), method.to_string(), Value::from(args.to_vec()).to_string());
        self.with(|s| s.reads.insert(key, value));
    }

    pub fn read_calls(&self) -> usize {
        self.with(|s| s.read_calls)
    }

    pub fn set_identity(&self, identity: Option<Address>) {
        self.with(|s| s.identity = identity);
    }

    pub fn sent(&self) -> Vec<SentTx> {
        self.with(|s| s.sent.clone())
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn current_height(&self) -> LedgerResult<u64> {
        self.with(|s| {
            if s.height_fails {
                return Err(LedgerError::Rpc("height unavailable".into()));
            }
            Ok(s.scripted_heights.pop_front().unwrap_or(s.height))
        })
    }

    async fn get_block(&self, number: u64) -> LedgerResult<Block> {
        self.with(|s| {
            let transactions = s.blocks.get(&number).cloned().unwrap_or_default();
            Ok(Block {
                number,
                hash: tx_hash(number),
                transactions,
            })
        })
    }

    async fn get_logs(&self, contract: &str, from_block: u64, to_block: u64) -> LedgerResult<Vec<RawEvent>> {
        self.with(|s| {
            if s.failing_logs.contains(contract) {
                return Err(LedgerError::Rpc(format!("logs unavailable for {}", contract)));
            }
            Ok((from_block..=to_block)
                .flat_map(|b| {
                    s.logs
                        .get(&(contract.to_string(), b))
                        .cloned()
                        .unwrap_or_default()
                })
                .collect())
        })
    }

    async fn get_transaction_receipt(&self, hash: TxHash) -> LedgerResult<Option<Receipt>> {
        self.with(|s| {
            if s.receipts_fail {
                return Err(LedgerError::Rpc("receipts unavailable".into()));
            }
            Ok(s.receipts.get(&hash).cloned())
        })
    }

    async fn call_read(&self, contract: &str, method: &str, args: &[Value]) -> LedgerResult<Value> {
        let key = (contract.to_string(), method.to_string(), Value::from(args.to_vec()).to_string());
        self.with(|s| {
            s.read_calls += 1;
            if s.failing_reads.contains(method) {
                return Err(LedgerError::Rpc(format!("{}.{} unavailable", contract, method)));
            }
            s.reads
                .get(&key)
                .cloned()
                .ok_or_else(|| LedgerError::NotFound(format!("{}.{}{}", key.0, key.1, key.2)))
        })
    }

    async fn send_transaction(
        &self,
        contract: &str,
        method: &str,
        args: &[Value],
        signer: Address,
    ) -> LedgerResult<TxHash> {
        self.with(|s| {
            s.next_tx += 1;
            let hash = tx_hash(s.next_tx);
            s.sent.push(SentTx {
                contract: contract.to_string(),
                method: method.to_string(),
                args: args.to_vec(),
                signer,
                hash,
            });
            Ok(hash)
        })
    }

    async fn current_signing_identity(&self) -> LedgerResult<Option<Address>> {
        self.with(|s| Ok(s.identity))
    }

    fn contract_names(&self) -> Vec<String> {
        self.contracts.clone()
    }
}
