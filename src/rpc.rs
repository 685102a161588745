//! JSON-RPC ledger adapter
//!
//! [`RpcClient`] is a thin typed wrapper over the Ethereum JSON-RPC methods
//! the engine needs. [`RpcLedger`] binds configured contract names to
//! deployed addresses and ABIs and implements [`Ledger`] on top of it.

use crate::abi::ContractAbi;
use crate::ledger::{Ledger, LedgerError, LedgerResult, RawEvent};
use crate::types::{parse_address, parse_b256, parse_hex_u64, Block, Log, Receipt, TxHash};
use alloy_primitives::Address;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// JSON-RPC client for Ethereum nodes.
pub struct RpcClient {
    client: reqwest::Client,
    url: String,
}

fn hex_quantity(n: u64) -> String {
    format!("0x{:x}", n)
}

fn hex_data(data: &[u8]) -> String {
    format!("0x{}", hex::encode(data))
}

fn as_str<'a>(value: &'a Value, what: &str) -> LedgerResult<&'a str> {
    value
        .as_str()
        .ok_or_else(|| LedgerError::Decode(format!("{} is not a string: {}", what, value)))
}

impl RpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Make a JSON-RPC call.
    async fn call(&self, method: &str, params: Value) -> LedgerResult<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        let json: Value = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = json.get("error") {
            return Err(LedgerError::Rpc(format!("{}: {}", method, error)));
        }

        json.get("result")
            .cloned()
            .ok_or_else(|| LedgerError::Decode(format!("{} response missing 'result' field", method)))
    }

    /// Current chain height (`eth_blockNumber`).
    pub async fn block_number(&self) -> LedgerResult<u64> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(as_str(&result, "block number")?)
            .map_err(|e| LedgerError::Decode(format!("block number: {}", e)))
    }

    /// Block header with transaction hashes only.
    pub async fn get_block_by_number(&self, number: u64) -> LedgerResult<Block> {
        let result = self
            .call("eth_getBlockByNumber", json!([hex_quantity(number), false]))
            .await?;
        if result.is_null() {
            return Err(LedgerError::NotFound(format!("block {}", number)));
        }
        serde_json::from_value(result).map_err(|e| LedgerError::Decode(format!("block {}: {}", number, e)))
    }

    /// Logs emitted by `address` in `[from_block, to_block]`.
    pub async fn get_logs(&self, address: Address, from_block: u64, to_block: u64) -> LedgerResult<Vec<Log>> {
        let filter = json!({
            "address": format!("0x{:x}", address),
            "fromBlock": hex_quantity(from_block),
            "toBlock": hex_quantity(to_block),
        });
        let result = self.call("eth_getLogs", json!([filter])).await?;
        serde_json::from_value(result).map_err(|e| LedgerError::Decode(format!("logs: {}", e)))
    }

    /// Receipt for `hash`, or `None` while the transaction is unmined.
    pub async fn get_transaction_receipt(&self, hash: TxHash) -> LedgerResult<Option<Receipt>> {
        let result = self
            .call("eth_getTransactionReceipt", json!([format!("0x{:x}", hash)]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| LedgerError::Decode(format!("receipt {:?}: {}", hash, e)))
    }

    /// Read-only call against the latest state.
    pub async fn eth_call(&self, to: Address, data: &[u8]) -> LedgerResult<Vec<u8>> {
        let call = json!({ "to": format!("0x{:x}", to), "data": hex_data(data) });
        let result = self.call("eth_call", json!([call, "latest"])).await?;
        let s = as_str(&result, "call result")?;
        hex::decode(s.strip_prefix("0x").unwrap_or(s))
            .map_err(|e| LedgerError::Decode(format!("call result: {}", e)))
    }

    /// Submit a transaction signed by the node on behalf of `from`.
    pub async fn send_transaction(&self, from: Address, to: Address, data: &[u8]) -> LedgerResult<TxHash> {
        let tx = json!({
            "from": format!("0x{:x}", from),
            "to": format!("0x{:x}", to),
            "data": hex_data(data),
        });
        let result = self.call("eth_sendTransaction", json!([tx])).await?;
        parse_b256(as_str(&result, "transaction hash")?).map_err(LedgerError::Decode)
    }

    /// Accounts the node can sign for.
    pub async fn accounts(&self) -> LedgerResult<Vec<Address>> {
        let result = self.call("eth_accounts", json!([])).await?;
        let entries = result
            .as_array()
            .ok_or_else(|| LedgerError::Decode(format!("accounts is not an array: {}", result)))?;
        entries
            .iter()
            .map(|entry| parse_address(as_str(entry, "account")?).map_err(LedgerError::Decode))
            .collect()
    }
}

/// A named contract deployment.
#[derive(Debug, Clone)]
pub struct BoundContract {
    pub name: String,
    pub address: Address,
    pub abi: ContractAbi,
}

/// [`Ledger`] over an Ethereum JSON-RPC endpoint.
pub struct RpcLedger {
    rpc: RpcClient,
    contracts: BTreeMap<String, BoundContract>,
}

impl RpcLedger {
    pub fn new(rpc: RpcClient, contracts: Vec<BoundContract>) -> Self {
        let contracts = contracts
            .into_iter()
            .map(|contract| (contract.name.clone(), contract))
            .collect();
        Self { rpc, contracts }
    }

    fn contract(&self, name: &str) -> LedgerResult<&BoundContract> {
        self.contracts
            .get(name)
            .ok_or_else(|| LedgerError::UnknownContract(name.to_string()))
    }
}

/// Decode the logs one contract emitted, skipping pending logs and anything
/// its ABI does not describe.
///
/// A log whose signature is known but whose payload does not decode fails
/// the whole batch, so the caller retries the range instead of losing it.
fn decode_logs(contract: &BoundContract, logs: Vec<Log>) -> LedgerResult<Vec<RawEvent>> {
    let mut events = Vec::with_capacity(logs.len());
    for log in logs {
        let Some(transaction_hash) = log.transaction_hash else {
            debug!("Skipping pending {} log", contract.name);
            continue;
        };
        match contract.abi.decode_log(&log) {
            None => debug!(
                "Skipping {} log with unknown signature {:?}",
                contract.name,
                log.topics.first()
            ),
            Some(Err(e)) => {
                return Err(LedgerError::Decode(format!(
                    "{} log in {:?}: {}",
                    contract.name, transaction_hash, e
                )))
            }
            Some(Ok((event, args))) => events.push(RawEvent {
                event,
                args,
                transaction_hash,
                log_index: log.log_index.unwrap_or_default(),
            }),
        }
    }
    Ok(events)
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn current_height(&self) -> LedgerResult<u64> {
        self.rpc.block_number().await
    }

    async fn get_block(&self, number: u64) -> LedgerResult<Block> {
        self.rpc.get_block_by_number(number).await
    }

    async fn get_logs(&self, contract: &str, from_block: u64, to_block: u64) -> LedgerResult<Vec<RawEvent>> {
        let contract = self.contract(contract)?;
        let logs = self.rpc.get_logs(contract.address, from_block, to_block).await?;
        debug!(
            "{} emitted {} logs in {}..={}",
            contract.name,
            logs.len(),
            from_block,
            to_block
        );
        decode_logs(contract, logs)
    }

    async fn get_transaction_receipt(&self, hash: TxHash) -> LedgerResult<Option<Receipt>> {
        self.rpc.get_transaction_receipt(hash).await
    }

    async fn call_read(&self, contract: &str, method: &str, args: &[Value]) -> LedgerResult<Value> {
        let contract = self.contract(contract)?;
        let data = contract.abi.encode_call(method, args)?;
        let output = self.rpc.eth_call(contract.address, &data).await?;
        contract.abi.decode_output(method, &output)
    }

    async fn send_transaction(
        &self,
        contract: &str,
        method: &str,
        args: &[Value],
        signer: Address,
    ) -> LedgerResult<TxHash> {
        let contract = self.contract(contract)?;
        let data = contract.abi.encode_call(method, args)?;
        self.rpc.send_transaction(signer, contract.address, &data).await
    }

    async fn current_signing_identity(&self) -> LedgerResult<Option<Address>> {
        Ok(self.rpc.accounts().await?.first().copied())
    }

    fn contract_names(&self) -> Vec<String> {
        self.contracts.keys().cloned().collect()
    }
}
