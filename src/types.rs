//! Ethereum JSON-RPC types
//!
//! Type definitions for the blocks, logs, and receipts the ledger
//! adapter reads from a JSON-RPC endpoint.

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Deserializer};

/// Transaction identifier.
pub type TxHash = B256;

/// Block header with transaction hashes only (`eth_getBlockByNumber(n, false)`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Block {
    /// Block number (hex string in JSON, parsed to u64)
    #[serde(rename = "number", deserialize_with = "deserialize_hex_u64")]
    pub number: u64,

    /// Block hash (hex string in JSON)
    #[serde(rename = "hash", deserialize_with = "deserialize_hex_b256")]
    pub hash: B256,

    /// Hashes of the transactions included in the block, in block order
    #[serde(rename = "transactions", deserialize_with = "deserialize_hex_b256_vec")]
    pub transactions: Vec<TxHash>,
}

/// Log entry emitted by a contract during transaction execution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Log {
    /// Address of the contract that emitted the log
    #[serde(rename = "address", deserialize_with = "deserialize_hex_address")]
    pub address: Address,

    /// Indexed topics (topic0 = event signature, topics[1..] = indexed params)
    #[serde(rename = "topics", default)]
    pub topics: Vec<String>,

    /// Non-indexed event data (hex string)
    #[serde(rename = "data", deserialize_with = "deserialize_hex_bytes")]
    pub data: Vec<u8>,

    /// Hash of the transaction that emitted the log (null for pending logs)
    #[serde(rename = "transactionHash", default, deserialize_with = "deserialize_hex_b256_opt")]
    pub transaction_hash: Option<TxHash>,

    /// Position of the log within its block
    #[serde(rename = "logIndex", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub log_index: Option<u64>,
}

/// Transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Receipt {
    /// Transaction hash (hex string in JSON)
    #[serde(rename = "transactionHash", deserialize_with = "deserialize_hex_b256")]
    pub transaction_hash: TxHash,

    /// Block the transaction was included in
    #[serde(rename = "blockNumber", deserialize_with = "deserialize_hex_u64")]
    pub block_number: u64,

    /// Sender address
    #[serde(rename = "from", deserialize_with = "deserialize_hex_address")]
    pub from: Address,

    /// Transaction status: 1 = success, 0 = failure (absent before Byzantium)
    #[serde(rename = "status", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub status: Option<u64>,
}

impl Receipt {
    /// Check if the transaction succeeded.
    ///
    /// Receipts without a status field are treated as successful.
    pub fn is_success(&self) -> bool {
        self.status.map_or(true, |s| s == 1)
    }
}

// Hex deserialization helpers

/// Pad an odd-length hex string with a leading zero.
/// This handles cases where RPC returns hex strings without leading zeros.
fn pad_hex_string(s: &str) -> String {
    if s.len() % 2 == 1 {
        format!("0{}", s)
    } else {
        s.to_string()
    }
}

/// Parse a quantity such as `0x1b4` into a u64.
pub(crate) fn parse_hex_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(s, 16)
}

/// Parse a 32-byte hex word into a B256.
pub(crate) fn parse_b256(s: &str) -> Result<B256, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(pad_hex_string(s)).map_err(|e| e.to_string())?;
    if bytes.len() != 32 {
        return Err(format!("Expected 32 bytes for hash, got {}", bytes.len()));
    }
    Ok(B256::from_slice(&bytes))
}

/// Parse an address from a hex string (with or without 0x prefix).
pub(crate) fn parse_address(s: &str) -> Result<Address, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(pad_hex_string(s)).map_err(|e| e.to_string())?;
    if bytes.len() != 20 {
        return Err(format!(
            "Expected 20 bytes for address, got {}",
            bytes.len()
        ));
    }
    Ok(Address::from_slice(&bytes))
}

/// Deserialize a hex string to u64.
fn deserialize_hex_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_hex_u64(&s).map_err(serde::de::Error::custom)
}

/// Deserialize an optional hex string to u64.
fn deserialize_hex_u64_opt<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => parse_hex_u64(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Deserialize a hex string to B256.
fn deserialize_hex_b256<'de, D>(deserializer: D) -> Result<B256, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_b256(&s).map_err(serde::de::Error::custom)
}

/// Deserialize an optional hex string to B256.
fn deserialize_hex_b256_opt<'de, D>(deserializer: D) -> Result<Option<B256>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => parse_b256(&s).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Deserialize a list of hex strings to B256 values.
fn deserialize_hex_b256_vec<'de, D>(deserializer: D) -> Result<Vec<B256>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<String>::deserialize(deserializer)?
        .iter()
        .map(|s| parse_b256(s).map_err(serde::de::Error::custom))
        .collect()
}

/// Deserialize a hex string to Address.
fn deserialize_hex_address<'de, D>(deserializer: D) -> Result<Address, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_address(&s).map_err(serde::de::Error::custom)
}

/// Deserialize a hex string to bytes.
fn deserialize_hex_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let s = s.strip_prefix("0x").unwrap_or(&s);
    if s.is_empty() {
        Ok(Vec::new())
    } else {
        hex::decode(pad_hex_string(s)).map_err(serde::de::Error::custom)
    }
}
