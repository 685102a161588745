//! Configuration loading
//!
//! Reads the JSON config file naming the ledger endpoint, the contracts to
//! bind, and the object models to keep in sync.
//!
//! # Example file format:
//! ```json
//! {
//!   "systemName": "Widgets",
//!   "chain": { "rpcUrl": "http://127.0.0.1:8545", "pollingIntervalMs": 1000 },
//!   "contracts": [
//!     { "name": "Factory", "address": "0x5FbDB2315678afecb367f032d93F642f64180aa3", "abi": "abi/Factory.json" }
//!   ],
//!   "models": []
//! }
//! ```

use crate::abi::ContractAbi;
use crate::engine::EngineConfig;
use crate::model::{CompiledModel, ModelDefinition};
use crate::registry::UnhookedWatchPolicy;
use crate::rpc::BoundContract;
use crate::types::parse_address;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_system_name() -> String {
    "Windlass".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub polling_interval_ms: u64,
    pub max_catchup_blocks: u64,
    pub unhooked_watches: UnhookedWatchPolicy,
    /// Objects enumerated per model at startup
    pub backfill_limit: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            polling_interval_ms: 1000,
            max_catchup_blocks: 32,
            unhooked_watches: UnhookedWatchPolicy::default(),
            backfill_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractConfig {
    pub name: String,
    pub address: String,
    /// ABI file, relative to the config file
    pub abi: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default = "default_system_name")]
    system_name: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    chain: ChainConfig,
    contracts: Vec<ContractConfig>,
    #[serde(default)]
    models: Vec<ModelDefinition>,
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct WindlassConfig {
    pub system_name: String,
    pub log_level: String,
    pub chain: ChainConfig,
    pub contracts: Vec<ContractConfig>,
    pub models: Vec<CompiledModel>,
    /// Directory relative ABI paths are resolved against
    pub base_dir: PathBuf,
}

impl WindlassConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            system_name: self.system_name.clone(),
            poll_interval: Duration::from_millis(self.chain.polling_interval_ms),
            max_catchup_blocks: self.chain.max_catchup_blocks,
            unhooked_watches: self.chain.unhooked_watches,
        }
    }

    /// Load every contract's ABI and parse its address.
    pub fn bind_contracts(&self) -> Result<Vec<BoundContract>> {
        self.contracts
            .iter()
            .map(|contract| {
                let address = parse_address(&contract.address)
                    .map_err(|e| anyhow!(e))
                    .with_context(|| format!("Invalid address for contract {}", contract.name))?;
                let abi = load_contract_abi(&self.base_dir.join(&contract.abi))
                    .with_context(|| format!("Failed to load ABI for contract {}", contract.name))?;
                Ok(BoundContract {
                    name: contract.name.clone(),
                    address,
                    abi,
                })
            })
            .collect()
    }
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> Result<WindlassConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    let raw: RawConfig = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    if raw.contracts.is_empty() {
        anyhow::bail!("Config lists no contracts");
    }
    if raw.chain.polling_interval_ms == 0 {
        anyhow::bail!("pollingIntervalMs must be positive");
    }

    let models = raw
        .models
        .into_iter()
        .map(|definition| {
            let name = definition.name.clone();
            CompiledModel::compile(definition).with_context(|| format!("Invalid model {}", name))
        })
        .collect::<Result<Vec<_>>>()?;

    for model in &models {
        let primary = &model.definition.primary_contract;
        if !raw.contracts.iter().any(|c| c.name == *primary) {
            anyhow::bail!(
                "Model {} uses primary contract {}, which is not configured",
                model.name(),
                primary
            );
        }
    }

    Ok(WindlassConfig {
        system_name: raw.system_name,
        log_level: raw.log_level,
        chain: raw.chain,
        contracts: raw.contracts,
        models,
        base_dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
    })
}

/// Load a contract ABI from a bare ABI array or a build artifact.
pub fn load_contract_abi(path: &Path) -> Result<ContractAbi> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read ABI file: {:?}", path))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse ABI file: {:?}", path))?;
    ContractAbi::from_json(value).with_context(|| format!("Invalid ABI in {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn write_json(dir: &Path, name: &str, value: &Value) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, serde_json::to_string_pretty(value).unwrap()).unwrap();
        path
    }

    fn abi() -> Value {
        json!([{
            "type": "function",
            "name": "ownerOf",
            "inputs": [{ "name": "id", "type": "uint256" }],
            "outputs": [{ "name": "", "type": "address" }],
            "stateMutability": "view"
        }])
    }

    fn model() -> Value {
        json!({
            "name": "Widget",
            "primaryKey": "id",
            "primaryContract": "Factory",
            "properties": {
                "id": { "type": "integer" },
                "owner": { "type": "address", "getter": "ownerOf" }
            },
            "events": {
                "Factory": { "Created": { "indicatesCreation": true, "indexField": "id" } }
            }
        })
    }

    #[test]
    fn test_load_config_with_defaults() {
        let dir = tempdir().unwrap();
        write_json(dir.path(), "Factory.json", &json!({ "abi": abi() }));
        let path = write_json(
            dir.path(),
            "windlass.json",
            &json!({
                "contracts": [{
                    "name": "Factory",
                    "address": "0x0742d35Cc6634C0532925a3b844Bc9e7595f0bEb",
                    "abi": "Factory.json"
                }],
                "models": [model()]
            }),
        );

        let config = load_config(&path).unwrap();
        assert_eq!(config.system_name, "Windlass");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.chain.rpc_url, "http://127.0.0.1:8545");
        assert_eq!(config.chain.backfill_limit, 100);
        assert_eq!(config.models.len(), 1);
        assert_eq!(config.models[0].creation_hooks.len(), 1);

        let engine = config.engine_config();
        assert_eq!(engine.poll_interval, Duration::from_millis(1000));
        assert_eq!(engine.unhooked_watches, UnhookedWatchPolicy::AlwaysUpdate);

        let contracts = config.bind_contracts().unwrap();
        assert_eq!(contracts[0].name, "Factory");
        assert!(contracts[0].abi.has_function("ownerOf"));
    }

    #[test]
    fn test_chain_overrides() {
        let dir = tempdir().unwrap();
        let path = write_json(
            dir.path(),
            "windlass.json",
            &json!({
                "systemName": "Widgets",
                "chain": {
                    "pollingIntervalMs": 250,
                    "unhookedWatches": "reject",
                    "maxCatchupBlocks": 4
                },
                "contracts": [{ "name": "Factory", "address": "0x00", "abi": "missing.json" }]
            }),
        );

        let config = load_config(&path).unwrap();
        assert_eq!(config.system_name, "Widgets");
        assert_eq!(config.chain.polling_interval_ms, 250);
        assert_eq!(config.chain.max_catchup_blocks, 4);
        assert_eq!(config.chain.unhooked_watches, UnhookedWatchPolicy::Reject);
        assert_eq!(config.chain.rpc_url, "http://127.0.0.1:8545");

        // the address and ABI are only checked when contracts are bound
        assert!(config.bind_contracts().is_err());
    }

    #[test]
    fn test_empty_contracts_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", json!({ "contracts": [] })).unwrap();
        file.flush().unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_invalid_model_names_model() {
        let mut bad = model();
        bad["events"]["Factory"]["Created"] = json!({ "indicatesCreation": true });
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "{}",
            json!({
                "contracts": [{ "name": "Factory", "address": "0x00", "abi": "a.json" }],
                "models": [bad]
            })
        )
        .unwrap();
        file.flush().unwrap();

        let err = load_config(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("Widget"));
    }

    #[test]
    fn test_model_with_unknown_primary_contract() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "{}",
            json!({
                "contracts": [{ "name": "Registry", "address": "0x00", "abi": "a.json" }],
                "models": [model()]
            })
        )
        .unwrap();
        file.flush().unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_load_bare_abi_array() {
        let dir = tempdir().unwrap();
        let path = write_json(dir.path(), "Bare.json", &abi());
        assert!(load_contract_abi(&path).unwrap().has_function("ownerOf"));
        assert!(load_contract_abi(&dir.path().join("nope.json")).is_err());
    }
}
