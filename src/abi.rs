//! Contract ABI binding
//!
//! Parses compiler ABI output with `alloy-json-abi` and runs the actual
//! encoding through `alloy-dyn-abi`. Values cross this boundary as JSON:
//! scalars are coerced from their string form against the declared Solidity
//! type, JSON arrays fill arrays and tuples. On the way out, integers that
//! fit in a u64 (i64 when negative) become JSON numbers and wider ones
//! become decimal strings.

use crate::ledger::{LedgerError, LedgerResult};
use crate::types::{parse_b256, Log};
use alloy_dyn_abi::{DynSolType, DynSolValue, EventExt, FunctionExt, JsonAbiExt, Specifier};
use alloy_json_abi::{Event, Function, JsonAbi};
use alloy_primitives::B256;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

/// Parsed ABI of one contract.
#[derive(Debug, Clone, Default)]
pub struct ContractAbi {
    abi: JsonAbi,
    events: HashMap<B256, Event>,
}

impl ContractAbi {
    /// Parse an ABI from either a bare entry array or a build artifact with
    /// an `abi` field.
    ///
    /// Every function and event parameter must name a type the codec can
    /// resolve, so a bad ABI fails here rather than on the first log.
    pub fn from_json(value: Value) -> LedgerResult<Self> {
        let entries = match value {
            Value::Array(_) => value,
            Value::Object(mut artifact) => artifact
                .remove("abi")
                .ok_or_else(|| LedgerError::Abi("artifact has no 'abi' field".to_string()))?,
            other => {
                return Err(LedgerError::Abi(format!(
                    "expected an ABI array or artifact, got {}",
                    other
                )))
            }
        };
        let abi: JsonAbi = serde_json::from_value(entries)
            .map_err(|e| LedgerError::Abi(format!("invalid ABI: {}", e)))?;

        for function in abi.functions() {
            for param in function.inputs.iter().chain(&function.outputs) {
                param.resolve().map_err(|e| {
                    LedgerError::Abi(format!("{}: {}", function.signature(), e))
                })?;
            }
        }

        let mut events = HashMap::new();
        for event in abi.events() {
            for param in &event.inputs {
                param
                    .resolve()
                    .map_err(|e| LedgerError::Abi(format!("{}: {}", event.signature(), e)))?;
            }
            if event.anonymous {
                debug!("Ignoring anonymous event {}", event.name);
                continue;
            }
            events.insert(event.selector(), event.clone());
        }

        Ok(Self { abi, events })
    }

    fn function(&self, method: &str) -> LedgerResult<&Function> {
        let overloads = self
            .abi
            .function(method)
            .ok_or_else(|| LedgerError::Abi(format!("no function named {}", method)))?;
        if overloads.len() > 1 {
            debug!("{} is overloaded, using {}", method, overloads[0].signature());
        }
        overloads
            .first()
            .ok_or_else(|| LedgerError::Abi(format!("no function named {}", method)))
    }

    pub fn has_function(&self, method: &str) -> bool {
        self.abi.function(method).is_some_and(|f| !f.is_empty())
    }

    /// 4-byte selector of `method`.
    pub fn selector(&self, method: &str) -> LedgerResult<[u8; 4]> {
        Ok(self.function(method)?.selector().0)
    }

    /// Calldata for `method(args...)`.
    pub fn encode_call(&self, method: &str, args: &[Value]) -> LedgerResult<Vec<u8>> {
        let function = self.function(method)?;
        if args.len() != function.inputs.len() {
            return Err(LedgerError::Abi(format!(
                "{} takes {} arguments, got {}",
                method,
                function.inputs.len(),
                args.len()
            )));
        }
        let values = function
            .inputs
            .iter()
            .zip(args)
            .map(|(param, arg)| {
                let ty = param.resolve().map_err(|e| LedgerError::Abi(e.to_string()))?;
                to_sol_value(&ty, arg)
            })
            .collect::<LedgerResult<Vec<_>>>()?;
        function
            .abi_encode_input(&values)
            .map_err(|e| LedgerError::Abi(format!("{}: {}", method, e)))
    }

    /// Decode the return data of `method`.
    ///
    /// A single output is returned as-is, several as a JSON array, none as
    /// `null`.
    pub fn decode_output(&self, method: &str, data: &[u8]) -> LedgerResult<Value> {
        let function = self.function(method)?;
        let mut values: Vec<Value> = function
            .abi_decode_output(data, true)
            .map_err(|e| LedgerError::Decode(format!("{} output: {}", method, e)))?
            .iter()
            .map(to_json)
            .collect();
        Ok(match values.len() {
            0 => Value::Null,
            1 => values.remove(0),
            _ => Value::Array(values),
        })
    }

    /// Decode a log into its event name and named arguments.
    ///
    /// Returns `None` when the log's signature topic is not in this ABI.
    pub fn decode_log(&self, log: &Log) -> Option<LedgerResult<(String, Map<String, Value>)>> {
        let topic0 = parse_b256(log.topics.first()?).ok()?;
        let event = self.events.get(&topic0)?;
        Some(decode_event(event, log))
    }
}

fn decode_event(event: &Event, log: &Log) -> LedgerResult<(String, Map<String, Value>)> {
    let topics = log
        .topics
        .iter()
        .map(|t| parse_b256(t))
        .collect::<Result<Vec<B256>, String>>()
        .map_err(LedgerError::Decode)?;
    let decoded = event
        .decode_log_parts(topics, &log.data, true)
        .map_err(|e| LedgerError::Decode(format!("{} log: {}", event.name, e)))?;

    // indexed dynamic values come back as their topic hash
    let mut indexed = decoded.indexed.iter();
    let mut body = decoded.body.iter();
    let mut args = Map::new();
    for (position, param) in event.inputs.iter().enumerate() {
        let name = if param.name.is_empty() {
            position.to_string()
        } else {
            param.name.clone()
        };
        let value = if param.indexed {
            indexed.next()
        } else {
            body.next()
        };
        args.insert(name, value.map(to_json).unwrap_or(Value::Null));
    }
    Ok((event.name.clone(), args))
}

/// Coerce a JSON argument into a value of type `ty`.
fn to_sol_value(ty: &DynSolType, value: &Value) -> LedgerResult<DynSolValue> {
    let mismatch = || LedgerError::Abi(format!("cannot encode {} as {}", value, ty));
    match (ty, value) {
        (DynSolType::Array(inner), Value::Array(items)) => items
            .iter()
            .map(|item| to_sol_value(inner, item))
            .collect::<LedgerResult<Vec<_>>>()
            .map(DynSolValue::Array),
        (DynSolType::FixedArray(inner, len), Value::Array(items)) => {
            if items.len() != *len {
                return Err(mismatch());
            }
            items
                .iter()
                .map(|item| to_sol_value(inner, item))
                .collect::<LedgerResult<Vec<_>>>()
                .map(DynSolValue::FixedArray)
        }
        (DynSolType::Tuple(types), Value::Array(items)) => {
            if items.len() != types.len() {
                return Err(mismatch());
            }
            types
                .iter()
                .zip(items)
                .map(|(ty, item)| to_sol_value(ty, item))
                .collect::<LedgerResult<Vec<_>>>()
                .map(DynSolValue::Tuple)
        }
        (DynSolType::Array(_) | DynSolType::FixedArray(..) | DynSolType::Tuple(_), _) => {
            Err(mismatch())
        }
        (_, Value::String(s)) => ty.coerce_str(s.trim()).map_err(|_| mismatch()),
        (_, Value::Number(n)) => ty.coerce_str(&n.to_string()).map_err(|_| mismatch()),
        (_, Value::Bool(b)) => ty.coerce_str(&b.to_string()).map_err(|_| mismatch()),
        _ => Err(mismatch()),
    }
}

fn to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Uint(v, _) => match u64::try_from(*v) {
            Ok(small) => Value::from(small),
            Err(_) => Value::String(v.to_string()),
        },
        DynSolValue::Int(v, _) => {
            let text = v.to_string();
            match text.parse::<i64>() {
                Ok(small) => Value::from(small),
                Err(_) => Value::String(text),
            }
        }
        DynSolValue::Address(address) => Value::String(format!("0x{:x}", address)),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(format!("0x{}", hex::encode(&word[..*size])))
        }
        DynSolValue::Function(function) => {
            Value::String(format!("0x{}", hex::encode(function.as_slice())))
        }
        DynSolValue::Bytes(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(to_json).collect())
        }
    }
}
