use std::collections::HashMap;

use alloy::primitives::{Log, B256};
use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_json_abi::{Event, EventParam, JsonAbi};
use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use tracing::debug;

/// Event name a log falls back to when no declared event matches its
/// signature or decoding fails.
pub const UNKNOWN_EVENT: &str = "UnknownEvent";

#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub name: String,
    pub args: Value,
}

/// ABI-driven log decoder: maps topic0 selectors to event definitions and
/// decodes indexed params from topics, non-indexed params from data.
pub struct EventDecoder {
    events: HashMap<B256, Event>,
}

impl EventDecoder {
    pub fn new(abi: &JsonAbi) -> Self {
        let mut events = HashMap::new();
        for event in abi.events() {
            events.insert(event.selector(), event.clone());
        }
        Self { events }
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events.values().map(|e| e.name.clone()).collect()
    }

    pub fn selector_of(&self, event_name: &str) -> Option<B256> {
        self.events
            .iter()
            .find(|(_, e)| e.name == event_name)
            .map(|(selector, _)| *selector)
    }

    /// Decode a raw log. Unrecognized or undecodable logs degrade to
    /// `UnknownEvent` with empty args instead of failing the pipeline.
    pub fn decode_log(&self, log: &Log) -> DecodedEvent {
        let Some(signature) = log.topics().first() else {
            return DecodedEvent {
                name: UNKNOWN_EVENT.to_string(),
                args: Value::Object(Map::new()),
            };
        };

        let Some(event) = self.events.get(signature) else {
            return DecodedEvent {
                name: UNKNOWN_EVENT.to_string(),
                args: Value::Object(Map::new()),
            };
        };

        match self.decode_with_event(log, event) {
            Ok(args) => DecodedEvent {
                name: event.name.clone(),
                args,
            },
            Err(e) => {
                debug!("Failed to decode {} log: {:?}", event.name, e);
                DecodedEvent {
                    name: UNKNOWN_EVENT.to_string(),
                    args: Value::Object(Map::new()),
                }
            }
        }
    }

    fn decode_with_event(&self, log: &Log, event: &Event) -> Result<Value> {
        let indexed_params: Vec<&EventParam> = event.inputs.iter().filter(|p| p.indexed).collect();
        let non_indexed_params: Vec<&EventParam> =
            event.inputs.iter().filter(|p| !p.indexed).collect();

        // (declaration position, name, value)
        let mut decoded: Vec<(usize, &str, DynSolValue)> = Vec::with_capacity(event.inputs.len());

        let mut topic_index = 1; // topic0 is the event signature
        for param in &indexed_params {
            let topic = log
                .topics()
                .get(topic_index)
                .copied()
                .ok_or_else(|| anyhow!("Not enough topics for indexed parameter {}", param.name))?;
            let value = decode_indexed_param(param, topic)?;
            let position = declaration_position(event, param);
            decoded.push((position, param.name.as_str(), value));
            topic_index += 1;
        }

        if !non_indexed_params.is_empty() {
            let values = decode_data_params(&non_indexed_params, &log.data.data)?;
            for (param, value) in non_indexed_params.iter().zip(values) {
                let position = declaration_position(event, param);
                decoded.push((position, param.name.as_str(), value));
            }
        }

        decoded.sort_by_key(|(position, _, _)| *position);

        // Positional keys plus named keys, so consumers can address args
        // either way.
        let mut args = Map::new();
        for (i, (_, name, value)) in decoded.iter().enumerate() {
            let json = sol_value_to_json(value);
            args.insert(i.to_string(), json.clone());
            if !name.is_empty() {
                args.insert((*name).to_string(), json);
            }
        }

        Ok(Value::Object(args))
    }
}

fn declaration_position(event: &Event, param: &EventParam) -> usize {
    event
        .inputs
        .iter()
        .position(|p| p.name == param.name && p.ty == param.ty)
        .unwrap_or(usize::MAX)
}

fn decode_indexed_param(param: &EventParam, topic: B256) -> Result<DynSolValue> {
    let sol_type = DynSolType::parse(&param.selector_type())?;

    match &sol_type {
        // Reference types (strings, bytes, arrays of any kind, structs) are
        // stored as their keccak256 hash in the topic; the original value is
        // unrecoverable.
        DynSolType::String
        | DynSolType::Bytes
        | DynSolType::Array(_)
        | DynSolType::FixedArray(..)
        | DynSolType::Tuple(_) => Ok(DynSolValue::FixedBytes(topic.0.into(), 32)),
        _ => sol_type
            .abi_decode_params(topic.as_slice())
            .map_err(|e| anyhow!("Failed to decode indexed parameter {}: {}", param.name, e)),
    }
}

fn decode_data_params(params: &[&EventParam], data: &[u8]) -> Result<Vec<DynSolValue>> {
    let param_types: Result<Vec<DynSolType>> = params
        .iter()
        .map(|p| {
            DynSolType::parse(&p.selector_type())
                .map_err(|e| anyhow!("Failed to parse type {} of parameter {}: {}", p.ty, p.name, e))
        })
        .collect();
    let tuple_type = DynSolType::Tuple(param_types?);

    match tuple_type
        .abi_decode_params(data)
        .map_err(|e| anyhow!("Failed to decode log data: {}", e))?
    {
        DynSolValue::Tuple(values) => Ok(values),
        _ => Err(anyhow!("Expected tuple from log data decoding")),
    }
}

/// Convert a decoded Solidity value to JSON. Integers of any width become
/// decimal strings so values past 2^53 survive every JSON consumer; values
/// with no clear mapping degrade to their debug form. Never fails.
pub fn sol_value_to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::FixedBytes(bytes, _) => Value::String(format!("0x{}", hex::encode(bytes))),
        DynSolValue::Bytes(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
        DynSolValue::Address(addr) => Value::String(format!("{:#x}", addr)),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(values) | DynSolValue::FixedArray(values) => {
            Value::Array(values.iter().map(sol_value_to_json).collect())
        }
        DynSolValue::Tuple(values) => Value::Array(values.iter().map(sol_value_to_json).collect()),
        other => Value::String(format!("{:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, Bytes, LogData, U256};
    use std::str::FromStr;

    const TRANSFER_ABI: &str = r#"[
        {
            "type": "event",
            "name": "Transfer",
            "anonymous": false,
            "inputs": [
                {"name": "from", "type": "address", "indexed": true},
                {"name": "to", "type": "address", "indexed": true},
                {"name": "value", "type": "uint256", "indexed": false}
            ]
        }
    ]"#;

    fn transfer_log() -> Log {
        let signature = B256::from_slice(
            &hex::decode("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef")
                .unwrap(),
        );
        let from = B256::from_slice(
            &hex::decode("000000000000000000000000742d35cc6634c0532925a3b8bc342a5b6437afcd")
                .unwrap(),
        );
        let to = B256::from_slice(
            &hex::decode("000000000000000000000000742d35cc6634c0532925a3b8bc342a5b6437afce")
                .unwrap(),
        );
        let data = Bytes::from(
            hex::decode("0000000000000000000000000000000000000000000000000de0b6b3a7640000")
                .unwrap(),
        );

        Log {
            address: Address::ZERO,
            data: LogData::new_unchecked(vec![signature, from, to], data),
        }
    }

    #[test]
    fn decodes_known_event() {
        let abi: JsonAbi = serde_json::from_str(TRANSFER_ABI).unwrap();
        let decoder = EventDecoder::new(&abi);

        let decoded = decoder.decode_log(&transfer_log());
        assert_eq!(decoded.name, "Transfer");
        // 1 ETH in wei, above 2^53: must arrive as an exact decimal string.
        assert_eq!(decoded.args["value"], "1000000000000000000");
        assert_eq!(decoded.args["2"], "1000000000000000000");
        assert_eq!(
            decoded.args["from"],
            "0x742d35cc6634c0532925a3b8bc342a5b6437afcd"
        );
    }

    #[test]
    fn unknown_selector_degrades() {
        let abi: JsonAbi = serde_json::from_str(TRANSFER_ABI).unwrap();
        let decoder = EventDecoder::new(&abi);

        let log = Log {
            address: Address::ZERO,
            data: LogData::new_unchecked(vec![B256::ZERO], Bytes::new()),
        };
        let decoded = decoder.decode_log(&log);
        assert_eq!(decoded.name, UNKNOWN_EVENT);
        assert_eq!(decoded.args, serde_json::json!({}));
    }

    #[test]
    fn indexed_reference_types_keep_event_name() {
        // Indexed fixed arrays and structs only carry their keccak256 hash
        // in the topic; the event must still decode under its own name.
        let abi: JsonAbi = serde_json::from_str(
            r#"[
                {
                    "type": "event",
                    "name": "Checkpoint",
                    "anonymous": false,
                    "inputs": [
                        {"name": "roots", "type": "uint256[2]", "indexed": true},
                        {"name": "height", "type": "uint64", "indexed": false}
                    ]
                },
                {
                    "type": "event",
                    "name": "Registered",
                    "anonymous": false,
                    "inputs": [
                        {
                            "name": "key",
                            "type": "tuple",
                            "components": [
                                {"name": "a", "type": "uint256"},
                                {"name": "b", "type": "address"}
                            ],
                            "indexed": true
                        }
                    ]
                }
            ]"#,
        )
        .unwrap();
        let decoder = EventDecoder::new(&abi);
        let hash = B256::repeat_byte(0xab);
        let hash_hex = format!("0x{}", hex::encode(hash));

        let height = Bytes::from(
            hex::decode("000000000000000000000000000000000000000000000000000000000000002a")
                .unwrap(),
        );
        let log = Log {
            address: Address::ZERO,
            data: LogData::new_unchecked(
                vec![decoder.selector_of("Checkpoint").unwrap(), hash],
                height,
            ),
        };
        let decoded = decoder.decode_log(&log);
        assert_eq!(decoded.name, "Checkpoint");
        assert_eq!(decoded.args["roots"], hash_hex.as_str());
        assert_eq!(decoded.args["height"], "42");

        let log = Log {
            address: Address::ZERO,
            data: LogData::new_unchecked(
                vec![decoder.selector_of("Registered").unwrap(), hash],
                Bytes::new(),
            ),
        };
        let decoded = decoder.decode_log(&log);
        assert_eq!(decoded.name, "Registered");
        assert_eq!(decoded.args["key"], hash_hex.as_str());
    }

    #[test]
    fn wide_integers_keep_precision() {
        let big = U256::from_str("36893488147419103232").unwrap(); // 2^65
        let json = sol_value_to_json(&DynSolValue::Uint(big, 256));
        assert_eq!(json, Value::String("36893488147419103232".to_string()));
    }

    #[test]
    fn nested_values_recurse() {
        let value = DynSolValue::Tuple(vec![
            DynSolValue::Array(vec![
                DynSolValue::Uint(U256::from(7u64), 256),
                DynSolValue::Uint(U256::MAX, 256),
            ]),
            DynSolValue::Bool(true),
        ]);
        let json = sol_value_to_json(&value);
        assert_eq!(json[0][0], "7");
        assert_eq!(json[0][1], U256::MAX.to_string());
        assert_eq!(json[1], true);
    }

    #[test]
    fn selector_lookup() {
        let abi: JsonAbi = serde_json::from_str(TRANSFER_ABI).unwrap();
        let decoder = EventDecoder::new(&abi);
        assert!(decoder.selector_of("Transfer").is_some());
        assert!(decoder.selector_of("Approval").is_none());
    }
}
