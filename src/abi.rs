use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use alloy_json_abi::JsonAbi;
use alloy_primitives::Address;

use crate::config::ContractCfg;

/// Immutable description of one tracked contract, supplied at startup.
/// An empty `events` list means every event declared in the ABI is tracked.
#[derive(Debug, Clone)]
pub struct ContractDescriptor {
    pub name: String,
    pub address: Address,
    pub abi: JsonAbi,
    pub start_block: u64,
    pub events: Vec<String>,
}

impl ContractDescriptor {
    pub fn load(cfg: &ContractCfg) -> anyhow::Result<Self> {
        let address = Address::from_str(&cfg.address)?;

        let path = PathBuf::from(&cfg.abi_path);
        let abi_json = fs::read(&path)?;
        let abi: JsonAbi = serde_json::from_slice(&abi_json)?;

        Ok(Self {
            name: cfg.name.clone(),
            address,
            abi,
            start_block: cfg.start_block.unwrap_or(0),
            events: cfg.events.clone().unwrap_or_default(),
        })
    }
}
