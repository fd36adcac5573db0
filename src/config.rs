use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct ChainCfg {
    pub http_rpc_url: String,
    pub ws_rpc_url: Option<String>,
    pub chain_id: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PgCfg {
    pub dsn: String,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerCfg {
    pub batch_size: Option<u64>,
    pub confirmations: Option<u64>,
    pub confirmation_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryCfg {
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WsServerCfg {
    pub bind: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContractCfg {
    pub name: String,
    pub address: String,
    pub abi_path: String,
    pub start_block: Option<u64>,
    pub events: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppCfg {
    pub chain: ChainCfg,
    pub postgres: PgCfg,
    pub indexer: IndexerCfg,
    pub retry: Option<RetryCfg>,
    pub ws_server: Option<WsServerCfg>,
    pub contracts: Vec<ContractCfg>,
}

impl AppCfg {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(&std::fs::read_to_string(path)?)?;

        if config.contracts.is_empty() {
            anyhow::bail!("No contracts configured");
        }

        Ok(config)
    }

    pub fn batch_size(&self) -> u64 {
        self.indexer.batch_size.unwrap_or(1000)
    }

    pub fn confirmations(&self) -> u64 {
        self.indexer.confirmations.unwrap_or(12)
    }

    pub fn confirmation_interval_secs(&self) -> u64 {
        self.indexer.confirmation_interval_secs.unwrap_or(30)
    }

    pub fn schema_path(&self) -> String {
        self.postgres
            .schema
            .clone()
            .unwrap_or_else(|| "./init.sql".to_string())
    }

    pub fn ws_bind(&self) -> String {
        self.ws_server
            .as_ref()
            .and_then(|ws| ws.bind.clone())
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let yaml = r#"
chain:
  http_rpc_url: "http://localhost:8545"
postgres:
  dsn: "host=localhost"
indexer: {}
contracts:
  - name: "Token"
    address: "0x5FbDB2315678afecb367f032d93F642f64180aa3"
    abi_path: "./abi/Token.json"
"#;
        let cfg: AppCfg = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.batch_size(), 1000);
        assert_eq!(cfg.confirmations(), 12);
        assert_eq!(cfg.confirmation_interval_secs(), 30);
        assert_eq!(cfg.ws_bind(), "0.0.0.0:8080");
        assert!(cfg.chain.ws_rpc_url.is_none());
        assert!(cfg.contracts[0].events.is_none());
    }
}
