use std::str::FromStr;

use alloy::primitives::B256;
use alloy::providers::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller,
};
use alloy::providers::{Identity, Provider, ProviderBuilder, RootProvider, WsConnect};
use alloy::pubsub::Subscription;
use alloy::rpc::types::{Block, BlockNumberOrTag, Filter, Log, Transaction, TransactionReceipt};
use anyhow::anyhow;
use tracing::info;

pub type RpcProvider = FillProvider<
    JoinFill<
        Identity,
        JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
    >,
    RootProvider,
>;

/// Connection manager: request/response access over HTTP plus an optional
/// persistent WebSocket push channel. The minimal ledger surface consumed
/// by the listener and the orchestrator.
pub struct ChainClient {
    http: RpcProvider,
    ws: Option<RpcProvider>,
}

impl ChainClient {
    pub async fn connect(cfg: &crate::config::ChainCfg) -> anyhow::Result<Self> {
        let http_url = reqwest::Url::from_str(&cfg.http_rpc_url)?;
        let http = ProviderBuilder::new().connect_http(http_url);
        info!("Connected HTTP RPC provider: {}", cfg.http_rpc_url);

        let ws = match &cfg.ws_rpc_url {
            Some(url) if !url.is_empty() => {
                let provider = ProviderBuilder::new()
                    .connect_ws(WsConnect::new(url))
                    .await?;
                info!("Connected WS RPC provider: {}", url);
                Some(provider)
            }
            _ => None,
        };

        if let Some(expected) = cfg.chain_id {
            let chain_id = http.get_chain_id().await?;
            if chain_id != expected {
                anyhow::bail!("Chain ID mismatch: expected {}, got {}", expected, chain_id);
            }
            info!("Chain ID: {}", chain_id);
        }

        Ok(Self { http, ws })
    }

    pub fn has_push_channel(&self) -> bool {
        self.ws.is_some()
    }

    pub async fn block_number(&self) -> anyhow::Result<u64> {
        Ok(self.http.get_block_number().await?)
    }

    pub async fn block_by_number(&self, number: u64) -> anyhow::Result<Option<Block>> {
        Ok(self
            .http
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .await?)
    }

    pub async fn block_with_transactions(&self, number: u64) -> anyhow::Result<Option<Block>> {
        Ok(self
            .http
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .full()
            .await?)
    }

    pub async fn transaction_by_hash(&self, hash: B256) -> anyhow::Result<Option<Transaction>> {
        Ok(self.http.get_transaction_by_hash(hash).await?)
    }

    pub async fn receipt_by_hash(
        &self,
        hash: B256,
    ) -> anyhow::Result<Option<TransactionReceipt>> {
        Ok(self.http.get_transaction_receipt(hash).await?)
    }

    pub async fn get_logs(&self, filter: &Filter) -> anyhow::Result<Vec<Log>> {
        Ok(self.http.get_logs(filter).await?)
    }

    /// Push subscription for new logs matching the filter. Requires the
    /// WebSocket endpoint to be configured.
    pub async fn subscribe_logs(&self, filter: &Filter) -> anyhow::Result<Subscription<Log>> {
        let ws = self
            .ws
            .as_ref()
            .ok_or_else(|| anyhow!("No WebSocket RPC endpoint configured"))?;
        Ok(ws.subscribe_logs(filter).await?)
    }
}
