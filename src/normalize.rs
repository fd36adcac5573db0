use alloy::consensus::{Transaction as TransactionTrait, TxReceipt};
use alloy::network::TransactionResponse;
use alloy::primitives::B256;
use alloy::rpc::types::Log;
use anyhow::anyhow;
use chrono::{DateTime, Utc};

use crate::listener::ContractListener;
use crate::provider::ChainClient;
use crate::types::{IndexedEvent, IndexedTransaction};

/// Convert a raw log into a storage-ready event record. Resolves the
/// containing block for the timestamp; decode failures degrade to
/// `UnknownEvent` inside the decoder rather than failing here.
pub async fn event_from_log(
    chain: &ChainClient,
    listener: &ContractListener,
    log: &Log,
) -> anyhow::Result<IndexedEvent> {
    let descriptor = listener.descriptor();

    let block_number = log
        .block_number
        .ok_or_else(|| anyhow!("Log from {} is missing a block number", descriptor.name))?;
    let transaction_hash = log
        .transaction_hash
        .ok_or_else(|| anyhow!("Log from {} is missing a transaction hash", descriptor.name))?;

    let decoded = listener.decoder().decode_log(&log.inner);
    let timestamp = block_timestamp(chain, block_number).await?;

    Ok(IndexedEvent {
        contract_address: format!("{:#x}", descriptor.address),
        contract_name: descriptor.name.clone(),
        event_name: decoded.name,
        block_number,
        transaction_hash: format!("0x{}", hex::encode(transaction_hash.0.as_slice())),
        transaction_index: log.transaction_index.unwrap_or_default(),
        log_index: log.log_index.unwrap_or_default(),
        args: decoded.args,
        timestamp,
        confirmed: false,
        created_at: Utc::now(),
    })
}

/// Fetch and normalize one transaction. Returns `Ok(None)` when the
/// transaction, its receipt, or its block position is unavailable; callers
/// log and skip, persisting the associated event on its own.
pub async fn transaction_by_hash(
    chain: &ChainClient,
    hash: B256,
) -> anyhow::Result<Option<IndexedTransaction>> {
    let Some(tx) = chain.transaction_by_hash(hash).await? else {
        return Ok(None);
    };
    let Some(receipt) = chain.receipt_by_hash(hash).await? else {
        return Ok(None);
    };
    let Some(block_number) = tx.block_number else {
        return Ok(None);
    };

    let timestamp = block_timestamp(chain, block_number).await?;

    Ok(Some(IndexedTransaction {
        hash: format!("0x{}", hex::encode(hash.0.as_slice())),
        block_number,
        block_hash: tx
            .block_hash
            .map(|bh| format!("0x{}", hex::encode(bh.0.as_slice())))
            .unwrap_or_else(|| "0x".to_string()),
        transaction_index: tx.transaction_index.unwrap_or_default(),
        from: format!("{:#x}", tx.from()),
        // Empty for contract creation.
        to: tx.to().map(|a| format!("{:#x}", a)).unwrap_or_default(),
        value: tx.value().to_string(),
        gas_price: TransactionTrait::gas_price(&tx).unwrap_or_default().to_string(),
        gas_limit: tx.gas_limit().to_string(),
        gas_used: receipt.gas_used.to_string(),
        nonce: tx.nonce(),
        data: format!("0x{}", hex::encode(tx.input())),
        timestamp,
        status: receipt.inner.status() as i16,
        contract_address: receipt
            .contract_address
            .map(|a| format!("{:#x}", a)),
        logs: serde_json::to_value(receipt.inner.logs())?,
        created_at: Utc::now(),
    }))
}

async fn block_timestamp(chain: &ChainClient, number: u64) -> anyhow::Result<DateTime<Utc>> {
    let block = chain
        .block_by_number(number)
        .await?
        .ok_or_else(|| anyhow!("Block {} not found", number))?;

    Ok(DateTime::from_timestamp(block.header.timestamp as i64, 0).unwrap_or_default())
}
