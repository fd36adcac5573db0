use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One stored contract event. Natural key: (transaction_hash, log_index).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedEvent {
    pub contract_address: String,
    pub contract_name: String,
    pub event_name: String,
    pub block_number: u64,
    pub transaction_hash: String,
    pub transaction_index: u64,
    pub log_index: u64,
    pub args: Value,
    pub timestamp: DateTime<Utc>,
    pub confirmed: bool,
    pub created_at: DateTime<Utc>,
}

/// One stored transaction. Wide-integer fields are decimal strings to
/// survive JSON round-trips without precision loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedTransaction {
    pub hash: String,
    pub block_number: u64,
    pub block_hash: String,
    pub transaction_index: u64,
    pub from: String,
    pub to: String,
    pub value: String,
    pub gas_price: String,
    pub gas_limit: String,
    pub gas_used: String,
    pub nonce: u64,
    pub data: String,
    pub timestamp: DateTime<Utc>,
    pub status: i16,
    pub contract_address: Option<String>,
    pub logs: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub contract_address: String,
    pub contract_name: String,
    pub last_processed_block: u64,
    pub is_active: bool,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub contract: String,
    pub from_block: u64,
    pub to_block: u64,
    pub progress: f64,
}

/// Broadcast channels a WebSocket client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Events,
    Transactions,
    Sync,
    All,
}

impl Channel {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "events" => Some(Self::Events),
            "transactions" => Some(Self::Transactions),
            "sync" => Some(Self::Sync),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Transactions => "transactions",
            Self::Sync => "sync",
            Self::All => "all",
        }
    }
}

/// Typed notification published by the orchestrator and fanned out by the
/// WebSocket server.
#[derive(Debug, Clone)]
pub enum Notification {
    Event(IndexedEvent),
    EventsBatch(Vec<IndexedEvent>),
    Transaction(IndexedTransaction),
    TransactionsBatch(Vec<IndexedTransaction>),
    SyncProgress(SyncProgress),
    Error(String),
}

impl Notification {
    pub fn channel(&self) -> Channel {
        match self {
            Self::Event(_) | Self::EventsBatch(_) => Channel::Events,
            Self::Transaction(_) | Self::TransactionsBatch(_) => Channel::Transactions,
            Self::SyncProgress(_) => Channel::Sync,
            Self::Error(_) => Channel::All,
        }
    }

    pub fn to_message(&self) -> Value {
        match self {
            Self::Event(event) => json!({ "type": "event", "data": event }),
            Self::EventsBatch(events) => json!({ "type": "events_batch", "data": events }),
            Self::Transaction(tx) => json!({ "type": "transaction", "data": tx }),
            Self::TransactionsBatch(txs) => json!({ "type": "transactions_batch", "data": txs }),
            Self::SyncProgress(progress) => json!({ "type": "sync_progress", "data": progress }),
            Self::Error(message) => json!({ "type": "error", "message": message }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_parse_round_trip() {
        for name in ["events", "transactions", "sync", "all"] {
            assert_eq!(Channel::parse(name).unwrap().as_str(), name);
        }
        assert!(Channel::parse("blocks").is_none());
    }

    #[test]
    fn notification_routing() {
        let progress = Notification::SyncProgress(SyncProgress {
            contract: "Token".to_string(),
            from_block: 100,
            to_block: 149,
            progress: 41.3,
        });
        assert_eq!(progress.channel(), Channel::Sync);

        let msg = progress.to_message();
        assert_eq!(msg["type"], "sync_progress");
        assert_eq!(msg["data"]["fromBlock"], 100);
        assert_eq!(msg["data"]["toBlock"], 149);
    }
}
