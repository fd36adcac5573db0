use chrono::Utc;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{error, info};

use crate::types::{IndexedEvent, IndexedTransaction, SyncState};

/// Persistent store for indexed events, transactions and per-contract sync
/// state. The orchestrator is the only writer.
pub struct Store {
    client: Client,
}

/// Filter set for the read-only event query surface.
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub contract_address: Option<String>,
    pub event_name: Option<String>,
    pub confirmed: Option<bool>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            contract_address: None,
            event_name: None,
            confirmed: None,
            limit: 100,
            offset: 0,
        }
    }
}

const EVENT_COLUMNS: &str = "contract_address, contract_name, event_name, block_number, \
     transaction_hash, transaction_index, log_index, args, timestamp, confirmed, created_at";

const TX_COLUMNS: &str = "hash, block_number, block_hash, transaction_index, sender, receiver, \
     value, gas_price, gas_limit, gas_used, nonce, input, timestamp, status, contract_address, \
     logs, created_at";

impl Store {
    pub async fn connect(dsn: &str, schema: &str) -> anyhow::Result<Self> {
        let (client, connection) = tokio_postgres::connect(dsn, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Postgres connection error: {:?}", e);
            }
        });

        // Create schema if not exists
        client.batch_execute(schema).await?;
        info!("PostgreSQL ready");

        Ok(Self { client })
    }

    /// Idempotent upsert keyed on (transaction_hash, log_index). All rows
    /// commit together or not at all.
    pub async fn save_events(&self, events: &[IndexedEvent]) -> anyhow::Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let query = event_upsert_sql();

        self.client.batch_execute("BEGIN").await?;
        for event in events {
            let result = self
                .client
                .execute(
                    &query,
                    &[
                        &event.contract_address,
                        &event.contract_name,
                        &event.event_name,
                        &(event.block_number as i64),
                        &event.transaction_hash,
                        &(event.transaction_index as i64),
                        &(event.log_index as i64),
                        &event.args,
                        &event.timestamp,
                        &event.confirmed,
                        &event.created_at,
                    ],
                )
                .await;

            if let Err(e) = result {
                let _ = self.client.batch_execute("ROLLBACK").await;
                return Err(e.into());
            }
        }
        self.client.batch_execute("COMMIT").await?;

        Ok(())
    }

    /// Idempotent upsert keyed on hash, same all-or-nothing semantics as
    /// `save_events`.
    pub async fn save_transactions(&self, txs: &[IndexedTransaction]) -> anyhow::Result<()> {
        if txs.is_empty() {
            return Ok(());
        }

        let query = transaction_upsert_sql();

        self.client.batch_execute("BEGIN").await?;
        for tx in txs {
            let result = self
                .client
                .execute(
                    &query,
                    &[
                        &tx.hash,
                        &(tx.block_number as i64),
                        &tx.block_hash,
                        &(tx.transaction_index as i64),
                        &tx.from,
                        &tx.to,
                        &tx.value,
                        &tx.gas_price,
                        &tx.gas_limit,
                        &tx.gas_used,
                        &(tx.nonce as i64),
                        &tx.data,
                        &tx.timestamp,
                        &tx.status,
                        &tx.contract_address,
                        &tx.logs,
                        &tx.created_at,
                    ],
                )
                .await;

            if let Err(e) = result {
                let _ = self.client.batch_execute("ROLLBACK").await;
                return Err(e.into());
            }
        }
        self.client.batch_execute("COMMIT").await?;

        Ok(())
    }

    /// Upsert the resume point for a contract. `GREATEST` keeps
    /// `last_processed_block` monotonically non-decreasing even if updates
    /// arrive out of order.
    pub async fn update_sync_state(
        &self,
        contract_address: &str,
        contract_name: &str,
        block_number: u64,
    ) -> anyhow::Result<()> {
        self.client
            .execute(
                SYNC_STATE_UPSERT_SQL,
                &[
                    &contract_address,
                    &contract_name,
                    &(block_number as i64),
                    &Utc::now(),
                ],
            )
            .await?;

        Ok(())
    }

    pub async fn get_sync_state(
        &self,
        contract_address: &str,
    ) -> anyhow::Result<Option<SyncState>> {
        let row = self
            .client
            .query_opt(
                "SELECT contract_address, contract_name, last_processed_block, is_active, last_updated \
                 FROM sync_state WHERE contract_address = $1",
                &[&contract_address],
            )
            .await?;

        Ok(row.map(|row| sync_state_from_row(&row)))
    }

    pub async fn get_all_sync_states(&self) -> anyhow::Result<Vec<SyncState>> {
        let rows = self
            .client
            .query(
                "SELECT contract_address, contract_name, last_processed_block, is_active, last_updated \
                 FROM sync_state ORDER BY contract_address",
                &[],
            )
            .await?;

        Ok(rows.iter().map(sync_state_from_row).collect())
    }

    /// Bulk-flip every unconfirmed event at or under the boundary block.
    /// Returns the number of events confirmed.
    pub async fn mark_events_confirmed(&self, block_number: u64) -> anyhow::Result<u64> {
        let updated = self
            .client
            .execute(
                "UPDATE events SET confirmed = TRUE \
                 WHERE block_number <= $1 AND confirmed = FALSE",
                &[&(block_number as i64)],
            )
            .await?;

        Ok(updated)
    }

    /// Filtered, paginated lookup for the external query API.
    pub async fn get_events(&self, query: &EventQuery) -> anyhow::Result<Vec<IndexedEvent>> {
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();

        if let Some(address) = &query.contract_address {
            params.push(address);
            conditions.push(format!("contract_address = ${}", params.len()));
        }
        if let Some(name) = &query.event_name {
            params.push(name);
            conditions.push(format!("event_name = ${}", params.len()));
        }
        if let Some(confirmed) = &query.confirmed {
            params.push(confirmed);
            conditions.push(format!("confirmed = ${}", params.len()));
        }

        params.push(&query.limit);
        let limit_idx = params.len();
        params.push(&query.offset);
        let offset_idx = params.len();

        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events{} ORDER BY block_number DESC, log_index DESC \
             LIMIT ${limit_idx} OFFSET ${offset_idx}",
            where_clause(&conditions),
        );

        let rows = self.client.query(&sql, &params).await?;
        Ok(rows.iter().map(event_from_row).collect())
    }

    pub async fn get_events_in_range(
        &self,
        contract_address: &str,
        from_block: u64,
        to_block: u64,
    ) -> anyhow::Result<Vec<IndexedEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE contract_address = $1 AND block_number BETWEEN $2 AND $3 \
             ORDER BY block_number, log_index"
        );
        let rows = self
            .client
            .query(
                &sql,
                &[&contract_address, &(from_block as i64), &(to_block as i64)],
            )
            .await?;

        Ok(rows.iter().map(event_from_row).collect())
    }

    pub async fn get_transaction(&self, hash: &str) -> anyhow::Result<Option<IndexedTransaction>> {
        let sql = format!("SELECT {TX_COLUMNS} FROM transactions WHERE hash = $1");
        let row = self.client.query_opt(&sql, &[&hash]).await?;

        Ok(row.map(|row| transaction_from_row(&row)))
    }

    pub async fn get_transactions_by_block(
        &self,
        block_number: u64,
    ) -> anyhow::Result<Vec<IndexedTransaction>> {
        let sql = format!(
            "SELECT {TX_COLUMNS} FROM transactions WHERE block_number = $1 \
             ORDER BY transaction_index"
        );
        let rows = self
            .client
            .query(&sql, &[&(block_number as i64)])
            .await?;

        Ok(rows.iter().map(transaction_from_row).collect())
    }
}

/// Write conflicts resolve on the natural key (transaction_hash,
/// log_index), so re-indexing the same log leaves one row reflecting
/// the latest write.
fn event_upsert_sql() -> String {
    format!(
        r#"
        INSERT INTO events ({EVENT_COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8::jsonb, $9, $10, $11)
        ON CONFLICT (transaction_hash, log_index) DO UPDATE SET
            contract_address = EXCLUDED.contract_address,
            contract_name = EXCLUDED.contract_name,
            event_name = EXCLUDED.event_name,
            block_number = EXCLUDED.block_number,
            transaction_index = EXCLUDED.transaction_index,
            args = EXCLUDED.args,
            timestamp = EXCLUDED.timestamp,
            confirmed = EXCLUDED.confirmed
        "#
    )
}

fn transaction_upsert_sql() -> String {
    format!(
        r#"
        INSERT INTO transactions ({TX_COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16::jsonb, $17)
        ON CONFLICT (hash) DO UPDATE SET
            block_number = EXCLUDED.block_number,
            block_hash = EXCLUDED.block_hash,
            transaction_index = EXCLUDED.transaction_index,
            sender = EXCLUDED.sender,
            receiver = EXCLUDED.receiver,
            value = EXCLUDED.value,
            gas_price = EXCLUDED.gas_price,
            gas_limit = EXCLUDED.gas_limit,
            gas_used = EXCLUDED.gas_used,
            nonce = EXCLUDED.nonce,
            input = EXCLUDED.input,
            timestamp = EXCLUDED.timestamp,
            status = EXCLUDED.status,
            contract_address = EXCLUDED.contract_address,
            logs = EXCLUDED.logs
        "#
    )
}

/// `GREATEST` keeps `last_processed_block` monotonically non-decreasing
/// regardless of the order updates land in.
const SYNC_STATE_UPSERT_SQL: &str = r#"
    INSERT INTO sync_state (contract_address, contract_name, last_processed_block, is_active, last_updated)
    VALUES ($1, $2, $3, TRUE, $4)
    ON CONFLICT (contract_address) DO UPDATE SET
        contract_name = EXCLUDED.contract_name,
        last_processed_block = GREATEST(sync_state.last_processed_block, EXCLUDED.last_processed_block),
        is_active = TRUE,
        last_updated = EXCLUDED.last_updated
"#;

fn where_clause(conditions: &[String]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

fn sync_state_from_row(row: &Row) -> SyncState {
    SyncState {
        contract_address: row.get("contract_address"),
        contract_name: row.get("contract_name"),
        last_processed_block: row.get::<_, i64>("last_processed_block") as u64,
        is_active: row.get("is_active"),
        last_updated: row.get("last_updated"),
    }
}

fn event_from_row(row: &Row) -> IndexedEvent {
    IndexedEvent {
        contract_address: row.get("contract_address"),
        contract_name: row.get("contract_name"),
        event_name: row.get("event_name"),
        block_number: row.get::<_, i64>("block_number") as u64,
        transaction_hash: row.get("transaction_hash"),
        transaction_index: row.get::<_, i64>("transaction_index") as u64,
        log_index: row.get::<_, i64>("log_index") as u64,
        args: row.get("args"),
        timestamp: row.get("timestamp"),
        confirmed: row.get("confirmed"),
        created_at: row.get("created_at"),
    }
}

fn transaction_from_row(row: &Row) -> IndexedTransaction {
    IndexedTransaction {
        hash: row.get("hash"),
        block_number: row.get::<_, i64>("block_number") as u64,
        block_hash: row.get("block_hash"),
        transaction_index: row.get::<_, i64>("transaction_index") as u64,
        from: row.get("sender"),
        to: row.get("receiver"),
        value: row.get("value"),
        gas_price: row.get("gas_price"),
        gas_limit: row.get("gas_limit"),
        gas_used: row.get("gas_used"),
        nonce: row.get::<_, i64>("nonce") as u64,
        data: row.get("input"),
        timestamp: row.get("timestamp"),
        status: row.get("status"),
        contract_address: row.get("contract_address"),
        logs: row.get("logs"),
        created_at: row.get("created_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn where_clause_joins_conditions() {
        assert_eq!(where_clause(&[]), "");
        assert_eq!(
            where_clause(&["confirmed = $1".to_string(), "event_name = $2".to_string()]),
            " WHERE confirmed = $1 AND event_name = $2"
        );
    }

    #[test]
    fn event_writes_are_idempotent_on_natural_key() {
        // A second write of the same (transaction_hash, log_index) must
        // update the existing row, never insert a duplicate or error.
        let sql = event_upsert_sql();
        assert!(sql.contains("ON CONFLICT (transaction_hash, log_index) DO UPDATE SET"));
        assert!(sql.contains("confirmed = EXCLUDED.confirmed"));

        let sql = transaction_upsert_sql();
        assert!(sql.contains("ON CONFLICT (hash) DO UPDATE SET"));
    }

    #[test]
    fn sync_state_never_regresses() {
        // The resume point only moves forward; a stale update loses.
        assert!(SYNC_STATE_UPSERT_SQL.contains(
            "last_processed_block = GREATEST(sync_state.last_processed_block, EXCLUDED.last_processed_block)"
        ));
        assert!(SYNC_STATE_UPSERT_SQL.contains("ON CONFLICT (contract_address) DO UPDATE SET"));
    }

    #[test]
    fn event_query_defaults() {
        let query = EventQuery::default();
        assert_eq!(query.limit, 100);
        assert_eq!(query.offset, 0);
        assert!(query.contract_address.is_none());
    }
}
