use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::rpc::types::Log;
use anyhow::anyhow;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::abi::ContractDescriptor;
use crate::config::AppCfg;
use crate::db::Store;
use crate::listener::ContractListener;
use crate::normalize;
use crate::provider::ChainClient;
use crate::retry::RetryPolicy;
use crate::types::{Notification, SyncProgress};

/// Sync orchestrator: drives per-contract historical catch-up against a
/// fixed horizon, then switches to live push tracking plus the periodic
/// confirmation sweep. Publishes typed notifications on a broadcast
/// channel consumed by the WebSocket server.
pub struct Indexer {
    config: AppCfg,
    store: Arc<Store>,
    chain: Arc<ChainClient>,
    listeners: BTreeMap<Address, Arc<ContractListener>>,
    retry: RetryPolicy,
    notifications: broadcast::Sender<Notification>,
    shutdown: watch::Sender<bool>,
}

impl Indexer {
    pub fn new(config: AppCfg, store: Arc<Store>, chain: Arc<ChainClient>) -> anyhow::Result<Self> {
        let retry = RetryPolicy::from_cfg(config.retry.as_ref());

        let mut listeners = BTreeMap::new();
        for contract_cfg in &config.contracts {
            let descriptor = ContractDescriptor::load(contract_cfg)?;
            let listener =
                ContractListener::new(Arc::clone(&chain), descriptor, retry.clone());
            listeners.insert(listener.descriptor().address, Arc::new(listener));
        }
        info!("Loaded {} contracts", listeners.len());

        let (notifications, _) = broadcast::channel(1024);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            chain,
            listeners,
            retry,
            notifications,
            shutdown,
        })
    }

    pub fn notifications(&self) -> broadcast::Sender<Notification> {
        self.notifications.clone()
    }

    /// Request shutdown. Observed at window boundaries, inside retry waits
    /// and by the live loop.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn notify(&self, notification: Notification) {
        // A send error only means nobody is subscribed right now.
        let _ = self.notifications.send(notification);
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        self.catch_up().await?;
        if self.is_stopping() {
            return Ok(());
        }
        self.live().await
    }

    /// Historical catch-up, sequential per contract against one height
    /// snapshot so every contract references the same point.
    async fn catch_up(&self) -> anyhow::Result<()> {
        info!("Starting initial sync");
        let horizon = self.chain.block_number().await?;

        for listener in self.listeners.values() {
            if self.is_stopping() {
                return Ok(());
            }
            self.sync_contract(listener, horizon).await?;
        }

        info!("Initial sync completed at horizon {}", horizon);
        Ok(())
    }

    async fn sync_contract(
        &self,
        listener: &ContractListener,
        horizon: u64,
    ) -> anyhow::Result<()> {
        let descriptor = listener.descriptor();
        let address = format!("{:#x}", descriptor.address);

        let sync_state = self.store.get_sync_state(&address).await?;
        let resume = sync_state
            .map(|state| state.last_processed_block + 1)
            .unwrap_or(descriptor.start_block);

        if resume > horizon {
            info!("Contract {} is already up to date", descriptor.name);
            return Ok(());
        }

        info!(
            "Syncing contract {} from block {} to {}",
            descriptor.name, resume, horizon
        );

        for (from, to) in plan_windows(resume, horizon, self.config.batch_size()) {
            if !self.process_window_with_retry(listener, from, to).await? {
                warn!(
                    "Shutdown requested, leaving {} catch-up before block {}",
                    descriptor.name, from
                );
                return Ok(());
            }

            self.notify(Notification::SyncProgress(SyncProgress {
                contract: descriptor.name.clone(),
                from_block: from,
                to_block: to,
                // Referenced to the originally captured horizon.
                progress: progress_pct(resume, horizon, to),
            }));
        }

        Ok(())
    }

    /// Retry the same window under the backoff policy until it commits.
    /// Returns false when interrupted by shutdown; errors only once the
    /// configured attempt cap is exhausted.
    async fn process_window_with_retry(
        &self,
        listener: &ContractListener,
        from: u64,
        to: u64,
    ) -> anyhow::Result<bool> {
        let mut delays = self.retry.delays();
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if self.is_stopping() {
                return Ok(false);
            }

            match self.process_window(listener, from, to).await {
                Ok(()) => return Ok(true),
                Err(e) => {
                    error!(
                        "Error syncing contract {} blocks {}-{}: {:?}",
                        listener.descriptor().name,
                        from,
                        to,
                        e
                    );

                    let Some(delay) = delays.next() else {
                        return Err(anyhow!(
                            "Window {}-{} of contract {} failed after exhausting retry attempts",
                            from,
                            to,
                            listener.descriptor().name
                        ));
                    };

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {
                            if self.is_stopping() {
                                return Ok(false);
                            }
                        }
                    }
                }
            }
        }
    }

    /// One catch-up window: fetch, normalize, persist, commit sync-state.
    /// Any error here fails the window as a whole and is retried by the
    /// caller; only per-transaction fetches are skipped individually.
    async fn process_window(
        &self,
        listener: &ContractListener,
        from: u64,
        to: u64,
    ) -> anyhow::Result<()> {
        let descriptor = listener.descriptor();
        let address = format!("{:#x}", descriptor.address);

        let logs = listener.historical_events(from, to).await?;

        let mut events = Vec::with_capacity(logs.len());
        let mut tx_hashes = BTreeSet::new();
        for log in &logs {
            let event = normalize::event_from_log(&self.chain, listener, log).await?;
            if let Some(hash) = log.transaction_hash {
                tx_hashes.insert(hash);
            }
            events.push(event);
        }

        let mut txs = Vec::with_capacity(tx_hashes.len());
        for hash in tx_hashes {
            match normalize::transaction_by_hash(&self.chain, hash).await {
                Ok(Some(tx)) => txs.push(tx),
                Ok(None) => debug!(
                    "Transaction 0x{} unavailable, skipping",
                    hex::encode(hash.0.as_slice())
                ),
                Err(e) => error!(
                    "Error processing transaction 0x{}: {:?}",
                    hex::encode(hash.0.as_slice()),
                    e
                ),
            }
        }

        self.store.save_events(&events).await?;
        self.store.save_transactions(&txs).await?;
        self.store
            .update_sync_state(&address, &descriptor.name, to)
            .await?;

        if !events.is_empty() {
            self.notify(Notification::EventsBatch(events));
        }
        if !txs.is_empty() {
            self.notify(Notification::TransactionsBatch(txs));
        }

        Ok(())
    }

    /// Live mode: all listener pumps feed one channel consumed here, so
    /// per-contract sync-state writes are serialized through a single
    /// consumer. The confirmation sweep runs on its own interval.
    async fn live(&self) -> anyhow::Result<()> {
        let (sink, mut logs) = mpsc::unbounded_channel();

        if self.chain.has_push_channel() {
            for listener in self.listeners.values() {
                listener.start_listening(sink.clone()).await?;
            }
            info!(
                "Started real-time listening on {} contracts",
                self.listeners.len()
            );
        } else {
            warn!("No WebSocket RPC endpoint configured, live tracking disabled");
        }

        let mut sweep = sweep_interval(Duration::from_secs(
            self.config.confirmation_interval_secs(),
        ));
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if self.is_stopping() {
                        break;
                    }
                }
                received = logs.recv() => {
                    // The local `sink` keeps the channel open, so recv only
                    // yields pushed logs.
                    let Some((address, log)) = received else { break };
                    if let Err(e) = self.process_live_log(address, &log).await {
                        error!("Error processing real-time event: {:?}", e);
                        self.notify(Notification::Error(e.to_string()));
                    }
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.confirmation_sweep().await {
                        error!("Error in confirmation sweep: {:?}", e);
                    }
                }
            }
        }

        for listener in self.listeners.values() {
            listener.stop_listening().await;
        }
        info!("Indexer stopped");
        Ok(())
    }

    async fn process_live_log(&self, address: Address, log: &Log) -> anyhow::Result<()> {
        let listener = self
            .listeners
            .get(&address)
            .ok_or_else(|| anyhow!("No listener registered for contract {:#x}", address))?;
        let descriptor = listener.descriptor();

        let event = normalize::event_from_log(&self.chain, listener, log).await?;
        let tx = match log.transaction_hash {
            Some(hash) => normalize::transaction_by_hash(&self.chain, hash).await?,
            None => None,
        };

        self.store.save_events(std::slice::from_ref(&event)).await?;
        if let Some(tx) = &tx {
            self.store.save_transactions(std::slice::from_ref(tx)).await?;
        }

        self.store
            .update_sync_state(&format!("{:#x}", address), &descriptor.name, event.block_number)
            .await?;

        self.notify(Notification::Event(event));
        if let Some(tx) = tx {
            self.notify(Notification::Transaction(tx));
        }

        Ok(())
    }

    async fn confirmation_sweep(&self) -> anyhow::Result<()> {
        let height = self.chain.block_number().await?;

        if let Some(boundary) = confirmation_boundary(height, self.config.confirmations()) {
            let confirmed = self.store.mark_events_confirmed(boundary).await?;
            if confirmed > 0 {
                info!("Confirmed {} events at or below block {}", confirmed, boundary);
            }
        }

        Ok(())
    }
}

/// Fixed-size, non-overlapping, increasing catch-up windows covering
/// `[from, horizon]` inclusively.
pub(crate) fn plan_windows(from: u64, horizon: u64, batch_size: u64) -> Vec<(u64, u64)> {
    let batch = batch_size.max(1);
    let mut windows = Vec::new();

    let mut start = from;
    while start <= horizon {
        let end = horizon.min(start + batch - 1);
        windows.push((start, end));
        start = end + 1;
    }

    windows
}

/// Catch-up progress in percent, against the original resume-to-horizon
/// range.
pub(crate) fn progress_pct(resume: u64, horizon: u64, to: u64) -> f64 {
    if horizon <= resume {
        return 100.0;
    }
    ((to - resume) as f64 / (horizon - resume) as f64) * 100.0
}

/// Strictly periodic sweep timer; the first sweep fires one full period
/// after live mode starts, not immediately.
fn sweep_interval(period: Duration) -> tokio::time::Interval {
    tokio::time::interval_at(tokio::time::Instant::now() + period, period)
}

/// Highest block considered final at the given height, if any block is.
pub(crate) fn confirmation_boundary(height: u64, confirmations: u64) -> Option<u64> {
    height.checked_sub(confirmations).filter(|b| *b > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_window_covers_short_range() {
        // start_block=100, horizon=120, batch=50: exactly one window.
        assert_eq!(plan_windows(100, 120, 50), vec![(100, 120)]);
    }

    #[test]
    fn windows_partition_the_range() {
        assert_eq!(
            plan_windows(100, 220, 50),
            vec![(100, 149), (150, 199), (200, 220)]
        );
    }

    #[test]
    fn resume_starts_at_next_uncommitted_window() {
        // Crash after committing sync-state 199: resume point is 200.
        let last_processed = 199u64;
        assert_eq!(plan_windows(last_processed + 1, 220, 50), vec![(200, 220)]);
    }

    #[test]
    fn window_bounds_are_increasing_and_disjoint() {
        let windows = plan_windows(0, 10_000, 1000);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }
        assert_eq!(windows.first().unwrap().0, 0);
        assert_eq!(windows.last().unwrap().1, 10_000);
    }

    #[test]
    fn already_caught_up_has_no_windows() {
        assert!(plan_windows(121, 120, 50).is_empty());
    }

    #[test]
    fn progress_is_referenced_to_horizon() {
        let p = progress_pct(100, 220, 149);
        assert!((p - 40.833).abs() < 0.01);
        assert_eq!(progress_pct(100, 220, 220), 100.0);
        assert_eq!(progress_pct(100, 100, 100), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn first_sweep_waits_a_full_period() {
        let period = Duration::from_secs(30);
        let start = tokio::time::Instant::now();

        let mut sweep = sweep_interval(period);
        sweep.tick().await;
        assert_eq!(start.elapsed(), period);
        sweep.tick().await;
        assert_eq!(start.elapsed(), period * 2);
    }

    #[test]
    fn confirmation_boundary_at_depth_twelve() {
        assert_eq!(confirmation_boundary(1000, 12), Some(988));
        // A later sweep at 1005 crosses exactly blocks 989-993.
        assert_eq!(confirmation_boundary(1005, 12), Some(993));
        assert_eq!(confirmation_boundary(5, 12), None);
        assert_eq!(confirmation_boundary(12, 12), None);
        assert_eq!(confirmation_boundary(13, 12), Some(1));
    }
}
