use std::sync::Arc;

use alloy::primitives::Address;
use alloy::rpc::types::{Filter, Log};
use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::abi::ContractDescriptor;
use crate::event_decoder::EventDecoder;
use crate::provider::ChainClient;
use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
#[error("failed to query {event} events in blocks {from}..={to}: {source}")]
pub struct EventQueryError {
    event: String,
    from: u64,
    to: u64,
    #[source]
    source: anyhow::Error,
}

/// Per-contract event listener: one log filter per tracked event name,
/// historical range queries and live push subscriptions.
pub struct ContractListener {
    descriptor: ContractDescriptor,
    decoder: EventDecoder,
    chain: Arc<ChainClient>,
    filters: Vec<(String, Filter)>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    retry: RetryPolicy,
}

impl ContractListener {
    pub fn new(
        chain: Arc<ChainClient>,
        descriptor: ContractDescriptor,
        retry: RetryPolicy,
    ) -> Self {
        let decoder = EventDecoder::new(&descriptor.abi);

        let tracked = if descriptor.events.is_empty() {
            decoder.event_names()
        } else {
            descriptor.events.clone()
        };

        let mut filters = Vec::with_capacity(tracked.len());
        for event_name in tracked {
            match decoder.selector_of(&event_name) {
                Some(selector) => {
                    let filter = Filter::new()
                        .address(descriptor.address)
                        .event_signature(selector);
                    filters.push((event_name, filter));
                }
                None => warn!(
                    "Contract {} does not declare event {}, skipping filter",
                    descriptor.name, event_name
                ),
            }
        }

        Self {
            descriptor,
            decoder,
            chain,
            filters,
            pumps: Mutex::new(Vec::new()),
            retry,
        }
    }

    pub fn descriptor(&self) -> &ContractDescriptor {
        &self.descriptor
    }

    pub fn decoder(&self) -> &EventDecoder {
        &self.decoder
    }

    /// Query all tracked filters over the inclusive block range and merge
    /// the results into a deterministic (block_number, log_index) order.
    /// A single filter failure aborts the whole call; no partial result.
    pub async fn historical_events(&self, from: u64, to: u64) -> anyhow::Result<Vec<Log>> {
        let mut logs = Vec::new();

        for (event_name, filter) in &self.filters {
            let ranged = filter.clone().from_block(from).to_block(to);
            let batch =
                self.chain
                    .get_logs(&ranged)
                    .await
                    .map_err(|source| EventQueryError {
                        event: event_name.clone(),
                        from,
                        to,
                        source,
                    })?;
            logs.extend(batch);
        }

        sort_logs(&mut logs);
        Ok(logs)
    }

    /// Register one push subscription per filter, forwarding every log into
    /// the shared channel. No-op when already listening.
    pub async fn start_listening(
        &self,
        sink: UnboundedSender<(Address, Log)>,
    ) -> anyhow::Result<()> {
        let mut pumps = self.pumps.lock().await;
        if !pumps.is_empty() {
            return Ok(());
        }

        for (event_name, filter) in &self.filters {
            let chain = Arc::clone(&self.chain);
            let filter = filter.clone();
            let sink = sink.clone();
            let address = self.descriptor.address;
            let contract = self.descriptor.name.clone();
            let event_name = event_name.clone();
            let retry = self.retry.clone();

            pumps.push(tokio::spawn(async move {
                pump_logs(chain, filter, address, contract, event_name, retry, sink).await;
            }));
        }

        info!(
            "Listening on {} event filters for contract {}",
            pumps.len(),
            self.descriptor.name
        );
        Ok(())
    }

    /// Detach every push subscription. Idempotent: handles are drained
    /// exactly once, so repeated calls (or a call without a prior start)
    /// are harmless.
    pub async fn stop_listening(&self) {
        let mut pumps = self.pumps.lock().await;
        for handle in pumps.drain(..) {
            handle.abort();
        }
    }
}

/// Forward pushed logs into the orchestrator channel, resubscribing under
/// the retry policy when the stream ends or the subscription fails. The
/// sequential await guarantees a single outstanding reconnection attempt.
async fn pump_logs(
    chain: Arc<ChainClient>,
    filter: Filter,
    address: Address,
    contract: String,
    event_name: String,
    retry: RetryPolicy,
    sink: UnboundedSender<(Address, Log)>,
) {
    let mut delays = retry.delays();

    loop {
        match chain.subscribe_logs(&filter).await {
            Ok(sub) => {
                debug!("Subscribed to {} {} events", contract, event_name);
                // Backoff resets once the channel is up again.
                delays = retry.delays();

                let mut stream = sub.into_stream();
                while let Some(log) = stream.next().await {
                    if sink.send((address, log)).is_err() {
                        // Orchestrator dropped the receiver; we are done.
                        return;
                    }
                }
                warn!(
                    "Subscription stream for {} {} ended, resubscribing",
                    contract, event_name
                );
            }
            Err(e) => {
                error!(
                    "Failed to subscribe to {} {} events: {:?}",
                    contract, event_name, e
                );
            }
        }

        let Some(delay) = delays.next() else {
            error!(
                "Exhausted resubscription attempts for {} {} events",
                contract, event_name
            );
            return;
        };
        tokio::time::sleep(delay).await;
    }
}

/// Ascending (block_number, log_index) order, replay-stable regardless of
/// the order the node returned the logs in.
pub fn sort_logs(logs: &mut [Log]) {
    logs.sort_by_key(|log| (log.block_number.unwrap_or(0), log.log_index.unwrap_or(0)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_at(block_number: u64, log_index: u64) -> Log {
        Log {
            block_number: Some(block_number),
            log_index: Some(log_index),
            ..Default::default()
        }
    }

    #[test]
    fn sort_is_deterministic() {
        let mut logs = vec![log_at(2, 1), log_at(1, 5), log_at(2, 0), log_at(1, 2)];
        sort_logs(&mut logs);

        let order: Vec<(u64, u64)> = logs
            .iter()
            .map(|l| (l.block_number.unwrap(), l.log_index.unwrap()))
            .collect();
        assert_eq!(order, vec![(1, 2), (1, 5), (2, 0), (2, 1)]);
    }

    #[test]
    fn sort_handles_missing_positions() {
        let mut logs = vec![log_at(3, 0), Log::default(), log_at(1, 1)];
        sort_logs(&mut logs);
        assert_eq!(logs[0].block_number, None);
        assert_eq!(logs[1].block_number, Some(1));
        assert_eq!(logs[2].block_number, Some(3));
    }
}
