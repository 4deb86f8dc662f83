//! EVM polling monitor with reorg tolerance, bounded dedup, and replay.
//!
//! The loop only ever scans blocks at least `confirmations` behind the head,
//! so a delivered event can no longer be reorged out. The cursor advances
//! only after every event in a scanned range has been enqueued, which makes
//! a full queue self-healing: unsent events are re-observed on the next poll
//! and the dedup ring suppresses the ones that already went out.

use std::{num::NonZeroUsize, sync::Arc};

use lru::LruCache;
use parking_lot::Mutex;
use relayer_recovery::RecoveryManager;
use relayer_types::{config::EvmOptions, HtlcEvent, OperationKind, RelayError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::EvmClient;

#[derive(Debug)]
struct MonitorState {
    last_block: Option<u64>,
    dedup: LruCache<String, ()>,
    error_count: u64,
    blocks_behind: u64,
    live: bool,
}

/// Health snapshot, readable while the loop runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvmMonitorHealth {
    pub chain_id: String,
    pub last_block: Option<u64>,
    pub blocks_behind: u64,
    pub error_count: u64,
    pub live: bool,
}

pub struct EvmMonitor {
    client: Arc<EvmClient>,
    recovery: Arc<RecoveryManager>,
    events: async_channel::Sender<HtlcEvent>,
    opt: EvmOptions,
    state: Mutex<MonitorState>,
}

impl EvmMonitor {
    pub fn new(
        client: Arc<EvmClient>,
        recovery: Arc<RecoveryManager>,
        events: async_channel::Sender<HtlcEvent>,
        opt: EvmOptions,
        start_block: Option<u64>,
    ) -> Self {
        let dedup_capacity =
            NonZeroUsize::new(opt.dedup_capacity.max(1)).expect("capacity is at least 1");
        Self {
            client,
            recovery,
            events,
            opt,
            state: Mutex::new(MonitorState {
                last_block: start_block,
                dedup: LruCache::new(dedup_capacity),
                error_count: 0,
                blocks_behind: 0,
                live: false,
            }),
        }
    }

    /// The polling loop. Exits when the token is cancelled, after finishing
    /// its in-flight iteration.
    pub async fn run(&self, cancel: CancellationToken) {
        self.state.lock().live = true;
        tracing::info!(chain = self.client.chain_id(), "evm monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.opt.polling_interval) => {},
            }
            if let Err(err) = self.tick().await {
                let errors = {
                    let mut state = self.state.lock();
                    state.error_count += 1;
                    state.error_count
                };
                tracing::warn!(
                    chain = self.client.chain_id(),
                    errors,
                    "evm poll failed: {err}"
                );
            }
        }
        self.state.lock().live = false;
        tracing::info!(chain = self.client.chain_id(), "evm monitor stopped");
    }

    /// One poll: scan `[last+1, min(head - confirmations, last + batch)]`.
    async fn tick(&self) -> Result<(), RelayError> {
        let chain = self.client.chain_id().to_string();
        let head = self
            .recovery
            .execute(OperationKind::EvmRpc, &chain, || self.client.block_number())
            .await?;
        let safe_head = head.saturating_sub(self.opt.confirmations);

        let from = {
            let mut state = self.state.lock();
            match state.last_block {
                Some(last) => {
                    state.blocks_behind = safe_head.saturating_sub(last);
                    last + 1
                },
                None => {
                    // First poll: start at the finality horizon, nothing to
                    // backfill.
                    state.last_block = Some(safe_head);
                    state.blocks_behind = 0;
                    return Ok(());
                },
            }
        };
        if from > safe_head {
            return Ok(());
        }
        let to = safe_head.min(from + self.opt.max_blocks_per_batch.max(1) - 1);

        let events = self
            .recovery
            .execute(OperationKind::EvmRpc, &chain, || {
                self.client.query_events(from, to)
            })
            .await?;
        tracing::debug!(%chain, from, to, count = events.len(), "scanned evm blocks");

        self.deliver(events)?;

        let mut state = self.state.lock();
        state.last_block = Some(to);
        state.blocks_behind = safe_head.saturating_sub(to);
        Ok(())
    }

    /// Enqueue events in order, suppressing replays. Fails without marking
    /// the remaining events if the queue fills, so the caller does not
    /// advance the cursor past them.
    fn deliver(&self, events: Vec<HtlcEvent>) -> Result<(), RelayError> {
        for event in events {
            let key = event.dedup_key();
            if self.state.lock().dedup.contains(&key) {
                tracing::debug!(%key, "suppressing duplicate event");
                continue;
            }
            match self.events.try_send(event) {
                Ok(()) => {
                    self.state.lock().dedup.put(key, ());
                },
                Err(async_channel::TrySendError::Full(_)) => {
                    return Err(RelayError::TransientNetwork(
                        "relay queue full, holding back monitor cursor".into(),
                    ));
                },
                Err(async_channel::TrySendError::Closed(_)) => {
                    return Err(RelayError::TransientNetwork("relay queue closed".into()));
                },
            }
        }
        Ok(())
    }

    /// Re-scan a historical range and deliver anything the dedup ring has
    /// not seen. Refused while the live loop is running.
    pub async fn replay_events(&self, from: u64, to: u64) -> Result<usize, RelayError> {
        if self.state.lock().live {
            return Err(RelayError::Validation(
                "replay refused while the live monitor loop is running".into(),
            ));
        }
        if from > to {
            return Err(RelayError::Validation(format!(
                "invalid replay range {from}..={to}"
            )));
        }
        let chain = self.client.chain_id().to_string();
        let events = self
            .recovery
            .execute(OperationKind::EvmRpc, &chain, || {
                self.client.query_events(from, to)
            })
            .await?;
        let count = events.len();
        self.deliver(events)?;
        Ok(count)
    }

    pub fn health(&self) -> EvmMonitorHealth {
        let state = self.state.lock();
        EvmMonitorHealth {
            chain_id: self.client.chain_id().to_string(),
            last_block: state.last_block,
            blocks_behind: state.blocks_behind,
            error_count: state.error_count,
            live: state.live,
        }
    }
}
