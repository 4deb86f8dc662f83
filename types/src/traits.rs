//! Interfaces for external collaborators. The core runs with all of them
//! absent; implementations are wired in by the orchestrator when available.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::relay::{PendingRelay, SwapParams};

/// DEX execution collaborator, invoked after a relay completes when swap
/// parameters are attached.
#[async_trait]
pub trait DexExecutor: Send + Sync {
    /// Whether the target chain has a usable DEX router.
    async fn supports(&self, chain_id: &str) -> bool;

    async fn execute_swap(&self, relay: &PendingRelay, params: &SwapParams)
        -> anyhow::Result<()>;
}

/// Optional persistence collaborator. Keys follow the documented layout:
/// `swap:<relayId>`, `event:<txHash>/<logIndex>`, `lastBlock:<chainId>`.
/// State is recoverable from chain plus the dedup buffer, so every method is
/// best-effort.
#[async_trait]
pub trait RelayStore: Send + Sync {
    async fn put_relay(&self, relay: &PendingRelay) -> anyhow::Result<()>;

    async fn load_relays(&self) -> anyhow::Result<Vec<PendingRelay>>;

    /// Record that an event key has been processed.
    async fn mark_event(&self, event_key: &str) -> anyhow::Result<()>;

    async fn has_event(&self, event_key: &str) -> anyhow::Result<bool>;

    async fn put_last_block(&self, chain_id: &str, height: u64) -> anyhow::Result<()>;

    async fn last_block(&self, chain_id: &str) -> anyhow::Result<Option<u64>>;
}

/// In-memory [`RelayStore`], for tests and for running without persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: parking_lot::Mutex<MemoryStoreInner>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    relays: HashMap<String, PendingRelay>,
    events: HashMap<String, ()>,
    last_blocks: HashMap<String, u64>,
}

#[async_trait]
impl RelayStore for MemoryStore {
    async fn put_relay(&self, relay: &PendingRelay) -> anyhow::Result<()> {
        self.inner
            .lock()
            .relays
            .insert(relay.relay_id.clone(), relay.clone());
        Ok(())
    }

    async fn load_relays(&self) -> anyhow::Result<Vec<PendingRelay>> {
        Ok(self.inner.lock().relays.values().cloned().collect())
    }

    async fn mark_event(&self, event_key: &str) -> anyhow::Result<()> {
        self.inner.lock().events.insert(event_key.to_string(), ());
        Ok(())
    }

    async fn has_event(&self, event_key: &str) -> anyhow::Result<bool> {
        Ok(self.inner.lock().events.contains_key(event_key))
    }

    async fn put_last_block(&self, chain_id: &str, height: u64) -> anyhow::Result<()> {
        self.inner
            .lock()
            .last_blocks
            .insert(chain_id.to_string(), height);
        Ok(())
    }

    async fn last_block(&self, chain_id: &str) -> anyhow::Result<Option<u64>> {
        Ok(self.inner.lock().last_blocks.get(chain_id).copied())
    }
}
