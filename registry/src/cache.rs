//! Read-mostly cache of the chain registry.
//!
//! Readers get a consistent [`RegistrySnapshot`] per call; a background task
//! rebuilds the snapshot off to the side and publishes it with an `Arc`
//! swap, so readers never block the refresher. A failed refresh keeps the
//! previous snapshot, so a single upstream failure never empties the cache.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use relayer_types::{config::RegistryOptions, ChainInfo, ChannelInfo, HopFee};
use tokio::{
    spawn,
    sync::{Mutex, Notify},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use crate::client::RegistrySource;

/// Attempts made for the initial fetch before startup fails.
const INITIAL_FETCH_ATTEMPTS: usize = 3;

const INITIAL_FETCH_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct RegistrySnapshot {
    pub chains: HashMap<String, ChainInfo>,
    pub channels: HashMap<String, Vec<ChannelInfo>>,
    pub fees: HashMap<String, HopFee>,
    pub fetched_at: Instant,
}

#[derive(Debug, Default)]
struct RefreshTask(Mutex<Option<JoinHandle<()>>>);

impl Drop for RefreshTask {
    fn drop(&mut self) {
        if let Some(task) = self.0.get_mut().take() {
            task.abort();
        }
    }
}

pub struct RegistryCache {
    source: Box<dyn RegistrySource>,
    opt: RegistryOptions,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    /// Pinged by readers that observe a stale snapshot.
    stale: Arc<Notify>,
    refresh_task: RefreshTask,
}

impl RegistryCache {
    /// Fetch the initial snapshot and build the cache. Startup fails if the
    /// registry cannot be reached at all.
    pub async fn connect(
        source: impl RegistrySource,
        opt: RegistryOptions,
    ) -> anyhow::Result<Arc<Self>> {
        let source = Box::new(source);
        let mut last_err = None;
        for attempt in 1..=INITIAL_FETCH_ATTEMPTS {
            match Self::fetch_snapshot(&*source).await {
                Ok(snapshot) => {
                    tracing::info!(
                        chains = snapshot.chains.len(),
                        "loaded initial registry snapshot"
                    );
                    return Ok(Arc::new(Self {
                        source,
                        opt,
                        snapshot: RwLock::new(Arc::new(snapshot)),
                        stale: Arc::new(Notify::new()),
                        refresh_task: RefreshTask::default(),
                    }));
                },
                Err(err) => {
                    tracing::warn!(attempt, "initial registry fetch failed: {err:#}");
                    last_err = Some(err);
                    if attempt < INITIAL_FETCH_ATTEMPTS {
                        sleep(INITIAL_FETCH_RETRY_DELAY).await;
                    }
                },
            }
        }
        Err(last_err.expect("at least one attempt was made"))
    }

    async fn fetch_snapshot(source: &dyn RegistrySource) -> anyhow::Result<RegistrySnapshot> {
        let chains = source.chains().await?;
        let mut channels = HashMap::new();
        let mut fees = HashMap::new();
        for chain in &chains {
            channels.insert(
                chain.chain_id.clone(),
                source.channels(&chain.chain_id).await?,
            );
            // Fee lookup is best-effort; the planner falls back to a static
            // schedule for chains with no published fees.
            match source.fees(&chain.chain_id).await {
                Ok(fee) => {
                    fees.insert(chain.chain_id.clone(), fee);
                },
                Err(err) => {
                    tracing::debug!(chain = %chain.chain_id, "no fee schedule: {err:#}");
                },
            }
        }
        Ok(RegistrySnapshot {
            chains: chains
                .into_iter()
                .map(|c| (c.chain_id.clone(), c))
                .collect(),
            channels,
            fees,
            fetched_at: Instant::now(),
        })
    }

    /// Start the background refresher. Runs until the token is cancelled.
    pub async fn spawn_refresh_task(self: &Arc<Self>, cancel: CancellationToken) {
        let mut task = self.refresh_task.0.lock().await;
        if task.is_some() {
            return;
        }
        let cache = Arc::clone(self);
        *task = Some(spawn(async move {
            let interval = cache.opt.refresh_interval;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(interval) => {},
                    _ = cache.stale.notified() => {},
                }
                cache.refresh().await;
            }
            tracing::debug!("registry refresh task exiting");
        }));
    }

    pub async fn shut_down_tasks(&self) {
        if let Some(task) = self.refresh_task.0.lock().await.take() {
            task.abort();
        }
    }

    /// Replace the snapshot; on failure keep the previous one.
    pub async fn refresh(&self) {
        match Self::fetch_snapshot(&*self.source).await {
            Ok(snapshot) => {
                tracing::debug!(chains = snapshot.chains.len(), "registry snapshot refreshed");
                *self.snapshot.write() = Arc::new(snapshot);
            },
            Err(err) => {
                tracing::warn!("registry refresh failed, keeping previous snapshot: {err:#}");
            },
        }
    }

    /// Current snapshot. Stale snapshots are still served, but the refresher
    /// is signalled so a new fetch starts promptly.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        let snapshot = self.snapshot.read().clone();
        if snapshot.fetched_at.elapsed() > self.opt.cache_timeout {
            self.stale.notify_one();
        }
        snapshot
    }

    pub fn chain(&self, chain_id: &str) -> Option<ChainInfo> {
        self.snapshot().chains.get(chain_id).cloned()
    }

    pub fn list_channels(&self, chain_id: &str) -> Vec<ChannelInfo> {
        self.snapshot()
            .channels
            .get(chain_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_router(&self, chain_id: &str) -> Option<String> {
        self.snapshot()
            .chains
            .get(chain_id)
            .and_then(|c| c.router_address.clone())
    }

    /// Packet-forward receiver registered for a chain, if any.
    pub fn pfm_receiver(&self, chain_id: &str) -> Option<String> {
        self.snapshot()
            .chains
            .get(chain_id)
            .and_then(|c| c.pfm_receiver.clone())
    }

    pub fn fees(&self, chain_id: &str) -> Option<HopFee> {
        self.snapshot().fees.get(chain_id).cloned()
    }

    /// Whether `channel_id` is an open channel on `a` whose counterparty is
    /// `b`.
    pub fn verify_channel(&self, a: &str, b: &str, channel_id: &str) -> bool {
        self.snapshot()
            .channels
            .get(a)
            .into_iter()
            .flatten()
            .any(|ch| {
                ch.channel_id == channel_id && ch.counterparty.chain_id == b && ch.is_open()
            })
    }

    pub fn last_update_age(&self) -> Duration {
        self.snapshot.read().fetched_at.elapsed()
    }

    pub fn validity_window(&self) -> Duration {
        self.opt.cache_timeout
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use relayer_types::{ChainKind, ChannelEnd, ChannelState};

    use super::*;
    use crate::client::RegistrySource;

    /// Static in-memory registry for tests; optionally fails all fetches.
    /// The failure flag is shared so tests can flip it after the cache has
    /// taken ownership of the source.
    pub struct StaticRegistry {
        pub chains: Vec<ChainInfo>,
        pub channels: HashMap<String, Vec<ChannelInfo>>,
        pub fees: HashMap<String, HopFee>,
        pub failing: std::sync::Arc<Mutex<bool>>,
    }

    impl StaticRegistry {
        pub fn with_topology(
            chains: Vec<ChainInfo>,
            links: &[(&str, &str, &str, &str)],
        ) -> Self {
            let mut channels: HashMap<String, Vec<ChannelInfo>> = HashMap::new();
            for (a, ch_a, b, ch_b) in links {
                channels.entry((*a).into()).or_default().push(channel(a, ch_a, b, ch_b));
                channels.entry((*b).into()).or_default().push(channel(b, ch_b, a, ch_a));
            }
            Self {
                chains,
                channels,
                fees: HashMap::new(),
                failing: Default::default(),
            }
        }
    }

    pub fn channel(chain: &str, id: &str, to_chain: &str, to_id: &str) -> ChannelInfo {
        ChannelInfo {
            chain_id: chain.into(),
            channel_id: id.into(),
            port_id: "transfer".into(),
            counterparty: ChannelEnd {
                chain_id: to_chain.into(),
                channel_id: to_id.into(),
                port_id: "transfer".into(),
            },
            state: ChannelState::Open,
        }
    }

    pub fn chain(id: &str, kind: ChainKind) -> ChainInfo {
        ChainInfo {
            chain_id: id.into(),
            chain_name: id.into(),
            kind,
            address_prefix: if kind == ChainKind::Evm { "0x".into() } else { id.split('-').next().unwrap_or("cosmos").into() },
            router_address: Some(format!("{id}-router")),
            pfm_receiver: Some(format!("{id}1pfmreceiver")),
            block_time: 6,
        }
    }

    #[async_trait]
    impl RegistrySource for StaticRegistry {
        async fn chains(&self) -> anyhow::Result<Vec<ChainInfo>> {
            if *self.failing.lock() {
                anyhow::bail!("registry unavailable");
            }
            Ok(self.chains.clone())
        }

        async fn channels(&self, chain_id: &str) -> anyhow::Result<Vec<ChannelInfo>> {
            if *self.failing.lock() {
                anyhow::bail!("registry unavailable");
            }
            Ok(self.channels.get(chain_id).cloned().unwrap_or_default())
        }

        async fn fees(&self, chain_id: &str) -> anyhow::Result<HopFee> {
            self.fees
                .get(chain_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no fees for {chain_id}"))
        }
    }

    pub fn default_options() -> RegistryOptions {
        RegistryOptions {
            base_url: "http://localhost:9100".parse().unwrap(),
            cache_timeout: Duration::from_secs(300),
            refresh_interval: Duration::from_secs(60),
            max_hops: 4,
            hop_timeout: Duration::from_secs(3600),
        }
    }

    pub fn three_chain_registry() -> StaticRegistry {
        StaticRegistry::with_topology(
            vec![
                chain("eth", ChainKind::Evm),
                chain("hub-4", ChainKind::Cosmos),
                chain("osm-1", ChainKind::Cosmos),
            ],
            &[
                ("eth", "channel-0", "hub-4", "channel-100"),
                ("hub-4", "channel-141", "osm-1", "channel-1"),
            ],
        )
    }
}
