//! Route discovery over the registered channel graph.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Instant,
};

use parking_lot::Mutex;
use relayer_types::{ChannelInfo, RelayError, Route};

use crate::cache::{RegistryCache, RegistrySnapshot};

/// Cap on distinct routes returned per (source, destination) pair.
const MAX_ROUTES: usize = 8;

/// Rough seconds a hop costs, per block time of the chains involved.
const BLOCKS_PER_HOP: u64 = 10;

struct CachedRoutes {
    routes: Vec<Route>,
    fetched_at: Instant,
}

/// Breadth-first search over open channels, with results cached per
/// `(source, destination)` for the registry's validity window.
pub struct RouteDiscovery {
    cache: Arc<RegistryCache>,
    max_hops: usize,
    found: Mutex<HashMap<(String, String), CachedRoutes>>,
}

impl RouteDiscovery {
    pub fn new(cache: Arc<RegistryCache>, max_hops: usize) -> Self {
        Self {
            cache,
            max_hops,
            found: Mutex::new(HashMap::new()),
        }
    }

    /// All routes from `src` to `dst`, ordered by hop count then estimated
    /// time. Returns an empty list when nothing is reachable or the
    /// registry has no data; never errors.
    pub fn find_routes(&self, src: &str, dst: &str) -> Vec<Route> {
        let key = (src.to_string(), dst.to_string());
        {
            let found = self.found.lock();
            if let Some(cached) = found.get(&key) {
                if cached.fetched_at.elapsed() < self.cache.validity_window() {
                    return cached.routes.clone();
                }
            }
        }

        let snapshot = self.cache.snapshot();
        let routes = self.search(&snapshot, src, dst);
        self.found.lock().insert(
            key,
            CachedRoutes {
                routes: routes.clone(),
                fetched_at: Instant::now(),
            },
        );
        routes
    }

    /// BFS with a per-path visited set and a `max_hops + 1` length cap.
    fn search(&self, snapshot: &RegistrySnapshot, src: &str, dst: &str) -> Vec<Route> {
        if src == dst || !snapshot.chains.contains_key(src) {
            return vec![];
        }

        let mut routes = Vec::new();
        let mut queue: VecDeque<(Vec<String>, Vec<ChannelInfo>)> = VecDeque::new();
        queue.push_back((vec![src.to_string()], vec![]));

        while let Some((chains, channels)) = queue.pop_front() {
            if routes.len() >= MAX_ROUTES {
                break;
            }
            let here = chains.last().expect("path is never empty").clone();
            if chains.len() > self.max_hops {
                // Expanding further would exceed max_hops edges.
                continue;
            }
            for channel in snapshot.channels.get(&here).into_iter().flatten() {
                if !channel.is_open() {
                    continue;
                }
                let next = &channel.counterparty.chain_id;
                if chains.contains(next) {
                    continue;
                }
                let mut chains = chains.clone();
                let mut channels = channels.clone();
                chains.push(next.clone());
                channels.push(channel.clone());
                if next == dst {
                    routes.push(Route {
                        estimated_seconds: estimate_seconds(snapshot, &chains),
                        chains,
                        channels,
                    });
                } else {
                    queue.push_back((chains, channels));
                }
            }
        }

        routes.sort_by_key(|r| (r.hops(), r.estimated_seconds));
        routes
    }

    /// Re-check a previously discovered route against the current snapshot:
    /// every channel must still be open and every chain must resolve a
    /// router address. Short-circuits on the first failure.
    pub fn verify_route(&self, route: &Route) -> Result<(), RelayError> {
        for (i, channel) in route.channels.iter().enumerate() {
            let from = &route.chains[i];
            let to = &route.chains[i + 1];
            if !self.cache.verify_channel(from, to, &channel.channel_id) {
                return Err(RelayError::Validation(format!(
                    "channel {} from {from} to {to} is not open",
                    channel.channel_id
                )));
            }
        }
        for chain in &route.chains {
            if self.cache.get_router(chain).is_none() {
                return Err(RelayError::Validation(format!(
                    "chain {chain} has no registered router"
                )));
            }
        }
        Ok(())
    }

    /// Drop all cached routes, e.g. after an operator-triggered refresh.
    pub fn clear(&self) {
        self.found.lock().clear();
    }
}

fn estimate_seconds(snapshot: &RegistrySnapshot, chains: &[String]) -> u64 {
    chains
        .iter()
        .map(|c| {
            snapshot
                .chains
                .get(c)
                .map(|info| info.block_time * BLOCKS_PER_HOP)
                .unwrap_or(60)
        })
        .sum()
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use relayer_types::{ChainKind, ChannelState};
    use relayer_utils::test_utils::setup_test;

    use super::*;
    use crate::cache::testing::*;

    async fn discovery_from(registry: StaticRegistry) -> (Arc<RegistryCache>, RouteDiscovery) {
        let cache = RegistryCache::connect(registry, default_options())
            .await
            .unwrap();
        let discovery = RouteDiscovery::new(cache.clone(), 4);
        (cache, discovery)
    }

    #[tokio::test]
    async fn finds_the_two_hop_route() {
        setup_test();
        let (_cache, discovery) = discovery_from(three_chain_registry()).await;

        let routes = discovery.find_routes("eth", "osm-1");
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].chains, vec!["eth", "hub-4", "osm-1"]);
        assert_eq!(routes[0].hops(), 2);
        assert_eq!(routes[0].channels[0].channel_id, "channel-0");
        assert_eq!(routes[0].channels[1].channel_id, "channel-141");
    }

    #[tokio::test]
    async fn prefers_fewer_hops() {
        setup_test();
        let registry = StaticRegistry::with_topology(
            vec![
                chain("eth", ChainKind::Evm),
                chain("hub-4", ChainKind::Cosmos),
                chain("osm-1", ChainKind::Cosmos),
            ],
            &[
                ("eth", "channel-0", "hub-4", "channel-100"),
                ("hub-4", "channel-141", "osm-1", "channel-1"),
                ("eth", "channel-7", "osm-1", "channel-2"),
            ],
        );
        let (_cache, discovery) = discovery_from(registry).await;

        let routes = discovery.find_routes("eth", "osm-1");
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].chains, vec!["eth", "osm-1"]);
        assert_eq!(routes[1].chains, vec!["eth", "hub-4", "osm-1"]);
    }

    #[tokio::test]
    async fn closed_channels_are_not_traversed() {
        setup_test();
        let mut registry = three_chain_registry();
        for ch in registry.channels.get_mut("hub-4").unwrap() {
            if ch.counterparty.chain_id == "osm-1" {
                ch.state = ChannelState::Closed;
            }
        }
        let (_cache, discovery) = discovery_from(registry).await;
        assert_eq!(discovery.find_routes("eth", "osm-1"), vec![]);
    }

    #[tokio::test]
    async fn respects_the_hop_cap() {
        setup_test();
        // A five-chain daisy chain needs 4 hops end to end.
        let registry = StaticRegistry::with_topology(
            vec![
                chain("a", ChainKind::Cosmos),
                chain("b", ChainKind::Cosmos),
                chain("c", ChainKind::Cosmos),
                chain("d", ChainKind::Cosmos),
                chain("e", ChainKind::Cosmos),
            ],
            &[
                ("a", "channel-1", "b", "channel-2"),
                ("b", "channel-3", "c", "channel-4"),
                ("c", "channel-5", "d", "channel-6"),
                ("d", "channel-7", "e", "channel-8"),
            ],
        );
        let cache = RegistryCache::connect(registry, default_options())
            .await
            .unwrap();

        let four = RouteDiscovery::new(cache.clone(), 4);
        assert_eq!(four.find_routes("a", "e").len(), 1);

        let three = RouteDiscovery::new(cache, 3);
        assert_eq!(three.find_routes("a", "e"), vec![]);
    }

    #[tokio::test]
    async fn unknown_chains_yield_no_routes() {
        setup_test();
        let (_cache, discovery) = discovery_from(three_chain_registry()).await;
        assert_eq!(discovery.find_routes("nowhere", "osm-1"), vec![]);
        assert_eq!(discovery.find_routes("eth", "eth"), vec![]);
    }

    #[tokio::test]
    async fn verify_route_checks_channels_and_routers() {
        setup_test();
        let (_cache, discovery) = discovery_from(three_chain_registry()).await;
        let route = discovery.find_routes("eth", "osm-1").remove(0);
        assert_eq!(discovery.verify_route(&route), Ok(()));

        let mut registry = three_chain_registry();
        registry.chains[1].router_address = None;
        let (_cache, discovery) = discovery_from(registry).await;
        assert!(discovery.verify_route(&route).is_err());
    }
}
