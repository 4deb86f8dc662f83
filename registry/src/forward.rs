//! Packet-forward planner: turns a route into per-hop timeouts, receivers,
//! fees, and the nested forward memo the first transfer carries.

use std::sync::Arc;

use relayer_types::{
    ForwardInstruction, ForwardMemo, ForwardPlan, HopFee, HtlcMemo, PlannedHop, RelayError, Route,
};

use crate::{cache::RegistryCache, routes::RouteDiscovery};

/// Retries requested from the forward middleware per hop.
const FORWARD_RETRIES: u8 = 2;

/// Fallback fee schedule used when the registry publishes none.
const FALLBACK_CHAIN_FEE: u64 = 5_000;
const FALLBACK_MIDDLEWARE_FEE: u64 = 1_000;

pub struct ForwardPlanner {
    cache: Arc<RegistryCache>,
    routes: Arc<RouteDiscovery>,
    max_hops: usize,
    hop_timeout_secs: u64,
}

impl ForwardPlanner {
    pub fn new(
        cache: Arc<RegistryCache>,
        routes: Arc<RouteDiscovery>,
        max_hops: usize,
        hop_timeout_secs: u64,
    ) -> Self {
        Self {
            cache,
            routes,
            max_hops,
            hop_timeout_secs,
        }
    }

    /// Plan the transfer mirroring `htlc` from `src` to `dst`.
    ///
    /// `receiver` is the final receiver on the destination chain.
    /// `min_window` is the minimum seconds of slack every hop must retain
    /// (the engine passes `timeout_buffer / 2`).
    pub fn plan(
        &self,
        src: &str,
        dst: &str,
        receiver: &str,
        htlc: &HtlcMemo,
        now: u64,
        min_window: u64,
    ) -> Result<ForwardPlan, RelayError> {
        let routes = self.routes.find_routes(src, dst);
        let Some(route) = routes.into_iter().next() else {
            return Err(RelayError::NoRouteFound {
                source: src.to_string(),
                target: dst.to_string(),
            });
        };
        if route.hops() > self.max_hops {
            return Err(RelayError::Validation(format!(
                "route needs {} hops, limit is {}",
                route.hops(),
                self.max_hops
            )));
        }
        self.routes.verify_route(&route)?;

        let timeouts = self.cascade(htlc.timelock, now, route.hops())?;
        let hops = self.build_hops(&route, receiver, &timeouts)?;

        let plan = ForwardPlan {
            memo: build_memo(&hops, htlc, now),
            fees: self.fee_estimate(&route),
            route,
            hops,
        };
        plan.check_cascade(now, min_window)?;
        Ok(plan)
    }

    /// Strictly decreasing per-hop expiries.
    ///
    /// Hop `i` of `n` gets `now + ⌊(T-now)/n/2⌋·(n-i)`, bounded by a share
    /// of the hop-timeout cap that shrinks with the remaining hops, so the
    /// bound cannot introduce ties.
    fn cascade(&self, timelock: u64, now: u64, n: usize) -> Result<Vec<u64>, RelayError> {
        if n == 0 {
            return Err(RelayError::InvalidTimelockCascade("route has no hops".into()));
        }
        let n = n as u64;
        let share = timelock.saturating_sub(now) / n / 2;
        if share == 0 {
            return Err(RelayError::InvalidTimelockCascade(format!(
                "timelock {timelock} leaves no room for {n} hops"
            )));
        }
        Ok((0..n)
            .map(|i| {
                let remaining = n - i;
                let raw = share * remaining;
                let cap = self.hop_timeout_secs * remaining / n;
                now + raw.min(cap)
            })
            .collect())
    }

    fn build_hops(
        &self,
        route: &Route,
        receiver: &str,
        timeouts: &[u64],
    ) -> Result<Vec<PlannedHop>, RelayError> {
        let n = route.hops();
        let mut hops = Vec::with_capacity(n);
        for (i, channel) in route.channels.iter().enumerate() {
            let to_chain = &route.chains[i + 1];
            let hop_receiver = if i + 1 == route.chains.len() - 1 {
                receiver.to_string()
            } else {
                // Forwarding chains need a registered PFM receiver; a
                // fabricated address would strand funds.
                self.cache.pfm_receiver(to_chain).ok_or_else(|| {
                    RelayError::Validation(format!(
                        "chain {to_chain} has no registered packet-forward receiver"
                    ))
                })?
            };
            hops.push(PlannedHop {
                hop_index: i as u32,
                from_chain: route.chains[i].clone(),
                to_chain: to_chain.clone(),
                channel_id: channel.channel_id.clone(),
                port_id: channel.port_id.clone(),
                receiver: hop_receiver,
                timeout: timeouts[i],
            });
        }
        Ok(hops)
    }

    /// Additive per-hop fees; falls back to a static schedule when the
    /// registry has none, so a missing fee feed never blocks a plan.
    fn fee_estimate(&self, route: &Route) -> relayer_types::FeeEstimate {
        let mut fallback = false;
        let hops = route.chains[..route.chains.len() - 1]
            .iter()
            .map(|chain| match self.cache.fees(chain) {
                Some(fee) => HopFee {
                    chain_id: chain.clone(),
                    ..fee
                },
                None => {
                    fallback = true;
                    HopFee {
                        chain_id: chain.clone(),
                        chain_fee: FALLBACK_CHAIN_FEE,
                        middleware_fee: FALLBACK_MIDDLEWARE_FEE,
                    }
                },
            })
            .collect();
        relayer_types::FeeEstimate { hops, fallback }
    }
}

/// Build the memo attached to the first transfer.
///
/// With one hop there is nothing to forward: the memo is the HTLC memo
/// itself. With `n` hops, hops `1..n` become nested `forward` levels and the
/// deepest level carries the HTLC memo.
pub fn build_memo(hops: &[PlannedHop], htlc: &HtlcMemo, now: u64) -> String {
    let forwarded = &hops[1..];
    if forwarded.is_empty() {
        return htlc.to_json();
    }
    let mut memo: Option<ForwardMemo> = None;
    for hop in forwarded.iter().rev() {
        let innermost = memo.is_none();
        memo = Some(ForwardMemo {
            forward: ForwardInstruction {
                receiver: hop.receiver.clone(),
                port: hop.port_id.clone(),
                channel: hop.channel_id.clone(),
                timeout: format!("{}s", hop.timeout.saturating_sub(now)),
                retries: FORWARD_RETRIES,
                hop_index: Some(hop.hop_index),
                next: memo.take().map(Box::new),
                memo: innermost.then(|| htlc.to_json()),
                htlc: None,
            },
        });
    }
    memo.expect("at least one forwarded hop").to_json()
}
