//! Chains, channels, routes, and planned forward paths.

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Evm,
    Cosmos,
}

/// Registry record for a chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainInfo {
    pub chain_id: String,
    pub chain_name: String,
    pub kind: ChainKind,
    pub address_prefix: String,
    /// Address of the swap router on this chain, when deployed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_address: Option<String>,
    /// Receiver address used by packet-forward middleware for hops that
    /// terminate on this chain only to be forwarded onward.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pfm_receiver: Option<String>,
    /// Typical seconds between blocks; used to estimate route latency.
    pub block_time: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "INIT")]
    Init,
    #[serde(rename = "TRYOPEN")]
    TryOpen,
    #[serde(rename = "CLOSED")]
    Closed,
}

/// The far side of a channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEnd {
    pub chain_id: String,
    pub channel_id: String,
    pub port_id: String,
}

/// One registered channel between two chains.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub chain_id: String,
    pub channel_id: String,
    pub port_id: String,
    pub counterparty: ChannelEnd,
    pub state: ChannelState,
}

impl ChannelInfo {
    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }
}

/// An ordered path `chains[0] → … → chains[n]` with the channel chosen for
/// each edge (`channels.len() == chains.len() - 1`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub chains: Vec<String>,
    pub channels: Vec<ChannelInfo>,
    /// Rough end-to-end latency estimate in seconds; ordering tie-breaker.
    pub estimated_seconds: u64,
}

impl Route {
    pub fn hops(&self) -> usize {
        self.channels.len()
    }

    pub fn source(&self) -> &str {
        self.chains.first().map(String::as_str).unwrap_or_default()
    }

    pub fn destination(&self) -> &str {
        self.chains.last().map(String::as_str).unwrap_or_default()
    }
}

/// Per-hop fee breakdown, reported alongside a plan for observability.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HopFee {
    pub chain_id: String,
    pub chain_fee: u64,
    pub middleware_fee: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeEstimate {
    pub hops: Vec<HopFee>,
    /// Whether the fallback schedule was used because fee lookup failed.
    pub fallback: bool,
}

impl FeeEstimate {
    pub fn total(&self) -> u64 {
        self.hops
            .iter()
            .map(|h| h.chain_fee + h.middleware_fee)
            .sum()
    }
}

/// One hop of a planned transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedHop {
    pub hop_index: u32,
    pub from_chain: String,
    pub to_chain: String,
    pub channel_id: String,
    pub port_id: String,
    /// Intermediate PFM receiver, or the final HTLC receiver on the last hop.
    pub receiver: String,
    /// Absolute expiry for this hop, unix seconds. Strictly decreasing with
    /// `hop_index`.
    pub timeout: u64,
}

/// Output of the packet-forward planner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardPlan {
    pub route: Route,
    pub hops: Vec<PlannedHop>,
    /// Nested forward memo, JSON-encoded; empty for a direct transfer.
    pub memo: String,
    pub fees: FeeEstimate,
}

impl ForwardPlan {
    /// Check the strictly-decreasing timelock cascade against `now`, with
    /// each hop retaining at least `min_window` seconds of slack.
    pub fn check_cascade(&self, now: u64, min_window: u64) -> Result<(), RelayError> {
        let mut prev: Option<u64> = None;
        for hop in &self.hops {
            if let Some(prev) = prev {
                if hop.timeout >= prev {
                    return Err(RelayError::InvalidTimelockCascade(format!(
                        "hop {} timeout {} does not decrease from {}",
                        hop.hop_index, hop.timeout, prev
                    )));
                }
            }
            if hop.timeout <= now + min_window {
                return Err(RelayError::InvalidTimelockCascade(format!(
                    "hop {} window {}s is below the {min_window}s minimum",
                    hop.hop_index,
                    hop.timeout.saturating_sub(now)
                )));
            }
            prev = Some(hop.timeout);
        }
        Ok(())
    }

    /// Find the hop whose channel pair matches an observed packet; the
    /// fallback used when a memo carries no `hop_index`.
    pub fn hop_for_channels(&self, source_channel: &str, dest_channel: &str) -> Option<u32> {
        self.hops
            .iter()
            .zip(&self.route.channels)
            .find(|(_, ch)| {
                ch.channel_id == source_channel && ch.counterparty.channel_id == dest_channel
            })
            .map(|(hop, _)| hop.hop_index)
    }
}
