//! IBC-chain polling monitor.
//!
//! Walks heights one block at a time, searching each block's transactions
//! for events from the configured HTLC contract and for packet outcomes
//! (acknowledgements and timeouts) on packets we sent. Failed transactions
//! are ignored entirely.

use std::{collections::HashMap, num::NonZeroUsize, sync::Arc};

use base64::Engine;
use lru::LruCache;
use parking_lot::Mutex;
use relayer_recovery::RecoveryManager;
use relayer_types::{
    config::CosmosOptions, HtlcCreated, HtlcEvent, HtlcRefunded, HtlcWithdrawn, OperationKind,
    PacketEvent, PacketOutcome, RelayError,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::CosmosClient;

/// Heights scanned per poll at most.
const MAX_HEIGHTS_PER_POLL: u64 = 50;

/// A decoded event, independent of the RPC wire representation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: String,
    pub attributes: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CosmosMonitorHealth {
    pub chain_id: String,
    pub last_height: Option<u64>,
    pub heights_behind: u64,
    pub error_count: u64,
    pub live: bool,
}

#[derive(Debug)]
struct MonitorState {
    last_height: Option<u64>,
    dedup: LruCache<String, ()>,
    error_count: u64,
    heights_behind: u64,
    live: bool,
}

pub struct CosmosMonitor {
    client: Arc<CosmosClient>,
    recovery: Arc<RecoveryManager>,
    events: async_channel::Sender<HtlcEvent>,
    packets: async_channel::Sender<PacketEvent>,
    opt: CosmosOptions,
    state: Mutex<MonitorState>,
}

impl CosmosMonitor {
    pub fn new(
        client: Arc<CosmosClient>,
        recovery: Arc<RecoveryManager>,
        events: async_channel::Sender<HtlcEvent>,
        packets: async_channel::Sender<PacketEvent>,
        opt: CosmosOptions,
        start_height: Option<u64>,
    ) -> Self {
        Self {
            client,
            recovery,
            events,
            packets,
            opt,
            state: Mutex::new(MonitorState {
                last_height: start_height,
                dedup: LruCache::new(NonZeroUsize::new(10_000).expect("nonzero")),
                error_count: 0,
                heights_behind: 0,
                live: false,
            }),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        self.state.lock().live = true;
        tracing::info!(chain = self.client.chain_id(), "cosmos monitor started");
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
                    "cosmos poll failed: {err}"
                );
            }
        }
        self.state.lock().live = false;
        tracing::info!(chain = self.client.chain_id(), "cosmos monitor stopped");
    }

    async fn tick(&self) -> Result<(), RelayError> {
        let chain = self.client.chain_id().to_string();
        let head = self
            .recovery
            .execute(OperationKind::IbcRpc, &chain, || self.client.latest_height())
            .await?;

        let from = {
            let mut state = self.state.lock();
            match state.last_height {
                Some(last) => {
                    state.heights_behind = head.saturating_sub(last);
                    last + 1
                },
                None => {
                    state.last_height = Some(head);
                    state.heights_behind = 0;
                    return Ok(());
                },
            }
        };
        if from > head {
            return Ok(());
        }
        let to = head.min(from + MAX_HEIGHTS_PER_POLL - 1);

        for height in from..=to {
            let txs = self
                .recovery
                .execute(OperationKind::IbcRpc, &chain, || {
                    self.client.txs_at_height(height)
                })
                .await?;
            for tx in txs {
                // Failed transactions emit no effects.
                if tx.tx_result.code.is_err() {
                    continue;
                }
                let tx_hash = tx.hash.to_string();
                let raw = decode_events(&tx.tx_result.events);
                self.deliver_htlc_events(&chain, &tx_hash, height, &raw)?;
                self.deliver_packet_events(&chain, &raw);
            }
            self.state.lock().last_height = Some(height);
        }
        let mut state = self.state.lock();
        state.heights_behind = head.saturating_sub(to);
        Ok(())
    }

    fn deliver_htlc_events(
        &self,
        chain: &str,
        tx_hash: &str,
        height: u64,
        events: &[RawEvent],
    ) -> Result<(), RelayError> {
        for (index, event) in events.iter().enumerate() {
            let Some(event) =
                parse_htlc_event(chain, self.client.htlc_contract(), tx_hash, height, index as u64, event)
            else {
                continue;
            };
            let key = event.dedup_key();
            if self.state.lock().dedup.contains(&key) {
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

    fn deliver_packet_events(&self, chain: &str, events: &[RawEvent]) {
        for outcome in extract_packet_outcomes(chain, events) {
            // Packet outcomes are advisory for the ack handler; the sweep
            // there catches anything dropped here.
            if self.packets.try_send(outcome).is_err() {
                tracing::warn!(chain, "packet outcome queue full, dropping event");
            }
        }
    }

    pub fn health(&self) -> CosmosMonitorHealth {
        let state = self.state.lock();
        CosmosMonitorHealth {
            chain_id: self.client.chain_id().to_string(),
            last_height: state.last_height,
            heights_behind: state.heights_behind,
            error_count: state.error_count,
            live: state.live,
        }
    }
}

/// Convert RPC events into [`RawEvent`]s, decoding base64 attributes where
/// chains still emit them.
pub fn decode_events(events: &[tendermint::abci::Event]) -> Vec<RawEvent> {
    events
        .iter()
        .map(|event| RawEvent {
            kind: event.kind.clone(),
            attributes: event
                .attributes
                .iter()
                .filter_map(|attr| {
                    let key = attr.key_str().ok()?;
                    let value = attr.value_str().ok()?;
                    Some((decode_attr(key), decode_attr(value)))
                })
                .collect(),
        })
        .collect()
}

/// Older chains base64-encode every attribute. Decode when the payload is
/// decodable printable UTF-8, otherwise keep the raw string.
pub fn decode_attr(raw: &str) -> String {
    let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(raw) else {
        return raw.to_string();
    };
    match String::from_utf8(bytes) {
        Ok(decoded)
            if !decoded.is_empty()
                && decoded
                    .chars()
                    .all(|c| !c.is_control() && (c.is_ascii_graphic() || c == ' ')) =>
        {
            decoded
        },
        _ => raw.to_string(),
    }
}

/// Amounts arrive either as a JSON coin array or as `"<n><denom>[,...]"`.
/// Returns the first coin as `(amount, denom)`.
pub fn parse_amount(raw: &str) -> Option<(String, String)> {
    #[derive(Deserialize)]
    struct Coin {
        denom: String,
        amount: String,
    }
    if let Ok(coins) = serde_json::from_str::<Vec<Coin>>(raw) {
        return coins.into_iter().next().map(|c| (c.amount, c.denom));
    }
    let first = raw.split(',').next()?.trim();
    let split = first.find(|c: char| !c.is_ascii_digit())?;
    let (amount, denom) = first.split_at(split);
    if amount.is_empty() || denom.is_empty() {
        return None;
    }
    Some((amount.to_string(), denom.to_string()))
}

/// Parse one contract event into an [`HtlcEvent`], keyed by its `action`
/// attribute. Events from other contracts are ignored.
pub fn parse_htlc_event(
    chain_id: &str,
    contract: &str,
    tx_hash: &str,
    height: u64,
    index: u64,
    event: &RawEvent,
) -> Option<HtlcEvent> {
    if event.kind != "wasm" {
        return None;
    }
    let attrs = &event.attributes;
    if attrs.get("_contract_address").map(String::as_str) != Some(contract) {
        return None;
    }
    if let Some(memo) = attrs.get("memo") {
        if let Err(err) = relayer_types::memo::validate_memo(memo) {
            tracing::warn!(tx_hash, "dropping event with invalid memo: {err}");
            return None;
        }
    }
    let htlc_id = attrs.get("htlc_id").or_else(|| attrs.get("id"))?.clone();
    match attrs.get("action").map(String::as_str) {
        Some("create_htlc") => {
            let (amount, token) = parse_amount(attrs.get("amount")?)?;
            Some(HtlcEvent::Created(HtlcCreated {
                chain_id: chain_id.to_string(),
                htlc_id,
                sender: attrs.get("sender").cloned().unwrap_or_default(),
                receiver: attrs.get("receiver").cloned().unwrap_or_default(),
                amount,
                token,
                hashlock: attrs.get("hashlock").cloned().unwrap_or_default(),
                timelock: attrs.get("timelock").and_then(|t| t.parse().ok())?,
                target_chain: attrs.get("target_chain").cloned().unwrap_or_default(),
                target_address: attrs.get("target_address").cloned().unwrap_or_default(),
                block_number: height,
                tx_hash: tx_hash.to_string(),
                log_index: index,
            }))
        },
        Some("withdraw") => Some(HtlcEvent::Withdrawn(HtlcWithdrawn {
            chain_id: chain_id.to_string(),
            htlc_id,
            secret: attrs.get("secret").cloned().unwrap_or_default(),
            block_number: height,
            tx_hash: tx_hash.to_string(),
            log_index: index,
        })),
        Some("refund") => Some(HtlcEvent::Refunded(HtlcRefunded {
            chain_id: chain_id.to_string(),
            htlc_id,
            block_number: height,
            tx_hash: tx_hash.to_string(),
            log_index: index,
        })),
        _ => None,
    }
}

/// Match acknowledgement and timeout events to packet outcomes.
///
/// `acknowledge_packet` alone means success; an `error` attribute on the
/// transfer app's `fungible_token_packet` event in the same transaction
/// downgrades it to an error ack. `timeout_packet` maps to a timeout.
pub fn extract_packet_outcomes(chain_id: &str, events: &[RawEvent]) -> Vec<PacketEvent> {
    let ack_error = events
        .iter()
        .filter(|e| e.kind == "fungible_token_packet")
        .find_map(|e| e.attributes.get("error").cloned());

    let mut outcomes = Vec::new();
    for event in events {
        let outcome = match event.kind.as_str() {
            "acknowledge_packet" => match &ack_error {
                Some(error) => PacketOutcome::Error(error.clone()),
                None => PacketOutcome::Success,
            },
            "timeout_packet" => PacketOutcome::Timeout,
            _ => continue,
        };
        let attrs = &event.attributes;
        let (Some(source_channel), Some(dest_channel), Some(sequence)) = (
            attrs.get("packet_src_channel"),
            attrs.get("packet_dst_channel"),
            attrs.get("packet_sequence").and_then(|s| s.parse().ok()),
        ) else {
            tracing::warn!(chain_id, kind = %event.kind, "malformed packet event, ignoring");
            continue;
        };
        outcomes.push(PacketEvent {
            chain_id: chain_id.to_string(),
            source_channel: source_channel.clone(),
            dest_channel: dest_channel.clone(),
            sequence,
            outcome,
        });
    }
    outcomes
}
