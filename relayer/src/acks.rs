//! Acknowledgment and timeout handling for in-flight packets.
//!
//! The engine registers every packet it submits; packet outcomes observed
//! by the IBC monitor are matched here and turned into engine commands.
//! Packets with no registration (e.g. after a restart) are resolved against
//! the planned routes: the forward memo's `hop_index` when the plan carries
//! one, otherwise the packet's channel pair matched against the route.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use relayer_types::{packet_key, ForwardPlan, MemoBody, PacketEvent, PacketOutcome};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::engine::EngineCommand;

/// Ack records older than this are swept.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// How often the sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
struct AckRecord {
    relay_id: String,
    hop_index: u32,
    /// A packet-forward transfer's outer ack settles every remaining hop.
    covers_remaining: bool,
    registered_at: Instant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AckHandlerHealth {
    pub pending_acks: usize,
}

pub struct AckHandler {
    pending: Mutex<HashMap<String, AckRecord>>,
    commands: async_channel::Sender<EngineCommand>,
    /// Shared view of the engine's planned routes, for packets that lost
    /// their registration.
    plans: Mutex<Option<Arc<Mutex<HashMap<String, ForwardPlan>>>>>,
    max_age: Duration,
}

impl AckHandler {
    pub fn new(commands: async_channel::Sender<EngineCommand>, max_age: Duration) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            commands,
            plans: Mutex::new(None),
            max_age,
        })
    }

    /// Wire in the engine's plan map after the engine exists. Called once
    /// by the orchestrator.
    pub fn attach_plans(&self, plans: Arc<Mutex<HashMap<String, ForwardPlan>>>) {
        *self.plans.lock() = Some(plans);
    }

    /// Track a packet the engine just submitted.
    pub fn register_packet(
        &self,
        source_channel: &str,
        sequence: u64,
        relay_id: &str,
        hop_index: u32,
        covers_remaining: bool,
    ) {
        let key = packet_key(source_channel, sequence);
        tracing::debug!(%key, relay_id, hop_index, "tracking packet");
        self.pending.lock().insert(
            key,
            AckRecord {
                relay_id: relay_id.to_string(),
                hop_index,
                covers_remaining,
                registered_at: Instant::now(),
            },
        );
    }

    /// Consume the outcome of one packet. Unknown packets fall back to plan
    /// matching; still-unknown ones are logged and dropped.
    pub async fn handle_outcome(&self, event: PacketEvent) {
        let record = self.pending.lock().remove(&event.key());
        let record = match record {
            Some(record) => record,
            None => match self.resolve_unregistered(&event) {
                Some(record) => record,
                None => {
                    tracing::debug!(key = %event.key(), "outcome for unknown packet, ignoring");
                    return;
                },
            },
        };

        let command = match &event.outcome {
            PacketOutcome::Success => EngineCommand::AdvanceHop {
                relay_id: record.relay_id.clone(),
                hop_index: record.hop_index,
                covers_remaining: record.covers_remaining,
            },
            PacketOutcome::Error(error) => EngineCommand::HopFailed {
                relay_id: record.relay_id.clone(),
                reason: format!("ack error at hop {}: {error}", record.hop_index),
            },
            PacketOutcome::Timeout => EngineCommand::HopFailed {
                relay_id: record.relay_id.clone(),
                reason: format!("packet timed out at hop {}", record.hop_index),
            },
        };
        if self.commands.send(command).await.is_err() {
            tracing::warn!(relay_id = %record.relay_id, "engine command channel closed");
        }
    }

    /// Match an unregistered packet against the planned routes.
    fn resolve_unregistered(&self, event: &PacketEvent) -> Option<AckRecord> {
        let plans = self.plans.lock().clone()?;
        let plans = plans.lock();
        for (relay_id, plan) in plans.iter() {
            if let Some(hop_index) =
                plan.hop_for_channels(&event.source_channel, &event.dest_channel)
            {
                tracing::info!(
                    %relay_id,
                    hop_index,
                    key = %event.key(),
                    "resolved unregistered packet from its planned route"
                );
                return Some(AckRecord {
                    relay_id: relay_id.clone(),
                    hop_index,
                    covers_remaining: true,
                    registered_at: Instant::now(),
                });
            }
        }
        None
    }

    /// Derive a hop index from a packet's memo, falling back to the planned
    /// route's channel pair.
    pub fn hop_index_for(
        plan: &ForwardPlan,
        memo: &MemoBody,
        source_channel: &str,
        dest_channel: &str,
    ) -> Option<u32> {
        if let MemoBody::Forwarded { forward, .. } = memo {
            if let Some(hop_index) = forward.forward.hop_index {
                return Some(hop_index);
            }
        }
        plan.hop_for_channels(source_channel, dest_channel)
    }

    /// Drop records older than `max_age`; newer ones stay.
    pub fn clear_old_entries(&self) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, record| record.registered_at.elapsed() < self.max_age);
        let dropped = before - pending.len();
        if dropped > 0 {
            tracing::info!(dropped, "swept stale ack records");
        }
        dropped
    }

    pub fn health(&self) -> AckHandlerHealth {
        AckHandlerHealth {
            pending_acks: self.pending.lock().len(),
        }
    }

    /// Consume packet outcomes until cancelled, sweeping periodically.
    pub async fn run(
        &self,
        packets: async_channel::Receiver<PacketEvent>,
        cancel: CancellationToken,
    ) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => {
                    self.clear_old_entries();
                },
                event = packets.recv() => match event {
                    Ok(event) => self.handle_outcome(event).await,
                    Err(_) => break,
                },
            }
        }
        tracing::debug!("ack handler exiting");
    }
}
