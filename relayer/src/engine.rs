//! The relay engine: one state machine per observed source HTLC.
//!
//! Monitors feed `HtlcEvent`s into a bounded queue; a dispatcher turns
//! creations into `PendingRelay` records and hands their ids to a fixed
//! worker pool. Workers drive `pending → relaying`, plan the path, and
//! submit the mirroring transfer; acknowledgements flowing back through the
//! command channel finish the job. Every relay is processed at most once
//! per attempt, transitions are serialized under the relay map lock, and
//! terminal states are never left.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chain_monitors::IbcTransferRequest;
use chain_registry::{forward::build_memo, ForwardPlanner};
use parking_lot::Mutex;
use relayer_recovery::RecoveryManager;
use relayer_types::{
    config::RelayOptions,
    memo::{is_valid_channel_id, is_valid_hashlock, is_valid_port_id, validate_text},
    relay_id,
    traits::{DexExecutor, RelayStore},
    ForwardPlan, HtlcCreated, HtlcEvent, HtlcMemo, HtlcRefunded, HtlcWithdrawn, OperationKind,
    PendingRelay, RelayError, RelayStatus,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    acks::AckHandler,
    gateways::{EvmGateway, IbcGateway},
};

/// Terminal relays stay queryable this long before the sweep drops them.
const RELAY_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Commands flowing back into the engine from the ack handler.
#[derive(Clone, Debug)]
pub enum EngineCommand {
    AdvanceHop {
        relay_id: String,
        hop_index: u32,
        /// Whether this acknowledgement covers every remaining hop (the
        /// usual case for a packet-forward transfer, where the outer ack
        /// only arrives once the whole chain has settled).
        covers_remaining: bool,
    },
    HopFailed {
        relay_id: String,
        reason: String,
    },
}

/// Counters surfaced through `metrics()`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelayMetrics {
    pub pending: usize,
    pub relaying: usize,
    pub completed: usize,
    pub failed: usize,
    pub successful_relays: u64,
    pub failed_relays: u64,
    pub queue_depth: usize,
    pub relays: Vec<PendingRelay>,
}

enum RelayOutcome {
    /// The destination leg settled synchronously.
    Completed,
    /// An IBC transfer is in flight; acks will finish the relay.
    AwaitingAcks { total_hops: u32 },
}

/// Reject source events whose user-controlled fields could not survive a
/// memo round trip.
fn validate_created(event: &HtlcCreated) -> Result<(), RelayError> {
    if !is_valid_hashlock(&event.hashlock) {
        return Err(RelayError::Validation(format!(
            "hashlock {:?} is not 32 bytes of hex",
            event.hashlock
        )));
    }
    validate_text(&event.receiver)?;
    validate_text(&event.target_address)?;
    validate_text(&event.target_chain)?;
    Ok(())
}

pub struct RelayEngine {
    opt: RelayOptions,
    recovery: Arc<RecoveryManager>,
    planner: Arc<ForwardPlanner>,
    ibc: Arc<dyn IbcGateway>,
    evm: Arc<dyn EvmGateway>,
    acks: Arc<AckHandler>,
    dex: Option<Arc<dyn DexExecutor>>,
    /// Optional persistence; the engine is correct without it.
    store: Option<Arc<dyn RelayStore>>,

    relays: Mutex<HashMap<String, PendingRelay>>,
    plans: Arc<Mutex<HashMap<String, ForwardPlan>>>,

    events: async_channel::Receiver<HtlcEvent>,
    work_tx: async_channel::Sender<String>,
    work_rx: async_channel::Receiver<String>,
    commands_rx: async_channel::Receiver<EngineCommand>,

    successful_relays: AtomicU64,
    failed_relays: AtomicU64,
}

impl RelayEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        opt: RelayOptions,
        recovery: Arc<RecoveryManager>,
        planner: Arc<ForwardPlanner>,
        ibc: Arc<dyn IbcGateway>,
        evm: Arc<dyn EvmGateway>,
        acks: Arc<AckHandler>,
        dex: Option<Arc<dyn DexExecutor>>,
        store: Option<Arc<dyn RelayStore>>,
        events: async_channel::Receiver<HtlcEvent>,
        commands_rx: async_channel::Receiver<EngineCommand>,
    ) -> Arc<Self> {
        let (work_tx, work_rx) = async_channel::bounded(opt.queue_capacity.max(1));
        Arc::new(Self {
            opt,
            recovery,
            planner,
            ibc,
            evm,
            acks,
            dex,
            store,
            relays: Mutex::new(HashMap::new()),
            plans: Arc::new(Mutex::new(HashMap::new())),
            events,
            work_tx,
            work_rx,
            commands_rx,
            successful_relays: AtomicU64::new(0),
            failed_relays: AtomicU64::new(0),
        })
    }

    /// Shared view of planned routes, used by the ack handler to resolve
    /// packets that lost their registration.
    pub fn plans(&self) -> Arc<Mutex<HashMap<String, ForwardPlan>>> {
        self.plans.clone()
    }

    /// Spawn the dispatcher, the worker pool, the command loop, and the
    /// housekeeping sweep.
    pub fn spawn_tasks(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut tasks = Vec::new();

        let engine = self.clone();
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            engine.dispatch_loop(token).await;
        }));

        for worker in 0..self.opt.batch_size.max(1) {
            let engine = self.clone();
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move {
                engine.worker_loop(worker, token).await;
            }));
        }

        let engine = self.clone();
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            engine.command_loop(token).await;
        }));

        let engine = self.clone();
        tasks.push(tokio::spawn(async move {
            engine.housekeeping_loop(cancel).await;
        }));

        tasks
    }

    async fn dispatch_loop(&self, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };
            match event {
                HtlcEvent::Created(created) => self.handle_created(created).await,
                HtlcEvent::Withdrawn(withdrawn) => self.handle_withdrawn(withdrawn).await,
                HtlcEvent::Refunded(refunded) => self.handle_refunded(refunded).await,
            }
        }
        tracing::debug!("engine dispatcher exiting");
    }

    async fn worker_loop(&self, worker: usize, cancel: CancellationToken) {
        loop {
            let relay_id = tokio::select! {
                _ = cancel.cancelled() => break,
                id = self.work_rx.recv() => match id {
                    Ok(id) => id,
                    Err(_) => break,
                },
            };
            tracing::debug!(worker, %relay_id, "worker picked up relay");
            self.process_relay(&relay_id).await;
        }
        tracing::debug!(worker, "engine worker exiting");
    }

    async fn command_loop(&self, cancel: CancellationToken) {
        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => break,
                command = self.commands_rx.recv() => match command {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };
            match command {
                EngineCommand::AdvanceHop {
                    relay_id,
                    hop_index,
                    covers_remaining,
                } => {
                    self.advance_hop(&relay_id, hop_index, covers_remaining)
                        .await
                },
                EngineCommand::HopFailed { relay_id, reason } => {
                    self.hop_failed(&relay_id, &reason)
                },
            }
        }
        tracing::debug!("engine command loop exiting");
    }

    async fn housekeeping_loop(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.opt.processing_interval) => {},
            }
            self.requeue_due_retries();
            self.sweep_terminal(relayer_utils::now_unix());
        }
        tracing::debug!("engine housekeeping exiting");
    }

    /// Ingest a source HTLC. Idempotent on `relay_id`: replays log and drop.
    /// Events whose user-supplied fields fail validation are dropped before
    /// a relay record exists.
    pub async fn handle_created(&self, event: HtlcCreated) {
        let id = relay_id(&event.chain_id, &event.htlc_id);
        if let Err(err) = validate_created(&event) {
            tracing::warn!(relay_id = %id, "dropping invalid source event: {err}");
            return;
        }
        let now = relayer_utils::now_unix();
        {
            let mut relays = self.relays.lock();
            if relays.contains_key(&id) {
                tracing::info!(relay_id = %id, "duplicate source event, dropping");
                return;
            }
            let mut relay = PendingRelay::from_created(&event, now);

            // Refuse swaps whose source lock expires before we could safely
            // unwind a failed destination leg.
            let buffer = self.opt.timeout_buffer.as_secs();
            if relay.timelock < now + buffer {
                tracing::warn!(
                    relay_id = %id,
                    timelock = relay.timelock,
                    "timelock too close, refusing relay"
                );
                relay.fail_terminally(
                    RelayError::TimelockTooClose {
                        timelock: relay.timelock,
                        buffer,
                    }
                    .label(),
                    now,
                );
                self.failed_relays.fetch_add(1, Ordering::Relaxed);
                self.persist(&relay);
                relays.insert(id, relay);
                return;
            }
            self.persist(&relay);
            relays.insert(id.clone(), relay);
        }
        tracing::info!(relay_id = %id, target = %event.target_chain, "new relay");
        self.enqueue(&id).await;
    }

    /// A withdrawal on the destination leg reveals the preimage; claim the
    /// source leg with it.
    pub async fn handle_withdrawn(&self, event: HtlcWithdrawn) {
        let found = {
            let mut relays = self.relays.lock();
            relays
                .values_mut()
                .find(|r| r.htlc_id == event.htlc_id && r.source_chain != event.chain_id)
                .map(|relay| {
                    relay.secret = Some(event.secret.clone());
                    (relay.relay_id.clone(), relay.source_chain.clone())
                })
        };
        let Some((id, source_chain)) = found else {
            tracing::debug!(htlc_id = %event.htlc_id, "withdrawal for unknown relay");
            return;
        };
        tracing::info!(relay_id = %id, "secret revealed, claiming source leg");

        let result = if source_chain == self.evm.chain_id() {
            self.recovery
                .execute(OperationKind::ContractCall, &id, || {
                    self.evm.withdraw(&event.htlc_id, &event.secret)
                })
                .await
        } else {
            self.recovery
                .execute(OperationKind::ContractCall, &id, || {
                    self.ibc.withdraw(&event.htlc_id, &event.secret)
                })
                .await
        };
        match result {
            Ok(tx) => tracing::info!(relay_id = %id, %tx, "source leg withdrawn"),
            Err(err) => tracing::error!(relay_id = %id, "source withdraw failed: {err}"),
        }
    }

    /// A refund on the source leg ends the relay.
    pub async fn handle_refunded(&self, event: HtlcRefunded) {
        let id = relay_id(&event.chain_id, &event.htlc_id);
        let now = relayer_utils::now_unix();
        let mut relays = self.relays.lock();
        if let Some(relay) = relays.get_mut(&id) {
            if !relay.is_terminal() {
                tracing::warn!(relay_id = %id, "source HTLC refunded, abandoning relay");
                relay.fail_terminally("source-refunded", now);
                self.failed_relays.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn enqueue(&self, relay_id: &str) {
        if let Err(err) = self.work_tx.send(relay_id.to_string()).await {
            tracing::error!(%relay_id, "work queue closed: {err}");
        }
    }

    /// One attempt at driving a relay from `pending` to a submitted (or
    /// settled) destination leg.
    async fn process_relay(&self, id: &str) {
        let relay = {
            let mut relays = self.relays.lock();
            let Some(relay) = relays.get_mut(id) else {
                return;
            };
            // Stale queue entries (completed meanwhile, duplicate requeue)
            // are no-ops.
            if relay.status != RelayStatus::Pending {
                return;
            }
            let now = relayer_utils::now_unix();
            if relay.transition(RelayStatus::Relaying, now).is_err() {
                return;
            }
            relay.attempts += 1;
            relay.clone()
        };
        tracing::info!(relay_id = id, attempt = relay.attempts, "relaying");

        let result = self
            .recovery
            .execute(OperationKind::Relay, id, || self.relay_once(&relay))
            .await;

        let now = relayer_utils::now_unix();
        match result {
            Ok(RelayOutcome::Completed) => self.complete_relay(id).await,
            Ok(RelayOutcome::AwaitingAcks { total_hops }) => {
                let mut relays = self.relays.lock();
                if let Some(relay) = relays.get_mut(id) {
                    relay.total_hops = total_hops;
                    relay.updated_at = now;
                }
            },
            Err(err) => self.fail_attempt(id, &err, now),
        }
    }

    /// Submit the destination leg. Target on one of our two chains settles
    /// directly; anything else goes through the planner and an IBC
    /// transfer.
    async fn relay_once(&self, relay: &PendingRelay) -> Result<RelayOutcome, RelayError> {
        let now = relayer_utils::now_unix();
        let buffer = self.opt.timeout_buffer.as_secs();
        if relay.timelock < now + buffer {
            return Err(RelayError::TimelockTooClose {
                timelock: relay.timelock,
                buffer,
            });
        }

        if relay.target_chain == self.ibc.chain_id() {
            // Mirror with half the remaining window so the destination lock
            // always expires before the source lock.
            let mirror_timelock = now + relay.timelock.saturating_sub(now) / 2;
            self.recovery
                .execute(OperationKind::HtlcCreation, &relay.relay_id, || {
                    self.ibc.create_htlc(
                        &relay.htlc_id,
                        &relay.receiver,
                        &relay.amount,
                        &relay.hashlock,
                        mirror_timelock,
                        &relay.source_chain,
                        &relay.htlc_id,
                    )
                })
                .await?;
            return Ok(RelayOutcome::Completed);
        }

        if relay.target_chain == self.evm.chain_id() {
            let mirror_timelock = now + relay.timelock.saturating_sub(now) / 2;
            self.recovery
                .execute(OperationKind::HtlcCreation, &relay.relay_id, || {
                    self.evm.create_htlc(
                        &relay.htlc_id,
                        &relay.token,
                        &relay.amount,
                        &relay.hashlock,
                        mirror_timelock,
                        &relay.receiver,
                    )
                })
                .await?;
            return Ok(RelayOutcome::Completed);
        }

        self.relay_multi_hop(relay, now).await
    }

    async fn relay_multi_hop(
        &self,
        relay: &PendingRelay,
        now: u64,
    ) -> Result<RelayOutcome, RelayError> {
        let min_window = self.opt.timeout_buffer.as_secs() / 2;
        let memo = HtlcMemo {
            htlc_id: relay.htlc_id.clone(),
            receiver: relay.receiver.clone(),
            hashlock: relay.hashlock.clone(),
            timelock: relay.timelock,
            source_chain: relay.source_chain.clone(),
            source_htlc_id: relay.htlc_id.clone(),
            target_chain: relay.target_chain.clone(),
            target_address: relay.receiver.clone(),
        };

        let planner = self.planner.clone();
        let (source, target, receiver) = (
            relay.source_chain.clone(),
            relay.target_chain.clone(),
            relay.receiver.clone(),
        );
        let plan = self
            .recovery
            .execute(OperationKind::RouteDiscovery, &relay.relay_id, || {
                let planner = planner.clone();
                let memo = memo.clone();
                let (source, target, receiver) = (source.clone(), target.clone(), receiver.clone());
                async move { planner.plan(&source, &target, &receiver, &memo, now, min_window) }
            })
            .await?;

        // The transfer enters the interchain on our local chain; everything
        // after that position rides in the forward memo.
        let local = self.ibc.chain_id();
        let position = plan
            .route
            .chains
            .iter()
            .position(|c| c == local)
            .ok_or_else(|| {
                RelayError::Validation(format!(
                    "route {:?} does not pass through the local chain {local}",
                    plan.route.chains
                ))
            })?;
        let hops = &plan.hops[position..];
        let first = hops.first().ok_or_else(|| {
            RelayError::Validation("route ends on the local chain".into())
        })?;
        if !is_valid_channel_id(&first.channel_id) {
            return Err(RelayError::Validation(format!(
                "planned channel {:?} is not a valid channel id",
                first.channel_id
            )));
        }
        if !is_valid_port_id(&first.port_id) {
            return Err(RelayError::Validation(format!(
                "planned port {:?} is not a valid port id",
                first.port_id
            )));
        }

        let request = IbcTransferRequest {
            source_port: first.port_id.clone(),
            source_channel: first.channel_id.clone(),
            receiver: first.receiver.clone(),
            amount: relay.amount.clone(),
            denom: self.ibc.denom().to_string(),
            memo: build_memo(hops, &memo, now),
            timeout_timestamp: first.timeout * 1_000_000_000,
        };

        let submitted = self
            .recovery
            .execute(OperationKind::IbcTransfer, &relay.relay_id, || {
                self.ibc.submit_transfer(&request)
            })
            .await?;

        let total_hops = hops.len() as u32;
        self.plans
            .lock()
            .insert(relay.relay_id.clone(), plan.clone());
        match &submitted.packet {
            Some(packet) => {
                self.acks.register_packet(
                    &packet.source_channel,
                    packet.sequence,
                    &relay.relay_id,
                    first.hop_index,
                    true,
                );
                tracing::info!(
                    relay_id = %relay.relay_id,
                    tx = %submitted.tx_hash,
                    sequence = packet.sequence,
                    total_hops,
                    "transfer submitted"
                );
            },
            None => {
                tracing::warn!(
                    relay_id = %relay.relay_id,
                    tx = %submitted.tx_hash,
                    "transfer submitted but packet identity unknown; relying on sweep"
                );
            },
        }
        Ok(RelayOutcome::AwaitingAcks { total_hops })
    }

    async fn advance_hop(&self, id: &str, hop_index: u32, covers_remaining: bool) {
        let completed = {
            let mut relays = self.relays.lock();
            let Some(relay) = relays.get_mut(id) else {
                return;
            };
            if relay.is_terminal() {
                return;
            }
            relay.hops_completed = if covers_remaining {
                relay.total_hops
            } else {
                relay.hops_completed.max(hop_index + 1)
            };
            relay.updated_at = relayer_utils::now_unix();
            tracing::info!(
                relay_id = id,
                hops = relay.hops_completed,
                total = relay.total_hops,
                "hop acknowledged"
            );
            relay.hops_completed >= relay.total_hops
        };
        if completed {
            self.complete_relay(id).await;
        }
    }

    fn hop_failed(&self, id: &str, reason: &str) {
        tracing::warn!(relay_id = id, reason, "hop failed");
        self.fail_attempt(
            id,
            &RelayError::Chain(format!("hop failed: {reason}")),
            relayer_utils::now_unix(),
        );
    }

    async fn complete_relay(&self, id: &str) {
        let relay = {
            let mut relays = self.relays.lock();
            let Some(relay) = relays.get_mut(id) else {
                return;
            };
            if relay.is_terminal() {
                return;
            }
            let now = relayer_utils::now_unix();
            if relay.transition(RelayStatus::Completed, now).is_err() {
                return;
            }
            relay.clone()
        };
        self.successful_relays.fetch_add(1, Ordering::Relaxed);
        self.plans.lock().remove(id);
        self.persist(&relay);
        tracing::info!(relay_id = id, "relay completed");

        if let (Some(dex), Some(params)) = (&self.dex, &relay.swap_params) {
            if dex.supports(&relay.target_chain).await {
                if let Err(err) = dex.execute_swap(&relay, params).await {
                    tracing::error!(relay_id = id, "post-relay swap failed: {err:#}");
                }
            }
        }
    }

    /// Book a failed attempt: business and operator errors are terminal,
    /// anything else retries until the attempt budget runs out.
    fn fail_attempt(&self, id: &str, err: &RelayError, now: u64) {
        let mut relays = self.relays.lock();
        let Some(relay) = relays.get_mut(id) else {
            return;
        };
        if relay.is_terminal() {
            return;
        }
        let terminal = err.is_business()
            || matches!(
                err,
                RelayError::Validation(_)
                    | RelayError::CircuitOpen { .. }
                    | RelayError::EmergencyStopped(_)
                    | RelayError::Config(_)
            );
        tracing::warn!(relay_id = id, attempt = relay.attempts, terminal, "relay attempt failed: {err}");
        if terminal {
            relay.fail_terminally(err.label(), now);
        } else {
            relay.record_failure(err.label(), self.opt.max_retries, now);
        }
        if relay.status == RelayStatus::Failed {
            self.failed_relays.fetch_add(1, Ordering::Relaxed);
            self.plans.lock().remove(id);
        }
        self.persist(relay);
    }

    /// Best-effort write-through to the optional store.
    fn persist(&self, relay: &PendingRelay) {
        let Some(store) = &self.store else {
            return;
        };
        let store = store.clone();
        let relay = relay.clone();
        tokio::spawn(async move {
            if let Err(err) = store.put_relay(&relay).await {
                tracing::debug!(relay_id = %relay.relay_id, "persist failed: {err:#}");
            }
        });
    }

    /// Requeue pending relays whose retry delay has elapsed.
    fn requeue_due_retries(&self) {
        let now = relayer_utils::now_unix();
        let retry_delay = self.opt.retry_delay.as_secs();
        let due: Vec<String> = {
            let relays = self.relays.lock();
            relays
                .values()
                .filter(|r| {
                    r.status == RelayStatus::Pending
                        && r.attempts > 0
                        && r.updated_at + retry_delay <= now
                })
                .map(|r| r.relay_id.clone())
                .collect()
        };
        for id in due {
            tracing::info!(relay_id = %id, "requeueing for retry");
            if self.work_tx.try_send(id.clone()).is_err() {
                tracing::warn!(relay_id = %id, "work queue full, retry deferred");
            }
        }
    }

    /// Drop terminal relays older than the retention window.
    pub fn sweep_terminal(&self, now: u64) -> usize {
        let retention = RELAY_RETENTION.as_secs();
        let mut relays = self.relays.lock();
        let before = relays.len();
        relays.retain(|_, r| !r.is_terminal() || r.updated_at + retention > now);
        before - relays.len()
    }

    /// Operator command: purge every terminal relay immediately.
    pub fn cleanup(&self) -> usize {
        let mut relays = self.relays.lock();
        let before = relays.len();
        relays.retain(|_, r| !r.is_terminal());
        before - relays.len()
    }

    pub fn relay(&self, id: &str) -> Option<PendingRelay> {
        self.relays.lock().get(id).cloned()
    }

    pub fn metrics(&self) -> RelayMetrics {
        let relays = self.relays.lock();
        let mut metrics = RelayMetrics {
            successful_relays: self.successful_relays.load(Ordering::Relaxed),
            failed_relays: self.failed_relays.load(Ordering::Relaxed),
            queue_depth: self.work_rx.len(),
            ..Default::default()
        };
        for relay in relays.values() {
            match relay.status {
                RelayStatus::Pending => metrics.pending += 1,
                RelayStatus::Relaying => metrics.relaying += 1,
                RelayStatus::Completed => metrics.completed += 1,
                RelayStatus::Failed => metrics.failed += 1,
            }
        }
        metrics.relays = relays.values().cloned().collect();
        metrics.relays.sort_by(|a, b| a.relay_id.cmp(&b.relay_id));
        metrics
    }

    /// Wait for in-flight work to settle, up to the caller's timeout.
    pub async fn drain(&self) {
        loop {
            let busy = {
                let relays = self.relays.lock();
                relays
                    .values()
                    .any(|r| r.status == RelayStatus::Relaying)
            } || !self.work_rx.is_empty();
            if !busy {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
