//! End-to-end relay flows against in-process fake chains.

use std::{
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chain_monitors::{CosmosHtlc, HtlcState, IbcTransferRequest, SentPacket, SubmittedTransfer};
use chain_registry::{
    cache::testing::{chain, default_options, three_chain_registry, StaticRegistry},
    ForwardPlanner, RegistryCache, RouteDiscovery,
};
use htlc_relayer::{
    acks::DEFAULT_MAX_AGE, AckHandler, EvmGateway, IbcGateway, RecoveryScanner, RelayEngine,
};
use parking_lot::Mutex;
use relayer_recovery::{BreakerState, RecoveryManager};
use relayer_types::{
    config::{RecoveryOptions, RelayOptions, RetryOptions},
    relay::hashlock_of,
    traits::{MemoryStore, RelayStore},
    ChainKind, HtlcCreated, MemoBody, OperationKind, PacketEvent, PacketOutcome, RelayError,
    RelayStatus,
};
use relayer_utils::{now_unix, test_utils::setup_test};
use tokio_util::sync::CancellationToken;

struct FakeIbc {
    chain: String,
    transfers: Mutex<Vec<IbcTransferRequest>>,
    created: Mutex<Vec<(String, u64)>>,
    refunds: Mutex<Vec<String>>,
    htlcs: Mutex<Vec<CosmosHtlc>>,
    fail_creates: AtomicU32,
    fail_transfers: AtomicU32,
    sequence: AtomicU64,
}

impl FakeIbc {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            chain: "hub-4".into(),
            transfers: Mutex::new(vec![]),
            created: Mutex::new(vec![]),
            refunds: Mutex::new(vec![]),
            htlcs: Mutex::new(vec![]),
            fail_creates: AtomicU32::new(0),
            fail_transfers: AtomicU32::new(0),
            sequence: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl IbcGateway for FakeIbc {
    fn chain_id(&self) -> &str {
        &self.chain
    }

    fn denom(&self) -> &str {
        "uatom"
    }

    fn relayer_address(&self) -> String {
        "hub-41relayer".into()
    }

    async fn submit_transfer(
        &self,
        request: &IbcTransferRequest,
    ) -> Result<SubmittedTransfer, RelayError> {
        if self.fail_transfers.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            n.checked_sub(1)
        }).is_ok()
        {
            return Err(RelayError::TransientNetwork("rpc timeout".into()));
        }
        self.transfers.lock().push(request.clone());
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SubmittedTransfer {
            tx_hash: format!("TX{sequence}"),
            packet: Some(SentPacket {
                source_channel: request.source_channel.clone(),
                dest_channel: "channel-counter".into(),
                sequence,
            }),
        })
    }

    async fn create_htlc(
        &self,
        htlc_id: &str,
        _receiver: &str,
        _amount: &str,
        _hashlock: &str,
        timelock: u64,
        _source_chain: &str,
        _source_htlc_id: &str,
    ) -> Result<String, RelayError> {
        if self.fail_creates.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            n.checked_sub(1)
        }).is_ok()
        {
            return Err(RelayError::TransientNetwork("rpc timeout".into()));
        }
        self.created.lock().push((htlc_id.to_string(), timelock));
        Ok("TXCREATE".into())
    }

    async fn withdraw(&self, _htlc_id: &str, _secret: &str) -> Result<String, RelayError> {
        Ok("TXWITHDRAW".into())
    }

    async fn refund(&self, htlc_id: &str) -> Result<String, RelayError> {
        self.refunds.lock().push(htlc_id.to_string());
        Ok("TXREFUND".into())
    }

    async fn htlcs_by_sender(&self, sender: &str) -> Result<Vec<CosmosHtlc>, RelayError> {
        Ok(self
            .htlcs
            .lock()
            .iter()
            .filter(|h| h.sender == sender)
            .cloned()
            .collect())
    }
}

struct FakeEvm {
    chain: String,
    address: Option<String>,
    created: Mutex<Vec<String>>,
    refunds: Mutex<Vec<String>>,
    active: Mutex<Vec<HtlcState>>,
}

impl FakeEvm {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            chain: "eth".into(),
            address: Some("0xrelayer".into()),
            created: Mutex::new(vec![]),
            refunds: Mutex::new(vec![]),
            active: Mutex::new(vec![]),
        })
    }
}

#[async_trait]
impl EvmGateway for FakeEvm {
    fn chain_id(&self) -> &str {
        &self.chain
    }

    fn relayer_address(&self) -> Option<String> {
        self.address.clone()
    }

    async fn create_htlc(
        &self,
        htlc_id: &str,
        _token: &str,
        _amount: &str,
        _hashlock: &str,
        _timelock: u64,
        _receiver: &str,
    ) -> Result<String, RelayError> {
        self.created.lock().push(htlc_id.to_string());
        Ok("TXCREATE".into())
    }

    async fn withdraw(&self, _htlc_id: &str, _secret: &str) -> Result<String, RelayError> {
        Ok("TXWITHDRAW".into())
    }

    async fn refund(&self, htlc_id: &str) -> Result<String, RelayError> {
        self.refunds.lock().push(htlc_id.to_string());
        Ok("TXREFUND".into())
    }

    async fn active_htlcs(&self) -> Result<Vec<HtlcState>, RelayError> {
        Ok(self.active.lock().clone())
    }
}

struct Harness {
    engine: Arc<RelayEngine>,
    acks: Arc<AckHandler>,
    ibc: Arc<FakeIbc>,
    evm: Arc<FakeEvm>,
    recovery: Arc<RecoveryManager>,
    store: Arc<MemoryStore>,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn fast_retry() -> RetryOptions {
    RetryOptions {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
        jitter: false,
        max_attempts: 4,
        failure_threshold: 10,
        cooldown: Duration::from_secs(600),
    }
}

fn fast_relay_options() -> RelayOptions {
    RelayOptions {
        max_retries: 3,
        retry_delay: Duration::from_millis(30),
        batch_size: 4,
        processing_interval: Duration::from_millis(30),
        timeout_buffer: Duration::from_secs(1800),
        queue_capacity: 64,
    }
}

async fn harness_with(
    registry: StaticRegistry,
    retry: RetryOptions,
    relay: RelayOptions,
) -> Harness {
    setup_test();
    let cache = RegistryCache::connect(registry, default_options())
        .await
        .unwrap();
    let routes = Arc::new(RouteDiscovery::new(cache.clone(), 4));
    let planner = Arc::new(ForwardPlanner::new(cache, routes, 4, 3600));
    let recovery = Arc::new(RecoveryManager::new(retry));
    let ibc = FakeIbc::new();
    let evm = FakeEvm::new();

    let (_events_tx, events_rx) = async_channel::bounded(64);
    let (commands_tx, commands_rx) = async_channel::unbounded();
    let acks = AckHandler::new(commands_tx, DEFAULT_MAX_AGE);
    let store = Arc::new(MemoryStore::default());
    let engine = RelayEngine::new(
        relay,
        recovery.clone(),
        planner,
        ibc.clone(),
        evm.clone(),
        acks.clone(),
        None,
        Some(store.clone()),
        events_rx,
        commands_rx,
    );
    acks.attach_plans(engine.plans());

    let cancel = CancellationToken::new();
    engine.spawn_tasks(cancel.clone());

    Harness {
        engine,
        acks,
        ibc,
        evm,
        recovery,
        store,
        cancel,
    }
}

async fn harness() -> Harness {
    harness_with(three_chain_registry(), fast_retry(), fast_relay_options()).await
}

fn created_event(target_chain: &str, timelock: u64) -> HtlcCreated {
    HtlcCreated {
        chain_id: "eth".into(),
        htlc_id: "0xabc01".into(),
        sender: "0xsender".into(),
        receiver: "osm1recv".into(),
        amount: "1000000".into(),
        token: "0xtoken".into(),
        hashlock: hashlock_of(b"secret"),
        timelock,
        target_chain: target_chain.into(),
        target_address: "osm1recv".into(),
        block_number: 100,
        tx_hash: "0xdeadbeef".into(),
        log_index: 0,
    }
}

/// Poll until `predicate` holds or the deadline passes.
async fn wait_for(mut predicate: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_relay_to_the_local_chain_completes() {
    let h = harness().await;
    let now = now_unix();
    h.engine
        .handle_created(created_event("hub-4", now + 14400))
        .await;

    let engine = h.engine.clone();
    wait_for(
        || {
            engine
                .relay("eth:0xabc01")
                .is_some_and(|r| r.status == RelayStatus::Completed)
        },
        "relay completion",
    )
    .await;

    let created = h.ibc.created.lock();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].0, "0xabc01");
    // The mirrored lock must expire before the source lock.
    assert!(created[0].1 < now + 14400);
    assert_eq!(h.engine.metrics().successful_relays, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_source_events_create_one_relay() {
    let h = harness().await;
    let event = created_event("hub-4", now_unix() + 14400);
    h.engine.handle_created(event.clone()).await;
    h.engine.handle_created(event).await;

    let engine = h.engine.clone();
    wait_for(
        || engine.metrics().successful_relays == 1,
        "single completion",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.engine.metrics().relays.len(), 1);
    assert_eq!(h.ibc.created.lock().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_hop_relay_completes_after_the_ack() {
    let h = harness().await;
    let now = now_unix();
    h.engine
        .handle_created(created_event("osm-1", now + 14400))
        .await;

    let ibc = h.ibc.clone();
    wait_for(|| !ibc.transfers.lock().is_empty(), "transfer submission").await;

    let transfer = h.ibc.transfers.lock()[0].clone();
    // The transfer enters on the hub→osmosis channel with the HTLC memo.
    assert_eq!(transfer.source_channel, "channel-141");
    assert_eq!(transfer.receiver, "osm1recv");
    match MemoBody::parse(&transfer.memo) {
        MemoBody::Plain(memo) => {
            assert_eq!(memo.target_chain, "osm-1");
            assert_eq!(memo.source_chain, "eth");
        },
        other => panic!("expected htlc memo, got {other:?}"),
    }
    let engine = h.engine.clone();
    wait_for(
        || engine.relay("eth:0xabc01").is_some_and(|r| r.total_hops == 1),
        "hop count recorded",
    )
    .await;
    assert_eq!(
        h.engine.relay("eth:0xabc01").unwrap().status,
        RelayStatus::Relaying
    );

    // Acknowledge the packet; the relay completes.
    h.acks
        .handle_outcome(PacketEvent {
            chain_id: "hub-4".into(),
            source_channel: transfer.source_channel.clone(),
            dest_channel: "channel-counter".into(),
            sequence: 1,
            outcome: PacketOutcome::Success,
        })
        .await;

    let engine = h.engine.clone();
    wait_for(
        || {
            engine
                .relay("eth:0xabc01")
                .is_some_and(|r| r.status == RelayStatus::Completed)
        },
        "relay completion after ack",
    )
    .await;
    assert_eq!(h.engine.metrics().successful_relays, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn four_chain_route_carries_a_nested_forward_memo() {
    let registry = StaticRegistry::with_topology(
        vec![
            chain("eth", ChainKind::Evm),
            chain("hub-4", ChainKind::Cosmos),
            chain("jun-1", ChainKind::Cosmos),
            chain("osm-1", ChainKind::Cosmos),
        ],
        &[
            ("eth", "channel-0", "hub-4", "channel-100"),
            ("hub-4", "channel-141", "jun-1", "channel-1"),
            ("jun-1", "channel-47", "osm-1", "channel-2"),
        ],
    );
    let h = harness_with(registry, fast_retry(), fast_relay_options()).await;
    h.engine
        .handle_created(created_event("osm-1", now_unix() + 14400))
        .await;

    let ibc = h.ibc.clone();
    wait_for(|| !ibc.transfers.lock().is_empty(), "transfer submission").await;

    let transfer = h.ibc.transfers.lock()[0].clone();
    assert_eq!(transfer.source_channel, "channel-141");
    // Forwarding jun-1 → osm-1 rides in the memo.
    match MemoBody::parse(&transfer.memo) {
        MemoBody::Forwarded { forward, inner } => {
            assert_eq!(forward.depth(), 1);
            assert_eq!(forward.forward.channel, "channel-47");
            assert_eq!(forward.forward.receiver, "osm1recv");
            assert!(inner.is_some());
        },
        other => panic!("expected forward memo, got {other:?}"),
    }
    let engine = h.engine.clone();
    wait_for(
        || engine.relay("eth:0xabc01").is_some_and(|r| r.total_hops == 2),
        "hop count recorded",
    )
    .await;

    // The packet ack covers the forwarded hops too.
    h.acks
        .handle_outcome(PacketEvent {
            chain_id: "hub-4".into(),
            source_channel: "channel-141".into(),
            dest_channel: "channel-counter".into(),
            sequence: 1,
            outcome: PacketOutcome::Success,
        })
        .await;
    let engine = h.engine.clone();
    wait_for(
        || {
            engine
                .relay("eth:0xabc01")
                .is_some_and(|r| r.status == RelayStatus::Completed)
        },
        "relay completion",
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn no_route_fails_terminally_without_retries() {
    let h = harness().await;
    h.engine
        .handle_created(created_event("unknown-1", now_unix() + 14400))
        .await;

    let engine = h.engine.clone();
    wait_for(
        || {
            engine
                .relay("eth:0xabc01")
                .is_some_and(|r| r.status == RelayStatus::Failed)
        },
        "terminal failure",
    )
    .await;

    let relay = h.engine.relay("eth:0xabc01").unwrap();
    assert_eq!(relay.failure_reason.as_deref(), Some("no-route-found"));
    assert_eq!(relay.attempts, 1);

    // No retry is ever scheduled for a business failure.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.engine.relay("eth:0xabc01").unwrap().attempts, 1);
    assert!(h.ibc.transfers.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn close_timelock_is_refused_before_any_transfer() {
    let h = harness().await;
    // Exactly half the buffer of slack: refused at ingestion.
    h.engine
        .handle_created(created_event("osm-1", now_unix() + 900))
        .await;

    let relay = h.engine.relay("eth:0xabc01").unwrap();
    assert_eq!(relay.status, RelayStatus::Failed);
    assert_eq!(relay.failure_reason.as_deref(), Some("timelock-too-close"));
    assert_eq!(relay.attempts, 0);
    assert!(h.ibc.transfers.lock().is_empty());
    assert!(h.ibc.created.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_recover_within_one_attempt() {
    let h = harness().await;
    // Two RPC failures, fewer than the attempt budget.
    h.ibc.fail_creates.store(2, Ordering::SeqCst);
    h.engine
        .handle_created(created_event("hub-4", now_unix() + 14400))
        .await;

    let engine = h.engine.clone();
    wait_for(
        || {
            engine
                .relay("eth:0xabc01")
                .is_some_and(|r| r.status == RelayStatus::Completed)
        },
        "relay completion",
    )
    .await;

    let relay = h.engine.relay("eth:0xabc01").unwrap();
    assert_eq!(relay.attempts, 1);
    // The breaker saw two failures, below its threshold: still closed.
    assert!(h
        .recovery
        .health()
        .breakers
        .iter()
        .all(|b| b.state == BreakerState::Closed));
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_retries_until_the_attempt_budget_is_exhausted() {
    let mut retry = fast_retry();
    retry.max_attempts = 1;
    let mut relay_opt = fast_relay_options();
    relay_opt.max_retries = 2;
    let h = harness_with(three_chain_registry(), retry, relay_opt).await;

    // Every create fails; the engine retries to its own bound.
    h.ibc.fail_creates.store(u32::MAX, Ordering::SeqCst);
    h.engine
        .handle_created(created_event("hub-4", now_unix() + 14400))
        .await;

    let engine = h.engine.clone();
    wait_for(
        || {
            engine
                .relay("eth:0xabc01")
                .is_some_and(|r| r.status == RelayStatus::Failed)
        },
        "terminal failure",
    )
    .await;
    let relay = h.engine.relay("eth:0xabc01").unwrap();
    assert_eq!(relay.attempts, 2);
    assert_eq!(h.engine.metrics().failed_relays, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_level_retry_succeeds_on_the_second_attempt() {
    let mut retry = fast_retry();
    retry.max_attempts = 1;
    let h = harness_with(three_chain_registry(), retry, fast_relay_options()).await;

    h.ibc.fail_creates.store(1, Ordering::SeqCst);
    h.engine
        .handle_created(created_event("hub-4", now_unix() + 14400))
        .await;

    let engine = h.engine.clone();
    wait_for(
        || {
            engine
                .relay("eth:0xabc01")
                .is_some_and(|r| r.status == RelayStatus::Completed)
        },
        "completion after engine retry",
    )
    .await;
    assert_eq!(h.engine.relay("eth:0xabc01").unwrap().attempts, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn open_breaker_fails_the_relay_without_invoking_the_chain() {
    let h = harness().await;
    // HTLC creation is guarded by the EVM breaker.
    h.recovery.trip(OperationKind::HtlcCreation, "test");

    h.engine
        .handle_created(created_event("hub-4", now_unix() + 14400))
        .await;

    let engine = h.engine.clone();
    wait_for(
        || {
            engine
                .relay("eth:0xabc01")
                .is_some_and(|r| r.status == RelayStatus::Failed)
        },
        "terminal failure",
    )
    .await;
    let relay = h.engine.relay("eth:0xabc01").unwrap();
    assert_eq!(relay.failure_reason.as_deref(), Some("circuit-open"));
    assert!(h.ibc.created.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_ack_retries_and_then_completes() {
    let h = harness().await;
    let now = now_unix();
    h.engine
        .handle_created(created_event("osm-1", now + 14400))
        .await;

    let ibc = h.ibc.clone();
    wait_for(|| !ibc.transfers.lock().is_empty(), "first transfer").await;

    // The packet times out: the relay goes back to pending and is retried.
    h.acks
        .handle_outcome(PacketEvent {
            chain_id: "hub-4".into(),
            source_channel: "channel-141".into(),
            dest_channel: "channel-counter".into(),
            sequence: 1,
            outcome: PacketOutcome::Timeout,
        })
        .await;

    let ibc = h.ibc.clone();
    wait_for(|| ibc.transfers.lock().len() >= 2, "retried transfer").await;

    h.acks
        .handle_outcome(PacketEvent {
            chain_id: "hub-4".into(),
            source_channel: "channel-141".into(),
            dest_channel: "channel-counter".into(),
            sequence: 2,
            outcome: PacketOutcome::Success,
        })
        .await;

    let engine = h.engine.clone();
    wait_for(
        || {
            engine
                .relay("eth:0xabc01")
                .is_some_and(|r| r.status == RelayStatus::Completed)
        },
        "completion after retry",
    )
    .await;
    assert_eq!(h.engine.relay("eth:0xabc01").unwrap().attempts, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn scanner_refunds_expired_htlcs_once_per_cycle() {
    let h = harness().await;
    let now = now_unix();
    let ours = "0xrelayer".to_string();
    *h.evm.active.lock() = vec![
        HtlcState {
            htlc_id: "0xexpired".into(),
            sender: ours.clone(),
            timelock: now - 600,
            withdrawn: false,
            refunded: false,
        },
        HtlcState {
            htlc_id: "0xnotours".into(),
            sender: "0xother".into(),
            timelock: now - 600,
            withdrawn: false,
            refunded: false,
        },
        HtlcState {
            htlc_id: "0xfresh".into(),
            sender: ours.clone(),
            timelock: now + 600,
            withdrawn: false,
            refunded: false,
        },
        HtlcState {
            htlc_id: "0xdone".into(),
            sender: ours.clone(),
            timelock: now - 600,
            withdrawn: true,
            refunded: false,
        },
    ];
    h.ibc.htlcs.lock().push(CosmosHtlc {
        htlc_id: "htlc-expired".into(),
        sender: "hub-41relayer".into(),
        timelock: now - 600,
        withdrawn: false,
        refunded: false,
    });

    let scanner = RecoveryScanner::new(
        h.evm.clone(),
        h.ibc.clone(),
        h.recovery.clone(),
        RecoveryOptions {
            enabled: true,
            check_interval: Duration::from_secs(60),
            refund_buffer: Duration::from_secs(300),
        },
    );

    let refunds = scanner.scan_once(now).await.unwrap();
    assert_eq!(refunds, 2);
    assert_eq!(*h.evm.refunds.lock(), vec!["0xexpired".to_string()]);
    assert_eq!(*h.ibc.refunds.lock(), vec!["htlc-expired".to_string()]);

    // The next cycle sees the same state and submits again; marking the
    // HTLC refunded stops it.
    h.evm.active.lock()[0].refunded = true;
    h.ibc.htlcs.lock()[0].refunded = true;
    let refunds = scanner.scan_once(now).await.unwrap();
    assert_eq!(refunds, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn hostile_source_events_are_dropped_before_ingestion() {
    let h = harness().await;
    let now = now_unix();

    let mut event = created_event("hub-4", now + 14400);
    event.receiver = "osm1recv\u{202e}".into();
    h.engine.handle_created(event).await;
    assert!(h.engine.relay("eth:0xabc01").is_none());

    let mut event = created_event("hub-4", now + 14400);
    event.hashlock = "not-hex".into();
    h.engine.handle_created(event).await;
    assert!(h.engine.relay("eth:0xabc01").is_none());
    assert!(h.ibc.created.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_state_is_written_through_to_the_store() {
    let h = harness().await;
    h.engine
        .handle_created(created_event("hub-4", now_unix() + 14400))
        .await;

    let engine = h.engine.clone();
    wait_for(
        || {
            engine
                .relay("eth:0xabc01")
                .is_some_and(|r| r.status == RelayStatus::Completed)
        },
        "relay completion",
    )
    .await;

    let store = h.store.clone();
    wait_for(
        || {
            futures::executor::block_on(store.load_relays())
                .unwrap()
                .iter()
                .any(|r| r.relay_id == "eth:0xabc01" && r.status == RelayStatus::Completed)
        },
        "store write-through",
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn completed_relays_never_change_status_again() {
    let h = harness().await;
    h.engine
        .handle_created(created_event("hub-4", now_unix() + 14400))
        .await;

    let engine = h.engine.clone();
    wait_for(
        || {
            engine
                .relay("eth:0xabc01")
                .is_some_and(|r| r.status == RelayStatus::Completed)
        },
        "relay completion",
    )
    .await;

    // Late acks and failures are no-ops on a terminal relay.
    h.acks.register_packet("channel-141", 99, "eth:0xabc01", 0, true);
    h.acks
        .handle_outcome(PacketEvent {
            chain_id: "hub-4".into(),
            source_channel: "channel-141".into(),
            dest_channel: "channel-counter".into(),
            sequence: 99,
            outcome: PacketOutcome::Timeout,
        })
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let relay = h.engine.relay("eth:0xabc01").unwrap();
    assert_eq!(relay.status, RelayStatus::Completed);
    assert_eq!(h.engine.metrics().successful_relays, 1);
    assert_eq!(h.engine.metrics().failed_relays, 0);
}
