//! Relayer wiring and lifecycle.
//!
//! Construction order follows the dependency chain: recovery core, registry
//! cache, route discovery, planner, chain clients, monitors, ack handler,
//! engine, scanner. Shutdown runs the other way: stop the monitors (halts
//! ingress), stop the scanner, drain the engine under a timeout, then tear
//! the remaining tasks down.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use chain_monitors::{
    CosmosClient, CosmosMonitor, CosmosMonitorHealth, EvmClient, EvmMonitor, EvmMonitorHealth,
};
use chain_registry::{ForwardPlanner, RegistryCache, RegistryClient, RouteDiscovery};
use relayer_recovery::{RecoveryHealth, RecoveryManager};
use relayer_types::{HtlcEvent, OperationKind, PacketEvent, RelayerOptions};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod acks;
pub mod api;
pub mod engine;
pub mod gateways;
pub mod scanner;

pub use acks::{AckHandler, AckHandlerHealth};
pub use engine::{EngineCommand, RelayEngine, RelayMetrics};
pub use gateways::{EvmGateway, IbcGateway};
pub use scanner::{RecoveryScanner, ScannerHealth};

/// Capacity of the packet-outcome queue feeding the ack handler.
const PACKET_QUEUE_CAPACITY: usize = 256;

/// Top-level health document served by the status API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayerHealth {
    pub healthy: bool,
    pub recovery: RecoveryHealth,
    pub evm_monitor: EvmMonitorHealth,
    pub cosmos_monitor: CosmosMonitorHealth,
    pub acks: AckHandlerHealth,
    pub scanner: ScannerHealth,
    pub relays: RelaySummary,
}

/// Relay counters without the full relay list.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelaySummary {
    pub pending: usize,
    pub relaying: usize,
    pub completed: usize,
    pub failed: usize,
    pub successful_relays: u64,
    pub failed_relays: u64,
    pub queue_depth: usize,
}

impl From<&RelayMetrics> for RelaySummary {
    fn from(metrics: &RelayMetrics) -> Self {
        Self {
            pending: metrics.pending,
            relaying: metrics.relaying,
            completed: metrics.completed,
            failed: metrics.failed,
            successful_relays: metrics.successful_relays,
            failed_relays: metrics.failed_relays,
            queue_depth: metrics.queue_depth,
        }
    }
}

pub struct Relayer {
    opt: RelayerOptions,
    recovery: Arc<RecoveryManager>,
    registry: Arc<RegistryCache>,
    evm_monitor: Arc<EvmMonitor>,
    cosmos_monitor: Arc<CosmosMonitor>,
    engine: Arc<RelayEngine>,
    acks: Arc<AckHandler>,
    scanner: Arc<RecoveryScanner>,
    packets_rx: Option<async_channel::Receiver<PacketEvent>>,

    monitor_cancel: CancellationToken,
    scanner_cancel: CancellationToken,
    service_cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Relayer {
    /// Build every component. Fails fast on configuration errors or an
    /// unreachable registry; the binary maps that to exit code 1.
    pub async fn init(opt: RelayerOptions) -> anyhow::Result<Self> {
        opt.validate().context("configuration rejected")?;

        let recovery = Arc::new(RecoveryManager::new(opt.retry.clone()));

        let registry_client = RegistryClient::new(opt.registry.base_url.clone())?;
        let registry = RegistryCache::connect(registry_client, opt.registry.clone())
            .await
            .context("connecting to the chain registry")?;
        let routes = Arc::new(RouteDiscovery::new(
            registry.clone(),
            opt.registry.max_hops,
        ));
        let planner = Arc::new(ForwardPlanner::new(
            registry.clone(),
            routes,
            opt.registry.max_hops,
            opt.registry.hop_timeout.as_secs(),
        ));

        let evm_client = Arc::new(EvmClient::new(&opt.evm).context("building evm client")?);
        let cosmos_client =
            Arc::new(CosmosClient::new(opt.cosmos.clone()).context("building cosmos client")?);

        let (events_tx, events_rx) =
            async_channel::bounded::<HtlcEvent>(opt.relay.queue_capacity.max(1));
        let (packets_tx, packets_rx) =
            async_channel::bounded::<PacketEvent>(PACKET_QUEUE_CAPACITY);
        let (commands_tx, commands_rx) = async_channel::unbounded();

        let acks = AckHandler::new(commands_tx, acks::DEFAULT_MAX_AGE);
        let engine = RelayEngine::new(
            opt.relay.clone(),
            recovery.clone(),
            planner,
            cosmos_client.clone(),
            evm_client.clone(),
            acks.clone(),
            None,
            None,
            events_rx,
            commands_rx,
        );
        acks.attach_plans(engine.plans());

        let evm_monitor = Arc::new(EvmMonitor::new(
            evm_client.clone(),
            recovery.clone(),
            events_tx.clone(),
            opt.evm.clone(),
            None,
        ));
        let cosmos_monitor = Arc::new(CosmosMonitor::new(
            cosmos_client.clone(),
            recovery.clone(),
            events_tx,
            packets_tx,
            opt.cosmos.clone(),
            None,
        ));
        let scanner = Arc::new(RecoveryScanner::new(
            evm_client,
            cosmos_client,
            recovery.clone(),
            opt.recovery.clone(),
        ));

        Ok(Self {
            opt,
            recovery,
            registry,
            evm_monitor,
            cosmos_monitor,
            engine,
            acks,
            scanner,
            packets_rx: Some(packets_rx),
            monitor_cancel: CancellationToken::new(),
            scanner_cancel: CancellationToken::new(),
            service_cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Spawn every background task and the status API.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.registry
            .spawn_refresh_task(self.service_cancel.clone())
            .await;

        self.tasks
            .extend(self.engine.spawn_tasks(self.service_cancel.clone()));

        let packets_rx = self
            .packets_rx
            .take()
            .context("relayer already started")?;
        let acks = self.acks.clone();
        let token = self.service_cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            acks.run(packets_rx, token).await;
        }));

        let monitor = self.evm_monitor.clone();
        let token = self.monitor_cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            monitor.run(token).await;
        }));
        let monitor = self.cosmos_monitor.clone();
        let token = self.monitor_cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            monitor.run(token).await;
        }));

        let scanner = self.scanner.clone();
        let token = self.scanner_cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            scanner.run(token).await;
        }));

        api::spawn_api_server(
            self.opt.general.port,
            api::ApiState::new(
                self.recovery.clone(),
                self.engine.clone(),
                self.health_source(),
                self.opt.general.enable_metrics,
            ),
        )?;

        tracing::info!(port = self.opt.general.port, "relayer running");
        Ok(())
    }

    fn health_source(&self) -> api::HealthSource {
        api::HealthSource {
            recovery: self.recovery.clone(),
            evm_monitor: self.evm_monitor.clone(),
            cosmos_monitor: self.cosmos_monitor.clone(),
            acks: self.acks.clone(),
            scanner: self.scanner.clone(),
            engine: self.engine.clone(),
        }
    }

    pub fn health(&self) -> RelayerHealth {
        self.health_source().health()
    }

    /// Operator command: halt all outbound operations.
    pub fn emergency_stop(&self, reason: &str) {
        self.recovery.emergency_stop(reason);
    }

    pub fn resume(&self) {
        self.recovery.resume();
    }

    pub fn trip_circuit(&self, kind: OperationKind, reason: &str) {
        self.recovery.trip(kind, reason);
    }

    pub fn reset_circuit(&self, kind: Option<OperationKind>) {
        match kind {
            Some(kind) => self.recovery.reset(kind),
            None => self.recovery.reset_all(),
        }
    }

    /// Run until SIGINT/SIGTERM, then shut down in order.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.start().await?;
        wait_for_shutdown_signal().await;
        self.shutdown().await;
        Ok(())
    }

    /// Ordered shutdown: ingress first, then the scanner, then drain the
    /// engine bounded by the configured timeout, then everything else.
    pub async fn shutdown(mut self) {
        tracing::info!("shutting down: stopping monitors");
        self.monitor_cancel.cancel();
        self.scanner_cancel.cancel();

        let timeout = self.opt.general.shutdown_timeout;
        tracing::info!(?timeout, "draining relay engine");
        if tokio::time::timeout(timeout, self.engine.drain()).await.is_err() {
            tracing::warn!("engine did not drain in time, forcing exit");
        }

        self.service_cancel.cancel();
        self.registry.shut_down_tasks().await;
        // Give cooperative loops a moment to observe cancellation, then cut
        // the stragglers.
        tokio::time::sleep(Duration::from_millis(100)).await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::info!("shutdown complete");
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    tracing::error!("failed to listen for SIGTERM: {err}");
                    ctrl_c.await;
                    return;
                },
            };
        tokio::select! {
            _ = ctrl_c => tracing::info!("received ctrl-c"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}
