//! Status and operator HTTP API, served with tide-disco against the route
//! spec in `api/relayer.toml`.

use std::{io, sync::Arc};

use async_lock::RwLock;
use chain_monitors::{CosmosMonitor, EvmMonitor};
use futures::FutureExt;
use relayer_recovery::RecoveryManager;
use relayer_types::OperationKind;
use tide_disco::{error::ServerError, Api, App, StatusCode};
use vbs::version::{StaticVersion, StaticVersionType};

use crate::{AckHandler, RecoveryScanner, RelayEngine, RelayerHealth};

/// API version binding.
pub type ApiVer = StaticVersion<0, 1>;

/// Handles needed to assemble a [`RelayerHealth`] document.
#[derive(Clone)]
pub struct HealthSource {
    pub recovery: Arc<RecoveryManager>,
    pub evm_monitor: Arc<EvmMonitor>,
    pub cosmos_monitor: Arc<CosmosMonitor>,
    pub acks: Arc<AckHandler>,
    pub scanner: Arc<RecoveryScanner>,
    pub engine: Arc<RelayEngine>,
}

impl HealthSource {
    pub fn health(&self) -> RelayerHealth {
        let evm_monitor = self.evm_monitor.health();
        let cosmos_monitor = self.cosmos_monitor.health();
        let recovery = self.recovery.health();
        let healthy = recovery.healthy && evm_monitor.live && cosmos_monitor.live;
        RelayerHealth {
            healthy,
            recovery,
            evm_monitor,
            cosmos_monitor,
            acks: self.acks.health(),
            scanner: self.scanner.health(),
            relays: (&self.engine.metrics()).into(),
        }
    }
}

#[derive(Clone)]
pub struct ApiState {
    recovery: Arc<RecoveryManager>,
    engine: Arc<RelayEngine>,
    health: HealthSource,
    metrics_enabled: bool,
}

impl ApiState {
    pub fn new(
        recovery: Arc<RecoveryManager>,
        engine: Arc<RelayEngine>,
        health: HealthSource,
        metrics_enabled: bool,
    ) -> Self {
        Self {
            recovery,
            engine,
            health,
            metrics_enabled,
        }
    }
}

fn bad_request(message: String) -> ServerError {
    ServerError::catch_all(StatusCode::BAD_REQUEST, message)
}

fn parse_kind(raw: impl AsRef<str>) -> Result<OperationKind, ServerError> {
    let raw = raw.as_ref();
    raw.parse()
        .map_err(|_| bad_request(format!("unknown operation kind {raw:?}")))
}

/// Build and spawn the HTTP server. Runs until the process exits.
pub fn spawn_api_server(port: u16, state: ApiState) -> io::Result<()> {
    let mut app = App::<_, ServerError>::with_state(RwLock::new(state));
    let toml = toml::from_str::<toml::value::Value>(include_str!("../api/relayer.toml"))
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    let mut api = Api::<RwLock<ApiState>, ServerError, ApiVer>::new(toml)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    api.get("health", |_req, state| {
        async move { Ok(state.health.health()) }.boxed()
    })
    .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    api.get("metrics", |_req, state| {
        async move {
            if !state.metrics_enabled {
                return Err(ServerError::catch_all(
                    StatusCode::NOT_FOUND,
                    "metrics are disabled".into(),
                ));
            }
            Ok(state.engine.metrics())
        }
        .boxed()
    })
    .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    api.post("emergencystop", |req, state| {
        async move {
            let reason = req
                .string_param("reason")
                .map_err(|err| bad_request(err.to_string()))?;
            state.recovery.emergency_stop(reason);
            Ok("stopped")
        }
        .boxed()
    })
    .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    api.post("resume", |_req, state| {
        async move {
            state.recovery.resume();
            Ok("resumed")
        }
        .boxed()
    })
    .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    api.post("circuittrip", |req, state| {
        async move {
            let kind = parse_kind(
                req.string_param("kind")
                    .map_err(|err| bad_request(err.to_string()))?,
            )?;
            state.recovery.trip(kind, "operator request");
            Ok("tripped")
        }
        .boxed()
    })
    .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    api.post("circuitreset", |req, state| {
        async move {
            let raw = req
                .string_param("kind")
                .map_err(|err| bad_request(err.to_string()))?;
            let raw: &str = raw.as_ref();
            if raw == "all" {
                state.recovery.reset_all();
            } else {
                state.recovery.reset(parse_kind(raw)?);
            }
            Ok("reset")
        }
        .boxed()
    })
    .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    api.post("cleanup", |_req, state| {
        async move {
            let purged = state.engine.cleanup();
            Ok(purged)
        }
        .boxed()
    })
    .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    app.register_module("api", api)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    tokio::spawn(app.serve(format!("0.0.0.0:{port}"), ApiVer::instance()));
    Ok(())
}
