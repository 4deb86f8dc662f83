//! Periodic refund of expired HTLCs we created.
//!
//! Every `check_interval`, enumerate HTLCs on both chains whose sender is
//! the relayer, that are neither withdrawn nor refunded, and whose timelock
//! (plus the refund grace buffer) has passed, then submit one refund per
//! HTLC per scan cycle.

use std::sync::Arc;

use relayer_recovery::RecoveryManager;
use relayer_types::{config::RecoveryOptions, OperationKind, RelayError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::gateways::{EvmGateway, IbcGateway};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScannerHealth {
    pub enabled: bool,
    pub scans: u64,
    pub refunds_submitted: u64,
    pub last_error: Option<String>,
}

pub struct RecoveryScanner {
    evm: Arc<dyn EvmGateway>,
    ibc: Arc<dyn IbcGateway>,
    recovery: Arc<RecoveryManager>,
    opt: RecoveryOptions,
    state: parking_lot::Mutex<ScannerHealth>,
}

impl RecoveryScanner {
    pub fn new(
        evm: Arc<dyn EvmGateway>,
        ibc: Arc<dyn IbcGateway>,
        recovery: Arc<RecoveryManager>,
        opt: RecoveryOptions,
    ) -> Self {
        let state = parking_lot::Mutex::new(ScannerHealth {
            enabled: opt.enabled,
            ..Default::default()
        });
        Self {
            evm,
            ibc,
            recovery,
            opt,
            state,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        if !self.opt.enabled {
            tracing::info!("recovery scanner disabled");
            return;
        }
        tracing::info!(
            interval = ?self.opt.check_interval,
            "recovery scanner started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.opt.check_interval) => {},
            }
            match self.scan_once(relayer_utils::now_unix()).await {
                Ok(refunds) => {
                    let mut state = self.state.lock();
                    state.scans += 1;
                    state.refunds_submitted += refunds as u64;
                    state.last_error = None;
                },
                Err(err) => {
                    tracing::warn!("recovery scan failed: {err}");
                    let mut state = self.state.lock();
                    state.scans += 1;
                    state.last_error = Some(err.to_string());
                },
            }
        }
        tracing::info!("recovery scanner stopped");
    }

    /// One scan over both chains. Returns the number of refunds submitted.
    pub async fn scan_once(&self, now: u64) -> Result<usize, RelayError> {
        let cutoff = now.saturating_sub(self.opt.refund_buffer.as_secs());
        let mut refunds = 0;
        refunds += self.scan_evm(cutoff).await?;
        refunds += self.scan_ibc(cutoff).await?;
        Ok(refunds)
    }

    async fn scan_evm(&self, cutoff: u64) -> Result<usize, RelayError> {
        // Without a signing key we could not have created HTLCs here.
        let Some(our_address) = self.evm.relayer_address() else {
            return Ok(0);
        };
        let chain = self.evm.chain_id().to_string();
        let htlcs = self
            .recovery
            .execute(OperationKind::RecoveryCheck, &chain, || {
                self.evm.active_htlcs()
            })
            .await?;

        let mut refunds = 0;
        for htlc in htlcs {
            if !htlc.sender.eq_ignore_ascii_case(&our_address)
                || htlc.withdrawn
                || htlc.refunded
                || htlc.timelock >= cutoff
            {
                continue;
            }
            tracing::info!(
                chain = %chain,
                htlc_id = %htlc.htlc_id,
                timelock = htlc.timelock,
                "refunding expired HTLC"
            );
            match self
                .recovery
                .execute(OperationKind::RecoveryCheck, &htlc.htlc_id, || {
                    self.evm.refund(&htlc.htlc_id)
                })
                .await
            {
                Ok(tx) => {
                    tracing::info!(htlc_id = %htlc.htlc_id, %tx, "refund submitted");
                    refunds += 1;
                },
                Err(err) => {
                    tracing::warn!(htlc_id = %htlc.htlc_id, "refund failed: {err}");
                },
            }
        }
        Ok(refunds)
    }

    async fn scan_ibc(&self, cutoff: u64) -> Result<usize, RelayError> {
        let our_address = self.ibc.relayer_address();
        let chain = self.ibc.chain_id().to_string();
        let htlcs = self
            .recovery
            .execute(OperationKind::RecoveryCheck, &chain, || {
                self.ibc.htlcs_by_sender(&our_address)
            })
            .await?;

        let mut refunds = 0;
        for htlc in htlcs {
            if htlc.withdrawn || htlc.refunded || htlc.timelock >= cutoff {
                continue;
            }
            tracing::info!(
                chain = %chain,
                htlc_id = %htlc.htlc_id,
                timelock = htlc.timelock,
                "refunding expired HTLC"
            );
            match self
                .recovery
                .execute(OperationKind::RecoveryCheck, &htlc.htlc_id, || {
                    self.ibc.refund(&htlc.htlc_id)
                })
                .await
            {
                Ok(tx) => {
                    tracing::info!(htlc_id = %htlc.htlc_id, %tx, "refund submitted");
                    refunds += 1;
                },
                Err(err) => {
                    tracing::warn!(htlc_id = %htlc.htlc_id, "refund failed: {err}");
                },
            }
        }
        Ok(refunds)
    }

    pub fn health(&self) -> ScannerHealth {
        self.state.lock().clone()
    }
}
