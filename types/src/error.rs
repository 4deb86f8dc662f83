use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Classes of fallible outbound operations. Every operation executed through
/// the recovery core carries one of these, which selects the circuit breaker
/// guarding it and the retry bounds applied to it.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    EvmRpc,
    IbcRpc,
    IbcTransfer,
    ContractCall,
    RouteDiscovery,
    HtlcCreation,
    RecoveryCheck,
    Relay,
}

/// Error taxonomy for the relayer.
///
/// `TransientNetwork` and `Chain` are retried by the recovery core (the
/// latter with a lower attempt bound); everything else short-circuits
/// retries and is surfaced to the caller.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// RPC timeout, connection reset, and similar; safe to retry.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// The chain accepted the submission but rejected the transaction.
    #[error("transaction rejected on chain: {0}")]
    Chain(String),

    /// Missing or invalid configuration; fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Memo, channel, port, or denom failed validation; the offending event
    /// is dropped.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The circuit breaker guarding this operation kind refused execution.
    #[error("circuit breaker open for {kind} operations")]
    CircuitOpen { kind: OperationKind },

    /// The source timelock expires too soon to safely mirror the HTLC.
    #[error("timelock {timelock} is within {buffer}s of expiry")]
    TimelockTooClose { timelock: u64, buffer: u64 },

    /// Route discovery produced no usable path.
    #[error("no open route from {source} to {target}")]
    NoRouteFound { source: String, target: String },

    /// The planned per-hop timeouts violate the decreasing-cascade rule.
    #[error("invalid timelock cascade: {0}")]
    InvalidTimelockCascade(String),

    /// Process-wide halt requested by an operator.
    #[error("emergency stop active: {0}")]
    EmergencyStopped(String),
}

impl RelayError {
    /// Whether the recovery core may retry the failed operation.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::Chain(_))
    }

    /// Business outcomes that mark a relay failed without retrying.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            Self::TimelockTooClose { .. }
                | Self::NoRouteFound { .. }
                | Self::InvalidTimelockCascade(_)
        )
    }

    /// Short machine-readable label, used in logs and relay failure reasons.
    pub fn label(&self) -> &'static str {
        match self {
            Self::TransientNetwork(_) => "transient-network",
            Self::Chain(_) => "chain-error",
            Self::Config(_) => "config-error",
            Self::Validation(_) => "validation-error",
            Self::CircuitOpen { .. } => "circuit-open",
            Self::TimelockTooClose { .. } => "timelock-too-close",
            Self::NoRouteFound { .. } => "no-route-found",
            Self::InvalidTimelockCascade(_) => "invalid-timelock-cascade",
            Self::EmergencyStopped(_) => "emergency-stopped",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retriable_classes() {
        assert!(RelayError::TransientNetwork("timeout".into()).is_retriable());
        assert!(RelayError::Chain("out of gas".into()).is_retriable());
        assert!(!RelayError::Validation("bad channel".into()).is_retriable());
        assert!(!RelayError::CircuitOpen {
            kind: OperationKind::EvmRpc
        }
        .is_retriable());
        assert!(!RelayError::EmergencyStopped("drill".into()).is_retriable());
    }

    #[test]
    fn business_errors_do_not_retry() {
        let err = RelayError::NoRouteFound {
            source: "eth".into(),
            target: "osm-1".into(),
        };
        assert!(err.is_business());
        assert!(!err.is_retriable());
    }

    #[test]
    fn operation_kind_display() {
        assert_eq!(OperationKind::EvmRpc.to_string(), "evm-rpc");
        assert_eq!(OperationKind::IbcTransfer.to_string(), "ibc-transfer");
        assert_eq!(
            "recovery-check".parse::<OperationKind>().unwrap(),
            OperationKind::RecoveryCheck
        );
    }
}
