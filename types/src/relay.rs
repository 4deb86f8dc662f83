//! The relay data model: source-chain HTLC events as observed by the
//! monitors, and the per-swap [`PendingRelay`] record owned by the relay
//! engine from ingestion to terminal status.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RelayError;

/// Unique key for a relay: `"{source_chain}:{htlc_id}"`.
pub fn relay_id(source_chain: &str, htlc_id: &str) -> String {
    format!("{source_chain}:{htlc_id}")
}

/// Dedup key for a source event: `"{tx_hash}/{log_index}"`, matching the
/// persisted `event:` key layout.
pub fn event_key(tx_hash: &str, log_index: u64) -> String {
    format!("{tx_hash}/{log_index}")
}

/// Hex-encoded SHA-256 of a secret; the hashlock side of the HTLC.
pub fn hashlock_of(secret: &[u8]) -> String {
    hex::encode(Sha256::digest(secret))
}

/// A new HTLC observed on a source chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HtlcCreated {
    pub chain_id: String,
    pub htlc_id: String,
    pub sender: String,
    pub receiver: String,
    /// Decimal string; amounts are never parsed into floats.
    pub amount: String,
    pub token: String,
    pub hashlock: String,
    /// Unix seconds.
    pub timelock: u64,
    pub target_chain: String,
    pub target_address: String,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
}

/// A withdrawal revealing the preimage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HtlcWithdrawn {
    pub chain_id: String,
    pub htlc_id: String,
    pub secret: String,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
}

/// A refund after timelock expiry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HtlcRefunded {
    pub chain_id: String,
    pub htlc_id: String,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
}

/// Event stream flowing from the chain monitors to the relay engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HtlcEvent {
    Created(HtlcCreated),
    Withdrawn(HtlcWithdrawn),
    Refunded(HtlcRefunded),
}

impl HtlcEvent {
    pub fn chain_id(&self) -> &str {
        match self {
            Self::Created(e) => &e.chain_id,
            Self::Withdrawn(e) => &e.chain_id,
            Self::Refunded(e) => &e.chain_id,
        }
    }

    pub fn dedup_key(&self) -> String {
        match self {
            Self::Created(e) => event_key(&e.tx_hash, e.log_index),
            Self::Withdrawn(e) => event_key(&e.tx_hash, e.log_index),
            Self::Refunded(e) => event_key(&e.tx_hash, e.log_index),
        }
    }
}

/// Optional DEX instructions attached to a relay by the swap collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapParams {
    pub output_denom: String,
    pub min_output: String,
    pub slippage_bps: u16,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    Pending,
    Relaying,
    Completed,
    Failed,
}

/// One end-to-end mirroring of a source HTLC, keyed by [`relay_id`].
///
/// Owned exclusively by the relay engine; monitors hand events off by value.
/// `completed` is terminal; `failed` is terminal once `attempts` has reached
/// the retry bound.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRelay {
    pub relay_id: String,
    pub source_chain: String,
    pub target_chain: String,
    pub htlc_id: String,
    pub amount: String,
    pub token: String,
    pub hashlock: String,
    pub timelock: u64,
    pub sender: String,
    pub receiver: String,
    pub status: RelayStatus,
    pub attempts: u32,
    /// Hops acknowledged so far on a multi-hop path.
    pub hops_completed: u32,
    /// Total hops on the chosen path; zero until a route is planned.
    pub total_hops: u32,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap_params: Option<SwapParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl PendingRelay {
    pub fn from_created(event: &HtlcCreated, now: u64) -> Self {
        Self {
            relay_id: relay_id(&event.chain_id, &event.htlc_id),
            source_chain: event.chain_id.clone(),
            target_chain: event.target_chain.clone(),
            htlc_id: event.htlc_id.clone(),
            amount: event.amount.clone(),
            token: event.token.clone(),
            hashlock: event.hashlock.clone(),
            timelock: event.timelock,
            sender: event.sender.clone(),
            receiver: event.receiver.clone(),
            status: RelayStatus::Pending,
            attempts: 0,
            hops_completed: 0,
            total_hops: 0,
            created_at: now,
            updated_at: now,
            secret: None,
            swap_params: None,
            failure_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RelayStatus::Completed | RelayStatus::Failed)
    }

    /// Apply a status transition, enforcing that terminal states are never
    /// left. Returns an error for transitions out of `completed`/`failed`.
    pub fn transition(&mut self, next: RelayStatus, now: u64) -> Result<(), RelayError> {
        if self.is_terminal() {
            return Err(RelayError::Validation(format!(
                "relay {} is already {} and cannot become {next}",
                self.relay_id, self.status
            )));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Record a failed attempt. Returns to `pending` while retries remain,
    /// otherwise lands in terminal `failed` with the given reason.
    pub fn record_failure(&mut self, reason: &str, max_retries: u32, now: u64) {
        if self.is_terminal() {
            return;
        }
        self.failure_reason = Some(reason.to_string());
        self.updated_at = now;
        if self.attempts < max_retries {
            self.status = RelayStatus::Pending;
        } else {
            self.status = RelayStatus::Failed;
        }
    }

    /// Mark failed with no further retries, regardless of attempt count.
    pub fn fail_terminally(&mut self, reason: &str, now: u64) {
        if self.is_terminal() {
            return;
        }
        self.failure_reason = Some(reason.to_string());
        self.status = RelayStatus::Failed;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    pub fn created_fixture() -> HtlcCreated {
        HtlcCreated {
            chain_id: "eth".into(),
            htlc_id: "0xabc01".into(),
            sender: "0xsender".into(),
            receiver: "osm1recv".into(),
            amount: "1000000".into(),
            token: "0xtoken".into(),
            hashlock: hashlock_of(b"secret"),
            timelock: 1_700_014_400,
            target_chain: "osm-1".into(),
            target_address: "osm1recv".into(),
            block_number: 100,
            tx_hash: "0xdeadbeef".into(),
            log_index: 3,
        }
    }

    #[test]
    fn relay_id_format() {
        assert_eq!(relay_id("eth", "0xabc01"), "eth:0xabc01");
    }

    #[test]
    fn relay_from_event() {
        let relay = PendingRelay::from_created(&created_fixture(), 1_700_000_000);
        assert_eq!(relay.relay_id, "eth:0xabc01");
        assert_eq!(relay.status, RelayStatus::Pending);
        assert_eq!(relay.attempts, 0);
        assert_eq!(relay.created_at, 1_700_000_000);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut relay = PendingRelay::from_created(&created_fixture(), 0);
        relay.transition(RelayStatus::Relaying, 1).unwrap();
        relay.transition(RelayStatus::Completed, 2).unwrap();
        assert!(relay.transition(RelayStatus::Pending, 3).is_err());
        assert_eq!(relay.status, RelayStatus::Completed);

        relay.record_failure("late failure", 10, 4);
        relay.fail_terminally("later still", 5);
        assert_eq!(relay.status, RelayStatus::Completed);
        assert_eq!(relay.updated_at, 2);
    }

    #[test]
    fn failure_returns_to_pending_until_retries_exhausted() {
        let mut relay = PendingRelay::from_created(&created_fixture(), 0);
        relay.transition(RelayStatus::Relaying, 1).unwrap();
        relay.attempts = 1;
        relay.record_failure("rpc timeout", 3, 2);
        assert_eq!(relay.status, RelayStatus::Pending);

        relay.transition(RelayStatus::Relaying, 3).unwrap();
        relay.attempts = 3;
        relay.record_failure("rpc timeout", 3, 4);
        assert_eq!(relay.status, RelayStatus::Failed);
        assert!(relay.is_terminal());
    }

    #[test]
    fn hashlock_matches_sha256() {
        assert_eq!(
            hashlock_of(b"secret"),
            "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
        );
    }
}
