//! Relayer configuration.
//!
//! One options struct per configuration group, all flattened into
//! [`RelayerOptions`]. Every flag can be set on the command line or through
//! the environment (`HTLC_RELAYER_*`).

use std::{str::FromStr, time::Duration};

use clap::Parser;
use cld::ClDuration;
use url::Url;

use crate::error::RelayError;

#[derive(Clone, Debug, thiserror::Error)]
#[error("failed to parse duration: {reason}")]
pub struct ParseDurationError {
    reason: String,
}

/// Parse a duration like `500ms`, `30s`, `5m`, `1h`.
pub fn parse_duration(s: &str) -> Result<Duration, ParseDurationError> {
    ClDuration::from_str(s)
        .map(Duration::from)
        .map_err(|err| ParseDurationError {
            reason: err.to_string(),
        })
}

/// EVM client and HTLC contract binding.
#[derive(Clone, Debug, Parser)]
pub struct EvmOptions {
    #[clap(long = "evm-rpc-url", env = "HTLC_RELAYER_EVM_RPC_URL")]
    pub rpc_url: Url,

    /// Logical chain id used in relay keys and the registry, e.g. `eth`.
    #[clap(long = "evm-chain-id", env = "HTLC_RELAYER_EVM_CHAIN_ID")]
    pub chain_id: String,

    /// Address of the HTLC escrow contract.
    #[clap(long = "evm-htlc-contract", env = "HTLC_RELAYER_EVM_HTLC_CONTRACT")]
    pub htlc_contract: String,

    /// Blocks to lag behind the head; only blocks at this depth are final.
    #[clap(
        long = "evm-confirmations",
        env = "HTLC_RELAYER_EVM_CONFIRMATIONS",
        default_value = "12"
    )]
    pub confirmations: u64,

    #[clap(
        long = "evm-gas-limit",
        env = "HTLC_RELAYER_EVM_GAS_LIMIT",
        default_value = "300000"
    )]
    pub gas_limit: u64,

    /// Fixed gas price in wei; the node's estimate is used when unset.
    #[clap(long = "evm-gas-price", env = "HTLC_RELAYER_EVM_GAS_PRICE")]
    pub gas_price: Option<u128>,

    /// Hex signing key for refund/withdraw transactions. Never logged;
    /// submissions are disabled when unset.
    #[clap(
        long = "evm-private-key",
        env = "HTLC_RELAYER_EVM_PRIVATE_KEY",
        hide_env_values = true
    )]
    pub private_key: Option<String>,

    #[clap(
        long = "evm-polling-interval",
        env = "HTLC_RELAYER_EVM_POLLING_INTERVAL",
        default_value = "7s",
        value_parser = parse_duration,
    )]
    pub polling_interval: Duration,

    /// Maximum block span scanned for events in a single poll.
    #[clap(
        long = "evm-max-blocks-per-batch",
        env = "HTLC_RELAYER_EVM_MAX_BLOCKS_PER_BATCH",
        default_value = "2000"
    )]
    pub max_blocks_per_batch: u64,

    /// Capacity of the recent-event dedup ring.
    #[clap(
        long = "evm-dedup-capacity",
        env = "HTLC_RELAYER_EVM_DEDUP_CAPACITY",
        default_value = "10000"
    )]
    pub dedup_capacity: usize,
}

/// IBC-chain client.
#[derive(Clone, Debug, Parser)]
pub struct CosmosOptions {
    #[clap(long = "cosmos-rpc-url", env = "HTLC_RELAYER_COSMOS_RPC_URL")]
    pub rpc_url: Url,

    #[clap(long = "cosmos-rest-url", env = "HTLC_RELAYER_COSMOS_REST_URL")]
    pub rest_url: Url,

    #[clap(long = "cosmos-chain-id", env = "HTLC_RELAYER_COSMOS_CHAIN_ID")]
    pub chain_id: String,

    /// Bech32 address of the wasm HTLC contract.
    #[clap(
        long = "cosmos-htlc-contract",
        env = "HTLC_RELAYER_COSMOS_HTLC_CONTRACT"
    )]
    pub htlc_contract: String,

    /// BIP-39 mnemonic for the relayer account. Never logged.
    #[clap(
        long = "cosmos-mnemonic",
        env = "HTLC_RELAYER_COSMOS_MNEMONIC",
        hide_env_values = true
    )]
    pub mnemonic: String,

    /// Gas price in the minimum denom, e.g. `0.025`.
    #[clap(
        long = "cosmos-gas-price",
        env = "HTLC_RELAYER_COSMOS_GAS_PRICE",
        default_value = "0.025"
    )]
    pub gas_price: f64,

    #[clap(
        long = "cosmos-gas-limit",
        env = "HTLC_RELAYER_COSMOS_GAS_LIMIT",
        default_value = "400000"
    )]
    pub gas_limit: u64,

    #[clap(
        long = "cosmos-denom",
        env = "HTLC_RELAYER_COSMOS_DENOM",
        default_value = "uatom"
    )]
    pub denom: String,

    #[clap(
        long = "cosmos-address-prefix",
        env = "HTLC_RELAYER_COSMOS_ADDRESS_PREFIX",
        default_value = "cosmos"
    )]
    pub address_prefix: String,

    #[clap(
        long = "cosmos-polling-interval",
        env = "HTLC_RELAYER_COSMOS_POLLING_INTERVAL",
        default_value = "5s",
        value_parser = parse_duration,
    )]
    pub polling_interval: Duration,
}

/// Chain registry cache and route discovery.
#[derive(Clone, Debug, Parser)]
pub struct RegistryOptions {
    #[clap(long = "registry-base-url", env = "HTLC_RELAYER_REGISTRY_BASE_URL")]
    pub base_url: Url,

    /// How long a snapshot is considered fresh. Stale reads are served, but
    /// the refresher is signalled.
    #[clap(
        long = "registry-cache-timeout",
        env = "HTLC_RELAYER_REGISTRY_CACHE_TIMEOUT",
        default_value = "5m",
        value_parser = parse_duration,
    )]
    pub cache_timeout: Duration,

    #[clap(
        long = "registry-refresh-interval",
        env = "HTLC_RELAYER_REGISTRY_REFRESH_INTERVAL",
        default_value = "1m",
        value_parser = parse_duration,
    )]
    pub refresh_interval: Duration,

    /// Maximum hops considered during route discovery.
    #[clap(
        long = "registry-max-hops",
        env = "HTLC_RELAYER_REGISTRY_MAX_HOPS",
        default_value = "4"
    )]
    pub max_hops: usize,

    /// Upper bound on any single hop's timeout window.
    #[clap(
        long = "registry-hop-timeout",
        env = "HTLC_RELAYER_REGISTRY_HOP_TIMEOUT",
        default_value = "1h",
        value_parser = parse_duration,
    )]
    pub hop_timeout: Duration,
}

/// Relay engine.
#[derive(Clone, Debug, Parser)]
pub struct RelayOptions {
    #[clap(
        long = "relay-max-retries",
        env = "HTLC_RELAYER_RELAY_MAX_RETRIES",
        default_value = "3"
    )]
    pub max_retries: u32,

    #[clap(
        long = "relay-retry-delay",
        env = "HTLC_RELAYER_RELAY_RETRY_DELAY",
        default_value = "30s",
        value_parser = parse_duration,
    )]
    pub retry_delay: Duration,

    /// Size of the relay worker pool; the in-flight concurrency bound.
    #[clap(
        long = "relay-batch-size",
        env = "HTLC_RELAYER_RELAY_BATCH_SIZE",
        default_value = "8"
    )]
    pub batch_size: usize,

    /// Tick of the housekeeping loop that requeues due retries and sweeps
    /// terminal relays.
    #[clap(
        long = "relay-processing-interval",
        env = "HTLC_RELAYER_RELAY_PROCESSING_INTERVAL",
        default_value = "10s",
        value_parser = parse_duration,
    )]
    pub processing_interval: Duration,

    /// Minimum remaining timelock required before mirroring an HTLC.
    #[clap(
        long = "relay-timeout-buffer",
        env = "HTLC_RELAYER_RELAY_TIMEOUT_BUFFER",
        default_value = "30m",
        value_parser = parse_duration,
    )]
    pub timeout_buffer: Duration,

    /// Capacity of the monitor→engine event queue. Monitors hold back their
    /// cursors while the queue is full.
    #[clap(
        long = "relay-queue-capacity",
        env = "HTLC_RELAYER_RELAY_QUEUE_CAPACITY",
        default_value = "256"
    )]
    pub queue_capacity: usize,
}

/// Expired-HTLC recovery scanner.
#[derive(Clone, Debug, Parser)]
pub struct RecoveryOptions {
    #[clap(
        long = "recovery-enabled",
        env = "HTLC_RELAYER_RECOVERY_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enabled: bool,

    #[clap(
        long = "recovery-check-interval",
        env = "HTLC_RELAYER_RECOVERY_CHECK_INTERVAL",
        default_value = "1m",
        value_parser = parse_duration,
    )]
    pub check_interval: Duration,

    /// Grace period past expiry before refunding, covering hops that may
    /// still be settling.
    #[clap(
        long = "recovery-refund-buffer",
        env = "HTLC_RELAYER_RECOVERY_REFUND_BUFFER",
        default_value = "5m",
        value_parser = parse_duration,
    )]
    pub refund_buffer: Duration,
}

/// Retry and circuit-breaker tuning for the recovery core.
#[derive(Clone, Debug, Parser)]
pub struct RetryOptions {
    #[clap(
        long = "retry-base-delay",
        env = "HTLC_RELAYER_RETRY_BASE_DELAY",
        default_value = "1s",
        value_parser = parse_duration,
    )]
    pub base_delay: Duration,

    #[clap(
        long = "retry-max-delay",
        env = "HTLC_RELAYER_RETRY_MAX_DELAY",
        default_value = "30s",
        value_parser = parse_duration,
    )]
    pub max_delay: Duration,

    #[clap(
        long = "retry-multiplier",
        env = "HTLC_RELAYER_RETRY_MULTIPLIER",
        default_value = "2.0"
    )]
    pub multiplier: f64,

    /// Add ±25% uniform noise to every backoff delay.
    #[clap(
        long = "retry-jitter",
        env = "HTLC_RELAYER_RETRY_JITTER",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub jitter: bool,

    #[clap(
        long = "retry-max-attempts",
        env = "HTLC_RELAYER_RETRY_MAX_ATTEMPTS",
        default_value = "5"
    )]
    pub max_attempts: u32,

    /// Consecutive failures before a breaker opens.
    #[clap(
        long = "breaker-failure-threshold",
        env = "HTLC_RELAYER_BREAKER_FAILURE_THRESHOLD",
        default_value = "5"
    )]
    pub failure_threshold: u32,

    /// Time an open breaker waits before letting a probe through.
    #[clap(
        long = "breaker-cooldown",
        env = "HTLC_RELAYER_BREAKER_COOLDOWN",
        default_value = "1m",
        value_parser = parse_duration,
    )]
    pub cooldown: Duration,
}

/// Process lifecycle.
#[derive(Clone, Debug, Parser)]
pub struct GeneralOptions {
    #[clap(
        long = "log-level",
        env = "HTLC_RELAYER_LOG_LEVEL",
        default_value = "info"
    )]
    pub log_level: String,

    /// Port for the status/operator HTTP API.
    #[clap(long, env = "HTLC_RELAYER_PORT", default_value = "8555")]
    pub port: u16,

    #[clap(
        long = "enable-metrics",
        env = "HTLC_RELAYER_ENABLE_METRICS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_metrics: bool,

    /// How long shutdown waits for in-flight relays to drain.
    #[clap(
        long = "shutdown-timeout",
        env = "HTLC_RELAYER_SHUTDOWN_TIMEOUT",
        default_value = "30s",
        value_parser = parse_duration,
    )]
    pub shutdown_timeout: Duration,
}

// Option groups whose flags all carry defaults can be constructed directly,
// which keeps tests free of argument plumbing.
macro_rules! impl_default_from_empty_args {
    ($($opt:ty),* $(,)?) => {
        $(impl Default for $opt {
            fn default() -> Self {
                Self::parse_from(std::iter::empty::<String>())
            }
        })*
    };
}

impl_default_from_empty_args!(RelayOptions, RecoveryOptions, RetryOptions, GeneralOptions);

/// Complete relayer configuration.
#[derive(Clone, Debug, Parser)]
#[clap(name = "htlc-relayer")]
pub struct RelayerOptions {
    #[clap(flatten)]
    pub evm: EvmOptions,
    #[clap(flatten)]
    pub cosmos: CosmosOptions,
    #[clap(flatten)]
    pub registry: RegistryOptions,
    #[clap(flatten)]
    pub relay: RelayOptions,
    #[clap(flatten)]
    pub recovery: RecoveryOptions,
    #[clap(flatten)]
    pub retry: RetryOptions,
    #[clap(flatten)]
    pub general: GeneralOptions,
}

impl RelayerOptions {
    /// Reject configurations that cannot work before any task starts.
    pub fn validate(&self) -> Result<(), RelayError> {
        let contract = self.evm.htlc_contract.strip_prefix("0x").unwrap_or_default();
        if contract.len() != 40 || !contract.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RelayError::Config(format!(
                "evm htlc contract {:?} is not a 20-byte hex address",
                self.evm.htlc_contract
            )));
        }
        if !self
            .cosmos
            .htlc_contract
            .starts_with(&self.cosmos.address_prefix)
        {
            return Err(RelayError::Config(format!(
                "cosmos htlc contract {:?} does not match the {:?} prefix",
                self.cosmos.htlc_contract, self.cosmos.address_prefix
            )));
        }
        if self.cosmos.mnemonic.split_whitespace().count() < 12 {
            return Err(RelayError::Config(
                "cosmos mnemonic must have at least 12 words".into(),
            ));
        }
        if !crate::memo::is_valid_denom(&self.cosmos.denom) {
            return Err(RelayError::Config(format!(
                "denom {:?} is not a valid denom",
                self.cosmos.denom
            )));
        }
        if self.registry.max_hops == 0 {
            return Err(RelayError::Config("max hops must be at least 1".into()));
        }
        if self.relay.batch_size == 0 {
            return Err(RelayError::Config("batch size must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(RelayError::Config(
                "retry multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse_opts(overrides: &[(&str, &str)]) -> RelayerOptions {
        let mut args: Vec<String> = vec![
            "htlc-relayer",
            "--evm-rpc-url",
            "http://localhost:8545",
            "--evm-chain-id",
            "eth",
            "--evm-htlc-contract",
            "0x00000000000000000000000000000000000000aa",
            "--cosmos-rpc-url",
            "http://localhost:26657",
            "--cosmos-rest-url",
            "http://localhost:1317",
            "--cosmos-chain-id",
            "hub-4",
            "--cosmos-htlc-contract",
            "cosmos1contract",
            "--registry-base-url",
            "http://localhost:9100",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        args.push("--cosmos-mnemonic".into());
        args.push("test test test test test test test test test test test junk".into());
        for (k, v) in overrides {
            args.push((*k).into());
            args.push((*v).into());
        }
        RelayerOptions::parse_from(args)
    }

    #[test]
    fn defaults_are_valid() {
        let opt = parse_opts(&[]);
        opt.validate().unwrap();
        assert_eq!(opt.evm.confirmations, 12);
        assert_eq!(opt.relay.max_retries, 3);
        assert_eq!(opt.relay.timeout_buffer, Duration::from_secs(30 * 60));
        assert_eq!(opt.registry.max_hops, 4);
        assert!(opt.recovery.enabled);
    }

    #[test]
    fn duration_flags_parse() {
        let opt = parse_opts(&[
            ("--evm-polling-interval", "500ms"),
            ("--relay-retry-delay", "2m"),
        ]);
        assert_eq!(opt.evm.polling_interval, Duration::from_millis(500));
        assert_eq!(opt.relay.retry_delay, Duration::from_secs(120));
    }

    #[test]
    fn bad_contract_is_rejected() {
        let opt = parse_opts(&[("--evm-htlc-contract", "0x1234")]);
        assert!(matches!(opt.validate(), Err(RelayError::Config(_))));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let opt = parse_opts(&[("--relay-batch-size", "0")]);
        assert!(opt.validate().is_err());
    }
}
