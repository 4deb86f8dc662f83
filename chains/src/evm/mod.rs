//! EVM chain client: HTLC escrow contract binding, event queries, and
//! transaction submission.

use alloy::{
    contract::SolCallBuilder,
    network::{Ethereum, EthereumWallet},
    primitives::{Address, FixedBytes, U256},
    providers::{
        fillers::{FillProvider, JoinFill, RecommendedFillers, WalletFiller},
        Identity, Provider, ProviderBuilder, RootProvider,
    },
    rpc::types::Log,
    signers::local::PrivateKeySigner,
    sol,
    sol_types::SolCall,
};
use anyhow::Context;
use relayer_types::{
    config::EvmOptions, HtlcCreated, HtlcEvent, HtlcRefunded, HtlcWithdrawn, RelayError,
};

pub mod monitor;

pub use monitor::{EvmMonitor, EvmMonitorHealth};

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract HtlcEscrow {
        event HTLCCreated(
            bytes32 indexed htlcId,
            address indexed sender,
            string receiver,
            address token,
            uint256 amount,
            bytes32 hashlock,
            uint256 timelock,
            string targetChain,
            string targetAddress
        );
        event HTLCWithdrawn(bytes32 indexed htlcId, bytes32 secret);
        event HTLCRefunded(bytes32 indexed htlcId);

        function createHTLC(
            bytes32 htlcId,
            address token,
            uint256 amount,
            bytes32 hashlock,
            uint256 timelock,
            string calldata receiver
        ) external payable;
        function withdraw(bytes32 htlcId, bytes32 secret) external;
        function refund(bytes32 htlcId) external;
        function activeHTLCIds() external view returns (bytes32[] memory ids);
        function getHTLC(bytes32 htlcId) external view returns (
            address sender,
            address token,
            uint256 amount,
            bytes32 hashlock,
            uint256 timelock,
            bool withdrawn,
            bool refunded
        );
    }
}

/// Read-only provider with the recommended fillers.
pub type EvmProvider = FillProvider<
    JoinFill<Identity, <Ethereum as RecommendedFillers>::RecommendedFillers>,
    RootProvider,
>;

/// Provider with a wallet attached, for submitting transactions.
pub type EvmWalletProvider = FillProvider<
    JoinFill<
        JoinFill<Identity, <Ethereum as RecommendedFillers>::RecommendedFillers>,
        WalletFiller<EthereumWallet>,
    >,
    RootProvider,
>;

/// A live HTLC read back from the escrow contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HtlcState {
    pub htlc_id: String,
    pub sender: String,
    pub timelock: u64,
    pub withdrawn: bool,
    pub refunded: bool,
}

pub struct EvmClient {
    provider: EvmProvider,
    /// Present when a signing key is configured.
    wallet_provider: Option<EvmWalletProvider>,
    relayer_address: Option<Address>,
    contract_address: Address,
    chain_id: String,
    gas_limit: u64,
    gas_price: Option<u128>,
}

impl EvmClient {
    pub fn new(opt: &EvmOptions) -> anyhow::Result<Self> {
        let contract_address: Address = opt
            .htlc_contract
            .parse()
            .with_context(|| format!("invalid htlc contract address {:?}", opt.htlc_contract))?;
        let provider = ProviderBuilder::new().on_http(opt.rpc_url.clone());

        let (wallet_provider, relayer_address) = match &opt.private_key {
            Some(key) => {
                let signer: PrivateKeySigner =
                    key.parse().context("invalid evm signing key")?;
                let address = signer.address();
                let wallet = EthereumWallet::from(signer);
                let provider = ProviderBuilder::new()
                    .wallet(wallet)
                    .on_http(opt.rpc_url.clone());
                (Some(provider), Some(address))
            },
            None => (None, None),
        };

        Ok(Self {
            provider,
            wallet_provider,
            relayer_address,
            contract_address,
            chain_id: opt.chain_id.clone(),
            gas_limit: opt.gas_limit,
            gas_price: opt.gas_price,
        })
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Our own address, when a signing key is configured.
    pub fn relayer_address(&self) -> Option<String> {
        self.relayer_address.map(|a| format!("{a:#x}"))
    }

    pub async fn block_number(&self) -> Result<u64, RelayError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|err| RelayError::TransientNetwork(format!("get_block_number: {err}")))
    }

    /// All HTLC events in `[from, to]`, ordered by block then log index.
    pub async fn query_events(&self, from: u64, to: u64) -> Result<Vec<HtlcEvent>, RelayError> {
        let contract = HtlcEscrow::new(self.contract_address, self.provider.clone());

        let created = contract
            .HTLCCreated_filter()
            .from_block(from)
            .to_block(to)
            .query()
            .await
            .map_err(transient)?;
        let withdrawn = contract
            .HTLCWithdrawn_filter()
            .from_block(from)
            .to_block(to)
            .query()
            .await
            .map_err(transient)?;
        let refunded = contract
            .HTLCRefunded_filter()
            .from_block(from)
            .to_block(to)
            .query()
            .await
            .map_err(transient)?;

        let mut events = Vec::with_capacity(created.len() + withdrawn.len() + refunded.len());
        for (event, log) in created {
            let (block_number, tx_hash, log_index) = log_meta(&log);
            events.push(HtlcEvent::Created(HtlcCreated {
                chain_id: self.chain_id.clone(),
                htlc_id: format!("{:#x}", event.htlcId),
                sender: format!("{:#x}", event.sender),
                receiver: event.receiver.clone(),
                amount: event.amount.to_string(),
                token: format!("{:#x}", event.token),
                hashlock: hex::encode(event.hashlock),
                timelock: u256_to_u64(event.timelock),
                target_chain: event.targetChain.clone(),
                target_address: event.targetAddress.clone(),
                block_number,
                tx_hash,
                log_index,
            }));
        }
        for (event, log) in withdrawn {
            let (block_number, tx_hash, log_index) = log_meta(&log);
            events.push(HtlcEvent::Withdrawn(HtlcWithdrawn {
                chain_id: self.chain_id.clone(),
                htlc_id: format!("{:#x}", event.htlcId),
                secret: hex::encode(event.secret),
                block_number,
                tx_hash,
                log_index,
            }));
        }
        for (event, log) in refunded {
            let (block_number, tx_hash, log_index) = log_meta(&log);
            events.push(HtlcEvent::Refunded(HtlcRefunded {
                chain_id: self.chain_id.clone(),
                htlc_id: format!("{:#x}", event.htlcId),
                block_number,
                tx_hash,
                log_index,
            }));
        }

        events.sort_by_key(|e| match e {
            HtlcEvent::Created(e) => (e.block_number, e.log_index),
            HtlcEvent::Withdrawn(e) => (e.block_number, e.log_index),
            HtlcEvent::Refunded(e) => (e.block_number, e.log_index),
        });
        Ok(events)
    }

    /// HTLCs still live on the contract, for the recovery scanner.
    pub async fn active_htlcs(&self) -> Result<Vec<HtlcState>, RelayError> {
        let contract = HtlcEscrow::new(self.contract_address, self.provider.clone());
        let ids = contract
            .activeHTLCIds()
            .call()
            .await
            .map_err(transient)?
            .ids;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let htlc = contract.getHTLC(id).call().await.map_err(transient)?;
            out.push(HtlcState {
                htlc_id: format!("{id:#x}"),
                sender: format!("{:#x}", htlc.sender),
                timelock: u256_to_u64(htlc.timelock),
                withdrawn: htlc.withdrawn,
                refunded: htlc.refunded,
            });
        }
        Ok(out)
    }

    pub async fn refund(&self, htlc_id: &str) -> Result<String, RelayError> {
        let id = parse_htlc_id(htlc_id)?;
        let provider = self.wallet()?;
        let contract = HtlcEscrow::new(self.contract_address, provider.clone());
        let call = contract.refund(id);
        self.send(call).await
    }

    pub async fn withdraw(&self, htlc_id: &str, secret: &str) -> Result<String, RelayError> {
        let id = parse_htlc_id(htlc_id)?;
        let secret = parse_htlc_id(secret)?;
        let provider = self.wallet()?;
        let contract = HtlcEscrow::new(self.contract_address, provider.clone());
        let call = contract.withdraw(id, secret);
        self.send(call).await
    }

    /// Mirror an HTLC directly on this chain's escrow contract.
    pub async fn create_htlc(
        &self,
        htlc_id: &str,
        token: &str,
        amount: &str,
        hashlock: &str,
        timelock: u64,
        receiver: &str,
    ) -> Result<String, RelayError> {
        let id = parse_htlc_id(htlc_id)?;
        let hashlock = parse_htlc_id(hashlock)?;
        let token: Address = token
            .parse()
            .map_err(|_| RelayError::Validation(format!("invalid token address {token:?}")))?;
        let amount: U256 = amount
            .parse()
            .map_err(|_| RelayError::Validation(format!("invalid amount {amount:?}")))?;
        let provider = self.wallet()?;
        let contract = HtlcEscrow::new(self.contract_address, provider.clone());
        let call = contract.createHTLC(
            id,
            token,
            amount,
            hashlock,
            U256::from(timelock),
            receiver.to_string(),
        );
        self.send(call).await
    }

    fn wallet(&self) -> Result<&EvmWalletProvider, RelayError> {
        self.wallet_provider.as_ref().ok_or_else(|| {
            RelayError::Config("no evm signing key configured, cannot submit transactions".into())
        })
    }

    /// Send a contract call and wait for its receipt. A mined-but-reverted
    /// transaction is a chain error, not a transport one.
    async fn send<T: Clone + Send + Sync, P: Provider, C: SolCall>(
        &self,
        call: SolCallBuilder<T, P, C>,
    ) -> Result<String, RelayError> {
        let call = call.gas(self.gas_limit);
        let call = match self.gas_price {
            Some(gas_price) => call.gas_price(gas_price),
            None => call,
        };
        let pending = call
            .send()
            .await
            .map_err(|err| RelayError::Chain(format!("send: {err}")))?;
        let hash = *pending.tx_hash();
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|err| RelayError::TransientNetwork(format!("receipt for {hash:#x}: {err}")))?;
        if !receipt.status() {
            return Err(RelayError::Chain(format!(
                "transaction {hash:#x} reverted"
            )));
        }
        Ok(format!("{hash:#x}"))
    }
}

fn transient(err: impl std::fmt::Display) -> RelayError {
    RelayError::TransientNetwork(err.to_string())
}

fn log_meta(log: &Log) -> (u64, String, u64) {
    (
        log.block_number.unwrap_or_default(),
        log.transaction_hash
            .map(|h| format!("{h:#x}"))
            .unwrap_or_default(),
        log.log_index.unwrap_or_default(),
    )
}

fn u256_to_u64(value: U256) -> u64 {
    value.min(U256::from(u64::MAX)).to::<u64>()
}

fn parse_htlc_id(hex_id: &str) -> Result<FixedBytes<32>, RelayError> {
    let digits = hex_id.strip_prefix("0x").unwrap_or(hex_id);
    let bytes = hex::decode(digits)
        .map_err(|_| RelayError::Validation(format!("invalid 32-byte hex id {hex_id:?}")))?;
    if bytes.len() != 32 {
        return Err(RelayError::Validation(format!(
            "id {hex_id:?} is {} bytes, expected 32",
            bytes.len()
        )));
    }
    Ok(FixedBytes::from_slice(&bytes))
}
