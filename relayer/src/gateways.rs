//! Thin gateway traits over the chain clients.
//!
//! The engine and the recovery scanner talk to chains exclusively through
//! these, which keeps them testable against in-process fakes.

use async_trait::async_trait;
use chain_monitors::{
    CosmosClient, CosmosHtlc, EvmClient, HtlcState, IbcTransferRequest, SubmittedTransfer,
};
use relayer_types::RelayError;

/// The local IBC chain: transfers enter the interchain here.
#[async_trait]
pub trait IbcGateway: Send + Sync {
    fn chain_id(&self) -> &str;

    /// Denom the relayer's liquidity is held in.
    fn denom(&self) -> &str;

    fn relayer_address(&self) -> String;

    async fn submit_transfer(
        &self,
        request: &IbcTransferRequest,
    ) -> Result<SubmittedTransfer, RelayError>;

    /// Mirror an HTLC directly on the local wasm contract.
    #[allow(clippy::too_many_arguments)]
    async fn create_htlc(
        &self,
        htlc_id: &str,
        receiver: &str,
        amount: &str,
        hashlock: &str,
        timelock: u64,
        source_chain: &str,
        source_htlc_id: &str,
    ) -> Result<String, RelayError>;

    async fn withdraw(&self, htlc_id: &str, secret: &str) -> Result<String, RelayError>;

    async fn refund(&self, htlc_id: &str) -> Result<String, RelayError>;

    async fn htlcs_by_sender(&self, sender: &str) -> Result<Vec<CosmosHtlc>, RelayError>;
}

/// The account-based EVM chain.
#[async_trait]
pub trait EvmGateway: Send + Sync {
    fn chain_id(&self) -> &str;

    /// None when no signing key is configured.
    fn relayer_address(&self) -> Option<String>;

    async fn create_htlc(
        &self,
        htlc_id: &str,
        token: &str,
        amount: &str,
        hashlock: &str,
        timelock: u64,
        receiver: &str,
    ) -> Result<String, RelayError>;

    async fn withdraw(&self, htlc_id: &str, secret: &str) -> Result<String, RelayError>;

    async fn refund(&self, htlc_id: &str) -> Result<String, RelayError>;

    async fn active_htlcs(&self) -> Result<Vec<HtlcState>, RelayError>;
}

#[async_trait]
impl IbcGateway for CosmosClient {
    fn chain_id(&self) -> &str {
        CosmosClient::chain_id(self)
    }

    fn denom(&self) -> &str {
        self.denom()
    }

    fn relayer_address(&self) -> String {
        CosmosClient::relayer_address(self)
    }

    async fn submit_transfer(
        &self,
        request: &IbcTransferRequest,
    ) -> Result<SubmittedTransfer, RelayError> {
        CosmosClient::submit_transfer(self, request).await
    }

    async fn create_htlc(
        &self,
        htlc_id: &str,
        receiver: &str,
        amount: &str,
        hashlock: &str,
        timelock: u64,
        source_chain: &str,
        source_htlc_id: &str,
    ) -> Result<String, RelayError> {
        CosmosClient::create_htlc(
            self,
            htlc_id,
            receiver,
            amount,
            self.denom(),
            hashlock,
            timelock,
            source_chain,
            source_htlc_id,
        )
        .await
    }

    async fn withdraw(&self, htlc_id: &str, secret: &str) -> Result<String, RelayError> {
        CosmosClient::withdraw(self, htlc_id, secret).await
    }

    async fn refund(&self, htlc_id: &str) -> Result<String, RelayError> {
        CosmosClient::refund(self, htlc_id).await
    }

    async fn htlcs_by_sender(&self, sender: &str) -> Result<Vec<CosmosHtlc>, RelayError> {
        CosmosClient::htlcs_by_sender(self, sender).await
    }
}

#[async_trait]
impl EvmGateway for EvmClient {
    fn chain_id(&self) -> &str {
        EvmClient::chain_id(self)
    }

    fn relayer_address(&self) -> Option<String> {
        EvmClient::relayer_address(self)
    }

    async fn create_htlc(
        &self,
        htlc_id: &str,
        token: &str,
        amount: &str,
        hashlock: &str,
        timelock: u64,
        receiver: &str,
    ) -> Result<String, RelayError> {
        EvmClient::create_htlc(self, htlc_id, token, amount, hashlock, timelock, receiver).await
    }

    async fn withdraw(&self, htlc_id: &str, secret: &str) -> Result<String, RelayError> {
        EvmClient::withdraw(self, htlc_id, secret).await
    }

    async fn refund(&self, htlc_id: &str) -> Result<String, RelayError> {
        EvmClient::refund(self, htlc_id).await
    }

    async fn active_htlcs(&self) -> Result<Vec<HtlcState>, RelayError> {
        EvmClient::active_htlcs(self).await
    }
}
