//! Chain clients and event monitors for both sides of the relayer: the
//! account-based EVM chain and the message-passing IBC chain.

pub mod cosmos;
pub mod evm;

pub use cosmos::{
    CosmosClient, CosmosHtlc, CosmosMonitor, CosmosMonitorHealth, IbcTransferRequest, SentPacket,
    SubmittedTransfer,
};
pub use evm::{EvmClient, EvmMonitor, EvmMonitorHealth, HtlcState};
