//! Shared types for the HTLC relayer: configuration, the relay data model,
//! memo wire formats, routes and packets, and the error taxonomy.

pub mod config;
pub mod error;
pub mod memo;
pub mod packet;
pub mod relay;
pub mod route;
pub mod traits;

pub use config::{
    CosmosOptions, EvmOptions, GeneralOptions, RecoveryOptions, RegistryOptions, RelayOptions,
    RelayerOptions, RetryOptions,
};
pub use error::{OperationKind, RelayError};
pub use memo::{ForwardInstruction, ForwardMemo, HtlcMemo, MemoBody, TypedMemo};
pub use packet::{packet_key, IbcPacket, PacketEvent, PacketOutcome};
pub use relay::{
    relay_id, HtlcCreated, HtlcEvent, HtlcRefunded, HtlcWithdrawn, PendingRelay, RelayStatus,
    SwapParams,
};
pub use route::{
    ChainInfo, ChainKind, ChannelEnd, ChannelInfo, ChannelState, FeeEstimate, ForwardPlan, HopFee,
    PlannedHop, Route,
};
