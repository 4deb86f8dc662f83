//! IBC-chain client: height and transaction queries over Tendermint RPC,
//! account/contract queries over REST, and signed submissions (ICS-20
//! transfers and wasm HTLC contract executions).

use anyhow::Context;
use base64::Engine;
use cosmrs::{cosmwasm::MsgExecuteContract, Any};
use ibc_proto::{
    cosmos::base::v1beta1::Coin as ProtoCoin, ibc::applications::transfer::v1::MsgTransfer,
};
use prost::Message;
use relayer_types::{config::CosmosOptions, RelayError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tendermint_rpc::{
    endpoint::tx,
    query::Query,
    Client, HttpClient, Order,
};
use url::Url;

use crate::cosmos::wallet::CosmosWallet;

pub mod monitor;
pub mod wallet;

pub use monitor::{CosmosMonitor, CosmosMonitorHealth};

const MSG_TRANSFER_TYPE_URL: &str = "/ibc.applications.transfer.v1.MsgTransfer";

/// An ICS-20 transfer to submit, memo included.
#[derive(Clone, Debug)]
pub struct IbcTransferRequest {
    pub source_port: String,
    pub source_channel: String,
    pub receiver: String,
    pub amount: String,
    pub denom: String,
    pub memo: String,
    /// Absolute expiry, unix nanoseconds.
    pub timeout_timestamp: u64,
}

/// Identity of the packet a transfer produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentPacket {
    pub source_channel: String,
    pub dest_channel: String,
    pub sequence: u64,
}

#[derive(Clone, Debug)]
pub struct SubmittedTransfer {
    pub tx_hash: String,
    pub packet: Option<SentPacket>,
}

/// An HTLC as reported by the wasm contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CosmosHtlc {
    pub htlc_id: String,
    pub sender: String,
    pub timelock: u64,
    pub withdrawn: bool,
    pub refunded: bool,
}

pub struct CosmosClient {
    rpc: HttpClient,
    rest: reqwest::Client,
    rest_url: Url,
    wallet: CosmosWallet,
    opt: CosmosOptions,
}

impl CosmosClient {
    pub fn new(opt: CosmosOptions) -> anyhow::Result<Self> {
        let rpc = HttpClient::new(opt.rpc_url.as_str()).context("building tendermint client")?;
        let rest = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("building rest client")?;
        let wallet = CosmosWallet::from_mnemonic(&opt.mnemonic, &opt.address_prefix)?;
        tracing::info!(
            chain = %opt.chain_id,
            address = %wallet.address(),
            "cosmos client ready"
        );
        Ok(Self {
            rpc,
            rest,
            rest_url: opt.rest_url.clone(),
            wallet,
            opt,
        })
    }

    pub fn chain_id(&self) -> &str {
        &self.opt.chain_id
    }

    pub fn htlc_contract(&self) -> &str {
        &self.opt.htlc_contract
    }

    pub fn denom(&self) -> &str {
        &self.opt.denom
    }

    pub fn relayer_address(&self) -> String {
        self.wallet.address()
    }

    pub async fn latest_height(&self) -> Result<u64, RelayError> {
        let status = self
            .rpc
            .status()
            .await
            .map_err(|err| RelayError::TransientNetwork(format!("status: {err}")))?;
        Ok(status.sync_info.latest_block_height.value())
    }

    /// All transactions in one block, in index order.
    pub async fn txs_at_height(&self, height: u64) -> Result<Vec<tx::Response>, RelayError> {
        let query = Query::eq("tx.height", height);
        let response = self
            .rpc
            .tx_search(query, false, 1, 100, Order::Ascending)
            .await
            .map_err(|err| RelayError::TransientNetwork(format!("tx_search: {err}")))?;
        Ok(response.txs)
    }

    /// Account number and sequence from the auth module.
    async fn account_info(&self) -> Result<(u64, u64), RelayError> {
        let url = self
            .rest_url
            .join(&format!(
                "cosmos/auth/v1beta1/accounts/{}",
                self.wallet.address()
            ))
            .map_err(|err| RelayError::Config(format!("bad rest url: {err}")))?;
        let body: serde_json::Value = self
            .rest
            .get(url)
            .send()
            .await
            .map_err(|err| RelayError::TransientNetwork(format!("account query: {err}")))?
            .error_for_status()
            .map_err(|err| RelayError::TransientNetwork(format!("account query: {err}")))?
            .json()
            .await
            .map_err(|err| RelayError::TransientNetwork(format!("account decode: {err}")))?;
        let account = &body["account"];
        let number = account["account_number"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RelayError::Chain("account has no account_number".into()))?;
        let sequence = account["sequence"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Ok((number, sequence))
    }

    /// Sign and broadcast, waiting for inclusion. Returns the tx hash and
    /// the events the transaction emitted.
    async fn broadcast(
        &self,
        msgs: Vec<Any>,
        memo: &str,
    ) -> Result<(String, Vec<tendermint::abci::Event>), RelayError> {
        let (account_number, sequence) = self.account_info().await?;
        let fee = CosmosWallet::fee(self.opt.gas_limit, self.opt.gas_price, &self.opt.denom)
            .map_err(|err| RelayError::Config(err.to_string()))?;
        let bytes = self
            .wallet
            .sign_tx(
                msgs,
                fee,
                &self.opt.chain_id,
                account_number,
                sequence,
                memo,
            )
            .map_err(|err| RelayError::Chain(format!("signing: {err}")))?;

        let response = self
            .rpc
            .broadcast_tx_commit(bytes)
            .await
            .map_err(|err| RelayError::TransientNetwork(format!("broadcast: {err}")))?;
        let hash = response.hash.to_string();
        if response.check_tx.code.is_err() {
            return Err(RelayError::Chain(format!(
                "tx {hash} rejected in check: {}",
                response.check_tx.log
            )));
        }
        if response.tx_result.code.is_err() {
            return Err(RelayError::Chain(format!(
                "tx {hash} failed: {}",
                response.tx_result.log
            )));
        }
        Ok((hash, response.tx_result.events))
    }

    /// Submit an ICS-20 transfer carrying the given memo and return the
    /// emitted packet identity for ack tracking.
    pub async fn submit_transfer(
        &self,
        request: &IbcTransferRequest,
    ) -> Result<SubmittedTransfer, RelayError> {
        let msg = MsgTransfer {
            source_port: request.source_port.clone(),
            source_channel: request.source_channel.clone(),
            token: Some(ProtoCoin {
                denom: request.denom.clone(),
                amount: request.amount.clone(),
            }),
            sender: self.wallet.address(),
            receiver: request.receiver.clone(),
            timeout_height: None,
            timeout_timestamp: request.timeout_timestamp,
            memo: request.memo.clone(),
        };
        let any = Any {
            type_url: MSG_TRANSFER_TYPE_URL.to_string(),
            value: msg.encode_to_vec(),
        };
        let (tx_hash, events) = self.broadcast(vec![any], "").await?;
        let packet = extract_sent_packet(&events);
        if packet.is_none() {
            tracing::warn!(%tx_hash, "transfer accepted but no send_packet event found");
        }
        Ok(SubmittedTransfer { tx_hash, packet })
    }

    /// Execute a message on the HTLC contract.
    pub async fn execute_contract(
        &self,
        msg: &serde_json::Value,
        funds: Vec<(String, String)>,
    ) -> Result<String, RelayError> {
        let contract = self
            .opt
            .htlc_contract
            .parse()
            .map_err(|err| RelayError::Config(format!("bad contract address: {err}")))?;
        let funds = funds
            .into_iter()
            .map(|(amount, denom)| {
                Ok(cosmrs::Coin {
                    denom: denom.parse().map_err(|err| {
                        RelayError::Validation(format!("invalid denom {denom:?}: {err}"))
                    })?,
                    amount: amount.parse().map_err(|_| {
                        RelayError::Validation(format!("invalid amount {amount:?}"))
                    })?,
                })
            })
            .collect::<Result<Vec<_>, RelayError>>()?;
        let execute = MsgExecuteContract {
            sender: self.wallet.account_id().clone(),
            contract,
            msg: serde_json::to_vec(msg)
                .map_err(|err| RelayError::Validation(format!("encoding msg: {err}")))?,
            funds,
        };
        let any = execute
            .to_any()
            .map_err(|err| RelayError::Chain(format!("encoding execute: {err}")))?;
        let (tx_hash, _) = self.broadcast(vec![any], "").await?;
        Ok(tx_hash)
    }

    /// Mirror an HTLC on the local wasm contract.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_htlc(
        &self,
        htlc_id: &str,
        receiver: &str,
        amount: &str,
        denom: &str,
        hashlock: &str,
        timelock: u64,
        source_chain: &str,
        source_htlc_id: &str,
    ) -> Result<String, RelayError> {
        let msg = json!({
            "create_htlc": {
                "id": htlc_id,
                "receiver": receiver,
                "hashlock": hashlock,
                "timelock": timelock,
                "source_chain": source_chain,
                "source_htlc_id": source_htlc_id,
            }
        });
        self.execute_contract(&msg, vec![(amount.to_string(), denom.to_string())])
            .await
    }

    pub async fn withdraw(&self, htlc_id: &str, secret: &str) -> Result<String, RelayError> {
        let msg = json!({ "withdraw": { "id": htlc_id, "secret": secret } });
        self.execute_contract(&msg, vec![]).await
    }

    pub async fn refund(&self, htlc_id: &str) -> Result<String, RelayError> {
        let msg = json!({ "refund": { "id": htlc_id } });
        self.execute_contract(&msg, vec![]).await
    }

    /// HTLCs created by `sender` that are still live on the contract.
    pub async fn htlcs_by_sender(&self, sender: &str) -> Result<Vec<CosmosHtlc>, RelayError> {
        let query = json!({ "list_htlcs": { "sender": sender } });
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&query).expect("static query serializes"));
        let url = self
            .rest_url
            .join(&format!(
                "cosmwasm/wasm/v1/contract/{}/smart/{encoded}",
                self.opt.htlc_contract
            ))
            .map_err(|err| RelayError::Config(format!("bad rest url: {err}")))?;
        let body: serde_json::Value = self
            .rest
            .get(url)
            .send()
            .await
            .map_err(|err| RelayError::TransientNetwork(format!("contract query: {err}")))?
            .error_for_status()
            .map_err(|err| RelayError::TransientNetwork(format!("contract query: {err}")))?
            .json()
            .await
            .map_err(|err| RelayError::TransientNetwork(format!("contract decode: {err}")))?;
        serde_json::from_value(body["data"]["htlcs"].clone())
            .map_err(|err| RelayError::Chain(format!("unexpected contract response: {err}")))
    }
}

/// Pull the packet identity out of a transfer's `send_packet` event.
fn extract_sent_packet(events: &[tendermint::abci::Event]) -> Option<SentPacket> {
    for event in events {
        if event.kind != "send_packet" {
            continue;
        }
        let mut source_channel = None;
        let mut dest_channel = None;
        let mut sequence = None;
        for attr in &event.attributes {
            let (Ok(key), Ok(value)) = (attr.key_str(), attr.value_str()) else {
                continue;
            };
            match key {
                "packet_src_channel" => source_channel = Some(value.to_string()),
                "packet_dst_channel" => dest_channel = Some(value.to_string()),
                "packet_sequence" => sequence = value.parse().ok(),
                _ => {},
            }
        }
        if let (Some(source_channel), Some(dest_channel), Some(sequence)) =
            (source_channel, dest_channel, sequence)
        {
            return Some(SentPacket {
                source_channel,
                dest_channel,
                sequence,
            });
        }
    }
    None
}
