//! HTTP client for the chain registry collaborator.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use relayer_types::{ChainInfo, ChannelInfo, HopFee};
use serde::de::DeserializeOwned;
use url::Url;

/// Where registry data comes from. Production uses [`RegistryClient`]; tests
/// substitute a static source.
#[async_trait]
pub trait RegistrySource: Send + Sync + 'static {
    async fn chains(&self) -> anyhow::Result<Vec<ChainInfo>>;

    async fn channels(&self, chain_id: &str) -> anyhow::Result<Vec<ChannelInfo>>;

    /// Per-hop fee schedule for transfers leaving `chain_id`.
    async fn fees(&self, chain_id: &str) -> anyhow::Result<HopFee>;
}

#[derive(Clone, Debug)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: Url,
}

impl RegistryClient {
    pub fn new(base_url: Url) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building registry http client")?;
        Ok(Self { http, base_url })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let url = self
            .base_url
            .join(path)
            .with_context(|| format!("invalid registry path {path:?}"))?;
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("registry request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("registry returned an error for {url}"))?;
        response
            .json()
            .await
            .with_context(|| format!("decoding registry response from {url}"))
    }
}

#[async_trait]
impl RegistrySource for RegistryClient {
    async fn chains(&self) -> anyhow::Result<Vec<ChainInfo>> {
        self.get_json("chains").await
    }

    async fn channels(&self, chain_id: &str) -> anyhow::Result<Vec<ChannelInfo>> {
        self.get_json(&format!("chains/{chain_id}/channels")).await
    }

    async fn fees(&self, chain_id: &str) -> anyhow::Result<HopFee> {
        self.get_json(&format!("chains/{chain_id}/fees")).await
    }
}
