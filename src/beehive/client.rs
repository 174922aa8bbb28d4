//! HTTP client posting measurement batches to Beehive

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

use super::{MeasurementBatch, MeasurementSink};
use crate::config::BeehiveConfig;
use crate::pipeline::PublishError;

pub struct BeehiveClient {
    config: BeehiveConfig,
    http: Client,
}

impl BeehiveClient {
    pub fn new(config: BeehiveConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build reqwest client")?;

        info!("Beehive client created for {}", config.url);

        Ok(Self { config, http })
    }
}

#[async_trait]
impl MeasurementSink for BeehiveClient {
    async fn publish(&self, batch: &MeasurementBatch) -> Result<(), PublishError> {
        debug!("POST {} ({} measurements)", self.config.url, batch.len());

        let resp = self
            .http
            .post(&self.config.url)
            .json(batch)
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PublishError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}
