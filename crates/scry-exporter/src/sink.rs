use crate::otlp::LogsPayload;
use crate::ExportError;
use scry_core::HookEvent;
use std::time::Duration;

/// Posts OTLP log batches to a collector's `/v1/logs` endpoint.
#[derive(Debug, Clone)]
pub struct CollectorClient {
    client: reqwest::Client,
    endpoint: String,
}

impl CollectorClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ExportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn send(&self, payload: &LogsPayload) -> Result<(), ExportError> {
        self.client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Forwards events to a running ingestion gateway instead of the collector.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    endpoint: String,
}

impl GatewayClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ExportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub async fn forward(&self, event: &HookEvent) -> Result<(), ExportError> {
        self.client
            .post(&self.endpoint)
            .json(&event.to_wire())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
