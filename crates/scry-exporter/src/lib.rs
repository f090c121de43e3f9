//! Hook-side telemetry export.
//!
//! Each hook invocation becomes one [`HookEvent`], optionally followed by
//! events synthesized from the transcript (the assistant's turn response, or
//! the tool calls a finished sub-agent made). The batch is appended to the
//! local session log first and then posted once to an OTLP collector. Delivery
//! is best effort: a collector outage is logged and never loses the local copy.

pub mod config;
pub mod hook;
pub mod otlp;
pub mod prompt;
pub mod sink;
pub mod tasks;

pub use config::ExporterConfig;
pub use hook::{build_event, BuildContext};
pub use sink::{CollectorClient, GatewayClient};

use prompt::PromptTracker;
use scry_core::events::{AssistantResponse, Attribution, EventPayload};
use scry_core::session_log::{SessionLog, SessionLogError};
use scry_core::spawn::{CorrelatorError, FsMailbox};
use scry_core::{now_ms, HookEvent, MAIN_AGENT_ID};
use scry_transcript::{extract_turn_response, transcript_tool_use_ids};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Correlator(#[from] CorrelatorError),
    #[error(transparent)]
    Log(#[from] SessionLogError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Outcome of one hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub event_id: String,
    pub session_id: String,
    /// Events written locally, the hook event first.
    pub event_ids: Vec<String>,
    pub delivered: bool,
}

pub struct Exporter {
    config: ExporterConfig,
    log: SessionLog,
    mailbox: FsMailbox,
    prompts: PromptTracker,
    collector: CollectorClient,
}

impl Exporter {
    pub fn new(config: ExporterConfig) -> Result<Self, ExportError> {
        config.paths.ensure_dirs()?;
        let collector =
            CollectorClient::new(config.collector_endpoint.clone(), config.collector_timeout)?;
        Ok(Self {
            log: SessionLog::new(config.paths.sessions_dir.clone()),
            mailbox: FsMailbox::new(
                config.paths.pending_dir.clone(),
                config.paths.resolved_dir.clone(),
            ),
            prompts: PromptTracker::new(config.paths.prompts_dir.clone()),
            collector,
            config,
        })
    }

    pub fn config(&self) -> &ExporterConfig {
        &self.config
    }

    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    /// Build, correlate and prompt-tag the event for one hook invocation.
    pub fn build(&self, event_type: &str, payload: &Value) -> Result<HookEvent, ExportError> {
        let ctx = BuildContext {
            mailbox: &self.mailbox,
            now_ms: now_ms(),
            fallback_session: self.config.fallback_session.as_deref(),
        };
        let mut event = build_event(event_type, payload, &ctx)?;
        self.prompts.tag(&mut event);
        Ok(event)
    }

    /// Events synthesized from the transcript an event points at.
    pub fn follow_ups(&self, event: &HookEvent) -> Vec<HookEvent> {
        let synthesized = match &event.payload {
            EventPayload::AgentStop(body) => body
                .transcript_path
                .as_deref()
                .and_then(|path| extract_turn_response(path))
                .map(|turn| {
                    EventPayload::AssistantResponse(AssistantResponse {
                        agent_id: MAIN_AGENT_ID.to_string(),
                        text: turn.text,
                        tool_names: turn.tool_names,
                        tokens_in: turn.tokens_in,
                        tokens_out: turn.tokens_out,
                        cache_read: turn.cache_read,
                        cache_create: turn.cache_create,
                    })
                }),
            EventPayload::AgentComplete(body) => body
                .agent_transcript_path
                .as_deref()
                .map(|path| transcript_tool_use_ids(path))
                .filter(|ids| !ids.is_empty())
                .map(|tool_use_ids| {
                    EventPayload::Attribution(Attribution {
                        agent_id: body.agent_id.clone(),
                        tool_use_ids,
                    })
                }),
            _ => None,
        };
        synthesized
            .map(|payload| {
                let mut follow = HookEvent::new(event.session_id.clone(), now_ms(), payload);
                follow.cwd = event.cwd.clone();
                follow.prompt_id = event.prompt_id.clone();
                vec![follow]
            })
            .unwrap_or_default()
    }

    /// Append the batch locally, then post it to the collector in one request.
    pub async fn export(&self, event_type: &str, payload: &Value) -> Result<ExportReport, ExportError> {
        let event = self.build(event_type, payload)?;
        let mut batch = vec![event.clone()];
        batch.extend(self.follow_ups(&event));

        for item in &batch {
            self.log.append(item)?;
        }
        debug!(event = "export_appended", session_id = %event.session_id, count = batch.len());

        let records = batch.iter().map(otlp::log_record).collect();
        let body = otlp::logs_payload(records, &self.config.host_name);
        let delivered = match self.collector.send(&body).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    event = "collector_unavailable",
                    endpoint = %self.collector.endpoint(),
                    error = %err
                );
                false
            }
        };
        info!(
            event = "hook_exported",
            event_type = %event.event_type(),
            session_id = %event.session_id,
            delivered
        );
        Ok(ExportReport {
            event_id: event.id.clone(),
            session_id: event.session_id.clone(),
            event_ids: batch.iter().map(|item| item.id.clone()).collect(),
            delivered,
        })
    }

    /// Gateway mode: hand the batch to a running hub, appending locally only
    /// for events the hub did not take.
    pub async fn forward(
        &self,
        gateway: &GatewayClient,
        event_type: &str,
        payload: &Value,
    ) -> Result<ExportReport, ExportError> {
        let event = self.build(event_type, payload)?;
        let mut batch = vec![event.clone()];
        batch.extend(self.follow_ups(&event));

        let mut delivered = true;
        for item in &batch {
            if let Err(err) = gateway.forward(item).await {
                warn!(event = "gateway_unavailable", error = %err);
                self.log.append(item)?;
                delivered = false;
            }
        }
        Ok(ExportReport {
            event_id: event.id.clone(),
            session_id: event.session_id.clone(),
            event_ids: batch.iter().map(|item| item.id.clone()).collect(),
            delivered,
        })
    }
}
