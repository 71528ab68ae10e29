//! Five-stage incident pipeline.
//!
//! [`PipelineOrchestrator::process_event`] drives one raw event through
//! ingest, verify, summarize, triage and dispatch in strict order. Each
//! stage call goes through the stage agent's circuit breaker, which wraps
//! the whole retrying call. The first stage failure ends the run and marks
//! the session failed; the remaining stages never run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{GlobalConfig, MemoryConfig};
use crate::models::envelope::{Envelope, JsonMap};
use crate::models::failed_event::FailedEvent;
use crate::models::session::SessionEvent;
use crate::models::stage::Stage;
use crate::resilience::circuit_breaker::CircuitBreakerManager;
use crate::resilience::retry::{RetryExecutor, StageRequest};
use crate::resilience::transport::task_url;
use crate::{AppError, Result};

use super::memory::SimilarityStore;
use super::registry::AgentRegistry;
use super::session_manager::SessionManager;

/// Result of one pipeline run, returned to the caller.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PipelineOutcome {
    /// Whether all five stages succeeded.
    pub success: bool,
    /// Session that tracked the run.
    pub session_id: String,
    /// Incident id on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    /// Failure description on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Dispatch stage output on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Pipeline counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct PipelineStats {
    /// Runs started.
    pub events_processed: u64,
    /// Runs that completed all stages.
    pub incidents_created: u64,
    /// Runs that failed.
    pub errors: u64,
    /// Retries performed across stage calls.
    pub retries: u64,
    /// Circuit breaker trips across all stage agents.
    pub circuit_breaker_trips: u64,
}

/// Drives events through the stage agents.
pub struct PipelineOrchestrator {
    sessions: Arc<SessionManager>,
    registry: Arc<dyn AgentRegistry>,
    memory: Arc<dyn SimilarityStore>,
    retry: Arc<RetryExecutor>,
    breakers: Arc<CircuitBreakerManager>,
    source_agent: String,
    stage_timeout: Duration,
    max_retries: u32,
    memory_config: MemoryConfig,
    events_processed: AtomicU64,
    incidents_created: AtomicU64,
    errors: AtomicU64,
    retries: AtomicU64,
}

impl PipelineOrchestrator {
    /// Assemble an orchestrator from its collaborators.
    #[must_use]
    pub fn new(
        config: &GlobalConfig,
        sessions: Arc<SessionManager>,
        registry: Arc<dyn AgentRegistry>,
        memory: Arc<dyn SimilarityStore>,
        retry: Arc<RetryExecutor>,
        breakers: Arc<CircuitBreakerManager>,
    ) -> Self {
        Self {
            sessions,
            registry,
            memory,
            retry,
            breakers,
            source_agent: config.source_agent.clone(),
            stage_timeout: config.retry.timeout(),
            max_retries: config.retry.max_retries,
            memory_config: config.memory.clone(),
            events_processed: AtomicU64::new(0),
            incidents_created: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    /// Session manager shared with the background tasks.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Stage agent registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn AgentRegistry> {
        &self.registry
    }

    /// Circuit breakers guarding stage agents.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    /// Retry executor used for stage calls.
    #[must_use]
    pub fn retry_executor(&self) -> &Arc<RetryExecutor> {
        &self.retry
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            incidents_created: self.incidents_created.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            circuit_breaker_trips: self.breakers.stats().opened,
        }
    }

    /// Run one event through all five stages.
    ///
    /// Never returns an error: stage failures are reported in the outcome
    /// and leave the session marked failed.
    pub async fn process_event(&self, raw_event: Value, source_agent: &str) -> PipelineOutcome {
        self.events_processed.fetch_add(1, Ordering::Relaxed);

        let mut metadata = JsonMap::new();
        metadata.insert("source_agent".into(), Value::String(source_agent.to_owned()));
        metadata.insert(
            "pipeline_start".into(),
            Value::String(Utc::now().to_rfc3339()),
        );
        let session_id = self.sessions.create_session(metadata).await;

        let span = info_span!("process_event", session_id = %session_id, source_agent);
        async {
            match self.run_stages(&session_id, raw_event).await {
                Ok((incident_id, result)) => {
                    if let Err(err) = self.sessions.mark_completed(&session_id, &incident_id).await {
                        warn!(?err, "could not mark session completed");
                    }
                    self.incidents_created.fetch_add(1, Ordering::Relaxed);
                    info!(%incident_id, "event processed");
                    PipelineOutcome {
                        success: true,
                        session_id: session_id.clone(),
                        incident_id: Some(incident_id),
                        error: None,
                        result: Some(Value::Object(result)),
                    }
                }
                Err(err) => {
                    let message = err.to_string();
                    if let Err(mark_err) = self.sessions.mark_failed(&session_id, &message).await {
                        warn!(?mark_err, "could not mark session failed");
                    }
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    error!(%err, "event processing failed");
                    PipelineOutcome {
                        success: false,
                        session_id: session_id.clone(),
                        incident_id: None,
                        error: Some(message),
                        result: None,
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_stages(&self, session_id: &str, raw_event: Value) -> Result<(String, JsonMap)> {
        let mut carried = raw_event;
        let mut brief = JsonMap::new();
        let mut triaged = JsonMap::new();

        for stage in Stage::ALL {
            if stage == Stage::Triage {
                let context = self.memory_context(&brief).await;
                brief.insert("memory_context".into(), context);
                carried = Value::Object(brief.clone());
            }

            let mut data = JsonMap::new();
            data.insert(stage.input_key().into(), carried);
            data.insert("operation".into(), Value::String(stage.operation().into()));

            let output = self.call_stage(stage, session_id, data).await?;
            self.record(session_id, SessionEvent::new(stage.as_str(), Value::Object(output.clone())))
                .await;

            match stage {
                Stage::Summarize => brief.clone_from(&output),
                Stage::Triage => {
                    if let Some(severity) = output.get("severity").and_then(Value::as_str) {
                        if let Err(err) = self
                            .sessions
                            .set_metadata(session_id, "severity", Value::String(severity.to_owned()))
                            .await
                        {
                            warn!(?err, "could not record severity");
                        }
                    }
                    triaged.clone_from(&output);
                }
                Stage::Dispatch => {
                    let incident_id = output
                        .get("incident_id")
                        .or_else(|| triaged.get("incident_id"))
                        .and_then(Value::as_str)
                        .map_or_else(|| Uuid::new_v4().to_string(), str::to_owned);
                    self.remember(&incident_id, &brief, &triaged, &output).await;
                    return Ok((incident_id, output));
                }
                Stage::Ingest | Stage::Verify => {}
            }
            carried = Value::Object(output);
        }

        Err(AppError::Validation("pipeline ended without dispatch".into()))
    }

    fn stage_envelope(&self, stage: Stage, session_id: &str, data: JsonMap) -> Result<Envelope> {
        let source = self.source_agent.as_str();
        match stage {
            Stage::Ingest | Stage::Verify => {
                Envelope::event(source, data, Some(session_id.to_owned()), None)
            }
            Stage::Summarize => Envelope::verified_event(source, data, session_id, None),
            Stage::Triage => Envelope::incident(source, data, session_id, None),
            Stage::Dispatch => Envelope::triage(source, data, session_id, None),
        }
    }

    async fn call_stage(&self, stage: Stage, session_id: &str, data: JsonMap) -> Result<JsonMap> {
        let base_url = self
            .registry
            .resolve(stage)
            .ok_or_else(|| AppError::Transport(format!("no agent registered for {stage}")))?;
        let envelope = self.stage_envelope(stage, session_id, data)?;
        let request = StageRequest {
            target_agent: stage.agent_id().to_owned(),
            target_url: task_url(&base_url),
            envelope: envelope.to_value()?,
            timeout: self.stage_timeout,
            max_retries: self.max_retries,
        };

        let retry = &self.retry;
        let retries = &self.retries;
        let req = &request;
        let outcome = self
            .breakers
            .call(stage.agent_id(), move || async move {
                let response = retry.execute(req).await;
                retries.fetch_add(u64::from(response.attempts.saturating_sub(1)), Ordering::Relaxed);
                response.into_result()
            })
            .await;

        match outcome {
            Ok(body) => Ok(stage_output(body)),
            Err(AppError::CircuitOpen(reason)) => {
                self.dead_letter_rejected(&request, &reason).await;
                Err(AppError::CircuitOpen(format!("{stage}: {reason}")))
            }
            Err(err) => Err(err),
        }
    }

    async fn dead_letter_rejected(&self, request: &StageRequest, reason: &str) {
        let Some(dlq) = self.retry.dead_letter_queue() else {
            return;
        };
        let event = FailedEvent::new(
            request.envelope.clone(),
            request.target_agent.clone(),
            request.target_url.clone(),
            format!("circuit open: {reason}"),
            1,
        )
        .with_metadata("reason", Value::String("circuit_open".into()));
        match dlq.add(&event).await {
            Ok(()) => info!(event_id = %event.event_id, agent = %request.target_agent, "rejected call dead-lettered"),
            Err(err) => error!(?err, "failed to dead-letter rejected call"),
        }
    }

    async fn record(&self, session_id: &str, event: SessionEvent) {
        if let Err(err) = self.sessions.record_event(session_id, event).await {
            warn!(?err, "could not record session event");
        }
    }

    async fn memory_context(&self, brief: &JsonMap) -> Value {
        let empty = json!({ "similar_incidents": [], "query_performed": false });
        let text = incident_text(brief);
        if text.is_empty() {
            return empty;
        }

        let lookup = self.memory.query_similar(
            &text,
            self.memory_config.top_k,
            self.memory_config.min_similarity,
        );
        match tokio::time::timeout(Duration::from_millis(self.memory_config.timeout_ms), lookup)
            .await
        {
            Ok(Ok(similar)) => json!({ "similar_incidents": similar, "query_performed": true }),
            Ok(Err(err)) => {
                warn!(?err, "similarity lookup failed");
                empty
            }
            Err(_) => {
                warn!(timeout_ms = self.memory_config.timeout_ms, "similarity lookup timed out");
                empty
            }
        }
    }

    async fn remember(&self, incident_id: &str, brief: &JsonMap, triaged: &JsonMap, dispatch: &JsonMap) {
        let text = incident_text(brief);
        if text.is_empty() {
            return;
        }
        let mut metadata = JsonMap::new();
        metadata.insert("incident_id".into(), Value::String(incident_id.to_owned()));
        if let Some(severity) = triaged.get("severity") {
            metadata.insert("severity".into(), severity.clone());
        }
        if let Some(actions) = dispatch.get("recommended_actions") {
            metadata.insert("actions".into(), actions.clone());
        }
        match self.memory.store(incident_id, &text, metadata).await {
            Ok(true) => {}
            Ok(false) => warn!(incident_id, "incident not stored in memory"),
            Err(err) => warn!(?err, incident_id, "failed to store incident in memory"),
        }
    }
}

/// Stage data from a response body: the payload data when the agent
/// answered with an envelope, the body itself otherwise.
fn stage_output(body: Value) -> JsonMap {
    let is_envelope = body
        .get("payload")
        .and_then(|payload| payload.get("data"))
        .is_some_and(Value::is_object);
    if is_envelope {
        match Envelope::from_value(body.clone()) {
            Ok(envelope) => return envelope.payload().data().clone(),
            Err(err) => warn!(%err, "response looked like an envelope but did not validate"),
        }
    }
    match body {
        Value::Object(fields) => fields,
        other => {
            let mut wrapped = JsonMap::new();
            wrapped.insert("result".into(), other);
            wrapped
        }
    }
}

/// Text used to match and store incidents.
fn incident_text(brief: &JsonMap) -> String {
    ["summary", "content", "title"]
        .iter()
        .find_map(|key| brief.get(*key).and_then(Value::as_str))
        .map(str::to_owned)
        .unwrap_or_default()
}
