//! Shared test helpers for pipeline-level integration tests.
//!
//! Provides a scripted in-process [`StageTransport`], a static agent
//! registry, and construction of a fully wired orchestrator over an
//! in-memory database so individual test modules can focus on behaviour.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_relay::config::GlobalConfig;
use fleet_relay::models::stage::Stage;
use fleet_relay::orchestrator::memory::KeywordMemory;
use fleet_relay::orchestrator::pipeline::PipelineOrchestrator;
use fleet_relay::orchestrator::registry::AgentRegistry;
use fleet_relay::orchestrator::session_manager::SessionManager;
use fleet_relay::persistence::archive_repo::ArchiveRepo;
use fleet_relay::persistence::db::{self, Database};
use fleet_relay::persistence::dlq_repo::DeadLetterQueue;
use fleet_relay::resilience::circuit_breaker::CircuitBreakerManager;
use fleet_relay::resilience::recovery::RecoveryProcessor;
use fleet_relay::resilience::retry::{RetryExecutor, RetryPolicy};
use fleet_relay::resilience::transport::{task_url, DispatchError, DispatchFuture, StageTransport};
use serde_json::{json, Value};

type Outcome = Result<Value, DispatchError>;

/// Transport whose per-URL outcomes are scripted by the test.
///
/// Queued outcomes are consumed first; after that the URL's standing
/// outcome (if any) repeats, and unscripted URLs answer `{"status": "ok"}`.
#[derive(Default)]
pub struct ScriptedTransport {
    queued: Mutex<HashMap<String, VecDeque<Outcome>>>,
    standing: Mutex<HashMap<String, Outcome>>,
    sent: Mutex<Vec<(String, Value)>>,
}

impl ScriptedTransport {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue one-shot outcomes for `url`.
    pub fn script(&self, url: &str, outcomes: Vec<Outcome>) {
        self.queued
            .lock()
            .unwrap()
            .entry(url.to_owned())
            .or_default()
            .extend(outcomes);
    }

    /// Set the outcome repeated once the queue for `url` is empty.
    pub fn always(&self, url: &str, outcome: Outcome) {
        self.standing.lock().unwrap().insert(url.to_owned(), outcome);
    }

    /// Number of attempts made against `url`.
    pub fn calls(&self, url: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(sent_to, _)| sent_to == url)
            .count()
    }

    /// Envelopes sent to `url`, in order.
    pub fn sent_to(&self, url: &str) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(sent_to, _)| sent_to == url)
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }

    fn next(&self, url: &str) -> Outcome {
        if let Some(outcome) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front)
        {
            return outcome;
        }
        self.standing
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| Ok(json!({"status": "ok"})))
    }
}

impl StageTransport for ScriptedTransport {
    fn send<'a>(
        &'a self,
        target_url: &'a str,
        envelope: &'a Value,
        _timeout: Duration,
    ) -> DispatchFuture<'a> {
        self.sent
            .lock()
            .unwrap()
            .push((target_url.to_owned(), envelope.clone()));
        let outcome = self.next(target_url);
        Box::pin(async move { outcome })
    }
}

/// Registry resolving each stage to `http://<agent>.test`, minus any
/// stages removed by the test.
pub struct StaticRegistry {
    agents: HashMap<Stage, String>,
}

impl StaticRegistry {
    pub fn all() -> Self {
        Self {
            agents: Stage::ALL
                .iter()
                .map(|stage| (*stage, agent_url(*stage)))
                .collect(),
        }
    }

    pub fn without(stage: Stage) -> Self {
        let mut registry = Self::all();
        registry.agents.remove(&stage);
        registry
    }
}

impl AgentRegistry for StaticRegistry {
    fn resolve(&self, stage: Stage) -> Option<String> {
        self.agents.get(&stage).cloned()
    }

    fn is_healthy(&self, stage: Stage) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let known = self.agents.contains_key(&stage);
        Box::pin(async move { known })
    }
}

pub fn agent_url(stage: Stage) -> String {
    format!("http://{}.test", stage.agent_id())
}

pub fn stage_task(stage: Stage) -> String {
    task_url(&agent_url(stage))
}

/// Configuration with millisecond backoff and no jitter.
pub fn test_config() -> GlobalConfig {
    GlobalConfig::from_toml_str(
        r#"
source_agent = "test_pipeline"

[retry]
max_retries = 2
initial_delay_ms = 1
max_delay_ms = 5
min_delay_ms = 0
jitter = 0.0
timeout_seconds = 1

[circuit_breaker]
failure_threshold = 3
recovery_timeout_ms = 60000

[recovery]
interval_seconds = 1
batch_size = 10
max_recovery_attempts = 3
backoff_base_seconds = 60

[sessions]
timeout_seconds = 3600
scan_interval_seconds = 1

[memory]
min_similarity = 0.1
timeout_ms = 500
"#,
    )
    .expect("valid test config")
}

/// Script healthy responses for every stage.
pub fn healthy_agents(transport: &ScriptedTransport) {
    transport.always(
        &stage_task(Stage::Ingest),
        Ok(json!({"content": "flood reported on river road", "source": "sensor"})),
    );
    transport.always(
        &stage_task(Stage::Verify),
        Ok(json!({"content": "flood reported on river road", "verified": true})),
    );
    transport.always(
        &stage_task(Stage::Summarize),
        Ok(json!({"title": "Flood", "summary": "river road flooding near bridge"})),
    );
    transport.always(
        &stage_task(Stage::Triage),
        Ok(json!({"severity": "HIGH", "priority": 1})),
    );
    transport.always(
        &stage_task(Stage::Dispatch),
        Ok(json!({"incident_id": "inc-42", "recommended_actions": ["close road"]})),
    );
}

/// Fully wired orchestrator and its collaborators.
pub struct Harness {
    pub db: Arc<Database>,
    pub transport: Arc<ScriptedTransport>,
    pub sessions: Arc<SessionManager>,
    pub dlq: DeadLetterQueue,
    pub breakers: Arc<CircuitBreakerManager>,
    pub memory: Arc<KeywordMemory>,
    pub pipeline: Arc<PipelineOrchestrator>,
    pub recovery: Arc<RecoveryProcessor>,
}

pub async fn harness(config: GlobalConfig) -> Harness {
    harness_with_registry(config, StaticRegistry::all()).await
}

pub async fn harness_with_registry(config: GlobalConfig, registry: StaticRegistry) -> Harness {
    let db = Arc::new(db::connect_memory().await.expect("db"));
    let transport = ScriptedTransport::shared();
    let stage_transport: Arc<dyn StageTransport> = transport.clone();
    let dlq = DeadLetterQueue::new(Arc::clone(&db));
    let retry = Arc::new(RetryExecutor::new(
        RetryPolicy::from_config(&config.retry),
        Arc::clone(&stage_transport),
        config.retry.enable_dead_letter_queue.then(|| dlq.clone()),
    ));
    let breakers = Arc::new(CircuitBreakerManager::new(&config.circuit_breaker));
    let sessions = Arc::new(SessionManager::new(
        ArchiveRepo::new(Arc::clone(&db)),
        config.sessions.clone(),
    ));
    let memory = Arc::new(KeywordMemory::new());
    let pipeline = Arc::new(PipelineOrchestrator::new(
        &config,
        Arc::clone(&sessions),
        Arc::new(registry),
        memory.clone(),
        retry,
        Arc::clone(&breakers),
    ));
    let recovery = Arc::new(RecoveryProcessor::new(
        dlq.clone(),
        stage_transport,
        config.recovery.clone(),
    ));

    Harness {
        db,
        transport,
        sessions,
        dlq,
        breakers,
        memory,
        pipeline,
        recovery,
    }
}
