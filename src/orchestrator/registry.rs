//! Stage agent discovery.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::debug;

use crate::models::stage::Stage;
use crate::{AppError, GlobalConfig, Result};

/// Path probed by [`HttpAgentRegistry::is_healthy`].
pub const HEALTH_PATH: &str = "/health";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves stages to agent base URLs.
pub trait AgentRegistry: Send + Sync {
    /// Base URL of the agent serving `stage`, if one is registered.
    fn resolve(&self, stage: Stage) -> Option<String>;

    /// Whether the agent serving `stage` reports itself healthy.
    fn is_healthy(&self, stage: Stage) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

/// Registry backed by the `[agents]` configuration table.
pub struct HttpAgentRegistry {
    agents: HashMap<Stage, String>,
    client: reqwest::Client,
}

impl HttpAgentRegistry {
    /// Build from configuration. Stages without an entry stay unresolved.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the HTTP client cannot be built.
    pub fn from_config(config: &GlobalConfig) -> Result<Self> {
        let agents = Stage::ALL
            .iter()
            .filter_map(|stage| {
                config
                    .agent_url(*stage)
                    .map(|url| (*stage, url.trim_end_matches('/').to_owned()))
            })
            .collect();
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|err| AppError::Transport(format!("failed to build http client: {err}")))?;
        Ok(Self { agents, client })
    }
}

impl AgentRegistry for HttpAgentRegistry {
    fn resolve(&self, stage: Stage) -> Option<String> {
        self.agents.get(&stage).cloned()
    }

    fn is_healthy(&self, stage: Stage) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            let Some(base) = self.agents.get(&stage) else {
                return false;
            };
            match self.client.get(format!("{base}{HEALTH_PATH}")).send().await {
                Ok(response) => response.status().is_success(),
                Err(err) => {
                    debug!(%stage, %err, "health probe failed");
                    false
                }
            }
        })
    }
}
