//! Pluggable runtime services.
//!
//! Services are registered once at startup. Their hooks run on the request
//! path (environment enrichment during session creation, health probes), so
//! every call is bounded by the registry's timeout and a failing or hanging
//! service only ever costs its own contribution.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ServicesConfig;
use crate::session_id::SessionId;

#[derive(Debug, Clone)]
pub struct SessionEnvRequest {
    pub session_id: SessionId,
    pub actor: Option<String>,
    pub cwd: String,
    pub agent: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionEnv {
    pub env: BTreeMap<String, String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[async_trait]
pub trait RuntimeService: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn health(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn readiness(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Extra environment for a session about to be spawned.
    async fn enrich_env(
        &self,
        _request: &SessionEnvRequest,
    ) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
}

pub struct ServiceRegistry {
    services: Vec<Arc<dyn RuntimeService>>,
    hook_timeout: Duration,
}

impl ServiceRegistry {
    pub fn new(config: ServicesConfig) -> Self {
        Self {
            services: Vec::new(),
            hook_timeout: config.hook_timeout,
        }
    }

    pub fn with_service(mut self, service: impl RuntimeService) -> Self {
        self.register(Arc::new(service));
        self
    }

    pub fn register(&mut self, service: Arc<dyn RuntimeService>) {
        info!("[services] registered {}", service.name());
        self.services.push(service);
    }

    pub fn names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name().to_string()).collect()
    }

    pub async fn start_all(&self) {
        for service in &self.services {
            if let Err(message) = self.call(service.name(), "start", service.start()).await {
                warn!("[services] {}", message);
            }
        }
    }

    /// Stops services in reverse registration order.
    pub async fn stop_all(&self) {
        for service in self.services.iter().rev() {
            if let Err(message) = self.call(service.name(), "stop", service.stop()).await {
                warn!("[services] {}", message);
            }
        }
    }

    /// Collect environment from every service concurrently. A service that
    /// errors or overruns the timeout contributes nothing and leaves a
    /// warning; later registrations win on key conflicts.
    pub async fn build_session_env(&self, request: &SessionEnvRequest) -> SessionEnv {
        let results = join_all(
            self.services
                .iter()
                .map(|service| self.call(service.name(), "enrich_env", service.enrich_env(request))),
        )
        .await;

        let mut out = SessionEnv::default();
        for result in results {
            match result {
                Ok(env) => out.env.extend(env),
                Err(message) => {
                    warn!("[services] session {}: {}", request.session_id, message);
                    out.warnings.push(message);
                }
            }
        }
        out
    }

    pub async fn health(&self) -> Vec<ServiceStatus> {
        join_all(self.services.iter().map(|service| async move {
            status_of(
                service.name(),
                self.call(service.name(), "health", service.health()).await,
            )
        }))
        .await
    }

    pub async fn readiness(&self) -> Vec<ServiceStatus> {
        join_all(self.services.iter().map(|service| async move {
            status_of(
                service.name(),
                self.call(service.name(), "readiness", service.readiness()).await,
            )
        }))
        .await
    }

    async fn call<T>(
        &self,
        name: &str,
        hook: &str,
        fut: impl std::future::Future<Output = anyhow::Result<T>>,
    ) -> Result<T, String> {
        match tokio::time::timeout(self.hook_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{name}.{hook} failed: {e:#}")),
            Err(_) => Err(format!(
                "{name}.{hook} timed out after {}ms",
                self.hook_timeout.as_millis()
            )),
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(ServicesConfig::default())
    }
}

fn status_of(name: &str, result: Result<(), String>) -> ServiceStatus {
    ServiceStatus {
        name: name.to_string(),
        healthy: result.is_ok(),
        detail: result.err(),
    }
}

/// Exposes the session's identity to the shell.
#[derive(Debug, Default)]
pub struct SessionIdentityService;

#[async_trait]
impl RuntimeService for SessionIdentityService {
    fn name(&self) -> &str {
        "session-identity"
    }

    async fn enrich_env(
        &self,
        request: &SessionEnvRequest,
    ) -> anyhow::Result<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        env.insert("TERMD_SESSION_ID".to_string(), request.session_id.to_string());
        env.insert("TERMD_CWD".to_string(), request.cwd.clone());
        if let Some(actor) = &request.actor {
            env.insert("TERMD_ACTOR".to_string(), actor.clone());
        }
        if let Some(agent) = &request.agent {
            env.insert("TERMD_AGENT_TYPE".to_string(), agent.clone());
        }
        if let Some(model) = &request.model {
            env.insert("TERMD_MODEL".to_string(), model.clone());
        }
        Ok(env)
    }
}

/// Fixed variables added to every session.
#[derive(Debug, Default)]
pub struct StaticEnvService {
    env: BTreeMap<String, String>,
}

impl StaticEnvService {
    pub fn new(env: BTreeMap<String, String>) -> Self {
        Self { env }
    }

    /// Parse `KEY=VALUE` pairs.
    pub fn parse_pairs<I, S>(pairs: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut env = BTreeMap::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let Some((key, value)) = pair.split_once('=') else {
                anyhow::bail!("expected KEY=VALUE, got '{pair}'");
            };
            if key.is_empty() {
                anyhow::bail!("empty variable name in '{pair}'");
            }
            env.insert(key.to_string(), value.to_string());
        }
        Ok(Self { env })
    }
}

#[async_trait]
impl RuntimeService for StaticEnvService {
    fn name(&self) -> &str {
        "static-env"
    }

    async fn enrich_env(
        &self,
        _request: &SessionEnvRequest,
    ) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(self.env.clone())
    }
}
