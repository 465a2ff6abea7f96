use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::manager::{SessionManager, SessionStats};
use crate::services::{ServiceRegistry, ServiceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub status: HealthStatus,
    pub generated_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub sessions: SessionStats,
    pub max_sessions: usize,
    pub services: Vec<ServiceStatus>,
}

/// Point-in-time view of the server for operators.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    started_at: Instant,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }

    pub async fn collect(
        &self,
        manager: &SessionManager,
        registry: &ServiceRegistry,
    ) -> DiagnosticsReport {
        let services = registry.health().await;
        let status = if services.iter().all(|s| s.healthy) {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        };
        DiagnosticsReport {
            status,
            generated_at: Utc::now(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            sessions: manager.get_stats(),
            max_sessions: manager.config().max_sessions,
            services,
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}
