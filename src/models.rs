use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::auth_state::AuthMode;
use crate::errors::{TermError, TermResult};
use crate::manager::CreateSessionOptions;
use crate::session::SessionInfo;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    /// Caller-generated UUIDv7; required.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub cols: Option<u32>,
    #[serde(default)]
    pub rows: Option<u32>,
    #[serde(default)]
    pub auth_mode: Option<AuthMode>,
    #[serde(default)]
    pub user_token: Option<String>,
    #[serde(default)]
    pub delegated_host: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
}

impl CreateSessionRequest {
    /// A missing id is reported like a malformed one.
    pub fn into_options(self) -> TermResult<CreateSessionOptions> {
        let id = self
            .id
            .ok_or_else(|| TermError::InvalidIdentifier(String::new()))?;
        Ok(CreateSessionOptions {
            id,
            cwd: self.cwd,
            cols: self.cols,
            rows: self.rows,
            auth_mode: self.auth_mode,
            user_token: self.user_token,
            delegated_host: self.delegated_host,
            extra_env: self.env,
            agent: self.agent,
            model: self.model,
            actor: self.actor,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputRequest {
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputResponse {
    pub status: &'static str,
    pub bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResizeRequest {
    pub cols: u32,
    pub rows: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthModeRequest {
    pub mode: AuthMode,
    #[serde(default)]
    pub user_token: Option<String>,
    #[serde(default)]
    pub delegated_host: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminatedResponse {
    pub status: &'static str,
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Query parameters of a streaming connection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub cols: Option<u32>,
    #[serde(default)]
    pub rows: Option<u32>,
}
