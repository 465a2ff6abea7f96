//! Runtime configuration for the session manager and streaming gateway.
//!
//! The binary fills these from clap options; tests build them directly.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Inclusive `[min, max]` range for one terminal dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub min: u16,
    pub max: u16,
}

impl Bounds {
    pub const fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    /// Accepts wider-than-`u16` input so oversized requests clamp instead of failing to parse.
    pub fn clamp(&self, value: u32) -> u16 {
        let max = self.max.max(self.min);
        value.clamp(u32::from(self.min), u32::from(max)) as u16
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryConfig {
    pub cols: Bounds,
    pub rows: Bounds,
    pub default_cols: u16,
    pub default_rows: u16,
}

impl GeometryConfig {
    /// Apply defaults to missing dimensions, then clamp each independently.
    pub fn resolve(&self, cols: Option<u32>, rows: Option<u32>) -> (u16, u16) {
        (
            self.cols.clamp(cols.unwrap_or(u32::from(self.default_cols))),
            self.rows.clamp(rows.unwrap_or(u32::from(self.default_rows))),
        )
    }
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            cols: Bounds::new(20, 500),
            rows: Bounds::new(5, 200),
            default_cols: 80,
            default_rows: 24,
        }
    }
}

/// Names of the credential variables exposed to session shells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialEnvNames {
    pub host: String,
    pub client_id: String,
    pub client_secret: String,
    pub user_token: String,
    /// Points in-shell hooks at the session's auth-state file.
    pub state_file: String,
}

impl Default for CredentialEnvNames {
    fn default() -> Self {
        Self {
            host: "DATABRICKS_HOST".to_string(),
            client_id: "DATABRICKS_CLIENT_ID".to_string(),
            client_secret: "DATABRICKS_CLIENT_SECRET".to_string(),
            user_token: "DATABRICKS_TOKEN".to_string(),
            state_file: "TERMD_AUTH_STATE_FILE".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub shell: String,
    pub shell_args: Vec<String>,
    pub default_cwd: String,
    pub max_sessions: usize,
    /// History ceiling, in characters.
    pub history_limit: usize,
    /// Ceiling for a single write, in UTF-8 bytes.
    pub max_input_bytes: usize,
    pub geometry: GeometryConfig,
    pub credential_env: CredentialEnvNames,
    /// Directory for per-session auth-state files; `None` disables persistence.
    pub auth_state_dir: Option<PathBuf>,
    /// Inherit the server's own environment into session shells.
    pub inherit_env: bool,
    /// Layered over the inherited environment.
    pub base_env: BTreeMap<String, String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string()),
            shell_args: Vec::new(),
            default_cwd: std::env::var("HOME").unwrap_or_else(|_| "/".to_string()),
            max_sessions: 32,
            history_limit: 100_000,
            max_input_bytes: 65_536,
            geometry: GeometryConfig::default(),
            credential_env: CredentialEnvNames::default(),
            auth_state_dir: Some(std::env::temp_dir().join("cmux-termd-auth")),
            inherit_env: true,
            base_env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Queued-but-unsent bytes tolerated per connection before it is shed.
    pub max_buffered_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_buffered_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServicesConfig {
    /// Upper bound for each runtime-service hook call.
    pub hook_timeout: Duration,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            hook_timeout: Duration::from_millis(2_000),
        }
    }
}
