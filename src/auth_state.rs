//! Per-session credential mode and its on-disk form.
//!
//! Shell hooks running inside a session read the auth-state file to learn
//! which credentials are currently active, so the file must always be a
//! complete document: writes go to a sibling temp file which is then renamed
//! over the target.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CredentialEnvNames;
use crate::errors::{TermError, TermResult};
use crate::session_id::SessionId;

const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthMode {
    /// Machine-to-machine credentials taken from the server environment.
    #[default]
    #[serde(rename = "m2m")]
    M2m,
    /// A user-delegated token against a delegated host.
    #[serde(rename = "user")]
    User,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::M2m => "m2m",
            AuthMode::User => "user",
        }
    }
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "m2m" => Ok(AuthMode::M2m),
            "user" => Ok(AuthMode::User),
            other => Err(format!("unknown auth mode '{other}'")),
        }
    }
}

/// Machine credentials as they were in the ambient environment when the
/// session was created. Never re-read afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginalCredentials {
    pub host: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl OriginalCredentials {
    pub fn capture(env: &BTreeMap<String, String>, names: &CredentialEnvNames) -> Self {
        let read = |key: &str| env.get(key).filter(|v| !v.is_empty()).cloned();
        Self {
            host: read(&names.host),
            client_id: read(&names.client_id),
            client_secret: read(&names.client_secret),
        }
    }
}

/// Credentials exposed to the shell for the committed mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveCredentials {
    pub host: Option<String>,
    pub token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    pub mode: AuthMode,
    /// Cached across mode switches so returning to user mode needs no resubmission.
    pub user_token: Option<String>,
    pub delegated_host: Option<String>,
    pub original: OriginalCredentials,
}

impl AuthState {
    /// Initial state at session creation.
    pub fn initial(
        mode: AuthMode,
        user_token: Option<String>,
        delegated_host: Option<String>,
        original: OriginalCredentials,
    ) -> TermResult<Self> {
        let blank = Self {
            mode: AuthMode::M2m,
            user_token: None,
            delegated_host: None,
            original,
        };
        blank.switch(mode, user_token, delegated_host)
    }

    /// Compute the state after switching to `mode`. Nothing is committed;
    /// the caller persists the result before swapping it in.
    ///
    /// User mode resolves the token as explicit, then cached, and the host as
    /// explicit, then stored, then the captured original. Machine mode caches
    /// whatever was supplied and restores the captured originals.
    pub fn switch(
        &self,
        mode: AuthMode,
        user_token: Option<String>,
        delegated_host: Option<String>,
    ) -> TermResult<Self> {
        let user_token = non_empty(user_token).or_else(|| self.user_token.clone());
        let delegated_host = non_empty(delegated_host).or_else(|| self.delegated_host.clone());

        match mode {
            AuthMode::User => {
                if user_token.is_none() {
                    return Err(TermError::UserTokenMissing);
                }
                let delegated_host = delegated_host.or_else(|| self.original.host.clone());
                if delegated_host.is_none() {
                    return Err(TermError::DelegatedHostUnavailable);
                }
                Ok(Self {
                    mode,
                    user_token,
                    delegated_host,
                    original: self.original.clone(),
                })
            }
            AuthMode::M2m => Ok(Self {
                mode,
                user_token,
                delegated_host,
                original: self.original.clone(),
            }),
        }
    }

    pub fn active(&self) -> ActiveCredentials {
        match self.mode {
            AuthMode::User => ActiveCredentials {
                host: self.delegated_host.clone(),
                token: self.user_token.clone(),
                client_id: None,
                client_secret: None,
            },
            AuthMode::M2m => ActiveCredentials {
                host: self.original.host.clone(),
                token: None,
                client_id: self.original.client_id.clone(),
                client_secret: self.original.client_secret.clone(),
            },
        }
    }

    /// Environment edits for a freshly spawned shell. `None` values unset the key.
    pub fn env_overlay(
        &self,
        names: &CredentialEnvNames,
        state_file: Option<&Path>,
    ) -> Vec<(String, Option<String>)> {
        let active = self.active();
        let mut overlay = vec![
            (names.host.clone(), active.host),
            (names.user_token.clone(), active.token),
            (names.client_id.clone(), active.client_id),
            (names.client_secret.clone(), active.client_secret),
        ];
        if let Some(path) = state_file {
            overlay.push((
                names.state_file.clone(),
                Some(path.to_string_lossy().into_owned()),
            ));
        }
        overlay
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// The JSON document shell hooks read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStateDocument {
    pub version: u32,
    pub session_id: String,
    pub mode: AuthMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AuthStateDocument {
    pub fn from_state(session_id: &SessionId, state: &AuthState) -> Self {
        let active = state.active();
        Self {
            version: DOCUMENT_VERSION,
            session_id: session_id.to_string(),
            mode: state.mode,
            host: active.host,
            token: active.token,
            client_id: active.client_id,
            client_secret: active.client_secret,
            updated_at: Utc::now(),
        }
    }
}

/// Location of one session's auth-state file.
#[derive(Debug, Clone)]
pub struct AuthStateFile {
    path: PathBuf,
}

impl AuthStateFile {
    pub fn for_session(dir: &Path, session_id: &SessionId) -> Self {
        Self {
            path: dir.join(format!("{session_id}.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the file with the document for `state` (mode 0600).
    pub fn write(&self, session_id: &SessionId, state: &AuthState) -> TermResult<()> {
        let document = AuthStateDocument::from_state(session_id, state);
        let contents = serde_json::to_vec_pretty(&document)
            .map_err(|e| TermError::Internal(format!("encode auth state: {e}")))?;

        if let Some(parent) = self.path.parent() {
            create_private_dir(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut options = fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(&tmp_path)?;
            file.write_all(&contents)?;
            file.sync_all()?;
        }

        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn load(&self) -> TermResult<AuthStateDocument> {
        let contents = fs::read(&self.path)?;
        serde_json::from_slice(&contents)
            .map_err(|e| TermError::Internal(format!("decode auth state: {e}")))
    }

    /// Delete the file; a file that is already gone counts as success.
    pub fn remove(&self) -> TermResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn create_private_dir(dir: &Path) -> TermResult<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}
