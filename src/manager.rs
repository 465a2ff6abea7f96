//! Session manager: owns every live session and is the only way to create,
//! mutate or destroy one.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::auth_state::{AuthMode, AuthState, AuthStateFile, OriginalCredentials};
use crate::config::ManagerConfig;
use crate::errors::{TermError, TermResult};
use crate::pty::{ExitInfo, PtyEvent, PtySpawner, SpawnRequest};
use crate::services::{ServiceRegistry, SessionEnvRequest};
use crate::session::{ClientHandlers, DetachHandle, Session, SessionInfo, SessionParts};
use crate::session_id::SessionId;

/// Arguments to [`SessionManager::create_session`]. Only `id` is required.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    pub id: String,
    pub cwd: Option<String>,
    pub cols: Option<u32>,
    pub rows: Option<u32>,
    pub auth_mode: Option<AuthMode>,
    pub user_token: Option<String>,
    pub delegated_host: Option<String>,
    /// Per-call overrides layered over the base and enrichment environment.
    pub extra_env: BTreeMap<String, String>,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub actor: Option<String>,
}

impl CreateSessionOptions {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub attached_clients: usize,
}

#[derive(Default)]
struct Registry {
    active: HashMap<SessionId, Arc<Session>>,
    /// Ids whose creation is in flight; they count against capacity.
    reserved: HashSet<SessionId>,
}

/// Holds an id slot while a create is in flight. Dropping it without
/// committing (failure, or the create future being cancelled) frees the slot.
struct Reservation<'a> {
    manager: &'a SessionManager,
    id: SessionId,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, session: Arc<Session>) {
        let mut registry = self.manager.registry.lock();
        registry.reserved.remove(&self.id);
        registry.active.insert(self.id.clone(), session);
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.manager.registry.lock().reserved.remove(&self.id);
        }
    }
}

pub struct SessionManager {
    config: ManagerConfig,
    spawner: Arc<dyn PtySpawner>,
    services: Arc<ServiceRegistry>,
    registry: Mutex<Registry>,
}

impl SessionManager {
    pub fn new(
        config: ManagerConfig,
        spawner: Arc<dyn PtySpawner>,
        services: Arc<ServiceRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            spawner,
            services,
            registry: Mutex::new(Registry::default()),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub async fn create_session(
        self: &Arc<Self>,
        options: CreateSessionOptions,
    ) -> TermResult<SessionInfo> {
        let id = SessionId::parse(&options.id)?;
        let reservation = self.reserve(&id)?;
        let (session, events) = self.build_session(&id, options).await?;
        reservation.commit(session.clone());
        // Started only after insertion so an early exit finds the entry to remove.
        self.spawn_event_pump(session.clone(), events);

        let info = session.info();
        info!(
            "[manager:{}] created (cwd: {}, {}x{}, auth: {})",
            id,
            info.cwd,
            info.cols,
            info.rows,
            info.auth_mode.as_str()
        );
        Ok(info)
    }

    /// Return the session if it is live, otherwise create it with defaults.
    pub async fn ensure_session(
        self: &Arc<Self>,
        id: &str,
        cols: Option<u32>,
        rows: Option<u32>,
    ) -> TermResult<SessionInfo> {
        match self.get_session(id) {
            Ok(info) => return Ok(info),
            Err(TermError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let mut options = CreateSessionOptions::new(id);
        options.cols = cols;
        options.rows = rows;
        match self.create_session(options).await {
            Err(TermError::AlreadyExists(_)) => self.get_session(id),
            other => other,
        }
    }

    pub fn attach_session(&self, id: &str, handlers: ClientHandlers) -> TermResult<DetachHandle> {
        self.lookup(id)?.attach(handlers)
    }

    pub fn write_input(&self, id: &str, data: &str) -> TermResult<()> {
        let session = self.lookup(id)?;
        if data.len() > self.config.max_input_bytes {
            return Err(TermError::InputTooLarge {
                limit: self.config.max_input_bytes,
                actual: data.len(),
            });
        }
        session.write(data.as_bytes())
    }

    pub fn resize_session(&self, id: &str, cols: u32, rows: u32) -> TermResult<SessionInfo> {
        let session = self.lookup(id)?;
        let (cols, rows) = self.config.geometry.resolve(Some(cols), Some(rows));
        session.resize(cols, rows)?;
        debug!("[manager:{}] resized to {}x{}", id, cols, rows);
        Ok(session.info())
    }

    pub async fn set_session_auth_mode(
        &self,
        id: &str,
        mode: AuthMode,
        user_token: Option<String>,
        delegated_host: Option<String>,
    ) -> TermResult<SessionInfo> {
        let session = self.lookup(id)?;
        session
            .set_auth_mode(mode, user_token, delegated_host)
            .await?;
        Ok(session.info())
    }

    /// Forcefully terminate a session and tear it down immediately. Racing a
    /// natural exit is harmless: only the first teardown notifies clients.
    pub fn kill_session(&self, id: &str) -> TermResult<()> {
        let session = self.lookup(id)?;
        session.kill();
        self.teardown(&session, &ExitInfo::killed());
        Ok(())
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.snapshot().iter().map(|session| session.info()).collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    pub fn get_session(&self, id: &str) -> TermResult<SessionInfo> {
        Ok(self.lookup(id)?.info())
    }

    pub fn get_stats(&self) -> SessionStats {
        let sessions = self.snapshot();
        SessionStats {
            active_sessions: sessions.len(),
            attached_clients: sessions.iter().map(|s| s.client_count()).sum(),
        }
    }

    pub fn shutdown(&self) {
        let sessions = self.snapshot();
        if !sessions.is_empty() {
            info!("[manager] shutting down {} session(s)", sessions.len());
        }
        for session in sessions {
            match self.kill_session(session.id().as_str()) {
                Ok(()) | Err(TermError::NotFound(_)) => {}
                Err(e) => warn!("[manager:{}] shutdown kill failed: {}", session.id(), e),
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.registry.lock().active.values().cloned().collect()
    }

    fn lookup(&self, id: &str) -> TermResult<Arc<Session>> {
        let id = SessionId::parse(id)?;
        let session = self
            .registry
            .lock()
            .active
            .get(&id)
            .cloned()
            .ok_or_else(|| TermError::NotFound(id.to_string()))?;
        if session.is_closed() {
            return Err(TermError::NotFound(id.to_string()));
        }
        Ok(session)
    }

    fn reserve(&self, id: &SessionId) -> TermResult<Reservation<'_>> {
        let mut registry = self.registry.lock();
        if registry.active.contains_key(id) || registry.reserved.contains(id) {
            return Err(TermError::AlreadyExists(id.to_string()));
        }
        if registry.active.len() + registry.reserved.len() >= self.config.max_sessions {
            return Err(TermError::CapacityExceeded {
                limit: self.config.max_sessions,
            });
        }
        registry.reserved.insert(id.clone());
        Ok(Reservation {
            manager: self,
            id: id.clone(),
            committed: false,
        })
    }

    async fn build_session(
        &self,
        id: &SessionId,
        options: CreateSessionOptions,
    ) -> TermResult<(Arc<Session>, mpsc::UnboundedReceiver<PtyEvent>)> {
        let cwd = options
            .cwd
            .filter(|cwd| !cwd.is_empty())
            .unwrap_or_else(|| self.config.default_cwd.clone());
        let (cols, rows) = self.config.geometry.resolve(options.cols, options.rows);

        let mut env: BTreeMap<String, String> = if self.config.inherit_env {
            std::env::vars().collect()
        } else {
            BTreeMap::new()
        };
        env.extend(self.config.base_env.clone());
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        env.insert("COLORTERM".to_string(), "truecolor".to_string());

        let names = &self.config.credential_env;
        let original = OriginalCredentials::capture(&env, names);
        let auth = AuthState::initial(
            options.auth_mode.unwrap_or_default(),
            options.user_token,
            options.delegated_host,
            original,
        )?;

        let enrichment = self
            .services
            .build_session_env(&SessionEnvRequest {
                session_id: id.clone(),
                actor: options.actor,
                cwd: cwd.clone(),
                agent: options.agent.clone(),
                model: options.model.clone(),
            })
            .await;
        env.extend(enrichment.env);
        let env_warnings = enrichment.warnings;
        env.extend(options.extra_env);

        let auth_file = match &self.config.auth_state_dir {
            Some(dir) => {
                let file = AuthStateFile::for_session(dir, id);
                file.write(id, &auth)?;
                Some(file)
            }
            None => None,
        };
        for (key, value) in auth.env_overlay(names, auth_file.as_ref().map(|f| f.path())) {
            match value {
                Some(value) => env.insert(key, value),
                None => env.remove(&key),
            };
        }

        let spawned = match self.spawner.spawn(SpawnRequest {
            label: id.to_string(),
            program: self.config.shell.clone(),
            args: self.config.shell_args.clone(),
            cwd: cwd.clone(),
            cols,
            rows,
            env,
        }) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("[manager:{}] spawn failed: {:#}", id, e);
                if let Some(file) = &auth_file {
                    if let Err(e) = file.remove() {
                        warn!("[manager:{}] auth state rollback failed: {}", id, e);
                    }
                }
                return Err(TermError::SpawnFailed(format!("{e:#}")));
            }
        };

        let session = Arc::new(Session::new(SessionParts {
            id: id.clone(),
            cwd,
            cols,
            rows,
            agent: options.agent,
            model: options.model,
            history_limit: self.config.history_limit,
            auth,
            auth_file,
            env_warnings,
            process: spawned.process,
        }));
        Ok((session, spawned.events))
    }

    /// Drive one session's PTY events. The task holds only a weak reference
    /// to the manager so a dropped manager does not leak through its sessions.
    fn spawn_event_pump(
        self: &Arc<Self>,
        session: Arc<Session>,
        mut events: mpsc::UnboundedReceiver<PtyEvent>,
    ) {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let exit = loop {
                match events.recv().await {
                    Some(PtyEvent::Data(data)) => session.handle_output(&data),
                    Some(PtyEvent::Exit(exit)) => break exit,
                    None => {
                        break ExitInfo {
                            exit_code: None,
                            signal: None,
                        }
                    }
                }
            };

            match manager.upgrade() {
                Some(manager) => manager.teardown(&session, &exit),
                None => {
                    session.finish(&exit);
                    session.remove_auth_file();
                }
            }
        });
    }

    /// Notify clients, drop the session from the map and release its auth
    /// file. Only the first caller for a given session does anything.
    fn teardown(&self, session: &Arc<Session>, exit: &ExitInfo) {
        if !session.finish(exit) {
            return;
        }
        {
            let mut registry = self.registry.lock();
            if registry
                .active
                .get(session.id())
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                registry.active.remove(session.id());
            }
        }
        session.remove_auth_file();
        info!(
            "[manager:{}] ended (exit_code: {:?}, signal: {:?})",
            session.id(),
            exit.exit_code,
            exit.signal
        );
    }
}
