//! A live session: one PTY process, its output history, auth state, and the
//! clients currently attached to it.
//!
//! All mutable state sits behind one lock. Output fan-out, attach (with its
//! history replay) and auth-mode notification all run while holding it, which
//! is what gives every client an in-order, exactly-once view of the stream.
//! Auth-state file writes happen outside it, on the blocking pool.
//! Client callbacks therefore must not block and must not call back into the
//! session; forwarding into a channel is the intended use.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth_state::{AuthMode, AuthState, AuthStateFile};
use crate::errors::{TermError, TermResult};
use crate::history::History;
use crate::pty::{ExitInfo, PtyProcess};
use crate::session_id::SessionId;

pub type DataCallback = Box<dyn Fn(&str) + Send + Sync>;
pub type ExitCallback = Box<dyn Fn(&ExitInfo) + Send + Sync>;
pub type AuthModeCallback = Box<dyn Fn(AuthMode) + Send + Sync>;

/// Callback slots for one attached client.
pub struct ClientHandlers {
    pub on_data: DataCallback,
    pub on_exit: ExitCallback,
    pub on_auth_mode: Option<AuthModeCallback>,
}

/// Session events as seen by a channel-backed client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Data(String),
    Exit(ExitInfo),
    AuthMode(AuthMode),
}

impl ClientHandlers {
    pub fn new(
        on_data: impl Fn(&str) + Send + Sync + 'static,
        on_exit: impl Fn(&ExitInfo) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_data: Box::new(on_data),
            on_exit: Box::new(on_exit),
            on_auth_mode: None,
        }
    }

    pub fn with_auth_mode(mut self, on_auth_mode: impl Fn(AuthMode) + Send + Sync + 'static) -> Self {
        self.on_auth_mode = Some(Box::new(on_auth_mode));
        self
    }

    /// Handlers that forward every event, auth-mode changes included, into a channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let data_tx = tx.clone();
        let exit_tx = tx.clone();
        let handlers = Self::new(
            move |data| {
                let _ = data_tx.send(ClientEvent::Data(data.to_string()));
            },
            move |exit| {
                let _ = exit_tx.send(ClientEvent::Exit(exit.clone()));
            },
        )
        .with_auth_mode(move |mode| {
            let _ = tx.send(ClientEvent::AuthMode(mode));
        });
        (handlers, rx)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub auth_mode: AuthMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub pid: Option<u32>,
    pub attached_clients: usize,
    pub history_chars: usize,
    /// Host of the active credential set.
    pub credential_host: Option<String>,
    /// Machine client id, present only in m2m mode.
    pub client_id: Option<String>,
    pub has_user_token: bool,
    /// Runtime services that failed to contribute environment at creation.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env_warnings: Vec<String>,
}

pub(crate) struct SessionParts {
    pub id: SessionId,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub history_limit: usize,
    pub auth: AuthState,
    pub auth_file: Option<AuthStateFile>,
    pub env_warnings: Vec<String>,
    pub process: Box<dyn PtyProcess>,
}

struct SessionInner {
    cols: u16,
    rows: u16,
    history: History,
    clients: BTreeMap<u64, ClientHandlers>,
    next_client_id: u64,
    auth: AuthState,
    closed: bool,
}

pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    cwd: String,
    agent: Option<String>,
    model: Option<String>,
    process: Box<dyn PtyProcess>,
    auth_file: Option<AuthStateFile>,
    env_warnings: Vec<String>,
    /// Serializes auth-mode switches across their file write.
    auth_switch: tokio::sync::Mutex<()>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub(crate) fn new(parts: SessionParts) -> Self {
        Self {
            id: parts.id,
            created_at: Utc::now(),
            cwd: parts.cwd,
            agent: parts.agent,
            model: parts.model,
            process: parts.process,
            auth_file: parts.auth_file,
            env_warnings: parts.env_warnings,
            auth_switch: tokio::sync::Mutex::new(()),
            inner: Mutex::new(SessionInner {
                cols: parts.cols,
                rows: parts.rows,
                history: History::new(parts.history_limit),
                clients: BTreeMap::new(),
                next_client_id: 0,
                auth: parts.auth,
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    pub fn info(&self) -> SessionInfo {
        let inner = self.inner.lock();
        let active = inner.auth.active();
        SessionInfo {
            id: self.id.clone(),
            created_at: self.created_at,
            cwd: self.cwd.clone(),
            cols: inner.cols,
            rows: inner.rows,
            auth_mode: inner.auth.mode,
            agent: self.agent.clone(),
            model: self.model.clone(),
            pid: self.process.pid(),
            attached_clients: inner.clients.len(),
            history_chars: inner.history.len(),
            credential_host: active.host,
            client_id: active.client_id,
            has_user_token: inner.auth.user_token.is_some(),
            env_warnings: self.env_warnings.clone(),
        }
    }

    /// Record PTY output and fan it out to attached clients in registration order.
    pub(crate) fn handle_output(&self, data: &str) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.history.push(data);
        for handlers in inner.clients.values() {
            (handlers.on_data)(data);
        }
    }

    /// Register a client. History (if any) and the current auth mode are
    /// delivered before the lock is released, so live output can neither be
    /// missed nor duplicated relative to the replay.
    pub(crate) fn attach(self: &Arc<Self>, handlers: ClientHandlers) -> TermResult<DetachHandle> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TermError::NotFound(self.id.to_string()));
        }

        if !inner.history.is_empty() {
            (handlers.on_data)(&inner.history.snapshot());
        }
        if let Some(on_auth_mode) = &handlers.on_auth_mode {
            on_auth_mode(inner.auth.mode);
        }

        let client_id = inner.next_client_id;
        inner.next_client_id += 1;
        inner.clients.insert(client_id, handlers);
        debug!(
            "[session:{}] client {} attached ({} total)",
            self.id,
            client_id,
            inner.clients.len()
        );

        Ok(DetachHandle {
            session: Arc::downgrade(self),
            client_id,
            detached: AtomicBool::new(false),
        })
    }

    fn detach(&self, client_id: u64) {
        let mut inner = self.inner.lock();
        if inner.clients.remove(&client_id).is_some() {
            debug!(
                "[session:{}] client {} detached ({} remaining)",
                self.id,
                client_id,
                inner.clients.len()
            );
        }
    }

    pub(crate) fn write(&self, data: &[u8]) -> TermResult<()> {
        self.process
            .write(data)
            .map_err(|e| TermError::ProcessIo(e.to_string()))
    }

    /// Resize the PTY and the stored geometry under one lock.
    pub(crate) fn resize(&self, cols: u16, rows: u16) -> TermResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TermError::NotFound(self.id.to_string()));
        }
        self.process
            .resize(cols, rows)
            .map_err(|e| TermError::ProcessIo(e.to_string()))?;
        inner.cols = cols;
        inner.rows = rows;
        Ok(())
    }

    /// Switch credential mode: compute, persist, commit, then notify clients.
    /// Output keeps flowing while the new state is synced to disk.
    pub(crate) async fn set_auth_mode(
        &self,
        mode: AuthMode,
        user_token: Option<String>,
        delegated_host: Option<String>,
    ) -> TermResult<()> {
        let _switching = self.auth_switch.lock().await;
        let next = {
            let inner = self.inner.lock();
            if inner.closed {
                return Err(TermError::NotFound(self.id.to_string()));
            }
            inner.auth.switch(mode, user_token, delegated_host)?
        };

        if let Some(file) = self.auth_file.clone() {
            let id = self.id.clone();
            let state = next.clone();
            tokio::task::spawn_blocking(move || file.write(&id, &state))
                .await
                .map_err(|e| TermError::Internal(format!("auth state write task failed: {e}")))??;
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            // Teardown may have removed the file before this write landed.
            self.remove_auth_file();
            return Err(TermError::NotFound(self.id.to_string()));
        }
        inner.auth = next;

        info!("[session:{}] auth mode is now {}", self.id, mode.as_str());
        for handlers in inner.clients.values() {
            if let Some(on_auth_mode) = &handlers.on_auth_mode {
                on_auth_mode(mode);
            }
        }
        Ok(())
    }

    pub(crate) fn kill(&self) {
        if let Err(e) = self.process.kill() {
            warn!("[session:{}] failed to kill PTY process: {}", self.id, e);
        }
    }

    /// Mark the session closed and deliver `exit` to every attached client.
    /// Returns `false` if another caller already did so.
    pub(crate) fn finish(&self, exit: &ExitInfo) -> bool {
        let clients = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.closed = true;
            std::mem::take(&mut inner.clients)
        };

        for handlers in clients.values() {
            (handlers.on_exit)(exit);
        }
        true
    }

    pub(crate) fn remove_auth_file(&self) {
        if let Some(file) = &self.auth_file {
            if let Err(e) = file.remove() {
                warn!(
                    "[session:{}] failed to remove auth state file {:?}: {}",
                    self.id,
                    file.path(),
                    e
                );
            }
        }
    }
}

/// Removes one client registration. Calling [`DetachHandle::detach`] more than
/// once, or dropping the handle afterwards, has no further effect.
pub struct DetachHandle {
    session: Weak<Session>,
    client_id: u64,
    detached: AtomicBool,
}

impl DetachHandle {
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(session) = self.session.upgrade() {
            session.detach(self.client_id);
        }
    }
}

impl Drop for DetachHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_state::OriginalCredentials;
    use crate::pty::fake::{FakeHandle, FakeSpawner};
    use crate::pty::{PtySpawner, SpawnRequest};

    fn session_with(auth_file: Option<AuthStateFile>, history_limit: usize) -> (Arc<Session>, FakeHandle) {
        let spawner = FakeSpawner::new();
        let spawned = spawner
            .spawn(SpawnRequest {
                label: "test".into(),
                program: "/bin/sh".into(),
                args: vec![],
                cwd: "/tmp".into(),
                cols: 80,
                rows: 24,
                env: BTreeMap::new(),
            })
            .unwrap();
        let original = OriginalCredentials {
            host: Some("https://ambient.example".into()),
            client_id: Some("sp".into()),
            client_secret: Some("secret".into()),
        };
        let session = Arc::new(Session::new(SessionParts {
            id: SessionId::generate(),
            cwd: "/tmp".into(),
            cols: 80,
            rows: 24,
            agent: None,
            model: None,
            history_limit,
            auth: AuthState::initial(AuthMode::M2m, None, None, original).unwrap(),
            auth_file,
            env_warnings: Vec::new(),
            process: spawned.process,
        }));
        (session, spawner.last())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn attach_replays_history_then_streams() {
        let (session, _) = session_with(None, 1000);
        session.handle_output("before ");

        let (handlers, mut rx) = ClientHandlers::channel();
        let _handle = session.attach(handlers).unwrap();
        session.handle_output("after");

        assert_eq!(
            drain(&mut rx),
            vec![
                ClientEvent::Data("before ".into()),
                ClientEvent::AuthMode(AuthMode::M2m),
                ClientEvent::Data("after".into()),
            ]
        );
    }

    #[test]
    fn empty_history_is_not_replayed() {
        let (session, _) = session_with(None, 1000);
        let (handlers, mut rx) = ClientHandlers::channel();
        let _handle = session.attach(handlers).unwrap();
        assert_eq!(drain(&mut rx), vec![ClientEvent::AuthMode(AuthMode::M2m)]);
    }

    #[test]
    fn replay_is_bounded_by_history_limit() {
        let (session, _) = session_with(None, 5);
        session.handle_output("0123456789");
        let (handlers, mut rx) = ClientHandlers::channel();
        let _handle = session.attach(handlers).unwrap();
        assert_eq!(drain(&mut rx)[0], ClientEvent::Data("56789".into()));
        assert_eq!(session.info().history_chars, 5);
    }

    #[test]
    fn output_fans_out_to_every_client() {
        let (session, _) = session_with(None, 1000);
        let (a, mut rx_a) = ClientHandlers::channel();
        let (b, mut rx_b) = ClientHandlers::channel();
        let _ha = session.attach(a).unwrap();
        let _hb = session.attach(b).unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        session.handle_output("one");
        session.handle_output("two");
        let expected = vec![ClientEvent::Data("one".into()), ClientEvent::Data("two".into())];
        assert_eq!(drain(&mut rx_a), expected);
        assert_eq!(drain(&mut rx_b), expected);
    }

    #[test]
    fn detach_is_idempotent_and_runs_on_drop() {
        let (session, _) = session_with(None, 1000);
        let (a, _rx_a) = ClientHandlers::channel();
        let (b, _rx_b) = ClientHandlers::channel();
        let ha = session.attach(a).unwrap();
        let hb = session.attach(b).unwrap();
        assert_eq!(session.client_count(), 2);

        ha.detach();
        ha.detach();
        assert_eq!(session.client_count(), 1);
        drop(ha);
        assert_eq!(session.client_count(), 1);

        drop(hb);
        assert_eq!(session.client_count(), 0);
    }

    #[test]
    fn finish_notifies_once_and_refuses_new_clients() {
        let (session, _) = session_with(None, 1000);
        let (handlers, mut rx) = ClientHandlers::channel();
        let _handle = session.attach(handlers).unwrap();
        drain(&mut rx);

        let exit = ExitInfo {
            exit_code: Some(0),
            signal: None,
        };
        assert!(session.finish(&exit));
        assert!(!session.finish(&ExitInfo::killed()));
        assert_eq!(drain(&mut rx), vec![ClientEvent::Exit(exit)]);

        session.handle_output("late");
        assert!(drain(&mut rx).is_empty());

        let (late, _) = ClientHandlers::channel();
        assert!(matches!(session.attach(late), Err(TermError::NotFound(_))));
    }

    #[test]
    fn resize_updates_process_and_geometry() {
        let (session, pty) = session_with(None, 1000);
        session.resize(132, 43).unwrap();
        assert_eq!(pty.sizes(), vec![(132, 43)]);
        let info = session.info();
        assert_eq!((info.cols, info.rows), (132, 43));
    }

    #[tokio::test]
    async fn auth_switch_persists_then_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let id = SessionId::generate();
        let file = AuthStateFile::for_session(dir.path(), &id);
        let (session, _) = session_with(Some(file.clone()), 1000);

        let (handlers, mut rx) = ClientHandlers::channel();
        let _handle = session.attach(handlers).unwrap();
        drain(&mut rx);

        session
            .set_auth_mode(AuthMode::User, Some("tok".into()), None)
            .await
            .unwrap();
        assert_eq!(drain(&mut rx), vec![ClientEvent::AuthMode(AuthMode::User)]);

        let doc = file.load().unwrap();
        assert_eq!(doc.mode, AuthMode::User);
        assert_eq!(doc.token.as_deref(), Some("tok"));
        assert_eq!(doc.host.as_deref(), Some("https://ambient.example"));

        let info = session.info();
        assert_eq!(info.auth_mode, AuthMode::User);
        assert!(info.has_user_token);
        assert_eq!(info.client_id, None);
    }

    #[tokio::test]
    async fn failed_auth_switch_changes_nothing() {
        let (session, _) = session_with(None, 1000);
        let (handlers, mut rx) = ClientHandlers::channel();
        let _handle = session.attach(handlers).unwrap();
        drain(&mut rx);

        let err = session
            .set_auth_mode(AuthMode::User, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TermError::UserTokenMissing));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(session.info().auth_mode, AuthMode::M2m);
    }

    #[tokio::test]
    async fn concurrent_auth_switches_leave_file_and_state_in_step() {
        let dir = tempfile::tempdir().unwrap();
        let id = SessionId::generate();
        let file = AuthStateFile::for_session(dir.path(), &id);
        let (session, _) = session_with(Some(file.clone()), 1000);
        let (handlers, mut rx) = ClientHandlers::channel();
        let _handle = session.attach(handlers).unwrap();
        drain(&mut rx);

        let switches = (0..16).map(|i| {
            let session = session.clone();
            tokio::spawn(async move {
                let mode = if i % 2 == 0 { AuthMode::User } else { AuthMode::M2m };
                session
                    .set_auth_mode(mode, Some("tok".into()), None)
                    .await
                    .unwrap();
            })
        });
        for switch in futures::future::join_all(switches).await {
            switch.unwrap();
        }

        let notified: Vec<ClientEvent> = drain(&mut rx);
        assert_eq!(notified.len(), 16);
        let mode = session.info().auth_mode;
        assert_eq!(notified.last(), Some(&ClientEvent::AuthMode(mode)));
        assert_eq!(file.load().unwrap().mode, mode);
    }

    #[tokio::test]
    async fn auth_switch_on_a_finished_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let id = SessionId::generate();
        let file = AuthStateFile::for_session(dir.path(), &id);
        let (session, _) = session_with(Some(file.clone()), 1000);
        session.finish(&ExitInfo::killed());

        let err = session
            .set_auth_mode(AuthMode::User, Some("tok".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TermError::NotFound(_)));
        assert!(!file.path().exists());
    }

    #[test]
    fn kill_reaches_process() {
        let (session, pty) = session_with(None, 1000);
        session.kill();
        assert!(pty.was_killed());
    }
}
