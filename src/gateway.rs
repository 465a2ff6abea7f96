//! WebSocket streaming gateway.
//!
//! One connection attaches one client to one session. Frames are JSON text
//! tagged by `type`. Outgoing frames go through [`Outbound`], which counts the
//! bytes queued for the socket and sheds the connection (close 4008) once the
//! peer falls too far behind instead of buffering without bound.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval};
use tracing::{debug, error, info, warn};

use crate::auth_state::AuthMode;
use crate::config::GatewayConfig;
use crate::errors::TermError;
use crate::manager::SessionManager;
use crate::models::ConnectParams;
use crate::session::{ClientEvent, ClientHandlers, DetachHandle};
use crate::session_id::SessionId;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// How long a closing connection may take to flush its close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const TRY_AGAIN_LATER: u16 = 1013;
    pub const SESSION_LOST: u16 = 4001;
    pub const CONSUMER_TOO_SLOW: u16 = 4008;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Input { data: String },
    Resize { cols: u32, rows: u32 },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ready {
        session_id: String,
    },
    Output {
        data: String,
    },
    Exit {
        exit_code: Option<i32>,
        signal: Option<String>,
    },
    AuthMode {
        mode: AuthMode,
    },
    Pong,
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<&'static str>,
    },
}

impl ServerFrame {
    fn error(err: &TermError) -> Self {
        ServerFrame::Error {
            message: err.to_string(),
            code: Some(err.kind()),
        }
    }
}

/// Close code for a failure while the connection is still being set up.
fn connect_close_code(err: &TermError) -> u16 {
    match err {
        TermError::InvalidIdentifier(_) => close_code::POLICY_VIOLATION,
        TermError::CapacityExceeded { .. } => close_code::TRY_AGAIN_LATER,
        TermError::NotFound(_) => close_code::SESSION_LOST,
        _ => close_code::INTERNAL_ERROR,
    }
}

/// Dead-peer detection. Every tick pings the peer; a tick that finds nothing
/// heard from the peer since the previous one reports it gone.
struct Heartbeat {
    interval: Interval,
    peer_seen: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Beat {
    Ping,
    PeerGone,
}

impl Heartbeat {
    fn new(period: Duration) -> Self {
        Self {
            interval: interval_at(Instant::now() + period, period),
            peer_seen: true,
        }
    }

    fn saw_peer(&mut self) {
        self.peer_seen = true;
    }

    async fn tick(&mut self) -> Beat {
        self.interval.tick().await;
        if std::mem::replace(&mut self.peer_seen, false) {
            Beat::Ping
        } else {
            Beat::PeerGone
        }
    }
}

#[derive(Debug)]
pub(crate) enum Outgoing {
    /// Data frame; `bytes` is released from the buffered count once written.
    Frame { message: Message, bytes: usize },
    /// Heartbeat ping, exempt from accounting.
    Control(Message),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    Queued,
    /// The peer was too far behind; the connection is now closing.
    Shed,
    Closed,
}

/// Producer side of a connection's socket writer.
pub(crate) struct Outbound {
    label: String,
    tx: mpsc::UnboundedSender<Outgoing>,
    buffered: Arc<AtomicUsize>,
    closed: AtomicBool,
    max_buffered: usize,
}

impl Outbound {
    pub(crate) fn new(
        label: String,
        max_buffered: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Outgoing>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let outbound = Self {
            label,
            tx,
            buffered: buffered.clone(),
            closed: AtomicBool::new(false),
            max_buffered,
        };
        (outbound, rx, buffered)
    }

    pub(crate) fn send(&self, frame: &ServerFrame) -> SendOutcome {
        if self.is_closed() {
            return SendOutcome::Closed;
        }

        let buffered = self.buffered.load(Ordering::SeqCst);
        if buffered > self.max_buffered {
            warn!(
                "[gateway:{}] {} bytes buffered (limit {}), shedding connection",
                self.label, buffered, self.max_buffered
            );
            self.close(close_code::CONSUMER_TOO_SLOW, "consumer too slow");
            return SendOutcome::Shed;
        }

        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                error!("[gateway:{}] failed to encode frame: {}", self.label, e);
                return SendOutcome::Closed;
            }
        };
        let bytes = text.len();
        self.buffered.fetch_add(bytes, Ordering::SeqCst);
        if self
            .tx
            .send(Outgoing::Frame {
                message: Message::Text(text),
                bytes,
            })
            .is_err()
        {
            self.closed.store(true, Ordering::SeqCst);
            return SendOutcome::Closed;
        }
        SendOutcome::Queued
    }

    pub(crate) fn ping(&self) {
        if !self.is_closed() {
            let _ = self.tx.send(Outgoing::Control(Message::Ping(Vec::new())));
        }
    }

    /// Queue a close frame. Only the first call has any effect.
    pub(crate) fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("[gateway:{}] closing ({}: {})", self.label, code, reason);
        let _ = self.tx.send(Outgoing::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn spawn_writer(
    label: String,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    buffered: Arc<AtomicUsize>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut frames_sent = 0usize;
        while let Some(outgoing) = rx.recv().await {
            match outgoing {
                Outgoing::Frame { message, bytes } => {
                    let result = sink.send(message).await;
                    buffered.fetch_sub(bytes, Ordering::SeqCst);
                    if let Err(e) = result {
                        debug!("[gateway:{}] send failed: {}", label, e);
                        return;
                    }
                    frames_sent += 1;
                }
                Outgoing::Control(message) => {
                    if sink.send(message).await.is_err() {
                        return;
                    }
                }
                Outgoing::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    debug!("[gateway:{}] writer done after {} frames", label, frames_sent);
                    return;
                }
            }
        }
        let _ = sink.close().await;
        debug!("[gateway:{}] writer done after {} frames", label, frames_sent);
    })
}

/// Run one streaming connection to completion. The session outlives it.
pub async fn serve_connection(
    socket: WebSocket,
    manager: Arc<SessionManager>,
    session_id: String,
    params: ConnectParams,
    config: GatewayConfig,
) {
    let label = if SessionId::is_valid(&session_id) {
        session_id.clone()
    } else {
        "invalid".to_string()
    };
    let (sink, mut stream) = socket.split();
    let (outbound, rx, buffered) = Outbound::new(label.clone(), config.max_buffered_bytes);
    let mut writer = spawn_writer(label.clone(), sink, rx, buffered);

    // Connecting
    let (detach, mut events) = match connect(&manager, &session_id, &params).await {
        Ok(attached) => attached,
        Err(err) => {
            warn!("[gateway:{}] connect failed: {}", label, err);
            outbound.send(&ServerFrame::error(&err));
            outbound.close(connect_close_code(&err), err.kind());
            finish_writer(&label, writer).await;
            return;
        }
    };

    // Active
    info!("[gateway:{}] client connected", label);
    outbound.send(&ServerFrame::Ready {
        session_id: session_id.clone(),
    });

    let mut heartbeat = Heartbeat::new(HEARTBEAT_INTERVAL);
    let mut events_open = true;
    let mut writer_done = false;
    let mut terminate = false;

    while !outbound.is_closed() {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(message)) => {
                        heartbeat.saw_peer();
                        match message {
                            Message::Text(text) => {
                                handle_client_text(&manager, &session_id, &outbound, &text);
                            }
                            Message::Binary(_) => {
                                outbound.send(&ServerFrame::Error {
                                    message: "binary frames are not supported".to_string(),
                                    code: Some("invalid_frame"),
                                });
                            }
                            Message::Ping(_) | Message::Pong(_) => {}
                            Message::Close(_) => break,
                        }
                    }
                    Some(Err(e)) => {
                        debug!("[gateway:{}] receive error: {}", label, e);
                        break;
                    }
                    None => break,
                }
            }
            event = events.recv(), if events_open => {
                match event {
                    Some(ClientEvent::Data(data)) => {
                        outbound.send(&ServerFrame::Output { data });
                    }
                    Some(ClientEvent::AuthMode(mode)) => {
                        outbound.send(&ServerFrame::AuthMode { mode });
                    }
                    Some(ClientEvent::Exit(exit)) => {
                        outbound.send(&ServerFrame::Exit {
                            exit_code: exit.exit_code,
                            signal: exit.signal,
                        });
                        outbound.close(close_code::NORMAL, "session exited");
                    }
                    None => events_open = false,
                }
            }
            beat = heartbeat.tick() => match beat {
                Beat::Ping => outbound.ping(),
                Beat::PeerGone => {
                    warn!("[gateway:{}] no heartbeat response, terminating", label);
                    terminate = true;
                    break;
                }
            },
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        }
    }

    // Closed
    detach.detach();
    drop(outbound);
    if terminate {
        writer.abort();
    } else if !writer_done {
        finish_writer(&label, writer).await;
    }
    info!("[gateway:{}] client disconnected", label);
}

async fn connect(
    manager: &Arc<SessionManager>,
    session_id: &str,
    params: &ConnectParams,
) -> Result<(DetachHandle, mpsc::UnboundedReceiver<ClientEvent>), TermError> {
    SessionId::parse(session_id)?;
    let info = manager
        .ensure_session(session_id, params.cols, params.rows)
        .await?;

    if params.cols.is_some() || params.rows.is_some() {
        manager.resize_session(
            session_id,
            params.cols.unwrap_or(u32::from(info.cols)),
            params.rows.unwrap_or(u32::from(info.rows)),
        )?;
    }

    let (handlers, events) = ClientHandlers::channel();
    let detach = manager.attach_session(session_id, handlers)?;
    Ok((detach, events))
}

async fn finish_writer(label: &str, mut writer: JoinHandle<()>) {
    if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        debug!("[gateway:{}] writer did not finish in time, aborting", label);
        writer.abort();
    }
}

fn handle_client_text(
    manager: &SessionManager,
    session_id: &str,
    outbound: &Outbound,
    text: &str,
) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            outbound.send(&ServerFrame::Error {
                message: format!("invalid frame: {e}"),
                code: Some("invalid_frame"),
            });
            return;
        }
    };

    match frame {
        ClientFrame::Input { data } => match manager.write_input(session_id, &data) {
            Ok(()) => {}
            Err(err @ TermError::NotFound(_)) => {
                outbound.send(&ServerFrame::error(&err));
                outbound.close(close_code::SESSION_LOST, "session lost");
            }
            Err(err) => {
                outbound.send(&ServerFrame::error(&err));
            }
        },
        ClientFrame::Resize { cols, rows } => {
            if let Err(e) = manager.resize_session(session_id, cols, rows) {
                warn!("[gateway:{}] resize failed: {}", session_id, e);
            }
        }
        ClientFrame::Ping => {
            outbound.send(&ServerFrame::Pong);
        }
    }
}
