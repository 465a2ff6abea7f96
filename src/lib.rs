pub mod api;
pub mod auth_state;
pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod gateway;
pub mod history;
pub mod manager;
pub mod models;
pub mod pty;
pub mod services;
pub mod session;
pub mod session_id;

pub use api::{build_router, AppState};
pub use auth_state::AuthMode;
pub use errors::{TermError, TermResult};
pub use manager::{CreateSessionOptions, SessionManager, SessionStats};
pub use pty::NativePtySpawner;
pub use services::{RuntimeService, ServiceRegistry};
pub use session::{ClientEvent, ClientHandlers, DetachHandle, SessionInfo};
pub use session_id::SessionId;

pub const DEFAULT_HTTP_PORT: u16 = 39390;
