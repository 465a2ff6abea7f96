use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use cmux_termd::config::{Bounds, GatewayConfig, GeometryConfig, ManagerConfig, ServicesConfig};
use cmux_termd::services::{SessionIdentityService, StaticEnvService};
use cmux_termd::{build_router, AppState, NativePtySpawner, ServiceRegistry, SessionManager};
use cmux_termd::DEFAULT_HTTP_PORT;
use tokio::net::TcpListener;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "cmux-termd", author, version)]
#[command(about = "PTY session server with a WebSocket streaming gateway")]
struct Options {
    /// Address the HTTP server binds to
    #[arg(long, default_value = "0.0.0.0", env = "TERMD_HOST")]
    host: IpAddr,
    /// Port for the HTTP server
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "TERMD_PORT")]
    port: u16,
    /// Shell spawned for each session (defaults to $SHELL, then /bin/bash)
    #[arg(long, env = "TERMD_SHELL")]
    shell: Option<String>,
    /// Working directory for sessions that do not name one (defaults to $HOME)
    #[arg(long, env = "TERMD_DEFAULT_CWD")]
    default_cwd: Option<String>,
    #[arg(long, default_value_t = 32, env = "TERMD_MAX_SESSIONS")]
    max_sessions: usize,
    /// Output history kept per session, in characters
    #[arg(long, default_value_t = 100_000, env = "TERMD_HISTORY_LIMIT")]
    history_limit: usize,
    /// Largest accepted single input, in bytes
    #[arg(long, default_value_t = 65_536, env = "TERMD_MAX_INPUT_BYTES")]
    max_input_bytes: usize,
    #[arg(long, default_value_t = 20, env = "TERMD_MIN_COLS")]
    min_cols: u16,
    #[arg(long, default_value_t = 500, env = "TERMD_MAX_COLS")]
    max_cols: u16,
    #[arg(long, default_value_t = 5, env = "TERMD_MIN_ROWS")]
    min_rows: u16,
    #[arg(long, default_value_t = 200, env = "TERMD_MAX_ROWS")]
    max_rows: u16,
    /// Directory for per-session auth-state files
    #[arg(long, env = "TERMD_AUTH_STATE_DIR")]
    auth_state_dir: Option<PathBuf>,
    /// Timeout for each runtime-service hook
    #[arg(long, default_value_t = 2_000, env = "TERMD_ENRICH_TIMEOUT_MS")]
    enrich_timeout_ms: u64,
    /// Per-connection outbound buffer before a slow client is disconnected
    #[arg(long, default_value_t = 1024 * 1024, env = "TERMD_MAX_BUFFERED_BYTES")]
    max_buffered_bytes: usize,
    /// Extra KEY=VALUE variable for every session (repeatable)
    #[arg(long = "session-env", value_name = "KEY=VALUE")]
    session_env: Vec<String>,
    /// Directory for daily-rolling log files
    #[arg(long, env = "TERMD_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    let _guard = init_tracing(options.log_dir.as_deref());

    run_server(options).await
}

/// Logs go to stdout, and additionally to a daily-rolling file when
/// `log_dir` is set. The returned guard must live as long as the process.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_writer, guard) = match log_dir.map(daily_log_writer).transpose() {
        Ok(Some((writer, guard))) => (Some(writer), Some(guard)),
        Ok(None) => (None, None),
        Err(e) => {
            eprintln!("cmux-termd: file logging disabled: {e}");
            (None, None)
        }
    };
    let file_layer = file_writer.map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_target(false)
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    guard
}

fn daily_log_writer(dir: &Path) -> std::io::Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::daily(dir, "cmux-termd.log");
    Ok(tracing_appender::non_blocking(appender))
}

fn manager_config(options: &Options) -> ManagerConfig {
    let defaults = ManagerConfig::default();
    ManagerConfig {
        shell: options.shell.clone().unwrap_or(defaults.shell),
        shell_args: Vec::new(),
        default_cwd: options.default_cwd.clone().unwrap_or(defaults.default_cwd),
        max_sessions: options.max_sessions,
        history_limit: options.history_limit,
        max_input_bytes: options.max_input_bytes,
        geometry: GeometryConfig {
            cols: Bounds::new(options.min_cols, options.max_cols),
            rows: Bounds::new(options.min_rows, options.max_rows),
            ..GeometryConfig::default()
        },
        auth_state_dir: options.auth_state_dir.clone().or(defaults.auth_state_dir),
        ..defaults
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!("failed to listen for SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

async fn run_server(options: Options) -> anyhow::Result<()> {
    let static_env = StaticEnvService::parse_pairs(&options.session_env)
        .context("invalid --session-env value")?;
    let services = Arc::new(
        ServiceRegistry::new(ServicesConfig {
            hook_timeout: Duration::from_millis(options.enrich_timeout_ms),
        })
        .with_service(SessionIdentityService)
        .with_service(static_env),
    );
    services.start_all().await;

    let manager = SessionManager::new(
        manager_config(&options),
        Arc::new(NativePtySpawner),
        services.clone(),
    );
    let gateway = GatewayConfig {
        max_buffered_bytes: options.max_buffered_bytes,
    };
    let app = build_router(AppState::new(manager.clone(), services.clone(), gateway));

    let addr = SocketAddr::new(options.host, options.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("cmux-termd listening on http://{}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    manager.shutdown();
    services.stop_all().await;
    served.context("server error")?;
    tracing::info!("server shut down gracefully");
    Ok(())
}
