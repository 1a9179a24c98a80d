use anyhow::Context as _;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

mod admin;
mod audit;
mod bridge;
mod config;
mod core;
mod error;
mod headers;
mod jsonrpc;
mod legacy;
mod session;
mod sse;
mod streamable;
mod upstream;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hard cap protecting the process from unbounded request bodies; the audit
/// capture cap (`MAX_BODY_BYTES`) is much smaller and applied in the sink.
const HARD_MAX_POST_BODY_BYTES: usize = 32 * 1024 * 1024;

/// CLI arguments for the proxy.
#[derive(Parser, Debug, Clone)]
#[command(name = "palisade")]
#[command(version, about = "Reverse proxy for MCP servers: SSE, Streamable HTTP, and stdio bridging")]
struct CliArgs {
    /// Path to the destinations config file (YAML).
    #[arg(short = 'c', long = "config", env = "DESTINATIONS_CONFIG", default_value = "config/destinations.yml")]
    config: PathBuf,

    /// Path to the per-destination secrets file (YAML); missing is fine.
    #[arg(long = "secrets", env = "SECRETS_CONFIG", default_value = "config/secrets.yml")]
    secrets: PathBuf,

    /// Data plane HTTP bind address (ip:port).
    #[arg(short = 'b', long, env = "PALISADE_BIND", default_value = "127.0.0.1:3000")]
    bind: String,

    /// Admin plane port; always bound to loopback.
    #[arg(long = "admin-port", env = "ADMIN_PORT", default_value_t = 3001)]
    admin_port: u16,

    /// Log level. Supports tracing filter syntax.
    #[arg(short = 'l', long = "log-level", env = "PALISADE_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(&args.log_level);

    tracing::info!("Starting palisade v{VERSION}");
    run(args).await
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    let settings = config::Settings::from_env();
    let registry = config::Registry::load(&args.config)
        .with_context(|| format!("load destinations config {}", args.config.display()))?;
    let secrets = config::load_secrets(Some(&args.secrets))?;
    if registry.is_empty() {
        tracing::warn!("no destinations configured; only /health will answer");
    }
    tracing::info!(destinations = registry.len(), "destinations configured");

    // Graceful shutdown coordination for servers, bridges, and the sink.
    let ct = CancellationToken::new();

    let audit = audit::FileAuditSink::new(
        &settings.log_file,
        audit::BodyPolicy {
            capture: settings.audit_log_bodies,
            max_bytes: settings.max_body_bytes,
        },
    )
    .with_context(|| format!("open audit log {}", settings.log_file.display()))?;

    let scanner = Arc::new(palisade_scan::Scanner::new(settings.ai_injection_threshold));
    scanner.reload(&settings.patterns_dir);

    let http = upstream::build_client()?;
    let sessions = Arc::new(session::SessionMap::new(settings.max_sessions));

    // Bridges launch eagerly so a broken stdio command surfaces in the log at
    // startup, not on first use.
    let mut bridges = std::collections::HashMap::new();
    for dest in registry.iter() {
        if dest.kind != config::DestinationKind::Stdio {
            continue;
        }
        let env = config::subprocess_env(dest, &secrets);
        let bridge = bridge::StdioBridge::launch(
            dest.clone(),
            env,
            bridge::BridgeSettings::new(settings.max_stdio_connections, settings.rpc_response_timeout),
            audit.clone() as Arc<dyn audit::AuditSink>,
            ct.child_token(),
        )
        .await;
        bridges.insert(dest.name.clone(), bridge);
    }

    let semaphores = core::Core::build_semaphores(&registry, settings.max_stdio_connections);

    let core = Arc::new(core::Core {
        registry,
        settings,
        http,
        audit: audit.clone(),
        sessions,
        bridges,
        semaphores,
        scanner,
        shutdown: ct.clone(),
    });

    let data_app = Router::new()
        .route("/health", get(health))
        .route("/{dest}/sse", get(legacy::get_sse))
        .route("/{dest}/message", axum::routing::post(legacy::post_message))
        .route(
            "/{dest}/mcp",
            axum::routing::post(streamable::post_mcp)
                .get(streamable::get_mcp)
                .delete(streamable::delete_mcp),
        )
        .layer(DefaultBodyLimit::max(HARD_MAX_POST_BODY_BYTES))
        .with_state(core.clone());

    let admin_app = admin::router(core.clone());

    let data_bind: SocketAddr = args
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", args.bind))?;
    let admin_bind = SocketAddr::from(([127, 0, 0, 1], args.admin_port));

    let (data_listener, _) = bind_and_log(data_bind, "data").await?;
    let (admin_listener, _) = bind_and_log(admin_bind, "admin").await?;

    spawn_shutdown_watcher(ct.clone());

    let data_ct = ct.clone();
    let data_server = axum::serve(
        data_listener,
        data_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { data_ct.cancelled().await });

    let admin_ct = ct.clone();
    let admin_server = axum::serve(
        admin_listener,
        admin_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { admin_ct.cancelled().await });

    tokio::try_join!(data_server, admin_server)?;

    // Servers are down; tear down bridges (SIGTERM, grace, SIGKILL), then the
    // sink flushes when the last reference drops.
    ct.cancel();
    for bridge in core.bridges.values() {
        let _ = tokio::time::timeout(Duration::from_secs(6), bridge.terminated()).await;
    }

    tracing::info!("Proxy shut down gracefully");
    Ok(())
}

async fn bind_and_log(
    addr: SocketAddr,
    label: &'static str,
) -> anyhow::Result<(tokio::net::TcpListener, SocketAddr)> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {label} address '{addr}'"))?;
    let bound = listener
        .local_addr()
        .with_context(|| format!("get {label} bind address"))?;
    tracing::info!("Starting {label} plane HTTP server on {bound}");
    Ok((listener, bound))
}

fn spawn_shutdown_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                }
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            () = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        ct.cancel();
    });
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

/// Initialize logging based on the log level string.
fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // Human format on a TTY, JSON otherwise.
    let is_tty = atty::is(atty::Stream::Stdout);

    if is_tty {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}
