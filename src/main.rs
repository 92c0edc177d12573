use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use sms_screener::config::ServiceConfig;
use sms_screener::dispatch::{ConsoleTransport, HttpSmsTransport, OutboundDispatcher, SmsTransport};
use sms_screener::engine::{ConversationEngine, MessageRouter};
use sms_screener::gateway::DedupeCache;
use sms_screener::instruments::InstrumentRegistry;
use sms_screener::results::{HttpResultSink, ResultHandoff, ResultSink};
use sms_screener::session::sweep::spawn_idle_sweep;
use sms_screener::store::LibSqlBackend;
use sms_screener::web::webhook_routes;

/// Longest pause between idle-session sweeps.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env();
    let _log_guard = init_tracing(config.as_ref().ok().and_then(|c| c.log_dir.as_deref()));

    let result = match config {
        Ok(config) => run(config).await,
        Err(e) => Err(anyhow::Error::new(e).context("Invalid configuration")),
    };
    if let Err(ref e) = result {
        let chain = format!("{e:#}");
        error!(error = %chain, "SMS screener failed to start");
    }
    result
}

/// Stderr logging, plus a daily rolling file when `log_dir` is set. The
/// returned guard must live as long as the process.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "sms-screener.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .init();
            None
        }
    }
}

async fn run(config: ServiceConfig) -> anyhow::Result<()> {
    eprintln!("📋 SMS Screener v{}", env!("CARGO_PKG_VERSION"));

    // ── Instruments ──────────────────────────────────────────────────────
    let registry = match config.instruments_path {
        Some(ref path) => InstrumentRegistry::load(path)
            .with_context(|| format!("Failed to load instrument catalogue {}", path.display()))?,
        None => InstrumentRegistry::builtin().context("Built-in instrument catalogue is invalid")?,
    };
    eprintln!(
        "   Catalogue: v{} ({})",
        registry.version(),
        registry.primary_keywords().join(", ")
    );
    let registry = Arc::new(registry);

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Outbound ─────────────────────────────────────────────────────────
    let transport: Arc<dyn SmsTransport> = match config.transport {
        Some(ref transport) => Arc::new(HttpSmsTransport::new(transport)),
        None => {
            warn!("SCREENER_TRANSPORT_URL not set, replies are printed to stderr");
            Arc::new(ConsoleTransport)
        }
    };
    eprintln!("   Transport: {}", transport.name());
    let dispatcher = Arc::new(OutboundDispatcher::new(transport, config.dispatch.clone()));

    // ── Router ───────────────────────────────────────────────────────────
    let mut router = MessageRouter::new(
        ConversationEngine::new(Arc::clone(&registry)),
        db.clone(),
        db.clone(),
        dispatcher,
        DedupeCache::new(config.dedupe_ttl, config.dedupe_capacity),
    );

    match config.sink {
        Some(ref sink_config) => {
            let sink: Arc<dyn ResultSink> = Arc::new(HttpResultSink::new(sink_config));
            let handoff = Arc::new(ResultHandoff::new(
                db.clone(),
                sink,
                config.handoff_escalate_after,
            ));
            router = router.with_handoff(Arc::clone(&handoff));
            let _handoff_handle =
                handoff.spawn(config.handoff_interval.max(Duration::from_secs(1)));
            eprintln!("   Result sink: {}", sink_config.url);
        }
        None => {
            info!("No result sink configured; results stay in the local database");
            eprintln!("   Result sink: none (local database only)");
        }
    }

    if let Some(idle_timeout) = config.session_idle_timeout {
        let interval = idle_timeout.clamp(Duration::from_secs(1), MAX_SWEEP_INTERVAL);
        let _sweep_handle = spawn_idle_sweep(db.clone(), idle_timeout, interval);
        eprintln!("   Idle sweep: after {}s", idle_timeout.as_secs());
    }

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = webhook_routes(Arc::new(router));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    eprintln!("   Webhook: http://0.0.0.0:{}/webhook/sms\n", config.port);
    info!(port = config.port, "Webhook server started");

    axum::serve(listener, app)
        .await
        .context("Webhook server stopped")?;
    Ok(())
}
