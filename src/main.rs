//! chatcast - real-time presence and delivery server

#[cfg(feature = "postgres")]
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use chatcast::{AppState, Config, build_router};

#[cfg(feature = "postgres")]
use chatcast::PostgresPubSub;
#[cfg(feature = "postgres")]
use chatcast::pubsub::{self, PubSub};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Parser, Debug)]
#[command(name = "chatcast")]
#[command(about = "Real-time presence and live message delivery for two-party chat")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Listen address, overrides CHATCAST_BIND / PORT
    #[arg(short, long)]
    bind: Option<std::net::SocketAddr>,

    /// Allowed CORS origin (repeatable), overrides CHATCAST_ALLOWED_ORIGINS
    #[arg(long = "allow-origin")]
    allow_origins: Vec<String>,
}

fn init_tracing(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    match args.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt().pretty().with_env_filter(filter).init(),
    }
}

#[cfg(feature = "postgres")]
async fn init_pubsub(config: &Config) -> Option<Arc<PostgresPubSub>> {
    let Some(ref db_url) = config.database_url else {
        warn!("No CHATCAST_DATABASE_URL - pub/sub ingest disabled");
        return None;
    };
    match PostgresPubSub::new(db_url).await {
        Ok(ps) => {
            info!("PostgreSQL pub/sub connected");
            Some(Arc::new(ps))
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to PostgreSQL pub/sub");
            None
        }
    }
}

/// Subscribe to the delivery stream and hand every payload to the router
#[cfg(feature = "postgres")]
async fn spawn_ingest(state: &AppState) -> anyhow::Result<()> {
    let config = &state.config;
    let Some(ps) = init_pubsub(config).await else {
        return Ok(());
    };

    ps.subscribe(&config.delivery_stream)
        .await
        .with_context(|| format!("failed to subscribe to {}", config.delivery_stream))?;

    let router = state.router.clone();
    tokio::spawn(async move {
        info!("Starting pub/sub listener");
        if let Err(e) = ps
            .listen(move |stream, payload| {
                pubsub::dispatch_delivery(&router, &stream, &payload);
            })
            .await
        {
            error!(error = %e, "Pub/sub listener error");
        }
    });

    Ok(())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    info!("chatcast v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if !args.allow_origins.is_empty() {
        config.allowed_origins = args.allow_origins.clone();
    }

    let state = AppState::new(config);
    let config = state.config.clone();

    #[cfg(feature = "postgres")]
    spawn_ingest(&state).await?;

    // The in-process bus has no outside publishers
    #[cfg(feature = "memory")]
    info!("Memory pub/sub backend: no ingest listener, use POST /internal/deliver");

    // Spawn heartbeat task
    if let Some(period) = config.ping_period() {
        let hub = state.hub.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let timestamp = unix_now();
                hub.broadcast_ping(timestamp);
                debug!(timestamp, sessions = hub.session_count(), "Ping sent");
            }
        });
    } else {
        warn!("Heartbeat disabled");
    }

    let app = build_router(state);
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(addr = %config.bind, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("chatcast stopped");
    Ok(())
}
