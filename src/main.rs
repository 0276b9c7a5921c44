mod api;
mod bridge;
mod config;
mod elevenlabs;
mod metrics;
mod registry;
mod transcript;
mod twilio;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use config::Config;
use metrics::Metrics;
use registry::CallRegistry;
use transcript::TranscriptStore;
use twilio::client::TwilioClient;

/// Call contexts older than this are swept.
const REGISTRY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// How long in-flight sessions get to drain after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub twilio: Arc<TwilioClient>,
    pub registry: CallRegistry,
    pub transcripts: TranscriptStore,
    pub metrics: Metrics,
    pub started_at: Instant,
}

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.default_log_filter().into()),
        )
        .init();

    // An unrecoverable fault in any task must take the process down
    // rather than leave a half-alive relay behind.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        tracing::error!("Unrecoverable fault: {info}");
        std::process::exit(1);
    }));

    tracing::info!(
        port = config.port,
        env = %config.environment,
        "Starting call-relay"
    );

    let state = AppState {
        twilio: Arc::new(TwilioClient::new(&config.twilio)),
        registry: CallRegistry::new(),
        transcripts: TranscriptStore::new(),
        metrics: Metrics::new(),
        started_at: Instant::now(),
        config: config.clone(),
    };

    // Hourly sweep of contexts whose call never reached the stream
    let sweeper = state.registry.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.tick().await;
        loop {
            tick.tick().await;
            sweeper.sweep(REGISTRY_TTL).await;
        }
    });

    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, "Listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server error: {e}");
        std::process::exit(1);
    }

    tracing::info!("Shut down cleanly");
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(api::system::root))
        .route("/health", get(api::system::health))
        .route("/metrics", get(api::system::metrics))
        .route("/transcripts/{call_sid}", get(api::system::transcript))
        .route("/twilio/outbound_call", post(api::calls::outbound_call))
        .route("/twilio/outbound_twiml", post(twilio::webhook::outbound_twiml))
        .route("/twilio/call_status", post(twilio::webhook::call_status))
        .route("/media-stream", get(bridge::handle_media_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolves on SIGINT or SIGTERM, then arms a watchdog so a stuck drain
/// cannot hold the process open past the grace period.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

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
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received, draining sessions");
    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        tracing::error!("Drain exceeded grace period, forcing exit");
        std::process::exit(1);
    });
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    let config = Config {
        port: 8000,
        environment: "test".to_string(),
        twilio: config::TwilioConfig {
            account_sid: "AC0".to_string(),
            auth_token: "secret".to_string(),
            phone_number: "+15550001111".to_string(),
        },
        elevenlabs: config::ElevenLabsConfig {
            agent_id: "agent".to_string(),
            api_key: "xi".to_string(),
        },
        media_stream_timeout: Duration::from_secs(300),
        max_agent_retries: 3,
    };
    AppState {
        // Unroutable base so no test can dial the real API
        twilio: Arc::new(TwilioClient::with_api_base(&config.twilio, "http://127.0.0.1:1")),
        registry: CallRegistry::new(),
        transcripts: TranscriptStore::new(),
        metrics: Metrics::new(),
        started_at: Instant::now(),
        config,
    }
}
