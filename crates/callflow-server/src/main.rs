//! Callflow server binary.
//!
//! Starts an axum HTTP server with structured logging, database
//! initialization, and graceful shutdown on SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use callflow_server::{
    app, background, config, telephony::HttpTelephony, AppState, Services,
};
use callflow_translate::{build_providers, TranslationChain};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("CALLFLOW_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration; the server cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );
    if config.webhook.secret.as_deref().unwrap_or_default().is_empty() {
        tracing::warn!("webhook.secret is not set; every telephony webhook will be rejected");
    }

    let pool = callflow_db::create_pool(
        &config.database.path,
        callflow_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to create database pool; check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied =
            callflow_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    let providers = build_providers(
        &config.translation.providers,
        Duration::from_millis(config.translation.provider_timeout_ms),
    )
    .expect("failed to build translation providers; check [[translation.providers]]");
    let chain = Arc::new(TranslationChain::new(
        providers,
        config.translation.chain_settings(),
    ));
    if chain.is_empty() {
        tracing::warn!("no translation providers configured; segments will be published untranslated");
    } else {
        tracing::info!(providers = ?chain.provider_names(), "translation chain ready");
    }

    let telephony = HttpTelephony::new(
        &config.telephony.base_url,
        config.telephony.api_key.clone(),
        config.telephony.webhook_url.clone(),
        Duration::from_millis(config.telephony.request_timeout_ms),
    )
    .expect("failed to build telephony client");
    let synthesizer = callflow_voice::build_synthesizer(&config.voice);

    let state = AppState::new(
        pool,
        &config,
        Services {
            telephony: Arc::new(telephony),
            chain,
            synthesizer,
        },
    );

    tokio::spawn(background::start_stream_sweep_task(
        Arc::clone(&state.hub),
        config.pipeline.sweep_interval_secs,
    ));

    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);
    tracing::info!(%addr, "starting callflow server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address; is another process using this port?");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("callflow server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
