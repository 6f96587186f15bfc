//! Callflow server library logic.

pub mod api_calls;
pub mod api_config;
pub mod api_stream;
pub mod background;
pub mod config;
pub mod error;
pub mod ingress;
pub mod registry;
pub mod signature;
pub mod telephony;
mod translation_lane;
mod voice_lane;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use callflow_db::DbPool;
use callflow_stream::StreamHub;
use callflow_translate::TranslationChain;
use callflow_voice::SpeechSynthesizer;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use registry::CallRegistry;
use signature::WebhookVerifier;
use telephony::TelephonyCommands;
use worker::{WorkerContext, WorkerSettings};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Live streams, one per active or recently ended call.
    pub hub: Arc<StreamHub>,
    /// Running call workers.
    pub registry: Arc<CallRegistry>,
    /// Dependencies handed to every call worker.
    pub workers: Arc<WorkerContext>,
    pub verifier: Arc<WebhookVerifier>,
    /// Default caller id for outbound dials.
    pub from_number: Option<String>,
}

/// Outbound integrations, injected so tests can substitute them.
pub struct Services {
    pub telephony: Arc<dyn TelephonyCommands>,
    pub chain: Arc<TranslationChain>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

impl AppState {
    pub fn new(pool: DbPool, config: &Config, services: Services) -> Self {
        let hub = Arc::new(StreamHub::new(config.pipeline.stream_settings()));
        let workers = Arc::new(WorkerContext {
            pool: pool.clone(),
            hub: Arc::clone(&hub),
            chain: services.chain,
            synthesizer: services.synthesizer,
            telephony: services.telephony,
            settings: WorkerSettings {
                buffer: config.pipeline.buffer_config(),
                flush_grace: Duration::from_millis(config.pipeline.flush_grace_ms),
                drain_deadline: Duration::from_millis(config.pipeline.drain_deadline_ms),
                command_timeout: Duration::from_millis(config.telephony.request_timeout_ms),
                playback_stall_timeout: Duration::from_secs(
                    config.voice.playback_stall_timeout_secs,
                ),
            },
        });
        Self {
            pool,
            hub,
            registry: Arc::new(CallRegistry::new(config.pipeline.queue_capacity)),
            workers,
            verifier: Arc::new(WebhookVerifier::new(
                config.webhook.secret.as_deref(),
                Duration::from_secs(config.webhook.tolerance_secs),
            )),
            from_number: config.telephony.from_number.clone(),
        }
    }
}

/// Maximum request body size (1 MiB). Webhook payloads are small JSON documents.
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Health check handler.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_calls": state.registry.len(),
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/webhooks/telephony",
            post(ingress::telephony_webhook_handler),
        )
        .route("/api/calls", post(api_calls::start_call_handler))
        .route("/api/calls/{callId}", get(api_calls::get_call_handler))
        .route(
            "/api/calls/{callId}/activity",
            get(api_calls::get_activity_handler),
        )
        .route(
            "/api/calls/{callId}/transcript",
            get(api_calls::get_transcript_handler),
        )
        .route(
            "/api/calls/{callId}/stream",
            get(api_stream::call_stream_handler),
        )
        .route(
            "/api/tenants/{tenantId}/translation-config",
            get(api_config::get_translation_config_handler)
                .put(api_config::put_translation_config_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
