//! Shared harness for server integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use callflow_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use callflow_server::config::Config;
use callflow_server::signature::{sign, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use callflow_server::telephony::{DialRequest, TelephonyCommands, TelephonyError};
use callflow_server::{app, AppState, Services};
use callflow_translate::{ChainSettings, TranslateError, TranslationChain, TranslationProvider};
use callflow_voice::{SpeechSynthesizer, SynthesizedAudio, VoiceError};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tower::ServiceExt;

pub const SECRET: &str = "whsec_test";
pub const AGENT_NUMBER: &str = "+15555550100";
pub const CUSTOMER_NUMBER: &str = "+15555550101";

/// A command the engine sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issued {
    Dial { call_id: String, to: String, leg_id: String },
    Bridge { agent: String, customer: String },
    Play { leg_id: String, playback_id: String },
    Hangup { leg_id: String },
}

#[derive(Default)]
pub struct MockTelephony {
    issued: Mutex<Vec<Issued>>,
    next_leg: AtomicU64,
    pub fail_dial: AtomicBool,
    pub panic_on_dial: AtomicBool,
}

impl MockTelephony {
    pub fn issued(&self) -> Vec<Issued> {
        self.issued.lock().unwrap().clone()
    }

    pub fn plays(&self) -> Vec<(String, String)> {
        self.issued()
            .into_iter()
            .filter_map(|c| match c {
                Issued::Play { leg_id, playback_id } => Some((leg_id, playback_id)),
                _ => None,
            })
            .collect()
    }

    fn push(&self, command: Issued) {
        self.issued.lock().unwrap().push(command);
    }
}

#[async_trait]
impl TelephonyCommands for MockTelephony {
    async fn dial(&self, request: &DialRequest) -> Result<String, TelephonyError> {
        if self.panic_on_dial.load(Ordering::SeqCst) {
            panic!("mock telephony asked to panic");
        }
        if self.fail_dial.load(Ordering::SeqCst) {
            return Err(TelephonyError::Status {
                command: "dial",
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        let leg_id = format!("leg-{}", self.next_leg.fetch_add(1, Ordering::SeqCst) + 1);
        self.push(Issued::Dial {
            call_id: request.call_id.clone(),
            to: request.to.clone(),
            leg_id: leg_id.clone(),
        });
        Ok(leg_id)
    }

    async fn bridge(&self, agent: &str, customer: &str) -> Result<(), TelephonyError> {
        self.push(Issued::Bridge {
            agent: agent.to_string(),
            customer: customer.to_string(),
        });
        Ok(())
    }

    async fn play(
        &self,
        leg_id: &str,
        playback_id: &str,
        _audio: &SynthesizedAudio,
    ) -> Result<(), TelephonyError> {
        self.push(Issued::Play {
            leg_id: leg_id.to_string(),
            playback_id: playback_id.to_string(),
        });
        Ok(())
    }

    async fn hangup(&self, leg_id: &str) -> Result<(), TelephonyError> {
        self.push(Issued::Hangup {
            leg_id: leg_id.to_string(),
        });
        Ok(())
    }
}

/// Translates from a fixed phrasebook; unknown text fails.
pub struct Phrasebook {
    phrases: HashMap<&'static str, &'static str>,
    delay: Duration,
}

impl Phrasebook {
    pub fn spanish(delay: Duration) -> Self {
        let phrases = HashMap::from([
            ("hola", "hello"),
            ("cómo estás", "how are you"),
            ("muy bien", "very well"),
            ("gracias", "thank you"),
        ]);
        Self { phrases, delay }
    }
}

#[async_trait]
impl TranslationProvider for Phrasebook {
    fn name(&self) -> &str {
        "phrasebook"
    }

    async fn translate(&self, text: &str, _: &str, _: &str) -> Result<String, TranslateError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.phrases
            .get(text)
            .map(|t| t.to_string())
            .ok_or_else(|| TranslateError::EmptyResponse {
                provider: "phrasebook".to_string(),
            })
    }
}

pub struct ToneSynthesizer;

#[async_trait]
impl SpeechSynthesizer for ToneSynthesizer {
    fn name(&self) -> &str {
        "tone"
    }

    async fn synthesize(&self, text: &str, _lang: &str) -> Result<SynthesizedAudio, VoiceError> {
        Ok(SynthesizedAudio {
            pcm: text.as_bytes().to_vec(),
            sample_rate: 16_000,
        })
    }
}

/// Settings tuned so tests finish quickly.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.webhook.secret = Some(SECRET.to_string());
    config.pipeline.reorder_window_ms = 300;
    config.pipeline.flush_grace_ms = 100;
    config.pipeline.drain_deadline_ms = 1_000;
    config.telephony.request_timeout_ms = 1_000;
    config.voice.playback_stall_timeout_secs = 30;
    config
}

pub struct Harness {
    pub state: AppState,
    pub telephony: Arc<MockTelephony>,
    pub pool: DbPool,
    translation_delay: Duration,
    _dir: TempDir,
}

fn build_state(pool: &DbPool, telephony: &Arc<MockTelephony>, delay: Duration) -> AppState {
    let phrasebook: Arc<dyn TranslationProvider> = Arc::new(Phrasebook::spanish(delay));
    let chain = Arc::new(TranslationChain::new(vec![phrasebook], ChainSettings::default()));
    AppState::new(
        pool.clone(),
        &test_config(),
        Services {
            telephony: telephony.clone(),
            chain,
            synthesizer: Arc::new(ToneSynthesizer),
        },
    )
}

impl Harness {
    pub fn new() -> Self {
        Self::with_translation_delay(Duration::ZERO)
    }

    pub fn with_translation_delay(delay: Duration) -> Self {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("callflow.db");
        let pool = create_pool(
            path.to_str().expect("path should be utf-8"),
            DbRuntimeSettings::default(),
        )
        .expect("pool should be created");
        {
            let conn = pool.get().expect("connection should be available");
            run_migrations(&conn).expect("migrations should succeed");
        }

        let telephony = Arc::new(MockTelephony::default());
        let state = build_state(&pool, &telephony, delay);
        Self {
            state,
            telephony,
            pool,
            translation_delay: delay,
            _dir: dir,
        }
    }

    /// Replaces the engine with a fresh one over the same database, as a
    /// process restart would. Workers of the old engine are left running but
    /// receive no further events.
    pub fn restart(&mut self) {
        self.state = build_state(&self.pool, &self.telephony, self.translation_delay);
    }

    pub fn app(&self) -> Router {
        app(self.state.clone())
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = self
            .app()
            .oneshot(builder.body(body).expect("request should build"))
            .await
            .expect("router should respond");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    /// Delivers a correctly signed webhook.
    pub async fn webhook(&self, id: &str, event_type: &str, payload: Value) -> (StatusCode, Value) {
        let body = json!({ "id": id, "event_type": event_type, "payload": payload }).to_string();
        self.raw_webhook(body.into_bytes(), Some(SECRET)).await
    }

    pub async fn raw_webhook(&self, body: Vec<u8>, secret: Option<&str>) -> (StatusCode, Value) {
        let now = chrono::Utc::now().timestamp();
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/webhooks/telephony")
            .header("content-type", "application/json");
        if let Some(secret) = secret {
            builder = builder
                .header(TIMESTAMP_HEADER, now.to_string())
                .header(SIGNATURE_HEADER, sign(secret, now, &body).expect("should sign"));
        }
        let response = self
            .app()
            .oneshot(builder.body(Body::from(body)).expect("request should build"))
            .await
            .expect("router should respond");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    pub async fn set_translation(&self, tenant_id: &str, source: &str, target: &str, voice: bool) {
        let (status, _) = self
            .request(
                Method::PUT,
                &format!("/api/tenants/{tenant_id}/translation-config"),
                Some(json!({
                    "translation_enabled": true,
                    "source_lang": source,
                    "target_lang": target,
                    "voice_to_voice": voice,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    /// Starts a call through the API and returns its id.
    pub async fn start_call(&self, flow_type: &str) -> String {
        let mut body = json!({
            "tenant_id": "t1",
            "flow_type": flow_type,
            "agent_number": AGENT_NUMBER,
        });
        if flow_type == "bridge" {
            body["customer_number"] = json!(CUSTOMER_NUMBER);
        }
        let (status, json) = self.request(Method::POST, "/api/calls", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED, "start call failed: {json}");
        json["call_id"].as_str().expect("call_id should be returned").to_string()
    }

    pub async fn call(&self, call_id: &str) -> Value {
        let (status, json) = self
            .request(Method::GET, &format!("/api/calls/{call_id}"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        json
    }

    pub async fn wait_for_status(&self, call_id: &str, status: &str) -> Value {
        for _ in 0..250 {
            let call = self.call(call_id).await;
            if call["status"] == status {
                return call;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("call {call_id} never reached {status}: {}", self.call(call_id).await);
    }

    /// Waits until the call's worker has exited.
    pub async fn wait_until_idle(&self, call_id: &str) {
        wait_for("worker to stop", || !self.state.registry.is_running(call_id)).await;
    }

    pub async fn activity_kinds(&self, call_id: &str) -> Vec<String> {
        let (status, json) = self
            .request(Method::GET, &format!("/api/calls/{call_id}/activity"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        json["entries"]
            .as_array()
            .expect("entries should be an array")
            .iter()
            .filter_map(|e| e["kind"].as_str().map(str::to_string))
            .collect()
    }
}

pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn leg(call_id: &str, leg_id: &str) -> Value {
    json!({ "call_id": call_id, "leg_id": leg_id })
}

pub fn utterance(call_id: &str, leg_id: &str, sequence: u64, speaker: &str, text: &str) -> Value {
    json!({
        "call_id": call_id,
        "leg_id": leg_id,
        "sequence": sequence,
        "speaker": speaker,
        "text": text,
        "confidence": 0.9,
    })
}

/// Serves the app on an ephemeral port and returns its base URL.
pub async fn spawn_server(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have an address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server should run");
    });
    format!("http://{addr}")
}

#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: String,
    pub id: Option<String>,
    pub data: Value,
}

/// Minimal SSE reader over a streaming reqwest response.
pub struct SseClient {
    response: reqwest::Response,
    buffer: String,
}

impl SseClient {
    pub async fn connect(url: &str, last_event_id: Option<u64>) -> Self {
        let mut request = reqwest::Client::new().get(url);
        if let Some(id) = last_event_id {
            request = request.header("last-event-id", id.to_string());
        }
        let response = request.send().await.expect("stream should connect");
        assert!(
            response.status().is_success(),
            "stream returned {}",
            response.status()
        );
        Self {
            response,
            buffer: String::new(),
        }
    }

    pub async fn next_event(&mut self) -> SseEvent {
        tokio::time::timeout(Duration::from_secs(5), self.read_event())
            .await
            .expect("timed out waiting for SSE event")
    }

    async fn read_event(&mut self) -> SseEvent {
        loop {
            if let Some(pos) = self.buffer.find("\n\n") {
                let block: String = self.buffer.drain(..pos + 2).collect();
                if let Some(event) = parse_block(&block) {
                    return event;
                }
                continue;
            }
            let chunk = self
                .response
                .chunk()
                .await
                .expect("chunk should be readable")
                .expect("stream ended before the next event");
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut id = None;
    let mut data = String::new();
    for line in block.lines() {
        if let Some(v) = line.strip_prefix("event:") {
            event = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("id:") {
            id = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("data:") {
            data.push_str(v.trim_start());
        }
    }
    let event = event?;
    Some(SseEvent {
        event,
        id,
        data: serde_json::from_str(&data).unwrap_or(Value::Null),
    })
}
