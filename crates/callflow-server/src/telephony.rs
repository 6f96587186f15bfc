//! Outbound telephony provider commands.
//!
//! The engine issues exactly four commands: dial a leg, bridge two legs,
//! play audio into a leg, and hang a leg up. Every request carries its own
//! timeout and is never retried here; the call worker decides what a failure
//! means for the call.

use async_trait::async_trait;
use callflow_voice::SynthesizedAudio;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelephonyError {
    #[error("{command} request failed: {source}")]
    Http {
        command: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{command} rejected with status {status}: {body}")]
    Status {
        command: &'static str,
        status: u16,
        body: String,
    },
    #[error("{command} returned an unusable response: {message}")]
    InvalidResponse {
        command: &'static str,
        message: String,
    },
    #[error("{command} timed out after {timeout_ms}ms")]
    Timeout {
        command: &'static str,
        timeout_ms: u64,
    },
    #[error("telephony client configuration: {0}")]
    Config(String),
}

/// A request to place one outbound leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRequest {
    /// Engine call id, echoed back by the provider on every event for the leg.
    pub call_id: String,
    pub to: String,
    pub from: Option<String>,
}

#[async_trait]
pub trait TelephonyCommands: Send + Sync {
    /// Dials a new leg and returns its provider leg id.
    async fn dial(&self, request: &DialRequest) -> Result<String, TelephonyError>;

    async fn bridge(&self, agent_leg_id: &str, customer_leg_id: &str)
        -> Result<(), TelephonyError>;

    async fn play(
        &self,
        leg_id: &str,
        playback_id: &str,
        audio: &SynthesizedAudio,
    ) -> Result<(), TelephonyError>;

    async fn hangup(&self, leg_id: &str) -> Result<(), TelephonyError>;
}

/// Bounds a command future by `timeout`.
pub(crate) async fn with_timeout<T>(
    command: &'static str,
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, TelephonyError>>,
) -> Result<T, TelephonyError> {
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| {
            Err(TelephonyError::Timeout {
                command,
                timeout_ms: timeout.as_millis() as u64,
            })
        })
}

/// JSON-over-HTTP client for the provider's command API.
pub struct HttpTelephony {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    webhook_url: Option<String>,
}

#[derive(Serialize)]
struct DialBody<'a> {
    to: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<&'a str>,
    client_state: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook_url: Option<&'a str>,
}

#[derive(Deserialize)]
struct DialResponse {
    leg_id: String,
}

#[derive(Serialize)]
struct BridgeBody<'a> {
    other_leg_id: &'a str,
}

#[derive(Serialize)]
struct PlayBody<'a> {
    playback_id: &'a str,
    encoding: &'static str,
    sample_rate: u32,
    audio_base64: String,
}

impl HttpTelephony {
    /// # Errors
    ///
    /// Returns `TelephonyError::Config` if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        webhook_url: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, TelephonyError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TelephonyError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            webhook_url,
        })
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        command: &'static str,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, TelephonyError> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|source| TelephonyError::Http { command, source })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TelephonyError::Status {
                command,
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl TelephonyCommands for HttpTelephony {
    async fn dial(&self, request: &DialRequest) -> Result<String, TelephonyError> {
        const COMMAND: &str = "dial";
        let response = self
            .post(
                COMMAND,
                "/v1/calls",
                &DialBody {
                    to: &request.to,
                    from: request.from.as_deref(),
                    client_state: &request.call_id,
                    webhook_url: self.webhook_url.as_deref(),
                },
            )
            .await?;
        let parsed: DialResponse =
            response
                .json()
                .await
                .map_err(|e| TelephonyError::InvalidResponse {
                    command: COMMAND,
                    message: e.to_string(),
                })?;
        if parsed.leg_id.is_empty() {
            return Err(TelephonyError::InvalidResponse {
                command: COMMAND,
                message: "empty leg_id".to_string(),
            });
        }
        Ok(parsed.leg_id)
    }

    async fn bridge(
        &self,
        agent_leg_id: &str,
        customer_leg_id: &str,
    ) -> Result<(), TelephonyError> {
        self.post(
            "bridge",
            &format!("/v1/legs/{agent_leg_id}/actions/bridge"),
            &BridgeBody {
                other_leg_id: customer_leg_id,
            },
        )
        .await?;
        Ok(())
    }

    async fn play(
        &self,
        leg_id: &str,
        playback_id: &str,
        audio: &SynthesizedAudio,
    ) -> Result<(), TelephonyError> {
        self.post(
            "play",
            &format!("/v1/legs/{leg_id}/actions/play"),
            &PlayBody {
                playback_id,
                encoding: "pcm_s16le",
                sample_rate: audio.sample_rate,
                audio_base64: audio.to_base64(),
            },
        )
        .await?;
        Ok(())
    }

    async fn hangup(&self, leg_id: &str) -> Result<(), TelephonyError> {
        self.post(
            "hangup",
            &format!("/v1/legs/{leg_id}/actions/hangup"),
            &serde_json::json!({}),
        )
        .await?;
        Ok(())
    }
}
