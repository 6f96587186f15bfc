//! Any OpenAI-compatible chat-completions endpoint used as a translator.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::TranslateError;
use crate::provider::TranslationProvider;

const NAME: &str = "openai";

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

fn build_messages(text: &str, source_lang: &str, target_lang: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage {
            role: "system",
            content: format!(
                "Translate the user's message from {source_lang} to {target_lang}. \
                 Reply with the translation only, no quotes or commentary."
            ),
        },
        ChatMessage {
            role: "user",
            content: text.to_string(),
        },
    ]
}

fn reply_text(body: ChatResponse) -> Result<String, TranslateError> {
    body.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| TranslateError::EmptyResponse {
            provider: NAME.to_string(),
        })
}

#[async_trait]
impl TranslationProvider for OpenAiProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String, TranslateError> {
        let http = |source| TranslateError::Http {
            provider: NAME.to_string(),
            source,
        };
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&ChatRequest {
                model: &self.model,
                messages: build_messages(text, source_lang, target_lang),
                temperature: 0.0,
            })
            .send()
            .await
            .map_err(http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranslateError::Status {
                provider: NAME.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        reply_text(response.json().await.map_err(http)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_names_both_languages() {
        let messages = build_messages("hola", "es", "en");
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("from es to en"));
        assert_eq!(messages[1].content, "hola");
    }

    #[test]
    fn reply_is_trimmed_and_must_be_non_empty() {
        let body: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":" hello \n"}}]}"#).unwrap();
        assert_eq!(reply_text(body).unwrap(), "hello");

        let blank: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"  "}}]}"#).unwrap();
        assert!(reply_text(blank).is_err());
    }
}
