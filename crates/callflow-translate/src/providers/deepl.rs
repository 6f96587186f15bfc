//! DeepL REST API (`/v2/translate`).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::TranslateError;
use crate::provider::TranslationProvider;

const NAME: &str = "deepl";

#[derive(Debug, Serialize)]
struct DeeplRequest<'a> {
    text: [&'a str; 1],
    source_lang: String,
    target_lang: String,
}

#[derive(Debug, Deserialize)]
struct DeeplResponse {
    translations: Vec<DeeplTranslation>,
}

#[derive(Debug, Deserialize)]
struct DeeplTranslation {
    text: String,
}

pub struct DeeplProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl DeeplProvider {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }
}

/// DeepL takes upper-case codes and wants a region on a few targets.
fn deepl_lang(code: &str, target: bool) -> String {
    let upper = code.to_ascii_uppercase();
    match (upper.as_str(), target) {
        ("EN", true) => "EN-US".to_string(),
        ("PT", true) => "PT-PT".to_string(),
        (_, false) => upper.split('-').next().unwrap_or_default().to_string(),
        _ => upper,
    }
}

fn first_translation(body: DeeplResponse) -> Result<String, TranslateError> {
    body.translations
        .into_iter()
        .next()
        .map(|t| t.text)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| TranslateError::EmptyResponse {
            provider: NAME.to_string(),
        })
}

#[async_trait]
impl TranslationProvider for DeeplProvider {
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
            .post(format!("{}/v2/translate", self.base_url))
            .header("Authorization", format!("DeepL-Auth-Key {}", self.api_key))
            .json(&DeeplRequest {
                text: [text],
                source_lang: deepl_lang(source_lang, false),
                target_lang: deepl_lang(target_lang, true),
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
        first_translation(response.json().await.map_err(http)?)
    }
}
