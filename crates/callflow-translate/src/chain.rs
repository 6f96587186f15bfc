//! Ordered provider fallback chain.
//!
//! Providers are tried in configured order. Each attempt is bounded by the
//! chain's per-provider timeout; a timeout or error moves on to the next
//! provider. A provider whose breaker is open is skipped without a request.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::breaker::CircuitBreaker;
use crate::error::TranslateError;
use crate::provider::TranslationProvider;

/// `provider_used` label when no provider produced a translation.
pub const PROVIDER_NONE: &str = "none";
/// `provider_used` label when source and target languages match.
pub const PROVIDER_PASSTHROUGH: &str = "passthrough";

/// Result of running one segment through the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TranslationOutcome {
    Translated {
        text: String,
        provider: String,
        latency_ms: u64,
    },
    /// Source and target are the same language; nothing was called.
    Passthrough,
    /// Every provider failed, timed out, or was skipped.
    Untranslated,
}

impl TranslationOutcome {
    pub fn provider_used(&self) -> &str {
        match self {
            Self::Translated { provider, .. } => provider,
            Self::Passthrough => PROVIDER_PASSTHROUGH,
            Self::Untranslated => PROVIDER_NONE,
        }
    }
}

struct Link {
    provider: Arc<dyn TranslationProvider>,
    breaker: CircuitBreaker,
}

/// Tuning shared by every link.
#[derive(Debug, Clone, Copy)]
pub struct ChainSettings {
    pub provider_timeout: Duration,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(3),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
        }
    }
}

pub struct TranslationChain {
    links: Vec<Link>,
    provider_timeout: Duration,
}

impl TranslationChain {
    pub fn new(providers: Vec<Arc<dyn TranslationProvider>>, settings: ChainSettings) -> Self {
        let links = providers
            .into_iter()
            .map(|provider| Link {
                provider,
                breaker: CircuitBreaker::new(
                    settings.breaker_threshold,
                    settings.breaker_cooldown,
                ),
            })
            .collect();
        Self {
            links,
            provider_timeout: settings.provider_timeout,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.links.iter().map(|l| l.provider.name()).collect()
    }

    pub async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> TranslationOutcome {
        if source_lang.eq_ignore_ascii_case(target_lang) {
            return TranslationOutcome::Passthrough;
        }

        for link in &self.links {
            let name = link.provider.name();
            if !link.breaker.allow(Instant::now()) {
                tracing::debug!(provider = name, "circuit open, skipping provider");
                continue;
            }

            let started = Instant::now();
            let attempt = tokio::time::timeout(
                self.provider_timeout,
                link.provider.translate(text, source_lang, target_lang),
            )
            .await
            .unwrap_or_else(|_| {
                Err(TranslateError::Timeout {
                    provider: name.to_string(),
                    timeout_ms: self.provider_timeout.as_millis() as u64,
                })
            });

            match attempt {
                Ok(translated) => {
                    link.breaker.record_success();
                    return TranslationOutcome::Translated {
                        text: translated,
                        provider: name.to_string(),
                        latency_ms: started.elapsed().as_millis() as u64,
                    };
                }
                Err(e) => {
                    tracing::warn!(provider = name, error = %e, "translation attempt failed");
                    if link.breaker.record_failure(Instant::now()) {
                        tracing::warn!(provider = name, "circuit opened");
                    }
                }
            }
        }

        TranslationOutcome::Untranslated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behaviour {
        Fail,
        Hang,
        Reply(&'static str),
    }

    struct MockProvider {
        name: &'static str,
        behaviour: Behaviour,
        calls: AtomicUsize,
    }

    impl MockProvider {
        fn new(name: &'static str, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                name,
                behaviour,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TranslationProvider for MockProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn translate(&self, _: &str, _: &str, _: &str) -> Result<String, TranslateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Fail => Err(TranslateError::EmptyResponse {
                    provider: self.name.to_string(),
                }),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!("the chain timeout fires first")
                }
                Behaviour::Reply(text) => Ok(text.to_string()),
            }
        }
    }

    fn chain(providers: Vec<Arc<MockProvider>>, threshold: u32) -> TranslationChain {
        TranslationChain::new(
            providers
                .into_iter()
                .map(|p| p as Arc<dyn TranslationProvider>)
                .collect(),
            ChainSettings {
                provider_timeout: Duration::from_millis(200),
                breaker_threshold: threshold,
                breaker_cooldown: Duration::from_secs(30),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn falls_through_to_tertiary() {
        let primary = MockProvider::new("primary", Behaviour::Fail);
        let secondary = MockProvider::new("secondary", Behaviour::Hang);
        let tertiary = MockProvider::new("tertiary", Behaviour::Reply("hello"));
        let chain = chain(vec![primary, secondary.clone(), tertiary], 5);

        let outcome = chain.translate("hola", "es", "en").await;
        match outcome {
            TranslationOutcome::Translated { text, provider, .. } => {
                assert_eq!(text, "hello");
                assert_eq!(provider, "tertiary");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn all_failing_is_untranslated() {
        let chain = chain(
            vec![
                MockProvider::new("a", Behaviour::Fail),
                MockProvider::new("b", Behaviour::Hang),
            ],
            5,
        );
        let outcome = chain.translate("hola", "es", "en").await;
        assert_eq!(outcome, TranslationOutcome::Untranslated);
        assert_eq!(outcome.provider_used(), PROVIDER_NONE);
    }

    #[tokio::test]
    async fn same_language_skips_providers() {
        let provider = MockProvider::new("a", Behaviour::Reply("x"));
        let chain = chain(vec![provider.clone()], 5);
        let outcome = chain.translate("hello", "en", "EN").await;
        assert_eq!(outcome.provider_used(), PROVIDER_PASSTHROUGH);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_skips_provider_until_cooldown() {
        let flaky = MockProvider::new("flaky", Behaviour::Fail);
        let backup = MockProvider::new("backup", Behaviour::Reply("hi"));
        let chain = chain(vec![flaky.clone(), backup], 2);

        for _ in 0..4 {
            let outcome = chain.translate("hola", "es", "en").await;
            assert_eq!(outcome.provider_used(), "backup");
        }
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2, "skipped once open");

        tokio::time::advance(Duration::from_secs(31)).await;
        chain.translate("hola", "es", "en").await;
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3, "trial after cooldown");
    }
}
