//! Provider client factory.
//!
//! The worker core compiles one pair of clients per (provider, model, token)
//! key and caches them in the session resources; the factory is where the
//! provider name is resolved to a concrete implementation.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Client;

use super::anthropic::AnthropicClient;
use super::error::LlmError;
use super::openai::OpenAiCompatibleClient;
use super::provider::{ChatModel, TitleModel};

/// Default base URLs for each provider.
pub mod defaults {
    pub const OPENAI: &str = "https://api.openai.com/v1";
    pub const GEMINI: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
    pub const CLAUDE: &str = "https://api.anthropic.com";
}

/// The compiled clients for one session's resources.
pub struct SessionClients {
    pub chat: Arc<dyn ChatModel>,
    pub assist: Arc<dyn TitleModel>,
}

impl std::fmt::Debug for SessionClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClients").finish_non_exhaustive()
    }
}

/// Builds provider clients from a (provider, model, token) triple.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, provider: &str, model: &str, token: &str) -> Result<SessionClients, LlmError>;
}

/// Factory backed by the real HTTP clients.
///
/// Holds one shared `reqwest::Client` so every compiled client pools
/// connections, and optional per-provider base-url overrides from config.
pub struct ClientFactory {
    client: Client,
    base_urls: HashMap<String, String>,
}

impl ClientFactory {
    #[must_use]
    pub fn new(base_urls: HashMap<String, String>) -> Self {
        Self {
            client: Client::new(),
            base_urls,
        }
    }

    fn base_url(&self, provider: &str, fallback: &str) -> String {
        self.base_urls
            .get(provider)
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    }
}

impl Default for ClientFactory {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl ProviderFactory for ClientFactory {
    fn build(&self, provider: &str, model: &str, token: &str) -> Result<SessionClients, LlmError> {
        if token.is_empty() {
            return Err(LlmError::MissingCredentials(provider.to_string()));
        }

        match provider {
            "openai" | "gemini" => {
                let fallback = if provider == "openai" {
                    defaults::OPENAI
                } else {
                    defaults::GEMINI
                };
                let client = Arc::new(OpenAiCompatibleClient::new(
                    self.client.clone(),
                    self.base_url(provider, fallback),
                    token.to_string(),
                    model.to_string(),
                ));
                Ok(SessionClients {
                    chat: client.clone(),
                    assist: client,
                })
            }
            "claude" => {
                let client = Arc::new(AnthropicClient::new(
                    self.client.clone(),
                    self.base_url(provider, defaults::CLAUDE),
                    token.to_string(),
                    model.to_string(),
                ));
                Ok(SessionClients {
                    chat: client.clone(),
                    assist: client,
                })
            }
            other => Err(LlmError::UnknownProvider(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_providers_build() {
        let factory = ClientFactory::default();
        for provider in ["openai", "gemini", "claude"] {
            assert!(factory.build(provider, "m", "tok").is_ok(), "{provider}");
        }
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let factory = ClientFactory::default();
        let err = factory.build("mystery", "m", "tok").unwrap_err();
        assert!(matches!(err, LlmError::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn empty_token_is_rejected() {
        let factory = ClientFactory::default();
        let err = factory.build("openai", "m", "").unwrap_err();
        assert!(matches!(err, LlmError::MissingCredentials(_)));
    }
}
