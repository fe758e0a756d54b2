//! Boundary to the external text-generation provider.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

/// Failure modes of a single generation attempt. `RateLimited` is the one
/// retryable case; everything else propagates to the caller immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("generation provider rate limited the request")]
    RateLimited,
    #[error("generation provider error: {0}")]
    Provider(String),
}

/// "Submit prompt, get completion text" — the only thing the core needs
/// from the provider. Concrete transports (HTTP clients, SDKs) live in the
/// service layer; tests use the generated mock.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError>;
}
