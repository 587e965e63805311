//! Embedding collaborator port.
//!
//! The engine only triggers embedding after a session completes with at
//! least one newly collected tweet; the embedding pipeline itself lives
//! outside this crate. The webhook implementation hands the session id
//! to that external service.

use anyhow::Result;
use async_trait::async_trait;

use crate::config::EmbeddingConfig;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embeddings for the tweets collected by one session.
    async fn embed_session(&self, session_id: i64) -> Result<()>;
}

/// No-op used when embedding is disabled in config.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    async fn embed_session(&self, _session_id: i64) -> Result<()> {
        Ok(())
    }
}

/// Notifies an external embedding service over HTTP.
pub struct WebhookEmbedder {
    client: reqwest::Client,
    url: String,
}

#[async_trait]
impl Embedder for WebhookEmbedder {
    async fn embed_session(&self, session_id: i64) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "session_id": session_id }))
            .send()
            .await?;
        response.error_for_status()?;
        Ok(())
    }
}

pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledEmbedder)),
        "webhook" => {
            let url = config
                .webhook_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("embedding.webhook_url is not set"))?;
            Ok(Box::new(WebhookEmbedder {
                client: reqwest::Client::new(),
                url,
            }))
        }
        other => anyhow::bail!("Unknown embedding provider: '{}'", other),
    }
}
