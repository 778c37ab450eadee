//! Model gateway: the single boundary between the pipeline and a hosted
//! language model.
//!
//! The pipeline only sees [`ModelGateway::complete`], which classifies every
//! call into one of four [`ModelOutcome`]s. Retry and correction policy live
//! in the caller; the gateway only reports what happened.

mod gemini;
mod models;
mod parse;

use std::time::Duration;

use async_trait::async_trait;
use matflow_schema::SchemaContract;

pub use gemini::{GatewaySettings, GeminiGateway};
pub use models::{MODEL_ALIASES, PREFERRED_MODELS, normalize_model_name, pick_model};
pub use parse::{parse_json_document, strip_code_fence};

/// A parsed model document plus call metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub document: serde_json::Value,
    /// Provider call id (or a generated one when the provider sends none).
    pub call_id: String,
    /// Model that actually served the call.
    pub model: String,
}

/// Classified result of one `complete` call.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutcome {
    /// The model returned a parseable JSON document. It has not been validated.
    Success(ModelResponse),
    /// The provider asked us to slow down, optionally saying for how long.
    RateLimited { retry_after: Option<Duration> },
    /// Timeouts, connection drops, 5xx. Worth retrying.
    TransientFailure(String),
    /// Auth failures, malformed requests, policy refusals, persistent garbage.
    PermanentFailure(String),
}

impl ModelOutcome {
    /// Short label for logs and stats.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::RateLimited { .. } => "rate_limited",
            Self::TransientFailure(_) => "transient",
            Self::PermanentFailure(_) => "permanent",
        }
    }
}

/// Asynchronous structured-output completion.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Ask the model for a JSON document shaped by `contract`.
    async fn complete(
        &self,
        prompt: &str,
        contract: &SchemaContract,
        timeout: Duration,
    ) -> ModelOutcome;

    /// Model identifier recorded on artifacts.
    fn model_id(&self) -> &str;
}
