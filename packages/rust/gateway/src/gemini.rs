//! Gemini `generateContent` client with structured JSON output.

use std::time::Duration;

use async_trait::async_trait;
use matflow_schema::SchemaContract;
use matflow_shared::{GeminiConfig, MatflowError, Result};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::models::{normalize_model_name, pick_model};
use crate::parse::parse_json_document;
use crate::{ModelGateway, ModelOutcome, ModelResponse};

/// User-Agent string for model requests.
const USER_AGENT: &str = concat!("matflow/", env!("CARGO_PKG_VERSION"));

/// Appended when the previous reply could not be parsed as JSON.
const JSON_ONLY_REMINDER: &str =
    "\n\nYour previous reply was not valid JSON. Return only the final JSON output.";

/// Finish reasons that mean the provider refused the content.
const POLICY_FINISH_REASONS: &[&str] = &["SAFETY", "PROHIBITED_CONTENT", "BLOCKLIST", "SPII", "RECITATION"];

/// Schema keywords that are ours and must not be sent to the provider.
const LOCAL_SCHEMA_KEYWORDS: &[&str] = &["$version", "x-permissive"];

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Connection settings for [`GeminiGateway`].
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub base_url: String,
    pub api_version: String,
    pub model: String,
    pub api_key: String,
    /// Extra calls spent on replies that are not JSON at all.
    pub parse_retries: u32,
}

impl GatewaySettings {
    /// Settings from the `[gemini]` config section and a resolved key.
    pub fn from_config(config: &GeminiConfig, api_key: impl Into<String>) -> Self {
        Self {
            base_url: config.base_url.clone(),
            api_version: config.api_version.clone(),
            model: normalize_model_name(&config.model),
            api_key: api_key.into(),
            parse_retries: config.parse_retries,
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Raw result of one HTTP exchange, before parse retries.
enum Exchange {
    Text { text: String, call_id: Option<String>, model: Option<String> },
    Classified(ModelOutcome),
}

/// HTTP gateway to the Gemini API.
pub struct GeminiGateway {
    client: Client,
    root: Url,
    api_version: String,
    model: String,
    api_key: String,
    parse_retries: u32,
}

impl GeminiGateway {
    pub fn new(settings: GatewaySettings) -> Result<Self> {
        let root = Url::parse(settings.base_url.trim_end_matches('/')).map_err(|e| {
            MatflowError::config(format!("invalid model base_url '{}': {e}", settings.base_url))
        })?;
        if settings.api_key.trim().is_empty() {
            return Err(MatflowError::config("model API key is empty"));
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| MatflowError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            root,
            api_version: settings.api_version,
            model: normalize_model_name(&settings.model),
            api_key: settings.api_key,
            parse_retries: settings.parse_retries,
        })
    }

    fn endpoint(&self, suffix: &str) -> String {
        format!(
            "{}/{}/{}",
            self.root.as_str().trim_end_matches('/'),
            self.api_version,
            suffix
        )
    }

    /// List model ids that support `generateContent`.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = self.endpoint("models");
        let response = self
            .client
            .get(&url)
            .header("x-goog-api-key", &self.api_key)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| MatflowError::TransientModel(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MatflowError::PermanentModel(format!("{url}: HTTP {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| MatflowError::parse(format!("model listing: {e}")))?;

        Ok(body["models"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter(|m| supports_generate(m))
                    .filter_map(|m| m["name"].as_str())
                    .map(normalize_model_name)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Swap the configured model for one the provider actually serves.
    /// Listing failures keep the configured model.
    pub async fn resolve_model(&mut self) {
        match self.list_models().await {
            Ok(available) => {
                let chosen = pick_model(&self.model, &available);
                if chosen != self.model {
                    warn!(requested = %self.model, chosen = %chosen, "requested model not available");
                }
                self.model = chosen;
            }
            Err(e) => {
                debug!(error = %e, "model listing failed, keeping configured model");
            }
        }
    }

    async fn exchange(&self, prompt: &str, contract: &SchemaContract, timeout: Duration) -> Exchange {
        let url = self.endpoint(&format!("models/{}:generateContent", self.model));
        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseJsonSchema": wire_schema(&contract.document),
            }
        });

        let response = match self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Exchange::Classified(ModelOutcome::TransientFailure(format!(
                    "timed out after {}s",
                    timeout.as_secs_f64()
                )));
            }
            Err(e) => {
                return Exchange::Classified(ModelOutcome::TransientFailure(format!(
                    "request failed: {e}"
                )));
            }
        };

        let status = response.status();
        let retry_after_header = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64);

        let text = match response.text().await {
            Ok(t) => t,
            Err(e) => {
                return Exchange::Classified(ModelOutcome::TransientFailure(format!(
                    "failed to read response body: {e}"
                )));
            }
        };

        if !status.is_success() {
            return Exchange::Classified(classify_status(status, retry_after_header, &text));
        }

        let payload: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                return Exchange::Classified(ModelOutcome::TransientFailure(format!(
                    "malformed response envelope: {e}"
                )));
            }
        };

        if let Some(reason) = payload["promptFeedback"]["blockReason"].as_str() {
            return Exchange::Classified(ModelOutcome::PermanentFailure(format!(
                "prompt blocked: {reason}"
            )));
        }

        let candidate = &payload["candidates"][0];
        if let Some(reason) = candidate["finishReason"].as_str() {
            if POLICY_FINISH_REASONS.contains(&reason) {
                return Exchange::Classified(ModelOutcome::PermanentFailure(format!(
                    "response withheld: {reason}"
                )));
            }
        }

        let text: String = candidate["content"]["parts"]
            .as_array()
            .map(|parts| parts.iter().filter_map(|p| p["text"].as_str()).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Exchange::Classified(ModelOutcome::TransientFailure(
                "empty response".into(),
            ));
        }

        Exchange::Text {
            text,
            call_id: payload["responseId"].as_str().map(String::from),
            model: payload["modelVersion"].as_str().map(String::from),
        }
    }
}

#[async_trait]
impl ModelGateway for GeminiGateway {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn complete(
        &self,
        prompt: &str,
        contract: &SchemaContract,
        timeout: Duration,
    ) -> ModelOutcome {
        let mut current = prompt.to_string();

        for attempt in 0..=self.parse_retries {
            match self.exchange(&current, contract, timeout).await {
                Exchange::Classified(outcome) => {
                    debug!(outcome = outcome.kind(), "model call classified");
                    return outcome;
                }
                Exchange::Text { text, call_id, model } => {
                    if let Some(document) = parse_json_document(&text) {
                        return ModelOutcome::Success(ModelResponse {
                            document,
                            call_id: call_id.unwrap_or_else(|| Uuid::now_v7().to_string()),
                            model: model.unwrap_or_else(|| self.model.clone()),
                        });
                    }
                    info!(attempt, "model reply was not JSON, re-prompting");
                    current = format!("{prompt}{JSON_ONLY_REMINDER}");
                }
            }
        }

        ModelOutcome::PermanentFailure(format!(
            "unparseable model output after {} attempts",
            self.parse_retries + 1
        ))
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn supports_generate(model: &Value) -> bool {
    match model["supportedGenerationMethods"].as_array() {
        Some(methods) => methods.iter().any(|m| m == "generateContent"),
        None => true,
    }
}

/// Copy of the schema without matflow-only keywords.
fn wire_schema(document: &Value) -> Value {
    let mut schema = document.clone();
    if let Some(map) = schema.as_object_mut() {
        for key in LOCAL_SCHEMA_KEYWORDS {
            map.remove(*key);
        }
    }
    schema
}

/// Map a non-2xx status to an outcome.
fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ModelOutcome {
    let message = error_message(body).unwrap_or_else(|| status.to_string());
    match status.as_u16() {
        429 => ModelOutcome::RateLimited {
            retry_after: retry_after.or_else(|| retry_delay_from_body(body)),
        },
        408 | 500 | 502 | 503 | 504 => {
            ModelOutcome::TransientFailure(format!("HTTP {}: {message}", status.as_u16()))
        }
        code => ModelOutcome::PermanentFailure(format!("HTTP {code}: {message}")),
    }
}

fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value["error"]["message"].as_str().map(String::from)
}

/// Read `retryDelay: "12s"` from a Google RPC `RetryInfo` detail.
fn retry_delay_from_body(body: &str) -> Option<Duration> {
    let value: Value = serde_json::from_str(body).ok()?;
    value["error"]["details"]
        .as_array()?
        .iter()
        .filter_map(|d| d["retryDelay"].as_str())
        .find_map(|delay| {
            delay
                .trim()
                .strip_suffix('s')?
                .parse::<f64>()
                .ok()
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64)
        })
}
