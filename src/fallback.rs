//! External step classifier for pages the local signals cannot settle.
//!
//! The pipeline only sees the [`StepClassifier`] trait. Tests plug in
//! deterministic stubs; production uses [`HttpStepClassifier`] wrapped in
//! [`RetryingFallback`].

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::FallbackPolicy;
use crate::error::FallbackError;
use crate::logging::FALLBACK;
use crate::patterns::{PageType, StepId};

/// Normalized page text sent out is cut to this many characters.
pub const MAX_PROMPT_CHARS: usize = 2500;

pub const ENV_ENDPOINT: &str = "SCANX_LLM_ENDPOINT";
pub const ENV_API_KEY: &str = "SCANX_LLM_API_KEY";
pub const ENV_MODEL: &str = "SCANX_LLM_MODEL";

const DEFAULT_MODEL: &str = "gpt-4o-mini";

static JSON_OBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{[^{}]*\}").expect("invalid JSON object regex"));

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateHint {
    pub page_type: PageType,
    pub step: Option<StepId>,
    pub confidence: f64,
}

/// One uncertain page, as handed to the external classifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationRequest {
    pub document_id: String,
    pub page_number: u32,
    /// Normalized text, at most [`MAX_PROMPT_CHARS`] characters.
    pub text: String,
    pub candidates: Vec<CandidateHint>,
    pub slot: Option<u32>,
    pub slot_step: Option<StepId>,
    /// Steps a verdict may name, `unmapped` included.
    pub allowed_steps: Vec<StepId>,
}

impl EscalationRequest {
    pub fn truncate_text(text: &str) -> String {
        text.chars().take(MAX_PROMPT_CHARS).collect()
    }

    pub fn allows(&self, step: &StepId) -> bool {
        step.is_unmapped() || self.allowed_steps.contains(step)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiVerdict {
    pub step: StepId,
    pub confidence: f64,
}

#[async_trait]
pub trait StepClassifier: Send + Sync {
    async fn classify(&self, request: &EscalationRequest) -> Result<AiVerdict, FallbackError>;

    fn name(&self) -> &str;
}

/// Regex-only mode: every escalation fails fast and the local answer stands.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFallback;

#[async_trait]
impl StepClassifier for NoFallback {
    async fn classify(&self, _request: &EscalationRequest) -> Result<AiVerdict, FallbackError> {
        Err(FallbackError::Unavailable)
    }

    fn name(&self) -> &str {
        "none"
    }
}

/// Per-attempt timeout plus bounded exponential backoff around any
/// classifier.
#[derive(Clone)]
pub struct RetryingFallback {
    inner: Arc<dyn StepClassifier>,
    policy: FallbackPolicy,
}

impl RetryingFallback {
    pub fn new(inner: Arc<dyn StepClassifier>, policy: FallbackPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl StepClassifier for RetryingFallback {
    async fn classify(&self, request: &EscalationRequest) -> Result<AiVerdict, FallbackError> {
        let mut attempt = 0u32;
        loop {
            let result =
                match tokio::time::timeout(self.policy.timeout(), self.inner.classify(request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(FallbackError::Timeout(self.policy.timeout_ms)),
                };

            match result {
                Ok(verdict) => {
                    debug!(
                        target: FALLBACK,
                        page = request.page_number,
                        attempt,
                        step = %verdict.step,
                        "verdict received"
                    );
                    return Ok(verdict);
                }
                Err(err) if err.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        target: FALLBACK,
                        page = request.page_number,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "fallback attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f64,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    step: String,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Pull the first flat JSON object out of a chat reply and validate it.
pub fn parse_verdict(reply: &str, request: &EscalationRequest) -> Result<AiVerdict, FallbackError> {
    let object = JSON_OBJECT
        .find(reply)
        .ok_or_else(|| FallbackError::Malformed("no JSON object in reply".to_string()))?;
    let raw: RawVerdict = serde_json::from_str(object.as_str())
        .map_err(|e| FallbackError::Malformed(e.to_string()))?;

    let step = StepId::new(raw.step.trim());
    if !request.allows(&step) {
        return Err(FallbackError::UnknownStep(step.to_string()));
    }
    let confidence = raw.confidence.unwrap_or(0.5);
    if !confidence.is_finite() {
        return Err(FallbackError::Malformed(format!(
            "confidence {} is not a number",
            confidence
        )));
    }
    Ok(AiVerdict {
        step,
        confidence: confidence.clamp(0.0, 1.0),
    })
}

fn render_prompt(request: &EscalationRequest) -> String {
    let candidates = request
        .candidates
        .iter()
        .map(|c| {
            format!(
                "- {} (step: {}, confidence {:.2})",
                c.page_type,
                c.step.as_ref().map_or("none", StepId::as_str),
                c.confidence
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let allowed = request
        .allowed_steps
        .iter()
        .map(StepId::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Page {} of a Thai asset and liability disclosure form.\n\
         Local candidates:\n{}\n\
         Aligned template slot: {} (step {}).\n\
         Allowed steps: {}, unmapped.\n\
         Reply with JSON only: {{\"step\": \"...\", \"confidence\": 0.0}}\n\n\
         Page text:\n{}",
        request.page_number,
        if candidates.is_empty() { "- none".to_string() } else { candidates },
        request.slot.map_or("none".to_string(), |s| s.to_string()),
        request.slot_step.as_ref().map_or("none", StepId::as_str),
        allowed,
        request.text
    )
}

/// OpenAI-compatible chat-completions client.
#[derive(Debug, Clone)]
pub struct HttpStepClassifier {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl HttpStepClassifier {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
        }
    }

    /// Built from `SCANX_LLM_*`; `None` when no endpoint is configured.
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var(ENV_ENDPOINT).ok().filter(|e| !e.trim().is_empty())?;
        let api_key = std::env::var(ENV_API_KEY).ok().filter(|k| !k.is_empty());
        let model = std::env::var(ENV_MODEL).unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        info!(target: FALLBACK, endpoint = %endpoint, model = %model, "external classifier configured");
        Some(Self::new(endpoint, api_key, model))
    }
}

#[async_trait]
impl StepClassifier for HttpStepClassifier {
    async fn classify(&self, request: &EscalationRequest) -> Result<AiVerdict, FallbackError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: "You route scanned form pages to extraction steps.".to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: render_prompt(request),
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                r#type: "json_object".to_string(),
            },
        };

        let mut call = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }
        let response = call.send().await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FallbackError::QuotaExhausted);
        }
        if !status.is_success() {
            return Err(FallbackError::Status(status.as_u16()));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| FallbackError::Malformed(e.to_string()))?;
        let reply = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| FallbackError::Malformed("empty reply".to_string()))?;
        parse_verdict(&reply, request)
    }

    fn name(&self) -> &str {
        &self.model
    }
}
