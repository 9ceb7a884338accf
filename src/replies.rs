//! Chat-completion replies with per-model 429 retry and a model fallback chain.
//!
//! [`ReplyGenerator::reply`] never fails: total failure produces an apology
//! text that still goes out to the contact.

use std::time::{Duration, Instant};

use regex::Regex;
use reqwest::header::RETRY_AFTER;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::error::ConfigError;
use crate::prompting::{ChatMessage, PromptConfig};
use crate::types::AiAttribution;

pub const MALFORMED_RESPONSE_REPLY: &str =
    "Sorry, I couldn't generate a valid reply. (No 'choices' found)";

const ERROR_BODY_PREVIEW: usize = 300;

pub fn apology(last_error: &str) -> String {
    format!(
        "Sorry, I couldn't generate a reply right now. Please try again in a moment. (Error: {last_error})"
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    /// Model that produced `text`; `None` when every model failed.
    pub model: Option<String>,
    pub attempts: u32,
    /// A model other than the first one answered, or nothing answered.
    pub fallback_used: bool,
    pub error: Option<String>,
}

impl Reply {
    pub fn attribution(&self) -> AiAttribution {
        AiAttribution {
            model: self.model.clone(),
            attempts: self.attempts,
            fallback_used: self.fallback_used,
            error: self.error.clone(),
        }
    }
}

enum AttemptError {
    RateLimited {
        retry_hint: Option<Duration>,
        message: String,
    },
    Failed(String),
}

struct Completion {
    text: String,
    malformed: bool,
}

pub struct ReplyGenerator {
    client: reqwest::Client,
    config: LlmConfig,
    prompts: PromptConfig,
}

impl ReplyGenerator {
    pub fn new(config: LlmConfig, prompts: PromptConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| ConfigError::HttpClient(err.to_string()))?;
        Ok(Self {
            client,
            config,
            prompts,
        })
    }

    /// Plain-text variant of [`Self::reply`] without a business name.
    pub async fn generate(&self, prompt_text: &str) -> String {
        self.reply("", prompt_text).await.text
    }

    pub async fn reply(&self, business_name: &str, prompt_text: &str) -> Reply {
        if self.config.api_key.trim().is_empty() {
            let error = "LLM API key not configured".to_string();
            warn!("{error}");
            return Reply {
                text: apology(&error),
                model: None,
                attempts: 0,
                fallback_used: true,
                error: Some(error),
            };
        }

        let messages = self.prompts.build_messages(business_name, prompt_text);
        let mut attempts = 0;
        let mut last_error = String::from("no models configured");

        for (index, model) in self.config.models.iter().enumerate() {
            let mut retries = 0;
            loop {
                attempts += 1;
                match self.complete(model, &messages).await {
                    Ok(completion) => {
                        let fallback_used = index > 0;
                        info!(model = %model, attempts, fallback_used, "reply generated");
                        return Reply {
                            text: completion.text,
                            model: Some(model.clone()),
                            attempts,
                            fallback_used,
                            error: completion
                                .malformed
                                .then(|| "unexpected completion response shape".to_string()),
                        };
                    }
                    Err(AttemptError::RateLimited {
                        retry_hint,
                        message,
                    }) => {
                        last_error = message;
                        if retries >= self.config.max_retries {
                            warn!(model = %model, retries, "rate limit retries exhausted, falling back");
                            break;
                        }
                        let wait = retry_hint.unwrap_or(self.config.retry_backoff);
                        if wait > self.config.max_retry_wait {
                            warn!(
                                model = %model,
                                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                                "retry hint exceeds maximum wait, falling back"
                            );
                            break;
                        }
                        retries += 1;
                        warn!(
                            model = %model,
                            retry = retries,
                            wait_ms = wait.as_millis() as u64,
                            "rate limited, retrying same model"
                        );
                        tokio::time::sleep(wait).await;
                    }
                    Err(AttemptError::Failed(message)) => {
                        warn!(model = %model, error = %message, "model failed, falling back");
                        last_error = message;
                        break;
                    }
                }
            }
        }

        warn!(attempts, error = %last_error, "all models failed, sending apology");
        Reply {
            text: apology(&last_error),
            model: None,
            attempts,
            fallback_used: true,
            error: Some(last_error),
        }
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<Completion, AttemptError> {
        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.api_url))
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "model": model,
                "messages": messages,
                "max_tokens": self.config.max_tokens,
                "temperature": self.config.temperature,
            }))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    AttemptError::Failed(format!("{model} timed out"))
                } else {
                    AttemptError::Failed(format!("{model} request failed: {err}"))
                }
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|err| AttemptError::Failed(format!("{model} body read failed: {err}")))?;
        debug!(
            model,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "completion response"
        );

        if status.as_u16() == 429 {
            return Err(AttemptError::RateLimited {
                retry_hint: parse_retry_hint(&body, retry_after.as_deref()),
                message: format!("{model} returned {status}: {}", error_summary(&body)),
            });
        }
        if !status.is_success() {
            return Err(AttemptError::Failed(format!(
                "{model} returned {status}: {}",
                error_summary(&body)
            )));
        }

        let payload = serde_json::from_str::<Value>(&body).unwrap_or(Value::Null);
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty());
        Ok(match text {
            Some(text) => Completion {
                text: text.to_string(),
                malformed: false,
            },
            None => {
                warn!(model, "completion response had no usable choices");
                Completion {
                    text: MALFORMED_RESPONSE_REPLY.to_string(),
                    malformed: true,
                }
            }
        })
    }
}

/// Provider error message when the body is the usual `{"error":{"message"}}`,
/// else a prefix of the raw body.
fn error_summary(body: &str) -> String {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .and_then(|err| err.get("message").or(Some(err)))
                .map(|err| match err {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
        })
        .unwrap_or_else(|| body.trim().to_string());
    message.chars().take(ERROR_BODY_PREVIEW).collect()
}

/// Reads "try again in 1.5s" / "520ms" / "1m2.5s" from a 429 body, then the
/// `retry-after` header (seconds).
pub fn parse_retry_hint(body: &str, retry_after: Option<&str>) -> Option<Duration> {
    parse_body_hint(body).or_else(|| {
        retry_after
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    })
}

fn parse_body_hint(body: &str) -> Option<Duration> {
    let hint_re = Regex::new(r"(?i)try again in\s*((?:\d+(?:\.\d+)?(?:ms|h|m|s))+)").ok()?;
    let part_re = Regex::new(r"(\d+(?:\.\d+)?)(ms|h|m|s)").ok()?;
    let hint = hint_re.captures(body)?.get(1)?.as_str().to_ascii_lowercase();

    let mut total_secs = 0.0;
    for part in part_re.captures_iter(&hint) {
        let value = part[1].parse::<f64>().ok()?;
        total_secs += match &part[2] {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            _ => return None,
        };
    }
    // A hint too large to represent still means "not soon".
    Some(Duration::try_from_secs_f64(total_secs).unwrap_or(Duration::MAX))
}
