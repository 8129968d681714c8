//! Contextual advisor — optional external judgement for context-sensitive
//! detections.
//!
//! The advisor may veto a detection (`should_filter = false`) when the
//! surrounding dialogue shows literal or religious usage rather than an
//! expletive. Every failure mode — missing advisor, timeout, bad reply —
//! degrades to the safe default of filtering.

use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{OpenCueError, Result};

/// Advisor deadline. A call that has not resolved by then keeps the
/// detection.
pub const ADVISOR_TIMEOUT: Duration = Duration::from_secs(5);

/// What the advisor was asked about.
#[derive(Debug, Clone, Serialize)]
pub struct AdviceRequest<'a> {
    /// The full subtitle text containing the detection.
    pub text: &'a str,
    /// The canonical detected word.
    pub word: &'a str,
    /// Dotted category of the detection.
    pub category: &'a str,
    /// Recent surrounding dialogue, oldest first.
    pub context_text: &'a str,
}

/// The advisor's judgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advice {
    pub should_filter: bool,
    pub confidence: f32,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub context_type: String,
}

impl Advice {
    /// The safe default used whenever the advisor cannot answer.
    pub fn safe_default(reason: &str) -> Self {
        Self {
            should_filter: true,
            confidence: 0.5,
            reason: reason.to_string(),
            context_type: "unknown".into(),
        }
    }
}

/// Contract for contextual advisors.
pub trait ContextAdvisor: Send + Sync {
    fn analyze<'a>(&'a self, request: AdviceRequest<'a>) -> BoxFuture<'a, Result<Advice>>;
}

/// Ollama-backed advisor speaking the `/api/generate` JSON protocol.
pub struct OllamaAdvisor {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaAdvisor {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    fn prompt(request: &AdviceRequest<'_>) -> String {
        format!(
            concat!(
                "You judge whether a flagged word in a subtitle should be filtered.\n",
                "Word: \"{word}\" (category {category})\n",
                "Subtitle: \"{text}\"\n",
                "Recent dialogue: \"{context}\"\n",
                "Reply with JSON only: {{\"should_filter\": bool, \"confidence\": 0..1, ",
                "\"reason\": string, \"context_type\": ",
                "\"exclamation\"|\"religious\"|\"literal\"|\"quotation\"}}"
            ),
            word = request.word,
            category = request.category,
            text = request.text,
            context = request.context_text,
        )
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    format: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl ContextAdvisor for OllamaAdvisor {
    fn analyze<'a>(&'a self, request: AdviceRequest<'a>) -> BoxFuture<'a, Result<Advice>> {
        Box::pin(async move {
            let body = GenerateRequest {
                model: &self.model,
                prompt: Self::prompt(&request),
                stream: false,
                format: "json",
            };

            let response = self
                .client
                .post(format!("{}/api/generate", self.base_url))
                .json(&body)
                .timeout(ADVISOR_TIMEOUT)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        OpenCueError::AdvisorTimeout
                    } else {
                        OpenCueError::AdvisorBadReply(e.to_string())
                    }
                })?;

            if !response.status().is_success() {
                return Err(OpenCueError::AdvisorBadReply(format!(
                    "status {}",
                    response.status()
                )));
            }

            let generated: GenerateResponse = response
                .json()
                .await
                .map_err(|e| OpenCueError::AdvisorBadReply(e.to_string()))?;

            let advice: Advice = serde_json::from_str(&generated.response)
                .map_err(|e| OpenCueError::AdvisorBadReply(e.to_string()))?;

            debug!(
                word = request.word,
                should_filter = advice.should_filter,
                context_type = advice.context_type.as_str(),
                "advisor verdict"
            );
            Ok(advice)
        })
    }
}

/// Resolve an advisor call's outcome to a final judgement, applying the
/// safe default on any failure.
pub fn advice_or_default(outcome: Result<Advice>) -> Advice {
    match outcome {
        Ok(advice) => advice,
        Err(OpenCueError::AdvisorTimeout) => {
            warn!("advisor timed out — keeping detection");
            Advice::safe_default("advisor timeout")
        }
        Err(e) => {
            warn!("advisor failed ({e}) — keeping detection");
            Advice::safe_default("advisor error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted advisor for session tests.
    pub struct ScriptedAdvisor {
        pub advice: Advice,
    }

    impl ContextAdvisor for ScriptedAdvisor {
        fn analyze<'a>(&'a self, _request: AdviceRequest<'a>) -> BoxFuture<'a, Result<Advice>> {
            let advice = self.advice.clone();
            Box::pin(async move { Ok(advice) })
        }
    }

    #[tokio::test]
    async fn scripted_advisor_returns_its_script() {
        let advisor = ScriptedAdvisor {
            advice: Advice {
                should_filter: false,
                confidence: 0.9,
                reason: "religious context".into(),
                context_type: "religious".into(),
            },
        };
        let advice = advisor
            .analyze(AdviceRequest {
                text: "the lord is my shepherd",
                word: "god",
                category: "language.blasphemy.mild",
                context_text: "",
            })
            .await
            .unwrap();
        assert!(!advice.should_filter);
    }

    #[test]
    fn failures_default_to_filtering() {
        let advice = advice_or_default(Err(OpenCueError::AdvisorTimeout));
        assert!(advice.should_filter);
        let advice = advice_or_default(Err(OpenCueError::AdvisorBadReply("nope".into())));
        assert!(advice.should_filter);
    }
}
