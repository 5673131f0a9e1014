//! Answer generation with prompt rotation and deterministic fallbacks.
//!
//! ```text
//! intent = preference, or no strong context ──► creative prompt (1 attempt)
//!                                                   │ fails
//! contextual + strong context ──► grounded prompt   │
//!     attempt i uses persona variant i              │
//!     error / timeout / empty / refusal → next      │
//!                 │ all attempts fail               │
//!                 ▼                                 ▼
//!           compact strict-schema prompt (fixed persona, low temperature)
//!                 │ fails
//!                 ▼
//!              APOLOGY
//! ```
//!
//! The returned answer is never empty. Output moderation is the caller's job.

use std::sync::Arc;
use std::time::Duration;

use regex::RegexSet;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{with_timeout, GenerationRequest, Generator};
use crate::cancel::{CancellationFlag, Cancelled};
use crate::config::GenerationConfig;
use crate::response::ResponseAdapter;
use crate::retriever::RetrievedContext;

pub const APOLOGY: &str =
    "Sorry, I couldn't put an answer together right now. Please try asking again in a moment.";

const MAX_ANSWER_CHARS: usize = 1000;
const COMPACT_TEMPERATURE: f32 = 0.2;

const BUILTIN_PERSONAS: &[&str] = &[
    "You are a friendly, knowledgeable bartender. Answer the user's question using the \
     document context below. Use the ingredients and proportions given there; if the \
     context does not cover the question, say so briefly.",
    "You are a reference assistant for a bar's recipe collection. The user is asking \
     about drinks in that collection. Summarize the relevant recipe from the context in \
     plain, practical language.",
    "You are helping a home bartender. Using only the recipes and notes provided, give a \
     short, concrete answer to the question: what to pour, in what amounts, and how to \
     finish the drink.",
];

const CREATIVE_PERSONA: &str = "You are a creative bartender. Suggest one drink that fits the \
     user's mood or request. Keep it short: the drink name, one line on why it fits, and a \
     simple recipe.";

const COMPACT_PERSONA: &str = "You are a concise bartender. Reply only in the format you are \
     given, with no introduction and no closing remarks.";

const PREFERENCE_KEYWORDS: &[&str] = &[
    "mood",
    "feel like",
    "feeling",
    "surprise me",
    "recommend",
    "suggest",
    "something new",
    "настроение",
    "посоветуй",
    "порекомендуй",
    "хочется",
    "удиви",
];

const MOOD_EMOJI: &[&str] = &["😊", "🔥", "💭", "😎", "🌊", "🍹", "🎉"];

const REFUSAL_PATTERNS: &[&str] = &[
    r"(?i)\bI can(not|'t|’t) (help|assist|answer|provide|comply)",
    r"(?i)\bI('m| am) (not able|unable) to (help|answer|provide)",
    r"(?i)\bas an ai\b",
    r"(?i)^\s*(I'm|I am) sorry,? but\b",
    r"(?i)я не могу.*ответить",
    r"(?i)не могу (помочь|ответить)",
    r"(?i)извините.*не понимаю",
    r"(?i)как (ассистент|ии).*не могу",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Mood or taste driven ("surprise me", "something for a rainy day 🌊").
    Preference,
    /// Asking about something the documents may cover.
    Contextual,
}

pub fn classify_intent(query: &str) -> Intent {
    let lower = query.to_lowercase();
    if PREFERENCE_KEYWORDS.iter().any(|k| lower.contains(k))
        || MOOD_EMOJI.iter().any(|e| query.contains(e))
    {
        Intent::Preference
    } else {
        Intent::Contextual
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptVariant {
    pub name: String,
    pub system_prompt: String,
}

/// Ordered prompt variants, attempt count, and delay between attempts.
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    pub variants: Vec<PromptVariant>,
    pub max_attempts: usize,
    pub backoff: Duration,
}

impl FallbackPolicy {
    pub fn from_config(config: &GenerationConfig) -> Self {
        let prompts: Vec<String> = if config.persona_variants.is_empty() {
            BUILTIN_PERSONAS.iter().map(|s| s.to_string()).collect()
        } else {
            config.persona_variants.clone()
        };
        let variants = prompts
            .into_iter()
            .enumerate()
            .map(|(i, system_prompt)| PromptVariant {
                name: format!("persona-{}", i + 1),
                system_prompt,
            })
            .collect();
        Self {
            variants,
            max_attempts: config.max_retries.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Variant for the zero-based `attempt`, cycling when there are fewer
    /// variants than attempts.
    pub fn variant(&self, attempt: usize) -> Option<&PromptVariant> {
        if self.variants.is_empty() {
            None
        } else {
            self.variants.get(attempt % self.variants.len())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPath {
    Grounded,
    Creative,
    CompactFallback,
    Apology,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub answer: String,
    pub path: GenerationPath,
    /// Backend calls made, including the compact fallback.
    pub attempts: usize,
    pub used_fallback: bool,
}

pub struct GenerationOrchestrator {
    generator: Arc<dyn Generator>,
    adapter: Arc<dyn ResponseAdapter>,
    policy: FallbackPolicy,
    refusals: RegexSet,
    temperature: f32,
    max_tokens: u32,
    compact_max_tokens: u32,
    timeout: Duration,
}

impl GenerationOrchestrator {
    pub fn new(
        generator: Arc<dyn Generator>,
        adapter: Arc<dyn ResponseAdapter>,
        config: &GenerationConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            generator,
            adapter,
            policy: FallbackPolicy::from_config(config),
            refusals: RegexSet::new(REFUSAL_PATTERNS)?,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            compact_max_tokens: config.compact_max_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    pub fn with_policy(mut self, policy: FallbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &FallbackPolicy {
        &self.policy
    }

    pub async fn generate(
        &self,
        query: &str,
        context: &RetrievedContext,
        cancel: &CancellationFlag,
    ) -> Result<GenerationOutcome, Cancelled> {
        let intent = classify_intent(query);
        let mut attempts = 0;

        if intent == Intent::Preference || !context.has_strong() {
            debug!(?intent, "using creative prompt");
            cancel.check()?;
            let request = GenerationRequest {
                system_prompt: CREATIVE_PERSONA.to_string(),
                user_prompt: query.to_string(),
                max_tokens: self.max_tokens,
                temperature: self.temperature,
            };
            attempts += 1;
            let answer = self.attempt(&request).await;
            cancel.check()?;
            if let Some(answer) = answer {
                return Ok(GenerationOutcome {
                    answer,
                    path: GenerationPath::Creative,
                    attempts,
                    used_fallback: false,
                });
            }
        } else {
            let user_prompt = grounded_prompt(query, context);
            for i in 0..self.policy.max_attempts {
                cancel.check()?;
                let Some(variant) = self.policy.variant(i) else {
                    break;
                };
                if i > 0 && !self.policy.backoff.is_zero() {
                    tokio::time::sleep(self.policy.backoff).await;
                }
                let request = GenerationRequest {
                    system_prompt: variant.system_prompt.clone(),
                    user_prompt: user_prompt.clone(),
                    max_tokens: self.max_tokens,
                    temperature: self.temperature,
                };
                attempts += 1;
                let answer = self.attempt(&request).await;
                cancel.check()?;
                if let Some(answer) = answer {
                    return Ok(GenerationOutcome {
                        answer,
                        path: GenerationPath::Grounded,
                        attempts,
                        used_fallback: i > 0,
                    });
                }
                info!(attempt = i + 1, variant = %variant.name, "generation attempt failed, rotating prompt");
            }
        }

        cancel.check()?;
        attempts += 1;
        let answer = self.attempt(&self.compact_request(query)).await;
        cancel.check()?;
        if let Some(answer) = answer {
            return Ok(GenerationOutcome {
                answer,
                path: GenerationPath::CompactFallback,
                attempts,
                used_fallback: true,
            });
        }

        warn!(attempts, "all generation attempts failed, returning apology");
        Ok(GenerationOutcome {
            answer: APOLOGY.to_string(),
            path: GenerationPath::Apology,
            attempts,
            used_fallback: true,
        })
    }

    /// One backend call. `None` on error, timeout, empty text, or refusal.
    async fn attempt(&self, request: &GenerationRequest) -> Option<String> {
        let raw = match with_timeout(self.timeout, self.generator.generate(request)).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(backend = self.generator.name(), error = %e, "generation call failed");
                return None;
            }
        };
        let text = self.adapter.extract_text(&raw)?;
        if self.is_refusal(&text) {
            debug!("generation output looks like a refusal");
            return None;
        }
        let answer = postprocess(&text);
        if answer.is_empty() {
            None
        } else {
            Some(answer)
        }
    }

    pub fn is_refusal(&self, text: &str) -> bool {
        self.refusals.is_match(text)
    }

    fn compact_request(&self, query: &str) -> GenerationRequest {
        GenerationRequest {
            system_prompt: COMPACT_PERSONA.to_string(),
            user_prompt: format!(
                "Request: {}\n\n\
                 Answer in exactly this format:\n\
                 Name: <drink name>\n\
                 Ingredients: <at most 4 items>\n\
                 Steps: <at most 4 short steps>\n\
                 Fun fact: <one sentence>\n\n\
                 Keep the whole answer under 700 characters.",
                query
            ),
            max_tokens: self.compact_max_tokens,
            temperature: COMPACT_TEMPERATURE,
        }
    }
}

/// Strong hits labelled with their source, then the question.
pub fn grounded_prompt(query: &str, context: &RetrievedContext) -> String {
    let parts: Vec<String> = context
        .strong_hits()
        .map(|h| format!("Source: {}\n{}", h.chunk.source_key, h.chunk.text))
        .collect();
    format!(
        "Document context:\n{}\n\nUser question: {}",
        parts.join("\n\n---\n\n"),
        query
    )
}

/// Drop blank lines, trim, and cap the length.
pub fn postprocess(text: &str) -> String {
    let joined = text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let trimmed = joined.trim();
    if trimmed.chars().count() > MAX_ANSWER_CHARS {
        let cut: String = trimmed.chars().take(MAX_ANSWER_CHARS).collect();
        format!("{}...", cut.trim_end())
    } else {
        trimmed.to_string()
    }
}
