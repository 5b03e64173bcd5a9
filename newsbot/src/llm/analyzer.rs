// Article analysis on top of an optional LLM provider, with local fallbacks
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::{info, warn};

use super::{LlmProvider, LlmRequest, UsageMetadata};

/// Score returned when the reliability model is unavailable or answers nonsense
pub const DEFAULT_RELIABILITY: i64 = 75;

const SUMMARY_MAX_TOKENS: usize = 250;

const POSITIVE_WORDS: &[&str] = &["great", "good", "success", "breakthrough", "positive", "win", "improve"];
const NEGATIVE_WORDS: &[&str] = &["fail", "crisis", "bad", "death", "crash", "negative", "loss", "decline"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "Positive",
            Sentiment::Negative => "Negative",
            Sentiment::Neutral => "Neutral",
        }
    }

    /// Case-insensitive parse of a sentiment label, ignoring punctuation.
    pub fn parse(answer: &str) -> Option<Self> {
        let word = answer
            .trim()
            .trim_matches(|c: char| !c.is_alphanumeric())
            .split_whitespace()
            .next()?
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_ascii_lowercase();
        match word.as_str() {
            "positive" => Some(Sentiment::Positive),
            "negative" => Some(Sentiment::Negative),
            "neutral" => Some(Sentiment::Neutral),
            _ => None,
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a summarization request.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryOutcome {
    pub summary: String,
    /// True when the text came from the extractive fallback rather than the model.
    /// Fallback summaries must not be cached.
    pub fallback: bool,
    #[serde(skip)]
    pub usage: UsageMetadata,
}

/// Summaries, sentiment and reliability scores for article text.
#[derive(Clone, Default)]
pub struct Analyzer {
    provider: Option<Arc<dyn LlmProvider>>,
}

impl Analyzer {
    pub fn new(provider: Option<Arc<dyn LlmProvider>>) -> Self {
        Self { provider }
    }

    pub fn model_name(&self) -> Option<&str> {
        self.provider.as_ref().map(|p| p.model_name())
    }

    /// Summarize `content` in `language`, falling back to an extractive summary
    /// when there is no provider or the call fails.
    pub async fn summarize(&self, content: &str, language: &str) -> SummaryOutcome {
        let Some(provider) = &self.provider else {
            return SummaryOutcome {
                summary: extractive_summary(content),
                fallback: true,
                usage: UsageMetadata::default(),
            };
        };

        let request = LlmRequest {
            system: Some("You are a helpful news assistant.".to_string()),
            prompt: format!(
                "Summarize the following news article briefly and concisely in {}. Provide only the summary.\n\nArticle: {}",
                language, content
            ),
            max_tokens: Some(SUMMARY_MAX_TOKENS),
            temperature: None,
            timeout_seconds: None,
        };

        match provider.generate(request).await {
            Ok(resp) if !resp.content.is_empty() => {
                info!(
                    model = %resp.model,
                    tokens = resp.usage.total_tokens,
                    "LLM summarization successful"
                );
                SummaryOutcome {
                    summary: resp.content,
                    fallback: false,
                    usage: resp.usage,
                }
            }
            Ok(_) => {
                warn!("LLM returned an empty summary, falling back to extractive summary");
                SummaryOutcome {
                    summary: extractive_summary(content),
                    fallback: true,
                    usage: UsageMetadata::default(),
                }
            }
            Err(e) => {
                warn!("LLM summarization failed: {}, falling back to extractive summary", e);
                SummaryOutcome {
                    summary: extractive_summary(content),
                    fallback: true,
                    usage: UsageMetadata::default(),
                }
            }
        }
    }

    /// Without a provider the keyword lexicon decides; a failed or unrecognized
    /// model answer is Neutral.
    pub async fn sentiment(&self, content: &str) -> Sentiment {
        let Some(provider) = &self.provider else {
            return lexicon_sentiment(content);
        };

        let request = LlmRequest {
            system: Some(
                "Analyze the sentiment of the following news headline/snippet. \
                 Respond with exactly one word: Positive, Negative, or Neutral."
                    .to_string(),
            ),
            prompt: content.to_string(),
            max_tokens: Some(10),
            temperature: Some(0.0),
            timeout_seconds: None,
        };

        match provider.generate(request).await {
            Ok(resp) => Sentiment::parse(&resp.content).unwrap_or_else(|| {
                warn!(answer = %resp.content, "unrecognized sentiment answer");
                Sentiment::Neutral
            }),
            Err(e) => {
                warn!("LLM sentiment analysis failed: {}", e);
                Sentiment::Neutral
            }
        }
    }

    /// Reliability/objectivity score in `0..=100`.
    pub async fn reliability(&self, content: &str) -> i64 {
        let Some(provider) = &self.provider else {
            return DEFAULT_RELIABILITY;
        };

        let request = LlmRequest {
            system: Some(
                "Analyze the reliability and objectivity of the following news headline/snippet. \
                 Respond with exactly one number between 0 and 100, where 100 is highly reliable and objective."
                    .to_string(),
            ),
            prompt: content.to_string(),
            max_tokens: Some(5),
            temperature: Some(0.0),
            timeout_seconds: None,
        };

        match provider.generate(request).await {
            Ok(resp) => parse_reliability(&resp.content),
            Err(e) => {
                warn!("LLM reliability analysis failed: {}", e);
                DEFAULT_RELIABILITY
            }
        }
    }
}

static FIRST_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("static regex compile"));

/// First integer in the answer, clamped to `0..=100`; [`DEFAULT_RELIABILITY`] if none.
pub fn parse_reliability(answer: &str) -> i64 {
    match FIRST_NUMBER_RE.find(answer) {
        Some(m) => m
            .as_str()
            .parse::<u64>()
            .map(|n| n.min(100) as i64)
            .unwrap_or(100),
        None => DEFAULT_RELIABILITY,
    }
}

/// Keyword vote used when no model is configured.
pub fn lexicon_sentiment(text: &str) -> Sentiment {
    let lower = text.to_lowercase();
    let positive = POSITIVE_WORDS.iter().filter(|w| lower.contains(*w)).count();
    let negative = NEGATIVE_WORDS.iter().filter(|w| lower.contains(*w)).count();
    match positive.cmp(&negative) {
        std::cmp::Ordering::Greater => Sentiment::Positive,
        std::cmp::Ordering::Less => Sentiment::Negative,
        std::cmp::Ordering::Equal => Sentiment::Neutral,
    }
}

/// First sentence plus up to five more, used when the model is unavailable.
pub fn extractive_summary(text: &str) -> String {
    let sentences: Vec<&str> = text
        .split(['.', '!', '?'])
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();

    let Some(first) = sentences.first() else {
        return "No content".to_string();
    };

    let mut parts = vec![truncate(first, 200)];
    parts.extend(sentences.iter().skip(1).take(5).map(|s| truncate(s, 200)));
    format!("{}.", parts.join(". "))
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extractive_summary() {
        let text = "First sentence is the headline. Second sentence is a bullet. \
                    Third sentence is another bullet. Fourth is yet another. \
                    Fifth sentence here. Sixth and final! Seventh is dropped?";

        let summary = extractive_summary(text);

        assert!(summary.starts_with("First sentence is the headline. Second sentence"));
        assert!(summary.contains("Sixth and final"));
        assert!(!summary.contains("Seventh"));
    }

    #[test]
    fn test_extractive_summary_truncation() {
        let long_sentence = "a".repeat(250);
        let summary = extractive_summary(&format!("{}. Second sentence.", long_sentence));
        assert!(summary.starts_with(&"a".repeat(197)));
        assert!(summary.contains("...."));
        assert_eq!(extractive_summary("   "), "No content");
    }

    #[test]
    fn reliability_answers_are_clamped() {
        assert_eq!(parse_reliability("Score: 82/100"), 82);
        assert_eq!(parse_reliability("250"), 100);
        assert_eq!(parse_reliability("no idea"), DEFAULT_RELIABILITY);
    }

    #[test]
    fn sentiment_answers_are_normalized() {
        assert_eq!(Sentiment::parse("Positive."), Some(Sentiment::Positive));
        assert_eq!(Sentiment::parse(" negative "), Some(Sentiment::Negative));
        assert_eq!(Sentiment::parse("Mixed"), None);
        assert_eq!(lexicon_sentiment("A breakthrough win for the team"), Sentiment::Positive);
        assert_eq!(lexicon_sentiment("Market crash deepens the crisis"), Sentiment::Negative);
        assert_eq!(lexicon_sentiment("The committee met on Tuesday"), Sentiment::Neutral);
    }

    #[tokio::test]
    async fn analyzer_without_provider_uses_fallbacks() {
        let analyzer = Analyzer::new(None);
        let outcome = analyzer.summarize("One. Two.", "English").await;
        assert!(outcome.fallback);
        assert_eq!(outcome.summary, "One. Two.");
        assert_eq!(analyzer.reliability("anything").await, DEFAULT_RELIABILITY);
        assert_eq!(analyzer.sentiment("good news").await, Sentiment::Positive);
    }
}
