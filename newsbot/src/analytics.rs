//! Aggregate reporting over analyzed articles and user interactions, plus the
//! small text utilities (keywords, emotions, readability, entities).

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

const STOP_WORDS: &[&str] = &[
    "that", "this", "with", "from", "they", "have", "been", "said", "each", "which", "their",
    "time", "will", "about", "would", "there", "could", "other", "more", "after", "first", "also",
    "most", "over", "such", "only", "many", "some", "these", "into", "than", "them", "were",
    "what", "when", "your", "should", "still", "very", "want", "must",
];

const EMOTIONS: &[(&str, &[&str])] = &[
    ("joy", &["happy", "excited", "delighted", "pleased", "satisfied", "thrilled"]),
    ("anger", &["angry", "furious", "outraged", "irritated", "frustrated", "annoyed"]),
    ("fear", &["afraid", "scared", "terrified", "worried", "anxious", "concerned"]),
    ("sadness", &["sad", "depressed", "disappointed", "upset", "grief", "sorrow"]),
    ("surprise", &["surprised", "shocked", "amazed", "astonished", "stunned"]),
];

/// One analyzed article, as recorded for reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub category: Option<String>,
    pub sentiment: Option<String>,
    pub reliability_score: Option<i64>,
    pub word_count: Option<i64>,
    pub language: Option<String>,
    pub keywords: Vec<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Interaction {
    pub user_id: Option<i64>,
    pub action: String,
    pub category: Option<String>,
    pub search_query: Option<String>,
    pub article_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendingTopic {
    pub keyword: String,
    pub frequency: i64,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SentimentCounts {
    #[serde(rename = "Positive")]
    pub positive: i64,
    #[serde(rename = "Negative")]
    pub negative: i64,
    #[serde(rename = "Neutral")]
    pub neutral: i64,
}

impl SentimentCounts {
    fn add(&mut self, sentiment: &str, count: i64) {
        match sentiment {
            "Positive" => self.positive += count,
            "Negative" => self.negative += count,
            _ => self.neutral += count,
        }
    }

    pub fn total(&self) -> i64 {
        self.positive + self.negative + self.neutral
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryStats {
    pub total_articles: i64,
    pub avg_reliability: f64,
    pub avg_word_count: f64,
    pub sentiments: SentimentCounts,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entities {
    pub organizations: Vec<String>,
    pub locations: Vec<String>,
    pub dates: Vec<String>,
    pub persons: Vec<String>,
}

pub async fn record_analysis(pool: &SqlitePool, record: &AnalysisRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO news_analytics
            (recorded_at, category, sentiment, reliability_score, word_count, language, keywords, source)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(common::now_timestamp())
    .bind(&record.category)
    .bind(&record.sentiment)
    .bind(record.reliability_score)
    .bind(record.word_count)
    .bind(&record.language)
    .bind(serde_json::to_string(&record.keywords).context("failed to serialize keywords")?)
    .bind(&record.source)
    .execute(pool)
    .await
    .context("failed to record analysis")?;
    Ok(())
}

pub async fn track_interaction(pool: &SqlitePool, interaction: &Interaction) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO user_interactions (recorded_at, user_id, action, category, search_query, article_id)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(common::now_timestamp())
    .bind(interaction.user_id)
    .bind(&interaction.action)
    .bind(&interaction.category)
    .bind(&interaction.search_query)
    .bind(&interaction.article_id)
    .execute(pool)
    .await
    .context("failed to track interaction")?;
    Ok(())
}

/// Most frequent keywords across analyses recorded in the last `days` days (top 20).
pub async fn trending_topics(pool: &SqlitePool, days: i64) -> Result<Vec<TrendingTopic>> {
    let rows: Vec<(Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT keywords, category FROM news_analytics WHERE recorded_at >= ? ORDER BY id",
    )
    .bind(common::days_ago_timestamp(days))
    .fetch_all(pool)
    .await
    .context("failed to load analyses for trending topics")?;

    let mut order: Vec<String> = Vec::new();
    let mut topics: HashMap<String, TrendingTopic> = HashMap::new();
    for (keywords, category) in rows {
        let Some(keywords) = keywords else { continue };
        let list: Vec<String> = serde_json::from_str(&keywords).unwrap_or_default();
        for keyword in list {
            let topic = topics.entry(keyword.clone()).or_insert_with(|| {
                order.push(keyword.clone());
                TrendingTopic {
                    keyword,
                    frequency: 0,
                    categories: Vec::new(),
                }
            });
            topic.frequency += 1;
            if let Some(c) = &category {
                if !topic.categories.contains(c) {
                    topic.categories.push(c.clone());
                }
            }
        }
    }

    let mut trending: Vec<TrendingTopic> = order
        .into_iter()
        .filter_map(|k| topics.remove(&k))
        .collect();
    // stable: ties keep first-seen order
    trending.sort_by(|a, b| b.frequency.cmp(&a.frequency));
    trending.truncate(20);
    Ok(trending)
}

/// Per-day sentiment counts, keyed by `YYYY-MM-DD`.
pub async fn sentiment_trends(pool: &SqlitePool, days: i64) -> Result<BTreeMap<String, SentimentCounts>> {
    let rows: Vec<(String, Option<String>, i64)> = sqlx::query_as(
        r#"
        SELECT substr(recorded_at, 1, 10) AS day, sentiment, COUNT(*)
        FROM news_analytics
        WHERE recorded_at >= ?
        GROUP BY day, sentiment
        ORDER BY day
        "#,
    )
    .bind(common::days_ago_timestamp(days))
    .fetch_all(pool)
    .await
    .context("failed to compute sentiment trends")?;

    let mut trends: BTreeMap<String, SentimentCounts> = BTreeMap::new();
    for (day, sentiment, count) in rows {
        trends
            .entry(day)
            .or_default()
            .add(sentiment.as_deref().unwrap_or("Neutral"), count);
    }
    Ok(trends)
}

/// Article count, mean reliability, mean word count and sentiment split per category.
pub async fn category_analytics(pool: &SqlitePool) -> Result<BTreeMap<String, CategoryStats>> {
    let totals: Vec<(Option<String>, i64, Option<f64>, Option<f64>)> = sqlx::query_as(
        r#"
        SELECT category, COUNT(*), AVG(reliability_score), AVG(word_count)
        FROM news_analytics
        GROUP BY category
        "#,
    )
    .fetch_all(pool)
    .await
    .context("failed to compute category analytics")?;

    let mut out: BTreeMap<String, CategoryStats> = BTreeMap::new();
    for (category, count, reliability, words) in totals {
        out.insert(
            category.unwrap_or_else(|| "general".to_string()),
            CategoryStats {
                total_articles: count,
                avg_reliability: round2(reliability.unwrap_or(0.0)),
                avg_word_count: round2(words.unwrap_or(0.0)),
                sentiments: SentimentCounts::default(),
            },
        );
    }

    let split: Vec<(Option<String>, Option<String>, i64)> = sqlx::query_as(
        "SELECT category, sentiment, COUNT(*) FROM news_analytics GROUP BY category, sentiment",
    )
    .fetch_all(pool)
    .await
    .context("failed to compute category sentiments")?;
    for (category, sentiment, count) in split {
        let key = category.unwrap_or_else(|| "general".to_string());
        if let Some(stats) = out.get_mut(&key) {
            stats
                .sentiments
                .add(sentiment.as_deref().unwrap_or("Neutral"), count);
        }
    }
    Ok(out)
}

/// Interaction counts keyed `action_category` (or just `action`).
pub async fn user_activity_summary(
    pool: &SqlitePool,
    user_id: Option<i64>,
    days: i64,
) -> Result<BTreeMap<String, i64>> {
    let rows: Vec<(String, Option<String>, i64)> = sqlx::query_as(
        r#"
        SELECT action, category, COUNT(*) AS count
        FROM user_interactions
        WHERE recorded_at >= ? AND (? IS NULL OR user_id = ?)
        GROUP BY action, category
        ORDER BY count DESC
        "#,
    )
    .bind(common::days_ago_timestamp(days))
    .bind(user_id)
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to summarize user activity")?;

    let mut summary = BTreeMap::new();
    for (action, category, count) in rows {
        let key = match category.filter(|c| !c.is_empty()) {
            Some(c) => format!("{}_{}", action, c),
            None => action,
        };
        *summary.entry(key).or_insert(0) += count;
    }
    Ok(summary)
}

pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[a-zA-Z]{4,}\b").expect("static regex compile"));

/// Most frequent words of four or more letters, stop words removed.
/// Ties keep first-occurrence order.
pub fn extract_keywords(text: &str, max_keywords: usize) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut counts: Vec<(String, usize)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for m in WORD_RE.find_iter(&lower) {
        let word = m.as_str();
        if STOP_WORDS.contains(&word) {
            continue;
        }
        match index.get(word) {
            Some(&i) => counts[i].1 += 1,
            None => {
                index.insert(word.to_string(), counts.len());
                counts.push((word.to_string(), 1));
            }
        }
    }

    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
        .into_iter()
        .take(max_keywords)
        .map(|(w, _)| w)
        .collect()
}

/// Dominant emotion by keyword hits, or `"neutral"`.
pub fn detect_emotions(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    let mut best = ("neutral", 0usize);
    for (emotion, words) in EMOTIONS {
        let score = words.iter().filter(|w| lower.contains(*w)).count();
        if score > best.1 {
            best = (emotion, score);
        }
    }
    best.0
}

/// 0 (hard) to 100 (easy), from sentence length and the share of words
/// longer than six characters.
pub fn readability_score(text: &str) -> f64 {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }
    let sentences = text.split('.').count() as f64;
    let avg_sentence_length = words.len() as f64 / sentences;
    let complex = words.iter().filter(|w| w.chars().count() > 6).count() as f64;
    let difficulty = (avg_sentence_length + complex / words.len() as f64 * 100.0) / 2.0;
    round2((100.0 - difficulty).clamp(0.0, 100.0))
}

static ORG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+)*)\s+(?:Inc|Corp|Ltd|LLC|Company)\b")
        .expect("static regex compile")
});
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{1,2}[/-]\d{1,2}[/-]\d{2,4}\b|\b\d{4}\b").expect("static regex compile")
});
static LOCATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z][a-z]+),\s*[A-Z]{2}\b").expect("static regex compile"));

/// Pattern-based entity spotting. Person names are not detected.
pub fn extract_entities(text: &str) -> Entities {
    Entities {
        organizations: ORG_RE
            .captures_iter(text)
            .map(|c| c[1].to_string())
            .collect(),
        locations: LOCATION_RE
            .captures_iter(text)
            .map(|c| c[1].to_string())
            .collect(),
        dates: DATE_RE.find_iter(text).map(|m| m.as_str().to_string()).collect(),
        persons: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_by_frequency() {
        let text = "Solar panels power homes. Solar farms expand; panels get cheaper. Solar wins.";
        let kw = extract_keywords(text, 2);
        assert_eq!(kw, vec!["solar".to_string(), "panels".to_string()]);
        assert!(extract_keywords("this that with from", 5).is_empty());
    }

    #[test]
    fn emotions_and_readability() {
        assert_eq!(detect_emotions("Fans were thrilled and delighted"), "joy");
        assert_eq!(detect_emotions("Residents are worried and anxious"), "fear");
        assert_eq!(detect_emotions("The meeting is at noon"), "neutral");

        assert_eq!(readability_score(""), 0.0);
        let easy = readability_score("The cat sat. The dog ran.");
        let hard = readability_score(
            "Comprehensive infrastructure modernization necessitates extraordinary intergovernmental coordination",
        );
        assert!(easy > hard);
        assert!((0.0..=100.0).contains(&hard));
    }

    #[test]
    fn entities_by_pattern() {
        let e = extract_entities("Acme Widgets Inc opened an office in Austin, TX on 12/05/2025 after 2024.");
        assert_eq!(e.organizations, vec!["Acme Widgets".to_string()]);
        assert_eq!(e.locations, vec!["Austin".to_string()]);
        assert_eq!(e.dates, vec!["12/05/2025".to_string(), "2024".to_string()]);
        assert!(e.persons.is_empty());
    }

    #[tokio::test]
    async fn aggregates_over_recorded_analyses() {
        let pool = common::init_memory_pool().await.unwrap();
        crate::storage::ensure_schema(&pool).await.unwrap();

        for (category, sentiment, score) in [
            ("science", "Positive", 80),
            ("science", "Negative", 60),
            ("sports", "Positive", 90),
        ] {
            record_analysis(
                &pool,
                &AnalysisRecord {
                    category: Some(category.into()),
                    sentiment: Some(sentiment.into()),
                    reliability_score: Some(score),
                    word_count: Some(100),
                    keywords: vec!["climate".into(), category.into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }

        let cats = category_analytics(&pool).await.unwrap();
        assert_eq!(cats["science"].total_articles, 2);
        assert_eq!(cats["science"].avg_reliability, 70.0);
        assert_eq!(cats["science"].sentiments.negative, 1);

        let trending = trending_topics(&pool, 7).await.unwrap();
        assert_eq!(trending[0].keyword, "climate");
        assert_eq!(trending[0].frequency, 3);
        assert_eq!(trending[0].categories, vec!["science".to_string(), "sports".to_string()]);

        let trends = sentiment_trends(&pool, 30).await.unwrap();
        let today = trends.values().next().unwrap();
        assert_eq!(today.positive, 2);
        assert_eq!(today.total(), 3);

        track_interaction(
            &pool,
            &Interaction {
                user_id: Some(7),
                action: "view".into(),
                category: Some("science".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        track_interaction(
            &pool,
            &Interaction {
                user_id: Some(8),
                action: "search".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let mine = user_activity_summary(&pool, Some(7), 30).await.unwrap();
        assert_eq!(mine.get("view_science"), Some(&1));
        assert_eq!(mine.len(), 1);
        let all = user_activity_summary(&pool, None, 30).await.unwrap();
        assert_eq!(all.get("search"), Some(&1));
    }
}
