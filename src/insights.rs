//! Narrative insights about a reader, generated by an LLM.
//!
//! The flow for every kind is the same: load the books, check there is
//! enough data, aggregate statistics, render the kind's template, call the
//! model, record the exchange in `llm_history`, and split the response into
//! named sections.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::books::list_books;
use crate::config::Config;
use crate::db;
use crate::error::ShelfError;
use crate::history::{self, STATUS_ERROR, STATUS_SUCCESS};
use crate::llm::{create_client, LlmClient};
use crate::models::Book;
use crate::prompts::{prompt_variables, PromptSet, Template};
use crate::stats::reading_stats;

pub const DEFAULT_RECOMMENDATIONS: usize = 5;
pub const MAX_RECOMMENDATIONS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightKind {
    Insights,
    Profile,
    Quick,
    Comprehensive,
    Recommendations,
}

impl InsightKind {
    pub const ALL: [InsightKind; 5] = [
        InsightKind::Insights,
        InsightKind::Profile,
        InsightKind::Quick,
        InsightKind::Comprehensive,
        InsightKind::Recommendations,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InsightKind::Insights => "insights",
            InsightKind::Profile => "profile",
            InsightKind::Quick => "quick",
            InsightKind::Comprehensive => "comprehensive",
            InsightKind::Recommendations => "recommendations",
        }
    }

    fn template(self) -> Template {
        match self {
            InsightKind::Insights => Template::Insight,
            InsightKind::Profile => Template::Profile,
            InsightKind::Quick => Template::Quick,
            InsightKind::Comprehensive => Template::Comprehensive,
            InsightKind::Recommendations => Template::Recommendation,
        }
    }

    /// `(books, rated books)` needed before a prompt is worth sending.
    fn requirements(self) -> (i64, i64) {
        match self {
            InsightKind::Profile => (10, 5),
            InsightKind::Recommendations => (1, 0),
            _ => (5, 3),
        }
    }
}

impl FromStr for InsightKind {
    type Err = ShelfError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        InsightKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| {
                ShelfError::validation(format!(
                    "unknown insight kind '{}' (expected insights, profile, quick, comprehensive, or recommendations)",
                    s
                ))
            })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Readiness {
    pub kind: InsightKind,
    pub ready: bool,
    pub total_books: i64,
    pub rated_books: i64,
    pub required_books: i64,
    pub required_rated: i64,
    pub reason: String,
}

fn readiness_for(kind: InsightKind, total: i64, rated: i64) -> Readiness {
    let (required_books, required_rated) = kind.requirements();
    let ready = total >= required_books && rated >= required_rated;
    let reason = if total == 0 {
        "No books in database".to_string()
    } else if ready {
        "Ready".to_string()
    } else {
        format!(
            "Insufficient data: need {} books ({} rated), have {} ({} rated)",
            required_books, required_rated, total, rated
        )
    };

    Readiness {
        kind,
        ready,
        total_books: total,
        rated_books: rated,
        required_books,
        required_rated,
        reason,
    }
}

/// Whether each insight kind can be generated from `books`.
pub fn insight_readiness(books: &[Book]) -> Vec<Readiness> {
    let total = books.len() as i64;
    let rated = books.iter().filter(|b| b.my_rating.is_some()).count() as i64;
    InsightKind::ALL
        .into_iter()
        .map(|k| readiness_for(k, total, rated))
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct InsightRequest {
    pub kind: InsightKind,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl InsightRequest {
    pub fn new(kind: InsightKind) -> Self {
        Self {
            kind,
            query: None,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DataSummary {
    pub total_books: i64,
    pub rated_books: i64,
    pub average_rating: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InsightReport {
    pub kind: InsightKind,
    pub sections: BTreeMap<String, String>,
    pub raw_response: String,
    pub data_summary: DataSummary,
    pub history_id: i64,
}

/// Generate one insight report and record the exchange.
pub async fn generate(
    pool: &SqlitePool,
    llm: &dyn LlmClient,
    prompts: &PromptSet,
    request: &InsightRequest,
) -> Result<InsightReport> {
    let kind = request.kind;
    let books = list_books(pool).await?;

    let total = books.len() as i64;
    let rated = books.iter().filter(|b| b.my_rating.is_some()).count() as i64;
    let readiness = readiness_for(kind, total, rated);
    if !readiness.ready {
        return Err(ShelfError::validation(readiness.reason).into());
    }

    let (query, limit) = match kind {
        InsightKind::Recommendations => {
            let query = request
                .query
                .as_deref()
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .ok_or_else(|| ShelfError::validation("recommendations need a query"))?;
            let limit = request
                .limit
                .unwrap_or(DEFAULT_RECOMMENDATIONS)
                .clamp(1, MAX_RECOMMENDATIONS);
            (Some(query), Some(limit))
        }
        _ => (None, None),
    };

    let stats = reading_stats(pool).await?;
    let vars = prompt_variables(&stats, &books, query, limit)?;
    let prompt = prompts.render(kind.template(), &vars)?;

    tracing::info!(kind = kind.as_str(), llm = llm.name(), books = total, "generating insight");

    let extra = json!({ "llm": llm.name(), "query": query, "limit": limit });
    let response = match llm.complete(&prompt).await {
        Ok(text) => text,
        Err(e) => {
            history::record(pool, kind.as_str(), &prompt, &e.to_string(), STATUS_ERROR, &extra)
                .await?;
            tracing::warn!(kind = kind.as_str(), error = %e, "insight generation failed");
            return Err(e);
        }
    };

    let history_id =
        history::record(pool, kind.as_str(), &prompt, &response, STATUS_SUCCESS, &extra).await?;

    Ok(InsightReport {
        kind,
        sections: parse_sections(kind, &response),
        raw_response: response,
        data_summary: DataSummary {
            total_books: stats.total_books,
            rated_books: stats.rated_books,
            average_rating: stats.average_rating,
        },
        history_id,
    })
}

pub fn parse_sections(kind: InsightKind, text: &str) -> BTreeMap<String, String> {
    match kind {
        InsightKind::Insights => parse_insight_sections(text),
        InsightKind::Quick => parse_quick_sections(text),
        InsightKind::Comprehensive => parse_comprehensive_sections(text),
        InsightKind::Profile => single("profile", text),
        InsightKind::Recommendations => single("recommendations", text),
    }
}

fn single(key: &str, text: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(key.to_string(), text.trim().to_string())])
}

const INSIGHT_MARKERS: [(&str, &str); 5] = [
    ("**Personality Type**", "personality_type"),
    ("**Intellectual Profile**", "intellectual_profile"),
    ("**Emotional Preferences**", "emotional_preferences"),
    ("**Dominant Themes**", "dominant_themes"),
    ("**Literary Portrait**", "literary_portrait"),
];

/// Split on the five bold headers. A section runs to the start of the line
/// holding the next header, or to the header itself when both share a line,
/// so the next header's emoji is not carried along.
pub fn parse_insight_sections(text: &str) -> BTreeMap<String, String> {
    let mut sections = BTreeMap::new();

    for (i, (marker, key)) in INSIGHT_MARKERS.iter().enumerate() {
        let Some(start) = text.find(marker) else {
            continue;
        };
        let body_start = start + marker.len();

        let end = INSIGHT_MARKERS[i + 1..]
            .iter()
            .find_map(|(next, _)| text[body_start..].find(next).map(|p| body_start + p))
            .map(|p| text[..p].rfind('\n').map_or(p, |nl| nl.max(body_start)))
            .unwrap_or(text.len());

        // A header sharing the line leaves its emoji behind; drop it.
        let body = text[body_start..end]
            .trim_end_matches(|c: char| !c.is_alphanumeric() && !c.is_ascii_punctuation())
            .trim()
            .trim_start_matches(':')
            .trim()
            .trim_start_matches("**")
            .trim_end_matches("**")
            .trim();
        sections.insert(key.to_string(), body.to_string());
    }

    sections
}

const ROAST_HEADERS: [&str; 5] = [
    "## ROAST ME",
    "## HUMOROUS ROAST ANALYSIS",
    "## ROAST",
    "ROAST ME",
    "HUMOROUS ROAST",
];
const RECOMMENDATION_HEADERS: [&str; 4] = [
    "## PERSONALIZED RECOMMENDATIONS",
    "## RECOMMENDATIONS",
    "## BOOK RECOMMENDATIONS",
    "PERSONALIZED RECOMMENDATIONS",
];
const ROAST_INDICATORS: [&str; 6] = [
    "roast",
    "humorous",
    "witty",
    "sarcastic",
    "reader summary",
    "literary roast",
];

/// Line-oriented split into named sections. A line containing any of a
/// section's headers starts that section (header line included).
fn split_by_headers(text: &str, headers: &[(&str, &[&str])]) -> BTreeMap<String, String> {
    let mut sections: BTreeMap<String, String> = headers
        .iter()
        .map(|(key, _)| (key.to_string(), String::new()))
        .collect();

    let mut current: Option<&str> = None;
    let mut content: Vec<&str> = Vec::new();

    for line in text.lines() {
        let hit = headers
            .iter()
            .find(|(_, hs)| hs.iter().any(|h| line.contains(h)))
            .map(|(key, _)| *key);

        match (hit, current) {
            (Some(key), _) => {
                if let Some(cur) = current {
                    sections.insert(cur.to_string(), content.join("\n"));
                }
                current = Some(key);
                content = vec![line];
            }
            (None, Some(_)) => content.push(line),
            (None, None) => {}
        }
    }
    if let Some(cur) = current {
        sections.insert(cur.to_string(), content.join("\n"));
    }

    sections
}

pub fn parse_quick_sections(text: &str) -> BTreeMap<String, String> {
    let sections = split_by_headers(
        text,
        &[
            ("humorous", &ROAST_HEADERS[..]),
            ("recommendations", &RECOMMENDATION_HEADERS[..]),
        ],
    );

    if sections.values().any(|s| !s.is_empty()) {
        return sections;
    }

    tracing::debug!("quick response has no section headers, splitting in half");
    let lines: Vec<&str> = text.lines().collect();
    let mid = lines.len() / 2;
    let first = lines[..mid].join("\n");
    let second = lines[mid..].join("\n");

    let score = |s: &str| {
        let lower = s.to_lowercase();
        ROAST_INDICATORS.iter().filter(|i| lower.contains(*i)).count()
    };
    let (humorous, recommendations) = if score(&first) > score(&second) {
        (first, second)
    } else {
        (second, first)
    };

    BTreeMap::from([
        ("humorous".to_string(), humorous),
        ("recommendations".to_string(), recommendations),
    ])
}

pub fn parse_comprehensive_sections(text: &str) -> BTreeMap<String, String> {
    split_by_headers(
        text,
        &[
            ("insights", &["## LITERARY PSYCHOLOGY INSIGHTS"][..]),
            ("profile", &["## PERSONAL PROFILE ANALYSIS"][..]),
        ],
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct InsightsStats {
    pub llm: String,
    pub readiness: Vec<Readiness>,
    pub history: BTreeMap<String, i64>,
}

pub async fn insights_stats(pool: &SqlitePool, llm: &dyn LlmClient) -> Result<InsightsStats> {
    let books = list_books(pool).await?;
    Ok(InsightsStats {
        llm: llm.name().to_string(),
        readiness: insight_readiness(&books),
        history: history::status_counts(pool).await?.into_iter().collect(),
    })
}

pub async fn run_insights(config: &Config, request: InsightRequest) -> Result<()> {
    let llm = create_client(&config.llm);
    let prompts = PromptSet::load(&config.llm)?;
    let pool = db::connect(config).await?;

    let report = generate(&pool, llm.as_ref(), &prompts, &request).await?;

    println!(
        "insights {} ({} books, avg rating {:.2})",
        report.kind.as_str(),
        report.data_summary.total_books,
        report.data_summary.average_rating
    );
    println!();
    for (name, body) in &report.sections {
        if body.is_empty() {
            continue;
        }
        println!("## {}", name);
        println!();
        println!("{}", body);
        println!();
    }
    println!("  recorded as history #{}", report.history_id);

    pool.close().await;
    Ok(())
}

pub async fn run_history(config: &Config, limit: usize) -> Result<()> {
    let pool = db::connect(config).await?;
    let entries = history::list_history(&pool, limit).await?;

    if entries.is_empty() {
        println!("No insight history.");
    } else {
        println!("{:>5}  {:<17}  {:<16}  {:<8}  RESPONSE", "ID", "WHEN", "KIND", "STATUS");
        for e in &entries {
            let when = chrono::DateTime::from_timestamp(e.created_at, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| e.created_at.to_string());
            let preview: String = e.response.lines().next().unwrap_or("").chars().take(60).collect();
            println!(
                "{:>5}  {:<17}  {:<16}  {:<8}  {}",
                e.id, when, e.kind, e.status, preview
            );
        }
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::book;

    #[test]
    fn kinds_parse_from_str() {
        assert_eq!("quick".parse::<InsightKind>().unwrap(), InsightKind::Quick);
        assert!("roast".parse::<InsightKind>().is_err());
    }

    #[test]
    fn readiness_thresholds() {
        let books: Vec<Book> = (0..6)
            .map(|i| {
                let rating = if i < 3 { Some(4) } else { None };
                book(&i.to_string(), &format!("Book {}", i), "A", rating)
            })
            .collect();

        let r = insight_readiness(&books);
        let by_kind = |k: InsightKind| r.iter().find(|x| x.kind == k).unwrap().ready;
        assert!(by_kind(InsightKind::Insights));
        assert!(by_kind(InsightKind::Quick));
        assert!(!by_kind(InsightKind::Profile));
        assert!(by_kind(InsightKind::Recommendations));

        let empty = insight_readiness(&[]);
        assert!(empty.iter().all(|x| !x.ready));
        assert_eq!(empty[0].reason, "No books in database");
    }

    #[test]
    fn insight_sections_are_split_on_headers() {
        let text = "Intro line\n🎯 **Personality Type**\nThe Explorer.\n\n🧠 **Intellectual Profile**: Curious.\n❤️ **Emotional Preferences**\nMelancholy.\n🎭 **Dominant Themes**\nPower.\n📖 **Literary Portrait**\n**A restless mind.**";
        let s = parse_insight_sections(text);
        assert_eq!(s.len(), 5);
        assert_eq!(s["personality_type"], "The Explorer.");
        assert_eq!(s["intellectual_profile"], "Curious.");
        assert_eq!(s["emotional_preferences"], "Melancholy.");
        assert_eq!(s["dominant_themes"], "Power.");
        assert_eq!(s["literary_portrait"], "A restless mind.");
    }

    #[test]
    fn headers_on_one_line_do_not_leak_emoji() {
        let s = parse_insight_sections(
            "🎯 **Personality Type** Explorer. 🧠 **Intellectual Profile** Curious. ❤️ **Emotional Preferences** Wistful",
        );
        assert_eq!(s["personality_type"], "Explorer.");
        assert_eq!(s["intellectual_profile"], "Curious.");
        assert_eq!(s["emotional_preferences"], "Wistful");
    }

    #[test]
    fn missing_insight_sections_are_omitted() {
        let s = parse_insight_sections("🎯 **Personality Type**\nOnly this.");
        assert_eq!(s.len(), 1);
        assert_eq!(s["personality_type"], "Only this.");
    }

    #[test]
    fn quick_sections_accept_header_aliases() {
        let text = "preamble\n## HUMOROUS ROAST ANALYSIS\nYou read too much.\n## BOOK RECOMMENDATIONS\n### 1. Emma";
        let s = parse_quick_sections(text);
        assert_eq!(s["humorous"], "## HUMOROUS ROAST ANALYSIS\nYou read too much.");
        assert_eq!(s["recommendations"], "## BOOK RECOMMENDATIONS\n### 1. Emma");
    }

    #[test]
    fn quick_sections_fall_back_to_halves() {
        let text = "Try Emma.\nAnd Dune.\nA witty roast of you.\nVery sarcastic.";
        let s = parse_quick_sections(text);
        assert_eq!(s["humorous"], "A witty roast of you.\nVery sarcastic.");
        assert_eq!(s["recommendations"], "Try Emma.\nAnd Dune.");
    }

    #[test]
    fn comprehensive_sections() {
        let text = "## LITERARY PSYCHOLOGY INSIGHTS\nDeep.\n## PERSONAL PROFILE ANALYSIS\nYou.";
        let s = parse_comprehensive_sections(text);
        assert_eq!(s["insights"], "## LITERARY PSYCHOLOGY INSIGHTS\nDeep.");
        assert_eq!(s["profile"], "## PERSONAL PROFILE ANALYSIS\nYou.");

        let none = parse_comprehensive_sections("no headers");
        assert_eq!(none["insights"], "");
        assert_eq!(none["profile"], "");
    }
}
