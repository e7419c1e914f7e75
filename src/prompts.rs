//! Prompt templates and rendering.
//!
//! Templates are Markdown files with `{name}` placeholders. `{{` and `}}`
//! render as literal braces. Rendering fails on an unknown or unterminated
//! placeholder rather than sending a half-filled prompt.
//!
//! The built-in templates are compiled in; `llm.prompt_dir` may hold
//! `<name>.md` files that replace individual ones.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::LlmConfig;
use crate::error::ShelfError;
use crate::models::Book;
use crate::stats::ReadingStats;

const REVIEW_PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Template {
    Insight,
    Profile,
    Quick,
    Comprehensive,
    Recommendation,
}

impl Template {
    pub const ALL: [Template; 5] = [
        Template::Insight,
        Template::Profile,
        Template::Quick,
        Template::Comprehensive,
        Template::Recommendation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Template::Insight => "insight",
            Template::Profile => "profile",
            Template::Quick => "quick",
            Template::Comprehensive => "comprehensive",
            Template::Recommendation => "recommendation",
        }
    }

    fn builtin(self) -> &'static str {
        match self {
            Template::Insight => include_str!("../prompts/insight.md"),
            Template::Profile => include_str!("../prompts/profile.md"),
            Template::Quick => include_str!("../prompts/quick.md"),
            Template::Comprehensive => include_str!("../prompts/comprehensive.md"),
            Template::Recommendation => include_str!("../prompts/recommendation.md"),
        }
    }
}

/// The active set of templates.
#[derive(Debug, Clone)]
pub struct PromptSet {
    templates: BTreeMap<Template, String>,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            templates: Template::ALL
                .iter()
                .map(|t| (*t, t.builtin().to_string()))
                .collect(),
        }
    }
}

impl PromptSet {
    /// Built-ins, overridden by any `<name>.md` found in `llm.prompt_dir`.
    pub fn load(config: &LlmConfig) -> Result<Self> {
        let mut set = Self::default();
        if let Some(dir) = &config.prompt_dir {
            set.apply_overrides(dir)?;
        }
        Ok(set)
    }

    fn apply_overrides(&mut self, dir: &Path) -> Result<()> {
        for template in Template::ALL {
            let path = dir.join(format!("{}.md", template.name()));
            if path.is_file() {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read prompt {}", path.display()))?;
                tracing::debug!(template = template.name(), path = %path.display(), "prompt override");
                self.templates.insert(template, content);
            }
        }
        Ok(())
    }

    pub fn get(&self, template: Template) -> &str {
        self.templates
            .get(&template)
            .map(String::as_str)
            .unwrap_or_else(|| template.builtin())
    }

    pub fn render(&self, template: Template, vars: &BTreeMap<&str, String>) -> Result<String> {
        render(self.get(template), vars)
            .with_context(|| format!("rendering '{}' prompt", template.name()))
    }
}

/// Substitute `{name}` placeholders from `vars`.
pub fn render(template: &str, vars: &BTreeMap<&str, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' if chars.peek().map(|(_, n)| *n) == Some('{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek().map(|(_, n)| *n) == Some('}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let rest = &template[pos + 1..];
                let Some(end) = rest.find('}') else {
                    return Err(ShelfError::validation(format!(
                        "unterminated placeholder at byte {}",
                        pos
                    ))
                    .into());
                };
                let name = &rest[..end];
                let value = vars.get(name).ok_or_else(|| {
                    ShelfError::validation(format!("unknown placeholder '{{{}}}'", name))
                })?;
                out.push_str(value);
                // Skip the name and closing brace.
                for _ in 0..name.chars().count() + 1 {
                    chars.next();
                }
            }
            '}' => {
                return Err(ShelfError::validation(format!(
                    "unmatched '}}' at byte {}",
                    pos
                ))
                .into());
            }
            _ => out.push(c),
        }
    }

    Ok(out)
}

/// One line per book, highest rated and most recently read first.
pub fn format_books(books: &[Book]) -> String {
    if books.is_empty() {
        return "No books available.".to_string();
    }

    let mut sorted: Vec<&Book> = books.iter().collect();
    sorted.sort_by(|a, b| {
        b.my_rating
            .unwrap_or(0)
            .cmp(&a.my_rating.unwrap_or(0))
            .then_with(|| b.date_read.or(b.date_added).cmp(&a.date_read.or(a.date_added)))
            .then_with(|| a.title.cmp(&b.title))
            .then_with(|| a.id.cmp(&b.id))
    });

    sorted
        .into_iter()
        .map(format_book_line)
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_book_line(book: &Book) -> String {
    let rating = book
        .my_rating
        .map(|r| r.to_string())
        .unwrap_or_else(|| "No rating".to_string());
    let date = book
        .date_read
        .or(book.date_added)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "Unknown date".to_string());

    let mut line = format!(
        "- {} by {} (Rating: {}, Read: {})",
        book.title, book.author, rating, date
    );
    if let Some(genres) = book.genres.as_deref().filter(|g| !g.is_empty()) {
        line.push_str(&format!(" [Genres: {}]", genres));
    }
    if let Some(review) = book.my_review.as_deref().filter(|r| !r.is_empty()) {
        let preview: String = review.chars().take(REVIEW_PREVIEW_CHARS).collect();
        line.push_str(&format!(" - Review: {}...", preview));
    }
    line
}

/// Variables available to every template.
pub fn prompt_variables(
    stats: &ReadingStats,
    books: &[Book],
    query: Option<&str>,
    limit: Option<usize>,
) -> Result<BTreeMap<&'static str, String>> {
    let mut vars = BTreeMap::new();
    vars.insert("stats", serde_json::to_string_pretty(stats)?);
    vars.insert("books", format_books(books));
    vars.insert("query", query.unwrap_or_default().to_string());
    vars.insert("limit", limit.map(|l| l.to_string()).unwrap_or_default());
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::book;
    use crate::stats::aggregate;
    use chrono::NaiveDate;

    fn vars(pairs: &[(&'static str, &str)]) -> BTreeMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn substitutes_and_unescapes() {
        let out = render("Hi {name}, {{literal}} }}", &vars(&[("name", "Ada")])).unwrap();
        assert_eq!(out, "Hi Ada, {literal} }");
    }

    #[test]
    fn unknown_placeholder_is_validation_error() {
        let err = render("{nope}", &vars(&[])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ShelfError>(),
            Some(ShelfError::Validation(_))
        ));
    }

    #[test]
    fn unterminated_and_stray_braces_fail() {
        assert!(render("open {name", &vars(&[("name", "x")])).is_err());
        assert!(render("close }", &vars(&[])).is_err());
    }

    #[test]
    fn placeholders_next_to_multibyte_text() {
        let out = render("📖 {title} — ok", &vars(&[("title", "Dune")])).unwrap();
        assert_eq!(out, "📖 Dune — ok");
    }

    #[test]
    fn builtin_templates_render_with_standard_variables() {
        let set = PromptSet::default();
        let books = vec![book("1", "Dune", "Frank Herbert", Some(5))];
        let v = prompt_variables(&aggregate(&books), &books, Some("space"), Some(3)).unwrap();
        for t in Template::ALL {
            let out = set.render(t, &v).unwrap();
            assert!(out.contains("Dune by Frank Herbert"), "{}", t.name());
        }
    }

    #[test]
    fn book_lines_are_sorted_and_formatted() {
        let mut a = book("1", "Emma", "Jane Austen", Some(4));
        a.date_read = NaiveDate::from_ymd_opt(2023, 5, 1);
        let mut b = book("2", "Dune", "Frank Herbert", Some(5));
        b.genres = Some("Science fiction".to_string());
        b.my_review = Some("x".repeat(150));
        let c = book("3", "Beowulf", "Unknown", None);

        let text = format_books(&[c, a, b]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            format!(
                "- Dune by Frank Herbert (Rating: 5, Read: Unknown date) [Genres: Science fiction] - Review: {}...",
                "x".repeat(100)
            )
        );
        assert_eq!(lines[1], "- Emma by Jane Austen (Rating: 4, Read: 2023-05-01)");
        assert_eq!(lines[2], "- Beowulf by Unknown (Rating: No rating, Read: Unknown date)");
    }

    #[test]
    fn rendering_is_deterministic() {
        let books = vec![
            book("1", "Dune", "Frank Herbert", Some(5)),
            book("2", "Emma", "Jane Austen", Some(4)),
        ];
        let stats = aggregate(&books);
        let set = PromptSet::default();
        let a = set
            .render(Template::Insight, &prompt_variables(&stats, &books, None, None).unwrap())
            .unwrap();
        let b = set
            .render(Template::Insight, &prompt_variables(&stats, &books, None, None).unwrap())
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn prompt_dir_overrides_single_template() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("quick.md"), "custom {books}").unwrap();
        let cfg = LlmConfig {
            prompt_dir: Some(tmp.path().to_path_buf()),
            ..LlmConfig::default()
        };
        let set = PromptSet::load(&cfg).unwrap();
        assert!(set.get(Template::Quick).starts_with("custom"));
        assert!(set.get(Template::Insight).contains("Personality Type"));
    }
}
