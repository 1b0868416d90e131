//! Context composition for completion requests.
//!
//! The hosting application may attach page, history, and bookmark context
//! to a request. [`build_contextual_system_prompt`] folds that context
//! into a single prompt string. It is pure and deterministic: no clock,
//! no I/O, no randomness, so identical inputs always compose identically.

use serde::{Deserialize, Serialize};

/// Maximum number of characters of page content included in a prompt.
pub const MAX_CONTENT_CHARS: usize = 5000;

/// Maximum history/bookmark entries included in a prompt.
pub const MAX_SITE_ENTRIES: usize = 10;

/// Marker appended when page content is truncated.
const ELLIPSIS: &str = "...";

/// Optional browsing context attached to a completion request.
///
/// Supplied per request by the hosting application; never persisted here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AiContext {
    /// The page currently in front of the user.
    pub page: Option<PageContext>,
    /// Recent history entries, most recent first.
    pub browsing_history: Option<Vec<SiteEntry>>,
    /// Bookmarked pages.
    pub bookmarks: Option<Vec<SiteEntry>>,
}

/// Snapshot of the current page as captured by the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageContext {
    /// Page URL.
    pub url: Option<String>,
    /// Page title.
    pub title: Option<String>,
    /// Extracted readable page text.
    pub content: Option<String>,
    /// Text the user currently has selected.
    pub selected_text: Option<String>,
}

/// A titled link, used for history and bookmark entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteEntry {
    /// Entry title.
    pub title: String,
    /// Entry URL.
    pub url: String,
}

impl AiContext {
    /// Whether any context section is present.
    pub fn is_empty(&self) -> bool {
        self.page.is_none() && self.browsing_history.is_none() && self.bookmarks.is_none()
    }
}

/// Compose a system prompt from base instructions plus browsing context.
///
/// Appends, in order: the base instructions (if any), a current-page
/// section, a history section, and a bookmarks section. Page content is
/// truncated to [`MAX_CONTENT_CHARS`] characters with an ellipsis marker;
/// history and bookmarks are capped at [`MAX_SITE_ENTRIES`] entries each.
/// Sections whose source data is absent are omitted entirely.
pub fn build_contextual_system_prompt(base: Option<&str>, context: &AiContext) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(base) = base {
        let trimmed = base.trim();
        if !trimmed.is_empty() {
            sections.push(trimmed.to_string());
        }
    }

    if let Some(page) = &context.page
        && let Some(section) = page_section(page)
    {
        sections.push(section);
    }

    if let Some(history) = &context.browsing_history
        && let Some(section) = site_section("Recent Browsing History", history)
    {
        sections.push(section);
    }

    if let Some(bookmarks) = &context.bookmarks
        && let Some(section) = site_section("Bookmarks", bookmarks)
    {
        sections.push(section);
    }

    sections.join("\n\n")
}

/// Render the current-page section, or `None` when every field is absent.
fn page_section(page: &PageContext) -> Option<String> {
    let mut lines = vec!["## Current Page".to_string()];

    if let Some(url) = non_empty(&page.url) {
        lines.push(format!("URL: {url}"));
    }
    if let Some(title) = non_empty(&page.title) {
        lines.push(format!("Title: {title}"));
    }
    if let Some(selected) = non_empty(&page.selected_text) {
        lines.push(format!("Selected text:\n{selected}"));
    }
    if let Some(content) = non_empty(&page.content) {
        lines.push(format!("Content:\n{}", truncate_chars(content, MAX_CONTENT_CHARS)));
    }

    if lines.len() == 1 {
        return None;
    }
    Some(lines.join("\n"))
}

/// Render a `- title (url)` list section, or `None` for an empty list.
fn site_section(heading: &str, entries: &[SiteEntry]) -> Option<String> {
    if entries.is_empty() {
        return None;
    }
    let mut lines = vec![format!("## {heading}")];
    for entry in entries.iter().take(MAX_SITE_ENTRIES) {
        lines.push(format!("- {} ({})", entry.title, entry.url));
    }
    Some(lines.join("\n"))
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.trim().is_empty())
}

/// Truncate to `max` characters, appending the ellipsis marker when the
/// input is longer. Counts characters, not bytes, so a cut never lands
/// inside a code point.
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}{ELLIPSIS}", &text[..idx]),
        None => text.to_string(),
    }
}
