//! Core domain model for site migration checks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::{Position, Url};

pub const CRATE_NAME: &str = "sitecheck-core";

/// Maximum number of redirect hops followed before a resolution gives up.
pub const MAX_REDIRECT_HOPS: u32 = 10;

/// Placeholder written to `target_relative_path` when the target does not exist.
pub const MISSING_PATH: &str = "Missing";
/// Placeholder written to `target_relative_path` when the target answered with an unexpected status.
pub const ERROR_PATH: &str = "Error";
/// Placeholder written to `source_relative_path` when a target page has no source counterpart.
pub const NEW_PATH: &str = "NEW";

/// One page declared by a sitemap. Identity is the URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePage {
    pub url: String,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

impl CandidatePage {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            last_modified: None,
        }
    }

    pub fn with_last_modified(mut self, last_modified: Option<DateTime<Utc>>) -> Self {
        self.last_modified = last_modified;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Present,
    PresentDifferentContent,
    RedirectedOnce,
    RedirectedChain,
    Missing,
}

impl Outcome {
    pub const ALL: [Outcome; 5] = [
        Outcome::Present,
        Outcome::PresentDifferentContent,
        Outcome::RedirectedOnce,
        Outcome::RedirectedChain,
        Outcome::Missing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Present => "Present",
            Outcome::PresentDifferentContent => "PresentDifferentContent",
            Outcome::RedirectedOnce => "RedirectedOnce",
            Outcome::RedirectedChain => "RedirectedChain",
            Outcome::Missing => "Missing",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TitleComparison {
    Identical,
    Different,
}

impl TitleComparison {
    /// Case-insensitive exact equality.
    pub fn of(a: &str, b: &str) -> Self {
        if a == b || a.to_lowercase() == b.to_lowercase() {
            TitleComparison::Identical
        } else {
            TitleComparison::Different
        }
    }

    pub fn is_different(&self) -> bool {
        matches!(self, TitleComparison::Different)
    }
}

/// Result of comparing one source page against the target site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonRecord {
    pub source_relative_path: String,
    pub source_url: String,
    pub target_relative_path: String,
    pub target_url: String,
    pub outcome: Outcome,
    #[serde(default)]
    pub source_title: String,
    #[serde(default)]
    pub target_title: String,
    #[serde(default)]
    pub source_og_title: String,
    #[serde(default)]
    pub target_og_title: String,
    #[serde(default)]
    pub title_comparison: Option<TitleComparison>,
    #[serde(default)]
    pub og_title_comparison: Option<TitleComparison>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    pub checked_at: DateTime<Utc>,
}

/// Whole persisted result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSet {
    pub cached_at: DateTime<Utc>,
    pub results: Vec<ComparisonRecord>,
}

impl ResultSet {
    pub fn stamped_now(results: Vec<ComparisonRecord>) -> Self {
        Self {
            cached_at: Utc::now(),
            results,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// `-1` while the page count is still unknown.
    pub total_pages: i64,
    pub processed_pages: i64,
    #[serde(default)]
    pub current_result: Option<ComparisonRecord>,
    pub is_complete: bool,
}

impl ProgressEvent {
    pub fn started() -> Self {
        Self {
            total_pages: -1,
            processed_pages: 0,
            current_result: None,
            is_complete: false,
        }
    }

    pub fn counts(total_pages: i64, processed_pages: i64) -> Self {
        Self {
            total_pages,
            processed_pages,
            current_result: None,
            is_complete: false,
        }
    }

    pub fn with_result(total_pages: i64, processed_pages: i64, result: ComparisonRecord) -> Self {
        Self {
            total_pages,
            processed_pages,
            current_result: Some(result),
            is_complete: false,
        }
    }

    pub fn complete(total_pages: i64, processed_pages: i64) -> Self {
        Self {
            total_pages,
            processed_pages,
            current_result: None,
            is_complete: true,
        }
    }
}

/// Element of a progress stream: either a progress update or the terminal error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckEvent {
    Failed { error: String },
    Progress(ProgressEvent),
}

impl CheckEvent {
    pub fn is_terminal(&self) -> bool {
        match self {
            CheckEvent::Failed { .. } => true,
            CheckEvent::Progress(p) => p.is_complete,
        }
    }
}

/// Terminal answer of a redirect resolution. `status == 0` means unreachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub status: u16,
    pub final_url: String,
    pub hops: u32,
}

impl Resolution {
    pub fn unreachable(url: impl Into<String>) -> Self {
        Self {
            status: 0,
            final_url: url.into(),
            hops: 0,
        }
    }
}

/// Where the target ended up, before any content comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPlacement {
    Missing,
    Error,
    SameLocation,
    RedirectedOnce,
    RedirectedChain,
}

impl TargetPlacement {
    pub fn from_status(status: u16, hops: u32) -> Self {
        match (status, hops) {
            (0 | 404, _) => TargetPlacement::Missing,
            (200, 0) => TargetPlacement::SameLocation,
            (200, 1) => TargetPlacement::RedirectedOnce,
            (200, _) => TargetPlacement::RedirectedChain,
            _ => TargetPlacement::Error,
        }
    }

    /// Whether the target page body exists and its metadata should be compared.
    pub fn is_reachable(&self) -> bool {
        matches!(
            self,
            TargetPlacement::SameLocation
                | TargetPlacement::RedirectedOnce
                | TargetPlacement::RedirectedChain
        )
    }
}

/// Outcome decision table.
///
/// `distinguish_content` selects whether a same-location match with differing titles
/// becomes [`Outcome::PresentDifferentContent`]. Redirect outcomes are never overridden.
pub fn decide_outcome(
    status: u16,
    hops: u32,
    title: Option<TitleComparison>,
    og_title: Option<TitleComparison>,
    distinguish_content: bool,
) -> Outcome {
    match TargetPlacement::from_status(status, hops) {
        TargetPlacement::Missing | TargetPlacement::Error => Outcome::Missing,
        TargetPlacement::RedirectedOnce => Outcome::RedirectedOnce,
        TargetPlacement::RedirectedChain => Outcome::RedirectedChain,
        TargetPlacement::SameLocation => {
            let differs = title.is_some_and(|c| c.is_different())
                || og_title.is_some_and(|c| c.is_different());
            if distinguish_content && differs {
                Outcome::PresentDifferentContent
            } else {
                Outcome::Present
            }
        }
    }
}

/// Path (plus query) of `page_url` with scheme and host removed. Empty paths become `/`.
pub fn relative_path(origin: &Url, page_url: &str) -> String {
    let parsed = Url::parse(page_url).or_else(|_| origin.join(page_url));
    let path = match parsed {
        Ok(url) => url[Position::BeforePath..Position::AfterQuery].to_string(),
        Err(_) => String::new(),
    };
    if path.is_empty() {
        "/".to_string()
    } else {
        path
    }
}

/// Relative path of `url` when it lives on `origin`; the full URL otherwise.
pub fn strip_origin(origin: &Url, url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) if parsed.origin() == origin.origin() => relative_path(origin, url),
        _ => url.to_string(),
    }
}

/// `origin + relative_path`, without doubling the slash between them.
pub fn join_origin(origin: &Url, relative_path: &str) -> String {
    let base = origin[..Position::BeforePath].trim_end_matches('/');
    if relative_path.starts_with('/') {
        format!("{base}{relative_path}")
    } else {
        format!("{base}/{relative_path}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceOutcome {
    Replaced(usize),
    Appended,
}

/// Replace the entry with the same `source_url`, or append when none matches.
pub fn splice_record(results: &mut Vec<ComparisonRecord>, record: ComparisonRecord) -> SpliceOutcome {
    match results.iter().position(|r| r.source_url == record.source_url) {
        Some(index) => {
            results[index] = record;
            SpliceOutcome::Replaced(index)
        }
        None => {
            results.push(record);
            SpliceOutcome::Appended
        }
    }
}

/// Per-outcome counts over a result list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeSummary {
    pub total: usize,
    pub present: usize,
    pub present_different_content: usize,
    pub redirected_once: usize,
    pub redirected_chain: usize,
    pub missing: usize,
}

impl OutcomeSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ComparisonRecord>) -> Self {
        let mut summary = Self::default();
        for record in records {
            summary.total += 1;
            match record.outcome {
                Outcome::Present => summary.present += 1,
                Outcome::PresentDifferentContent => summary.present_different_content += 1,
                Outcome::RedirectedOnce => summary.redirected_once += 1,
                Outcome::RedirectedChain => summary.redirected_chain += 1,
                Outcome::Missing => summary.missing += 1,
            }
        }
        summary
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        match outcome {
            Outcome::Present => self.present,
            Outcome::PresentDifferentContent => self.present_different_content,
            Outcome::RedirectedOnce => self.redirected_once,
            Outcome::RedirectedChain => self.redirected_chain,
            Outcome::Missing => self.missing,
        }
    }
}
