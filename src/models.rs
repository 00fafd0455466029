use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of gallery entity a crawl walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Idol,
    Creator,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Idol => write!(f, "idol"),
            TargetKind::Creator => write!(f, "creator"),
        }
    }
}

/// Page indices a crawl visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageRange {
    /// Inclusive index range.
    Bounded { start: u32, end: u32 },
    /// Starts at `start` and continues until a successfully loaded page
    /// yields zero post links.
    UntilEmpty { start: u32 },
}

impl PageRange {
    pub fn start(&self) -> u32 {
        match *self {
            PageRange::Bounded { start, .. } | PageRange::UntilEmpty { start } => start,
        }
    }

    /// Number of pages for bounded ranges, `None` for open-ended walks.
    pub fn len(&self) -> Option<u32> {
        match *self {
            PageRange::Bounded { start, end } => Some(end.saturating_sub(start) + 1),
            PageRange::UntilEmpty { .. } => None,
        }
    }
}

/// Immutable description of one crawl. Fixed for the lifetime of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlTarget {
    pub kind: TargetKind,
    pub name: String,
    pub range: PageRange,
}

impl CrawlTarget {
    pub fn idol(name: impl Into<String>, start: u32, end: u32) -> Self {
        Self {
            kind: TargetKind::Idol,
            name: name.into(),
            range: PageRange::Bounded { start, end },
        }
    }

    pub fn creator(name: impl Into<String>, range: PageRange) -> Self {
        Self {
            kind: TargetKind::Creator,
            name: name.into(),
            range,
        }
    }

    /// Build the listing URL for a page index. Creator listings omit the
    /// page segment on page 1; idol listings always carry it.
    pub fn listing_url(&self, base: &str, page: u32) -> String {
        let base = base.trim_end_matches('/');
        match self.kind {
            TargetKind::Idol => format!("{}/idols/{}/page/{}/", base, self.name, page),
            TargetKind::Creator if page == 1 => format!("{}/creator/{}/", base, self.name),
            TargetKind::Creator => format!("{}/creator/{}/page/{}/", base, self.name, page),
        }
    }
}

impl fmt::Display for CrawlTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.range {
            PageRange::Bounded { start, end } => {
                write!(f, "{} {} pages {}..{}", self.kind, self.name, start, end)
            }
            PageRange::UntilEmpty { start } => {
                write!(f, "{} {} pages {}..(until empty)", self.kind, self.name, start)
            }
        }
    }
}

/// Where in the walk an error was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorScope {
    Page,
    Post,
    Image,
}

/// One recorded, non-fatal failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub scope: ErrorScope,
    pub identifier: String,
    pub message: String,
}

/// Accumulated counters for a job, mutated incrementally as work completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub pages_processed: u32,
    pub posts_processed: u32,
    pub images_downloaded: u32,
    pub errors: Vec<ErrorEntry>,
}

impl JobResult {
    pub fn record_error(&mut self, scope: ErrorScope, identifier: impl Into<String>, message: impl fmt::Display) {
        self.errors.push(ErrorEntry {
            scope,
            identifier: identifier.into(),
            message: message.to_string(),
        });
    }
}

/// Outcome of processing one image URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageOutcome {
    pub filename: String,
    pub status: OutcomeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "error")]
pub enum OutcomeStatus {
    /// Downloaded and persisted on this run.
    Saved,
    /// Already present on disk; no network activity performed.
    Skipped,
    Failed(String),
}

impl ImageOutcome {
    pub fn saved(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            status: OutcomeStatus::Saved,
        }
    }

    pub fn skipped(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            status: OutcomeStatus::Skipped,
        }
    }

    pub fn failed(filename: impl Into<String>, err: impl fmt::Display) -> Self {
        Self {
            filename: filename.into(),
            status: OutcomeStatus::Failed(err.to_string()),
        }
    }

    /// Skips count as success: the file is on disk either way.
    pub fn is_success(&self) -> bool {
        !matches!(self.status, OutcomeStatus::Failed(_))
    }
}

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Cancelling => "cancelling",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idol_listing_url_always_carries_page_segment() {
        let target = CrawlTarget::idol("jihyo", 1, 5);
        assert_eq!(
            target.listing_url("https://idolfap.com", 1),
            "https://idolfap.com/idols/jihyo/page/1/"
        );
        assert_eq!(
            target.listing_url("https://idolfap.com/", 3),
            "https://idolfap.com/idols/jihyo/page/3/"
        );
    }

    #[test]
    fn creator_listing_url_omits_page_segment_on_first_page() {
        let target = CrawlTarget::creator("darkyeji", PageRange::UntilEmpty { start: 1 });
        assert_eq!(
            target.listing_url("https://idolfap.com", 1),
            "https://idolfap.com/creator/darkyeji/"
        );
        assert_eq!(
            target.listing_url("https://idolfap.com", 2),
            "https://idolfap.com/creator/darkyeji/page/2/"
        );
    }

    #[test]
    fn bounded_range_len_is_inclusive() {
        assert_eq!(PageRange::Bounded { start: 1, end: 2 }.len(), Some(2));
        assert_eq!(PageRange::Bounded { start: 4, end: 4 }.len(), Some(1));
        assert_eq!(PageRange::UntilEmpty { start: 1 }.len(), None);
    }

    #[test]
    fn skipped_outcome_counts_as_success() {
        assert!(ImageOutcome::skipped("a.jpg").is_success());
        assert!(ImageOutcome::saved("a.jpg").is_success());
        assert!(!ImageOutcome::failed("a.jpg", "boom").is_success());
    }
}
