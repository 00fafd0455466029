use async_trait::async_trait;
use idolgrab::config::DownloadSettings;
use idolgrab::crawler::{Crawler, Gallery};
use idolgrab::error::EngineError;
use idolgrab::job::{CancellationToken, NullSink, ProgressSink};
use idolgrab::models::{
    CrawlTarget, ErrorScope, ImageOutcome, JobResult, PageRange,
};
use idolgrab::navigate::{with_retry, RetryPolicy};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const BASE: &str = "https://idolfap.com";

enum PageScript {
    Links(Vec<&'static str>),
    Fail,
}

enum PostScript {
    Outcomes(Vec<ImageOutcome>),
    Fail,
}

/// Scripted gallery: listing URLs and post URLs map to fixed outcomes, and
/// anything unscripted behaves like an unreachable page.
struct FakeGallery {
    pages: HashMap<String, PageScript>,
    posts: HashMap<&'static str, PostScript>,
    /// Remaining failures to serve for a listing URL before its script
    /// applies. Models a page that loads only after retries.
    flaky: Mutex<HashMap<String, u32>>,
    posts_seen: AtomicU32,
    /// Flip this token once `posts_seen` reaches the threshold.
    cancel_after: Option<(u32, CancellationToken)>,
}

impl FakeGallery {
    fn new() -> Self {
        Self {
            pages: HashMap::new(),
            posts: HashMap::new(),
            flaky: Mutex::new(HashMap::new()),
            posts_seen: AtomicU32::new(0),
            cancel_after: None,
        }
    }

    fn page(mut self, url: &str, script: PageScript) -> Self {
        self.pages.insert(url.to_string(), script);
        self
    }

    fn flaky_page(self, url: &str, failures: u32, script: PageScript) -> Self {
        self.flaky
            .lock()
            .unwrap()
            .insert(url.to_string(), failures);
        self.page(url, script)
    }

    fn post(mut self, url: &'static str, script: PostScript) -> Self {
        self.posts.insert(url, script);
        self
    }
}

#[async_trait]
impl Gallery for FakeGallery {
    async fn post_links(&self, listing_url: &str) -> Result<Vec<String>, EngineError> {
        if let Some(remaining) = self.flaky.lock().unwrap().get_mut(listing_url) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EngineError::navigation(listing_url, "connection reset"));
            }
        }
        match self.pages.get(listing_url) {
            Some(PageScript::Links(links)) => {
                Ok(links.iter().map(|s| s.to_string()).collect())
            }
            Some(PageScript::Fail) | None => {
                Err(EngineError::navigation(listing_url, "connection refused"))
            }
        }
    }

    async fn process_post(
        &self,
        post_url: &str,
        _dir: &Path,
        _cancel: &CancellationToken,
        _sink: &dyn ProgressSink,
    ) -> Result<Vec<ImageOutcome>, EngineError> {
        let seen = self.posts_seen.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((threshold, token)) = &self.cancel_after {
            if seen >= *threshold {
                token.request();
            }
        }
        match self.posts.get(post_url) {
            Some(PostScript::Outcomes(outcomes)) => Ok(outcomes.clone()),
            Some(PostScript::Fail) => Err(EngineError::navigation(post_url, "timed out")),
            None => Ok(Vec::new()),
        }
    }
}

/// Wraps a gallery with the same listing retry schedule the live engine gets
/// from its navigator, so transient listing failures are absorbed before the
/// walk sees them.
struct RetryingGallery<'a> {
    inner: &'a dyn Gallery,
    policy: RetryPolicy,
}

#[async_trait]
impl Gallery for RetryingGallery<'_> {
    async fn post_links(&self, listing_url: &str) -> Result<Vec<String>, EngineError> {
        with_retry(listing_url, self.policy, || self.inner.post_links(listing_url)).await
    }

    async fn process_post(
        &self,
        post_url: &str,
        dir: &Path,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<ImageOutcome>, EngineError> {
        self.inner.process_post(post_url, dir, cancel, sink).await
    }
}

fn settings() -> DownloadSettings {
    DownloadSettings::default()
}

fn saved(names: &[&str]) -> Vec<ImageOutcome> {
    names.iter().map(|n| ImageOutcome::saved(*n)).collect()
}

async fn run(
    gallery: &dyn Gallery,
    settings: &DownloadSettings,
    target: &CrawlTarget,
    cancel: &CancellationToken,
) -> (Result<(), EngineError>, JobResult) {
    let crawler = Crawler::new(gallery, settings, BASE, &NullSink, cancel);
    let mut result = JobResult::default();
    let dir = std::env::temp_dir();
    let outcome = crawler.run(target, &dir, &mut result).await;
    (outcome, result)
}

#[tokio::test]
async fn bounded_walk_counts_pages_posts_and_images() {
    let gallery = FakeGallery::new()
        .page(
            "https://idolfap.com/idols/jihyo/page/1/",
            PageScript::Links(vec!["https://idolfap.com/post/1/", "https://idolfap.com/post/2/", "https://idolfap.com/post/3/"]),
        )
        .page(
            "https://idolfap.com/idols/jihyo/page/2/",
            PageScript::Links(vec![]),
        )
        .post("https://idolfap.com/post/1/", PostScript::Outcomes(saved(&["a.jpg", "b.jpg"])))
        .post("https://idolfap.com/post/2/", PostScript::Outcomes(saved(&["c.jpg", "d.jpg"])))
        .post("https://idolfap.com/post/3/", PostScript::Outcomes(saved(&["e.jpg", "f.jpg"])));

    let target = CrawlTarget::idol("jihyo", 1, 2);
    let (outcome, result) = run(&gallery, &settings(), &target, &CancellationToken::new()).await;

    assert!(outcome.is_ok());
    assert_eq!(result.pages_processed, 2);
    assert_eq!(result.posts_processed, 3);
    assert_eq!(result.images_downloaded, 6);
    assert!(result.errors.is_empty());
}

#[tokio::test]
async fn transient_listing_failures_are_absorbed_by_the_retry_schedule() {
    // page 2 refuses twice, then loads empty; with retries in front of the
    // walk the whole run settles clean
    let gallery = FakeGallery::new()
        .page(
            "https://idolfap.com/idols/jihyo/page/1/",
            PageScript::Links(vec!["https://idolfap.com/post/1/", "https://idolfap.com/post/2/", "https://idolfap.com/post/3/"]),
        )
        .flaky_page(
            "https://idolfap.com/idols/jihyo/page/2/",
            2,
            PageScript::Links(vec![]),
        )
        .post("https://idolfap.com/post/1/", PostScript::Outcomes(saved(&["a.jpg", "b.jpg"])))
        .post("https://idolfap.com/post/2/", PostScript::Outcomes(saved(&["c.jpg", "d.jpg"])))
        .post("https://idolfap.com/post/3/", PostScript::Outcomes(saved(&["e.jpg", "f.jpg"])));
    let retrying = RetryingGallery {
        inner: &gallery,
        policy: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        },
    };

    let target = CrawlTarget::idol("jihyo", 1, 2);
    let (outcome, result) = run(&retrying, &settings(), &target, &CancellationToken::new()).await;

    assert!(outcome.is_ok());
    assert_eq!(result.pages_processed, 2);
    assert_eq!(result.posts_processed, 3);
    assert_eq!(result.images_downloaded, 6);
    assert!(result.errors.is_empty());
}

#[tokio::test]
async fn skipped_images_are_not_counted_as_downloads() {
    let gallery = FakeGallery::new()
        .page(
            "https://idolfap.com/idols/jihyo/page/1/",
            PageScript::Links(vec!["https://idolfap.com/post/1/"]),
        )
        .post(
            "https://idolfap.com/post/1/",
            PostScript::Outcomes(vec![
                ImageOutcome::saved("a.jpg"),
                ImageOutcome::skipped("b.jpg"),
                ImageOutcome::failed("c.jpg", "HTTP 500"),
            ]),
        );

    let target = CrawlTarget::idol("jihyo", 1, 1);
    let (outcome, result) = run(&gallery, &settings(), &target, &CancellationToken::new()).await;

    assert!(outcome.is_ok());
    assert_eq!(result.images_downloaded, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].scope, ErrorScope::Image);
    assert_eq!(result.errors[0].identifier, "c.jpg");
}

#[tokio::test]
async fn page_failure_is_recorded_and_the_walk_continues() {
    let gallery = FakeGallery::new()
        .page("https://idolfap.com/idols/jihyo/page/1/", PageScript::Fail)
        .page(
            "https://idolfap.com/idols/jihyo/page/2/",
            PageScript::Links(vec!["https://idolfap.com/post/1/"]),
        )
        .post("https://idolfap.com/post/1/", PostScript::Outcomes(saved(&["a.jpg"])));

    let target = CrawlTarget::idol("jihyo", 1, 2);
    let (outcome, result) = run(&gallery, &settings(), &target, &CancellationToken::new()).await;

    assert!(outcome.is_ok());
    // the failed page is not counted as processed
    assert_eq!(result.pages_processed, 1);
    assert_eq!(result.images_downloaded, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].scope, ErrorScope::Page);
    assert_eq!(result.errors[0].identifier, "1");
}

#[tokio::test]
async fn post_failure_is_recorded_and_the_walk_continues() {
    let gallery = FakeGallery::new()
        .page(
            "https://idolfap.com/idols/jihyo/page/1/",
            PageScript::Links(vec!["https://idolfap.com/post/bad/", "https://idolfap.com/post/ok/"]),
        )
        .post("https://idolfap.com/post/bad/", PostScript::Fail)
        .post("https://idolfap.com/post/ok/", PostScript::Outcomes(saved(&["a.jpg"])));

    let target = CrawlTarget::idol("jihyo", 1, 1);
    let (outcome, result) = run(&gallery, &settings(), &target, &CancellationToken::new()).await;

    assert!(outcome.is_ok());
    assert_eq!(result.posts_processed, 1);
    assert_eq!(result.images_downloaded, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].scope, ErrorScope::Post);
}

#[tokio::test]
async fn open_ended_walk_stops_at_first_empty_page() {
    let gallery = FakeGallery::new()
        .page(
            "https://idolfap.com/creator/darkyeji/",
            PageScript::Links(vec!["https://idolfap.com/post/1/"]),
        )
        .page(
            "https://idolfap.com/creator/darkyeji/page/2/",
            PageScript::Links(vec![]),
        )
        .post("https://idolfap.com/post/1/", PostScript::Outcomes(saved(&["a.jpg"])));

    let target = CrawlTarget::creator("darkyeji", PageRange::UntilEmpty { start: 1 });
    let (outcome, result) = run(&gallery, &settings(), &target, &CancellationToken::new()).await;

    assert!(outcome.is_ok());
    assert_eq!(result.pages_processed, 2);
    assert_eq!(result.images_downloaded, 1);
    assert!(result.errors.is_empty());
}

#[tokio::test]
async fn open_ended_walk_stops_after_consecutive_page_failures() {
    // only page 1 is reachable; everything after fails
    let gallery = FakeGallery::new().page(
        "https://idolfap.com/creator/darkyeji/",
        PageScript::Links(vec!["https://idolfap.com/post/1/"]),
    )
    .post("https://idolfap.com/post/1/", PostScript::Outcomes(saved(&["a.jpg"])));

    let target = CrawlTarget::creator("darkyeji", PageRange::UntilEmpty { start: 1 });
    let (outcome, result) = run(&gallery, &settings(), &target, &CancellationToken::new()).await;

    assert!(outcome.is_ok());
    assert_eq!(result.pages_processed, 1);
    // one error per failed page up to the consecutive-failure ceiling
    assert_eq!(
        result.errors.len() as u32,
        settings().max_consecutive_page_failures
    );
}

#[tokio::test]
async fn cancellation_preserves_partial_results() {
    let cancel = CancellationToken::new();
    let mut gallery = FakeGallery::new()
        .page(
            "https://idolfap.com/idols/jihyo/page/1/",
            PageScript::Links(vec!["https://idolfap.com/post/1/", "https://idolfap.com/post/2/", "https://idolfap.com/post/3/"]),
        )
        .post("https://idolfap.com/post/1/", PostScript::Outcomes(saved(&["a.jpg"])))
        .post("https://idolfap.com/post/2/", PostScript::Outcomes(saved(&["b.jpg"])))
        .post("https://idolfap.com/post/3/", PostScript::Outcomes(saved(&["c.jpg"])));
    gallery.cancel_after = Some((2, cancel.clone()));

    let target = CrawlTarget::idol("jihyo", 1, 5);
    let (outcome, result) = run(&gallery, &settings(), &target, &cancel).await;

    assert!(matches!(outcome, Err(EngineError::Cancelled)));
    // the first two posts completed before the flag was observed
    assert_eq!(result.posts_processed, 2);
    assert_eq!(result.images_downloaded, 2);
}
