use crate::browser::{BrowserSession, PageContext};
use crate::config::DownloadSettings;
use crate::error::EngineError;
use crate::extract::{extract_image_urls, extract_post_links};
use crate::fetch::{fetch_all, ContextSource};
use crate::job::{CancellationToken, ProgressSink};
use crate::models::{CrawlTarget, ErrorScope, ImageOutcome, JobResult, OutcomeStatus, PageRange};
use crate::navigate::navigate;
use async_trait::async_trait;
use log::info;
use std::path::Path;

/// Seam between the walk loop and the browser. The walk only ever needs two
/// operations, so tests can drive it with scripted implementations.
#[async_trait]
pub trait Gallery: Send + Sync {
    /// Load a listing page and return the post URLs it links to.
    async fn post_links(&self, listing_url: &str) -> Result<Vec<String>, EngineError>;

    /// Open a post, extract its images and download them into `dir`.
    async fn process_post(
        &self,
        post_url: &str,
        dir: &Path,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<ImageOutcome>, EngineError>;
}

/// Gallery backed by the live browser: one long-lived context for listing
/// pages, a fresh context per post.
pub struct BrowserGallery<'a> {
    session: &'a BrowserSession,
    listing: PageContext,
    settings: &'a DownloadSettings,
}

impl<'a> BrowserGallery<'a> {
    pub async fn new(
        session: &'a BrowserSession,
        settings: &'a DownloadSettings,
    ) -> Result<BrowserGallery<'a>, EngineError> {
        let listing = session.new_context().await?;
        Ok(Self {
            session,
            listing,
            settings,
        })
    }

    pub async fn close(self) {
        self.listing.close().await;
    }
}

#[async_trait]
impl Gallery for BrowserGallery<'_> {
    async fn post_links(&self, listing_url: &str) -> Result<Vec<String>, EngineError> {
        navigate(self.listing.page(), listing_url, self.settings).await?;
        extract_post_links(self.listing.page()).await
    }

    async fn process_post(
        &self,
        post_url: &str,
        dir: &Path,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<ImageOutcome>, EngineError> {
        let ctx = self.session.new_context().await?;
        let outcome = process_post_in(&ctx, post_url, dir, cancel, sink, self.settings).await;
        ctx.close().await;
        outcome
    }
}

async fn process_post_in(
    ctx: &PageContext,
    post_url: &str,
    dir: &Path,
    cancel: &CancellationToken,
    sink: &dyn ProgressSink,
    settings: &DownloadSettings,
) -> Result<Vec<ImageOutcome>, EngineError> {
    navigate(ctx.page(), post_url, settings).await?;
    let images = extract_image_urls(ctx.page()).await;
    sink.log(&format!("Found {} image(s) in {}", images.len(), post_url));
    let source = ContextSource::new(ctx, settings.image_timeout_ms);
    fetch_all(&source, dir, &images, cancel, sink).await
}

/// Download the images of one post without walking a listing. Shared by the
/// single-post service route and the `post` CLI subcommand.
pub async fn download_single_post(
    session: &BrowserSession,
    settings: &DownloadSettings,
    post_url: &str,
    dir: &Path,
    cancel: &CancellationToken,
    sink: &dyn ProgressSink,
) -> Result<Vec<ImageOutcome>, EngineError> {
    let ctx = session.new_context().await?;
    let outcome = process_post_in(&ctx, post_url, dir, cancel, sink, settings).await;
    ctx.close().await;
    outcome
}

/// Drives a full crawl over a target's page range, accumulating counters and
/// non-fatal errors into `result`. `result` is a caller-owned accumulator so
/// partial progress survives a cancellation error.
pub struct Crawler<'a> {
    gallery: &'a dyn Gallery,
    settings: &'a DownloadSettings,
    site_base: &'a str,
    sink: &'a dyn ProgressSink,
    cancel: &'a CancellationToken,
}

impl<'a> Crawler<'a> {
    pub fn new(
        gallery: &'a dyn Gallery,
        settings: &'a DownloadSettings,
        site_base: &'a str,
        sink: &'a dyn ProgressSink,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            gallery,
            settings,
            site_base,
            sink,
            cancel,
        }
    }

    /// Walk the target's listing pages. Listing and post failures are
    /// recorded and the walk continues; open-ended walks additionally stop
    /// after a run of consecutive listing failures, since an unreachable
    /// site would otherwise never terminate them.
    pub async fn run(
        &self,
        target: &CrawlTarget,
        dir: &Path,
        result: &mut JobResult,
    ) -> Result<(), EngineError> {
        info!("Starting crawl: {}", target);
        let end = match target.range {
            PageRange::Bounded { end, .. } => Some(end),
            PageRange::UntilEmpty { .. } => None,
        };
        let mut page = target.range.start();
        let mut consecutive_failures = 0u32;

        loop {
            if let Some(end) = end {
                if page > end {
                    break;
                }
            }
            if self.cancel.is_requested() {
                return Err(EngineError::Cancelled);
            }

            let url = target.listing_url(self.site_base, page);
            self.sink.log(&format!("Opening page {}: {}", page, url));
            match self.gallery.post_links(&url).await {
                Err(e) if e.is_cancelled() => return Err(EngineError::Cancelled),
                Err(e) => {
                    self.sink.log(&format!("Failed to load page {}: {}", page, e));
                    result.record_error(ErrorScope::Page, page.to_string(), &e);
                    consecutive_failures += 1;
                    if end.is_none() && consecutive_failures >= self.settings.max_consecutive_page_failures {
                        self.sink.log(&format!(
                            "Stopping after {} consecutive page failures",
                            consecutive_failures
                        ));
                        break;
                    }
                }
                Ok(links) => {
                    consecutive_failures = 0;
                    result.pages_processed += 1;
                    if links.is_empty() {
                        self.sink.log(&format!("No posts found on page {}", page));
                        if end.is_none() {
                            self.sink.log("Reached the end of the listing");
                            break;
                        }
                    } else {
                        self.sink.log(&format!("Found {} post(s) on page {}", links.len(), page));
                        self.process_page(&links, dir, result).await?;
                    }
                }
            }
            page += 1;
        }

        info!(
            "Crawl finished: {} page(s), {} post(s), {} image(s), {} error(s)",
            result.pages_processed,
            result.posts_processed,
            result.images_downloaded,
            result.errors.len()
        );
        Ok(())
    }

    async fn process_page(
        &self,
        links: &[String],
        dir: &Path,
        result: &mut JobResult,
    ) -> Result<(), EngineError> {
        for link in links {
            if self.cancel.is_requested() {
                return Err(EngineError::Cancelled);
            }
            match self.gallery.process_post(link, dir, self.cancel, self.sink).await {
                Err(e) if e.is_cancelled() => return Err(EngineError::Cancelled),
                Err(e) => {
                    self.sink.log(&format!("Failed to process {}: {}", link, e));
                    result.record_error(ErrorScope::Post, link.as_str(), &e);
                }
                Ok(outcomes) => {
                    result.posts_processed += 1;
                    for outcome in outcomes {
                        match outcome.status {
                            OutcomeStatus::Saved => result.images_downloaded += 1,
                            OutcomeStatus::Skipped => {}
                            OutcomeStatus::Failed(message) => {
                                result.record_error(ErrorScope::Image, outcome.filename, message);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
