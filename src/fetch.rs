use crate::browser::PageContext;
use crate::error::EngineError;
use crate::job::{CancellationToken, ProgressSink};
use crate::models::ImageOutcome;
use async_trait::async_trait;
use log::debug;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use url::Url;

/// Heuristic for URLs that point at an image, used by the interception
/// policy for requests Chrome does not type as images.
pub fn looks_like_image(url: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)\.(jpe?g|png|gif|webp|bmp|avif)(\?.*)?$")
            .unwrap_or_else(|_| Regex::new("$^").unwrap())
    });
    re.is_match(url)
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi * 16 + lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Derive a safe local filename from an image URL: the last path segment,
/// percent-decoded, with everything outside `[A-Za-z0-9._-]` replaced by
/// underscores. Deterministic, so re-runs dedupe against prior downloads.
pub fn sanitize_filename(url: &str) -> String {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or(url).to_string());
    let base = path.rsplit('/').find(|s| !s.is_empty()).unwrap_or("");
    let decoded = percent_decode(base);
    let cleaned: String = decoded
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "file".to_string()
    } else {
        cleaned
    }
}

/// Anything that can produce image bytes for a URL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, EngineError>;
}

/// Image source backed by a live browsing context: fetches run inside the
/// page so they carry its cookies and fingerprint.
pub struct ContextSource<'a> {
    ctx: &'a PageContext,
    timeout_ms: u64,
}

impl<'a> ContextSource<'a> {
    pub fn new(ctx: &'a PageContext, timeout_ms: u64) -> Self {
        Self { ctx, timeout_ms }
    }
}

#[async_trait]
impl ImageSource for ContextSource<'_> {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, EngineError> {
        self.ctx.fetch_image(url, self.timeout_ms).await
    }
}

/// Download a batch of image URLs into `dir`, skipping files that already
/// exist and continuing past per-image failures. Only cancellation aborts
/// the batch; partial outcomes are lost in that case but files already
/// renamed into place survive.
pub async fn fetch_all(
    source: &dyn ImageSource,
    dir: &Path,
    urls: &[String],
    cancel: &CancellationToken,
    sink: &dyn ProgressSink,
) -> Result<Vec<ImageOutcome>, EngineError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| EngineError::ImageWrite {
            filename: dir.display().to_string(),
            source,
        })?;

    let mut outcomes = Vec::with_capacity(urls.len());
    for url in urls {
        if cancel.is_requested() {
            return Err(EngineError::Cancelled);
        }
        let filename = sanitize_filename(url);
        let path = dir.join(&filename);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            sink.log(&format!("✓ Skipping {} (already downloaded)", filename));
            outcomes.push(ImageOutcome::skipped(filename));
            continue;
        }
        match source.fetch(url).await {
            Ok(bytes) => match write_atomic(dir, &filename, &bytes).await {
                Ok(()) => {
                    sink.log(&format!("✓ Saved {} ({} bytes)", filename, bytes.len()));
                    outcomes.push(ImageOutcome::saved(filename));
                }
                Err(e) => {
                    sink.log(&format!("✗ Failed to save {}: {}", filename, e));
                    outcomes.push(ImageOutcome::failed(filename, e));
                }
            },
            Err(e) if e.is_cancelled() => return Err(EngineError::Cancelled),
            Err(e) => {
                sink.log(&format!("✗ Failed to download {}: {}", filename, e));
                outcomes.push(ImageOutcome::failed(filename, e));
            }
        }
    }
    Ok(outcomes)
}

/// Write to a temp file in the same directory, then rename into place, so a
/// crash mid-write never leaves a half-image behind with the final name.
async fn write_atomic(dir: &Path, filename: &str, bytes: &[u8]) -> Result<(), EngineError> {
    let tmp = dir.join(format!(".{}.part", filename));
    let path = dir.join(filename);
    let write = async {
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await
    };
    match write.await {
        Ok(()) => Ok(()),
        Err(source) => {
            if let Err(e) = tokio::fs::remove_file(&tmp).await {
                debug!("Could not remove temp file {}: {}", tmp.display(), e);
            }
            Err(EngineError::ImageWrite {
                filename: filename.to_string(),
                source,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NullSink;
    use crate::models::OutcomeStatus;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeSource {
        bodies: HashMap<String, Vec<u8>>,
        calls: AtomicU32,
    }

    impl FakeSource {
        fn new(entries: &[(&str, &[u8])]) -> Self {
            Self {
                bodies: entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_vec()))
                    .collect(),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ImageSource for FakeSource {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.bodies
                .get(url)
                .cloned()
                .ok_or_else(|| EngineError::navigation(url, "404"))
        }
    }

    #[test]
    fn sanitize_decodes_and_replaces() {
        assert_eq!(
            sanitize_filename("https://cdn.example.com/img/photo%20one.jpg"),
            "photo_one.jpg"
        );
        assert_eq!(
            sanitize_filename("https://cdn.example.com/a/b/c/IMG_001.png?token=abc"),
            "IMG_001.png"
        );
        assert_eq!(sanitize_filename("https://cdn.example.com/"), "file");
        // non-ASCII collapses to underscores, one per character
        assert_eq!(sanitize_filename("https://cdn.example.com/사진.jpg"), "__.jpg");
    }

    #[test]
    fn sanitize_is_deterministic() {
        let a = sanitize_filename("https://x.test/a%2Fb.jpg");
        let b = sanitize_filename("https://x.test/a%2Fb.jpg");
        assert_eq!(a, b);
    }

    #[test]
    fn image_url_heuristic() {
        assert!(looks_like_image("https://cdn.x.test/a.JPG"));
        assert!(looks_like_image("https://cdn.x.test/a.webp?w=1200"));
        assert!(!looks_like_image("https://x.test/post/123/"));
        assert!(!looks_like_image("https://x.test/script.js"));
    }

    #[tokio::test]
    async fn saves_new_and_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"old").unwrap();

        let source = FakeSource::new(&[
            ("https://cdn.x.test/a.jpg", b"aaaa".as_slice()),
            ("https://cdn.x.test/b.jpg", b"new".as_slice()),
        ]);
        let urls = vec![
            "https://cdn.x.test/a.jpg".to_string(),
            "https://cdn.x.test/b.jpg".to_string(),
        ];
        let outcomes = fetch_all(&source, dir.path(), &urls, &CancellationToken::new(), &NullSink)
            .await
            .unwrap();

        assert_eq!(outcomes[0].status, OutcomeStatus::Saved);
        assert_eq!(outcomes[1].status, OutcomeStatus::Skipped);
        // the skip never touched the source
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(dir.path().join("a.jpg")).unwrap(), b"aaaa");
        assert_eq!(std::fs::read(dir.path().join("b.jpg")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn failure_does_not_abort_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::new(&[("https://cdn.x.test/ok.jpg", b"ok".as_slice())]);
        let urls = vec![
            "https://cdn.x.test/missing.jpg".to_string(),
            "https://cdn.x.test/ok.jpg".to_string(),
        ];
        let outcomes = fetch_all(&source, dir.path(), &urls, &CancellationToken::new(), &NullSink)
            .await
            .unwrap();

        assert!(matches!(outcomes[0].status, OutcomeStatus::Failed(_)));
        assert_eq!(outcomes[1].status, OutcomeStatus::Saved);
    }

    #[tokio::test]
    async fn source_receives_the_raw_url_not_the_filename() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = MockImageSource::new();
        source
            .expect_fetch()
            .withf(|url| url == "https://cdn.x.test/q%20r.jpg?sig=1")
            .times(1)
            .returning(|_| Ok(b"img".to_vec()));

        let urls = vec!["https://cdn.x.test/q%20r.jpg?sig=1".to_string()];
        let outcomes = fetch_all(&source, dir.path(), &urls, &CancellationToken::new(), &NullSink)
            .await
            .unwrap();
        assert_eq!(outcomes[0].filename, "q_r.jpg");
        assert!(dir.path().join("q_r.jpg").exists());
    }

    #[tokio::test]
    async fn cancellation_aborts_before_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::new(&[]);
        let cancel = CancellationToken::new();
        cancel.request();
        let urls = vec!["https://cdn.x.test/a.jpg".to_string()];
        let result = fetch_all(&source, dir.path(), &urls, &cancel, &NullSink).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }
}
