use crate::config::BrowserSettings;
use crate::error::EngineError;
use crate::navigate::{with_retry, RetryPolicy};
use base64::Engine as _;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    ErrorReason, Headers, ResourceType, SetExtraHttpHeadersParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use log::{debug, info, warn};
use serde_json::json;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::timeout;

/// Shared slot holding the live browser instance. The job controller keeps a
/// clone so `/stop` can tear the engine down from under an in-flight crawl;
/// dropping the `Browser` severs every open CDP session.
pub type BrowserHandle = Arc<tokio::sync::Mutex<Option<Browser>>>;

pub fn new_browser_handle() -> BrowserHandle {
    Arc::new(tokio::sync::Mutex::new(None))
}

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

const VIEWPORT: (i64, i64) = (1365, 768);

/// Fingerprint-masking script installed before any page script runs.
/// Based on puppeteer-extra-plugin-stealth techniques.
const STEALTH_SCRIPT: &str = r#"
    Object.defineProperty(navigator, 'webdriver', {
        get: () => undefined,
        configurable: true
    });
    window.chrome = window.chrome || { runtime: {}, loadTimes: function() {}, csi: function() {}, app: {} };
    Object.defineProperty(navigator, 'plugins', {
        get: () => [
            { name: 'Chrome PDF Plugin', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
            { name: 'Chrome PDF Viewer', filename: 'mhjfbmdgcfjbbpaeojofohoefgiehjai', description: '' },
            { name: 'Native Client', filename: 'internal-nacl-plugin', description: '' }
        ],
        configurable: true
    });
    Object.defineProperty(navigator, 'languages', {
        get: () => ['en-US', 'en'],
        configurable: true
    });
    delete window.cdc_adoQpoasnfa76pfcZLmcfl_Array;
    delete window.cdc_adoQpoasnfa76pfcZLmcfl_Promise;
    delete window.cdc_adoQpoasnfa76pfcZLmcfl_Symbol;
"#;

/// Common Chrome/Chromium locations, checked in order.
const CHROME_PATHS: &[&str] = &[
    "/usr/bin/chromium-browser",
    "/usr/bin/chromium",
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/snap/bin/chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

fn find_chrome(settings: &BrowserSettings) -> Option<PathBuf> {
    if let Some(path) = &settings.executable {
        return Some(path.clone());
    }
    CHROME_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

fn cdp_err(err: impl std::fmt::Display) -> EngineError {
    EngineError::Browser(err.to_string())
}

fn build_config(settings: &BrowserSettings) -> Result<BrowserConfig, EngineError> {
    let mut builder = BrowserConfig::builder()
        .no_sandbox()
        .incognito()
        .args(vec![
            "--disable-setuid-sandbox",
            "--disable-gpu",
            "--disable-dev-shm-usage",
            "--disable-extensions",
            "--disable-blink-features=AutomationControlled",
            "--no-first-run",
            "--no-default-browser-check",
            "--mute-audio",
            "--hide-scrollbars",
        ]);
    if !settings.headless {
        builder = builder.with_head();
    }
    if let Some(path) = find_chrome(settings) {
        debug!("Using browser executable {}", path.display());
        builder = builder.chrome_executable(path);
    }
    for arg in &settings.extra_args {
        builder = builder.arg(arg);
    }
    builder
        .build()
        .map_err(|e| EngineError::Browser(format!("failed to build browser config: {}", e)))
}

/// The single shared browsing engine instance for a job.
pub struct BrowserSession {
    handle: BrowserHandle,
}

impl BrowserSession {
    /// Launch the browser with retries, storing the instance into `handle`
    /// so it can be torn down externally.
    pub async fn launch(settings: &BrowserSettings, handle: BrowserHandle) -> Result<Self, EngineError> {
        let policy = RetryPolicy {
            max_attempts: settings.launch_attempts.max(1),
            base_delay: Duration::from_secs(settings.launch_backoff_secs),
        };
        let (browser, mut handler) = with_retry("browser launch", policy, || async {
            Browser::launch(build_config(settings)?)
                .await
                .map_err(|e| EngineError::Browser(format!("launch failed: {}", e)))
        })
        .await?;

        tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if let Err(e) = h {
                    debug!("Browser handler event error: {}", e);
                }
            }
        });
        *handle.lock().await = Some(browser);
        info!("Headless browser started");
        Ok(Self { handle })
    }

    pub fn handle(&self) -> BrowserHandle {
        Arc::clone(&self.handle)
    }

    /// Open and configure a fresh isolated context (page).
    pub async fn new_context(&self) -> Result<PageContext, EngineError> {
        let guard = self.handle.lock().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| EngineError::Browser("browser has been shut down".to_string()))?;
        let page = browser.new_page("about:blank").await.map_err(cdp_err)?;
        drop(guard);
        PageContext::configure(page).await
    }

    /// Graceful teardown: drop the instance and let the child process exit.
    pub async fn shutdown(self) {
        if self.handle.lock().await.take().is_some() {
            info!("Headless browser stopped");
        }
    }
}

/// An isolated, configured browsing context with a per-context image
/// allow-list enforced through request interception.
pub struct PageContext {
    page: Page,
    allowed_images: Arc<Mutex<HashSet<String>>>,
}

impl PageContext {
    async fn configure(page: Page) -> Result<Self, EngineError> {
        page.execute(SetUserAgentOverrideParams::new(USER_AGENT))
            .await
            .map_err(cdp_err)?;
        page.execute(
            SetExtraHttpHeadersParams::new(Headers::new(json!({
                "Accept": "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                "Accept-Language": "en-US,en;q=0.9",
            }))),
        )
        .await
        .map_err(cdp_err)?;
        page.execute(SetDeviceMetricsOverrideParams::new(
            VIEWPORT.0, VIEWPORT.1, 1.0, false,
        ))
        .await
        .map_err(cdp_err)?;
        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(STEALTH_SCRIPT))
            .await
            .map_err(cdp_err)?;

        let allowed_images = Arc::new(Mutex::new(HashSet::new()));
        install_interception(&page, Arc::clone(&allowed_images)).await?;

        Ok(Self {
            page,
            allowed_images,
        })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Permit the next deliberate fetch of `url` through the interception
    /// policy. Called immediately before each intentional image download.
    pub fn allow_image(&self, url: &str) {
        self.allowed_images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string());
    }

    /// Fetch an image through the live browser session. The fetch runs in
    /// the page's JavaScript context so it carries the session's cookies and
    /// fingerprint, exactly as a navigation to the URL would.
    pub async fn fetch_image(&self, url: &str, timeout_ms: u64) -> Result<Vec<u8>, EngineError> {
        self.allow_image(url);

        // Embed as a JSON string literal so arbitrary URLs cannot break out
        // of the script.
        let url_literal = serde_json::to_string(url)
            .map_err(|e| EngineError::navigation(url, e))?;
        let script = format!(
            r#"
            (async () => {{
                try {{
                    const response = await fetch({url}, {{ credentials: 'include' }});
                    if (!response.ok) {{
                        return {{ error: 'HTTP ' + response.status }};
                    }}
                    const blob = await response.blob();
                    const bytes = new Uint8Array(await blob.arrayBuffer());
                    let binary = '';
                    for (let i = 0; i < bytes.length; i++) {{
                        binary += String.fromCharCode(bytes[i]);
                    }}
                    return {{ data: btoa(binary), size: bytes.length }};
                }} catch (e) {{
                    return {{ error: e.toString() }};
                }}
            }})()
            "#,
            url = url_literal
        );

        let evaluated = timeout(Duration::from_millis(timeout_ms), self.page.evaluate(script))
            .await
            .map_err(|_| EngineError::navigation(url, format!("image fetch timed out after {}ms", timeout_ms)))?
            .map_err(|e| EngineError::navigation(url, e))?;
        let result: serde_json::Value = evaluated
            .into_value()
            .map_err(|e| EngineError::navigation(url, e))?;

        if let Some(error) = result.get("error").and_then(|e| e.as_str()) {
            return Err(EngineError::navigation(url, error));
        }
        let data = result
            .get("data")
            .and_then(|d| d.as_str())
            .ok_or_else(|| EngineError::navigation(url, "empty fetch response"))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| EngineError::navigation(url, e))
    }

    /// Close the context. Failures are logged, not fatal.
    pub async fn close(self) {
        if let Err(e) = self.page.close().await {
            warn!("Error closing page: {}", e);
        }
    }
}

fn is_allowed(allowed: &Mutex<HashSet<String>>, url: &str) -> bool {
    allowed
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(url)
}

/// The interception policy: stylesheets, fonts and media are always blocked;
/// image requests pass only when allow-listed.
fn should_block(
    resource_type: &ResourceType,
    url: &str,
    allowed: &Mutex<HashSet<String>>,
) -> bool {
    match resource_type {
        ResourceType::Stylesheet | ResourceType::Font | ResourceType::Media => true,
        ResourceType::Image => !is_allowed(allowed, url),
        // In-page fetches of image URLs are still image requests as far as
        // the allow-list is concerned.
        _ => crate::fetch::looks_like_image(url) && !is_allowed(allowed, url),
    }
}

async fn install_interception(
    page: &Page,
    allowed: Arc<Mutex<HashSet<String>>>,
) -> Result<(), EngineError> {
    page.execute(EnableParams::default()).await.map_err(cdp_err)?;
    let mut events = page
        .event_listener::<EventRequestPaused>()
        .await
        .map_err(cdp_err)?;

    let page = page.clone();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let url = event.request.url.clone();
            let blocked = should_block(&event.resource_type, &url, &allowed);
            let request_id = event.request_id.clone();
            let outcome = if blocked {
                page.execute(FailRequestParams::new(request_id, ErrorReason::BlockedByClient))
                    .await
                    .map(|_| ())
            } else {
                page.execute(ContinueRequestParams::new(request_id))
                    .await
                    .map(|_| ())
            };
            // A verdict can race the request being gone (navigation, page
            // close); later paused requests still need theirs, so keep
            // draining the stream.
            if let Err(e) = outcome {
                debug!("Interception verdict for {} not delivered: {}", url, e);
            }
        }
    });
    Ok(())
}
