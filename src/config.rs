use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Process-wide configuration. Every field has a default so the binary runs
/// without a config file; a TOML file overrides selectively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Host the HTTP service binds to.
    pub host: String,
    /// Port the HTTP service binds to.
    pub port: u16,
    /// Base URL of the gallery site.
    pub site_base: String,
    /// Root directory for downloaded files.
    pub downloads_dir: PathBuf,
    /// Idol names offered by the service.
    pub idols: Vec<String>,
    /// Creator names offered by the service.
    pub creators: Vec<String>,
    pub browser: BrowserSettings,
    pub download: DownloadSettings,
    pub rate_limit: RateLimitSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            site_base: "https://idolfap.com".to_string(),
            downloads_dir: PathBuf::from("downloads"),
            idols: vec![
                "jihyo".to_string(),
                "karina".to_string(),
                "izone-yujin".to_string(),
                "park-min-young".to_string(),
            ],
            creators: vec![
                "darkyeji".to_string(),
                "twice".to_string(),
                "blackpink".to_string(),
                "redvelvet".to_string(),
            ],
            browser: BrowserSettings::default(),
            download: DownloadSettings::default(),
            rate_limit: RateLimitSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load from a TOML file, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("failed to parse config file {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }
}

/// Headless browser launch and teardown knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    /// Explicit Chrome/Chromium executable; auto-detected when unset.
    pub executable: Option<PathBuf>,
    /// Extra arguments appended to the stock launch args.
    pub extra_args: Vec<String>,
    /// Attempts for browser launch.
    pub launch_attempts: u32,
    /// Seconds to wait between launch attempts.
    pub launch_backoff_secs: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            extra_args: Vec::new(),
            launch_attempts: 3,
            launch_backoff_secs: 2,
        }
    }
}

/// Navigation and image-download knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// Per-attempt navigation timeout in milliseconds. Short by design: fail
    /// fast and retry instead of hanging on a slow page.
    pub nav_timeout_ms: u64,
    /// Navigation attempts before surfacing the last error.
    pub nav_attempts: u32,
    /// Base backoff between navigation attempts in milliseconds; the wait
    /// grows linearly with the attempt number.
    pub nav_backoff_ms: u64,
    /// Timeout for fetching one image through the browser session.
    pub image_timeout_ms: u64,
    /// Images assumed per listing page for pre-flight quota estimation.
    pub images_per_page_estimate: u32,
    /// Consecutive listing failures after which an open-ended walk stops.
    pub max_consecutive_page_failures: u32,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            nav_timeout_ms: 10_000,
            nav_attempts: 3,
            nav_backoff_ms: 500,
            image_timeout_ms: 60_000,
            images_per_page_estimate: 15,
            max_consecutive_page_failures: 3,
        }
    }
}

/// Per-client image quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Images allowed per window.
    pub max_images: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// How often expired records are swept, in seconds.
    pub sweep_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_images: 10,
            window_secs: 600,
            sweep_secs: 900,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_usable() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.rate_limit.max_images, 10);
        assert_eq!(cfg.download.nav_attempts, 3);
        assert!(!cfg.idols.is_empty());
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "port = 8080\n[rate_limit]\nmax_images = 3\nwindow_secs = 60"
        )
        .unwrap();

        let cfg = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.rate_limit.max_images, 3);
        // untouched sections keep their defaults
        assert_eq!(cfg.download.images_per_page_estimate, 15);
        assert_eq!(cfg.site_base, "https://idolfap.com");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(AppConfig::load(Some(Path::new("/nonexistent/idolgrab.toml"))).is_err());
    }
}
