use thiserror::Error;

/// Error taxonomy for the crawl engine.
///
/// Page- and post-level failures are recorded into the job result and the
/// walk continues; only `Cancelled` and `JobActive` propagate to the service
/// boundary as immediate responses.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Navigation failed after exhausting the retry ceiling.
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    /// Selector evaluation failed. Treated as zero matches by callers.
    #[error("selector evaluation failed: {0}")]
    Extraction(String),

    /// Filesystem failure while persisting an image. Recorded per image,
    /// never fatal to the batch.
    #[error("failed to write {filename}: {source}")]
    ImageWrite {
        filename: String,
        #[source]
        source: std::io::Error,
    },

    /// The browser engine could not be launched or a context could not be
    /// configured.
    #[error("browser error: {0}")]
    Browser(String),

    /// Cooperative cancellation was observed. Distinguished from ordinary
    /// failures so every layer can short-circuit without logging it as one.
    #[error("job cancelled")]
    Cancelled,

    /// A second job was requested while one is active.
    #[error("a download job is already running")]
    JobActive,
}

impl EngineError {
    /// Fold a chromiumoxide error into a navigation failure for `url`.
    pub fn navigation(url: impl Into<String>, err: impl std::fmt::Display) -> Self {
        EngineError::Navigation {
            url: url.into(),
            message: err.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}
