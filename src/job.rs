use crate::browser::BrowserHandle;
use crate::models::JobState;
use chrono::{DateTime, Utc};
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Cooperative cancellation flag shared between a running job and the
/// service. Checked at page and image boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Destination for human-readable progress lines. The service feeds these to
/// the client's log stream; the CLI prints them.
pub trait ProgressSink: Send + Sync {
    fn log(&self, line: &str);
}

/// Prints progress to stdout. Used by the CLI subcommands.
pub struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn log(&self, line: &str) {
        println!("{}", line);
    }
}

/// Discards progress. Useful in tests.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn log(&self, _line: &str) {}
}

/// Snapshot of the job occupying the singleton slot.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: Uuid,
    pub client: String,
    pub summary: String,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
}

struct ActiveJob {
    info: JobInfo,
    cancel: CancellationToken,
    browser: BrowserHandle,
}

/// What `/stop` found.
pub enum StopOutcome {
    /// A job was active; cancellation is requested and the returned handle
    /// should be drained to tear the browser down immediately.
    Stopping { browser: BrowserHandle },
    NoActiveJob,
}

/// Process-wide single-job slot. At most one download job runs at a time,
/// regardless of which client asked.
#[derive(Default)]
pub struct JobController {
    slot: Mutex<Option<ActiveJob>>,
}

impl JobController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot. Fails with `JobActive` when occupied. The returned
    /// ticket releases the slot on drop, so the slot is freed even when the
    /// job path panics or errors early.
    pub fn try_start(
        self: &Arc<Self>,
        client: &str,
        summary: impl Into<String>,
        cancel: CancellationToken,
        browser: BrowserHandle,
    ) -> Result<JobTicket, crate::error::EngineError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(crate::error::EngineError::JobActive);
        }
        let info = JobInfo {
            id: Uuid::new_v4(),
            client: client.to_string(),
            summary: summary.into(),
            state: JobState::Running,
            started_at: Utc::now(),
        };
        info!("Job {} started for client {}: {}", info.id, info.client, info.summary);
        let id = info.id;
        *slot = Some(ActiveJob {
            info,
            cancel: cancel.clone(),
            browser,
        });
        Ok(JobTicket {
            controller: Arc::clone(self),
            id,
            cancel,
        })
    }

    /// Request cancellation of the active job, if any.
    pub fn stop(&self) -> StopOutcome {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_mut() {
            Some(job) => {
                job.info.state = JobState::Cancelling;
                job.cancel.request();
                info!("Job {} cancellation requested", job.info.id);
                StopOutcome::Stopping {
                    browser: Arc::clone(&job.browser),
                }
            }
            None => StopOutcome::NoActiveJob,
        }
    }

    pub fn status(&self) -> Option<JobInfo> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|job| job.info.clone())
    }

    fn release(&self, id: Uuid) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().map(|job| job.info.id) == Some(id) {
            *slot = None;
        }
    }
}

/// Exclusive claim on the job slot.
pub struct JobTicket {
    controller: Arc<JobController>,
    id: Uuid,
    cancel: CancellationToken,
}

impl JobTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for JobTicket {
    fn drop(&mut self) {
        self.controller.release(self.id);
        info!("Job {} released", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::new_browser_handle;
    use crate::error::EngineError;

    fn start(controller: &Arc<JobController>, client: &str) -> Result<JobTicket, EngineError> {
        controller.try_start(client, "idol jihyo pages 1..2", CancellationToken::new(), new_browser_handle())
    }

    #[test]
    fn second_job_is_rejected_while_first_is_active() {
        let controller = Arc::new(JobController::new());
        let ticket = start(&controller, "1-2-3-4").unwrap();
        assert!(matches!(start(&controller, "5-6-7-8"), Err(EngineError::JobActive)));
        drop(ticket);
        assert!(start(&controller, "5-6-7-8").is_ok());
    }

    #[test]
    fn dropping_the_ticket_clears_status() {
        let controller = Arc::new(JobController::new());
        let ticket = start(&controller, "1-2-3-4").unwrap();
        assert!(controller.status().is_some());
        drop(ticket);
        assert!(controller.status().is_none());
    }

    #[test]
    fn stop_requests_cancellation_and_flips_state() {
        let controller = Arc::new(JobController::new());
        let ticket = start(&controller, "1-2-3-4").unwrap();
        let cancel = ticket.cancel();
        assert!(!cancel.is_requested());
        assert!(matches!(controller.stop(), StopOutcome::Stopping { .. }));
        assert!(cancel.is_requested());
        assert_eq!(controller.status().map(|j| j.state), Some(crate::models::JobState::Cancelling));
    }

    #[test]
    fn stop_with_no_job_reports_none() {
        let controller = Arc::new(JobController::new());
        assert!(matches!(controller.stop(), StopOutcome::NoActiveJob));
    }
}
