use crate::config::RateLimitSettings;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// What a quota check saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaStatus {
    pub allowed: bool,
    pub remaining: u32,
    /// Seconds until the client's window resets. Zero when no window is open.
    pub reset_in: u64,
}

struct Record {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window image quota per client. The window opens on a client's first
/// charged image and all further charges land in it until it expires.
pub struct RateLimiter {
    ceiling: u32,
    window: Duration,
    records: Mutex<HashMap<String, Record>>,
}

impl RateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            ceiling: settings.max_images,
            window: Duration::from_secs(settings.window_secs),
            records: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Record>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inspect the client's quota without charging anything.
    pub fn check(&self, client: &str) -> QuotaStatus {
        let now = Instant::now();
        let records = self.lock();
        match records.get(client) {
            Some(record) if record.reset_at > now => QuotaStatus {
                allowed: record.count < self.ceiling,
                remaining: self.ceiling.saturating_sub(record.count),
                reset_in: (record.reset_at - now).as_secs(),
            },
            _ => QuotaStatus {
                allowed: true,
                remaining: self.ceiling,
                reset_in: 0,
            },
        }
    }

    /// Charge `amount` images to the client. Charging zero is a no-op so a
    /// job that saved nothing never opens a window.
    pub fn consume(&self, client: &str, amount: u32) {
        if amount == 0 {
            return;
        }
        let now = Instant::now();
        let mut records = self.lock();
        match records.get_mut(client) {
            Some(record) if record.reset_at > now => {
                record.count = record.count.saturating_add(amount);
            }
            _ => {
                records.insert(
                    client.to_string(),
                    Record {
                        count: amount,
                        reset_at: now + self.window,
                    },
                );
            }
        }
    }

    /// Drop expired windows. Bounded memory, not correctness: `check` and
    /// `consume` already ignore expired records.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, record| record.reset_at > now);
        let removed = before - records.len();
        if removed > 0 {
            debug!("Rate limiter swept {} expired record(s)", removed);
        }
    }

    /// Background task clearing expired windows on an interval.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.sweep();
            }
        });
    }
}
