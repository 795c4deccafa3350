//! Expiry sweeper -- the periodic task that enforces the time budget.
//!
//! One sweep scans the store for active sessions past their budget and drives
//! each through `expire`, which also sends the Disconnect. Sweeps are
//! single-flight: a tick that finds one still running is skipped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::AccessResult;
use crate::session::AccessSessionManager;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Overdue rows found.
    pub scanned: usize,
    /// Rows this sweep moved to `expired`.
    pub expired: usize,
    /// Rows whose expiry failed; retried next tick.
    pub failed: usize,
}

#[derive(Clone)]
pub struct Sweeper {
    manager: Arc<AccessSessionManager>,
    running: Arc<Mutex<()>>,
}

impl Sweeper {
    pub fn new(manager: Arc<AccessSessionManager>) -> Self {
        Self {
            manager,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Run one sweep now. `Ok(None)` means another sweep was in progress.
    ///
    /// A failed scan is an error; a failed row is counted and skipped.
    pub async fn sweep_once(&self) -> AccessResult<Option<SweepReport>> {
        let _guard = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("sweep already in progress, skipping tick");
                return Ok(None);
            }
        };

        let overdue = self.manager.overdue_sessions(Utc::now()).await?;
        let mut report = SweepReport {
            scanned: overdue.len(),
            ..SweepReport::default()
        };

        for session in overdue {
            match self.manager.expire(session.id).await {
                Ok(true) => report.expired += 1,
                // Lazy expiry or a disconnect got there first.
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(session_id = %session.id, error = %e, "failed to expire session");
                }
            }
        }

        if report.scanned > 0 {
            info!(scanned = report.scanned, expired = report.expired, failed = report.failed, "sweep finished");
        } else {
            debug!("sweep found nothing to expire");
        }
        Ok(Some(report))
    }

    /// Tick every `interval` until `shutdown` flips to `true`.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "expiry sweeper started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Store down: log and try again next tick.
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("expiry sweeper stopped");
    }
}
