//! Out-of-band removal of orphaned temporary objects.
//!
//! Aborted transfers leave their temporary object (or incomplete upload)
//! behind. The sweeper deletes those older than a threshold. It runs on its
//! own schedule and never on the request path.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::DestinationStore;

/// Default age after which a temporary object counts as orphaned.
pub const DEFAULT_ORPHAN_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Summary of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Temporary objects found.
    pub scanned: usize,
    /// Orphans removed.
    pub deleted: usize,
    /// Orphans that could not be removed.
    pub failed: usize,
}

/// Deletes stale temporary objects from a destination store.
#[derive(Debug, Clone)]
pub struct OrphanSweeper {
    destination: Arc<dyn DestinationStore>,
    max_age: Duration,
}

impl OrphanSweeper {
    /// Create a sweeper removing temps older than `max_age`.
    #[must_use]
    pub fn new(destination: Arc<dyn DestinationStore>, max_age: Duration) -> Self {
        Self {
            destination,
            max_age,
        }
    }

    /// Remove every temporary object last modified more than `max_age` before `now`.
    ///
    /// # Errors
    ///
    /// Fails only if the listing fails. Individual delete failures are counted
    /// in [`SweepReport::failed`].
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let temps = self.destination.list_temp_objects().await?;
        let mut report = SweepReport {
            scanned: temps.len(),
            ..SweepReport::default()
        };

        for temp in &temps {
            let old_enough = (now - temp.last_modified)
                .to_std()
                .is_ok_and(|age| age >= self.max_age);
            if !old_enough {
                continue;
            }
            match self.destination.discard_temp(temp).await {
                Ok(()) => {
                    debug!(temp_key = %temp.key, "removed orphaned temporary object");
                    report.deleted += 1;
                }
                Err(e) => {
                    warn!(temp_key = %temp.key, error = %e, "failed to remove orphaned temporary object");
                    report.failed += 1;
                }
            }
        }

        info!(
            scanned = report.scanned,
            deleted = report.deleted,
            failed = report.failed,
            "orphan sweep finished"
        );
        Ok(report)
    }

    /// Sweep every `period` forever. The first sweep runs immediately.
    pub async fn run_every(self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep(Utc::now()).await {
                warn!(error = %e, "orphan sweep could not list temporary objects");
            }
        }
    }
}
