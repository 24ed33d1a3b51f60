use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::stats_api::{BattleFetcher, StatsError};
use crate::store::PollStore;

/// Sweep cadence of the reference deployment.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Outcome of one full sweep over the stored sessions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub invalidated: usize,
    pub errored: usize,
}

/// Periodically exercises every stored session credential so invalidated
/// ones get flagged even for users without an active push job.
///
/// Runs on its own long cadence, independent of the per-user polling jobs.
/// It never stops a push job itself; an affected job discovers the same
/// invalidation on its own next tick.
pub struct KeepAliveSweeper {
    fetcher: Arc<dyn BattleFetcher>,
    store: Arc<dyn PollStore>,
    period: Duration,
}

impl KeepAliveSweeper {
    pub fn new(
        fetcher: Arc<dyn BattleFetcher>,
        store: Arc<dyn PollStore>,
        period: Duration,
    ) -> Self {
        Self {
            fetcher,
            store,
            period,
        }
    }

    /// Spawns the recurring sweep loop. The first sweep runs immediately.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.sweep().await {
                    Ok(report) => info!(
                        "keep-alive sweep done: {checked} sessions checked, {invalidated} invalidated, {errored} skipped on errors",
                        checked = report.checked,
                        invalidated = report.invalidated,
                        errored = report.errored
                    ),
                    Err(err) => error!("keep-alive sweep could not enumerate sessions: {err}"),
                }
            }
        })
    }

    /// One sweep over all stored sessions. Individual failures never abort
    /// the sweep; only failing to enumerate the user set is an error.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let sessions = self.store.stored_sessions().await?;
        let mut report = SweepReport::default();

        for (owner, credential) in sessions {
            report.checked += 1;
            match self.fetcher.fetch_overview(&credential).await {
                Ok(_) => {}
                Err(StatsError::SessionInvalid) => {
                    match self.store.clear_session(owner).await {
                        Ok(()) => {
                            report.invalidated += 1;
                            info!("cleared invalidated session for user {owner}");
                        }
                        Err(err) => {
                            report.errored += 1;
                            warn!("failed to clear session for user {owner}: {err}");
                        }
                    }
                }
                Err(err) => {
                    report.errored += 1;
                    debug!("keep-alive check for user {owner} failed: {err}");
                }
            }
        }

        Ok(report)
    }
}
