//! The push scheduler: one recurring polling job per subscribed user.
//!
//! Jobs are independently timed tokio tasks sharing nothing but the
//! persistence store. A user's ticks never overlap (the loop only awaits the
//! next interval tick after the previous tick handler returned), and
//! cancellation is cooperative: an in-flight tick always completes and
//! persists before the job winds down.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::message;
use crate::notify::Notifier;
use crate::poll::{detect_new_battle, BattleDecision, OwnerId, PollState};
use crate::stats_api::{BattleFetcher, StatsError};
use crate::store::PollStore;

/// Tick cadence of the reference deployment.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);

struct Job {
    /// Distinguishes this job from a later job for the same owner, so a
    /// terminating job never tears down its successor's registry entry.
    epoch: u64,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    jobs: Mutex<HashMap<OwnerId, Job>>,
    epochs: AtomicU64,
    fetcher: Arc<dyn BattleFetcher>,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn PollStore>,
    tick_interval: Duration,
}

/// Owns the set of active per-user polling jobs and enforces at most one job
/// per owner.
#[derive(Clone)]
pub struct PushScheduler {
    inner: Arc<Inner>,
}

impl PushScheduler {
    pub fn new(
        fetcher: Arc<dyn BattleFetcher>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn PollStore>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                epochs: AtomicU64::new(0),
                fetcher,
                notifier,
                store,
                tick_interval,
            }),
        }
    }

    /// Starts a recurring polling job for the poll's owner. Idempotent: a
    /// second start while a job exists is a no-op; callers wanting new state
    /// to take effect use [`PushScheduler::restart`].
    pub async fn start(&self, poll: PollState) -> Result<()> {
        let owner = poll.owner_id;
        let mut jobs = self.inner.jobs.lock().await;
        if jobs.contains_key(&owner) {
            debug!("push job for user {owner} already exists, ignoring start");
            return Ok(());
        }

        self.inner.store.save_poll(&poll).await?;

        let epoch = self.inner.epochs.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run_job(self.inner.clone(), poll, epoch, cancel_rx));
        jobs.insert(
            owner,
            Job {
                epoch,
                cancel,
                task,
            },
        );
        info!("started push job for user {owner}");
        Ok(())
    }

    /// Cancels the owner's job and persists the lowered push flag so the job
    /// is not revived at the next process start. Waits for the job task to
    /// finish: an in-flight tick completes and persists first, and no tick
    /// runs after this returns.
    pub async fn stop(&self, owner_id: OwnerId) -> Result<()> {
        let job = self.inner.jobs.lock().await.remove(&owner_id);
        match job {
            Some(job) => {
                let _ = job.cancel.send(true);
                if let Err(err) = job.task.await {
                    warn!("push job for user {owner_id} ended abnormally: {err}");
                }
                info!("stopped push job for user {owner_id}");
            }
            None => debug!("no push job for user {owner_id} to stop"),
        }
        self.inner.store.set_push_flag(owner_id, false).await
    }

    /// Atomic stop-then-start, for destination redirects and counter resets.
    /// The old job is fully torn down before the new one is registered.
    pub async fn restart(&self, poll: PollState) -> Result<()> {
        self.stop(poll.owner_id).await?;
        self.start(poll).await
    }

    /// Restores one job per persisted active poll. Runs once at start-up,
    /// before any new start request is accepted.
    pub async fn load_and_start_all(&self) -> Result<usize> {
        let polls = self.inner.store.load_active_polls().await?;
        let count = polls.len();
        for poll in polls {
            self.start(poll).await?;
        }
        info!("restored {count} push jobs from the store");
        Ok(count)
    }

    /// Cancels every job without touching persisted push flags, so the polls
    /// are restored on the next start. Used for process shutdown.
    pub async fn shutdown(&self) {
        let jobs: Vec<(OwnerId, Job)> = self.inner.jobs.lock().await.drain().collect();
        for (owner, job) in jobs {
            let _ = job.cancel.send(true);
            if let Err(err) = job.task.await {
                warn!("push job for user {owner} ended abnormally: {err}");
            }
        }
        info!("push scheduler shut down");
    }

    pub async fn is_active(&self, owner_id: OwnerId) -> bool {
        self.inner.jobs.lock().await.contains_key(&owner_id)
    }

    pub async fn active_count(&self) -> usize {
        self.inner.jobs.lock().await.len()
    }
}

enum TickFlow {
    Continue,
    /// Terminal for this job: tear down and flag the poll inactive.
    Stop,
}

async fn run_job(
    inner: Arc<Inner>,
    mut poll: PollState,
    epoch: u64,
    mut cancel: watch::Receiver<bool>,
) {
    let owner = poll.owner_id;
    let mut ticker = time::interval(inner.tick_interval);
    // Ticks for one user are strictly serialized; a slow tick delays the
    // next one instead of stacking up.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.changed() => break,
            _ = ticker.tick() => {
                match run_tick(&inner, &mut poll).await {
                    TickFlow::Continue => {}
                    TickFlow::Stop => {
                        teardown(&inner, owner, epoch).await;
                        break;
                    }
                }
            }
        }
    }
    debug!("push job for user {owner} exited");
}

/// Removes this job's own registry entry and flags the poll inactive. Called
/// from inside the job task when a tick hits a terminal condition.
async fn teardown(inner: &Inner, owner: OwnerId, epoch: u64) {
    {
        let mut jobs = inner.jobs.lock().await;
        if jobs.get(&owner).is_some_and(|job| job.epoch == epoch) {
            jobs.remove(&owner);
        }
    }
    if let Err(err) = inner.store.set_push_flag(owner, false).await {
        error!("failed to persist push flag for user {owner}: {err}");
    }
    info!("push job for user {owner} terminated: session no longer valid");
}

/// One polling tick for one user. Mutations to the poll are persisted once,
/// at the end of a completed tick; a tick that fails to fetch leaves the
/// state untouched for the next attempt.
async fn run_tick(inner: &Inner, poll: &mut PollState) -> TickFlow {
    let owner = poll.owner_id;
    let Some(credential) = poll.session_credential.clone() else {
        warn!("user {owner} has no stored session credential, ending push");
        return TickFlow::Stop;
    };

    let overview = match inner.fetcher.fetch_overview(&credential).await {
        Ok(overview) => overview,
        Err(StatsError::SessionInvalid) => {
            warn!("session for user {owner} rejected by the stats API");
            return TickFlow::Stop;
        }
        Err(err) => {
            debug!("skipping tick for user {owner}: {err}");
            return TickFlow::Continue;
        }
    };

    let Some(candidate) = overview.results.first() else {
        // Nothing played yet, nothing to report.
        return TickFlow::Continue;
    };

    match detect_new_battle(poll.last_seen_battle_id, candidate.battle_id) {
        BattleDecision::AlreadySeen => {}
        BattleDecision::Prime => {
            // First observation only records the baseline; notifying here
            // would replay a battle the user already knows about.
            poll.last_seen_battle_id = Some(candidate.battle_id);
            debug!(
                "primed push for user {owner} at battle {battle_id}",
                battle_id = candidate.battle_id
            );
        }
        BattleDecision::New => {
            let detail = match inner.fetcher.fetch_battle(&credential, candidate.battle_id).await
            {
                Ok(detail) => detail,
                Err(StatsError::SessionInvalid) => {
                    warn!("session for user {owner} rejected by the stats API");
                    return TickFlow::Stop;
                }
                Err(err) => {
                    debug!("skipping tick for user {owner}: {err}");
                    return TickFlow::Continue;
                }
            };
            info!(
                "new battle {battle_id} for user {owner} (victory: {victory})",
                battle_id = detail.battle_id,
                victory = detail.victory
            );

            poll.record_outcome(detail.victory);
            let rank_line = message::note_rank_change(poll, &detail);
            poll.last_seen_battle_id = Some(detail.battle_id);

            let content = message::push_battle(&detail, poll, rank_line);
            let previous_message = poll.last_notification_message_id.take();
            match inner.notifier.send(&poll.destination, &content).await {
                Ok(message_id) => {
                    poll.last_notification_message_id = Some(message_id);
                    if let Some(old_id) = previous_message {
                        if poll.destination.is_shared() {
                            if let Err(err) =
                                inner.notifier.delete(&poll.destination, old_id).await
                            {
                                debug!(
                                    "could not delete previous push message {old_id} for user {owner}: {err}"
                                );
                            }
                        }
                    }
                }
                Err(err) => {
                    // The stats update still gets persisted below; the push
                    // itself is lost, not retried beyond the notifier's own
                    // plain-text fallback.
                    warn!("push delivery failed for user {owner}: {err}");
                    poll.last_notification_message_id = previous_message;
                }
            }
        }
    }

    if let Err(err) = inner.store.save_poll(poll).await {
        error!("failed to persist poll for user {owner}: {err}");
    }
    TickFlow::Continue
}
