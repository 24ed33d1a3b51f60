use serde::{Deserialize, Serialize};

use crate::notify::Destination;
use crate::stats_api::Rank;

/// Stable user identifier, key of the one-job-per-user invariant.
pub type OwnerId = i64;

/// Per-user push subscription state.
///
/// Exactly one live instance exists per subscribed user; only the owning
/// scheduler job's tick handler mutates it, and the persisted copy is the
/// source of truth after every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollState {
    pub owner_id: OwnerId,

    /// Where pushes are delivered. Redirecting it requires a job restart.
    pub destination: Destination,

    /// Most recently observed completed battle, unset until the first tick
    /// primes it.
    #[serde(default)]
    pub last_seen_battle_id: Option<u64>,

    /// Last push message sent, deleted on the next push when the destination
    /// is a group chat.
    #[serde(default)]
    pub last_notification_message_id: Option<i64>,

    #[serde(default)]
    pub game_count: u32,

    #[serde(default)]
    pub win_count: u32,

    /// Signed run length: positive = consecutive wins, negative = consecutive
    /// losses.
    #[serde(default)]
    pub streak: i32,

    /// Opaque upstream session token. Absence or upstream rejection ends the
    /// poll.
    #[serde(default)]
    pub session_credential: Option<String>,

    /// Rank observed in the previous ranked battle, for rank-change lines.
    #[serde(default)]
    pub last_rank: Option<Rank>,

    /// Rule the stored rank was earned under; ranks are only comparable
    /// within the same rule.
    #[serde(default)]
    pub last_rule: Option<String>,
}

impl PollState {
    pub fn new(owner_id: OwnerId, destination: Destination, session_credential: String) -> Self {
        Self {
            owner_id,
            destination,
            last_seen_battle_id: None,
            last_notification_message_id: None,
            game_count: 0,
            win_count: 0,
            streak: 0,
            session_credential: Some(session_credential),
            last_rank: None,
            last_rule: None,
        }
    }

    /// Folds one battle outcome into the running counters.
    ///
    /// A win after a loss streak restarts the streak at +1 (and vice versa);
    /// the magnitude never carries across a sign flip.
    pub fn record_outcome(&mut self, victory: bool) {
        self.game_count += 1;
        if victory {
            self.win_count += 1;
            self.streak = self.streak.max(0) + 1;
        } else {
            self.streak = self.streak.min(0) - 1;
        }
    }

    /// Running win rate as a percentage, 0 before any game is recorded.
    pub fn win_rate(&self) -> f64 {
        if self.game_count == 0 {
            0.0
        } else {
            f64::from(self.win_count) / f64::from(self.game_count) * 100.0
        }
    }

    /// Explicit user-requested reset of the running statistics. The last
    /// message id is dropped as well so the next push does not delete a
    /// message from the previous run.
    pub fn reset_counters(&mut self) {
        self.game_count = 0;
        self.win_count = 0;
        self.streak = 0;
        self.last_notification_message_id = None;
    }
}

/// Outcome of comparing the newest overview entry against the recorded one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BattleDecision {
    /// No battle recorded yet: record the candidate without notifying.
    Prime,
    /// Candidate already counted, nothing to do.
    AlreadySeen,
    /// A battle newer than the recorded one completed.
    New,
}

/// Pure new-battle decision over two battle identifiers.
///
/// An unset previous id means the poll has not been primed yet, not that
/// every candidate is new; priming without notification prevents a
/// notification storm on first subscribe.
pub fn detect_new_battle(previous: Option<u64>, candidate: u64) -> BattleDecision {
    match previous {
        None => BattleDecision::Prime,
        Some(seen) if seen == candidate => BattleDecision::AlreadySeen,
        Some(_) => BattleDecision::New,
    }
}
