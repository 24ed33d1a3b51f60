//! Battle-push scheduler core.
//!
//! Polls a game-statistics API on behalf of subscribed users, detects newly
//! completed battles, folds them into running win/loss/streak statistics and
//! pushes a formatted update to each user's chat destination. One recurring
//! job per user, at most.

pub mod message;
pub mod notify;
pub mod poll;
pub mod scheduler;
pub mod stats_api;
pub mod store;
pub mod sweeper;
