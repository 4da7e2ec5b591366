//! Push/pull routing for authors.
//!
//! The fan-out worker decides at write time and the feed reader decides at
//! read time; both must hold the same `CelebrityPolicy` value or posts get
//! dropped or duplicated.

use serde::{Deserialize, Serialize};

use crate::models::{UserProfile, UserRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutStrategy {
    /// Copy the post into every follower's timeline
    Push,
    /// Store once; followers fetch it on read
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CelebrityPolicy {
    threshold: i64,
}

impl CelebrityPolicy {
    pub fn new(threshold: i64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    /// Pull when flagged or at/above the threshold.
    pub fn classify(&self, is_celebrity: bool, follower_count: i64) -> FanoutStrategy {
        if is_celebrity || follower_count >= self.threshold {
            FanoutStrategy::Pull
        } else {
            FanoutStrategy::Push
        }
    }

    pub fn classify_author(&self, author: &UserProfile) -> FanoutStrategy {
        self.classify(author.is_celebrity, author.follower_count)
    }

    pub fn classify_ref(&self, user: &UserRef) -> FanoutStrategy {
        self.classify(user.is_celebrity, user.follower_count)
    }
}

impl Default for CelebrityPolicy {
    fn default() -> Self {
        Self::new(100_000)
    }
}
