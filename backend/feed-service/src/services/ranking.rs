//! Feed ranking.
//!
//! `score = 0.3·recency + 0.2·engagement + 0.2·social + 0.2·affinity + 0.1·quality`
//!
//! - recency: `1 / (1 + age_hours / 24)`, never zero
//! - engagement: upstream engagement score / 100
//! - social: `(likes + 2·comments + 3·shares) / 100`
//! - affinity: per (viewer, author) heuristic, cached for an hour
//! - quality: content heuristic bounded to [0, 1]
//!
//! The formula sits behind [`FeedScorer`] so a learned ranker can replace it.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::FeedCacheStore;
use crate::clients::SocialGraph;
use crate::models::FeedItem;
use crate::services::call_store;

pub const DEFAULT_AFFINITY: f64 = 0.5;
pub const STRONG_AFFINITY: f64 = 1.0;

/// Per-item inputs that do not come from the item itself.
#[derive(Debug, Clone, Copy)]
pub struct ScoringSignals {
    pub affinity: f64,
    pub quality: f64,
    pub now: DateTime<Utc>,
}

pub trait FeedScorer: Send + Sync {
    fn score(&self, item: &FeedItem, signals: &ScoringSignals) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankingWeights {
    pub recency: f64,
    pub engagement: f64,
    pub social: f64,
    pub affinity: f64,
    pub quality: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            recency: 0.3,
            engagement: 0.2,
            social: 0.2,
            affinity: 0.2,
            quality: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WeightedScorer {
    weights: RankingWeights,
}

impl WeightedScorer {
    pub fn new(weights: RankingWeights) -> Self {
        Self { weights }
    }
}

impl FeedScorer for WeightedScorer {
    fn score(&self, item: &FeedItem, signals: &ScoringSignals) -> f64 {
        let w = &self.weights;
        w.recency * recency_score(item.created_at, signals.now)
            + w.engagement * engagement_score(item)
            + w.social * social_score(item)
            + w.affinity * signals.affinity
            + w.quality * signals.quality
    }
}

/// Smooth decay: 1.0 for a fresh post, 0.5 after a day, 0.25 after three.
pub fn recency_score(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_hours = ((now - created_at).num_milliseconds().max(0) as f64) / 3_600_000.0;
    1.0 / (1.0 + age_hours / 24.0)
}

pub fn engagement_score(item: &FeedItem) -> f64 {
    item.engagement_score / 100.0
}

pub fn social_score(item: &FeedItem) -> f64 {
    (item.like_count as f64 + 2.0 * item.comment_count as f64 + 3.0 * item.share_count as f64)
        / 100.0
}

/// Content heuristic. Starts neutral and nudges for length, hashtags,
/// mentions and links.
pub fn quality_score(content: &str) -> f64 {
    let mut score: f64 = 0.5;

    let len = content.chars().count();
    if len < 10 {
        score -= 0.2;
    } else if (50..=500).contains(&len) {
        score += 0.2;
    } else if len > 1000 {
        score -= 0.1;
    }

    let words: Vec<&str> = content.split_whitespace().collect();
    let hashtags = words.iter().filter(|w| w.starts_with('#') && w.len() > 1).count();
    let mentions = words.iter().filter(|w| w.starts_with('@') && w.len() > 1).count();
    let links = words
        .iter()
        .filter(|w| w.starts_with("http://") || w.starts_with("https://"))
        .count();

    match hashtags {
        0 => {}
        1..=3 => score += 0.1,
        4..=5 => {}
        _ => score -= 0.2,
    }
    if mentions > 5 {
        score -= 0.1;
    }
    match links {
        0 => {}
        1 => score += 0.1,
        2 => {}
        _ => score -= 0.2,
    }

    score.clamp(0.0, 1.0)
}

/// Score, sort and truncate. Ties on score fall back to newest first, then
/// post id, so the same input always yields the same order.
pub fn rank_feed_items(
    items: Vec<FeedItem>,
    scorer: &dyn FeedScorer,
    affinities: &HashMap<Uuid, f64>,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<FeedItem> {
    let mut ranked: Vec<FeedItem> = items
        .into_iter()
        .map(|mut item| {
            let signals = ScoringSignals {
                affinity: affinities
                    .get(&item.author_id)
                    .copied()
                    .unwrap_or(DEFAULT_AFFINITY),
                quality: quality_score(&item.content),
                now,
            };
            item.ranking_score = scorer.score(&item, &signals);
            item
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.ranking_score
            .total_cmp(&a.ranking_score)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.post_id.cmp(&b.post_id))
    });
    ranked.truncate(limit);

    debug!("Ranked {} feed items", ranked.len());
    ranked
}

/// Looks up (viewer, author) affinity, computing and caching misses.
///
/// 1.0 for the viewer's own posts and for mutual follows, 0.5 otherwise.
/// Lookup failures fall back to 0.5.
pub struct AffinityResolver {
    cache: Arc<dyn FeedCacheStore>,
    graph: Arc<dyn SocialGraph>,
    timeout: Duration,
    concurrency: usize,
}

impl AffinityResolver {
    pub fn new(
        cache: Arc<dyn FeedCacheStore>,
        graph: Arc<dyn SocialGraph>,
        timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            cache,
            graph,
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn resolve(&self, viewer_id: Uuid, authors: &[Uuid]) -> HashMap<Uuid, f64> {
        let unique: HashSet<Uuid> = authors.iter().copied().collect();

        stream::iter(unique)
            .map(|author_id| async move {
                (author_id, self.affinity(viewer_id, author_id).await)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }

    async fn affinity(&self, viewer_id: Uuid, author_id: Uuid) -> f64 {
        if viewer_id == author_id {
            return STRONG_AFFINITY;
        }

        match call_store(
            "affinity cache get",
            self.timeout,
            self.cache.get_affinity(viewer_id, author_id),
        )
        .await
        {
            Ok(Some(score)) => return score,
            Ok(None) => {}
            Err(e) => warn!(viewer_id = %viewer_id, author_id = %author_id, "Affinity cache read failed: {}", e),
        }

        let score = match self.is_mutual(viewer_id, author_id).await {
            Ok(true) => STRONG_AFFINITY,
            Ok(false) => DEFAULT_AFFINITY,
            Err(e) => {
                warn!(viewer_id = %viewer_id, author_id = %author_id, "Affinity lookup failed: {}", e);
                return DEFAULT_AFFINITY;
            }
        };

        if let Err(e) = call_store(
            "affinity cache set",
            self.timeout,
            self.cache.set_affinity(viewer_id, author_id, score),
        )
        .await
        {
            warn!(viewer_id = %viewer_id, author_id = %author_id, "Affinity cache write failed: {}", e);
        }

        score
    }

    async fn is_mutual(&self, viewer_id: Uuid, author_id: Uuid) -> crate::error::Result<bool> {
        let follows_back = call_store(
            "is_following",
            self.timeout,
            self.graph.is_following(author_id, viewer_id),
        )
        .await?;
        if !follows_back {
            return Ok(false);
        }
        call_store(
            "is_following",
            self.timeout,
            self.graph.is_following(viewer_id, author_id),
        )
        .await
    }
}
