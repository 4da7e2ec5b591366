//! Read path: `GetUserFeed`.
//!
//! One page is assembled from two sources:
//! - push: the viewer's precomputed timeline rows
//! - pull: recent posts of followed celebrities, fetched per author
//!
//! Both sources are read in feed order `(created_at desc, post_id asc)` and
//! strictly after the page token. A source that returned a full share may
//! hold more items, so the page stops at the earliest "last item" among such
//! sources; everything past it is served by a later page. The page is then
//! ranked, and only the ranking order differs from the pagination order.

pub mod cursor;

pub use cursor::PageToken;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CachedFeed, FeedCacheStore};
use crate::clients::{PostStore, SocialGraph};
use crate::config::FeedConfig;
use crate::db::{CelebrityPostStore, TimelineStore};
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{FeedCursor, FeedItem, FeedResponse, FeedSource, UnreadSummary, UserRef};
use crate::services::call_store;
use crate::services::classifier::{CelebrityPolicy, FanoutStrategy};
use crate::services::ranking::{rank_feed_items, AffinityResolver, FeedScorer, WeightedScorer};
use cursor::feed_order;

/// Items one source contributed to a page.
#[derive(Debug, Default)]
struct SourcePage {
    items: Vec<FeedItem>,
    /// Key of the last row read when the source returned a full share and may
    /// hold more. Rows filtered out after the read still count.
    boundary: Option<(DateTime<Utc>, Uuid)>,
}

/// Unread posts counted before a summary reports `capped`.
pub const UNREAD_CAP: usize = 99;

pub struct FeedService {
    timeline: Arc<dyn TimelineStore>,
    celebrity_posts: Arc<dyn CelebrityPostStore>,
    posts: Arc<dyn PostStore>,
    graph: Arc<dyn SocialGraph>,
    cache: Arc<dyn FeedCacheStore>,
    policy: CelebrityPolicy,
    scorer: Arc<dyn FeedScorer>,
    affinity: AffinityResolver,
    config: FeedConfig,
}

impl FeedService {
    pub fn new(
        timeline: Arc<dyn TimelineStore>,
        celebrity_posts: Arc<dyn CelebrityPostStore>,
        posts: Arc<dyn PostStore>,
        graph: Arc<dyn SocialGraph>,
        cache: Arc<dyn FeedCacheStore>,
        policy: CelebrityPolicy,
        config: FeedConfig,
    ) -> Self {
        let affinity = AffinityResolver::new(
            cache.clone(),
            graph.clone(),
            config.store_timeout,
            config.max_pull_concurrency,
        );
        Self {
            timeline,
            celebrity_posts,
            posts,
            graph,
            cache,
            policy,
            scorer: Arc::new(WeightedScorer::default()),
            affinity,
            config,
        }
    }

    /// Replace the default weighted formula.
    pub fn with_scorer(mut self, scorer: Arc<dyn FeedScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn policy(&self) -> CelebrityPolicy {
        self.policy
    }

    /// 0 means "use the default"; anything above the maximum is capped.
    pub fn normalize_limit(&self, limit: usize) -> usize {
        match limit {
            0 => self.config.default_limit,
            n => n.min(self.config.max_limit),
        }
    }

    pub async fn get_user_feed(
        &self,
        user_id: Uuid,
        limit: usize,
        page_token: Option<&str>,
    ) -> Result<FeedResponse> {
        let started = Instant::now();
        let limit = self.normalize_limit(limit);
        let token = PageToken::parse_optional(page_token)?;

        let response = resilience::with_timeout(
            self.config.request_timeout,
            self.assemble(user_id, limit, token),
        )
        .await
        .map_err(|e| AppError::from_timeout("get_user_feed", e))??;

        let source = match response.source {
            FeedSource::Hybrid => "hybrid",
            FeedSource::Cache => "cache",
        };
        metrics::record_feed_request(source, started.elapsed());
        Ok(response)
    }

    /// Pushed posts newer than the user's read position, counted from the
    /// recent timeline cache. Celebrity posts are never cached per recipient
    /// and are not counted.
    pub async fn unread_summary(&self, user_id: Uuid) -> Result<UnreadSummary> {
        let position = call_store(
            "read position get",
            self.config.store_timeout,
            self.cache.get_read_position(user_id),
        )
        .await?;
        let since = position.map(|p| p.last_timestamp);

        let recent = call_store(
            "recent items",
            self.config.store_timeout,
            self.cache.recent_items(user_id, since, UNREAD_CAP + 1),
        )
        .await?;

        Ok(UnreadSummary {
            unread_count: recent.len().min(UNREAD_CAP),
            capped: recent.len() > UNREAD_CAP,
            since,
        })
    }

    async fn assemble(
        &self,
        user_id: Uuid,
        limit: usize,
        token: Option<PageToken>,
    ) -> Result<FeedResponse> {
        if token.is_none() {
            if let Some(cached) = self.cached_first_page(user_id, limit).await {
                debug!(user_id = %user_id, "Serving feed from cache");
                return Ok(FeedResponse {
                    items: cached.items,
                    next_page_token: cached.next_page_token,
                    has_more: cached.has_more,
                    source: FeedSource::Cache,
                });
            }
        }

        let now = Utc::now();
        let celebrities = self.followed_celebrities(user_id).await;

        let push = self.read_push(user_id, limit, token.as_ref()).await?;
        let pulls = self
            .read_pull(&celebrities, limit, token.as_ref(), now)
            .await;

        let (page, resume) = Self::merge_page(push, pulls, limit);
        let has_more = resume.is_some();
        let next_page_token = resume.map(|(ts, id)| PageToken::new(ts, id).encode());
        let newest = page.first().map(|i| (i.created_at, i.post_id));

        let authors: Vec<Uuid> = page.iter().map(|i| i.author_id).collect();
        let affinities = self.affinity.resolve(user_id, &authors).await;
        let items = rank_feed_items(page, self.scorer.as_ref(), &affinities, now, limit);

        info!(
            user_id = %user_id,
            items = items.len(),
            celebrities = celebrities.len(),
            has_more,
            "Feed assembled"
        );

        let response = FeedResponse {
            items,
            next_page_token,
            has_more,
            source: FeedSource::Hybrid,
        };

        if token.is_none() {
            self.store_first_page(user_id, limit, &response, now).await;
            if let Some((ts, post_id)) = newest {
                self.record_read_position(user_id, ts, post_id, now).await;
            }
        }

        Ok(response)
    }

    async fn cached_first_page(&self, user_id: Uuid, limit: usize) -> Option<CachedFeed> {
        match call_store(
            "feed cache get",
            self.config.store_timeout,
            self.cache.get_feed(user_id, limit),
        )
        .await
        {
            Ok(hit) => hit,
            Err(e) => {
                warn!(user_id = %user_id, "Feed cache read failed: {}", e);
                None
            }
        }
    }

    async fn store_first_page(
        &self,
        user_id: Uuid,
        limit: usize,
        response: &FeedResponse,
        now: DateTime<Utc>,
    ) {
        let cached = CachedFeed {
            items: response.items.clone(),
            next_page_token: response.next_page_token.clone(),
            has_more: response.has_more,
            cached_at: now.timestamp(),
        };
        if let Err(e) = call_store(
            "feed cache set",
            self.config.store_timeout,
            self.cache.set_feed(user_id, limit, &cached),
        )
        .await
        {
            warn!(user_id = %user_id, "Feed cache write failed: {}", e);
        }
    }

    async fn record_read_position(
        &self,
        user_id: Uuid,
        last_timestamp: DateTime<Utc>,
        last_post_id: Uuid,
        now: DateTime<Utc>,
    ) {
        let cursor = FeedCursor {
            user_id,
            last_timestamp,
            last_post_id,
            updated_at: now,
        };
        if let Err(e) = call_store(
            "read position set",
            self.config.store_timeout,
            self.cache.set_read_position(&cursor),
        )
        .await
        {
            warn!(user_id = %user_id, "Recording read position failed: {}", e);
        }
    }

    /// Followed accounts routed to pull. A failed lookup degrades the feed to
    /// push-only.
    async fn followed_celebrities(&self, user_id: Uuid) -> Vec<UserRef> {
        match call_store(
            "get_following",
            self.config.store_timeout,
            self.graph
                .get_following(user_id, self.config.following_cap, 0),
        )
        .await
        {
            Ok(following) => following
                .into_iter()
                .filter(|u| self.policy.classify_ref(u) == FanoutStrategy::Pull)
                .collect(),
            Err(e) => {
                warn!(user_id = %user_id, "Following list unavailable, serving push-only feed: {}", e);
                metrics::record_degraded_read("following");
                Vec::new()
            }
        }
    }

    /// Over-fetch by one row to learn whether more rows exist.
    async fn read_push(
        &self,
        user_id: Uuid,
        limit: usize,
        token: Option<&PageToken>,
    ) -> Result<SourcePage> {
        let mut rows = call_store(
            "timeline fetch_page",
            self.config.store_timeout,
            self.timeline.fetch_page(user_id, token, limit + 1),
        )
        .await?;

        let saturated = rows.len() > limit;
        rows.truncate(limit);
        let boundary = rows
            .last()
            .filter(|_| saturated)
            .map(|r| (r.created_at, r.post_id));
        Ok(SourcePage {
            items: rows.into_iter().map(FeedItem::from).collect(),
            boundary,
        })
    }

    async fn read_pull(
        &self,
        celebrities: &[UserRef],
        limit: usize,
        token: Option<&PageToken>,
        now: DateTime<Utc>,
    ) -> Vec<SourcePage> {
        if celebrities.is_empty() {
            return Vec::new();
        }

        let share = limit.div_ceil(celebrities.len()).max(1);
        let window = ChronoDuration::from_std(self.config.pull_window)
            .unwrap_or_else(|_| ChronoDuration::hours(24));
        let since = now - window;

        stream::iter(celebrities.iter().map(|c| c.user_id))
            .map(|author_id| self.pull_author(author_id, share, since, token))
            .buffer_unordered(self.config.max_pull_concurrency.max(1))
            .filter_map(|page| async move { page })
            .collect()
            .await
    }

    /// Fetch `share + 1` posts of one celebrity, falling back to the post store
    /// when the celebrity table is unavailable. `None` when both fail.
    async fn pull_author(
        &self,
        author_id: Uuid,
        share: usize,
        since: DateTime<Utc>,
        token: Option<&PageToken>,
    ) -> Option<SourcePage> {
        let primary = call_store(
            "celebrity recent_by_author",
            self.config.store_timeout,
            self.celebrity_posts
                .recent_by_author(author_id, share + 1, since, token),
        )
        .await;

        match primary {
            Ok(mut entries) => {
                let saturated = entries.len() > share;
                entries.truncate(share);
                let boundary = entries
                    .last()
                    .filter(|_| saturated)
                    .map(|e| (e.created_at, e.post_id));
                Some(SourcePage {
                    items: entries.into_iter().map(FeedItem::from).collect(),
                    boundary,
                })
            }
            Err(e) => {
                warn!(author_id = %author_id, "Celebrity store read failed, trying post store: {}", e);
                metrics::record_degraded_read("celebrity_store");
                match call_store(
                    "get_posts_by_author",
                    self.config.store_timeout,
                    self.posts.get_posts_by_author(
                        author_id,
                        share + 1,
                        token.map(PageToken::encode),
                    ),
                )
                .await
                {
                    Ok((mut posts, _)) => {
                        let saturated = posts.len() > share;
                        posts.truncate(share);
                        let boundary = posts
                            .last()
                            .filter(|p| saturated && p.created_at >= since)
                            .map(|p| (p.created_at, p.id));
                        Some(SourcePage {
                            items: posts
                                .into_iter()
                                .filter(|p| p.is_feed_visible() && p.created_at >= since)
                                .map(FeedItem::from)
                                .collect(),
                            boundary,
                        })
                    }
                    Err(e) => {
                        warn!(author_id = %author_id, "Omitting celebrity from feed: {}", e);
                        metrics::record_degraded_read("fallback");
                        None
                    }
                }
            }
        }
    }

    /// Merge sources into one page in feed order. Returns the page and the key
    /// to resume from when more items may follow it.
    fn merge_page(
        push: SourcePage,
        pulls: Vec<SourcePage>,
        limit: usize,
    ) -> (Vec<FeedItem>, Option<(DateTime<Utc>, Uuid)>) {
        let horizon = std::iter::once(&push)
            .chain(pulls.iter())
            .filter_map(|p| p.boundary)
            .min_by(|a, b| feed_order(*a, *b));

        let mut candidates = push.items;
        for page in pulls {
            candidates.extend(page.items);
        }
        let merged = merge_and_dedup(candidates);

        let total = merged.len();
        let mut page: Vec<FeedItem> = merged
            .into_iter()
            .filter(|i| match horizon {
                Some(h) => feed_order((i.created_at, i.post_id), h).is_le(),
                None => true,
            })
            .collect();
        let deferred = total > page.len();
        let truncated = page.len() > limit;
        page.truncate(limit);

        if !(horizon.is_some() || deferred || truncated) {
            return (page, None);
        }
        // Every source is exhausted up to the horizon, so an empty page can
        // resume from it.
        let resume = page
            .last()
            .map(|i| (i.created_at, i.post_id))
            .or(horizon);
        (page, resume)
    }
}

/// Sort newest first (post id ascending on ties) and keep the first instance
/// of every post id. The sort is stable, so on a duplicate the item listed
/// earlier in the input wins.
pub fn merge_and_dedup(mut items: Vec<FeedItem>) -> Vec<FeedItem> {
    items.sort_by(|a, b| feed_order((a.created_at, a.post_id), (b.created_at, b.post_id)));

    let mut seen = HashSet::with_capacity(items.len());
    items.retain(|i| seen.insert(i.post_id));
    items
}
