use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Who may see a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Followers,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Followers => "followers",
            Visibility::Private => "private",
        }
    }

    /// Private posts never reach another user's feed.
    pub fn is_distributable(&self) -> bool {
        !matches!(self, Visibility::Private)
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Visibility::Public),
            "followers" => Ok(Visibility::Followers),
            "private" => Ok(Visibility::Private),
            other => Err(format!("unknown visibility: {}", other)),
        }
    }
}

/// Immutable post record owned by the post store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub like_count: u32,
    #[serde(default)]
    pub comment_count: u32,
    #[serde(default)]
    pub share_count: u32,
    /// Pre-normalized aggregate of likes/comments/shares (0-100)
    #[serde(default)]
    pub engagement_score: f64,
    #[serde(default)]
    pub visibility: Visibility,
}

impl Post {
    /// Deleted or private posts are not shown to followers.
    pub fn is_feed_visible(&self) -> bool {
        !self.is_deleted && self.visibility.is_distributable()
    }
}

/// Profile fields the fan-out engine needs from the user store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub is_celebrity: bool,
    pub follower_count: i64,
    pub is_active: bool,
}

/// Entry of a follower/following list as returned by the social graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRef {
    pub user_id: Uuid,
    pub username: String,
    pub is_celebrity: bool,
    pub follower_count: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl FanoutStatus {
    pub const ALL: [FanoutStatus; 4] = [
        FanoutStatus::Pending,
        FanoutStatus::Processing,
        FanoutStatus::Completed,
        FanoutStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FanoutStatus::Pending => "pending",
            FanoutStatus::Processing => "processing",
            FanoutStatus::Completed => "completed",
            FanoutStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FanoutStatus::Completed | FanoutStatus::Failed)
    }
}

impl fmt::Display for FanoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FanoutStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FanoutStatus::Pending),
            "processing" => Ok(FanoutStatus::Processing),
            "completed" => Ok(FanoutStatus::Completed),
            "failed" => Ok(FanoutStatus::Failed),
            other => Err(format!("unknown fanout status: {}", other)),
        }
    }
}

/// Proof of ownership handed out by a claim. Every later transition of the
/// job must present it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    pub owner: String,
    pub version: i64,
}

/// One distribution job per created post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutQueueItem {
    pub id: Uuid,
    pub post_id: Uuid,
    pub author_id: Uuid,
    pub status: FanoutStatus,
    pub priority: i32,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Earliest time the job may be claimed (retry delay)
    pub available_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Bumped on every claim; fences stale claimants
    pub version: i64,
    /// Follower positions already delivered by earlier attempts
    pub progress_offset: i64,
    pub updated_at: DateTime<Utc>,
}

impl FanoutQueueItem {
    pub fn new(post_id: Uuid, author_id: Uuid, priority: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            post_id,
            author_id,
            status: FanoutStatus::Pending,
            priority,
            retry_count: 0,
            error_message: None,
            created_at: now,
            processed_at: None,
            available_at: now,
            lease_owner: None,
            lease_expires_at: None,
            version: 0,
            progress_offset: 0,
            updated_at: now,
        }
    }

    /// Token for the current claim, if the job is held by someone.
    pub fn claim_token(&self) -> Option<ClaimToken> {
        self.lease_owner.as_ref().map(|owner| ClaimToken {
            owner: owner.clone(),
            version: self.version,
        })
    }
}

/// Denormalized copy of a post in one recipient's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTimelineEntry {
    pub user_id: Uuid,
    pub post_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub engagement_score: f64,
    pub like_count: u32,
    pub comment_count: u32,
    pub share_count: u32,
    pub inserted_at: DateTime<Utc>,
}

impl UserTimelineEntry {
    pub fn for_recipient(recipient: Uuid, post: &Post, inserted_at: DateTime<Utc>) -> Self {
        Self {
            user_id: recipient,
            post_id: post.id,
            author_id: post.author_id,
            content: post.content.clone(),
            created_at: post.created_at,
            engagement_score: post.engagement_score,
            like_count: post.like_count,
            comment_count: post.comment_count,
            share_count: post.share_count,
            inserted_at,
        }
    }
}

/// Post from a high-follower author, read on demand by followers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CelebrityPostEntry {
    pub author_id: Uuid,
    pub post_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub engagement_score: f64,
    pub like_count: u32,
    pub comment_count: u32,
    pub share_count: u32,
    pub inserted_at: DateTime<Utc>,
}

impl CelebrityPostEntry {
    pub fn from_post(post: &Post, inserted_at: DateTime<Utc>) -> Self {
        Self {
            author_id: post.author_id,
            post_id: post.id,
            content: post.content.clone(),
            created_at: post.created_at,
            engagement_score: post.engagement_score,
            like_count: post.like_count,
            comment_count: post.comment_count,
            share_count: post.share_count,
            inserted_at,
        }
    }
}

/// Which read path produced a feed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemOrigin {
    Push,
    Pull,
}

/// Request-scoped projection with its ranking score. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub post_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub engagement_score: f64,
    pub like_count: u32,
    pub comment_count: u32,
    pub share_count: u32,
    pub origin: ItemOrigin,
    pub ranking_score: f64,
}

impl From<UserTimelineEntry> for FeedItem {
    fn from(entry: UserTimelineEntry) -> Self {
        Self {
            post_id: entry.post_id,
            author_id: entry.author_id,
            content: entry.content,
            created_at: entry.created_at,
            engagement_score: entry.engagement_score,
            like_count: entry.like_count,
            comment_count: entry.comment_count,
            share_count: entry.share_count,
            origin: ItemOrigin::Push,
            ranking_score: 0.0,
        }
    }
}

impl From<CelebrityPostEntry> for FeedItem {
    fn from(entry: CelebrityPostEntry) -> Self {
        Self {
            post_id: entry.post_id,
            author_id: entry.author_id,
            content: entry.content,
            created_at: entry.created_at,
            engagement_score: entry.engagement_score,
            like_count: entry.like_count,
            comment_count: entry.comment_count,
            share_count: entry.share_count,
            origin: ItemOrigin::Pull,
            ranking_score: 0.0,
        }
    }
}

impl From<Post> for FeedItem {
    fn from(post: Post) -> Self {
        Self {
            post_id: post.id,
            author_id: post.author_id,
            content: post.content,
            created_at: post.created_at,
            engagement_score: post.engagement_score,
            like_count: post.like_count,
            comment_count: post.comment_count,
            share_count: post.share_count,
            origin: ItemOrigin::Pull,
            ranking_score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedSource {
    /// Computed from timeline rows plus celebrity pulls
    Hybrid,
    /// Served from the first-page result cache
    Cache,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedResponse {
    pub items: Vec<FeedItem>,
    pub next_page_token: Option<String>,
    pub has_more: bool,
    pub source: FeedSource,
}

/// Last position a user read up to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedCursor {
    pub user_id: Uuid,
    pub last_timestamp: DateTime<Utc>,
    pub last_post_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

/// Pushed posts that arrived after the user's last read position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadSummary {
    pub unread_count: usize,
    /// More unread posts exist than were counted
    pub capped: bool,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn record(&mut self, status: FanoutStatus, count: i64) {
        match status {
            FanoutStatus::Pending => self.pending += count,
            FanoutStatus::Processing => self.processing += count,
            FanoutStatus::Completed => self.completed += count,
            FanoutStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in FanoutStatus::ALL {
            assert_eq!(status.as_str().parse::<FanoutStatus>().unwrap(), status);
        }
        assert!("archived".parse::<FanoutStatus>().is_err());
    }

    #[test]
    fn test_new_queue_item_is_pending_and_unclaimed() {
        let now = Utc::now();
        let item = FanoutQueueItem::new(Uuid::new_v4(), Uuid::new_v4(), 5, now);
        assert_eq!(item.status, FanoutStatus::Pending);
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.available_at, now);
        assert!(item.claim_token().is_none());
    }

    #[test]
    fn test_private_and_deleted_posts_are_hidden() {
        let now = Utc::now();
        let mut post = Post {
            id: Uuid::new_v4(),
            author_id: Uuid::new_v4(),
            content: "hello".into(),
            created_at: now,
            updated_at: now,
            is_deleted: false,
            like_count: 0,
            comment_count: 0,
            share_count: 0,
            engagement_score: 0.0,
            visibility: Visibility::Public,
        };
        assert!(post.is_feed_visible());

        post.visibility = Visibility::Private;
        assert!(!post.is_feed_visible());

        post.visibility = Visibility::Followers;
        post.is_deleted = true;
        assert!(!post.is_feed_visible());
    }

    #[test]
    fn test_feed_response_uses_camel_case() {
        let response = FeedResponse {
            items: vec![],
            next_page_token: Some("abc".into()),
            has_more: true,
            source: FeedSource::Hybrid,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["nextPageToken"], "abc");
        assert_eq!(json["hasMore"], true);
        assert_eq!(json["source"], "hybrid");
    }
}
