//! Collaborator contracts the fan-out engine consumes: posts, the follow
//! graph and user profiles. Storage is owned elsewhere; these are read-only
//! views.

mod postgres;

pub use postgres::{PgPostStore, PgSocialGraph, PgUserDirectory};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Post, UserProfile, UserRef};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn get_post(&self, post_id: Uuid) -> Result<Option<Post>>;

    /// Feed-visible posts (not deleted, not private), newest first. `cursor` is
    /// the page token of the last post already seen; the second element is the
    /// token to continue from, if any.
    async fn get_posts_by_author(
        &self,
        author_id: Uuid,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<(Vec<Post>, Option<String>)>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SocialGraph: Send + Sync {
    /// Followers of `user_id` in a stable order (oldest follow first), so
    /// offsets stay valid while new followers arrive.
    async fn get_followers(&self, user_id: Uuid, limit: usize, offset: usize)
        -> Result<Vec<UserRef>>;

    /// Accounts `user_id` follows, with their celebrity flags.
    async fn get_following(&self, user_id: Uuid, limit: usize, offset: usize)
        -> Result<Vec<UserRef>>;

    async fn is_following(&self, follower_id: Uuid, followee_id: Uuid) -> Result<bool>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user_by_id(&self, user_id: Uuid) -> Result<Option<UserProfile>>;
}
