//! Integration Tests: feed read path
//!
//! Coverage:
//! - paging visits every item exactly once for every page size, including
//!   timestamp ties across push and pull sources
//! - a post present in both sources is returned once
//! - celebrity store outage falls back to the post store, then omits the author
//! - the fallback keeps paging past private celebrity posts
//! - following-list outage degrades to push-only
//! - first-page caching and read position
//! - unread counts from the recent timeline cache
//! - limit normalization and malformed tokens

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use std::cmp::Ordering;
use std::collections::HashSet;
use uuid::Uuid;

use common::{post_ids, TestEnv, CELEBRITY_THRESHOLD};
use feed_service::cache::FeedCacheStore;
use feed_service::db::CelebrityPostStore;
use feed_service::error::AppError;
use feed_service::models::{
    CelebrityPostEntry, FeedItem, FeedSource, ItemOrigin, UserProfile, Visibility,
};
use feed_service::services::feed::cursor::feed_order;

fn key(item: &FeedItem) -> (chrono::DateTime<Utc>, Uuid) {
    (item.created_at, item.post_id)
}

/// Viewer following one regular author and two celebrities, with posts
/// sharing timestamps across all three.
async fn seeded_env() -> (TestEnv, Uuid, HashSet<Uuid>) {
    let mut env = TestEnv::new();
    let viewer = env.user(0);
    let friend = env.user(1);
    let stars = [env.celebrity(), env.celebrity()];
    env.follow(viewer, friend);
    for star in stars {
        env.follow(viewer, star);
    }

    let base = Utc::now() - ChronoDuration::hours(1);
    let mut expected = HashSet::new();
    for i in 0..15i64 {
        let at = base - ChronoDuration::minutes(i / 3);
        let author = match i % 3 {
            0 => friend,
            1 => stars[0],
            _ => stars[1],
        };
        expected.insert(env.publish_at(author, at).await.id);
    }
    // a burst from the regular author at one instant
    let burst = base - ChronoDuration::minutes(2);
    for _ in 0..4 {
        expected.insert(env.publish_at(friend, burst).await.id);
    }
    env.run_workers().await;
    (env, viewer, expected)
}

#[tokio::test]
async fn test_paging_returns_every_item_exactly_once_for_every_page_size() {
    let (env, viewer, expected) = seeded_env().await;
    let total = expected.len();

    for limit in 1..=total + 1 {
        let mut seen = Vec::new();
        let mut token: Option<String> = None;
        let mut previous_page: Vec<FeedItem> = Vec::new();
        let mut pages = 0;

        loop {
            let page = env
                .feed
                .get_user_feed(viewer, limit, token.as_deref())
                .await
                .unwrap();
            pages += 1;
            assert!(pages <= total + 1, "limit {} did not terminate", limit);
            assert!(page.items.len() <= limit);

            // pages never interleave in feed order
            if let (Some(last), Some(first)) = (
                previous_page.iter().map(key).max_by(|a, b| feed_order(*a, *b)),
                page.items.iter().map(key).min_by(|a, b| feed_order(*a, *b)),
            ) {
                assert_eq!(feed_order(last, first), Ordering::Less, "limit {}", limit);
            }

            seen.extend(post_ids(&page.items));
            if !page.has_more {
                assert!(page.next_page_token.is_none());
                break;
            }
            token = page.next_page_token.clone();
            assert!(token.is_some());
            previous_page = page.items;
        }

        let unique: HashSet<Uuid> = seen.iter().copied().collect();
        assert_eq!(unique.len(), seen.len(), "limit {} repeated an item", limit);
        assert_eq!(unique, expected, "limit {} lost an item", limit);
    }
}

#[tokio::test]
async fn test_page_items_are_ranked_within_the_page() {
    let (env, viewer, _) = seeded_env().await;
    let page = env.feed.get_user_feed(viewer, 8, None).await.unwrap();

    assert_eq!(page.items.len(), 8);
    for pair in page.items.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(
            a.ranking_score > b.ranking_score
                || (a.ranking_score == b.ranking_score
                    && (a.created_at, std::cmp::Reverse(a.post_id))
                        >= (b.created_at, std::cmp::Reverse(b.post_id)))
        );
    }
}

#[tokio::test]
async fn test_post_in_both_sources_is_returned_once() {
    let mut env = TestEnv::new();
    let viewer = env.user(0);
    let author = env.user(1);
    env.follow(viewer, author);
    let post = env.publish(author).await;
    env.run_workers().await;

    // The author crosses the threshold after the post was pushed
    env.graph.add_user(UserProfile {
        id: author,
        username: "rising".into(),
        is_celebrity: false,
        follower_count: CELEBRITY_THRESHOLD,
        is_active: true,
    });
    env.celebrity_posts
        .insert(&CelebrityPostEntry::from_post(&post, Utc::now()))
        .await
        .unwrap();

    let feed = env.feed.get_user_feed(viewer, 10, None).await.unwrap();
    assert_eq!(post_ids(&feed.items), vec![post.id]);
    assert_eq!(feed.items[0].origin, ItemOrigin::Push);
}

#[tokio::test]
async fn test_celebrity_store_outage_falls_back_then_omits() {
    let mut env = TestEnv::new();
    let viewer = env.user(0);
    let friend = env.user(1);
    let star = env.celebrity();
    env.follow(viewer, friend);
    env.follow(viewer, star);
    let pushed = env.publish(friend).await;
    let pulled = env.publish(star).await;
    let mut hidden = env.publish(star).await;
    env.run_workers().await;
    hidden.is_deleted = true;
    env.posts.insert(hidden.clone());

    env.celebrity_posts.set_unavailable(true);
    let fallback = env.feed.get_user_feed(viewer, 10, None).await.unwrap();
    let ids: HashSet<Uuid> = post_ids(&fallback.items).into_iter().collect();
    assert_eq!(ids, HashSet::from([pushed.id, pulled.id]));

    // Different page size, so the cached page above is not reused
    env.posts.set_unavailable(true);
    let push_only = env.feed.get_user_feed(viewer, 11, None).await.unwrap();
    assert_eq!(post_ids(&push_only.items), vec![pushed.id]);
    assert_eq!(push_only.source, FeedSource::Hybrid);
}

#[tokio::test]
async fn test_fallback_pages_past_private_celebrity_posts() {
    let mut env = TestEnv::new();
    let viewer = env.user(0);
    let friend = env.user(1);
    let star = env.celebrity();
    env.follow(viewer, friend);
    env.follow(viewer, star);

    let now = Utc::now();
    let newest = env.post_at(star, now - ChronoDuration::minutes(10));
    let mut hidden = Vec::new();
    for minutes in [20, 30] {
        let mut post = env.post_at(star, now - ChronoDuration::minutes(minutes));
        post.visibility = Visibility::Private;
        env.posts.insert(post.clone());
        hidden.push(post.id);
    }
    let oldest = env.post_at(star, now - ChronoDuration::minutes(40));
    let pushed = env
        .publish_at(friend, now - ChronoDuration::minutes(50))
        .await;
    env.run_workers().await;

    env.celebrity_posts.set_unavailable(true);

    let mut seen = Vec::new();
    let mut token: Option<String> = None;
    for _ in 0..20 {
        let page = env
            .feed
            .get_user_feed(viewer, 2, token.as_deref())
            .await
            .unwrap();
        seen.extend(post_ids(&page.items));
        token = page.next_page_token;
        if token.is_none() {
            break;
        }
    }

    assert!(token.is_none(), "paging did not terminate");
    assert_eq!(seen.len(), 3);
    assert_eq!(
        seen.iter().copied().collect::<HashSet<_>>(),
        HashSet::from([newest.id, oldest.id, pushed.id])
    );
    assert!(hidden.iter().all(|id| !seen.contains(id)));
}

#[tokio::test]
async fn test_following_outage_degrades_to_push_only() {
    let mut env = TestEnv::new();
    let viewer = env.user(0);
    let friend = env.user(1);
    let star = env.celebrity();
    env.follow(viewer, friend);
    env.follow(viewer, star);
    let pushed = env.publish(friend).await;
    env.publish(star).await;
    env.run_workers().await;

    env.graph.set_following_unavailable(true);
    let feed = env.feed.get_user_feed(viewer, 10, None).await.unwrap();
    assert_eq!(post_ids(&feed.items), vec![pushed.id]);
}

#[tokio::test]
async fn test_timeline_outage_is_an_error() {
    let mut env = TestEnv::new();
    let viewer = env.user(0);
    let friend = env.user(1);
    env.follow(viewer, friend);
    env.publish(friend).await;
    env.run_workers().await;

    env.timeline.set_reads_failing(true);
    assert!(env.feed.get_user_feed(viewer, 10, None).await.is_err());
}

#[tokio::test]
async fn test_first_page_is_cached_and_read_position_recorded() {
    let mut env = TestEnv::new();
    let viewer = env.user(0);
    let friend = env.user(1);
    env.follow(viewer, friend);
    let now = Utc::now();
    let older = env.publish_at(friend, now - ChronoDuration::minutes(5)).await;
    let newest = env.publish_at(friend, now - ChronoDuration::minutes(1)).await;
    env.run_workers().await;

    let first = env.feed.get_user_feed(viewer, 1, None).await.unwrap();
    assert_eq!(first.source, FeedSource::Hybrid);
    assert_eq!(post_ids(&first.items), vec![newest.id]);
    assert!(first.has_more);

    let cached = env.feed.get_user_feed(viewer, 1, None).await.unwrap();
    assert_eq!(cached.source, FeedSource::Cache);
    assert_eq!(cached.next_page_token, first.next_page_token);

    // Later pages are never served from or written to the cache
    let second = env
        .feed
        .get_user_feed(viewer, 1, first.next_page_token.as_deref())
        .await
        .unwrap();
    assert_eq!(second.source, FeedSource::Hybrid);
    assert_eq!(post_ids(&second.items), vec![older.id]);

    let position = env.cache.get_read_position(viewer).await.unwrap().unwrap();
    assert_eq!(position.last_post_id, newest.id);
    assert_eq!(position.last_timestamp, newest.created_at);
}

#[tokio::test]
async fn test_unread_summary_counts_pushes_after_read_position() {
    let mut env = TestEnv::new();
    let viewer = env.user(0);
    let friend = env.user(1);
    let star = env.celebrity();
    env.follow(viewer, friend);
    env.follow(viewer, star);
    let now = Utc::now();
    env.publish_at(friend, now - ChronoDuration::minutes(10)).await;
    env.publish_at(friend, now - ChronoDuration::minutes(9)).await;
    env.publish_at(star, now - ChronoDuration::minutes(8)).await;
    env.run_workers().await;

    // Nothing read yet: every pushed post counts, pulled ones never do
    let before = env.feed.unread_summary(viewer).await.unwrap();
    assert_eq!(before.unread_count, 2);
    assert!(!before.capped);
    assert!(before.since.is_none());

    let feed = env.feed.get_user_feed(viewer, 10, None).await.unwrap();
    assert_eq!(feed.items.len(), 3);
    let caught_up = env.feed.unread_summary(viewer).await.unwrap();
    assert_eq!(caught_up.unread_count, 0);
    assert!(caught_up.since.is_some());

    env.publish_at(friend, now - ChronoDuration::minutes(1)).await;
    env.run_workers().await;
    assert_eq!(env.feed.unread_summary(viewer).await.unwrap().unread_count, 1);
}

#[tokio::test]
async fn test_cache_outage_does_not_fail_reads() {
    let mut env = TestEnv::new();
    let viewer = env.user(0);
    let friend = env.user(1);
    env.follow(viewer, friend);
    let post = env.publish(friend).await;
    env.run_workers().await;

    env.cache.set_unavailable(true);
    let feed = env.feed.get_user_feed(viewer, 10, None).await.unwrap();
    assert_eq!(post_ids(&feed.items), vec![post.id]);
    assert_eq!(feed.source, FeedSource::Hybrid);
}

#[tokio::test]
async fn test_limit_is_defaulted_and_capped() {
    let mut env = TestEnv::new();
    let viewer = env.user(0);
    let friend = env.user(1);
    env.follow(viewer, friend);
    let now = Utc::now();
    for i in 0..60 {
        env.publish_at(friend, now - ChronoDuration::seconds(i + 1))
            .await;
    }
    env.run_workers().await;

    let defaulted = env.feed.get_user_feed(viewer, 0, None).await.unwrap();
    assert_eq!(defaulted.items.len(), 10);
    assert!(defaulted.has_more);

    let capped = env.feed.get_user_feed(viewer, 500, None).await.unwrap();
    assert_eq!(capped.items.len(), 50);
    assert!(capped.has_more);
}

#[tokio::test]
async fn test_malformed_page_token_is_rejected() {
    let env = TestEnv::new();
    let viewer = env.user(0);

    for token in ["not base64!", "bm8tY29sb24", "MTIzOm5vdC1hLXV1aWQ"] {
        assert!(matches!(
            env.feed.get_user_feed(viewer, 10, Some(token)).await,
            Err(AppError::BadRequest(_))
        ));
    }
}

#[tokio::test]
async fn test_empty_feed() {
    let env = TestEnv::new();
    let viewer = env.user(0);

    let feed = env.feed.get_user_feed(viewer, 10, None).await.unwrap();
    assert!(feed.items.is_empty());
    assert!(!feed.has_more);
    assert!(feed.next_page_token.is_none());
}
