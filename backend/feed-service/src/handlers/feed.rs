use actix_web::{get, web, HttpResponse};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::services::FeedService;

#[derive(Debug, Deserialize)]
pub struct FeedQueryParams {
    /// 0 or absent means the configured default
    #[serde(default)]
    pub limit: usize,
    pub page_token: Option<String>,
}

pub struct FeedHandlerState {
    pub feed: Arc<FeedService>,
}

#[get("/api/v2/feed/{user_id}")]
pub async fn get_user_feed(
    path: web::Path<Uuid>,
    query: web::Query<FeedQueryParams>,
    state: web::Data<FeedHandlerState>,
) -> Result<HttpResponse> {
    let user_id = path.into_inner();
    let query = query.into_inner();
    debug!(
        user_id = %user_id,
        limit = query.limit,
        paged = query.page_token.is_some(),
        "Feed request"
    );

    let response = state
        .feed
        .get_user_feed(
            user_id,
            query.limit,
            query.page_token.as_deref().filter(|t| !t.is_empty()),
        )
        .await?;

    Ok(HttpResponse::Ok().json(response))
}

#[get("/api/v2/feed/{user_id}/unread")]
pub async fn get_unread_summary(
    path: web::Path<Uuid>,
    state: web::Data<FeedHandlerState>,
) -> Result<HttpResponse> {
    let summary = state.feed.unread_summary(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(summary))
}
