use actix_web::{get, post, web, HttpResponse};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{FanoutStatus, Post};
use crate::services::FanoutQueue;

pub struct FanoutHandlerState {
    pub queue: FanoutQueue,
    pub default_retention: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub job_id: Uuid,
    pub post_id: Uuid,
    pub status: FanoutStatus,
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    pub older_than_hours: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub deleted: u64,
}

/// Called at post creation. Answers once the job is queued.
#[post("/api/v1/fanout")]
pub async fn enqueue_fanout(
    post: web::Json<Post>,
    state: web::Data<FanoutHandlerState>,
) -> Result<HttpResponse> {
    let job = state.queue.enqueue_fanout(&post).await?;
    Ok(HttpResponse::Accepted().json(EnqueueResponse {
        job_id: job.id,
        post_id: job.post_id,
        status: job.status,
    }))
}

#[get("/api/v1/fanout/stats")]
pub async fn get_queue_stats(state: web::Data<FanoutHandlerState>) -> Result<HttpResponse> {
    let stats = state.queue.get_queue_stats().await?;
    Ok(HttpResponse::Ok().json(stats))
}

#[post("/api/v1/fanout/cleanup")]
pub async fn cleanup_completed_jobs(
    query: web::Query<CleanupQuery>,
    state: web::Data<FanoutHandlerState>,
) -> Result<HttpResponse> {
    let older_than = query
        .older_than_hours
        .map(|h| Duration::from_secs(h.saturating_mul(3600)))
        .unwrap_or(state.default_retention);
    let deleted = state.queue.cleanup_completed_jobs(older_than).await?;
    Ok(HttpResponse::Ok().json(CleanupResponse { deleted }))
}
