//! Thin HTTP surface over the feed and queue services.

pub mod fanout;
pub mod feed;

pub use fanout::{cleanup_completed_jobs, enqueue_fanout, get_queue_stats, FanoutHandlerState};
pub use feed::{get_unread_summary, get_user_feed, FeedHandlerState};

use actix_web::{get, web, HttpResponse};

#[get("/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

/// Register every route. Handler states are expected as `app_data`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(get_user_feed)
        .service(get_unread_summary)
        .service(enqueue_fanout)
        .service(get_queue_stats)
        .service(cleanup_completed_jobs);
}
