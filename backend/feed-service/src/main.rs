use actix_web::{web, App, HttpServer};
use sqlx::postgres::PgPoolOptions;
use std::io;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feed_service::cache::{FeedCacheStore, RedisFeedCache};
use feed_service::clients::{PgPostStore, PgSocialGraph, PgUserDirectory};
use feed_service::config::Config;
use feed_service::db::{PgCelebrityPostStore, PgFanoutQueueRepository, PgTimelineStore};
use feed_service::handlers::{self, FanoutHandlerState, FeedHandlerState};
use feed_service::jobs::cache_updater::{cache_update_channel, CacheUpdater};
use feed_service::jobs::{fanout_worker, queue_cleaner};
use feed_service::services::fanout::FanoutStores;
use feed_service::services::{CelebrityPolicy, FanoutQueue, FanoutWorker, FeedService};

#[actix_web::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_line_number(true)
                .with_file(true)
                .with_target(true),
        )
        .init();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Configuration loading failed: {:#}", e);
            eprintln!("ERROR: Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting feed-service v{}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", config.app.env);

    let pool = match PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Database connection failed: {}", e);
            eprintln!("ERROR: Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        tracing::error!("Database migration failed: {}", e);
        eprintln!("ERROR: Failed to run migrations: {}", e);
        std::process::exit(1);
    }
    info!("Database ready");

    let cache: Arc<dyn FeedCacheStore> =
        match RedisFeedCache::new(&config.redis.url, config.cache.clone()).await {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                tracing::error!("Failed to initialize feed cache: {}", e);
                eprintln!("ERROR: Failed to connect to Redis: {}", e);
                std::process::exit(1);
            }
        };

    let policy = CelebrityPolicy::new(config.fanout.celebrity_threshold);
    let queue_repo = Arc::new(PgFanoutQueueRepository::new(pool.clone()));
    let timeline = Arc::new(PgTimelineStore::new(pool.clone()));
    let celebrity_posts = Arc::new(PgCelebrityPostStore::new(pool.clone()));
    let posts = Arc::new(PgPostStore::new(pool.clone()));
    let graph = Arc::new(PgSocialGraph::new(pool.clone()));
    let users = Arc::new(PgUserDirectory::new(pool.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = Vec::new();

    let (cache_updates, cache_rx) = cache_update_channel(config.cache.update_queue_capacity);
    let updater = CacheUpdater::new(cache.clone(), cache_rx, &config.cache);
    let updater_shutdown = shutdown_rx.clone();
    background.push(tokio::spawn(async move {
        updater.run(updater_shutdown).await;
    }));
    info!("Cache updater started");

    let stores = FanoutStores {
        queue: queue_repo.clone(),
        timeline: timeline.clone(),
        celebrity_posts: celebrity_posts.clone(),
        posts: posts.clone(),
        graph: graph.clone(),
        users,
    };
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "feed-service".to_string());
    for n in 0..config.fanout.worker_count.max(1) {
        let worker = Arc::new(FanoutWorker::new(
            format!("{}-{}-{}", host, std::process::id(), n),
            stores.clone(),
            cache_updates.clone(),
            policy,
            config.fanout.clone(),
        ));
        background.push(tokio::spawn(fanout_worker::start_fanout_worker(
            worker,
            config.fanout.poll_interval,
            shutdown_rx.clone(),
        )));
    }
    info!(workers = config.fanout.worker_count.max(1), "Fan-out workers started");

    let queue = FanoutQueue::new(queue_repo, config.fanout.store_timeout);
    background.push(tokio::spawn(queue_cleaner::start_queue_cleaner(
        queue.clone(),
        config.fanout.cleanup_interval,
        config.fanout.completed_retention,
        shutdown_rx.clone(),
    )));
    info!("Queue cleaner started");

    let feed = Arc::new(FeedService::new(
        timeline,
        celebrity_posts,
        posts,
        graph,
        cache,
        policy,
        config.feed.clone(),
    ));
    let feed_state = web::Data::new(FeedHandlerState { feed });
    let fanout_state = web::Data::new(FanoutHandlerState {
        queue,
        default_retention: config.fanout.completed_retention,
    });

    info!("HTTP server listening on 0.0.0.0:{}", config.app.port);
    let result = HttpServer::new(move || {
        App::new()
            .app_data(feed_state.clone())
            .app_data(fanout_state.clone())
            .configure(handlers::configure)
            .route(
                "/metrics",
                web::get().to(feed_service::metrics::serve_metrics),
            )
    })
    .bind(format!("0.0.0.0:{}", config.app.port))?
    .run()
    .await;

    info!("HTTP server stopped, shutting down background jobs");
    let _ = shutdown_tx.send(true);
    drop(cache_updates);
    for handle in background {
        let _ = handle.await;
    }

    result
}
