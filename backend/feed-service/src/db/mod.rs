//! Storage for the fan-out engine: the job queue, per-recipient timelines
//! and the celebrity post table.

pub mod celebrity_repo;
pub mod queue_repo;
pub mod timeline_repo;

pub use celebrity_repo::{CelebrityPostStore, PgCelebrityPostStore};
pub use queue_repo::{FanoutQueueRepository, PgFanoutQueueRepository, QueueError, QueueResult};
pub use timeline_repo::{PgTimelineStore, TimelineStore};
