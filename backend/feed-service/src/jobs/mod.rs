pub mod cache_updater;
pub mod fanout_worker;
pub mod queue_cleaner;
