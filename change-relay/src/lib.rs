pub mod batch;
pub mod classify;
pub mod config;
pub mod decoder;
pub mod diff;
pub mod error;
pub mod event;
pub mod feed;
pub mod metrics;
pub mod mongo;
pub mod publish;
pub mod retry;
pub mod router;
pub mod server;
pub mod store;
pub mod test_utils;
pub mod watcher;
