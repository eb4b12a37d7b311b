//! Side-effecting helpers: the hosted resource, readers, locks, processes, config.

pub mod config;
pub mod executor;
pub mod github;
pub mod http;
pub mod lock;
pub mod mirror;
pub mod process;
pub mod reader;
pub mod resource;
pub mod watcher;
