//! Core domain for the cronwarden scheduler.
//!
//! - **cron**: 5-field cron parsing and next-fire evaluation
//! - **types**: `Task`, daemon record, and the persisted registry document
//! - **registry**: the durable, transactional `TaskRegistry`
//! - **config**: TOML configuration with validated defaults
//! - **lockfile**: best-effort single-daemon lockfile and PID liveness
//! - **events**: explicitly constructed `EventBus` for scheduler events

pub mod config;
pub mod cron;
pub mod events;
pub mod lockfile;
pub mod registry;
pub mod types;
