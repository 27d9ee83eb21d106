//! The cronwarden scheduler daemon.
//!
//! - **lifecycle**: start/stop/status, crash recovery and autostart install
//! - **scheduler**: the wake/dispatch control loop
//! - **executor**: one firing with retries and a per-execution log
//! - **monitor**: advisory resource sampling
//! - **daemon**: wires the loop, monitor and shutdown together

pub mod daemon;
pub mod executor;
pub mod lifecycle;
pub mod monitor;
pub mod scheduler;
