//! Harness: the collaborators and policies the scheduler core runs against.
//!
//! - **retry**: `FailureTracker`, the per-firing retry/backoff policy
//! - **agent**: the external agent runner that executes task instructions
//! - **autostart**: platform autostart capability/install interface
//! - **shutdown**: cooperative stop signal and drain accounting

pub mod agent;
pub mod autostart;
pub mod retry;
pub mod shutdown;
