//! Logging initialisation and span helpers shared by the cronwarden binaries.

pub mod logging;
pub mod tracing_setup;
