//! Tracing subscriber setup for the launcher and its workers

pub mod logging;

pub use logging::{init_logging, init_simple_logging};
