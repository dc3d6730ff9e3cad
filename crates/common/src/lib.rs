//! Common utilities for the warpdbg crates.
//!
//! - [`debug`] - Per-component trace loggers controlled via the `DEBUG` environment variable

pub mod debug;

pub use debug::{create_logger, Logger};
