//! ch-scope - inspection and query profiling for ClickHouse.
//!
//! This library exposes the core modules for use in integration tests.

pub mod config;
pub mod db;
pub mod error;
pub mod inspector;
pub mod logging;
pub mod output;
pub mod stats;
