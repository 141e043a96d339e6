//! Integration tests for ch-scope.
//!
//! `engine_test` requires a running ClickHouse server.
//! Set CLICKHOUSE_URL environment variable to run it.

pub mod comparator_test;
pub mod correlator_test;
pub mod decoder_test;
pub mod engine_test;
pub mod inspector_test;
