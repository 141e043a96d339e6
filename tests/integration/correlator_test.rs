//! Stats correlation integration tests.
//!
//! Exercises the flush-then-probe sequence against the mock engine's
//! asynchronously populated query log.

use ch_scope::config::ConnectionProfile;
use ch_scope::db::mock::{CallKind, LogEntry, MockEngine, MockReply, MockRows, QueryLogStats};
use ch_scope::db::statements::{FLUSH_LOGS, QUERY_LOG_PROBE, SELF_CHECK_PROBE_TEXT};
use ch_scope::db::{Deadline, QueryStats, Session, SessionOpener, Value};
use ch_scope::error::ScopeError;
use ch_scope::stats::{self, CorrelationPhase, ExecutedQuery, StatsCorrelator};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(5))
}

async fn open(engine: &MockEngine) -> Box<dyn Session> {
    engine
        .open(&ConnectionProfile::default(), deadline())
        .await
        .unwrap()
}

fn heavy_scan() -> QueryLogStats {
    QueryLogStats {
        duration_ms: 1_250,
        read_rows: 98_000_000,
        read_bytes: 784_000_000,
        memory_usage: 268_435_456,
        selected_parts: 48,
        selected_marks: 11_963,
    }
}

#[tokio::test]
async fn test_matched_stats_equal_log_row() {
    let engine = MockEngine::new();
    engine.log_stats("SELECT uniq(user_id) FROM hits", heavy_scan());
    let mut session = open(&engine).await;

    let stats = stats::measure(session.as_mut(), "SELECT uniq(user_id) FROM hits", deadline())
        .await
        .unwrap();

    assert_eq!(
        stats,
        QueryStats {
            execution_time_ms: 1_250,
            rows_read: 98_000_000,
            bytes_read: 784_000_000,
            memory_peak: 268_435_456,
            parts_read: 48,
            marks_read: 11_963,
        }
    );
}

#[tokio::test]
async fn test_log_is_only_visible_after_flush() {
    let engine = MockEngine::new();
    engine.log_stats("SELECT 1", heavy_scan());
    let mut session = open(&engine).await;

    let result = stats::execute_profiled(session.as_mut(), "SELECT 1", deadline())
        .await
        .unwrap();

    assert_eq!(result.stats.rows_read, 98_000_000);
    let journal = engine.journal();
    let flush = journal.iter().position(|c| c.sql == FLUSH_LOGS).unwrap();
    let probe = journal.iter().position(|c| c.sql == QUERY_LOG_PROBE).unwrap();
    assert!(flush < probe);
    assert_eq!(journal[flush].kind, CallKind::Exec);
}

#[tokio::test]
async fn test_exactly_one_probe_per_query() {
    let engine = MockEngine::new();
    engine.disable_query_log();
    let mut session = open(&engine).await;

    stats::measure(session.as_mut(), "SELECT 1", deadline())
        .await
        .unwrap();

    let probes = engine
        .statements()
        .into_iter()
        .filter(|sql| sql == QUERY_LOG_PROBE)
        .count();
    assert_eq!(probes, 1);
}

#[tokio::test]
async fn test_miss_keeps_only_wall_clock_time() {
    let engine = MockEngine::new();
    engine.disable_query_log();
    let mut session = open(&engine).await;

    let executed = ExecutedQuery {
        query_id: "f7d5a7f4-0000-4000-8000-000000000001".to_string(),
        wall_time: Duration::from_millis(250),
    };
    let correlation = StatsCorrelator::new(session.as_mut(), deadline())
        .correlate(&executed)
        .await
        .unwrap();

    assert_eq!(correlation.outcome, CorrelationPhase::Missed);
    assert_eq!(correlation.stats, QueryStats::wall_clock_only(250));
}

#[tokio::test]
async fn test_self_check_text_never_matches() {
    let engine = MockEngine::new();
    engine.inject_log_entry(LogEntry {
        query_id: "reused-id".to_string(),
        query: SELF_CHECK_PROBE_TEXT.to_string(),
        finished: true,
        stats: heavy_scan(),
    });
    let mut session = open(&engine).await;

    let executed = ExecutedQuery {
        query_id: "reused-id".to_string(),
        wall_time: Duration::from_millis(12),
    };
    let correlation = StatsCorrelator::new(session.as_mut(), deadline())
        .correlate(&executed)
        .await
        .unwrap();

    assert_eq!(correlation.outcome, CorrelationPhase::Missed);
    assert_eq!(correlation.stats.rows_read, 0);
}

#[tokio::test]
async fn test_unfinished_entry_is_not_matched() {
    let engine = MockEngine::new();
    engine.inject_log_entry(LogEntry {
        query_id: "q-running".to_string(),
        query: "SELECT sleep(1)".to_string(),
        finished: false,
        stats: heavy_scan(),
    });
    let mut session = open(&engine).await;

    let executed = ExecutedQuery {
        query_id: "q-running".to_string(),
        wall_time: Duration::from_millis(1),
    };
    let correlation = StatsCorrelator::new(session.as_mut(), deadline())
        .correlate(&executed)
        .await
        .unwrap();
    assert_eq!(correlation.outcome, CorrelationPhase::Missed);
}

#[tokio::test]
async fn test_flush_failure_is_not_fatal() {
    let engine = MockEngine::new();
    engine.fail_flush(ScopeError::query(
        "Code: 497. default: Not enough privileges. To execute this query, it's necessary to have the grant SYSTEM FLUSH LOGS",
    ));
    let mut session = open(&engine).await;

    let stats = stats::measure(session.as_mut(), "SELECT 1", deadline())
        .await
        .unwrap();

    assert_eq!(stats.rows_read, 0);
    assert!(engine.statements().contains(&QUERY_LOG_PROBE.to_string()));
}

#[tokio::test]
async fn test_flush_timeout_is_surfaced() {
    let engine = MockEngine::new();
    engine.reply(FLUSH_LOGS, MockReply::Hang);
    let mut session = open(&engine).await;

    let err = stats::measure(
        session.as_mut(),
        "SELECT 1",
        Deadline::after(Duration::from_millis(30)),
    )
    .await
    .unwrap_err();

    assert!(err.is_timeout());
    assert!(!engine.statements().contains(&QUERY_LOG_PROBE.to_string()));
}

#[tokio::test]
async fn test_execution_failure_produces_no_stats() {
    let engine = MockEngine::new();
    engine.reply(
        "SELECT * FROM missing",
        MockReply::Fail(ScopeError::query("Code: 60. Table default.missing does not exist")),
    );
    let mut session = open(&engine).await;

    let result = stats::measure(session.as_mut(), "SELECT * FROM missing", deadline()).await;

    assert!(matches!(result, Err(ScopeError::Query(_))));
    assert_eq!(engine.statements(), vec!["SELECT * FROM missing"]);
}

#[tokio::test]
async fn test_measure_drains_without_decoding() {
    let engine = MockEngine::new();
    engine.reply(
        "SELECT weird",
        MockReply::Rows(
            MockRows::new(&[("v", "UInt8")])
                .row(vec![Value::from("not decoded")])
                .row(vec![Value::from("still not decoded")]),
        ),
    );
    let mut session = open(&engine).await;

    let result = stats::measure(session.as_mut(), "SELECT weird", deadline()).await;
    assert!(result.is_ok());
    assert_eq!(engine.cursors_closed(), 2);
}
