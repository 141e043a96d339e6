//! Query comparison integration tests.

use ch_scope::config::{ConnectionProfile, Protocol};
use ch_scope::db::mock::{MockEngine, MockReply, QueryLogStats};
use ch_scope::db::statements::QUERY_LOG_PROBE;
use ch_scope::db::{Deadline, QueryStats};
use ch_scope::error::ScopeError;
use ch_scope::inspector::Inspector;
use pretty_assertions::assert_eq;
use std::time::Duration;

const FULL_SCAN: &str = "SELECT count() FROM events WHERE toDate(ts) = today()";
const PK_SCAN: &str = "SELECT count() FROM events WHERE ts >= toStartOfDay(now())";

fn profile() -> ConnectionProfile {
    ConnectionProfile {
        protocol: Protocol::Http,
        database: "analytics".to_string(),
        ..Default::default()
    }
}

fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(5))
}

#[tokio::test]
async fn test_compare_pairs_stats_positionally() {
    let engine = MockEngine::new();
    engine
        .log_stats(
            FULL_SCAN,
            QueryLogStats {
                duration_ms: 900,
                read_rows: 50_000_000,
                read_bytes: 400_000_000,
                memory_usage: 1_048_576,
                selected_parts: 40,
                selected_marks: 6_104,
            },
        )
        .log_stats(
            PK_SCAN,
            QueryLogStats {
                duration_ms: 15,
                read_rows: 65_536,
                read_bytes: 524_288,
                memory_usage: 65_536,
                selected_parts: 2,
                selected_marks: 8,
            },
        );

    let result = Inspector::with_opener(engine.clone())
        .compare(&profile(), FULL_SCAN, PK_SCAN, deadline())
        .await
        .unwrap();

    assert_eq!(result.query1_stats.marks_read, 6_104);
    assert_eq!(result.query2_stats.marks_read, 8);
    assert_eq!(result.query1_stats.execution_time_ms, 900);
    assert_eq!(result.query2_stats.execution_time_ms, 15);
}

#[tokio::test]
async fn test_compare_opens_one_session_per_query() {
    let engine = MockEngine::new();
    Inspector::with_opener(engine.clone())
        .compare(&profile(), FULL_SCAN, PK_SCAN, deadline())
        .await
        .unwrap();

    assert_eq!(engine.sessions_opened(), 2);
    assert_eq!(engine.sessions_closed(), 2);
    assert_eq!(engine.open_sessions(), 0);

    let first_statements: Vec<_> = engine
        .journal()
        .into_iter()
        .filter(|call| call.session == 1)
        .map(|call| call.sql)
        .collect();
    assert!(first_statements.contains(&FULL_SCAN.to_string()));
    assert!(!first_statements.contains(&PK_SCAN.to_string()));
}

#[tokio::test]
async fn test_first_failure_skips_second_query() {
    let engine = MockEngine::new();
    engine.reply(
        FULL_SCAN,
        MockReply::Fail(ScopeError::query("Code: 241. Memory limit exceeded")),
    );

    let err = Inspector::with_opener(engine.clone())
        .compare(&profile(), FULL_SCAN, PK_SCAN, deadline())
        .await
        .unwrap_err();

    assert_eq!(err, ScopeError::query("Code: 241. Memory limit exceeded"));
    assert_eq!(engine.sessions_opened(), 1);
    assert_eq!(engine.open_sessions(), 0);
    assert!(engine.journal().iter().all(|call| call.sql != PK_SCAN));
}

#[tokio::test]
async fn test_second_failure_fails_comparison() {
    let engine = MockEngine::new();
    engine.reply(PK_SCAN, MockReply::Fail(ScopeError::query("Code: 62. Syntax error")));

    let result = Inspector::with_opener(engine.clone())
        .compare(&profile(), FULL_SCAN, PK_SCAN, deadline())
        .await;

    assert!(result.is_err());
    assert_eq!(engine.sessions_opened(), 2);
    assert_eq!(engine.open_sessions(), 0);
}

#[tokio::test]
async fn test_degraded_first_stats_still_compare() {
    let engine = MockEngine::new();
    engine.reply(
        QUERY_LOG_PROBE,
        MockReply::Fail(ScopeError::query("log unavailable")),
    );

    let result = Inspector::with_opener(engine.clone())
        .compare(&profile(), FULL_SCAN, PK_SCAN, deadline())
        .await
        .unwrap();

    let zeroed = QueryStats {
        execution_time_ms: result.query1_stats.execution_time_ms,
        ..Default::default()
    };
    assert_eq!(result.query1_stats, zeroed);
    assert_eq!(result.query2_stats.rows_read, 0);
    assert_eq!(engine.sessions_opened(), 2);
}
