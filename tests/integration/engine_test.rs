//! Tests against a real ClickHouse server.
//!
//! Skipped unless CLICKHOUSE_URL is set, e.g.
//! `CLICKHOUSE_URL=http://default@localhost:8123/default`. The native
//! protocol tests use CLICKHOUSE_NATIVE_URL instead, e.g.
//! `CLICKHOUSE_NATIVE_URL=clickhouse://default@localhost:9000/default`.

use ch_scope::config::{ConnectionProfile, Protocol};
use ch_scope::db::{Deadline, Value};
use ch_scope::inspector::{ConnectionStatus, Inspector};
use pretty_assertions::assert_eq;
use std::time::Duration;

/// Helper to get the test engine profile from the environment.
fn get_test_profile() -> Option<ConnectionProfile> {
    profile_from_env("CLICKHOUSE_URL")
}

fn get_native_profile() -> Option<ConnectionProfile> {
    profile_from_env("CLICKHOUSE_NATIVE_URL").filter(|p| p.protocol == Protocol::Native)
}

fn profile_from_env(key: &str) -> Option<ConnectionProfile> {
    let url = std::env::var(key).ok()?;
    ConnectionProfile::from_connection_string(&url).ok()
}

fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(30))
}

#[tokio::test]
async fn test_select_one() {
    let Some(profile) = get_test_profile() else {
        eprintln!("Skipping test: CLICKHOUSE_URL not set");
        return;
    };

    let result = Inspector::new()
        .execute_query(&profile, "SELECT 1 AS a", deadline())
        .await
        .unwrap();

    assert_eq!(result.columns, vec!["a"]);
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].get("a"), Some(&Value::UInt(1)));
    assert_eq!(
        serde_json::to_value(&result.rows[0]).unwrap(),
        serde_json::json!({ "a": 1 })
    );
    assert!(result.stats.execution_time_ms >= 0);
}

#[tokio::test]
async fn test_status_and_version() {
    let Some(profile) = get_test_profile() else {
        eprintln!("Skipping test: CLICKHOUSE_URL not set");
        return;
    };
    let inspector = Inspector::new();

    assert_eq!(
        inspector.status(&profile, deadline()).await,
        ConnectionStatus::Online
    );
    let version = inspector.server_info(&profile, deadline()).await.unwrap();
    assert!(version.chars().next().is_some_and(|c| c.is_ascii_digit()));
}

#[tokio::test]
async fn test_catalog_queries() {
    let Some(profile) = get_test_profile() else {
        eprintln!("Skipping test: CLICKHOUSE_URL not set");
        return;
    };
    let inspector = Inspector::new();

    let databases = inspector.databases(&profile, deadline()).await.unwrap();
    assert!(databases.iter().any(|db| db == "system"));

    let tables = inspector
        .tables(&profile, Some("system"), deadline())
        .await
        .unwrap();
    assert!(tables.iter().any(|t| t.name == "one"));

    let description = inspector
        .schema(&profile, "one", Some("system"), deadline())
        .await
        .unwrap();
    assert_eq!(description.schema.columns[0].name, "dummy");
    assert_eq!(description.schema.columns[0].data_type, "UInt8");
}

#[tokio::test]
async fn test_decodes_mixed_types() {
    let Some(profile) = get_test_profile() else {
        eprintln!("Skipping test: CLICKHOUSE_URL not set");
        return;
    };

    let result = Inspector::new()
        .execute_query(
            &profile,
            "SELECT toUInt64(number) AS n, toString(number) AS s, \
             if(number % 2 = 0, NULL, number) AS maybe, [number, 1] AS arr \
             FROM numbers(3)",
            deadline(),
        )
        .await
        .unwrap();

    assert_eq!(result.columns, vec!["n", "s", "maybe", "arr"]);
    assert_eq!(result.rows.len(), 3);
    assert_eq!(result.rows[0].get("n"), Some(&Value::UInt(0)));
    assert_eq!(result.rows[1].get("s"), Some(&Value::from("1")));
    assert_eq!(result.rows[0].get("maybe"), Some(&Value::Null));
    assert_eq!(
        result.rows[2].get("arr"),
        Some(&Value::Array(vec![Value::UInt(2), Value::UInt(1)]))
    );
}

#[tokio::test]
async fn test_compare_returns_two_stats() {
    let Some(profile) = get_test_profile() else {
        eprintln!("Skipping test: CLICKHOUSE_URL not set");
        return;
    };

    let result = Inspector::new()
        .compare(
            &profile,
            "SELECT count() FROM numbers(100000)",
            "SELECT count() FROM numbers(10)",
            deadline(),
        )
        .await
        .unwrap();

    assert!(result.query1_stats.rows_read >= result.query2_stats.rows_read);
}

#[tokio::test]
async fn test_native_query_with_stats() {
    let Some(profile) = get_native_profile() else {
        eprintln!("Skipping test: CLICKHOUSE_NATIVE_URL not set");
        return;
    };
    let inspector = Inspector::new();

    assert_eq!(
        inspector.status(&profile, deadline()).await,
        ConnectionStatus::Online
    );

    let result = inspector
        .execute_query(
            &profile,
            "SELECT number AS n, toString(number) AS s, toNullable(toDate('2024-02-29')) AS d \
             FROM system.numbers LIMIT 3",
            deadline(),
        )
        .await
        .unwrap();

    assert_eq!(result.columns, vec!["n", "s", "d"]);
    assert_eq!(result.rows.len(), 3);
    assert_eq!(result.rows[2].get("n"), Some(&Value::UInt(2)));
    assert_eq!(result.rows[2].get("s"), Some(&Value::from("2")));
    assert!(matches!(result.rows[0].get("d"), Some(Value::Date(_))));
    assert!(result.stats.rows_read >= 3);
}

#[tokio::test(flavor = "current_thread")]
async fn test_unreachable_native_engine_is_offline() {
    let profile = ConnectionProfile {
        host: "127.0.0.1".to_string(),
        port: 59998,
        ..Default::default()
    };

    let status = Inspector::new()
        .status(&profile, Deadline::after(Duration::from_secs(5)))
        .await;
    assert_eq!(status, ConnectionStatus::Offline);
}

#[tokio::test(flavor = "current_thread")]
async fn test_unreachable_engine_is_offline() {
    let profile = ConnectionProfile {
        host: "127.0.0.1".to_string(),
        port: 59999,
        protocol: Protocol::Http,
        ..Default::default()
    };

    let status = Inspector::new()
        .status(&profile, Deadline::after(Duration::from_secs(5)))
        .await;
    assert_eq!(status, ConnectionStatus::Offline);
}
