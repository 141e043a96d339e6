//! Inspector workflow integration tests.
//!
//! Runs whole operations against the mock engine and checks the statements
//! issued, the profiles used and that every session is released.

use ch_scope::config::{ConnectionProfile, Protocol};
use ch_scope::db::mock::{MockEngine, MockReply, MockRows};
use ch_scope::db::statements::{LIST_COLUMNS, LIST_TABLES, SHOW_DATABASES};
use ch_scope::db::{Deadline, Value, CREATE_SQL_PLACEHOLDER};
use ch_scope::error::ScopeError;
use ch_scope::inspector::{ConnectionStatus, Inspector};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(5))
}

fn http_profile(database: &str) -> ConnectionProfile {
    ConnectionProfile {
        host: "ch.internal".to_string(),
        protocol: Protocol::Http,
        database: database.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_empty_database_becomes_default_for_schema() {
    let engine = MockEngine::new();
    let inspector = Inspector::with_opener(engine.clone());

    inspector
        .schema(&http_profile(""), "t", None, deadline())
        .await
        .unwrap();

    let journal = engine.journal();
    let columns_call = journal.iter().find(|c| c.sql == LIST_COLUMNS).unwrap();
    assert_eq!(columns_call.args, vec!["t", "default"]);
    assert!(journal
        .iter()
        .any(|c| c.sql == "SHOW CREATE TABLE `default`.`t`"));
}

#[tokio::test]
async fn test_database_override_does_not_change_profile() {
    let engine = MockEngine::new();
    let inspector = Inspector::with_opener(engine.clone());
    let profile = http_profile("analytics");

    inspector
        .tables(&profile, Some("staging"), deadline())
        .await
        .unwrap();
    inspector.tables(&profile, None, deadline()).await.unwrap();

    assert_eq!(profile.database, "analytics");
    let args: Vec<_> = engine
        .journal()
        .into_iter()
        .filter(|c| c.sql == LIST_TABLES)
        .map(|c| c.args)
        .collect();
    assert_eq!(args, vec![vec!["staging"], vec!["analytics"]]);
}

#[tokio::test]
async fn test_schema_with_failing_create_sql_still_returns_columns() {
    let engine = MockEngine::new();
    engine
        .reply(
            LIST_COLUMNS,
            MockReply::Rows(
                MockRows::new(&[("name", "String"), ("type", "String")])
                    .row(vec![Value::from("ts"), Value::from("DateTime64(3, 'UTC')")]),
            ),
        )
        .reply(
            "SHOW CREATE TABLE `logs`.`requests`",
            MockReply::Fail(ScopeError::connection("connection reset by peer")),
        );

    let description = Inspector::with_opener(engine.clone())
        .schema(&http_profile("logs"), "requests", None, deadline())
        .await
        .unwrap();

    assert_eq!(description.schema.name, "requests");
    assert_eq!(description.schema.columns.len(), 1);
    assert_eq!(description.schema.columns[0].data_type, "DateTime64(3, 'UTC')");
    assert_eq!(description.create_sql, CREATE_SQL_PLACEHOLDER);
    assert_eq!(engine.open_sessions(), 0);
}

#[tokio::test]
async fn test_every_operation_releases_its_session() {
    let engine = MockEngine::new();
    engine.reply(SHOW_DATABASES, MockReply::Fail(ScopeError::query("boom")));
    let inspector = Inspector::with_opener(engine.clone());
    let profile = http_profile("");

    assert_eq!(
        inspector.status(&profile, deadline()).await,
        ConnectionStatus::Online
    );
    tokio_test::assert_err!(inspector.databases(&profile, deadline()).await);
    let _ = inspector.server_info(&profile, deadline()).await;
    let _ = inspector.tables(&profile, None, deadline()).await;
    let _ = inspector.create_table_sql(&profile, "t", None, deadline()).await;
    let _ = inspector.schema(&profile, "t", None, deadline()).await;
    let _ = inspector.execute_query(&profile, "SELECT 1", deadline()).await;
    let _ = inspector.execute_with_stats(&profile, "SELECT 1", deadline()).await;

    assert_eq!(engine.sessions_opened(), 8);
    assert_eq!(engine.sessions_closed(), 8);
    assert_eq!(engine.open_sessions(), 0);
}

#[tokio::test]
async fn test_each_call_opens_with_the_callers_profile() {
    let engine = MockEngine::new();
    let inspector = Inspector::with_opener(engine.clone());

    inspector
        .execute_query(&http_profile("a"), "SELECT 1", deadline())
        .await
        .unwrap();
    inspector
        .execute_query(&http_profile("b"), "SELECT 1", deadline())
        .await
        .unwrap();

    let databases: Vec<_> = engine
        .opened_profiles()
        .into_iter()
        .map(|p| p.database)
        .collect();
    assert_eq!(databases, vec!["a", "b"]);
}

#[tokio::test]
async fn test_status_offline_is_not_an_error() {
    let engine = MockEngine::new();
    engine.set_offline();

    let status = Inspector::with_opener(engine.clone())
        .status(&http_profile(""), deadline())
        .await;

    assert_eq!(status, ConnectionStatus::Offline);
    assert!(!status.is_online());
}

#[tokio::test]
async fn test_concurrent_operations_use_separate_sessions() {
    let engine = MockEngine::new();
    let inspector = Inspector::with_opener(engine.clone());
    let profile = http_profile("");

    let (a, b) = tokio::join!(
        inspector.execute_with_stats(&profile, "SELECT 1", deadline()),
        inspector.execute_with_stats(&profile, "SELECT 2", deadline()),
    );

    assert!(a.is_ok() && b.is_ok());
    assert_eq!(engine.sessions_opened(), 2);
    assert_eq!(engine.open_sessions(), 0);
}
