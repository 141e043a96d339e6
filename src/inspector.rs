//! Engine inspection operations.
//!
//! Every operation opens its own session, runs to completion against it and
//! releases it before returning, whatever the outcome. Nothing is shared
//! between calls except the opener.

use crate::config::ConnectionProfile;
use crate::db::statements::{
    show_create_table, LIST_COLUMNS, LIST_TABLES, SERVER_VERSION, SHOW_DATABASES,
};
use crate::db::{
    decode_rows, CompareResult, Deadline, DecodedRows, EngineOpener, QueryContext, QueryResult,
    QueryStats, Row, ScopedSession, SchemaColumn, Session, SessionOpener, TableDescription,
    TableMeta, TableSchema, Value, CREATE_SQL_PLACEHOLDER,
};
use crate::error::{Result, ScopeError};
use crate::stats;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

/// Reachability of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    Online,
    Offline,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Online => "Online",
            ConnectionStatus::Offline => "Offline",
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, ConnectionStatus::Online)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs inspection operations against the engines described by connection profiles.
pub struct Inspector<O: SessionOpener = EngineOpener> {
    opener: O,
}

impl Inspector<EngineOpener> {
    /// Creates an inspector that talks to real engines.
    pub fn new() -> Self {
        Self::with_opener(EngineOpener)
    }
}

impl Default for Inspector<EngineOpener> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: SessionOpener> Inspector<O> {
    /// Creates an inspector that opens sessions through `opener`.
    pub fn with_opener(opener: O) -> Self {
        Self { opener }
    }

    pub fn opener(&self) -> &O {
        &self.opener
    }

    async fn open(&self, profile: &ConnectionProfile, deadline: Deadline) -> Result<ScopedSession> {
        ScopedSession::open(&self.opener, profile, deadline).await
    }

    /// Reports whether the engine answers a ping. Failures are a status, not an error.
    pub async fn status(&self, profile: &ConnectionProfile, deadline: Deadline) -> ConnectionStatus {
        let mut scoped = match self.open(profile, deadline).await {
            Ok(scoped) => scoped,
            Err(e) => {
                debug!("{} is offline: {}", profile.address(), e);
                return ConnectionStatus::Offline;
            }
        };

        let pinged = deadline.run("ping", scoped.session().ping(deadline)).await;
        scoped.release().await;

        match pinged {
            Ok(()) => ConnectionStatus::Online,
            Err(e) => {
                debug!("Ping to {} failed: {}", profile.address(), e);
                ConnectionStatus::Offline
            }
        }
    }

    /// Returns the engine's version string.
    pub async fn server_info(&self, profile: &ConnectionProfile, deadline: Deadline) -> Result<String> {
        let mut scoped = self.open(profile, deadline).await?;
        let result = fetch(scoped.session(), SERVER_VERSION, &[], deadline).await;
        scoped.release().await;

        result?
            .rows
            .first()
            .map(|row| text_at(row, 0))
            .ok_or_else(|| ScopeError::query("engine returned no version"))
    }

    /// Lists database names.
    pub async fn databases(
        &self,
        profile: &ConnectionProfile,
        deadline: Deadline,
    ) -> Result<Vec<String>> {
        let mut scoped = self.open(profile, deadline).await?;
        let result = fetch(scoped.session(), SHOW_DATABASES, &[], deadline).await;
        scoped.release().await;

        Ok(result?.rows.iter().map(|row| text_at(row, 0)).collect())
    }

    /// Lists tables of `database`, or of the profile's database when `None`.
    pub async fn tables(
        &self,
        profile: &ConnectionProfile,
        database: Option<&str>,
        deadline: Deadline,
    ) -> Result<Vec<TableMeta>> {
        let profile = profile.scoped_to(database);
        let mut scoped = self.open(&profile, deadline).await?;
        let result = fetch(
            scoped.session(),
            LIST_TABLES,
            &[profile.effective_database()],
            deadline,
        )
        .await;
        scoped.release().await;

        Ok(result?
            .rows
            .iter()
            .map(|row| TableMeta::new(text_at(row, 0), text_at(row, 1)))
            .collect())
    }

    /// Returns the `CREATE TABLE` statement of `table`.
    pub async fn create_table_sql(
        &self,
        profile: &ConnectionProfile,
        table: &str,
        database: Option<&str>,
        deadline: Deadline,
    ) -> Result<String> {
        let profile = profile.scoped_to(database);
        let mut scoped = self.open(&profile, deadline).await?;
        let result = fetch_create_sql(
            scoped.session(),
            profile.effective_database(),
            table,
            deadline,
        )
        .await;
        scoped.release().await;
        result
    }

    /// Returns the columns of `table` along with its definition text.
    ///
    /// A definition that cannot be read is replaced by [`CREATE_SQL_PLACEHOLDER`].
    pub async fn schema(
        &self,
        profile: &ConnectionProfile,
        table: &str,
        database: Option<&str>,
        deadline: Deadline,
    ) -> Result<TableDescription> {
        let profile = profile.scoped_to(database);
        let mut scoped = self.open(&profile, deadline).await?;
        let result = describe_table(
            scoped.session(),
            profile.effective_database(),
            table,
            deadline,
        )
        .await;
        scoped.release().await;
        result
    }

    /// Runs `sql` and returns its rows with correlated execution stats.
    pub async fn execute_query(
        &self,
        profile: &ConnectionProfile,
        sql: &str,
        deadline: Deadline,
    ) -> Result<QueryResult> {
        let mut scoped = self.open(profile, deadline).await?;
        let result = stats::execute_profiled(scoped.session(), sql, deadline).await;
        scoped.release().await;

        let result = result?;
        info!(
            "Query returned {} row(s) in {} ms",
            result.row_count(),
            result.stats.execution_time_ms
        );
        Ok(result)
    }

    /// Runs `sql` for its execution stats only.
    pub async fn execute_with_stats(
        &self,
        profile: &ConnectionProfile,
        sql: &str,
        deadline: Deadline,
    ) -> Result<QueryStats> {
        let mut scoped = self.open(profile, deadline).await?;
        let result = stats::measure(scoped.session(), sql, deadline).await;
        scoped.release().await;
        result
    }

    /// Measures `query1` and then `query2`, one after the other.
    ///
    /// A failure of `query1` ends the comparison before `query2` runs.
    pub async fn compare(
        &self,
        profile: &ConnectionProfile,
        query1: &str,
        query2: &str,
        deadline: Deadline,
    ) -> Result<CompareResult> {
        let query1_stats = self.execute_with_stats(profile, query1, deadline).await?;
        let query2_stats = self.execute_with_stats(profile, query2, deadline).await?;
        Ok(CompareResult {
            query1_stats,
            query2_stats,
        })
    }
}

async fn fetch(
    session: &mut dyn Session,
    sql: &str,
    args: &[&str],
    deadline: Deadline,
) -> Result<DecodedRows> {
    let mut cursor = session.query(sql, args, &QueryContext::new(deadline)).await?;
    decode_rows(cursor.as_mut()).await
}

async fn fetch_create_sql(
    session: &mut dyn Session,
    database: &str,
    table: &str,
    deadline: Deadline,
) -> Result<String> {
    let decoded = fetch(session, &show_create_table(database, table), &[], deadline).await?;
    decoded
        .rows
        .first()
        .map(|row| text_at(row, 0))
        .ok_or_else(|| ScopeError::query(format!("table not found: {database}.{table}")))
}

async fn describe_table(
    session: &mut dyn Session,
    database: &str,
    table: &str,
    deadline: Deadline,
) -> Result<TableDescription> {
    let decoded = fetch(session, LIST_COLUMNS, &[table, database], deadline).await?;
    let columns = decoded
        .rows
        .iter()
        .map(|row| SchemaColumn::new(text_at(row, 0), text_at(row, 1)))
        .collect();

    let create_sql = match fetch_create_sql(session, database, table, deadline).await {
        Ok(sql) => sql,
        Err(e) => {
            warn!("Could not fetch CREATE statement for {}.{}: {}", database, table, e);
            CREATE_SQL_PLACEHOLDER.to_string()
        }
    };

    Ok(TableDescription {
        schema: TableSchema {
            name: table.to_string(),
            columns,
        },
        create_sql,
    })
}

fn text_at(row: &Row, index: usize) -> String {
    row.value_at(index)
        .map(Value::to_display_string)
        .unwrap_or_default()
}
