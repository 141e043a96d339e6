//! Mock engine for testing.
//!
//! Provides an in-memory engine with scripted replies and an emulated,
//! asynchronously populated query log: finished queries stay invisible to
//! the log probe until `SYSTEM FLUSH LOGS` is executed.

use super::statements::{bind_args, FLUSH_LOGS, QUERY_LOG_PROBE, SELF_CHECK_PROBE_TEXT};
use super::{ColumnType, Deadline, QueryContext, RowCursor, Session, SessionOpener, Slot, Value};
use crate::config::ConnectionProfile;
use crate::error::{Result, ScopeError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A scripted result set.
#[derive(Debug, Clone, Default)]
pub struct MockRows {
    columns: Vec<String>,
    types: Vec<ColumnType>,
    rows: Vec<Vec<Value>>,
    fail_scan_at: Option<usize>,
    terminal_error: Option<ScopeError>,
}

impl MockRows {
    /// Creates an empty result with `(name, engine type)` columns.
    pub fn new(columns: &[(&str, &str)]) -> Self {
        Self {
            columns: columns.iter().map(|(name, _)| name.to_string()).collect(),
            types: columns
                .iter()
                .map(|(_, ty)| {
                    ColumnType::parse(ty).unwrap_or_else(|_| ColumnType::Other(ty.to_string()))
                })
                .collect(),
            ..Default::default()
        }
    }

    /// A single `String` column with one row per value.
    pub fn strings(column: &str, values: &[&str]) -> Self {
        values
            .iter()
            .fold(Self::new(&[(column, "String")]), |rows, v| {
                rows.row(vec![Value::from(*v)])
            })
    }

    /// Appends a row.
    pub fn row(mut self, values: Vec<Value>) -> Self {
        self.rows.push(values);
        self
    }

    /// Makes the scan of row `index` (zero-based) fail.
    pub fn fail_scan_at(mut self, index: usize) -> Self {
        self.fail_scan_at = Some(index);
        self
    }

    /// Error reported by the cursor once all rows have been read.
    pub fn terminal_error(mut self, error: ScopeError) -> Self {
        self.terminal_error = Some(error);
        self
    }
}

/// Cursor over [`MockRows`].
pub struct MockCursor {
    columns: Vec<String>,
    types: Vec<ColumnType>,
    rows: VecDeque<Vec<Value>>,
    current: Option<Vec<Value>>,
    position: usize,
    fail_scan_at: Option<usize>,
    terminal_error: Option<ScopeError>,
    error: Option<ScopeError>,
    closed: bool,
    close_counter: Option<Arc<AtomicUsize>>,
}

impl MockCursor {
    pub fn new(rows: MockRows) -> Self {
        Self {
            columns: rows.columns,
            types: rows.types,
            rows: rows.rows.into(),
            current: None,
            position: 0,
            fail_scan_at: rows.fail_scan_at,
            terminal_error: rows.terminal_error,
            error: None,
            closed: false,
            close_counter: None,
        }
    }

    fn counting_closes(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.close_counter = Some(counter);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl RowCursor for MockCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn column_types(&self) -> &[ColumnType] {
        &self.types
    }

    async fn advance(&mut self) -> bool {
        if self.closed || self.error.is_some() {
            return false;
        }
        match self.rows.pop_front() {
            Some(row) => {
                self.current = Some(row);
                self.position += 1;
                true
            }
            None => {
                self.current = None;
                self.error = self.terminal_error.take();
                false
            }
        }
    }

    fn scan(&mut self, slots: &mut [Slot]) -> Result<()> {
        let index = self.position.saturating_sub(1);
        if self.fail_scan_at == Some(index) {
            return Err(ScopeError::decode(format!("scan failed at row {index}")));
        }
        let row = self
            .current
            .take()
            .ok_or_else(|| ScopeError::internal("scan called without a current row"))?;
        if row.len() != slots.len() {
            return Err(ScopeError::decode(format!(
                "row has {} values for {} columns",
                row.len(),
                slots.len()
            )));
        }
        for ((value, slot), name) in row.into_iter().zip(slots.iter_mut()).zip(&self.columns) {
            slot.fill(value)
                .map_err(|msg| ScopeError::decode(format!("column '{name}': {msg}")))?;
        }
        Ok(())
    }

    fn take_error(&mut self) -> Option<ScopeError> {
        self.error.take()
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Some(counter) = &self.close_counter {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

/// How the mock engine answers a statement.
#[derive(Debug, Clone)]
pub enum MockReply {
    Rows(MockRows),
    Fail(ScopeError),
    /// Never answers; only the caller's deadline ends the wait.
    Hang,
}

/// Resource counters recorded for one finished query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryLogStats {
    pub duration_ms: u64,
    pub read_rows: u64,
    pub read_bytes: u64,
    pub memory_usage: i64,
    pub selected_parts: u64,
    pub selected_marks: u64,
}

/// One entry of the emulated `system.query_log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub query_id: String,
    pub query: String,
    pub finished: bool,
    pub stats: QueryLogStats,
}

/// Kind of call a session received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Ping,
    Query,
    Exec,
}

/// A call recorded by the mock engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issued {
    /// Session that received the call, numbered from 1 in open order.
    pub session: usize,
    pub kind: CallKind,
    pub sql: String,
    pub args: Vec<String>,
    pub query_id: Option<String>,
}

#[derive(Default)]
struct MockState {
    replies: HashMap<String, VecDeque<MockReply>>,
    log_stats: HashMap<String, QueryLogStats>,
    pending_log: Vec<LogEntry>,
    visible_log: Vec<LogEntry>,
    log_disabled: bool,
    flush_error: Option<ScopeError>,
    open_error: Option<ScopeError>,
    hang_on_open: bool,
    offline: bool,
    journal: Vec<Issued>,
    opened_profiles: Vec<ConnectionProfile>,
    closed: usize,
    dropped: usize,
}

impl MockState {
    fn next_reply(&mut self, sql: &str) -> Option<MockReply> {
        let queue = self.replies.get_mut(sql)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    fn probe_log(&self, query_id: Option<&str>) -> MockRows {
        let rows = MockRows::new(&[
            ("query_duration_ms", "UInt64"),
            ("read_rows", "UInt64"),
            ("read_bytes", "UInt64"),
            ("memory_usage", "Int64"),
            ("ProfileEvents['SelectedParts']", "UInt64"),
            ("ProfileEvents['SelectedMarks']", "UInt64"),
        ]);
        let hit = self.visible_log.iter().find(|entry| {
            entry.finished
                && Some(entry.query_id.as_str()) == query_id
                && entry.query != SELF_CHECK_PROBE_TEXT
        });
        match hit {
            Some(entry) => rows.row(vec![
                Value::UInt(entry.stats.duration_ms),
                Value::UInt(entry.stats.read_rows),
                Value::UInt(entry.stats.read_bytes),
                Value::Int(entry.stats.memory_usage),
                Value::UInt(entry.stats.selected_parts),
                Value::UInt(entry.stats.selected_marks),
            ]),
            None => rows,
        }
    }
}

/// Scripted in-memory engine. Clones share state.
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
    cursors_closed: Arc<AtomicUsize>,
}

impl MockEngine {
    /// Creates an engine that answers every statement with an empty result.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a reply for `sql`. The last queued reply repeats.
    pub fn reply(&self, sql: &str, reply: MockReply) -> &Self {
        self.lock()
            .replies
            .entry(sql.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Counters the query log records when `sql` finishes.
    pub fn log_stats(&self, sql: &str, stats: QueryLogStats) -> &Self {
        self.lock().log_stats.insert(sql.to_string(), stats);
        self
    }

    /// Stops finished queries from ever reaching the query log.
    pub fn disable_query_log(&self) -> &Self {
        self.lock().log_disabled = true;
        self
    }

    /// Makes `SYSTEM FLUSH LOGS` fail without flushing.
    pub fn fail_flush(&self, error: ScopeError) -> &Self {
        self.lock().flush_error = Some(error);
        self
    }

    /// Adds an entry that is already visible in the query log.
    pub fn inject_log_entry(&self, entry: LogEntry) -> &Self {
        self.lock().visible_log.push(entry);
        self
    }

    /// Makes opening a session fail.
    pub fn fail_open(&self, error: ScopeError) -> &Self {
        self.lock().open_error = Some(error);
        self
    }

    /// Makes opening a session wait until the deadline passes.
    pub fn hang_on_open(&self) -> &Self {
        self.lock().hang_on_open = true;
        self
    }

    /// Makes pings fail.
    pub fn set_offline(&self) -> &Self {
        self.lock().offline = true;
        self
    }

    /// All calls received so far, in order.
    pub fn journal(&self) -> Vec<Issued> {
        self.lock().journal.clone()
    }

    /// SQL of every query and exec call, in order.
    pub fn statements(&self) -> Vec<String> {
        self.lock()
            .journal
            .iter()
            .filter(|call| call.kind != CallKind::Ping)
            .map(|call| call.sql.clone())
            .collect()
    }

    /// Profiles sessions were opened with, in order.
    pub fn opened_profiles(&self) -> Vec<ConnectionProfile> {
        self.lock().opened_profiles.clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.lock().opened_profiles.len()
    }

    /// Sessions closed with an explicit `close` call.
    pub fn sessions_closed(&self) -> usize {
        self.lock().closed
    }

    /// Sessions opened and not yet dropped.
    pub fn open_sessions(&self) -> usize {
        let state = self.lock();
        state.opened_profiles.len() - state.dropped
    }

    pub fn cursors_closed(&self) -> usize {
        self.cursors_closed.load(Ordering::SeqCst)
    }

    /// Entries the log probe can currently see.
    pub fn visible_log(&self) -> Vec<LogEntry> {
        self.lock().visible_log.clone()
    }
}

#[async_trait]
impl SessionOpener for MockEngine {
    async fn open(
        &self,
        profile: &ConnectionProfile,
        deadline: Deadline,
    ) -> Result<Box<dyn Session>> {
        let hang = {
            let mut state = self.lock();
            if let Some(err) = state.open_error.clone() {
                return Err(err);
            }
            state.hang_on_open
        };
        if hang {
            deadline
                .run("opening a session", std::future::pending::<Result<()>>())
                .await?;
        }

        let id = {
            let mut state = self.lock();
            state.opened_profiles.push(profile.clone());
            state.opened_profiles.len()
        };
        Ok(Box::new(MockSession {
            id,
            engine: self.clone(),
        }))
    }
}

/// Session handed out by [`MockEngine`].
pub struct MockSession {
    id: usize,
    engine: MockEngine,
}

impl MockSession {
    fn record(&self, kind: CallKind, sql: &str, args: &[&str], query_id: Option<&str>) {
        self.engine.lock().journal.push(Issued {
            session: self.id,
            kind,
            sql: sql.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            query_id: query_id.map(String::from),
        });
    }
}

#[async_trait]
impl Session for MockSession {
    async fn ping(&mut self, _deadline: Deadline) -> Result<()> {
        self.record(CallKind::Ping, "", &[], None);
        if self.engine.lock().offline {
            return Err(ScopeError::connection("ping failed: connection refused"));
        }
        Ok(())
    }

    async fn query(
        &mut self,
        sql: &str,
        args: &[&str],
        ctx: &QueryContext,
    ) -> Result<Box<dyn RowCursor>> {
        self.record(CallKind::Query, sql, args, ctx.query_id.as_deref());
        let bound = bind_args(sql, args)?;

        let reply = {
            let mut state = self.engine.lock();
            match state.next_reply(sql) {
                Some(reply) => reply,
                None if sql == QUERY_LOG_PROBE => {
                    MockReply::Rows(state.probe_log(args.first().copied()))
                }
                None => MockReply::Rows(MockRows::default()),
            }
        };

        match reply {
            MockReply::Rows(rows) => {
                let mut state = self.engine.lock();
                if let (Some(query_id), false) = (&ctx.query_id, state.log_disabled) {
                    let stats = state.log_stats.get(sql).copied().unwrap_or_default();
                    state.pending_log.push(LogEntry {
                        query_id: query_id.clone(),
                        query: bound,
                        finished: true,
                        stats,
                    });
                }
                let cursor =
                    MockCursor::new(rows).counting_closes(self.engine.cursors_closed.clone());
                Ok(Box::new(cursor))
            }
            MockReply::Fail(err) => Err(err),
            MockReply::Hang => {
                ctx.deadline
                    .run("query execution", std::future::pending())
                    .await
            }
        }
    }

    async fn exec(&mut self, sql: &str, deadline: Deadline) -> Result<()> {
        self.record(CallKind::Exec, sql, &[], None);

        let reply = {
            let mut state = self.engine.lock();
            if sql == FLUSH_LOGS {
                if let Some(err) = state.flush_error.clone() {
                    return Err(err);
                }
                let flushed = std::mem::take(&mut state.pending_log);
                state.visible_log.extend(flushed);
            }
            state.next_reply(sql)
        };

        match reply {
            Some(MockReply::Fail(err)) => Err(err),
            Some(MockReply::Hang) => {
                deadline
                    .run("statement execution", std::future::pending())
                    .await
            }
            Some(MockReply::Rows(_)) | None => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.engine.lock().closed += 1;
        Ok(())
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.engine.lock().dropped += 1;
    }
}
