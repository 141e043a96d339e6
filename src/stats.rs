//! Execution stats correlation.
//!
//! Each profiled statement is tagged with a fresh query id. Once it has
//! finished, the engine is told to flush its logs and `system.query_log` is
//! probed exactly once for that id. A hit supplies every stats field; a miss
//! (or a failed probe) leaves only the client-measured wall time.
//!
//! ```text
//! Executing -> Executed -> Flushed -> Probed -> Matched | Missed
//! ```

use crate::db::statements::{FLUSH_LOGS, QUERY_LOG_PROBE};
use crate::db::{
    decode_rows, drain_rows, Deadline, QueryContext, QueryResult, QueryStats, Row, Session,
};
use crate::error::Result;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Where a correlation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationPhase {
    Executing,
    Executed,
    Flushed,
    Probed,
    Matched,
    Missed,
}

/// A statement execution tagged for later lookup in the query log.
#[derive(Debug)]
pub struct TaggedExecution {
    query_id: String,
    started: Instant,
}

impl TaggedExecution {
    /// Generates a fresh query id and starts the wall clock.
    pub fn start() -> Self {
        let query_id = Uuid::new_v4().to_string();
        debug!(%query_id, phase = ?CorrelationPhase::Executing, "Executing tagged statement");
        Self {
            query_id,
            started: Instant::now(),
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    /// Execution options carrying this execution's query id.
    pub fn context(&self, deadline: Deadline) -> QueryContext {
        QueryContext::new(deadline).with_query_id(self.query_id.clone())
    }

    /// Stops the wall clock.
    pub fn finish(self) -> ExecutedQuery {
        ExecutedQuery {
            query_id: self.query_id,
            wall_time: self.started.elapsed(),
        }
    }
}

/// A statement that completed successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedQuery {
    pub query_id: String,
    pub wall_time: Duration,
}

impl ExecutedQuery {
    /// Wall time in whole milliseconds, rounded up.
    pub fn wall_time_ms(&self) -> i64 {
        let micros = self.wall_time.as_micros();
        i64::try_from(micros.div_ceil(1000)).unwrap_or(i64::MAX)
    }
}

/// Stats together with how they were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlation {
    pub stats: QueryStats,
    /// Either [`CorrelationPhase::Matched`] or [`CorrelationPhase::Missed`].
    pub outcome: CorrelationPhase,
}

/// Flushes the engine's logs and probes them for one executed query.
pub struct StatsCorrelator<'a> {
    session: &'a mut dyn Session,
    deadline: Deadline,
    phase: CorrelationPhase,
}

impl<'a> StatsCorrelator<'a> {
    pub fn new(session: &'a mut dyn Session, deadline: Deadline) -> Self {
        Self {
            session,
            deadline,
            phase: CorrelationPhase::Executed,
        }
    }

    fn enter(&mut self, phase: CorrelationPhase, query_id: &str) {
        debug!(%query_id, from = ?self.phase, to = ?phase, "Stats correlation");
        self.phase = phase;
    }

    /// Resolves stats for `executed`.
    ///
    /// Only a deadline expiry is returned as an error; any other flush or
    /// probe failure degrades to wall-clock-only stats.
    pub async fn correlate(mut self, executed: &ExecutedQuery) -> Result<Correlation> {
        let query_id = executed.query_id.as_str();

        match self.session.exec(FLUSH_LOGS, self.deadline).await {
            Ok(()) => {}
            Err(e) if e.is_timeout() => return Err(e),
            Err(e) => warn!(%query_id, "Log flush failed, probing anyway: {}", e),
        }
        self.enter(CorrelationPhase::Flushed, query_id);

        let probed = self.probe(query_id).await;
        self.enter(CorrelationPhase::Probed, query_id);

        let record = match probed {
            Ok(record) => record,
            Err(e) if e.is_timeout() => return Err(e),
            Err(e) => {
                warn!(%query_id, "Query log probe failed: {}", e);
                None
            }
        };

        let correlation = match record {
            Some(stats) => {
                self.enter(CorrelationPhase::Matched, query_id);
                Correlation {
                    stats,
                    outcome: CorrelationPhase::Matched,
                }
            }
            None => {
                self.enter(CorrelationPhase::Missed, query_id);
                warn!(
                    %query_id,
                    "No query log entry found; reporting wall-clock time only"
                );
                Correlation {
                    stats: QueryStats::wall_clock_only(executed.wall_time_ms()),
                    outcome: CorrelationPhase::Missed,
                }
            }
        };
        Ok(correlation)
    }

    async fn probe(&mut self, query_id: &str) -> Result<Option<QueryStats>> {
        let mut cursor = self
            .session
            .query(QUERY_LOG_PROBE, &[query_id], &QueryContext::new(self.deadline))
            .await?;
        let decoded = decode_rows(cursor.as_mut()).await?;
        Ok(decoded.rows.first().and_then(stats_from_log_row))
    }
}

/// Reads the six probe columns positionally.
fn stats_from_log_row(row: &Row) -> Option<QueryStats> {
    let field = |i: usize| row.value_at(i).and_then(|v| v.as_u64());
    let stats = QueryStats {
        execution_time_ms: i64::try_from(field(0)?).ok()?,
        rows_read: field(1)?,
        bytes_read: field(2)?,
        memory_peak: field(3)?,
        parts_read: field(4)?,
        marks_read: field(5)?,
    };
    Some(stats)
}

/// Runs `sql`, decodes its rows and attaches correlated stats.
pub async fn execute_profiled(
    session: &mut dyn Session,
    sql: &str,
    deadline: Deadline,
) -> Result<QueryResult> {
    let execution = TaggedExecution::start();
    let mut cursor = session.query(sql, &[], &execution.context(deadline)).await?;
    let decoded = decode_rows(cursor.as_mut()).await?;
    let executed = execution.finish();

    let correlation = StatsCorrelator::new(session, deadline)
        .correlate(&executed)
        .await?;
    Ok(QueryResult {
        columns: decoded.columns,
        rows: decoded.rows,
        stats: correlation.stats,
    })
}

/// Runs `sql` for its cost only: rows are read to the end but not decoded.
pub async fn measure(session: &mut dyn Session, sql: &str, deadline: Deadline) -> Result<QueryStats> {
    let execution = TaggedExecution::start();
    let mut cursor = session.query(sql, &[], &execution.context(deadline)).await?;
    let row_count = drain_rows(cursor.as_mut()).await?;
    let executed = execution.finish();
    debug!(query_id = %executed.query_id, "Statement returned {} row(s)", row_count);

    let correlation = StatsCorrelator::new(session, deadline)
        .correlate(&executed)
        .await?;
    Ok(correlation.stats)
}
