//! Engine access layer for ch-scope.
//!
//! Provides trait-based sessions and cursors so the decoder and the stats
//! correlator can run against the real engine or the scripted mock alike.
//! Sessions are opened per operation and never pooled.

mod column_type;
mod decode;
mod http;
pub mod mock;
mod native;
mod schema;
pub mod statements;
mod types;

pub use column_type::ColumnType;
pub use decode::{decode_rows, drain_rows, DecodedRows, Slot};
pub use http::{HttpCursor, HttpSession};
pub use native::{NativeCursor, NativeSession};
pub use schema::{SchemaColumn, TableDescription, TableMeta, TableSchema, CREATE_SQL_PLACEHOLDER};
pub use types::{CompareResult, QueryResult, QueryStats, Row, Value};

use crate::config::{ConnectionProfile, Protocol};
use crate::error::{Result, ScopeError};
use async_trait::async_trait;
use statements::SELF_CHECK_PROBE_TEXT;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Point in time after which waiting on the engine is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Awaits `fut`, failing with a timeout error naming `what` if the deadline passes first.
    pub async fn run<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout_at(self.at, fut)
            .await
            .map_err(|_| ScopeError::timeout(format!("{what} did not finish before the deadline")))?
    }
}

/// Per-statement execution options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryContext {
    /// Identifier the engine records for this execution in its query log.
    pub query_id: Option<String>,
    pub deadline: Deadline,
}

impl QueryContext {
    pub fn new(deadline: Deadline) -> Self {
        Self {
            query_id: None,
            deadline,
        }
    }

    /// Tags the execution with `query_id`.
    pub fn with_query_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }
}

/// A forward-only cursor over a result set of unknown shape.
///
/// Column names and runtime types are available before the first row.
#[async_trait]
pub trait RowCursor: Send {
    /// Column names in projection order.
    fn columns(&self) -> &[String];

    /// Runtime type of each column, aligned with [`RowCursor::columns`].
    fn column_types(&self) -> &[ColumnType];

    /// Moves to the next row. Returns false once exhausted or failed;
    /// [`RowCursor::take_error`] tells the two apart.
    async fn advance(&mut self) -> bool;

    /// Reads every column of the current row into `slots`, one slot per column.
    fn scan(&mut self, slots: &mut [Slot]) -> Result<()>;

    /// Returns the error that ended iteration, if any.
    fn take_error(&mut self) -> Option<ScopeError>;

    /// Releases the underlying stream. Idempotent.
    async fn close(&mut self);
}

/// A single transient connection to the engine.
#[async_trait]
pub trait Session: Send {
    /// Checks that the engine answers.
    async fn ping(&mut self, deadline: Deadline) -> Result<()>;

    /// Runs a statement and returns a cursor over its result.
    ///
    /// `?` placeholders in `sql` are bound to `args` in order.
    async fn query(
        &mut self,
        sql: &str,
        args: &[&str],
        ctx: &QueryContext,
    ) -> Result<Box<dyn RowCursor>>;

    /// Runs a statement whose result is not needed.
    async fn exec(&mut self, sql: &str, deadline: Deadline) -> Result<()>;

    /// Closes the session.
    async fn close(&mut self) -> Result<()>;
}

/// Opens sessions for connection profiles.
#[async_trait]
pub trait SessionOpener: Send + Sync {
    async fn open(
        &self,
        profile: &ConnectionProfile,
        deadline: Deadline,
    ) -> Result<Box<dyn Session>>;
}

/// Opens sessions against a real engine, over the profile's protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOpener;

#[async_trait]
impl SessionOpener for EngineOpener {
    async fn open(
        &self,
        profile: &ConnectionProfile,
        deadline: Deadline,
    ) -> Result<Box<dyn Session>> {
        match profile.protocol {
            Protocol::Native => Ok(Box::new(NativeSession::open(profile, deadline).await?)),
            Protocol::Http => Ok(Box::new(HttpSession::open(profile, deadline).await?)),
        }
    }
}

/// What the engine reported about itself when a session was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ServerIdentity {
    pub(crate) display_name: String,
    pub(crate) version: String,
    pub(crate) revision: u64,
    pub(crate) timezone: String,
}

/// Runs the self-check statement on a freshly connected session.
///
/// Failures other than a timeout are connection errors.
pub(crate) async fn complete_handshake(
    session: &mut dyn Session,
    address: &str,
    deadline: Deadline,
) -> Result<ServerIdentity> {
    let identity = read_identity(session, deadline)
        .await
        .map_err(|e| match e {
            ScopeError::Timeout(_) => e,
            other => ScopeError::connection(format!("Handshake with {address} failed: {other}")),
        })?;
    info!(
        "Connected to {} ({} {}, revision {}, timezone {})",
        address, identity.display_name, identity.version, identity.revision, identity.timezone
    );
    Ok(identity)
}

async fn read_identity(session: &mut dyn Session, deadline: Deadline) -> Result<ServerIdentity> {
    let mut cursor = session
        .query(SELF_CHECK_PROBE_TEXT, &[], &QueryContext::new(deadline))
        .await?;
    let decoded = decode_rows(cursor.as_mut()).await?;
    let row = decoded
        .rows
        .first()
        .ok_or_else(|| ScopeError::connection("Handshake returned no rows"))?;

    let text = |i: usize| {
        row.value_at(i)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    Ok(ServerIdentity {
        display_name: text(0),
        version: text(1),
        revision: row.value_at(2).and_then(Value::as_u64).unwrap_or_default(),
        timezone: text(3),
    })
}

/// A session that is closed when the operation using it ends.
///
/// Call [`ScopedSession::release`] to close it in place. A scope that is
/// dropped instead hands its session to a background task that closes it.
pub struct ScopedSession {
    session: Box<dyn Session>,
    address: String,
    released: bool,
}

impl ScopedSession {
    /// Opens a session for `profile`, honouring `deadline`.
    pub async fn open(
        opener: &dyn SessionOpener,
        profile: &ConnectionProfile,
        deadline: Deadline,
    ) -> Result<Self> {
        let address = profile.address();
        let session = deadline
            .run("opening a session", opener.open(profile, deadline))
            .await?;
        debug!("Opened session to {}", address);
        Ok(Self {
            session,
            address,
            released: false,
        })
    }

    /// The live session.
    pub fn session(&mut self) -> &mut dyn Session {
        self.session.as_mut()
    }

    /// Closes the session. Close failures are logged, not returned.
    pub async fn release(mut self) {
        close_session(self.session.as_mut(), &self.address).await;
        self.released = true;
    }
}

async fn close_session(session: &mut dyn Session, address: &str) {
    match session.close().await {
        Ok(()) => debug!("Closed session to {}", address),
        Err(e) => warn!("Failed to close session to {}: {}", address, e),
    }
}

impl Drop for ScopedSession {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut session = std::mem::replace(&mut self.session, Box::new(ReleasedSession));
        let address = std::mem::take(&mut self.address);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Session to {} dropped without release, closing in background", address);
                runtime.spawn(async move { close_session(session.as_mut(), &address).await });
            }
            Err(_) => warn!("Session to {} dropped outside a runtime; not closed", address),
        }
    }
}

/// Stands in for a session that has been handed off for closing.
struct ReleasedSession;

#[async_trait]
impl Session for ReleasedSession {
    async fn ping(&mut self, _deadline: Deadline) -> Result<()> {
        Err(ScopeError::internal("session already released"))
    }

    async fn query(
        &mut self,
        _sql: &str,
        _args: &[&str],
        _ctx: &QueryContext,
    ) -> Result<Box<dyn RowCursor>> {
        Err(ScopeError::internal("session already released"))
    }

    async fn exec(&mut self, _sql: &str, _deadline: Deadline) -> Result<()> {
        Err(ScopeError::internal("session already released"))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
