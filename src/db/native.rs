//! Engine session over the native TCP protocol.
//!
//! Each session holds one connection. A statement's result is fetched as a
//! single block, and each column is read according to the runtime type the
//! block reports for it.

use super::statements::bind_args;
use super::{complete_handshake, ColumnType, Deadline, QueryContext, RowCursor, Session, Slot, Value};
use crate::config::ConnectionProfile;
use crate::error::{Result, ScopeError};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone};
use clickhouse_rs::types::{Block, Complex, Decimal, FromSql, Query};
use clickhouse_rs::{ClientHandle, Pool};
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::debug;
use url::Url;
use uuid::Uuid;

/// A session bound to one engine address over the native protocol.
pub struct NativeSession {
    handle: Option<ClientHandle>,
    address: String,
}

impl NativeSession {
    /// Connects to the engine described by `profile` and runs the handshake.
    pub async fn open(profile: &ConnectionProfile, deadline: Deadline) -> Result<Self> {
        let address = profile.address();
        let url = native_url(profile, deadline)?;
        let pool = Pool::new(url.as_str());

        let handle = deadline
            .run("connecting", async {
                pool.get_handle().await.map_err(|e| {
                    ScopeError::connection(format!(
                        "Cannot open a native protocol session to {address}: {e}"
                    ))
                })
            })
            .await?;

        let mut session = Self {
            handle: Some(handle),
            address,
        };
        complete_handshake(&mut session, &profile.address(), deadline).await?;
        Ok(session)
    }

    fn handle(&mut self) -> Result<&mut ClientHandle> {
        self.handle
            .as_mut()
            .ok_or_else(|| ScopeError::connection(format!("Session to {} is closed", self.address)))
    }
}

/// Builds the driver URL for `profile`.
///
/// The driver does not retry on its own; the deadline bounds every wait.
fn native_url(profile: &ConnectionProfile, deadline: Deadline) -> Result<Url> {
    let invalid = |what: &str| ScopeError::config(format!("Invalid {what} for the native protocol"));

    let mut url = Url::parse(&format!(
        "tcp://{}/{}",
        profile.address(),
        profile.effective_database()
    ))
    .map_err(|e| ScopeError::config(format!("Invalid engine address: {e}")))?;
    if !profile.username.is_empty() {
        url.set_username(&profile.username)
            .map_err(|_| invalid("username"))?;
    }
    if !profile.password.is_empty() {
        url.set_password(Some(&profile.password))
            .map_err(|_| invalid("password"))?;
    }

    {
        let mut pairs = url.query_pairs_mut();
        let connect_ms = deadline.remaining().as_millis().max(1);
        pairs.append_pair("connection_timeout", &format!("{connect_ms}ms"));
        pairs.append_pair("send_retries", "0");
        pairs.append_pair("pool_min", "1");
        pairs.append_pair("pool_max", "1");
        if profile.use_tls {
            // Certificates are not verified when TLS is on.
            pairs.append_pair("secure", "true");
            pairs.append_pair("skip_verify", "true");
        }
    }
    Ok(url)
}

#[async_trait]
impl Session for NativeSession {
    async fn ping(&mut self, deadline: Deadline) -> Result<()> {
        let address = self.address.clone();
        let handle = self.handle()?;
        deadline
            .run("ping", async {
                handle
                    .ping()
                    .await
                    .map_err(|e| ScopeError::connection(format!("Ping to {address} failed: {e}")))
            })
            .await
    }

    async fn query(
        &mut self,
        sql: &str,
        args: &[&str],
        ctx: &QueryContext,
    ) -> Result<Box<dyn RowCursor>> {
        let statement = bind_args(sql, args)?;
        debug!(query_id = ?ctx.query_id, "Executing: {}", statement);

        let mut query = Query::new(statement.as_str());
        if let Some(query_id) = ctx.query_id.as_deref() {
            query = query.id(query_id);
        }

        let handle = self.handle()?;
        let block = ctx
            .deadline
            .run("running the statement", async {
                handle
                    .query(query)
                    .fetch_all()
                    .await
                    .map_err(|e| ScopeError::query(e.to_string()))
            })
            .await?;
        Ok(Box::new(NativeCursor::new(block)?))
    }

    async fn exec(&mut self, sql: &str, deadline: Deadline) -> Result<()> {
        debug!("Executing: {}", sql);
        let handle = self.handle()?;
        deadline
            .run("running the statement", async {
                handle
                    .execute(sql)
                    .await
                    .map_err(|e| ScopeError::query(e.to_string()))
            })
            .await
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the handle shuts the single pooled connection.
        self.handle = None;
        Ok(())
    }
}

/// Cursor over a fetched result block.
pub struct NativeCursor {
    block: Option<Block<Complex>>,
    columns: Vec<String>,
    types: Vec<ColumnType>,
    rows: usize,
    next: usize,
    current: Option<usize>,
}

impl NativeCursor {
    fn new(block: Block<Complex>) -> Result<Self> {
        let mut columns = Vec::new();
        let mut types = Vec::new();
        for column in block.columns() {
            columns.push(column.name().to_string());
            types.push(ColumnType::parse(&column.sql_type().to_string())?);
        }

        Ok(Self {
            rows: block.row_count(),
            block: Some(block),
            columns,
            types,
            next: 0,
            current: None,
        })
    }
}

#[async_trait]
impl RowCursor for NativeCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn column_types(&self) -> &[ColumnType] {
        &self.types
    }

    async fn advance(&mut self) -> bool {
        self.current = None;
        if self.block.is_none() || self.next >= self.rows {
            return false;
        }
        self.current = Some(self.next);
        self.next += 1;
        true
    }

    fn scan(&mut self, slots: &mut [Slot]) -> Result<()> {
        let (Some(block), Some(row)) = (self.block.as_ref(), self.current.take()) else {
            return Err(ScopeError::internal("scan called without a current row"));
        };
        if slots.len() != self.columns.len() {
            return Err(ScopeError::decode(format!(
                "Row has {} values for {} columns",
                self.columns.len(),
                slots.len()
            )));
        }

        for (col, (slot, name)) in slots.iter_mut().zip(&self.columns).enumerate() {
            let cell = Cell { block, row, col };
            cell.read(slot.column_type())
                .and_then(|value| slot.fill(value))
                .map_err(|msg| ScopeError::decode(format!("column '{name}': {msg}")))?;
        }
        Ok(())
    }

    fn take_error(&mut self) -> Option<ScopeError> {
        // The whole block is fetched before the cursor exists.
        None
    }

    async fn close(&mut self) {
        self.block = None;
        self.current = None;
    }
}

/// One cell of a fetched block.
struct Cell<'a> {
    block: &'a Block<Complex>,
    row: usize,
    col: usize,
}

impl<'a> Cell<'a> {
    fn read(&self, ty: &ColumnType) -> std::result::Result<Value, String> {
        match ty {
            ColumnType::Nullable(inner) => self.scalar(inner, true),
            ColumnType::Array(inner) => self.array(inner),
            scalar => self.scalar(scalar, false),
        }
    }

    fn scalar(&self, ty: &ColumnType, nullable: bool) -> std::result::Result<Value, String> {
        match ty {
            ColumnType::Int8 => self.get(nullable, |v: i8| Value::Int(v.into())),
            ColumnType::Int16 => self.get(nullable, |v: i16| Value::Int(v.into())),
            ColumnType::Int32 => self.get(nullable, |v: i32| Value::Int(v.into())),
            ColumnType::Int64 => self.get(nullable, Value::Int),
            ColumnType::UInt8 => self.get(nullable, |v: u8| Value::UInt(v.into())),
            ColumnType::UInt16 => self.get(nullable, |v: u16| Value::UInt(v.into())),
            ColumnType::UInt32 => self.get(nullable, |v: u32| Value::UInt(v.into())),
            ColumnType::UInt64 => self.get(nullable, Value::UInt),
            ColumnType::Float32 => self.get(nullable, |v: f32| Value::Float(v.into())),
            ColumnType::Float64 => self.get(nullable, Value::Float),
            ColumnType::Bool => self.get(nullable, Value::Bool),
            ColumnType::String | ColumnType::FixedString(_) | ColumnType::Other(_) => {
                self.get(nullable, Value::String)
            }
            ColumnType::Decimal { .. } => {
                self.get(nullable, |v: Decimal| Value::String(v.to_string()))
            }
            ColumnType::Uuid => self.get(nullable, |v: Uuid| Value::String(v.to_string())),
            ColumnType::Ipv4 => self.get(nullable, |v: Ipv4Addr| Value::String(v.to_string())),
            ColumnType::Ipv6 => self.get(nullable, |v: Ipv6Addr| Value::String(v.to_string())),
            ColumnType::Date | ColumnType::Date32 => self.get(nullable, date_value),
            ColumnType::DateTime { .. } | ColumnType::DateTime64 { .. } => {
                self.get(nullable, datetime_value)
            }
            other => Err(unsupported(other)),
        }
    }

    fn array(&self, inner: &ColumnType) -> std::result::Result<Value, String> {
        match inner {
            ColumnType::Int16 => self.items(|v: i16| Value::Int(v.into())),
            ColumnType::Int32 => self.items(|v: i32| Value::Int(v.into())),
            ColumnType::Int64 => self.items(Value::Int),
            ColumnType::UInt8 => self.items(|v: u8| Value::UInt(v.into())),
            ColumnType::UInt16 => self.items(|v: u16| Value::UInt(v.into())),
            ColumnType::UInt32 => self.items(|v: u32| Value::UInt(v.into())),
            ColumnType::UInt64 => self.items(Value::UInt),
            ColumnType::Float32 => self.items(|v: f32| Value::Float(v.into())),
            ColumnType::Float64 => self.items(Value::Float),
            ColumnType::String | ColumnType::FixedString(_) => self.items(Value::String),
            other => Err(unsupported(&ColumnType::Array(Box::new(other.clone())))),
        }
    }

    fn get<T>(&self, nullable: bool, convert: impl Fn(T) -> Value) -> std::result::Result<Value, String>
    where
        T: FromSql<'a>,
        Option<T>: FromSql<'a>,
    {
        if nullable {
            let value: Option<T> = self.block.get(self.row, self.col).map_err(|e| e.to_string())?;
            Ok(value.map(convert).unwrap_or(Value::Null))
        } else {
            self.block
                .get(self.row, self.col)
                .map(convert)
                .map_err(|e| e.to_string())
        }
    }

    fn items<T>(&self, convert: impl Fn(T) -> Value) -> std::result::Result<Value, String>
    where
        Vec<T>: FromSql<'a>,
    {
        let items: Vec<T> = self.block.get(self.row, self.col).map_err(|e| e.to_string())?;
        Ok(Value::Array(items.into_iter().map(convert).collect()))
    }
}

fn date_value(date: chrono::NaiveDate) -> Value {
    Value::Date(date)
}

fn datetime_value<Tz: TimeZone>(datetime: DateTime<Tz>) -> Value {
    Value::DateTime(datetime.naive_local())
}

fn unsupported(ty: &ColumnType) -> String {
    format!("{ty} columns cannot be read over the native protocol; use protocol = \"http\"")
}
