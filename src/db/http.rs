//! Engine session over the HTTP interface.
//!
//! Results are requested as `JSONCompactEachRowWithNamesAndTypes`: a line of
//! column names, a line of type names, then one JSON array per row. The
//! body is streamed, so rows are decoded as they arrive.

use super::statements::bind_args;
use super::{complete_handshake, ColumnType, Deadline, QueryContext, RowCursor, Session, Slot};
use crate::config::ConnectionProfile;
use crate::error::{Result, ScopeError};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::pin::Pin;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio_util::io::StreamReader;
use tracing::debug;
use url::Url;

/// Output format requested for every result.
const RESULT_FORMAT: &str = "JSONCompactEachRowWithNamesAndTypes";

type BodyLines = Lines<Pin<Box<dyn AsyncBufRead + Send>>>;

/// A session bound to one engine address. Holds no pooled connections.
#[derive(Debug)]
pub struct HttpSession {
    client: Client,
    endpoint: Url,
    username: String,
    password: String,
    database: String,
}

impl HttpSession {
    /// Connects to the engine described by `profile` and runs the handshake.
    pub async fn open(profile: &ConnectionProfile, deadline: Deadline) -> Result<Self> {
        let mut session = Self::new(profile)?;
        complete_handshake(&mut session, &profile.address(), deadline).await?;
        Ok(session)
    }

    fn new(profile: &ConnectionProfile) -> Result<Self> {
        let scheme = if profile.use_tls { "https" } else { "http" };
        let endpoint = Url::parse(&format!("{scheme}://{}/", profile.address()))
            .map_err(|e| ScopeError::config(format!("Invalid engine address: {e}")))?;

        // Certificates are not verified when TLS is on.
        let client = Client::builder()
            .danger_accept_invalid_certs(profile.use_tls)
            .pool_max_idle_per_host(0)
            .user_agent(concat!("ch-scope/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ScopeError::connection(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            username: profile.username.clone(),
            password: profile.password.clone(),
            database: profile.effective_database().to_string(),
        })
    }

    fn statement_url(&self, query_id: Option<&str>, with_format: bool) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("database", &self.database);
            if with_format {
                pairs.append_pair("default_format", RESULT_FORMAT);
                // Bare JSON numbers would lose Decimal digits.
                pairs.append_pair("output_format_json_quote_decimals", "1");
            }
            if let Some(query_id) = query_id {
                pairs.append_pair("query_id", query_id);
            }
        }
        url
    }

    fn request(&self, url: Url, sql: String) -> RequestBuilder {
        let mut request = self.client.post(url).body(sql);
        if !self.username.is_empty() {
            request = request.header("X-ClickHouse-User", &self.username);
        }
        if !self.password.is_empty() {
            request = request.header("X-ClickHouse-Key", &self.password);
        }
        request
    }

    async fn send(&self, url: Url, sql: String, deadline: Deadline) -> Result<Response> {
        let request = self.request(url, sql);
        let response = deadline
            .run("sending the statement", async {
                request.send().await.map_err(|e| self.map_send_error(e))
            })
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = deadline
            .run("reading the error response", async {
                Ok(response.text().await.unwrap_or_default())
            })
            .await?;
        Err(map_status_error(status, body.trim()))
    }

    fn map_send_error(&self, error: reqwest::Error) -> ScopeError {
        let host = self.endpoint.host_str().unwrap_or("localhost");
        let port = self.endpoint.port_or_known_default().unwrap_or_default();
        if error.is_connect() {
            ScopeError::connection(format!(
                "Cannot connect to {host}:{port}. Check that the server is running."
            ))
        } else if error.is_timeout() {
            ScopeError::timeout(format!("Request to {host}:{port} timed out"))
        } else {
            ScopeError::query(format!("Request failed: {error}"))
        }
    }
}

fn map_status_error(status: StatusCode, body: &str) -> ScopeError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ScopeError::connection(format!("Authentication failed: {body}"))
        }
        _ if body.is_empty() => ScopeError::query(format!("Engine returned HTTP {status}")),
        _ => ScopeError::query(body.to_string()),
    }
}

#[async_trait]
impl Session for HttpSession {
    async fn ping(&mut self, deadline: Deadline) -> Result<()> {
        let url = self
            .endpoint
            .join("ping")
            .map_err(|e| ScopeError::internal(format!("Invalid ping URL: {e}")))?;
        let response = deadline
            .run("ping", async {
                self.client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| self.map_send_error(e))
            })
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ScopeError::connection(format!(
                "Ping returned HTTP {}",
                response.status()
            )))
        }
    }

    async fn query(
        &mut self,
        sql: &str,
        args: &[&str],
        ctx: &QueryContext,
    ) -> Result<Box<dyn RowCursor>> {
        let statement = bind_args(sql, args)?;
        debug!(query_id = ?ctx.query_id, "Executing: {}", statement);

        let url = self.statement_url(ctx.query_id.as_deref(), true);
        let response = self.send(url, statement, ctx.deadline).await?;
        let cursor = HttpCursor::from_response(response, ctx.deadline).await?;
        Ok(Box::new(cursor))
    }

    async fn exec(&mut self, sql: &str, deadline: Deadline) -> Result<()> {
        debug!("Executing: {}", sql);
        let url = self.statement_url(None, false);
        let response = self.send(url, sql.to_string(), deadline).await?;
        deadline
            .run("reading the statement response", async {
                response
                    .bytes()
                    .await
                    .map(|_| ())
                    .map_err(|e| ScopeError::query(format!("Failed to read response: {e}")))
            })
            .await
    }

    async fn close(&mut self) -> Result<()> {
        // Nothing is kept alive between requests; dropping the client frees it.
        Ok(())
    }
}

/// Streaming cursor over a `JSONCompactEachRowWithNamesAndTypes` body.
pub struct HttpCursor {
    lines: Option<BodyLines>,
    columns: Vec<String>,
    types: Vec<ColumnType>,
    current: Option<Vec<serde_json::Value>>,
    error: Option<ScopeError>,
    deadline: Deadline,
}

impl HttpCursor {
    /// Reads the two header lines of `response` and positions before the first row.
    pub async fn from_response(response: Response, deadline: Deadline) -> Result<Self> {
        let body = response.bytes_stream().map_err(std::io::Error::other);
        let reader: Pin<Box<dyn AsyncBufRead + Send>> = Box::pin(StreamReader::new(body));
        Self::from_lines(reader.lines(), deadline).await
    }

    async fn from_lines(mut lines: BodyLines, deadline: Deadline) -> Result<Self> {
        let names = read_line(&mut lines, deadline).await?;
        let Some(names) = names else {
            // Statements without a result set send an empty body.
            return Ok(Self {
                lines: None,
                columns: Vec::new(),
                types: Vec::new(),
                current: None,
                error: None,
                deadline,
            });
        };
        let columns: Vec<String> = parse_header(&names)?;

        let type_line = read_line(&mut lines, deadline)
            .await?
            .ok_or_else(|| ScopeError::decode("Result ended before the column types"))?;
        let types = parse_header::<String>(&type_line)?
            .iter()
            .map(|name| ColumnType::parse(name))
            .collect::<Result<Vec<_>>>()?;

        if types.len() != columns.len() {
            return Err(ScopeError::decode(format!(
                "Result has {} column names but {} types",
                columns.len(),
                types.len()
            )));
        }

        Ok(Self {
            lines: Some(lines),
            columns,
            types,
            current: None,
            error: None,
            deadline,
        })
    }
}

async fn read_line(lines: &mut BodyLines, deadline: Deadline) -> Result<Option<String>> {
    loop {
        let line = deadline
            .run("reading the result", async {
                lines
                    .next_line()
                    .await
                    .map_err(|e| ScopeError::query(format!("Result stream failed: {e}")))
            })
            .await?;
        match line {
            Some(line) if line.trim().is_empty() => continue,
            other => return Ok(other),
        }
    }
}

/// True for the exception text the engine writes into a body it has already started.
fn is_exception_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    !trimmed.starts_with('[') && (trimmed.starts_with("Code:") || trimmed.contains("Exception"))
}

fn parse_header<T: serde::de::DeserializeOwned>(line: &str) -> Result<Vec<T>> {
    if is_exception_line(line) {
        return Err(ScopeError::query(line.trim().to_string()));
    }
    serde_json::from_str(line)
        .map_err(|e| ScopeError::decode(format!("Malformed result header: {e}")))
}

#[async_trait]
impl RowCursor for HttpCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn column_types(&self) -> &[ColumnType] {
        &self.types
    }

    async fn advance(&mut self) -> bool {
        self.current = None;
        if self.error.is_some() {
            return false;
        }
        let Some(lines) = self.lines.as_mut() else {
            return false;
        };

        match read_line(lines, self.deadline).await {
            Ok(Some(line)) if is_exception_line(&line) => {
                self.error = Some(ScopeError::query(line.trim().to_string()));
                false
            }
            Ok(Some(line)) => match serde_json::from_str(&line) {
                Ok(values) => {
                    self.current = Some(values);
                    true
                }
                Err(e) => {
                    self.error = Some(ScopeError::decode(format!("Malformed result row: {e}")));
                    false
                }
            },
            Ok(None) => {
                self.lines = None;
                false
            }
            Err(e) => {
                self.error = Some(e);
                false
            }
        }
    }

    fn scan(&mut self, slots: &mut [Slot]) -> Result<()> {
        let row = self
            .current
            .take()
            .ok_or_else(|| ScopeError::internal("scan called without a current row"))?;
        if row.len() != slots.len() {
            return Err(ScopeError::decode(format!(
                "Row has {} values for {} columns",
                row.len(),
                slots.len()
            )));
        }
        for ((raw, slot), name) in row.iter().zip(slots.iter_mut()).zip(&self.columns) {
            slot.fill_json(raw)
                .map_err(|msg| ScopeError::decode(format!("column '{name}': {msg}")))?;
        }
        Ok(())
    }

    fn take_error(&mut self) -> Option<ScopeError> {
        self.error.take()
    }

    async fn close(&mut self) {
        self.lines = None;
        self.current = None;
    }
}
