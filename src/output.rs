//! Rendering of command results.
//!
//! Results are collected into a [`CommandOutput`] and rendered either as
//! aligned text for terminals or as pretty-printed JSON for scripts.

use crate::db::{CompareResult, QueryResult, QueryStats, TableDescription, TableMeta};
use crate::error::{Result, ScopeError};
use crate::inspector::ConnectionStatus;
use clap::ValueEnum;
use serde::Serialize;
use serde_json::json;

/// How results are printed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Output of one command.
#[derive(Debug, Clone)]
pub enum CommandOutput {
    Status {
        address: String,
        status: ConnectionStatus,
    },
    Version(String),
    Databases(Vec<String>),
    Tables {
        database: String,
        tables: Vec<TableMeta>,
    },
    Schema(TableDescription),
    Query(QueryResult),
    Stats(QueryStats),
    Compare(CompareResult),
}

impl CommandOutput {
    /// Renders the output in `format`.
    pub fn render(&self, format: OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Text => Ok(self.render_text()),
            OutputFormat::Json => self.render_json(),
        }
    }

    fn render_text(&self) -> String {
        match self {
            CommandOutput::Status { address, status } => format!("{address}: {status}"),
            CommandOutput::Version(version) => version.clone(),
            CommandOutput::Databases(names) => names.join("\n"),
            CommandOutput::Tables { database, tables } => {
                if tables.is_empty() {
                    return format!("No tables in {database}");
                }
                let rows = tables
                    .iter()
                    .map(|t| vec![t.name.clone(), t.engine.clone()])
                    .collect::<Vec<_>>();
                format_table(&["name".to_string(), "engine".to_string()], &rows)
            }
            CommandOutput::Schema(description) => description.format_for_display(),
            CommandOutput::Query(result) => format_query_result(result),
            CommandOutput::Stats(stats) => format_stats(stats),
            CommandOutput::Compare(result) => format_compare(result),
        }
    }

    fn render_json(&self) -> Result<String> {
        match self {
            CommandOutput::Status { address, status } => {
                to_json(&json!({ "address": address, "status": status }))
            }
            CommandOutput::Version(version) => to_json(&json!({ "version": version })),
            CommandOutput::Databases(names) => to_json(names),
            CommandOutput::Tables { tables, .. } => to_json(tables),
            CommandOutput::Schema(description) => to_json(description),
            CommandOutput::Query(result) => to_json(result),
            CommandOutput::Stats(stats) => to_json(stats),
            CommandOutput::Compare(result) => to_json(result),
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| ScopeError::internal(format!("Failed to serialize output: {e}")))
}

/// Formats rows as an aligned table with a header separator.
pub fn format_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(i) {
                *width = (*width).max(cell.chars().count());
            }
        }
    }

    let render_line = |cells: &[String]| {
        let padded = widths
            .iter()
            .enumerate()
            .map(|(i, &width)| {
                let cell = cells.get(i).map(String::as_str).unwrap_or("");
                format!(" {:<width$} ", cell)
            })
            .collect::<Vec<_>>();
        padded.join("|").trim_end().to_string()
    };

    let separator = widths
        .iter()
        .map(|width| "-".repeat(width + 2))
        .collect::<Vec<_>>()
        .join("+");

    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(render_line(headers));
    lines.push(separator);
    lines.extend(rows.iter().map(|row| render_line(row)));
    lines.join("\n")
}

fn format_query_result(result: &QueryResult) -> String {
    let rows = result
        .rows
        .iter()
        .map(|row| {
            result
                .columns
                .iter()
                .map(|column| {
                    row.get(column)
                        .map(|v| v.to_display_string())
                        .unwrap_or_else(|| "NULL".to_string())
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    let noun = if result.row_count() == 1 { "row" } else { "rows" };
    let table = if result.columns.is_empty() {
        String::new()
    } else {
        format!("{}\n", format_table(&result.columns, &rows))
    };
    format!(
        "{table}({} {noun})\n\n{}",
        result.row_count(),
        format_stats(&result.stats)
    )
}

fn stats_lines(stats: &QueryStats) -> [(&'static str, String); 6] {
    [
        ("Execution time", format!("{} ms", stats.execution_time_ms)),
        ("Rows read", stats.rows_read.to_string()),
        ("Bytes read", stats.bytes_read.to_string()),
        ("Memory peak", stats.memory_peak.to_string()),
        ("Parts read", stats.parts_read.to_string()),
        ("Marks read", stats.marks_read.to_string()),
    ]
}

/// Formats stats as a label/value block.
pub fn format_stats(stats: &QueryStats) -> String {
    stats_lines(stats)
        .iter()
        .map(|(label, value)| format!("{:<16}{}", format!("{label}:"), value))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_compare(result: &CompareResult) -> String {
    let rows = stats_lines(&result.query1_stats)
        .into_iter()
        .zip(stats_lines(&result.query2_stats))
        .map(|((label, first), (_, second))| vec![label.to_string(), first, second])
        .collect::<Vec<_>>();
    format_table(
        &["metric".to_string(), "query 1".to_string(), "query 2".to_string()],
        &rows,
    )
}
