//! Schema-agnostic row decoding.
//!
//! A [`Slot`] is allocated per column from the cursor's runtime type
//! metadata; the cursor fills all slots of a row in one call and the decoder
//! moves the values into an ordered [`Row`].

use super::{ColumnType, Row, RowCursor, Value};
use crate::error::{Result, ScopeError};
use tracing::debug;

/// Holder for one column's value, typed by the column's runtime type.
#[derive(Debug, Clone)]
pub struct Slot {
    column_type: ColumnType,
    value: Option<Value>,
}

impl Slot {
    /// Allocates an empty slot for a column of type `column_type`.
    pub fn for_type(column_type: &ColumnType) -> Self {
        Self {
            column_type: column_type.clone(),
            value: None,
        }
    }

    pub fn column_type(&self) -> &ColumnType {
        &self.column_type
    }

    /// Stores an already-typed value. Fails if its shape does not match the slot's type.
    pub fn fill(&mut self, value: Value) -> std::result::Result<(), String> {
        if !self.column_type.accepts(&value) {
            return Err(format!("expected {}, got {:?}", self.column_type, value));
        }
        self.value = Some(value);
        Ok(())
    }

    /// Reads a raw JSON cell according to the slot's type.
    pub fn fill_json(&mut self, raw: &serde_json::Value) -> std::result::Result<(), String> {
        self.value = Some(self.column_type.read_json(raw)?);
        Ok(())
    }

    /// Moves the value out, leaving the slot empty for the next row.
    pub fn take(&mut self) -> Option<Value> {
        self.value.take()
    }
}

/// Column names and rows read from a cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedRows {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// Reads every row of `cursor` into ordered column-to-value maps.
///
/// The cursor is closed on every path. A failed row aborts the whole decode;
/// an error recorded by the cursor after its last row is returned as well.
pub async fn decode_rows(cursor: &mut dyn RowCursor) -> Result<DecodedRows> {
    let outcome = read_all(cursor).await;
    cursor.close().await;
    let decoded = outcome?;

    match cursor.take_error() {
        Some(err) => Err(err),
        None => {
            debug!(
                "Decoded {} row(s) across {} column(s)",
                decoded.rows.len(),
                decoded.columns.len()
            );
            Ok(decoded)
        }
    }
}

async fn read_all(cursor: &mut dyn RowCursor) -> Result<DecodedRows> {
    let columns = cursor.columns().to_vec();
    let mut slots: Vec<Slot> = cursor.column_types().iter().map(Slot::for_type).collect();
    if slots.len() != columns.len() {
        return Err(ScopeError::internal(format!(
            "cursor reported {} column names but {} types",
            columns.len(),
            slots.len()
        )));
    }

    let mut rows = Vec::new();
    while cursor.advance().await {
        cursor.scan(&mut slots)?;

        let mut row = Row::with_capacity(columns.len());
        for (name, slot) in columns.iter().zip(slots.iter_mut()) {
            let value = slot.take().ok_or_else(|| {
                ScopeError::internal(format!("column '{name}' was not filled by the cursor"))
            })?;
            row.insert(name.clone(), value);
        }
        rows.push(row);
    }

    Ok(DecodedRows { columns, rows })
}

/// Reads `cursor` to the end without decoding values; returns the row count.
///
/// Used when only the execution cost of a statement matters.
pub async fn drain_rows(cursor: &mut dyn RowCursor) -> Result<usize> {
    let mut count = 0;
    while cursor.advance().await {
        count += 1;
    }
    cursor.close().await;

    match cursor.take_error() {
        Some(err) => Err(err),
        None => Ok(count),
    }
}
