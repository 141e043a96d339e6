//! Row decoder integration tests.
//!
//! Drives the decoder through the public cursor API with scripted result sets.

use ch_scope::db::mock::{MockCursor, MockRows};
use ch_scope::db::{decode_rows, Value};
use ch_scope::error::ScopeError;
use pretty_assertions::assert_eq;

const MIXED_COLUMNS: &[(&str, &str)] = &[
    ("id", "UInt64"),
    ("label", "LowCardinality(String)"),
    ("score", "Nullable(Int32)"),
    ("samples", "Array(Float64)"),
    ("pair", "Tuple(String, UInt8)"),
];

fn mixed_row(i: u64) -> Vec<Value> {
    vec![
        Value::UInt(i),
        Value::from(format!("row-{i}")),
        if i % 2 == 0 {
            Value::Null
        } else {
            Value::Int(i as i64 * -3)
        },
        Value::Array((0..i % 4).map(|x| Value::Float(x as f64 / 2.0)).collect()),
        Value::Tuple(vec![Value::from("k"), Value::UInt(i % 200)]),
    ]
}

fn mixed_rows(count: u64) -> MockRows {
    (0..count).fold(MockRows::new(MIXED_COLUMNS), |rows, i| rows.row(mixed_row(i)))
}

#[tokio::test]
async fn test_row_count_and_column_order_preserved() {
    for count in [0, 1, 2, 17, 250] {
        let mut cursor = MockCursor::new(mixed_rows(count));
        let decoded = decode_rows(&mut cursor).await.unwrap();

        assert_eq!(decoded.rows.len() as u64, count);
        assert_eq!(
            decoded.columns,
            vec!["id", "label", "score", "samples", "pair"]
        );
        for (i, row) in decoded.rows.iter().enumerate() {
            assert_eq!(row.columns().collect::<Vec<_>>(), decoded.columns);
            assert_eq!(row.get("id"), Some(&Value::UInt(i as u64)));
        }
    }
}

#[tokio::test]
async fn test_row_values_follow_emission_order() {
    let mut cursor = MockCursor::new(mixed_rows(5));
    let decoded = decode_rows(&mut cursor).await.unwrap();

    let labels: Vec<String> = decoded
        .rows
        .iter()
        .map(|row| row.get("label").unwrap().to_display_string())
        .collect();
    assert_eq!(labels, vec!["row-0", "row-1", "row-2", "row-3", "row-4"]);
    assert_eq!(decoded.rows[0].get("score"), Some(&Value::Null));
    assert_eq!(decoded.rows[3].get("score"), Some(&Value::Int(-9)));
}

#[tokio::test]
async fn test_scan_failure_midway_aborts_without_rows() {
    for fail_at in [0, 1, 9] {
        let mut cursor = MockCursor::new(mixed_rows(10).fail_scan_at(fail_at));
        let result = decode_rows(&mut cursor).await;

        assert!(matches!(result, Err(ScopeError::Decode(_))));
        assert!(cursor.is_closed());
    }
}

#[tokio::test]
async fn test_terminal_error_after_exhaustion_is_propagated() {
    let mut cursor = MockCursor::new(
        mixed_rows(3).terminal_error(ScopeError::query("Code: 159. Timeout exceeded")),
    );
    let result = decode_rows(&mut cursor).await;

    assert_eq!(
        result.unwrap_err(),
        ScopeError::query("Code: 159. Timeout exceeded")
    );
    assert!(cursor.is_closed());
}

#[tokio::test]
async fn test_duplicate_column_names_keep_last_value() {
    let rows = MockRows::new(&[("x", "UInt8"), ("x", "String")])
        .row(vec![Value::UInt(1), Value::from("second")]);
    let mut cursor = MockCursor::new(rows);
    let decoded = decode_rows(&mut cursor).await.unwrap();

    assert_eq!(decoded.columns, vec!["x", "x"]);
    assert_eq!(decoded.rows[0].len(), 1);
    assert_eq!(decoded.rows[0].get("x"), Some(&Value::from("second")));
}
