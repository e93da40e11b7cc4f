//! Record flattening for tabular export
//!
//! Bigin records nest lookups (`Owner: { id, name }`) and multi-selects
//! (`Tag: [...]`). Each record becomes one flat row of scalar values.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// One flattened record: column name to scalar JSON value.
pub type FlatRow = BTreeMap<String, Value>;

const KEY_SEPARATOR: &str = "_";

/// Flatten one API record.
///
/// - nested objects join their keys with `_`
/// - arrays of objects become a JSON string
/// - other arrays become their elements joined with `", "`
/// - a non-object record becomes `{ "value": record }`
pub fn flatten_record(record: &Value) -> FlatRow {
    let mut row = FlatRow::new();
    match record {
        Value::Object(map) => flatten_into(&mut row, "", map),
        other => {
            row.insert("value".into(), other.clone());
        }
    }
    row
}

fn flatten_into(row: &mut FlatRow, prefix: &str, map: &Map<String, Value>) {
    for (key, value) in map {
        let column = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}{KEY_SEPARATOR}{key}")
        };

        match value {
            Value::Object(nested) => flatten_into(row, &column, nested),
            Value::Array(items) => {
                row.insert(column, Value::String(flatten_array(items)));
            }
            scalar => {
                row.insert(column, scalar.clone());
            }
        }
    }
}

fn flatten_array(items: &[Value]) -> String {
    match items.first() {
        None => String::new(),
        Some(Value::Object(_)) => Value::Array(items.to_vec()).to_string(),
        Some(_) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", "),
    }
}
