//! The keyed record store.
//!
//! Free functions over a `rusqlite::Connection` and a [`TableSpec`]: insert with
//! optional duplicate skipping, restricted fetches, deletes, and the antijoin
//! (`A - B` by projected key) that the staging protocol and the worker's pending
//! computation are built on. The primary key declared by each table is what makes
//! `insert` atomic per key: two workers racing on the same pending set cannot both
//! succeed.

use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, params_from_iter};
use rustc_hash::FxHashSet;

use crate::core::error::FlowError;
use crate::core::key::{Key, KeyValue};
use crate::core::schemas::TableSpec;

/// One row: its key plus a JSON payload of non-key attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: Key,
    pub payload: serde_json::Value,
}

impl Record {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            payload: serde_json::json!({}),
        }
    }

    pub fn with_payload(key: Key, payload: serde_json::Value) -> Self {
        Self { key, payload }
    }
}

/// Restriction over a table's key fields.
#[derive(Debug, Clone)]
pub enum Predicate {
    True,
    Eq(String, KeyValue),
    Like(String, String),
    And(Vec<Predicate>),
}

impl Predicate {
    /// Restriction matching every field of `key` that the table declares.
    /// An upstream key restricts a downstream table to its children.
    pub fn from_key(spec: &TableSpec, key: &Key) -> Predicate {
        let clauses: Vec<Predicate> = key
            .iter()
            .filter(|(f, _)| spec.key_fields.contains(f))
            .map(|(f, v)| Predicate::Eq(f.to_string(), v.clone()))
            .collect();
        match clauses.len() {
            0 => Predicate::True,
            1 => clauses.into_iter().next().unwrap(),
            _ => Predicate::And(clauses),
        }
    }

    fn sql(&self, spec: &TableSpec, params: &mut Vec<Value>) -> Result<String, FlowError> {
        match self {
            Predicate::True => Ok("1=1".to_string()),
            Predicate::Eq(field, value) => {
                check_field(spec, field)?;
                params.push(kv_to_value(value));
                Ok(format!("\"{}\" = ?", field))
            }
            Predicate::Like(field, pattern) => {
                check_field(spec, field)?;
                params.push(Value::Text(pattern.clone()));
                Ok(format!("\"{}\" LIKE ?", field))
            }
            Predicate::And(clauses) => {
                let parts: Result<Vec<String>, FlowError> =
                    clauses.iter().map(|c| c.sql(spec, params)).collect();
                Ok(format!("({})", parts?.join(" AND ")))
            }
        }
    }
}

fn check_field(spec: &TableSpec, field: &str) -> Result<(), FlowError> {
    if spec.key_fields.contains(&field) {
        Ok(())
    } else {
        Err(FlowError::Validation(format!(
            "table '{}' has no key field '{}'",
            spec.name, field
        )))
    }
}

fn kv_to_value(v: &KeyValue) -> Value {
    match v {
        KeyValue::Int(i) => Value::Integer(*i),
        KeyValue::Text(s) => Value::Text(s.clone()),
    }
}

fn kv_from_ref(spec: &TableSpec, field: &str, v: ValueRef<'_>) -> Result<KeyValue, FlowError> {
    match v {
        ValueRef::Integer(i) => Ok(KeyValue::Int(i)),
        ValueRef::Text(t) => Ok(KeyValue::Text(
            String::from_utf8_lossy(t).into_owned(),
        )),
        other => Err(FlowError::Validation(format!(
            "table '{}' field '{}' holds non-key type {:?}",
            spec.name, field, other
        ))),
    }
}

fn key_column_list(spec: &TableSpec) -> String {
    spec.key_fields
        .iter()
        .map(|f| format!("\"{}\"", f))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Insert rows. With `skip_duplicates`, rows whose key already exists are left
/// untouched (`INSERT OR IGNORE`); without it, a duplicate key is an error and
/// nothing before it in the batch is rolled back by this function. Callers that
/// need a multi-row atomic batch wrap the call in a transaction.
pub fn insert(
    conn: &Connection,
    spec: &TableSpec,
    rows: &[Record],
    skip_duplicates: bool,
) -> Result<usize, FlowError> {
    let placeholders = vec!["?"; spec.key_fields.len() + 1].join(", ");
    let verb = if skip_duplicates {
        "INSERT OR IGNORE"
    } else {
        "INSERT"
    };
    let sql = format!(
        "{} INTO \"{}\" ({}, payload) VALUES ({})",
        verb,
        spec.name,
        key_column_list(spec),
        placeholders
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut inserted = 0usize;
    for row in rows {
        let mut params: Vec<Value> = Vec::with_capacity(spec.key_fields.len() + 1);
        for field in spec.key_fields {
            let value = row.key.get(field).ok_or_else(|| {
                FlowError::Validation(format!(
                    "row key {} is missing field '{}' of table '{}'",
                    row.key, field, spec.name
                ))
            })?;
            params.push(kv_to_value(value));
        }
        params.push(Value::Text(serde_json::to_string(&row.payload)?));
        inserted += stmt.execute(params_from_iter(params))?;
    }
    Ok(inserted)
}

/// Fetch keys satisfying `pred`, in the table's natural (key column) order.
pub fn fetch_keys(
    conn: &Connection,
    spec: &TableSpec,
    pred: &Predicate,
) -> Result<Vec<Key>, FlowError> {
    let mut params: Vec<Value> = Vec::new();
    let where_sql = pred.sql(spec, &mut params)?;
    let cols = key_column_list(spec);
    let sql = format!(
        "SELECT {} FROM \"{}\" WHERE {} ORDER BY {}",
        cols, spec.name, where_sql, cols
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(params))?;
    let mut keys = Vec::new();
    while let Some(row) = rows.next()? {
        let mut key = Key::new();
        for (i, field) in spec.key_fields.iter().enumerate() {
            let kv = kv_from_ref(spec, field, row.get_ref(i)?)?;
            key = key.with(field, kv);
        }
        keys.push(key);
    }
    Ok(keys)
}

/// Fetch full records satisfying `pred`, in natural order.
pub fn fetch(
    conn: &Connection,
    spec: &TableSpec,
    pred: &Predicate,
) -> Result<Vec<Record>, FlowError> {
    let mut params: Vec<Value> = Vec::new();
    let where_sql = pred.sql(spec, &mut params)?;
    let cols = key_column_list(spec);
    let sql = format!(
        "SELECT {}, payload FROM \"{}\" WHERE {} ORDER BY {}",
        cols, spec.name, where_sql, cols
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(params))?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let mut key = Key::new();
        for (i, field) in spec.key_fields.iter().enumerate() {
            let kv = kv_from_ref(spec, field, row.get_ref(i)?)?;
            key = key.with(field, kv);
        }
        let payload_raw: String = row.get(spec.key_fields.len())?;
        records.push(Record {
            key,
            payload: serde_json::from_str(&payload_raw)?,
        });
    }
    Ok(records)
}

/// Fetch exactly the record for `key` (projected onto this table's key fields).
pub fn fetch1(conn: &Connection, spec: &TableSpec, key: &Key) -> Result<Record, FlowError> {
    let projected = key.project(spec.key_fields)?;
    let records = fetch(conn, spec, &Predicate::from_key(spec, &projected))?;
    records.into_iter().next().ok_or_else(|| {
        FlowError::NotFound(format!("no row in '{}' for key {}", spec.name, projected))
    })
}

pub fn exists(conn: &Connection, spec: &TableSpec, key: &Key) -> Result<bool, FlowError> {
    let projected = key.project(spec.key_fields)?;
    Ok(!fetch_keys(conn, spec, &Predicate::from_key(spec, &projected))?.is_empty())
}

/// Delete the rows matching each key, projected onto this table's key fields.
/// A key shorter than the table's (an upstream key) deletes all of its children.
pub fn delete(conn: &Connection, spec: &TableSpec, keys: &[Key]) -> Result<usize, FlowError> {
    let mut deleted = 0usize;
    for key in keys {
        let mut params: Vec<Value> = Vec::new();
        let pred = Predicate::from_key(spec, key);
        if matches!(pred, Predicate::True) {
            return Err(FlowError::Validation(format!(
                "refusing unrestricted delete on '{}' for key {}",
                spec.name, key
            )));
        }
        let where_sql = pred.sql(spec, &mut params)?;
        let sql = format!("DELETE FROM \"{}\" WHERE {}", spec.name, where_sql);
        deleted += conn.execute(&sql, params_from_iter(params))?;
    }
    Ok(deleted)
}

/// `A - B`: keys of `a` satisfying `pred` whose projection onto the key fields
/// shared with `b` has no counterpart in `b`. This is the gate between pipeline
/// stages: "staged but never populated", "eligible but not yet processed".
pub fn difference(
    conn: &Connection,
    a: &TableSpec,
    b: &TableSpec,
    pred: &Predicate,
) -> Result<Vec<Key>, FlowError> {
    let common = a.common_key_fields(b);
    if common.is_empty() {
        return Err(FlowError::Validation(format!(
            "tables '{}' and '{}' share no key fields",
            a.name, b.name
        )));
    }
    let b_keys: FxHashSet<Key> = fetch_keys(conn, b, &Predicate::True)?
        .into_iter()
        .map(|k| k.project(&common))
        .collect::<Result<_, _>>()?;
    let mut out = Vec::new();
    for key in fetch_keys(conn, a, pred)? {
        if !b_keys.contains(&key.project(&common)?) {
            out.push(key);
        }
    }
    Ok(out)
}
