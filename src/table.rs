//! In-memory tables: the unit a chunk deserializes into.
//!
//! A [`Table`] is a set of equally-long named [`Column`]s of dynamically typed
//! [`Value`] cells. Cells carry a total order and a hash for every variant
//! (floats use IEEE total ordering and hash their bit pattern), so any column
//! can serve as a sort, group, or join key.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

/// A single dynamically typed cell.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view used by arithmetic and aggregation. `None` for
    /// non-numeric variants.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Predicate truthiness: only `Bool(true)` passes a filter.
    pub(crate) fn truthy(&self) -> bool {
        matches!(self, Value::Bool(true))
    }

    /// Comparison used by predicate expressions. Unlike the canonical [`Ord`]
    /// below, this coerces `Int` vs `Float` to a numeric comparison, and
    /// yields `None` when either side is null or the types are incomparable
    /// (predicates treat `None` as false).
    #[must_use]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => Some(a.total_cmp(&b)),
                _ => None,
            },
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Str(_) => 4,
        }
    }
}

// Equality is exact: Int(1) != Float(1.0), and floats compare by bit pattern
// so the impl stays consistent with the total order and the hash.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Canonical total order: variants rank Null < Bool < Int < Float < Str,
/// floats order by `total_cmp`.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Str(s) => s.hash(state),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// A named column of cells.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// An ordered set of equally-long named columns.
///
/// Invariants (enforced on construction and on row-bind): column names are
/// unique and all columns have the same length.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    /// Build a table, validating the schema invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedTable`] on duplicate column names or unequal
    /// column lengths.
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let mut seen = HashSet::new();
        for c in &columns {
            if !seen.insert(c.name.as_str()) {
                return Err(Error::MalformedTable(format!(
                    "duplicate column name {:?}",
                    c.name
                )));
            }
        }
        if let Some(first) = columns.first() {
            let rows = first.values.len();
            for c in &columns[1..] {
                if c.values.len() != rows {
                    return Err(Error::MalformedTable(format!(
                        "column {:?} has {} rows, expected {rows}",
                        c.name,
                        c.values.len()
                    )));
                }
            }
        }
        Ok(Self { columns })
    }

    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.values.len())
    }

    #[must_use]
    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Clone one row as a value vector, in column order.
    #[must_use]
    pub fn row(&self, index: usize) -> Vec<Value> {
        self.columns
            .iter()
            .map(|c| c.values[index].clone())
            .collect()
    }

    /// Select rows by index, preserving the given order. Indices may repeat.
    #[must_use]
    pub fn take(&self, rows: &[usize]) -> Table {
        let columns = self
            .columns
            .iter()
            .map(|c| Column {
                name: c.name.clone(),
                values: rows.iter().map(|&r| c.values[r].clone()).collect(),
            })
            .collect();
        Table { columns }
    }

    /// An empty table with this table's schema.
    #[must_use]
    pub fn empty_like(&self) -> Table {
        Table {
            columns: self
                .columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    values: Vec::new(),
                })
                .collect(),
        }
    }

    /// Append one row given in column order. Caller guarantees the width
    /// matches; used on tables produced by [`Table::empty_like`].
    pub(crate) fn push_row(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.columns.len());
        for (c, v) in self.columns.iter_mut().zip(row) {
            c.values.push(v);
        }
    }

    /// Replace a column's values, or append a new column.
    pub(crate) fn set_column(&mut self, name: &str, values: Vec<Value>) {
        match self.column_index(name) {
            Some(i) => self.columns[i].values = values,
            None => self.columns.push(Column::new(name, values)),
        }
    }

    /// Row-bind tables in order into one table.
    ///
    /// All parts must share the same column names in the same order; leading
    /// parts define the schema. An empty iterator yields an empty table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedTable`] on a schema mismatch between parts.
    pub fn rbind(parts: impl IntoIterator<Item = Table>) -> Result<Table> {
        let mut parts = parts.into_iter();
        let Some(mut out) = parts.next() else {
            return Ok(Table::default());
        };
        for part in parts {
            if part.names() != out.names() {
                return Err(Error::MalformedTable(format!(
                    "cannot row-bind {:?} onto {:?}",
                    part.names(),
                    out.names()
                )));
            }
            for (dst, src) in out.columns.iter_mut().zip(part.columns) {
                dst.values.extend(src.values);
            }
        }
        Ok(out)
    }
}
