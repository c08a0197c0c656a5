//! Row-wise expressions, aggregations, and sort keys.
//!
//! Predicates and assignments are a small data-described AST rather than
//! opaque closures, so the operation log stays introspectable (the shard-key
//! invalidation analysis pattern-matches on it) and log entries can be
//! serialized for dispatch.

use crate::error::{Error, Result};
use crate::table::{Table, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Comparison operators for [`Expr::Cmp`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Arithmetic operators for [`Expr::Arith`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// A row-wise expression over a table's columns.
///
/// Null semantics: comparisons involving a null cell evaluate to false,
/// arithmetic on a null or non-numeric cell yields null, and a filter keeps
/// only rows whose predicate evaluates to `Bool(true)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// A column reference, resolved against the chunk at replay time.
    Col(String),
    /// A literal cell value.
    Lit(Value),
    Cmp {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Arith {
        op: ArithOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

/// Reference a column by name.
pub fn col(name: impl Into<String>) -> Expr {
    Expr::Col(name.into())
}

/// A literal value.
pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::Lit(value.into())
}

impl Expr {
    fn cmp_op(self, op: CmpOp, rhs: Expr) -> Expr {
        Expr::Cmp {
            op,
            lhs: Box::new(self),
            rhs: Box::new(rhs),
        }
    }

    fn arith_op(self, op: ArithOp, rhs: Expr) -> Expr {
        Expr::Arith {
            op,
            lhs: Box::new(self),
            rhs: Box::new(rhs),
        }
    }

    #[must_use]
    pub fn eq(self, rhs: Expr) -> Expr {
        self.cmp_op(CmpOp::Eq, rhs)
    }

    #[must_use]
    pub fn ne(self, rhs: Expr) -> Expr {
        self.cmp_op(CmpOp::Ne, rhs)
    }

    #[must_use]
    pub fn lt(self, rhs: Expr) -> Expr {
        self.cmp_op(CmpOp::Lt, rhs)
    }

    #[must_use]
    pub fn le(self, rhs: Expr) -> Expr {
        self.cmp_op(CmpOp::Le, rhs)
    }

    #[must_use]
    pub fn gt(self, rhs: Expr) -> Expr {
        self.cmp_op(CmpOp::Gt, rhs)
    }

    #[must_use]
    pub fn ge(self, rhs: Expr) -> Expr {
        self.cmp_op(CmpOp::Ge, rhs)
    }

    #[must_use]
    pub fn and(self, rhs: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(rhs))
    }

    #[must_use]
    pub fn or(self, rhs: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(rhs))
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn add(self, rhs: Expr) -> Expr {
        self.arith_op(ArithOp::Add, rhs)
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn sub(self, rhs: Expr) -> Expr {
        self.arith_op(ArithOp::Sub, rhs)
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn mul(self, rhs: Expr) -> Expr {
        self.arith_op(ArithOp::Mul, rhs)
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn div(self, rhs: Expr) -> Expr {
        self.arith_op(ArithOp::Div, rhs)
    }

    /// Evaluate against one row. `op` names the enclosing operation for
    /// schema errors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] if a referenced column does not exist.
    pub(crate) fn eval(&self, table: &Table, row: usize, op: &str) -> Result<Value> {
        match self {
            Expr::Col(name) => {
                let c = table
                    .column(name)
                    .ok_or_else(|| Error::schema(op, name.clone()))?;
                Ok(c.values[row].clone())
            }
            Expr::Lit(v) => Ok(v.clone()),
            Expr::Cmp { op: cmp, lhs, rhs } => {
                let l = lhs.eval(table, row, op)?;
                let r = rhs.eval(table, row, op)?;
                let hit = match (cmp, l.compare(&r)) {
                    (_, None) => false,
                    (CmpOp::Eq, Some(o)) => o == Ordering::Equal,
                    (CmpOp::Ne, Some(o)) => o != Ordering::Equal,
                    (CmpOp::Lt, Some(o)) => o == Ordering::Less,
                    (CmpOp::Le, Some(o)) => o != Ordering::Greater,
                    (CmpOp::Gt, Some(o)) => o == Ordering::Greater,
                    (CmpOp::Ge, Some(o)) => o != Ordering::Less,
                };
                Ok(Value::Bool(hit))
            }
            Expr::And(lhs, rhs) => {
                let l = lhs.eval(table, row, op)?.truthy();
                let r = rhs.eval(table, row, op)?.truthy();
                Ok(Value::Bool(l && r))
            }
            Expr::Or(lhs, rhs) => {
                let l = lhs.eval(table, row, op)?.truthy();
                let r = rhs.eval(table, row, op)?.truthy();
                Ok(Value::Bool(l || r))
            }
            Expr::Not(inner) => Ok(Value::Bool(!inner.eval(table, row, op)?.truthy())),
            Expr::Arith { op: ar, lhs, rhs } => {
                let l = lhs.eval(table, row, op)?;
                let r = rhs.eval(table, row, op)?;
                Ok(arith(*ar, &l, &r))
            }
        }
    }
}

fn arith(op: ArithOp, lhs: &Value, rhs: &Value) -> Value {
    // Int op Int stays Int (except Div), anything else numeric goes Float.
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        return match op {
            ArithOp::Add => a.checked_add(*b).map_or(Value::Null, Value::Int),
            ArithOp::Sub => a.checked_sub(*b).map_or(Value::Null, Value::Int),
            ArithOp::Mul => a.checked_mul(*b).map_or(Value::Null, Value::Int),
            ArithOp::Div => {
                if *b == 0 {
                    Value::Null
                } else {
                    Value::Float(*a as f64 / *b as f64)
                }
            }
        };
    }
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => Value::Float(match op {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            ArithOp::Div => a / b,
        }),
        _ => Value::Null,
    }
}

/// An aggregation applied per group by a summarize operation.
///
/// `Sum`/`Mean`/`Min`/`Max` skip null and non-numeric cells (`Min`/`Max` skip
/// nulls only); a group with nothing left yields null. `Count` counts rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Agg {
    Count,
    Sum(String),
    Mean(String),
    Min(String),
    Max(String),
}

impl Agg {
    #[must_use]
    pub fn sum(column: impl Into<String>) -> Self {
        Agg::Sum(column.into())
    }

    #[must_use]
    pub fn mean(column: impl Into<String>) -> Self {
        Agg::Mean(column.into())
    }

    #[must_use]
    pub fn min(column: impl Into<String>) -> Self {
        Agg::Min(column.into())
    }

    #[must_use]
    pub fn max(column: impl Into<String>) -> Self {
        Agg::Max(column.into())
    }

    /// Evaluate over the rows of one group.
    pub(crate) fn eval(&self, table: &Table, rows: &[usize]) -> Result<Value> {
        let column = |name: &str| {
            table
                .column(name)
                .ok_or_else(|| Error::schema("summarize", name))
        };
        match self {
            Agg::Count => Ok(Value::Int(rows.len() as i64)),
            Agg::Sum(name) => {
                let c = column(name)?;
                let mut int_acc: i64 = 0;
                let mut float_acc: f64 = 0.0;
                let mut is_float = false;
                let mut any = false;
                for &r in rows {
                    match &c.values[r] {
                        Value::Int(i) => {
                            if is_float {
                                float_acc += *i as f64;
                            } else {
                                int_acc = int_acc.wrapping_add(*i);
                            }
                            any = true;
                        }
                        Value::Float(f) => {
                            if !is_float {
                                float_acc = int_acc as f64;
                                is_float = true;
                            }
                            float_acc += f;
                            any = true;
                        }
                        _ => {}
                    }
                }
                Ok(match (any, is_float) {
                    (false, _) => Value::Null,
                    (true, false) => Value::Int(int_acc),
                    (true, true) => Value::Float(float_acc),
                })
            }
            Agg::Mean(name) => {
                let c = column(name)?;
                let mut sum = 0.0;
                let mut n = 0usize;
                for &r in rows {
                    if let Some(v) = c.values[r].as_f64() {
                        sum += v;
                        n += 1;
                    }
                }
                Ok(if n == 0 {
                    Value::Null
                } else {
                    Value::Float(sum / n as f64)
                })
            }
            Agg::Min(name) => {
                let c = column(name)?;
                Ok(fold_extreme(c, rows, Ordering::Less))
            }
            Agg::Max(name) => {
                let c = column(name)?;
                Ok(fold_extreme(c, rows, Ordering::Greater))
            }
        }
    }
}

fn fold_extreme(c: &crate::table::Column, rows: &[usize], keep: Ordering) -> Value {
    let mut best: Option<&Value> = None;
    for &r in rows {
        let v = &c.values[r];
        if v.is_null() {
            continue;
        }
        best = Some(match best {
            None => v,
            Some(b) if v.cmp(b) == keep => v,
            Some(b) => b,
        });
    }
    best.cloned().unwrap_or(Value::Null)
}

/// One sort key of an arrange operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    pub descending: bool,
}

impl SortKey {
    #[must_use]
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    #[must_use]
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Column;

    fn sample() -> Table {
        Table::new(vec![
            Column::new(
                "n",
                vec![Value::Int(1), Value::Int(2), Value::Null, Value::Int(4)],
            ),
            Column::new(
                "f",
                vec![
                    Value::Float(0.5),
                    Value::Float(1.5),
                    Value::Float(2.5),
                    Value::Null,
                ],
            ),
        ])
        .unwrap()
    }

    #[test]
    fn comparisons_with_null_are_false() -> Result<()> {
        let t = sample();
        let e = col("n").gt(lit(0));
        assert_eq!(e.eval(&t, 0, "filter")?, Value::Bool(true));
        assert_eq!(e.eval(&t, 2, "filter")?, Value::Bool(false));
        Ok(())
    }

    #[test]
    fn int_float_comparison_coerces() -> Result<()> {
        let t = sample();
        let e = col("n").gt(col("f"));
        assert_eq!(e.eval(&t, 0, "filter")?, Value::Bool(true));
        assert_eq!(e.eval(&t, 1, "filter")?, Value::Bool(true));
        Ok(())
    }

    #[test]
    fn arithmetic_propagates_null() -> Result<()> {
        let t = sample();
        let e = col("n").add(lit(10));
        assert_eq!(e.eval(&t, 1, "mutate")?, Value::Int(12));
        assert_eq!(e.eval(&t, 2, "mutate")?, Value::Null);
        Ok(())
    }

    #[test]
    fn missing_column_names_operation_and_column() {
        let t = sample();
        let err = col("nope").eval(&t, 0, "filter").unwrap_err();
        match err {
            Error::Schema { op, column } => {
                assert_eq!(op, "filter");
                assert_eq!(column, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn sum_skips_nulls_and_keeps_int() -> Result<()> {
        let t = sample();
        let rows = [0usize, 1, 2, 3];
        assert_eq!(Agg::sum("n").eval(&t, &rows)?, Value::Int(7));
        assert_eq!(Agg::mean("n").eval(&t, &rows)?, Value::Float(7.0 / 3.0));
        assert_eq!(Agg::max("f").eval(&t, &rows)?, Value::Float(2.5));
        Ok(())
    }
}
