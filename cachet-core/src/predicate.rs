//! Predicates for bulk deletes and key-selecting queries
//!
//! The core only needs a narrow predicate language: key equality (which
//! bulk invalidation can resolve to an exact key set), a handful of
//! evaluable comparisons, and an opaque `Native` form that only the store
//! understands.

use crate::{Record, RecordKey};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

/// Comparison operator for field predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldOperator {
    /// Equal to
    Eq,
    /// Not equal to
    Ne,
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Greater than or equal
    Gte,
    /// Less than or equal
    Lte,
    /// Member of a JSON array value
    In,
}

/// Boxed record test for [`Predicate::Custom`].
#[derive(Clone)]
pub struct CustomPredicate {
    label: String,
    test: Arc<dyn Fn(&Record) -> bool + Send + Sync>,
}

impl CustomPredicate {
    /// Wrap a closure. The label shows up in logs and query shapes.
    pub fn new(
        label: impl Into<String>,
        test: impl Fn(&Record) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            test: Arc::new(test),
        }
    }

    /// Label given at construction.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for CustomPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomPredicate")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Selection over the records of one namespace.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Exactly one key.
    KeyEquals(RecordKey),
    /// Any of a set of keys.
    KeyIn(BTreeSet<RecordKey>),
    /// Keys inside a range.
    KeyRange {
        lower: Bound<RecordKey>,
        upper: Bound<RecordKey>,
    },
    /// Comparison on one field of the record state.
    Field {
        field: String,
        operator: FieldOperator,
        value: Value,
    },
    /// Arbitrary in-process test.
    Custom(CustomPredicate),
    /// Statement only the backing store can evaluate.
    Native { statement: String },
}

impl Predicate {
    /// `key = k`
    pub fn key_equals(key: impl Into<RecordKey>) -> Self {
        Self::KeyEquals(key.into())
    }

    /// `key IN (...)`
    pub fn key_in<K: Into<RecordKey>>(keys: impl IntoIterator<Item = K>) -> Self {
        Self::KeyIn(keys.into_iter().map(Into::into).collect())
    }

    /// `key <= k`
    pub fn key_at_most(key: impl Into<RecordKey>) -> Self {
        Self::KeyRange {
            lower: Bound::Unbounded,
            upper: Bound::Included(key.into()),
        }
    }

    /// `field = value`
    pub fn field_eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Field {
            field: field.into(),
            operator: FieldOperator::Eq,
            value: value.into(),
        }
    }

    /// `field IN (values)`
    pub fn field_in<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::Field {
            field: field.into(),
            operator: FieldOperator::In,
            value: Value::Array(values.into_iter().map(Into::into).collect()),
        }
    }

    /// Statement the store evaluates on its own.
    pub fn native(statement: impl Into<String>) -> Self {
        Self::Native {
            statement: statement.into(),
        }
    }

    /// The exact key set selected, when the predicate is pure key equality.
    pub fn resolved_keys(&self) -> Option<BTreeSet<RecordKey>> {
        match self {
            Self::KeyEquals(key) => Some(BTreeSet::from([key.clone()])),
            Self::KeyIn(keys) => Some(keys.clone()),
            _ => None,
        }
    }

    /// Whether [`Predicate::matches`] can decide this predicate in-process.
    pub fn is_evaluable(&self) -> bool {
        !matches!(self, Self::Native { .. })
    }

    /// Evaluate against a record. `None` for `Native` predicates.
    pub fn matches(&self, record: &Record) -> Option<bool> {
        let matched = match self {
            Self::KeyEquals(key) => record.key == *key,
            Self::KeyIn(keys) => keys.contains(&record.key),
            Self::KeyRange { lower, upper } => (lower.as_ref(), upper.as_ref()).contains(&record.key),
            Self::Field {
                field,
                operator,
                value,
            } => record
                .field(field)
                .is_some_and(|actual| compare_field(actual, *operator, value)),
            Self::Custom(custom) => (custom.test)(record),
            Self::Native { .. } => return None,
        };
        Some(matched)
    }
}

fn compare_field(actual: &Value, operator: FieldOperator, expected: &Value) -> bool {
    match operator {
        FieldOperator::Eq => actual == expected,
        FieldOperator::Ne => actual != expected,
        FieldOperator::In => expected
            .as_array()
            .is_some_and(|values| values.contains(actual)),
        FieldOperator::Gt => order(actual, expected) == Some(Ordering::Greater),
        FieldOperator::Lt => order(actual, expected) == Some(Ordering::Less),
        FieldOperator::Gte => matches!(
            order(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FieldOperator::Lte => matches!(
            order(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
    }
}

/// Numbers compare numerically, strings lexicographically, anything else
/// is incomparable.
fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyEquals(key) => write!(f, "key = {}", key),
            Self::KeyIn(keys) => {
                let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
                write!(f, "key IN ({})", keys.join(", "))
            }
            Self::KeyRange { lower, upper } => {
                match lower {
                    Bound::Included(k) => write!(f, "key >= {}", k)?,
                    Bound::Excluded(k) => write!(f, "key > {}", k)?,
                    Bound::Unbounded => f.write_str("key >= MIN")?,
                }
                match upper {
                    Bound::Included(k) => write!(f, " AND key <= {}", k),
                    Bound::Excluded(k) => write!(f, " AND key < {}", k),
                    Bound::Unbounded => f.write_str(" AND key <= MAX"),
                }
            }
            Self::Field {
                field,
                operator,
                value,
            } => write!(f, "{} {:?} {}", field, operator, value),
            Self::Custom(custom) => write!(f, "custom({})", custom.label()),
            Self::Native { statement } => write!(f, "native({})", statement),
        }
    }
}
