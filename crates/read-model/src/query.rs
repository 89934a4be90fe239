//! Filter, sort and pagination types for read-model searches.
//!
//! Conditions address fields with [`FieldRef`] names. Comparisons between
//! values of different JSON kinds never match; sorting across kinds follows
//! the PostgreSQL `jsonb` order (null < string < number < boolean < array <
//! object) with absent fields first in ascending order.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{FieldRef, ReadModel, ReadModelError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Field value is one of the elements of an array value.
    In,
    /// String field contains a substring, or array field contains an element.
    Contains,
    /// Field presence; the value is a boolean (defaults to true).
    Exists,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: Operator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Eq, value)
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::new(field, Operator::Exists, true)
    }

    fn validate(&self) -> Result<()> {
        if self.field.is_empty() || self.field.split('.').any(str::is_empty) {
            return Err(ReadModelError::InvalidQuery(format!(
                "invalid field name '{}'",
                self.field
            )));
        }
        let ok = match self.op {
            Operator::In => self.value.is_array(),
            Operator::Exists => self.value.is_boolean() || self.value.is_null(),
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                self.value.is_number() || self.value.is_string() || self.value.is_boolean()
            }
            Operator::Eq | Operator::Ne | Operator::Contains => !self.value.is_null(),
        };
        if ok {
            Ok(())
        } else {
            Err(ReadModelError::InvalidQuery(format!(
                "value {} is not valid for {:?} on '{}'",
                self.value, self.op, self.field
            )))
        }
    }

    /// Evaluates the condition against a model.
    pub fn matches(&self, model: &ReadModel) -> bool {
        let actual = model.field(&FieldRef::parse(&self.field));
        let actual = actual.as_ref();

        match self.op {
            Operator::Eq => actual.is_some_and(|a| json_eq(a, &self.value)),
            Operator::Ne => !actual.is_some_and(|a| json_eq(a, &self.value)),
            Operator::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            Operator::Gte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            Operator::Lte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::In => match (actual, self.value.as_array()) {
                (Some(a), Some(candidates)) => candidates.iter().any(|c| json_eq(a, c)),
                _ => false,
            },
            Operator::Contains => match actual {
                Some(Value::String(s)) => self.value.as_str().is_some_and(|needle| s.contains(needle)),
                Some(Value::Array(items)) => items.iter().any(|item| json_eq(item, &self.value)),
                _ => false,
            },
            Operator::Exists => actual.is_some() == self.value.as_bool().unwrap_or(true),
        }
    }
}

/// Conjunction of conditions, optionally restricted to one model type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model_type(mut self, model_type: impl Into<String>) -> Self {
        self.model_type = Some(model_type.into());
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn matches(&self, model: &ReadModel) -> bool {
        if let Some(ref model_type) = self.model_type
            && &model.model_type != model_type
        {
            return false;
        }
        self.conditions.iter().all(|c| c.matches(model))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// A search over read models.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindQuery {
    #[serde(default)]
    pub filter: Filter,
    #[serde(default)]
    pub sort: Vec<SortKey>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    /// Also count every model matching the filter.
    #[serde(default)]
    pub include_total: bool,
}

impl FindQuery {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn sort(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_total(mut self) -> Self {
        self.include_total = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for condition in &self.filter.conditions {
            condition.validate()?;
        }
        if let Some(key) = self.sort.iter().find(|k| k.field.is_empty()) {
            return Err(ReadModelError::InvalidQuery(format!(
                "invalid sort field '{}'",
                key.field
            )));
        }
        Ok(())
    }

    /// Orders two models by this query's sort keys.
    pub fn compare(&self, a: &ReadModel, b: &ReadModel) -> Ordering {
        for key in &self.sort {
            let field = FieldRef::parse(&key.field);
            let ordering = sort_order(a.field(&field).as_ref(), b.field(&field).as_ref());
            let ordering = match key.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<ReadModel>,
    /// Number of models matching the filter, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::String(_) => 1,
        Value::Number(_) => 2,
        Value::Bool(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Compares two scalars of the same kind.
fn compare_scalars(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    compare_scalars(actual?, expected)
}

/// Equality where `1` and `1.0` are the same number.
fn json_eq(a: &Value, b: &Value) -> bool {
    match compare_scalars(a, b) {
        Some(ordering) => ordering == Ordering::Equal,
        None => a == b,
    }
}

fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => kind_rank(a).cmp(&kind_rank(b)).then_with(|| {
            compare_scalars(a, b).unwrap_or_else(|| a.to_string().cmp(&b.to_string()))
        }),
    }
}
