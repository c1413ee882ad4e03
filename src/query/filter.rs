//! Declarative filter predicates.
//!
//! Filters are written as document-database filter documents
//! (`{"in_stock": true, "published_year": {"$gt": 1950}}`) and parsed into a
//! small tree that every store translates into its native language.

use crate::error::{Result, ShelfError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::fmt;

/// Comparison operators supported inside a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    /// Parses an operator key such as `$gt`.
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "$eq" => Some(Self::Eq),
            "$ne" => Some(Self::Ne),
            "$gt" => Some(Self::Gt),
            "$gte" => Some(Self::Gte),
            "$lt" => Some(Self::Lt),
            "$lte" => Some(Self::Lte),
            _ => None,
        }
    }

    /// Returns the operator key used in filter documents.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Eq => "$eq",
            Self::Ne => "$ne",
            Self::Gt => "$gt",
            Self::Gte => "$gte",
            Self::Lt => "$lt",
            Self::Lte => "$lte",
        }
    }

    /// Returns the SQL operator for range comparisons.
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }

    /// Returns true for `$gt`, `$gte`, `$lt` and `$lte`.
    pub fn is_range(&self) -> bool {
        matches!(self, Self::Gt | Self::Gte | Self::Lt | Self::Lte)
    }
}

/// A boolean predicate over document fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filter {
    /// Matches every document (the empty filter `{}`).
    #[default]
    All,
    /// All sub-filters must match.
    And(Vec<Filter>),
    /// At least one sub-filter must match.
    Or(Vec<Filter>),
    /// A single field comparison against a scalar operand.
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
}

impl Filter {
    /// Field equals value.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    /// Field greater than value.
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Gt, value)
    }

    /// Builds a comparison.
    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Conjunction of the given filters.
    pub fn and(filters: Vec<Filter>) -> Self {
        Self::And(filters)
    }

    /// Parses a filter document.
    pub fn from_document(doc: &Value) -> Result<Self> {
        let Value::Object(map) = doc else {
            return Err(ShelfError::query(format!("filter must be a document, got {doc}")));
        };

        let mut clauses = Vec::with_capacity(map.len());
        for (key, value) in map {
            clauses.push(parse_clause(key, value)?);
        }

        Ok(match clauses.len() {
            0 => Self::All,
            1 => clauses.remove(0),
            _ => Self::And(clauses),
        })
    }

    /// Renders the filter back into a filter document.
    pub fn to_document(&self) -> Value {
        match self {
            Self::All => json!({}),
            Self::And(filters) => {
                json!({ "$and": filters.iter().map(Filter::to_document).collect::<Vec<_>>() })
            }
            Self::Or(filters) => {
                json!({ "$or": filters.iter().map(Filter::to_document).collect::<Vec<_>>() })
            }
            Self::Compare { field, op, value } => {
                let mut inner = Map::new();
                inner.insert(op.key().to_string(), value.clone());
                let mut outer = Map::new();
                outer.insert(field.clone(), Value::Object(inner));
                Value::Object(outer)
            }
        }
    }

    /// Returns every field the filter references, in order of appearance.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::All => {}
            Self::And(filters) | Self::Or(filters) => {
                for f in filters {
                    f.collect_fields(out);
                }
            }
            Self::Compare { field, .. } => out.push(field),
        }
    }

    /// Checks operand types and list arity.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::All => Ok(()),
            Self::And(filters) | Self::Or(filters) => {
                if filters.is_empty() {
                    return Err(ShelfError::query("$and/$or require at least one clause"));
                }
                filters.iter().try_for_each(Filter::validate)
            }
            Self::Compare { field, op, value } => {
                match value {
                    Value::Array(_) | Value::Object(_) => {
                        return Err(ShelfError::query(format!(
                            "unsupported operand for '{field}': only scalar values can be compared"
                        )));
                    }
                    Value::Null | Value::Bool(_) if op.is_range() => {
                        return Err(ShelfError::query(format!(
                            "{} on '{field}' requires a number or string operand",
                            op.key()
                        )));
                    }
                    _ => {}
                }
                Ok(())
            }
        }
    }
}

fn parse_clause(key: &str, value: &Value) -> Result<Filter> {
    match key {
        "$and" | "$or" => {
            let Value::Array(items) = value else {
                return Err(ShelfError::query(format!("{key} requires an array")));
            };
            if items.is_empty() {
                return Err(ShelfError::query(format!("{key} requires at least one clause")));
            }
            let parsed = items
                .iter()
                .map(Filter::from_document)
                .collect::<Result<Vec<_>>>()?;
            Ok(if key == "$and" {
                Filter::And(parsed)
            } else {
                Filter::Or(parsed)
            })
        }
        _ if key.starts_with('$') => {
            Err(ShelfError::query(format!("unknown top-level operator '{key}'")))
        }
        "" => Err(ShelfError::query("empty field name in filter")),
        field => parse_field_condition(field, value),
    }
}

fn parse_field_condition(field: &str, value: &Value) -> Result<Filter> {
    let Value::Object(ops) = value else {
        return Ok(Filter::eq(field, value.clone()));
    };

    let operator_keys = ops.keys().filter(|k| k.starts_with('$')).count();
    if operator_keys == 0 {
        return Err(ShelfError::query(format!(
            "unsupported operand for '{field}': embedded documents cannot be compared"
        )));
    }
    if operator_keys != ops.len() {
        return Err(ShelfError::query(format!(
            "cannot mix operators and fields in the condition on '{field}'"
        )));
    }

    let mut clauses = Vec::with_capacity(ops.len());
    for (key, operand) in ops {
        let op = CompareOp::parse(key)
            .ok_or_else(|| ShelfError::query(format!("unknown operator '{key}' on '{field}'")))?;
        clauses.push(Filter::compare(field, op, operand.clone()));
    }

    Ok(if clauses.len() == 1 {
        clauses.remove(0)
    } else {
        Filter::And(clauses)
    })
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_document())
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_document().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let doc = Value::deserialize(deserializer)?;
        Filter::from_document(&doc).map_err(serde::de::Error::custom)
    }
}
