//! Typed query model.
//!
//! Queries are built as values and rendered to SOQL only at the REST edge,
//! which keeps escaping in one place and lets the in-memory store evaluate
//! the same query directly.

use crate::record::{FieldValue, Record};
use std::cmp::Ordering;
use std::fmt;

/// Filter predicate. All filters on a query are combined with AND.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `field = value`
    Eq(String, FieldValue),
    /// `field != ''` (present and not blank)
    NotBlank(String),
    /// `field IN (...)`
    In(String, Vec<String>),
    /// `field > 'value'` (string order)
    GreaterThan(String, String),
    /// `IsDeleted = false`
    NotDeleted,
}

impl Filter {
    /// Whether a record satisfies this predicate.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::Eq(field, value) => record
                .get(field)
                .map(|v| v.same_as(value))
                .unwrap_or(matches!(value, FieldValue::Null)),
            Filter::NotBlank(field) => record.get(field).map(|v| !v.is_blank()).unwrap_or(false),
            Filter::In(field, values) => record
                .text(field)
                .map(|v| values.iter().any(|x| x == v))
                .unwrap_or(false),
            Filter::GreaterThan(field, bound) => record
                .text(field)
                .map(|v| v.cmp(bound.as_str()) == Ordering::Greater)
                .unwrap_or(false),
            Filter::NotDeleted => record
                .get("IsDeleted")
                .map(|v| v.is_blank())
                .unwrap_or(true),
        }
    }

    fn to_soql(&self) -> String {
        match self {
            Filter::Eq(field, value) => format!("{} = {}", field, soql_literal(value)),
            Filter::NotBlank(field) => format!("{} != ''", field),
            Filter::In(field, values) => format!(
                "{} IN ({})",
                field,
                values
                    .iter()
                    .map(|v| quote(v))
                    .collect::<Vec<_>>()
                    .join(",")
            ),
            Filter::GreaterThan(field, bound) => format!("{} > {}", field, quote(bound)),
            Filter::NotDeleted => "IsDeleted = false".to_string(),
        }
    }
}

/// Select query against one object type.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Object type
    pub object: String,
    /// Selected fields
    pub fields: Vec<String>,
    /// Conjunction of filters
    pub filters: Vec<Filter>,
    /// Ascending order field
    pub order_by: Option<String>,
    /// Row limit
    pub limit: Option<usize>,
}

impl Query {
    /// Start a query on `object`.
    pub fn select(object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            fields: Vec::new(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    /// Set selected fields.
    pub fn fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Add a filter.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Order ascending by a field.
    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    /// Limit row count.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a record satisfies every filter.
    pub fn matches(&self, record: &Record) -> bool {
        self.filters.iter().all(|f| f.matches(record))
    }

    /// Render as SOQL.
    pub fn to_soql(&self) -> String {
        let fields = if self.fields.is_empty() {
            "Id".to_string()
        } else {
            self.fields.join(", ")
        };
        let mut soql = format!("SELECT {} FROM {}", fields, self.object);
        if !self.filters.is_empty() {
            let clauses: Vec<String> = self.filters.iter().map(Filter::to_soql).collect();
            soql.push_str(" WHERE ");
            soql.push_str(&clauses.join(" AND "));
        }
        if let Some(ref field) = self.order_by {
            soql.push_str(&format!(" ORDER BY {} ASC", field));
        }
        if let Some(limit) = self.limit {
            soql.push_str(&format!(" LIMIT {}", limit));
        }
        soql
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_soql())
    }
}

fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

fn soql_literal(value: &FieldValue) -> String {
    match value {
        FieldValue::Null => "null".to_string(),
        FieldValue::Bool(b) => b.to_string(),
        FieldValue::Number(n) => n.to_string(),
        FieldValue::Text(s) => quote(s),
        other => quote(&other.to_string()),
    }
}
