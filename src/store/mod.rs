//! Remote record store abstraction.
//!
//! A store exposes describe / query / upsert access to one org. The engine
//! only ever talks to a [`RemoteStore`] through a
//! [`Connection`](crate::connection::Connection), which adds concurrency
//! limits, retries and memoization.

pub mod memory;
pub mod rest;

use crate::error::Result;
use crate::query::Query;
use crate::record::Record;
use crate::schema::{ObjectDescriptor, ObjectSummary};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;
pub use rest::RestStore;

/// Who a connection is authenticated as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Login name
    pub username: String,
    /// User id
    #[serde(default)]
    pub user_id: String,
    /// Org id; namespaces every cache entry for this connection
    pub organization_id: String,
}

/// Rows returned by a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Matching rows
    pub records: Vec<Record>,
    /// Total matching rows reported by the store
    #[serde(default)]
    pub total_size: usize,
}

impl QueryResult {
    /// Wrap a list of rows.
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            total_size: records.len(),
            records,
        }
    }

    /// Whether the query returned nothing.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Outcome of writing one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertResult {
    /// Whether the write was accepted
    pub success: bool,
    /// Destination identity
    #[serde(default)]
    pub id: Option<String>,
    /// Error messages when rejected
    #[serde(default)]
    pub errors: Vec<String>,
    /// Whether a new record was created
    #[serde(default)]
    pub created: bool,
}

impl UpsertResult {
    /// Successful write.
    pub fn ok(id: impl Into<String>, created: bool) -> Self {
        Self {
            success: true,
            id: Some(id.into()),
            errors: Vec::new(),
            created,
        }
    }

    /// Rejected write.
    pub fn failed(errors: Vec<String>) -> Self {
        Self {
            success: false,
            id: None,
            errors,
            created: false,
        }
    }

    /// Accepted and carries a destination id.
    pub fn is_complete(&self) -> bool {
        self.success && self.id.as_deref().map(|id| !id.is_empty()).unwrap_or(false)
    }
}

/// Describe / query / upsert access to one record store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Authenticated identity.
    async fn identity(&self) -> Result<Identity>;

    /// List object types.
    async fn describe_global(&self) -> Result<Vec<ObjectSummary>>;

    /// Describe one object type.
    async fn describe(&self, object: &str) -> Result<ObjectDescriptor>;

    /// Run a query and return every matching row.
    async fn query(&self, query: &Query) -> Result<QueryResult>;

    /// Count rows of an object type.
    async fn count(&self, object: &str) -> Result<u64>;

    /// Upsert one record keyed by its external id field.
    async fn upsert_one(
        &self,
        object: &str,
        record: &Record,
        external_id_field: &str,
    ) -> Result<UpsertResult>;

    /// Plain insert, for object types that do not support upsert.
    async fn insert_one(&self, object: &str, record: &Record) -> Result<UpsertResult>;

    /// Upsert many records keyed by their external id field.
    ///
    /// Returns one result per input record, in input order.
    async fn upsert_bulk(
        &self,
        object: &str,
        records: &[Record],
        external_id_field: &str,
    ) -> Result<Vec<UpsertResult>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_result_completeness() {
        assert!(UpsertResult::ok("001", true).is_complete());
        assert!(!UpsertResult::failed(vec!["x".into()]).is_complete());
        let no_id = UpsertResult {
            success: true,
            id: Some(String::new()),
            errors: vec![],
            created: false,
        };
        assert!(!no_id.is_complete());
    }
}
