//! One authenticated org: store + governor lanes + memoizing cache.

use crate::cache::{self, DurableCache};
use crate::error::Result;
use crate::governor::GovernorSet;
use crate::metrics::{CallKind, Metrics};
use crate::query::Query;
use crate::record::Record;
use crate::schema::{ObjectDescriptor, ObjectSummary};
use crate::store::{Identity, QueryResult, RemoteStore, UpsertResult};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Remote store access with concurrency limits, retries and memoization.
///
/// Every remote call goes through the matching [`GovernorSet`] lane.
/// Describes are memoized in the durable cache under the org's namespace;
/// queries are memoized only when enabled and only when non-empty, so a
/// later run still sees rows that appear after an empty result.
pub struct Connection {
    label: String,
    store: Arc<dyn RemoteStore>,
    cache: Arc<dyn DurableCache>,
    governors: GovernorSet,
    metrics: Arc<Metrics>,
    identity: Identity,
    memoize_queries: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.label)
            .field("identity", &self.identity)
            .field("memoize_queries", &self.memoize_queries)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Resolve the store's identity and bind it to a cache namespace.
    pub async fn open(
        label: impl Into<String>,
        store: Arc<dyn RemoteStore>,
        cache: Arc<dyn DurableCache>,
        governors: GovernorSet,
        metrics: Arc<Metrics>,
        memoize_queries: bool,
    ) -> Result<Self> {
        let label = label.into();
        let identity = governors
            .describe
            .run("identity", || store.identity())
            .await?;
        info!(
            connection = %label,
            username = %identity.username,
            org = %identity.organization_id,
            "connected"
        );
        Ok(Self {
            label,
            store,
            cache,
            governors,
            metrics,
            identity,
            memoize_queries,
        })
    }

    /// Label used in logs (`source` / `destination`).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Authenticated identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Cache namespace for this org.
    pub fn namespace(&self) -> &str {
        &self.identity.organization_id
    }

    /// Shared durable cache handle.
    pub fn cache(&self) -> &Arc<dyn DurableCache> {
        &self.cache
    }

    /// Metrics sink.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Key for an entry owned by this org.
    pub fn cache_key(&self, kind: &str, parts: &[&str]) -> String {
        cache::cache_key(self.namespace(), kind, parts)
    }

    /// List object types (memoized).
    pub async fn describe_global(&self) -> Result<Vec<ObjectSummary>> {
        let key = self.cache_key("describe-global", &[]);
        self.memoized(&key, || {
            self.governors.describe.run("describe_global", || {
                self.metrics.record_call(CallKind::Describe);
                self.store.describe_global()
            })
        })
        .await
    }

    /// Describe one object type (memoized).
    pub async fn describe(&self, object: &str) -> Result<ObjectDescriptor> {
        let key = self.cache_key("describe", &[object]);
        self.memoized(&key, || {
            self.governors.describe.run("describe", || {
                self.metrics.record_call(CallKind::Describe);
                self.store.describe(object)
            })
        })
        .await
    }

    /// Run a query, memoizing non-empty results when enabled.
    pub async fn query(&self, query: &Query) -> Result<QueryResult> {
        if !self.memoize_queries {
            return self.query_live(query).await;
        }

        let soql = query.to_soql();
        let key = self.cache_key("query", &[&soql]);
        match cache::get_as::<QueryResult>(self.cache.as_ref(), &key).await {
            Ok(Some(hit)) => {
                self.metrics.record_cache(true);
                return Ok(hit);
            }
            Ok(None) => self.metrics.record_cache(false),
            Err(e) => warn!(key, error = %e, "cache read failed"),
        }

        let result = self.query_live(query).await?;
        if !result.is_empty() {
            if let Err(e) = cache::put_as(self.cache.as_ref(), &key, &result).await {
                warn!(key, error = %e, "cache write failed");
            }
        }
        Ok(result)
    }

    /// Run a query without consulting the cache.
    pub async fn query_live(&self, query: &Query) -> Result<QueryResult> {
        debug!(connection = %self.label, %query, "query");
        self.governors
            .query
            .run("query", || {
                self.metrics.record_call(CallKind::Query);
                self.store.query(query)
            })
            .await
    }

    /// Count rows of an object type.
    pub async fn count(&self, object: &str) -> Result<u64> {
        self.governors
            .query
            .run("count", || {
                self.metrics.record_call(CallKind::Query);
                self.store.count(object)
            })
            .await
    }

    /// Upsert one record by external id.
    pub async fn upsert_one(
        &self,
        object: &str,
        record: &Record,
        external_id_field: &str,
    ) -> Result<UpsertResult> {
        self.governors
            .upsert
            .run("upsert", || {
                self.metrics.record_call(CallKind::Upsert);
                self.store.upsert_one(object, record, external_id_field)
            })
            .await
    }

    /// Insert one record. Inserts are never retried.
    pub async fn insert_one(&self, object: &str, record: &Record) -> Result<UpsertResult> {
        self.governors
            .upsert
            .run_once("insert", || {
                self.metrics.record_call(CallKind::Upsert);
                self.store.insert_one(object, record)
            })
            .await
    }

    /// Upsert many records by external id.
    pub async fn upsert_bulk(
        &self,
        object: &str,
        records: &[Record],
        external_id_field: &str,
    ) -> Result<Vec<UpsertResult>> {
        self.governors
            .upsert
            .run("upsert_bulk", || {
                self.metrics.record_call(CallKind::Upsert);
                self.store.upsert_bulk(object, records, external_id_field)
            })
            .await
    }

    async fn memoized<T, F, Fut>(&self, key: &str, fetch: F) -> Result<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let metrics = &self.metrics;
        let mut missed = false;
        let value = cache::get_or_compute(self.cache.as_ref(), key, || {
            missed = true;
            fetch()
        })
        .await?;
        metrics.record_cache(!missed);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::{ConcurrencyConfig, RetryConfig};
    use crate::query::Filter;
    use crate::schema::{FieldDescriptor, FieldType};
    use crate::store::MemoryStore;

    async fn open(store: Arc<MemoryStore>, memoize: bool) -> (Connection, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let metrics = Arc::new(Metrics::new());
        let governors = GovernorSet::new(
            &ConcurrencyConfig::default(),
            &RetryConfig::default(),
            metrics.clone(),
        );
        let conn = Connection::open("source", store, cache.clone(), governors, metrics, memoize)
            .await
            .unwrap();
        (conn, cache)
    }

    fn account_store() -> Arc<MemoryStore> {
        let store = MemoryStore::new("00DSRC");
        store.add_object(ObjectDescriptor::new(
            "Account",
            vec![
                FieldDescriptor::read_only("Id", FieldType::Id),
                FieldDescriptor::new("Name", FieldType::String),
            ],
        ));
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_namespace_is_org_id() {
        let (conn, _) = open(account_store(), false).await;
        assert_eq!(conn.namespace(), "00DSRC");
        assert!(conn.cache_key("describe", &["Account"]).starts_with("00DSRC/describe/"));
    }

    #[tokio::test]
    async fn test_describe_memoized() {
        let store = account_store();
        let (conn, cache) = open(store.clone(), false).await;
        conn.describe("Account").await.unwrap();
        conn.describe("Account").await.unwrap();
        assert_eq!(store.describe_calls(), 1);
        assert_eq!(cache.list("00DSRC/describe/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_query_never_cached() {
        let store = account_store();
        let (conn, cache) = open(store.clone(), true).await;
        let query = Query::select("Account").fields(["Id", "Name"]);

        assert!(conn.query(&query).await.unwrap().is_empty());
        assert!(cache.list("00DSRC/query/").await.unwrap().is_empty());

        store
            .insert("Account", Record::from_pairs([("Name", "Acme")]))
            .unwrap();
        assert_eq!(conn.query(&query).await.unwrap().records.len(), 1);
        assert_eq!(conn.query(&query).await.unwrap().records.len(), 1);
        assert_eq!(store.query_calls(), 2);
    }

    #[tokio::test]
    async fn test_live_query_bypasses_cache() {
        let store = account_store();
        store
            .insert("Account", Record::from_pairs([("Name", "Acme")]))
            .unwrap();
        let (conn, _) = open(store.clone(), true).await;
        let query = Query::select("Account").filter(Filter::NotBlank("Name".into()));
        conn.query(&query).await.unwrap();
        conn.query_live(&query).await.unwrap();
        assert_eq!(store.query_calls(), 2);
    }

    #[tokio::test]
    async fn test_insert_is_not_retried() {
        let store = account_store();
        let (conn, _) = open(store.clone(), false).await;
        store.fail_next_calls(1);
        let record = Record::from_pairs([("Name", "Acme")]);

        let err = conn.insert_one("Account", &record).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(conn.metrics().snapshot().retries, 0);
        assert_eq!(store.len("Account"), 0);

        let inserted = conn.insert_one("Account", &record).await.unwrap();
        assert!(inserted.is_complete());
        assert_eq!(store.len("Account"), 1);
    }
}
