//! Idempotent, batched upsert of transformed records.
//!
//! Every record is keyed by its content hash. A record whose hash already has
//! a successful result in the durable cache is counted as written without a
//! remote call. Multi-record batches first compare against existing
//! destination rows and skip records with no meaningful difference; the rest
//! go out in bulk chunks.
//!
//! Every successful result is mapped and cached before the batch returns, so
//! a later record referencing this one can resolve it.

use crate::cache;
use crate::config::ReplicationBehaviorConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::mapping::ExternalIdMapper;
use crate::pagination::Paginator;
use crate::query::{Filter, Query};
use crate::record::{ID_FIELD, Record};
use crate::store::UpsertResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, error, instrument, warn};

/// Per-object write counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertStats {
    /// Records written by a remote call
    pub upserted: usize,
    /// Records skipped because their content hash was cached
    pub skipped_cached: usize,
    /// Records skipped because an identical row already exists
    pub skipped_unchanged: usize,
    /// Records the destination rejected
    pub failed: usize,
}

impl UpsertStats {
    /// Records accounted for.
    pub fn total(&self) -> usize {
        self.upserted + self.skipped_cached + self.skipped_unchanged + self.failed
    }
}

/// Accumulates records of one object type and writes them in batches.
pub struct UpsertBatcher<'a> {
    connection: &'a Connection,
    mapper: &'a ExternalIdMapper,
    behavior: &'a ReplicationBehaviorConfig,
    object: String,
    batch_size: usize,
    queue: Vec<Pending>,
    stats: UpsertStats,
}

struct Pending {
    record: Record,
    source_id: String,
    hash: String,
}

impl<'a> UpsertBatcher<'a> {
    /// Create a batcher writing `object` records to `connection`.
    pub fn new(
        connection: &'a Connection,
        mapper: &'a ExternalIdMapper,
        behavior: &'a ReplicationBehaviorConfig,
        object: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            mapper,
            behavior,
            object: object.into(),
            batch_size: behavior.batch_size.max(1),
            queue: Vec::new(),
            stats: UpsertStats::default(),
        }
    }

    /// Override the configured batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Counters so far.
    pub fn stats(&self) -> UpsertStats {
        self.stats
    }

    /// Records waiting for the next round trip.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn upsert_key(&self, hash: &str) -> String {
        self.connection.cache_key("upsert", &[&self.object, hash])
    }

    fn existing_key(&self, hash: &str) -> String {
        self.connection.cache_key("existing", &[&self.object, hash])
    }

    /// Add a record; writes a batch when the queue reaches the batch size.
    ///
    /// Returns a [`Error::Data`] when that batch had rejected records.
    pub async fn add_record(&mut self, record: Record) -> Result<()> {
        let ext = self.mapper.external_id_field();
        let Some(source_id) = record.text(ext).map(str::to_string) else {
            self.stats.failed += 1;
            return Err(Error::data(
                &self.object,
                vec![format!("record has no {} value", ext)],
            ));
        };
        let hash = record.content_hash();

        let key = self.upsert_key(&hash);
        let cached = cache::get_as::<UpsertResult>(self.connection.cache().as_ref(), &key)
            .await
            .unwrap_or_else(|e| {
                warn!(key, error = %e, "cache read failed");
                None
            });
        self.connection.metrics().record_cache(cached.is_some());
        if let Some(result) = cached.filter(UpsertResult::is_complete) {
            if let Some(id) = result.id.as_deref() {
                self.mapper.record(&self.object, &source_id, id);
            }
            self.stats.skipped_cached += 1;
            return Ok(());
        }

        // plain inserts have no external-id match on the server side
        if self.behavior.is_insert_only(&self.object) {
            let exists = self.mapper.get(&self.object, &source_id).is_some()
                || self
                    .mapper
                    .is_ambiguous(std::slice::from_ref(&self.object), &source_id);
            if exists {
                debug!(object = %self.object, source_id = %source_id, "already inserted; skipped");
                self.stats.skipped_unchanged += 1;
                return Ok(());
            }
        }

        self.queue.push(Pending {
            record,
            source_id,
            hash,
        });
        if self.queue.len() >= self.batch_size {
            self.process().await?;
        }
        Ok(())
    }

    /// Write whatever is queued.
    pub async fn flush(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        self.process().await
    }

    #[instrument(skip(self), fields(object = %self.object, batch = self.queue.len()))]
    async fn process(&mut self) -> Result<()> {
        let batch = std::mem::take(&mut self.queue);
        let results = if self.behavior.is_insert_only(&self.object) {
            self.write_each(batch, true).await?
        } else if batch.len() == 1 {
            self.write_each(batch, false).await?
        } else {
            let remaining = self.skip_unchanged(batch).await?;
            self.write_bulk(remaining).await
        };
        self.validate(results).await
    }

    async fn write_each(&self, batch: Vec<Pending>, insert: bool) -> Result<Vec<(Pending, UpsertResult)>> {
        let ext = self.mapper.external_id_field();
        let mut results = Vec::with_capacity(batch.len());
        for pending in batch {
            let payload = pending.record.flatten();
            let result = if insert {
                self.connection.insert_one(&self.object, &payload).await?
            } else {
                self.connection.upsert_one(&self.object, &payload, ext).await?
            };
            results.push((pending, result));
        }
        Ok(results)
    }

    /// Drop records identical to an existing destination row.
    async fn skip_unchanged(&mut self, batch: Vec<Pending>) -> Result<Vec<Pending>> {
        let durable = self.connection.cache().clone();
        let mut unresolved = Vec::with_capacity(batch.len());
        for pending in batch {
            let key = self.existing_key(&pending.hash);
            match cache::get_as::<String>(durable.as_ref(), &key).await {
                Ok(Some(id)) => {
                    self.mapper.record(&self.object, &pending.source_id, &id);
                    self.stats.skipped_unchanged += 1;
                }
                Ok(None) => unresolved.push(pending),
                Err(e) => {
                    warn!(key, error = %e, "cache read failed");
                    unresolved.push(pending);
                }
            }
        }
        if unresolved.is_empty() {
            return Ok(unresolved);
        }

        let existing = self.load_existing(&unresolved).await?;
        let ext = self.mapper.external_id_field();
        let mut remaining = Vec::with_capacity(unresolved.len());
        for pending in unresolved {
            let Some(row) = existing.get(&pending.source_id) else {
                remaining.push(pending);
                continue;
            };
            let changed = pending.record.iter().any(|(field, value)| {
                field != ext
                    && !field.contains('.')
                    && !self.behavior.is_derived(field)
                    && row.get(field).map(|v| !v.same_as(value)).unwrap_or(true)
            });
            match (changed, row.id()) {
                (false, Some(id)) => {
                    debug!(object = %self.object, source_id = %pending.source_id, "unchanged; skipped");
                    self.mapper.record(&self.object, &pending.source_id, id);
                    let key = self.existing_key(&pending.hash);
                    if let Err(e) = cache::put_as(durable.as_ref(), &key, id).await {
                        warn!(key, error = %e, "cache write failed");
                    }
                    self.stats.skipped_unchanged += 1;
                }
                _ => remaining.push(pending),
            }
        }
        Ok(remaining)
    }

    async fn load_existing(&self, batch: &[Pending]) -> Result<HashMap<String, Record>> {
        let ext = self.mapper.external_id_field();
        let fields: BTreeSet<&str> = batch
            .iter()
            .flat_map(|p| p.record.keys())
            .map(String::as_str)
            .filter(|f| !f.contains('.') && !self.behavior.is_derived(f))
            .chain([ID_FIELD, ext])
            .collect();

        let mut existing = HashMap::new();
        for chunk in batch.chunks(self.behavior.lookup_chunk_size.max(1)) {
            let ids = chunk.iter().map(|p| p.source_id.clone()).collect();
            let query = Query::select(self.object.as_str())
                .fields(fields.iter().copied())
                .filter(Filter::In(ext.to_string(), ids))
                .filter(Filter::NotDeleted);
            let rows = Paginator::new(self.connection, query, self.behavior.page_size)
                .live()
                .collect_all()
                .await?;
            for row in rows {
                if let Some(source_id) = row.text(ext).map(str::to_string) {
                    existing.insert(source_id, row);
                }
            }
        }
        Ok(existing)
    }

    async fn write_bulk(&self, batch: Vec<Pending>) -> Vec<(Pending, UpsertResult)> {
        let ext = self.mapper.external_id_field();
        let mut results = Vec::with_capacity(batch.len());
        let mut batch = batch.into_iter().peekable();
        let chunk_size = self.behavior.bulk_chunk_size.max(1);

        while batch.peek().is_some() {
            let chunk: Vec<Pending> = batch.by_ref().take(chunk_size).collect();
            let payload: Vec<Record> = chunk.iter().map(|p| p.record.flatten()).collect();
            match self.connection.upsert_bulk(&self.object, &payload, ext).await {
                Ok(outcomes) if outcomes.len() == chunk.len() => {
                    results.extend(chunk.into_iter().zip(outcomes));
                }
                Ok(outcomes) => {
                    let message = format!(
                        "bulk upsert returned {} results for {} records",
                        outcomes.len(),
                        chunk.len()
                    );
                    results.extend(
                        chunk
                            .into_iter()
                            .map(|p| (p, UpsertResult::failed(vec![message.clone()]))),
                    );
                }
                Err(e) => {
                    let message = e.to_string();
                    results.extend(
                        chunk
                            .into_iter()
                            .map(|p| (p, UpsertResult::failed(vec![message.clone()]))),
                    );
                }
            }
        }
        results
    }

    /// Cache and map successes; fail the batch if anything was rejected.
    async fn validate(&mut self, results: Vec<(Pending, UpsertResult)>) -> Result<()> {
        let durable = self.connection.cache().clone();
        let mut errors = Vec::new();

        for (pending, result) in results {
            let key = self.upsert_key(&pending.hash);
            match result.id.as_deref().filter(|_| result.is_complete()) {
                Some(id) => {
                    self.mapper.record(&self.object, &pending.source_id, id);
                    if let Err(e) = cache::put_as(durable.as_ref(), &key, &result).await {
                        warn!(key, error = %e, "cache write failed");
                    }
                    self.stats.upserted += 1;
                }
                None => {
                    let message = if result.errors.is_empty() {
                        "no id returned".to_string()
                    } else {
                        result.errors.join(", ")
                    };
                    error!(
                        object = %self.object,
                        source_id = %pending.source_id,
                        error = %message,
                        "record rejected"
                    );
                    if let Err(e) = durable.delete(&key).await {
                        warn!(key, error = %e, "cache invalidation failed");
                    }
                    self.stats.failed += 1;
                    errors.push(format!("{}: {}", pending.source_id, message));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::data(&self.object, errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::{ConcurrencyConfig, RetryConfig};
    use crate::governor::GovernorSet;
    use crate::metrics::Metrics;
    use crate::record::FieldValue;
    use crate::schema::{FieldDescriptor, FieldType, ObjectDescriptor, SchemaCache};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    const EXT: &str = "Replication_External_ID__c";

    struct Fixture {
        store: Arc<MemoryStore>,
        conn: Arc<Connection>,
        mapper: ExternalIdMapper,
    }

    async fn fixture() -> Fixture {
        fixture_with(RetryConfig::default()).await
    }

    async fn fixture_with(retry: RetryConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new("00DDST"));
        store.add_object(ObjectDescriptor::new(
            "Contact",
            vec![
                FieldDescriptor::read_only("Id", FieldType::Id),
                FieldDescriptor::new("LastName", FieldType::String),
                FieldDescriptor::new("npo02__TotalOppAmount__c", FieldType::Currency),
                FieldDescriptor::new(EXT, FieldType::String).external_id(),
            ],
        ));
        let metrics = Arc::new(Metrics::new());
        let governors = GovernorSet::new(&ConcurrencyConfig::default(), &retry, metrics.clone());
        let conn = Arc::new(
            Connection::open(
                "destination",
                store.clone(),
                Arc::new(MemoryCache::new()),
                governors,
                metrics,
                false,
            )
            .await
            .unwrap(),
        );
        let mapper = ExternalIdMapper::new(Arc::new(SchemaCache::new(conn.clone())), EXT, 100);
        Fixture { store, conn, mapper }
    }

    fn contact(source_id: &str, last_name: &str) -> Record {
        Record::from_pairs([(EXT, source_id), ("LastName", last_name)])
    }

    #[tokio::test]
    async fn test_single_record_written_and_mapped() {
        let f = fixture().await;
        let behavior = ReplicationBehaviorConfig::default();
        let mut batcher = UpsertBatcher::new(&f.conn, &f.mapper, &behavior, "Contact");

        batcher.add_record(contact("003S1", "Lovelace")).await.unwrap();
        assert_eq!(batcher.pending(), 0);
        assert_eq!(batcher.stats().upserted, 1);
        let dest = f.mapper.get("Contact", "003S1").unwrap();
        assert_eq!(f.store.find_by("Contact", EXT, "003S1").unwrap().id(), Some(dest.as_str()));
    }

    #[tokio::test]
    async fn test_cached_hash_skips_remote_call() {
        let f = fixture().await;
        let behavior = ReplicationBehaviorConfig::default();
        let mut first = UpsertBatcher::new(&f.conn, &f.mapper, &behavior, "Contact");
        first.add_record(contact("003S1", "Lovelace")).await.unwrap();
        let calls = f.store.upsert_calls();

        let mut second = UpsertBatcher::new(&f.conn, &f.mapper, &behavior, "Contact");
        second.add_record(contact("003S1", "Lovelace")).await.unwrap();
        second.flush().await.unwrap();
        assert_eq!(f.store.upsert_calls(), calls);
        assert_eq!(second.stats().skipped_cached, 1);
    }

    #[tokio::test]
    async fn test_bulk_batch_skips_unchanged_rows() {
        let f = fixture().await;
        f.store
            .insert(
                "Contact",
                Record::from_pairs([
                    ("Id", "003D1"),
                    (EXT, "003S1"),
                    ("LastName", "Lovelace"),
                    ("npo02__TotalOppAmount__c", "10"),
                ]),
            )
            .unwrap();
        let behavior = ReplicationBehaviorConfig::default();
        let mut batcher =
            UpsertBatcher::new(&f.conn, &f.mapper, &behavior, "Contact").with_batch_size(10);

        let mut unchanged = contact("003S1", "Lovelace");
        unchanged.insert("npo02__TotalOppAmount__c", "250");
        batcher.add_record(unchanged).await.unwrap();
        batcher.add_record(contact("003S2", "Hopper")).await.unwrap();
        assert_eq!(batcher.pending(), 2);
        batcher.flush().await.unwrap();

        let stats = batcher.stats();
        assert_eq!(stats.skipped_unchanged, 1);
        assert_eq!(stats.upserted, 1);
        assert_eq!(f.mapper.get("Contact", "003S1").as_deref(), Some("003D1"));
        assert_eq!(f.store.len("Contact"), 2);
    }

    #[tokio::test]
    async fn test_rejection_fails_batch_and_invalidates_cache() {
        let f = fixture().await;
        f.store.reject_writes("Contact", "FIELD_CUSTOM_VALIDATION_EXCEPTION: nope");
        let behavior = ReplicationBehaviorConfig::default();
        let mut batcher = UpsertBatcher::new(&f.conn, &f.mapper, &behavior, "Contact");

        let err = batcher
            .add_record(contact("003S1", "Lovelace"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DATA_ERROR");
        assert_eq!(batcher.stats().failed, 1);
        assert!(f.mapper.get("Contact", "003S1").is_none());
        assert!(f.conn.cache().list("00DDST/upsert/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_partial_rejection() {
        let f = fixture().await;
        let behavior = ReplicationBehaviorConfig::default();
        let mut batcher =
            UpsertBatcher::new(&f.conn, &f.mapper, &behavior, "Contact").with_batch_size(2);
        let mut bogus = contact("003S2", "Hopper");
        bogus.insert("Nope__c", "x");

        batcher.add_record(contact("003S1", "Lovelace")).await.unwrap();
        let err = batcher.add_record(bogus).await.unwrap_err();
        match err {
            Error::Data { errors, .. } => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].starts_with("003S2: INVALID_FIELD"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(batcher.stats().upserted, 1);
        assert!(f.mapper.get("Contact", "003S1").is_some());
    }

    #[tokio::test]
    async fn test_failed_bulk_call_fails_every_record_in_chunk() {
        let f = fixture_with(RetryConfig {
            max_retries: 0,
            ..Default::default()
        })
        .await;
        f.store.fail_next_writes(1);
        let behavior = ReplicationBehaviorConfig::default();
        let mut batcher =
            UpsertBatcher::new(&f.conn, &f.mapper, &behavior, "Contact").with_batch_size(2);

        batcher.add_record(contact("003S1", "Lovelace")).await.unwrap();
        let err = batcher.add_record(contact("003S2", "Hopper")).await.unwrap_err();
        let Error::Data { errors, .. } = err else {
            panic!("expected a data error");
        };
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("003S1: "));
        assert!(errors[1].starts_with("003S2: "));
        let reason = |e: &str| e.split_once(": ").map(|(_, r)| r.to_string()).unwrap();
        assert!(!reason(&errors[0]).is_empty());
        assert_eq!(reason(&errors[0]), reason(&errors[1]));

        assert_eq!(batcher.stats().failed, 2);
        assert_eq!(batcher.stats().upserted, 0);
        assert!(f.mapper.get("Contact", "003S1").is_none());
        assert_eq!(f.store.len("Contact"), 0);
    }

    #[tokio::test]
    async fn test_insert_only_skips_mapped_records() {
        let f = fixture().await;
        let behavior = ReplicationBehaviorConfig {
            insert_only_objects: vec!["Contact".into()],
            ..Default::default()
        };
        f.mapper.record("Contact", "003S1", "003D9");
        let mut batcher = UpsertBatcher::new(&f.conn, &f.mapper, &behavior, "Contact");

        batcher.add_record(contact("003S1", "Lovelace")).await.unwrap();
        batcher.add_record(contact("003S2", "Hopper")).await.unwrap();
        batcher.flush().await.unwrap();

        assert_eq!(batcher.stats().skipped_unchanged, 1);
        assert_eq!(batcher.stats().upserted, 1);
        assert_eq!(f.store.upsert_calls(), 1);
        assert_eq!(f.store.len("Contact"), 1);
    }

    #[tokio::test]
    async fn test_single_write_flattens_nested_values() {
        let f = fixture().await;
        let behavior = ReplicationBehaviorConfig::default();
        let mut batcher = UpsertBatcher::new(&f.conn, &f.mapper, &behavior, "Contact");
        let mut record = contact("003S1", "Lovelace");
        record.insert("Account", FieldValue::Record(Record::from_pairs([("Name", "Acme")])));

        batcher.add_record(record).await.unwrap();
        assert_eq!(batcher.stats().upserted, 1);
        let row = f.store.find_by("Contact", EXT, "003S1").unwrap();
        assert!(!row.contains("Account"));
        assert_eq!(row.text("LastName"), Some("Lovelace"));
    }
}
