//! External-id mapper: source identity to destination identity, per type.
//!
//! Mappings are append-only for the life of a run. The first
//! [`ExternalIdMapper::load_mapping`] call for a type scans every destination
//! row carrying the external-id field; later calls for that type are no-ops,
//! and concurrent callers share the one scan.
//!
//! A source id carried by more than one destination row is ambiguous: it is
//! never mapped, and references to it are left unresolved.

use crate::connection::Connection;
use crate::error::Result;
use crate::pagination::Paginator;
use crate::query::{Filter, Query};
use crate::record::ID_FIELD;
use crate::schema::SchemaCache;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Per-run table of `sourceId -> destId`, keyed by object type.
pub struct ExternalIdMapper {
    destination: Arc<SchemaCache>,
    external_id_field: String,
    page_size: usize,
    maps: RwLock<HashMap<String, HashMap<String, String>>>,
    ambiguous: RwLock<HashMap<String, HashSet<String>>>,
    loads: Mutex<HashMap<String, Arc<OnceCell<bool>>>>,
}

impl ExternalIdMapper {
    /// Create an empty mapper over the destination schema.
    pub fn new(
        destination: Arc<SchemaCache>,
        external_id_field: impl Into<String>,
        page_size: usize,
    ) -> Self {
        Self {
            destination,
            external_id_field: external_id_field.into(),
            page_size,
            maps: RwLock::new(HashMap::new()),
            ambiguous: RwLock::new(HashMap::new()),
            loads: Mutex::new(HashMap::new()),
        }
    }

    /// Name of the external-id field.
    pub fn external_id_field(&self) -> &str {
        &self.external_id_field
    }

    /// Load every existing mapping for `object` from the destination.
    ///
    /// Returns `false` without querying when the destination type has no
    /// external-id field; such types can never be mapped.
    pub async fn load_mapping(&self, object: &str) -> Result<bool> {
        let cell = {
            let mut loads = self.loads.lock().unwrap_or_else(|p| p.into_inner());
            loads.entry(object.to_string()).or_default().clone()
        };
        cell.get_or_try_init(|| self.scan(object)).await.copied()
    }

    async fn scan(&self, object: &str) -> Result<bool> {
        let descriptor = self.destination.describe(object).await?;
        if !descriptor.has_field(&self.external_id_field) {
            debug!(object, field = %self.external_id_field, "no external id field; mapping skipped");
            return Ok(false);
        }

        let connection: &Connection = self.destination.connection();
        let query = Query::select(object)
            .fields([ID_FIELD, self.external_id_field.as_str()])
            .filter(Filter::NotBlank(self.external_id_field.clone()))
            .filter(Filter::NotDeleted);
        let mut pager = Paginator::new(connection, query, self.page_size).live();

        let mut loaded: HashMap<String, String> = HashMap::new();
        let mut duplicates = HashSet::new();
        while let Some(row) = pager.next().await? {
            if let (Some(src), Some(dst)) = (row.text(&self.external_id_field), row.id()) {
                match loaded.get(src) {
                    Some(seen) if seen != dst => {
                        duplicates.insert(src.to_string());
                    }
                    Some(_) => {}
                    None => {
                        loaded.insert(src.to_string(), dst.to_string());
                    }
                }
            }
        }

        if !duplicates.is_empty() {
            warn!(
                object,
                field = %self.external_id_field,
                duplicates = duplicates.len(),
                "external id carried by more than one destination row; left unmapped"
            );
            for src in &duplicates {
                loaded.remove(src);
                debug!(object, source_id = %src, "ambiguous external id");
            }
            let mut ambiguous = self.ambiguous.write().unwrap_or_else(|p| p.into_inner());
            ambiguous.entry(object.to_string()).or_default().extend(duplicates);
        }

        let count = loaded.len();
        {
            let mut maps = self.maps.write().unwrap_or_else(|p| p.into_inner());
            let map = maps.entry(object.to_string()).or_default();
            for (src, dst) in loaded {
                map.entry(src).or_insert(dst);
            }
        }
        info!(object, mappings = count, "external id mapping loaded");
        Ok(true)
    }

    /// Whether `load_mapping` has completed for `object`.
    pub fn is_loaded(&self, object: &str) -> bool {
        self.loads
            .lock()
            .map(|l| l.get(object).map(|c| c.initialized()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Whether `source_id` matched more than one destination row of any of
    /// `objects` during a mapping load.
    pub fn is_ambiguous(&self, objects: &[String], source_id: &str) -> bool {
        let ambiguous = self.ambiguous.read().unwrap_or_else(|p| p.into_inner());
        objects
            .iter()
            .any(|o| ambiguous.get(o).is_some_and(|ids| ids.contains(source_id)))
    }

    fn is_ambiguous_in(&self, object: &str, source_id: &str) -> bool {
        let ambiguous = self.ambiguous.read().unwrap_or_else(|p| p.into_inner());
        ambiguous.get(object).is_some_and(|ids| ids.contains(source_id))
    }

    /// Destination id for a source id of `object`.
    pub fn get(&self, object: &str, source_id: &str) -> Option<String> {
        let maps = self.maps.read().unwrap_or_else(|p| p.into_inner());
        maps.get(object).and_then(|m| m.get(source_id)).cloned()
    }

    /// Destination id for a source id under any of `objects`.
    ///
    /// `None` when the id is ambiguous under any of them, or is mapped under
    /// more than one of them.
    pub fn find(&self, objects: &[String], source_id: &str) -> Option<String> {
        if self.is_ambiguous(objects, source_id) {
            return None;
        }
        let maps = self.maps.read().unwrap_or_else(|p| p.into_inner());
        let mut found = objects
            .iter()
            .filter_map(|o| maps.get(o).and_then(|m| m.get(source_id)));
        match (found.next(), found.next()) {
            (Some(id), None) => Some(id.clone()),
            _ => None,
        }
    }

    /// Record a mapping. An existing mapping for the same source id wins;
    /// ambiguous source ids are not recorded.
    pub fn record(&self, object: &str, source_id: &str, dest_id: &str) -> String {
        if self.is_ambiguous_in(object, source_id) {
            return dest_id.to_string();
        }
        let mut maps = self.maps.write().unwrap_or_else(|p| p.into_inner());
        maps.entry(object.to_string())
            .or_default()
            .entry(source_id.to_string())
            .or_insert_with(|| dest_id.to_string())
            .clone()
    }

    /// Mappings known for `object`.
    pub fn len(&self, object: &str) -> usize {
        let maps = self.maps.read().unwrap_or_else(|p| p.into_inner());
        maps.get(object).map(HashMap::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoopCache;
    use crate::config::{ConcurrencyConfig, RetryConfig};
    use crate::governor::GovernorSet;
    use crate::metrics::Metrics;
    use crate::record::Record;
    use crate::schema::{FieldDescriptor, FieldType, ObjectDescriptor};
    use crate::store::MemoryStore;

    const EXT: &str = "Replication_External_ID__c";

    async fn mapper(store: Arc<MemoryStore>) -> ExternalIdMapper {
        let metrics = Arc::new(Metrics::new());
        let governors = GovernorSet::new(
            &ConcurrencyConfig::default(),
            &RetryConfig::default(),
            metrics.clone(),
        );
        let conn = Connection::open("destination", store, Arc::new(NoopCache), governors, metrics, false)
            .await
            .unwrap();
        ExternalIdMapper::new(Arc::new(SchemaCache::new(Arc::new(conn))), EXT, 2)
    }

    fn destination() -> Arc<MemoryStore> {
        let store = MemoryStore::new("00DDST");
        store.add_object(ObjectDescriptor::new(
            "Account",
            vec![
                FieldDescriptor::read_only("Id", FieldType::Id),
                FieldDescriptor::new("Name", FieldType::String),
                FieldDescriptor::new(EXT, FieldType::String).external_id(),
            ],
        ));
        store.add_object(ObjectDescriptor::new(
            "Task",
            vec![FieldDescriptor::read_only("Id", FieldType::Id)],
        ));
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_load_mapping_scans_once() {
        let store = destination();
        for (id, ext) in [("D1", "S1"), ("D2", "S2"), ("D3", "S3")] {
            store
                .insert("Account", Record::from_pairs([("Id", id), (EXT, ext)]))
                .unwrap();
        }
        store
            .insert("Account", Record::from_pairs([("Id", "D4"), ("Name", "unmapped")]))
            .unwrap();

        let mapper = mapper(store.clone()).await;
        assert!(mapper.load_mapping("Account").await.unwrap());
        let calls = store.query_calls();
        assert!(mapper.load_mapping("Account").await.unwrap());
        assert_eq!(store.query_calls(), calls);

        assert!(mapper.is_loaded("Account"));
        assert_eq!(mapper.len("Account"), 3);
        assert_eq!(mapper.get("Account", "S2").as_deref(), Some("D2"));
        assert!(mapper.get("Account", "S4").is_none());
    }

    #[tokio::test]
    async fn test_type_without_external_id_never_queried() {
        let store = destination();
        let mapper = mapper(store.clone()).await;
        assert!(!mapper.load_mapping("Task").await.unwrap());
        assert_eq!(store.query_calls(), 0);
    }

    #[tokio::test]
    async fn test_record_is_append_only() {
        let mapper = mapper(destination()).await;
        assert_eq!(mapper.record("Account", "S1", "D1"), "D1");
        assert_eq!(mapper.record("Account", "S1", "D9"), "D1");
        assert_eq!(
            mapper.find(&["Contact".into(), "Account".into()], "S1").as_deref(),
            Some("D1")
        );
    }

    #[tokio::test]
    async fn test_duplicate_external_ids_left_unmapped() {
        let store = destination();
        for (id, ext) in [("D1", "S1"), ("D2", "S1"), ("D3", "S2")] {
            store
                .insert("Account", Record::from_pairs([("Id", id), (EXT, ext)]))
                .unwrap();
        }

        let mapper = mapper(store).await;
        assert!(mapper.load_mapping("Account").await.unwrap());
        let account = ["Account".to_string()];
        assert!(mapper.is_ambiguous(&account, "S1"));
        assert!(mapper.get("Account", "S1").is_none());
        assert!(mapper.find(&account, "S1").is_none());
        assert_eq!(mapper.get("Account", "S2").as_deref(), Some("D3"));

        mapper.record("Account", "S1", "D9");
        assert!(mapper.get("Account", "S1").is_none());
    }

    #[tokio::test]
    async fn test_id_mapped_under_two_types_is_not_found() {
        let mapper = mapper(destination()).await;
        mapper.record("Account", "S1", "D1");
        mapper.record("Contact", "S1", "D2");
        assert!(mapper.find(&["Account".into(), "Contact".into()], "S1").is_none());
        assert_eq!(mapper.find(&["Account".into()], "S1").as_deref(), Some("D1"));
    }
}
