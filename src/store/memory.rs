//! In-process record store.
//!
//! Implements the same describe / query / upsert contract as a real org,
//! including upsert-by-external-id, so the engine can be driven end to end
//! without a network. Failure injection hooks make it usable for testing
//! retry and failure isolation.

use super::{Identity, QueryResult, RemoteStore, UpsertResult};
use crate::error::{Error, Result};
use crate::query::Query;
use crate::record::{ID_FIELD, Record};
use crate::schema::{ObjectDescriptor, ObjectSummary};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
struct StoredObject {
    summary: ObjectSummary,
    descriptor: ObjectDescriptor,
    key_prefix: String,
    records: BTreeMap<String, Record>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    next_id: u64,
    rejected: HashMap<String, String>,
    transient_failures: u32,
    transient_write_failures: u32,
}

/// Remote call counters.
#[derive(Debug, Default)]
struct Calls {
    describe: AtomicUsize,
    query: AtomicUsize,
    upsert: AtomicUsize,
}

/// In-memory implementation of [`RemoteStore`].
#[derive(Debug)]
pub struct MemoryStore {
    identity: Identity,
    state: Mutex<State>,
    calls: Calls,
}

impl MemoryStore {
    /// Create an empty store for an org id.
    pub fn new(organization_id: impl Into<String>) -> Self {
        let organization_id = organization_id.into();
        Self {
            identity: Identity {
                username: format!("replicator@{}", organization_id.to_lowercase()),
                user_id: format!("005{}", organization_id),
                organization_id,
            },
            state: Mutex::new(State::default()),
            calls: Calls::default(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an object type with default (fully accessible) flags.
    pub fn add_object(&self, descriptor: ObjectDescriptor) {
        self.add_object_with_summary(ObjectSummary::standard(&descriptor.name), descriptor);
    }

    /// Register an object type with explicit global-describe flags.
    pub fn add_object_with_summary(&self, summary: ObjectSummary, descriptor: ObjectDescriptor) {
        let mut state = self.state();
        let key_prefix = format!("a{:02}", state.objects.len());
        state.objects.insert(
            descriptor.name.clone(),
            StoredObject {
                summary,
                descriptor,
                key_prefix,
                records: BTreeMap::new(),
            },
        );
    }

    /// Store a record as-is. Records without an `Id` get a generated one.
    pub fn insert(&self, object: &str, mut record: Record) -> Result<String> {
        let mut state = self.state();
        let id = match record.id() {
            Some(id) => id.to_string(),
            None => next_id(&mut state, object)?,
        };
        record.insert(ID_FIELD, id.clone());
        stored_mut(&mut state, object)?
            .records
            .insert(id.clone(), record);
        Ok(id)
    }

    /// Snapshot of every record of an object type, in id order.
    pub fn records(&self, object: &str) -> Vec<Record> {
        self.state()
            .objects
            .get(object)
            .map(|o| o.records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Find a record by a text field value.
    pub fn find_by(&self, object: &str, field: &str, value: &str) -> Option<Record> {
        self.state().objects.get(object).and_then(|o| {
            o.records
                .values()
                .find(|r| r.text(field) == Some(value))
                .cloned()
        })
    }

    /// Number of records of an object type.
    pub fn len(&self, object: &str) -> usize {
        self.state()
            .objects
            .get(object)
            .map(|o| o.records.len())
            .unwrap_or(0)
    }

    /// Reject every write to `object` with `message`.
    pub fn reject_writes(&self, object: &str, message: impl Into<String>) {
        self.state()
            .rejected
            .insert(object.to_string(), message.into());
    }

    /// Fail the next `n` remote calls with a transient error.
    pub fn fail_next_calls(&self, n: u32) {
        self.state().transient_failures = n;
    }

    /// Fail the next `n` write calls with a transient error; reads still succeed.
    pub fn fail_next_writes(&self, n: u32) {
        self.state().transient_write_failures = n;
    }

    /// Describe calls served so far.
    pub fn describe_calls(&self) -> usize {
        self.calls.describe.load(Ordering::SeqCst)
    }

    /// Query calls served so far.
    pub fn query_calls(&self) -> usize {
        self.calls.query.load(Ordering::SeqCst)
    }

    /// Write calls (single or bulk) served so far.
    pub fn upsert_calls(&self) -> usize {
        self.calls.upsert.load(Ordering::SeqCst)
    }

    fn take_failure(&self, operation: &str) -> Result<()> {
        let mut state = self.state();
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(Error::transient(operation, "simulated rate limit"));
        }
        Ok(())
    }

    fn take_write_failure(&self, operation: &str) -> Result<()> {
        self.take_failure(operation)?;
        let mut state = self.state();
        if state.transient_write_failures > 0 {
            state.transient_write_failures -= 1;
            return Err(Error::transient(operation, "simulated request timeout"));
        }
        Ok(())
    }

    fn write(&self, object: &str, record: &Record, external_id_field: Option<&str>) -> Result<UpsertResult> {
        let mut state = self.state();
        if let Some(message) = state.rejected.get(object) {
            return Ok(UpsertResult::failed(vec![message.clone()]));
        }

        let stored = stored_mut(&mut state, object)?;
        if let Some(bad) = record
            .keys()
            .find(|k| !k.contains('.') && !stored.descriptor.has_field(k))
        {
            return Ok(UpsertResult::failed(vec![format!(
                "INVALID_FIELD: No such column '{}' on entity '{}'",
                bad, object
            )]));
        }

        let existing = match external_id_field {
            Some(field) => {
                let Some(value) = record.text(field) else {
                    return Ok(UpsertResult::failed(vec![format!(
                        "MISSING_EXTERNAL_ID: {} is required for upsert",
                        field
                    )]));
                };
                stored
                    .records
                    .values()
                    .find(|r| r.text(field) == Some(value))
                    .and_then(|r| r.id().map(str::to_string))
            }
            None => None,
        };

        let writable = record.iter().filter(|(k, _)| !k.contains('.'));
        match existing {
            Some(id) => {
                if let Some(row) = stored.records.get_mut(&id) {
                    for (k, v) in writable {
                        row.insert(k.clone(), v.clone());
                    }
                }
                Ok(UpsertResult::ok(id, false))
            }
            None => {
                let id = next_id(&mut state, object)?;
                let mut row: Record = writable.map(|(k, v)| (k.clone(), v.clone())).collect();
                row.insert(ID_FIELD, id.clone());
                stored_mut(&mut state, object)?
                    .records
                    .insert(id.clone(), row);
                Ok(UpsertResult::ok(id, true))
            }
        }
    }
}

fn stored_mut<'a>(state: &'a mut State, object: &str) -> Result<&'a mut StoredObject> {
    state
        .objects
        .get_mut(object)
        .ok_or_else(|| Error::remote("describe", format!("NOT_FOUND: sObject type '{}' is not supported", object)))
}

fn next_id(state: &mut State, object: &str) -> Result<String> {
    state.next_id += 1;
    let n = state.next_id;
    let prefix = stored_mut(state, object)?.key_prefix.clone();
    Ok(format!("{}{:012}", prefix, n))
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn identity(&self) -> Result<Identity> {
        Ok(self.identity.clone())
    }

    async fn describe_global(&self) -> Result<Vec<ObjectSummary>> {
        self.take_failure("describe_global")?;
        self.calls.describe.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state()
            .objects
            .values()
            .map(|o| o.summary.clone())
            .collect())
    }

    async fn describe(&self, object: &str) -> Result<ObjectDescriptor> {
        self.take_failure("describe")?;
        self.calls.describe.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        Ok(stored_mut(&mut state, object)?.descriptor.clone())
    }

    async fn query(&self, query: &Query) -> Result<QueryResult> {
        self.take_failure("query")?;
        self.calls.query.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        let stored = stored_mut(&mut state, &query.object)?;

        let mut rows: Vec<&Record> = stored.records.values().filter(|r| query.matches(r)).collect();
        if let Some(ref field) = query.order_by {
            rows.sort_by(|a, b| a.text(field).cmp(&b.text(field)));
        }
        let total_size = rows.len();
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        let records = rows
            .into_iter()
            .map(|r| {
                let mut projected: Record = r
                    .iter()
                    .filter(|(k, _)| query.fields.iter().any(|f| f == *k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if let Some(id) = r.id() {
                    projected.insert(ID_FIELD, id);
                }
                projected
            })
            .collect();

        Ok(QueryResult {
            records,
            total_size,
        })
    }

    async fn count(&self, object: &str) -> Result<u64> {
        self.take_failure("count")?;
        self.calls.query.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        Ok(stored_mut(&mut state, object)?.records.len() as u64)
    }

    async fn upsert_one(
        &self,
        object: &str,
        record: &Record,
        external_id_field: &str,
    ) -> Result<UpsertResult> {
        self.take_write_failure("upsert")?;
        self.calls.upsert.fetch_add(1, Ordering::SeqCst);
        self.write(object, record, Some(external_id_field))
    }

    async fn insert_one(&self, object: &str, record: &Record) -> Result<UpsertResult> {
        self.take_write_failure("insert")?;
        self.calls.upsert.fetch_add(1, Ordering::SeqCst);
        self.write(object, record, None)
    }

    async fn upsert_bulk(
        &self,
        object: &str,
        records: &[Record],
        external_id_field: &str,
    ) -> Result<Vec<UpsertResult>> {
        self.take_write_failure("upsert_bulk")?;
        self.calls.upsert.fetch_add(1, Ordering::SeqCst);
        records
            .iter()
            .map(|r| self.write(object, r, Some(external_id_field)))
            .collect()
    }
}
