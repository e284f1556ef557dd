//! Source record to destination record transformation.
//!
//! A destination record carries the source identity in the external-id
//! field plus every createable destination field the source supplies.
//! Reference fields are rewritten to destination identities through, in
//! order: the external-id mapper, a one-time mapping load of each candidate
//! target type, a lookup query by external id, and (when enabled) on-demand
//! replication of the referenced record. A reference that none of these
//! resolve is omitted rather than failing the record.

use crate::config::{FieldPolicy, ReplicationConfig};
use crate::error::Result;
use crate::mapping::ExternalIdMapper;
use crate::query::{Filter, Query};
use crate::record::{ID_FIELD, Record};
use crate::schema::{FieldDescriptor, ObjectDescriptor, SchemaCache};
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Source identities currently being transformed in this run.
///
/// Entering an identity that is already present fails, which is how
/// reference cycles are cut: a reference to an in-flight record is omitted
/// instead of recursing into it again.
#[derive(Debug, Default)]
pub struct InFlightSet {
    ids: Mutex<HashSet<String>>,
}

impl InFlightSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    fn ids(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Whether `id` is being resolved.
    pub fn contains(&self, id: &str) -> bool {
        self.ids().contains(id)
    }

    /// Mark `id` in flight until the guard drops. `None` if already present.
    pub fn enter(&self, id: &str) -> Option<InFlightGuard<'_>> {
        if self.ids().insert(id.to_string()) {
            Some(InFlightGuard {
                set: self,
                id: id.to_string(),
            })
        } else {
            None
        }
    }

    /// Identities in flight.
    pub fn len(&self) -> usize {
        self.ids().len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its identity from the [`InFlightSet`] on drop.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    set: &'a InFlightSet,
    id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.ids().remove(&self.id);
    }
}

/// Replicates a referenced source record on demand.
pub trait ReferenceResolver: Send + Sync {
    /// Replicate `source_id`, trying each of `objects`, and return the new
    /// destination identity.
    fn resolve<'a>(
        &'a self,
        objects: &'a [String],
        source_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>>>;
}

/// A transformed record ready for upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    /// Destination-shaped record
    pub record: Record,
    /// Reference fields left out because they could not be resolved
    pub omitted: Vec<String>,
}

/// Result of transforming one record.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    /// Write this record
    Ready(Transformed),
    /// Do not write this record
    Dropped(String),
}

/// Converts source records into destination records.
pub struct RecordTransformer {
    config: Arc<ReplicationConfig>,
    destination: Arc<SchemaCache>,
    mapper: Arc<ExternalIdMapper>,
    in_flight: Arc<InFlightSet>,
}

impl RecordTransformer {
    /// Create a transformer for one run.
    pub fn new(
        config: Arc<ReplicationConfig>,
        destination: Arc<SchemaCache>,
        mapper: Arc<ExternalIdMapper>,
        in_flight: Arc<InFlightSet>,
    ) -> Self {
        Self {
            config,
            destination,
            mapper,
            in_flight,
        }
    }

    /// The run's in-flight set.
    pub fn in_flight(&self) -> &InFlightSet {
        &self.in_flight
    }

    /// Source fields worth selecting to build `object` records.
    pub fn source_fields(
        &self,
        object: &str,
        source: &ObjectDescriptor,
        destination: &ObjectDescriptor,
    ) -> Vec<String> {
        let ext = &self.config.replication.external_id_field;
        let mut fields = vec![ID_FIELD.to_string()];
        for field in &source.fields {
            if field.name == ID_FIELD || &field.name == ext {
                continue;
            }
            let writable = destination
                .field(&field.name)
                .map(|f| f.createable)
                .unwrap_or(false);
            if writable && self.config.field_policy(object, &field.name) != FieldPolicy::Skip {
                fields.push(field.name.clone());
            }
        }
        fields
    }

    /// Transform one source record of `object`.
    pub async fn transform(
        &self,
        object: &str,
        source: &Record,
        destination: &ObjectDescriptor,
        resolver: Option<&dyn ReferenceResolver>,
    ) -> Result<TransformOutcome> {
        let mut values = source.clone();
        values.prune_blank();

        let Some(source_id) = values.id().map(str::to_string) else {
            return Ok(TransformOutcome::Dropped("record has no identity".into()));
        };
        let Some(_guard) = self.in_flight.enter(&source_id) else {
            return Ok(TransformOutcome::Dropped(format!(
                "{} is already being resolved",
                source_id
            )));
        };

        let ext = self.config.replication.external_id_field.as_str();
        let mut record = Record::new();
        if destination.has_field(ext) {
            record.insert(ext, source_id.as_str());
        }

        let mut omitted = Vec::new();
        for field in destination.fields.iter().filter(|f| f.createable) {
            if field.name == ID_FIELD || field.name == ext {
                continue;
            }
            let policy = self.config.field_policy(object, &field.name);
            if policy == FieldPolicy::Skip {
                continue;
            }
            let Some(value) = values.get(&field.name) else {
                continue;
            };

            if field.is_reference() {
                let Some(reference) = value.as_str() else {
                    continue;
                };
                match self
                    .resolve_reference(field, reference, policy, resolver)
                    .await
                {
                    Some(dest_id) => record.insert(field.name.clone(), dest_id),
                    None => {
                        trace!(object, field = %field.name, reference, "reference omitted");
                        omitted.push(field.name.clone());
                    }
                }
            } else {
                record.insert(field.name.clone(), value.clone());
            }
        }

        for required in self.config.replication.required_references(object) {
            if !record.contains(required) {
                return Ok(TransformOutcome::Dropped(format!(
                    "required reference {} is unresolved",
                    required
                )));
            }
        }

        Ok(TransformOutcome::Ready(Transformed { record, omitted }))
    }

    async fn resolve_reference(
        &self,
        field: &FieldDescriptor,
        reference: &str,
        policy: FieldPolicy,
        resolver: Option<&dyn ReferenceResolver>,
    ) -> Option<String> {
        let targets = &field.reference_to;
        if let Some(id) = self.mapper.find(targets, reference) {
            return Some(id);
        }
        if self.mapper.is_ambiguous(targets, reference) {
            debug!(field = %field.name, reference, "ambiguous reference");
            return None;
        }
        if self.in_flight.contains(reference) {
            debug!(field = %field.name, reference, "reference to in-flight record omitted");
            return None;
        }
        if policy == FieldPolicy::DeferredLookup {
            return None;
        }
        if targets.len() > self.config.replication.max_reference_targets {
            debug!(field = %field.name, targets = targets.len(), "too many reference targets");
            return None;
        }

        let ext = self.mapper.external_id_field();
        let mut candidates = Vec::new();
        for target in targets {
            match self.destination.describe(target).await {
                Ok(d) if d.has_field(ext) => candidates.push(target.clone()),
                Ok(_) => trace!(target = %target, "target has no external id field"),
                Err(e) => debug!(target = %target, error = %e, "target not describable"),
            }
        }
        if candidates.is_empty() {
            return None;
        }

        for target in &candidates {
            if let Err(e) = self.mapper.load_mapping(target).await {
                warn!(target = %target, error = %e, "mapping load failed");
            }
        }
        if let Some(id) = self.mapper.find(&candidates, reference) {
            return Some(id);
        }
        if self.mapper.is_ambiguous(&candidates, reference) {
            debug!(field = %field.name, reference, "ambiguous reference");
            return None;
        }

        let mut matches = Vec::new();
        for target in &candidates {
            let lookup = Query::select(target.as_str())
                .fields([ID_FIELD])
                .filter(Filter::Eq(ext.to_string(), reference.into()))
                .filter(Filter::NotDeleted)
                .limit(2);
            match self.destination.connection().query(&lookup).await {
                Ok(result) => {
                    for row in result.records {
                        if let Some(id) = row.id() {
                            matches.push((target.clone(), id.to_string()));
                        }
                    }
                }
                Err(e) => warn!(target = %target, error = %e, "reference lookup failed"),
            }
        }
        if let [(target, id)] = matches.as_slice() {
            return Some(self.mapper.record(target, reference, id));
        }
        if matches.len() > 1 {
            debug!(field = %field.name, reference, matches = matches.len(), "ambiguous reference");
            return None;
        }

        if self.config.replication.recursive_lookups {
            if let Some(resolver) = resolver {
                match resolver.resolve(&candidates, reference).await {
                    Ok(found) => return found,
                    Err(e) => warn!(reference, error = %e, "on-demand replication failed"),
                }
            }
        }
        None
    }
}
