//! Object selection and dependency-biased ordering.
//!
//! Every reference field on every described type adds one to the count of
//! each type it can point at. Sorting by that count, highest first, moves
//! heavily referenced types ahead of the types that point at them, so more
//! references resolve on a single pass. Whether the order is applied is a
//! configuration choice; see [`plan`].

use crate::config::ReplicationBehaviorConfig;
use crate::schema::{ObjectDescriptor, ObjectSummary, SchemaCache};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Count how often each type is the target of a reference field.
pub fn reference_counts<'a>(
    descriptors: impl IntoIterator<Item = &'a ObjectDescriptor>,
) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for descriptor in descriptors {
        for field in descriptor.reference_fields() {
            for target in &field.reference_to {
                *counts.entry(target.clone()).or_insert(0) += 1;
            }
        }
    }
    counts
}

/// Sort object names most-referenced first; ties by name.
pub fn dependency_order(objects: &[String], counts: &BTreeMap<String, usize>) -> Vec<String> {
    let mut ordered = objects.to_vec();
    ordered.sort_by(|a, b| {
        let ca = counts.get(a).copied().unwrap_or(0);
        let cb = counts.get(b).copied().unwrap_or(0);
        cb.cmp(&ca).then_with(|| a.cmp(b))
    });
    ordered
}

/// Source object types that can be replicated, in describe order.
pub fn eligible_objects(
    source: &[ObjectSummary],
    destination: &[ObjectSummary],
    behavior: &ReplicationBehaviorConfig,
    filter: Option<&str>,
) -> Vec<String> {
    let present: HashSet<&str> = destination.iter().map(|o| o.name.as_str()).collect();
    source
        .iter()
        .filter(|o| o.is_replicable())
        .filter(|o| present.contains(o.name.as_str()))
        .filter(|o| !behavior.is_skipped(&o.name))
        .filter(|o| behavior.matches_filter(&o.name, filter))
        .map(|o| o.name.clone())
        .collect()
}

/// One planned object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedObject {
    /// Object type
    pub name: String,
    /// Reference fields across the source schema pointing at this type
    pub referenced_by: usize,
}

/// Processing order for a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Plan {
    /// Object types in processing order
    pub objects: Vec<PlannedObject>,
    /// Whether the order is the dependency order
    pub dependency_ordered: bool,
}

impl Plan {
    /// Object names in processing order.
    pub fn names(&self) -> Vec<String> {
        self.objects.iter().map(|o| o.name.clone()).collect()
    }
}

/// Build the processing plan for `eligible` types.
///
/// Source describes run concurrently (bounded by the describe lane). A type
/// that cannot be described is logged and counted as unreferenced; the
/// failure resurfaces when that type itself is processed.
pub async fn plan(
    source: &Arc<SchemaCache>,
    eligible: &[String],
    enforce_order: bool,
) -> Plan {
    let descriptors: Vec<Arc<ObjectDescriptor>> = stream::iter(eligible.iter())
        .map(|name| async move {
            match source.describe(name).await {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!(object = %name, error = %e, "describe failed while planning");
                    None
                }
            }
        })
        .buffered(eligible.len().max(1))
        .filter_map(|d| async move { d })
        .collect()
        .await;

    let counts = reference_counts(descriptors.iter().map(Arc::as_ref));
    let names = if enforce_order {
        dependency_order(eligible, &counts)
    } else {
        eligible.to_vec()
    };
    debug!(objects = names.len(), enforce_order, "plan built");

    Plan {
        objects: names
            .into_iter()
            .map(|name| PlannedObject {
                referenced_by: counts.get(&name).copied().unwrap_or(0),
                name,
            })
            .collect(),
        dependency_ordered: enforce_order,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDescriptor, FieldType};

    fn descriptors() -> Vec<ObjectDescriptor> {
        vec![
            ObjectDescriptor::new(
                "Contact",
                vec![
                    FieldDescriptor::reference("AccountId", ["Account"]),
                    FieldDescriptor::reference("OwnerId", ["User", "Group"]),
                ],
            ),
            ObjectDescriptor::new(
                "Opportunity",
                vec![
                    FieldDescriptor::reference("AccountId", ["Account"]),
                    FieldDescriptor::reference("ContactId", ["Contact"]),
                ],
            ),
            ObjectDescriptor::new(
                "Account",
                vec![
                    FieldDescriptor::new("Name", FieldType::String),
                    FieldDescriptor::reference("ParentId", ["Account"]),
                ],
            ),
        ]
    }

    #[test]
    fn test_reference_counts() {
        let counts = reference_counts(&descriptors());
        assert_eq!(counts.get("Account"), Some(&3));
        assert_eq!(counts.get("Contact"), Some(&1));
        assert_eq!(counts.get("User"), Some(&1));
        assert_eq!(counts.get("Opportunity"), None);
    }

    #[test]
    fn test_dependency_order_most_referenced_first() {
        let counts = reference_counts(&descriptors());
        let order = dependency_order(
            &["Opportunity".into(), "Contact".into(), "Account".into()],
            &counts,
        );
        assert_eq!(order, ["Account", "Contact", "Opportunity"]);
    }

    #[test]
    fn test_eligible_objects() {
        let source = vec![
            ObjectSummary::standard("Account"),
            ObjectSummary::standard("Contact"),
            ObjectSummary::standard("User"),
            ObjectSummary::standard("OnlyInSource__c"),
            ObjectSummary {
                layoutable: false,
                ..ObjectSummary::standard("AccountHistory")
            },
        ];
        let destination = vec![
            ObjectSummary::standard("Account"),
            ObjectSummary::standard("Contact"),
            ObjectSummary::standard("User"),
            ObjectSummary::standard("AccountHistory"),
        ];
        let behavior = ReplicationBehaviorConfig::default();

        assert_eq!(
            eligible_objects(&source, &destination, &behavior, None),
            ["Account", "Contact"]
        );
        assert_eq!(
            eligible_objects(&source, &destination, &behavior, Some(" acc")),
            ["Account"]
        );
    }
}
