//! Shared fixtures for integration tests.

#![allow(dead_code)]

use org_replicator::config::ReplicationConfigBuilder;
use org_replicator::schema::{FieldDescriptor, FieldType, ObjectDescriptor};
use org_replicator::{
    DurableCache, MemoryCache, MemoryStore, Record, ReplicationClient, ReplicationConfig,
};
use std::sync::Arc;

pub const EXT: &str = "Replication_External_ID__c";

pub fn account(with_ext: bool) -> ObjectDescriptor {
    let mut fields = vec![
        FieldDescriptor::read_only("Id", FieldType::Id),
        FieldDescriptor::new("Name", FieldType::String),
        FieldDescriptor::reference("ParentId", ["Account"]),
        FieldDescriptor::reference("OwnerId", ["User"]),
        FieldDescriptor::reference("RecordTypeId", ["RecordType"]),
    ];
    if with_ext {
        fields.push(FieldDescriptor::new(EXT, FieldType::String).external_id());
    }
    ObjectDescriptor::new("Account", fields)
}

pub fn contact(with_ext: bool) -> ObjectDescriptor {
    let mut fields = vec![
        FieldDescriptor::read_only("Id", FieldType::Id),
        FieldDescriptor::new("LastName", FieldType::String),
        FieldDescriptor::reference("AccountId", ["Account"]),
        FieldDescriptor::reference("ReportsToId", ["Contact"]),
    ];
    if with_ext {
        fields.push(FieldDescriptor::new(EXT, FieldType::String).external_id());
    }
    ObjectDescriptor::new("Contact", fields)
}

pub fn user() -> ObjectDescriptor {
    ObjectDescriptor::new(
        "User",
        vec![
            FieldDescriptor::read_only("Id", FieldType::Id),
            FieldDescriptor::new("Username", FieldType::String),
        ],
    )
}

/// Source org with Account, Contact and User.
pub fn source_org() -> Arc<MemoryStore> {
    let store = MemoryStore::new("00DSOURCE");
    store.add_object(account(false));
    store.add_object(contact(false));
    store.add_object(user());
    Arc::new(store)
}

/// Destination org with the same schema plus the external id field.
pub fn destination_org() -> Arc<MemoryStore> {
    let store = MemoryStore::new("00DDEST");
    store.add_object(account(true));
    store.add_object(contact(true));
    store.add_object(user());
    Arc::new(store)
}

pub fn add(store: &MemoryStore, object: &str, pairs: &[(&str, &str)]) {
    store
        .insert(object, Record::from_pairs(pairs.iter().copied()))
        .unwrap();
}

pub fn builder() -> ReplicationConfigBuilder {
    ReplicationConfig::builder()
        .source("https://source.example.com", "source-token")
        .destination("https://destination.example.com", "destination-token")
        .initial_backoff_ms(1)
        .cache_enabled(false)
}

pub async fn client_with(
    config: ReplicationConfig,
    source: &Arc<MemoryStore>,
    destination: &Arc<MemoryStore>,
    cache: Arc<dyn DurableCache>,
) -> ReplicationClient {
    ReplicationClient::from_parts(config, source.clone(), destination.clone(), cache)
        .await
        .unwrap()
}

pub async fn client(
    source: &Arc<MemoryStore>,
    destination: &Arc<MemoryStore>,
) -> ReplicationClient {
    client_with(
        builder().build().unwrap(),
        source,
        destination,
        Arc::new(MemoryCache::new()),
    )
    .await
}

/// Destination record replicated from `source_id`.
pub fn replicated(destination: &MemoryStore, object: &str, source_id: &str) -> Record {
    destination
        .find_by(object, EXT, source_id)
        .unwrap_or_else(|| panic!("{object} {source_id} was not replicated"))
}
