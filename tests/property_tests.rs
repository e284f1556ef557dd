//! Property tests for pagination, hashing and cache keys.

use org_replicator::cache::{NoopCache, cache_key};
use org_replicator::config::{ConcurrencyConfig, RetryConfig};
use org_replicator::governor::GovernorSet;
use org_replicator::metrics::Metrics;
use org_replicator::pagination::Paginator;
use org_replicator::query::Query;
use org_replicator::schema::{FieldDescriptor, FieldType, ObjectDescriptor};
use org_replicator::{Connection, FieldValue, MemoryStore, Record};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

fn scan(ids: &BTreeSet<String>, page_size: usize) -> (Vec<String>, usize) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let store = Arc::new(MemoryStore::new("00DPROP"));
        store.add_object(ObjectDescriptor::new(
            "Lead",
            vec![
                FieldDescriptor::read_only("Id", FieldType::Id),
                FieldDescriptor::new("Company", FieldType::String),
            ],
        ));
        for id in ids {
            store
                .insert("Lead", Record::from_pairs([("Id", id.as_str()), ("Company", "c")]))
                .unwrap();
        }
        let metrics = Arc::new(Metrics::new());
        let governors = GovernorSet::new(
            &ConcurrencyConfig::default(),
            &RetryConfig::default(),
            metrics.clone(),
        );
        let connection = Connection::open("source", store.clone(), Arc::new(NoopCache), governors, metrics, false)
            .await
            .unwrap();

        let rows = Paginator::new(&connection, Query::select("Lead").fields(["Company"]), page_size)
            .collect_all()
            .await
            .unwrap();
        let seen = rows.iter().filter_map(|r| r.id().map(str::to_string)).collect();
        (seen, store.query_calls())
    })
}

proptest! {
    #[test]
    fn prop_pagination_yields_every_id_once_in_order(
        ids in prop::collection::btree_set("[0-9A-Za-z]{3,10}", 0..40),
        page_size in 1usize..8,
    ) {
        let (seen, calls) = scan(&ids, page_size);
        let expected: Vec<String> = ids.iter().cloned().collect();
        prop_assert_eq!(&seen, &expected);
        prop_assert!(seen.windows(2).all(|w| w[0] < w[1]));
        // full pages plus one terminating empty page
        prop_assert_eq!(calls, ids.len() / page_size + 1 + usize::from(ids.len() % page_size != 0));
    }

    #[test]
    fn prop_content_hash_ignores_insertion_order(
        pairs in prop::collection::btree_map("[A-Za-z_]{1,12}", "[ -~]{0,20}", 1..12),
    ) {
        let forward = Record::from_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let backward = Record::from_pairs(pairs.iter().rev().map(|(k, v)| (k.as_str(), v.as_str())));
        prop_assert_eq!(forward.content_hash(), backward.content_hash());

        let (key, value) = pairs.iter().next().unwrap();
        let mut changed = forward.clone();
        changed.insert(key.as_str(), format!("{}!", value));
        prop_assert_ne!(forward.content_hash(), changed.content_hash());
    }

    #[test]
    fn prop_text_and_number_hash_differently(n in any::<i64>()) {
        let text = Record::from_pairs([("Amount", FieldValue::from(n.to_string()))]);
        let number = Record::from_pairs([("Amount", FieldValue::from(n))]);
        prop_assert_ne!(text.content_hash(), number.content_hash());
    }

    #[test]
    fn prop_cache_keys_are_path_safe(
        namespace in ".{0,24}",
        kind in "[a-z-]{1,12}",
        parts in prop::collection::vec(".{0,32}", 0..4),
    ) {
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        let key = cache_key(&namespace, &kind, &parts);
        let segments: Vec<&str> = key.split('/').collect();
        prop_assert_eq!(segments.len(), 3);
        prop_assert!(segments.iter().all(|s| !s.is_empty() && *s != "." && *s != ".."));
        prop_assert_eq!(key.clone(), cache_key(&namespace, &kind, &parts));
    }
}
