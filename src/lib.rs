//! # Org Replicator
//!
//! Idempotent record replication between two org-style record stores that
//! expose describe / query / upsert APIs.
//!
//! ## Features
//!
//! - **Stable identity mapping**: every destination record carries its source
//!   identity in an external-id field, so reruns update instead of duplicating
//! - **Reference resolution**: lookups are rewritten to destination ids via
//!   the mapping, a lookup query, or on-demand replication of the target
//! - **Keyset pagination**: `Id > cursor` paging that is resumable and stable
//!   under concurrent inserts
//! - **Idempotent upserts**: content-hash results are cached durably, and
//!   unchanged rows are detected before writing
//! - **Concurrency governance**: per call-site limits with bounded retry
//! - **Failure isolation**: one failing object type never aborts the run
//! - **Metrics**: built-in counters for observability
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use org_replicator::{ReplicationClient, ReplicationConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ReplicationConfig::builder()
//!         .source("https://source.my.salesforce.com", "00Dsource!token")
//!         .destination("https://dest.my.salesforce.com", "00Ddest!token")
//!         .build()?;
//!
//!     let client = ReplicationClient::new(config).await?;
//!     let result = client.replicate(Some("Account")).await?;
//!
//!     println!("Upserted {} records", result.total_upserted());
//!     Ok(())
//! }
//! ```
//!
//! ## Field Policies
//!
//! Fields that must not be copied, or whose references should never trigger
//! a lookup, are declared rather than hard-coded:
//!
//! ```rust
//! use org_replicator::{FieldPolicy, ReplicationConfig};
//!
//! let config = ReplicationConfig::builder()
//!     .source("https://source.example.com", "token")
//!     .destination("https://dest.example.com", "token")
//!     .field_policy("Case", "ParentId", FieldPolicy::DeferredLookup)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.field_policy("Case", "ParentId"), FieldPolicy::DeferredLookup);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod governor;
pub mod mapping;
pub mod metrics;
pub mod pagination;
pub mod query;
pub mod record;
pub mod scheduler;
pub mod schema;
pub mod store;
pub mod sync;
pub mod transform;
pub mod upsert;

// Re-exports for convenience
pub use cache::{DurableCache, FileCache, MemoryCache, NoopCache};
pub use config::{FieldPolicy, ReplicationConfig, ReplicationConfigBuilder};
pub use connection::Connection;
pub use error::{Error, ErrorContext, Result};
pub use record::{FieldValue, Record};
pub use store::{MemoryStore, RemoteStore, RestStore};
pub use sync::{
    ObjectState, ObjectSyncResult, ReplicationClient, ReplicationProgress, ReplicationResult,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
