//! Configuration types and builders for org-replicator.

use crate::error::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;
use validator::Validate;

/// Object/field wildcard in [`FieldPolicyRule`].
pub const ANY_OBJECT: &str = "*";

/// Main configuration for a replication run.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReplicationConfig {
    /// Org records are read from
    #[validate(nested)]
    pub source: ConnectionConfig,

    /// Org records are written to
    #[validate(nested)]
    pub destination: ConnectionConfig,

    /// Replication behavior
    #[serde(default)]
    #[validate(nested)]
    pub replication: ReplicationBehaviorConfig,

    /// Per (object, field) copy policies
    #[serde(default = "default_field_policies")]
    #[validate(nested)]
    pub field_policies: Vec<FieldPolicyRule>,

    /// Concurrent remote call limits
    #[serde(default)]
    #[validate(nested)]
    pub concurrency: ConcurrencyConfig,

    /// Retry configuration
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,

    /// Durable cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ReplicationConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ReplicationConfigBuilder {
        ReplicationConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let source_url = std::env::var("SOURCE_INSTANCE_URL")
            .map_err(|_| Error::config("SOURCE_INSTANCE_URL not set"))?;
        let source_token = std::env::var("SOURCE_ACCESS_TOKEN")
            .map_err(|_| Error::config("SOURCE_ACCESS_TOKEN not set"))?;
        let dest_url = std::env::var("DEST_INSTANCE_URL")
            .map_err(|_| Error::config("DEST_INSTANCE_URL not set"))?;
        let dest_token = std::env::var("DEST_ACCESS_TOKEN")
            .map_err(|_| Error::config("DEST_ACCESS_TOKEN not set"))?;

        let mut builder = Self::builder()
            .source(source_url, source_token)
            .destination(dest_url, dest_token);

        if let Ok(field) = std::env::var("REPLICATION_EXTERNAL_ID_FIELD") {
            builder = builder.external_id_field(field);
        }
        if let Ok(dir) = std::env::var("REPLICATION_CACHE_DIR") {
            builder = builder.cache_directory(dir);
        }

        builder.build()
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read {}: {}", path, e)))?;
        Self::from_toml(&content).map_err(|e| match e {
            Error::Config { message, source } => Error::Config {
                message: format!("{}: {}", path, message),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self)
            .map_err(|e| Error::validation(format!("Config validation failed: {}", e)))?;
        for (label, conn) in [("source", &self.source), ("destination", &self.destination)] {
            Url::parse(&conn.instance_url).map_err(|e| {
                Error::validation(format!("Invalid {} instance_url: {}", label, e))
            })?;
            conn.request_timeout()?;
        }
        Ok(())
    }

    /// Resolve the copy policy for a field.
    ///
    /// Object-specific rules win over `*` rules; later rules win over earlier
    /// ones at the same specificity. Fields with no rule are copied.
    pub fn field_policy(&self, object: &str, field: &str) -> FieldPolicy {
        let mut wildcard = None;
        let mut exact = None;
        for rule in self.field_policies.iter().filter(|r| r.field == field) {
            if rule.object == object {
                exact = Some(rule.policy);
            } else if rule.object == ANY_OBJECT {
                wildcard = Some(rule.policy);
            }
        }
        exact.or(wildcard).unwrap_or_default()
    }
}

/// Connection settings for one org.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ConnectionConfig {
    /// Instance base URL, e.g. `https://example.my.salesforce.com`
    #[validate(length(min = 1))]
    pub instance_url: String,

    /// OAuth access token
    #[validate(length(min = 1))]
    #[serde(default, skip_serializing)]
    pub access_token: String,

    /// REST API version
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Per-request timeout, humantime format (`120s`, `2m`)
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

impl ConnectionConfig {
    /// Create connection settings with defaults.
    pub fn new(instance_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            instance_url: instance_url.into(),
            access_token: access_token.into(),
            api_version: default_api_version(),
            request_timeout: default_request_timeout(),
        }
    }

    /// Parsed request timeout.
    pub fn request_timeout(&self) -> Result<Duration> {
        humantime::parse_duration(&self.request_timeout)
            .with_context(|| format!("Invalid request_timeout {:?}", self.request_timeout))
    }
}

/// Replication behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReplicationBehaviorConfig {
    /// Destination field holding the source record identity
    #[validate(length(min = 1))]
    #[serde(default = "default_external_id_field")]
    pub external_id_field: String,

    /// Records accumulated before an upsert round trip
    #[validate(range(min = 1, max = 100000))]
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Records per bulk upsert call
    #[validate(range(min = 1, max = 100000))]
    #[serde(default = "default_bulk_chunk_size")]
    pub bulk_chunk_size: usize,

    /// External ids per existing-row lookup query
    #[validate(range(min = 1, max = 2000))]
    #[serde(default = "default_lookup_chunk_size")]
    pub lookup_chunk_size: usize,

    /// Rows per keyset page
    #[validate(range(min = 1, max = 50000))]
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Process objects most-referenced first
    #[serde(default)]
    pub enforce_dependency_order: bool,

    /// Replicate unresolved reference targets on demand
    #[serde(default)]
    pub recursive_lookups: bool,

    /// References with more candidate targets than this are omitted
    #[serde(default = "default_max_reference_targets")]
    pub max_reference_targets: usize,

    /// Case-insensitive object name prefix
    #[serde(default)]
    pub object_filter: Option<String>,

    /// Objects never replicated
    #[serde(default = "default_skip_objects")]
    pub skip_objects: Vec<String>,

    /// Derived/rollup fields ignored when diffing against existing rows
    #[serde(default = "default_derived_fields")]
    pub derived_fields: Vec<String>,

    /// Objects dropped unless every listed reference resolves
    #[serde(default = "default_required_references")]
    pub required_references: HashMap<String, Vec<String>>,

    /// Objects written with plain inserts instead of upserts
    #[serde(default = "default_insert_only_objects")]
    pub insert_only_objects: Vec<String>,

    /// Stop an object at its first rejected batch
    #[serde(default)]
    pub abort_object_on_data_error: bool,
}

impl Default for ReplicationBehaviorConfig {
    fn default() -> Self {
        Self {
            external_id_field: default_external_id_field(),
            batch_size: default_batch_size(),
            bulk_chunk_size: default_bulk_chunk_size(),
            lookup_chunk_size: default_lookup_chunk_size(),
            page_size: default_page_size(),
            enforce_dependency_order: false,
            recursive_lookups: false,
            max_reference_targets: default_max_reference_targets(),
            object_filter: None,
            skip_objects: default_skip_objects(),
            derived_fields: default_derived_fields(),
            required_references: default_required_references(),
            insert_only_objects: default_insert_only_objects(),
            abort_object_on_data_error: false,
        }
    }
}

impl ReplicationBehaviorConfig {
    /// Whether an object is on the skip list.
    pub fn is_skipped(&self, object: &str) -> bool {
        self.skip_objects.iter().any(|o| o == object)
    }

    /// Whether an object must be written with inserts.
    pub fn is_insert_only(&self, object: &str) -> bool {
        self.insert_only_objects.iter().any(|o| o == object)
    }

    /// Whether a field is excluded from existing-row diffs.
    pub fn is_derived(&self, field: &str) -> bool {
        self.derived_fields.iter().any(|f| f == field)
    }

    /// References that must resolve for a record of `object` to be written.
    pub fn required_references(&self, object: &str) -> &[String] {
        self.required_references
            .get(object)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether `object` passes the name prefix filter.
    pub fn matches_filter(&self, object: &str, filter: Option<&str>) -> bool {
        match filter.or(self.object_filter.as_deref()) {
            None => true,
            Some(prefix) => object
                .to_lowercase()
                .starts_with(prefix.trim().to_lowercase().as_str()),
        }
    }
}

/// How a field is carried into the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FieldPolicy {
    /// Copy the value, resolving references (default)
    #[default]
    Copy,
    /// Never write the field
    Skip,
    /// Only carry a reference if it is already mapped; no lookup queries
    DeferredLookup,
}

/// One row of the field policy table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct FieldPolicyRule {
    /// Object name, or `*` for every object
    #[validate(length(min = 1))]
    pub object: String,

    /// Field name
    #[validate(length(min = 1))]
    pub field: String,

    /// Policy
    pub policy: FieldPolicy,
}

impl FieldPolicyRule {
    /// Create a rule.
    pub fn new(object: impl Into<String>, field: impl Into<String>, policy: FieldPolicy) -> Self {
        Self {
            object: object.into(),
            field: field.into(),
            policy,
        }
    }
}

/// Concurrent remote call limits per call site.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ConcurrencyConfig {
    /// Concurrent describe calls
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_describe_limit")]
    pub describe: usize,

    /// Concurrent query calls
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_query_limit")]
    pub query: usize,

    /// Concurrent upsert calls
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_upsert_limit")]
    pub upsert: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            describe: default_describe_limit(),
            query: default_query_limit(),
            upsert: default_upsert_limit(),
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RetryConfig {
    /// Max retry attempts
    #[validate(range(min = 0, max = 10))]
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Max backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Add jitter
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Get initial backoff duration.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Get max backoff duration.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Durable cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Persist memoized results between runs
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cache directory
    #[serde(default = "default_cache_dir")]
    pub directory: String,

    /// Memoize non-empty source queries
    #[serde(default)]
    pub memoize_queries: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_cache_dir(),
            memoize_queries: false,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
            timestamps: true,
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format (default)
    #[default]
    Text,
    /// JSON format
    Json,
}

/// Builder for ReplicationConfig.
#[derive(Debug, Default)]
pub struct ReplicationConfigBuilder {
    source: Option<ConnectionConfig>,
    destination: Option<ConnectionConfig>,
    replication: ReplicationBehaviorConfig,
    extra_policies: Vec<FieldPolicyRule>,
    concurrency: ConcurrencyConfig,
    max_retries: Option<u32>,
    initial_backoff_ms: Option<u64>,
    cache: CacheConfig,
    log_level: Option<String>,
}

impl ReplicationConfigBuilder {
    /// Set the source org.
    pub fn source(mut self, instance_url: impl Into<String>, token: impl Into<String>) -> Self {
        self.source = Some(ConnectionConfig::new(instance_url, token));
        self
    }

    /// Set the destination org.
    pub fn destination(
        mut self,
        instance_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        self.destination = Some(ConnectionConfig::new(instance_url, token));
        self
    }

    /// Set the external id field name.
    pub fn external_id_field(mut self, field: impl Into<String>) -> Self {
        self.replication.external_id_field = field.into();
        self
    }

    /// Set the upsert batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.replication.batch_size = size;
        self
    }

    /// Set the keyset page size.
    pub fn page_size(mut self, size: usize) -> Self {
        self.replication.page_size = size;
        self
    }

    /// Process objects most-referenced first.
    pub fn enforce_dependency_order(mut self, enforce: bool) -> Self {
        self.replication.enforce_dependency_order = enforce;
        self
    }

    /// Replicate unresolved reference targets on demand.
    pub fn recursive_lookups(mut self, enabled: bool) -> Self {
        self.replication.recursive_lookups = enabled;
        self
    }

    /// Set the object name prefix filter.
    pub fn object_filter(mut self, prefix: impl Into<String>) -> Self {
        self.replication.object_filter = Some(prefix.into());
        self
    }

    /// Replace the skip-object list.
    pub fn skip_objects(mut self, objects: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.replication.skip_objects = objects.into_iter().map(Into::into).collect();
        self
    }

    /// Stop an object at its first rejected batch.
    pub fn abort_object_on_data_error(mut self, abort: bool) -> Self {
        self.replication.abort_object_on_data_error = abort;
        self
    }

    /// Add a field policy on top of the defaults.
    pub fn field_policy(
        mut self,
        object: impl Into<String>,
        field: impl Into<String>,
        policy: FieldPolicy,
    ) -> Self {
        self.extra_policies
            .push(FieldPolicyRule::new(object, field, policy));
        self
    }

    /// Set per call-site concurrency limits.
    pub fn concurrency(mut self, describe: usize, query: usize, upsert: usize) -> Self {
        self.concurrency = ConcurrencyConfig {
            describe,
            query,
            upsert,
        };
        self
    }

    /// Set max retry attempts.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Set the initial retry backoff.
    pub fn initial_backoff_ms(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = Some(ms);
        self
    }

    /// Enable or disable the durable cache.
    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache.enabled = enabled;
        self
    }

    /// Set the cache directory.
    pub fn cache_directory(mut self, dir: impl Into<String>) -> Self {
        self.cache.directory = dir.into();
        self
    }

    /// Memoize non-empty query results in the durable cache.
    pub fn memoize_queries(mut self, enabled: bool) -> Self {
        self.cache.memoize_queries = enabled;
        self
    }

    /// Set log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Build the ReplicationConfig.
    pub fn build(self) -> Result<ReplicationConfig> {
        let source = self
            .source
            .ok_or_else(|| Error::config("source connection required"))?;
        let destination = self
            .destination
            .ok_or_else(|| Error::config("destination connection required"))?;

        let mut field_policies = default_field_policies();
        field_policies.extend(self.extra_policies);

        let config = ReplicationConfig {
            source,
            destination,
            replication: self.replication,
            field_policies,
            concurrency: self.concurrency,
            retry: RetryConfig {
                max_retries: self.max_retries.unwrap_or_else(default_max_retries),
                initial_backoff_ms: self
                    .initial_backoff_ms
                    .unwrap_or_else(default_initial_backoff_ms),
                ..Default::default()
            },
            cache: self.cache,
            logging: LoggingConfig {
                level: self.log_level.unwrap_or_else(default_log_level),
                ..Default::default()
            },
        };

        config.validate()?;
        Ok(config)
    }
}

/// Sample configuration written by `org-replicator init`.
pub const SAMPLE_CONFIG: &str = r#"# org-replicator configuration

[source]
instance_url = "https://source.my.salesforce.com"
access_token = "00D...source"
api_version = "53.0"
request_timeout = "120s"

[destination]
instance_url = "https://destination.my.salesforce.com"
access_token = "00D...destination"

[replication]
external_id_field = "Replication_External_ID__c"
batch_size = 1
page_size = 5000
enforce_dependency_order = false
recursive_lookups = false
# object_filter = "npe"

[[field_policies]]
object = "*"
field = "RecordTypeId"
policy = "skip"

[[field_policies]]
object = "Opportunity"
field = "ContactId"
policy = "skip"

[concurrency]
describe = 5
query = 10
upsert = 1

[retry]
max_retries = 3
initial_backoff_ms = 1000

[cache]
enabled = true
directory = "./cache"
"#;

// Defaults
fn default_api_version() -> String {
    "53.0".into()
}
fn default_request_timeout() -> String {
    "120s".into()
}
fn default_external_id_field() -> String {
    "Replication_External_ID__c".into()
}
fn default_batch_size() -> usize {
    1
}
fn default_bulk_chunk_size() -> usize {
    10_000
}
fn default_lookup_chunk_size() -> usize {
    100
}
fn default_page_size() -> usize {
    5000
}
fn default_max_reference_targets() -> usize {
    2
}
fn default_skip_objects() -> Vec<String> {
    [
        "Individual",
        "AuthorizationForm",
        "AuthorizationFormConsent",
        "AssociatedLocation",
        "ActionLinkGroupTemplate",
        "ActionLinkTemplate",
        "AuthorizationFormDataUse",
        "BusinessHours",
        "AuthorizationFormText",
        "CampaignMemberStatus",
        "CommSubscription",
        "CommSubscriptionChannelType",
        "CommSubscriptionTiming",
        "DuplicateRecordSet",
        "DataUseLegalBasis",
        "EmailTemplate",
        "EngagementChannelType",
        "EmailMessage",
        "EnhancedLetterhead",
        "ExternalEvent",
        "IPAddressRange",
        "User",
        "Group",
        "Organization",
        "ContentVersion",
        "ContentDocument",
        "ContentDocumentLink",
        "FeedItem",
        "Note",
        "npsp__Trigger_Handler__c",
        "ListEmail",
        "Holiday",
        "SBQQ__ColumnMetadata__c",
        "SBQQ__InstallProcessorLog__c",
        "SBQQ__RecordJob__c",
        "SBQQ__QuoteLine__c",
        "SBQQ__Quote__c",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_derived_fields() -> Vec<String> {
    [
        "npo02__AverageAmount__c",
        "npo02__Best_Gift_Year__c",
        "npo02__Best_Gift_Year_Total__c",
        "npo02__FirstCloseDate__c",
        "npo02__LargestAmount__c",
        "npo02__LastCloseDate__c",
        "npo02__LastMembershipAmount__c",
        "npo02__LastMembershipDate__c",
        "npo02__LastMembershipLevel__c",
        "npo02__LastMembershipOrigin__c",
        "npo02__LastOppAmount__c",
        "npo02__MembershipEndDate__c",
        "npo02__MembershipJoinDate__c",
        "npo02__NumberOfClosedOpps__c",
        "npo02__NumberOfMembershipOpps__c",
        "npo02__OppAmount2YearsAgo__c",
        "npo02__OppAmountLastNDays__c",
        "npo02__OppAmountLastYear__c",
        "npo02__OppAmountThisYear__c",
        "npo02__OppsClosed2YearsAgo__c",
        "npo02__OppsClosedLastNDays__c",
        "npo02__OppsClosedLastYear__c",
        "npo02__OppsClosedThisYear__c",
        "npo02__SmallestAmount__c",
        "npo02__TotalMembershipOppAmount__c",
        "npo02__TotalOppAmount__c",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_required_references() -> HashMap<String, Vec<String>> {
    HashMap::from([(
        "OpportunityContactRole".to_string(),
        vec!["ContactId".to_string(), "OpportunityId".to_string()],
    )])
}
fn default_insert_only_objects() -> Vec<String> {
    vec!["OpportunityContactRole".into()]
}
fn default_field_policies() -> Vec<FieldPolicyRule> {
    vec![
        FieldPolicyRule::new(ANY_OBJECT, "RecordTypeId", FieldPolicy::Skip),
        FieldPolicyRule::new("Opportunity", "ContactId", FieldPolicy::Skip),
    ]
}
fn default_describe_limit() -> usize {
    5
}
fn default_query_limit() -> usize {
    10
}
fn default_upsert_limit() -> usize {
    1
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    60000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_cache_dir() -> String {
    "./cache".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> ReplicationConfig {
        ReplicationConfig::builder()
            .source("https://src.example.com", "token-a")
            .destination("https://dst.example.com", "token-b")
            .build()
            .unwrap()
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = minimal();
        assert_eq!(
            config.replication.external_id_field,
            "Replication_External_ID__c"
        );
        assert_eq!(config.replication.batch_size, 1);
        assert_eq!(config.replication.page_size, 5000);
        assert_eq!(config.replication.bulk_chunk_size, 10_000);
        assert_eq!(config.concurrency.query, 10);
        assert!(config.replication.is_skipped("User"));
        assert!(config.replication.is_insert_only("OpportunityContactRole"));
        assert_eq!(config.replication.skip_objects.len(), 37);
        for object in ["Individual", "ContentDocumentLink", "SBQQ__Quote__c", "npsp__Trigger_Handler__c"] {
            assert!(config.replication.is_skipped(object), "{object}");
        }
        assert!(!config.replication.is_skipped("Account"));
    }

    #[test]
    fn test_builder_requires_connections() {
        let err = ReplicationConfig::builder()
            .source("https://src.example.com", "t")
            .build()
            .unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_invalid_url_rejected() {
        let err = ReplicationConfig::builder()
            .source("not a url", "t")
            .destination("https://dst.example.com", "t")
            .build()
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_field_policy_resolution() {
        let config = ReplicationConfig::builder()
            .source("https://src.example.com", "t")
            .destination("https://dst.example.com", "t")
            .field_policy("Case", "RecordTypeId", FieldPolicy::Copy)
            .field_policy("*", "ParentId", FieldPolicy::DeferredLookup)
            .build()
            .unwrap();

        assert_eq!(config.field_policy("Account", "RecordTypeId"), FieldPolicy::Skip);
        assert_eq!(config.field_policy("Case", "RecordTypeId"), FieldPolicy::Copy);
        assert_eq!(config.field_policy("Opportunity", "ContactId"), FieldPolicy::Skip);
        assert_eq!(config.field_policy("Contact", "ContactId"), FieldPolicy::Copy);
        assert_eq!(
            config.field_policy("Account", "ParentId"),
            FieldPolicy::DeferredLookup
        );
    }

    #[test]
    fn test_filter_is_trimmed_and_case_insensitive() {
        let behavior = ReplicationBehaviorConfig::default();
        assert!(behavior.matches_filter("npe01__OppPayment__c", Some("  NPE01")));
        assert!(!behavior.matches_filter("Account", Some("npe")));
        assert!(behavior.matches_filter("Account", None));
    }

    #[test]
    fn test_sample_config_parses() {
        let config = ReplicationConfig::from_toml(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.destination.api_version, "53.0");
        assert_eq!(config.field_policies.len(), 2);
        assert_eq!(
            config.replication.required_references("OpportunityContactRole"),
            ["ContactId".to_string(), "OpportunityId".to_string()]
        );
    }

    #[test]
    fn test_access_token_never_serialized() {
        let rendered = toml::to_string(&minimal()).unwrap();
        assert!(!rendered.contains("token-a"));
    }

    #[test]
    fn test_request_timeout_parsing() {
        let mut conn = ConnectionConfig::new("https://x.example.com", "t");
        assert_eq!(conn.request_timeout().unwrap(), Duration::from_secs(120));
        conn.request_timeout = "soon".into();
        assert!(conn.request_timeout().is_err());
    }
}
