//! Replication orchestration.
//!
//! [`ReplicationClient`] drives every eligible object type through
//! `NotStarted -> SchemaLoading -> MappingLoading -> Streaming -> Flushing ->
//! Done`. A failure moves only that type to `Error`; the run carries on with
//! the next type.

use crate::cache::{DurableCache, FileCache, NoopCache};
use crate::config::ReplicationConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::governor::GovernorSet;
use crate::mapping::ExternalIdMapper;
use crate::metrics::{Metrics, MetricsSnapshot, Timer};
use crate::pagination::Paginator;
use crate::query::{Filter, Query};
use crate::record::ID_FIELD;
use crate::scheduler::{self, Plan};
use crate::schema::{ObjectDescriptor, SchemaCache};
use crate::store::{Identity, RemoteStore, RestStore};
use crate::transform::{InFlightSet, RecordTransformer, ReferenceResolver, TransformOutcome};
use crate::upsert::{UpsertBatcher, UpsertStats};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Records between two streaming progress reports.
const PROGRESS_INTERVAL: usize = 100;

/// Pipeline state of one object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectState {
    /// Not processed yet
    #[default]
    NotStarted,
    /// Describing source and destination
    SchemaLoading,
    /// Loading external-id mappings
    MappingLoading,
    /// Reading, transforming and writing records
    Streaming,
    /// Writing the last partial batch
    Flushing,
    /// Finished
    Done,
    /// Failed; the run continued without it
    Error,
}

impl ObjectState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, ObjectState::Done | ObjectState::Error)
    }

    /// Whether `next` may follow this state.
    pub fn can_advance_to(self, next: ObjectState) -> bool {
        use ObjectState::*;
        match (self, next) {
            (from, Error) => !from.is_terminal(),
            (NotStarted, SchemaLoading)
            | (SchemaLoading, MappingLoading)
            | (MappingLoading, Streaming)
            | (Streaming, Flushing)
            | (Flushing, Done) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ObjectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectState::NotStarted => write!(f, "not started"),
            ObjectState::SchemaLoading => write!(f, "loading schema"),
            ObjectState::MappingLoading => write!(f, "loading mappings"),
            ObjectState::Streaming => write!(f, "streaming"),
            ObjectState::Flushing => write!(f, "flushing"),
            ObjectState::Done => write!(f, "done"),
            ObjectState::Error => write!(f, "error"),
        }
    }
}

/// Per-object replication result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectSyncResult {
    /// Object type
    pub object: String,
    /// Final state
    pub state: ObjectState,
    /// Source records read
    pub records_read: usize,
    /// Records written
    pub upserted: usize,
    /// Records skipped on a cached content hash
    pub skipped_cached: usize,
    /// Records skipped as identical to an existing row
    pub skipped_unchanged: usize,
    /// Reference fields left out
    pub omitted: usize,
    /// Records not written at all (cycles, unresolved required references)
    pub dropped: usize,
    /// Records the destination rejected
    pub failed: usize,
    /// Error that moved the object to `Error`
    pub error: Option<String>,
    /// Most recent rejected batch, when the object continued past it
    pub last_data_error: Option<String>,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl ObjectSyncResult {
    fn new(object: &str) -> Self {
        Self {
            object: object.to_string(),
            ..Default::default()
        }
    }

    /// Whether the object reached `Done`.
    pub fn is_success(&self) -> bool {
        self.state == ObjectState::Done
    }

    /// Records skipped as already replicated.
    pub fn skipped(&self) -> usize {
        self.skipped_cached + self.skipped_unchanged
    }

    fn advance(&mut self, next: ObjectState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::validation(format!(
                "{}: invalid transition {} -> {}",
                self.object, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    fn apply(&mut self, stats: UpsertStats) {
        self.upserted = stats.upserted;
        self.skipped_cached = stats.skipped_cached;
        self.skipped_unchanged = stats.skipped_unchanged;
        self.failed = stats.failed;
    }
}

/// Result of a replication run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationResult {
    /// Run identifier
    pub run_id: String,
    /// Whether every object type reached `Done`
    pub success: bool,
    /// Per-object results
    pub objects: BTreeMap<String, ObjectSyncResult>,
    /// Processing order
    pub order: Vec<String>,
    /// Total duration in milliseconds
    pub duration_ms: u64,
    /// Timestamp when the run completed
    pub completed_at: String,
    /// Client counters when the run completed
    pub metrics: MetricsSnapshot,
    /// Error summary if any object failed
    pub error: Option<String>,
}

impl ReplicationResult {
    /// Records written across all objects.
    pub fn total_upserted(&self) -> usize {
        self.objects.values().map(|o| o.upserted).sum()
    }

    /// Records skipped as already replicated across all objects.
    pub fn total_skipped(&self) -> usize {
        self.objects.values().map(|o| o.skipped()).sum()
    }

    /// Records rejected across all objects.
    pub fn total_failed(&self) -> usize {
        self.objects.values().map(|o| o.failed).sum()
    }

    /// Object types that ended in `Error`.
    pub fn failed_objects(&self) -> Vec<&str> {
        self.objects
            .values()
            .filter(|o| !o.is_success())
            .map(|o| o.object.as_str())
            .collect()
    }
}

/// Progress callback.
pub type ProgressCallback = Box<dyn Fn(ReplicationProgress) + Send + Sync>;

/// Progress update.
#[derive(Debug, Clone)]
pub struct ReplicationProgress {
    /// Object type being processed
    pub object: String,
    /// Its current state
    pub state: ObjectState,
    /// Source records processed so far
    pub records_processed: usize,
    /// Source record count, when the count query succeeded
    pub total_records: Option<u64>,
}

impl ReplicationProgress {
    /// Percentage complete (0-100), if the total is known.
    pub fn percent(&self) -> Option<u8> {
        match self.total_records {
            Some(0) => Some(100),
            Some(total) => Some(((self.records_processed as u64 * 100) / total).min(100) as u8),
            None => None,
        }
    }
}

/// Per-run state shared by every object pipeline.
struct ReplicationRun {
    config: Arc<ReplicationConfig>,
    source: Arc<SchemaCache>,
    destination: Arc<SchemaCache>,
    mapper: Arc<ExternalIdMapper>,
    transformer: RecordTransformer,
}

impl ReplicationRun {
    fn new(config: Arc<ReplicationConfig>, source: Arc<Connection>, destination: Arc<Connection>) -> Self {
        let source = Arc::new(SchemaCache::new(source));
        let destination = Arc::new(SchemaCache::new(destination));
        let mapper = Arc::new(ExternalIdMapper::new(
            destination.clone(),
            config.replication.external_id_field.clone(),
            config.replication.page_size,
        ));
        let transformer = RecordTransformer::new(
            config.clone(),
            destination.clone(),
            mapper.clone(),
            Arc::new(InFlightSet::new()),
        );
        Self {
            config,
            source,
            destination,
            mapper,
            transformer,
        }
    }

    /// Replicate one referenced source record as a single-record batch.
    async fn replicate_one(&self, object: &str, source_id: &str) -> Result<Option<String>> {
        let behavior = &self.config.replication;
        if behavior.is_skipped(object) {
            return Ok(None);
        }
        let (source, destination) =
            tokio::try_join!(self.source.describe(object), self.destination.describe(object))?;
        if !destination.has_field(&behavior.external_id_field) {
            return Ok(None);
        }

        let fields = self.transformer.source_fields(object, &source, &destination);
        let query = Query::select(object)
            .fields(fields)
            .filter(Filter::Eq(ID_FIELD.to_string(), source_id.into()))
            .limit(1);
        let result = self.source.connection().query_live(&query).await?;
        let Some(row) = result.records.into_iter().next() else {
            return Ok(None);
        };

        match self.transformer.transform(object, &row, &destination, Some(self)).await? {
            TransformOutcome::Dropped(reason) => {
                debug!(object, source_id, reason, "on-demand record dropped");
                Ok(None)
            }
            TransformOutcome::Ready(transformed) => {
                let connection = self.destination.connection();
                let mut batcher = UpsertBatcher::new(connection, &self.mapper, behavior, object)
                    .with_batch_size(1);
                let written = batcher.add_record(transformed.record).await;
                let stats = batcher.stats();
                connection.metrics().record_writes(
                    stats.upserted as u64,
                    (stats.skipped_cached + stats.skipped_unchanged) as u64,
                    stats.failed as u64,
                );
                written?;
                debug!(object, source_id, "replicated on demand");
                Ok(self.mapper.get(object, source_id))
            }
        }
    }
}

impl ReferenceResolver for ReplicationRun {
    fn resolve<'a>(
        &'a self,
        objects: &'a [String],
        source_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            for object in objects {
                match self.replicate_one(object, source_id).await {
                    Ok(Some(id)) => return Ok(Some(id)),
                    Ok(None) => {}
                    Err(e) => debug!(object = %object, source_id, error = %e, "on-demand attempt failed"),
                }
            }
            Ok(None)
        })
    }
}

/// Main replication client.
pub struct ReplicationClient {
    config: Arc<ReplicationConfig>,
    source: Arc<Connection>,
    destination: Arc<Connection>,
    metrics: Arc<Metrics>,
    progress_callback: Option<Arc<ProgressCallback>>,
}

impl ReplicationClient {
    /// Connect to both orgs over REST.
    #[instrument(skip(config))]
    pub async fn new(config: ReplicationConfig) -> Result<Self> {
        info!("Initializing replication client...");
        config.validate()?;

        let cache: Arc<dyn DurableCache> = if config.cache.enabled {
            Arc::new(FileCache::open(&config.cache.directory).await?)
        } else {
            Arc::new(NoopCache)
        };
        let source = Arc::new(RestStore::new(&config.source)?);
        let destination = Arc::new(RestStore::new(&config.destination)?);

        Self::from_parts(config, source, destination, cache).await
    }

    /// Build a client over arbitrary stores and cache.
    pub async fn from_parts(
        config: ReplicationConfig,
        source: Arc<dyn RemoteStore>,
        destination: Arc<dyn RemoteStore>,
        cache: Arc<dyn DurableCache>,
    ) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let memoize = config.cache.enabled && config.cache.memoize_queries;
        let open = |label: &'static str, store: Arc<dyn RemoteStore>| {
            let governors = GovernorSet::new(&config.concurrency, &config.retry, metrics.clone());
            Connection::open(label, store, cache.clone(), governors, metrics.clone(), memoize)
        };
        let (source, destination) =
            tokio::try_join!(open("source", source), open("destination", destination))?;

        Ok(Self {
            config: Arc::new(config),
            source: Arc::new(source),
            destination: Arc::new(destination),
            metrics,
            progress_callback: None,
        })
    }

    /// Set progress callback.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ReplicationProgress) + Send + Sync + 'static,
    {
        let callback: ProgressCallback = Box::new(callback);
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Counters accumulated across every run of this client.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Source connection.
    pub fn source(&self) -> &Arc<Connection> {
        &self.source
    }

    /// Destination connection.
    pub fn destination(&self) -> &Arc<Connection> {
        &self.destination
    }

    /// Identities both connections are authenticated as.
    pub async fn test_connectivity(&self) -> Result<(Identity, Identity)> {
        info!("Testing connectivity...");

        self.source.describe_global().await?;
        info!(username = %self.source.identity().username, "Source: OK");

        self.destination.describe_global().await?;
        info!(username = %self.destination.identity().username, "Destination: OK");

        Ok((self.source.identity().clone(), self.destination.identity().clone()))
    }

    /// Object types a run would process, before ordering.
    pub async fn eligible_objects(&self, filter: Option<&str>) -> Result<Vec<String>> {
        let run = ReplicationRun::new(self.config.clone(), self.source.clone(), self.destination.clone());
        self.eligible(&run, filter).await
    }

    async fn eligible(&self, run: &ReplicationRun, filter: Option<&str>) -> Result<Vec<String>> {
        let (source, destination) =
            tokio::try_join!(run.source.describe_global(), run.destination.describe_global())?;
        Ok(scheduler::eligible_objects(
            &source,
            &destination,
            &self.config.replication,
            filter,
        ))
    }

    /// Processing plan with reference counts, always dependency ordered.
    pub async fn plan(&self, filter: Option<&str>) -> Result<Plan> {
        let run = ReplicationRun::new(self.config.clone(), self.source.clone(), self.destination.clone());
        let eligible = self.eligible(&run, filter).await?;
        Ok(scheduler::plan(&run.source, &eligible, true).await)
    }

    /// Run replication for every eligible object type.
    ///
    /// `filter` restricts the run to types whose name starts with it,
    /// case-insensitively; `None` falls back to the configured filter.
    #[instrument(skip(self), fields(run_id))]
    pub async fn replicate(&self, filter: Option<&str>) -> Result<ReplicationResult> {
        let start = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        tracing::Span::current().record("run_id", run_id.as_str());

        let run = ReplicationRun::new(self.config.clone(), self.source.clone(), self.destination.clone());
        let eligible = self.eligible(&run, filter).await?;
        let plan = scheduler::plan(
            &run.source,
            &eligible,
            self.config.replication.enforce_dependency_order,
        )
        .await;
        let order = plan.names();
        info!(
            objects = order.len(),
            dependency_ordered = plan.dependency_ordered,
            "Starting replication..."
        );

        let mut objects = BTreeMap::new();
        for object in &order {
            let result = self.replicate_object(&run, object).await;
            objects.insert(object.clone(), result);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let failed = objects.values().filter(|o| !o.is_success()).count();
        let result = ReplicationResult {
            run_id,
            success: failed == 0,
            objects,
            order,
            duration_ms,
            completed_at: chrono::Utc::now().to_rfc3339(),
            metrics: self.metrics.snapshot(),
            error: (failed > 0).then(|| format!("{} object types failed", failed)),
        };

        if result.success {
            info!(
                "Replication completed successfully in {}ms. Upserted: {}, Skipped: {}, Objects: {}",
                duration_ms,
                result.total_upserted(),
                result.total_skipped(),
                result.objects.len()
            );
        } else {
            warn!(
                "Replication completed with errors in {}ms. Upserted: {}, Failed objects: {}",
                duration_ms,
                result.total_upserted(),
                result.failed_objects().join(", ")
            );
        }
        Ok(result)
    }

    /// Replicate one object type; never fails the run.
    #[instrument(skip(self, run))]
    async fn replicate_object(&self, run: &ReplicationRun, object: &str) -> ObjectSyncResult {
        let timer = Timer::start(format!("replicate {}", object));
        let mut report = ObjectSyncResult::new(object);

        if let Err(e) = self.run_pipeline(run, object, &mut report).await {
            error!(object, state = %report.state, error = %e, "Object failed");
            report.error = Some(e.to_string());
            report.state = ObjectState::Error;
            self.report_progress(&report, None);
        }

        report.duration_ms = timer.stop();
        self.metrics.record_object(report.is_success());
        info!(
            object,
            state = %report.state,
            read = report.records_read,
            upserted = report.upserted,
            skipped = report.skipped(),
            omitted = report.omitted,
            dropped = report.dropped,
            failed = report.failed,
            duration_ms = report.duration_ms,
            "Object finished"
        );
        report
    }

    async fn run_pipeline(
        &self,
        run: &ReplicationRun,
        object: &str,
        report: &mut ObjectSyncResult,
    ) -> Result<()> {
        let ext = self.config.replication.external_id_field.as_str();

        report.advance(ObjectState::SchemaLoading)?;
        self.report_progress(report, None);
        let (source, destination) =
            tokio::try_join!(run.source.describe(object), run.destination.describe(object))?;
        if !destination.has_field(ext) {
            return Err(Error::MissingExternalIdField {
                object: object.to_string(),
                field: ext.to_string(),
            });
        }

        report.advance(ObjectState::MappingLoading)?;
        self.report_progress(report, None);
        run.mapper.load_mapping(object).await?;

        report.advance(ObjectState::Streaming)?;
        let total = match self.source.count(object).await {
            Ok(n) => Some(n),
            Err(e) => {
                debug!(object, error = %e, "count failed; progress total unknown");
                None
            }
        };
        self.report_progress(report, total);

        let mut batcher =
            UpsertBatcher::new(&self.destination, &run.mapper, &self.config.replication, object);
        let streamed = self
            .stream_records(run, object, &source, &destination, &mut batcher, report, total)
            .await;
        let flushed = match streamed {
            Ok(()) => {
                report.advance(ObjectState::Flushing)?;
                self.report_progress(report, total);
                let flushed = batcher.flush().await;
                self.absorb_data_error(flushed, report)
            }
            Err(e) => Err(e),
        };

        let stats = batcher.stats();
        report.apply(stats);
        self.metrics.record_writes(
            stats.upserted as u64,
            (stats.skipped_cached + stats.skipped_unchanged) as u64,
            stats.failed as u64,
        );
        flushed?;

        report.advance(ObjectState::Done)?;
        self.report_progress(report, total);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_records(
        &self,
        run: &ReplicationRun,
        object: &str,
        source: &ObjectDescriptor,
        destination: &ObjectDescriptor,
        batcher: &mut UpsertBatcher<'_>,
        report: &mut ObjectSyncResult,
        total: Option<u64>,
    ) -> Result<()> {
        let fields = run.transformer.source_fields(object, source, destination);
        let query = Query::select(object).fields(fields);
        let mut pager = Paginator::new(&self.source, query, self.config.replication.page_size);

        while let Some(row) = pager.next().await? {
            report.records_read += 1;
            match run.transformer.transform(object, &row, destination, Some(run)).await? {
                TransformOutcome::Dropped(reason) => {
                    debug!(object, id = row.id().unwrap_or_default(), reason, "record dropped");
                    report.dropped += 1;
                }
                TransformOutcome::Ready(transformed) => {
                    report.omitted += transformed.omitted.len();
                    self.metrics.record_omitted(transformed.omitted.len() as u64);
                    let added = batcher.add_record(transformed.record).await;
                    self.absorb_data_error(added, report)?;
                }
            }
            if report.records_read % PROGRESS_INTERVAL == 0 {
                self.report_progress(report, total);
            }
        }
        Ok(())
    }

    /// Keep going past a rejected batch unless configured to stop.
    fn absorb_data_error(&self, outcome: Result<()>, report: &mut ObjectSyncResult) -> Result<()> {
        match outcome {
            Err(e @ Error::Data { .. }) if !self.config.replication.abort_object_on_data_error => {
                warn!(object = %report.object, error = %e, "batch rejected; continuing");
                report.last_data_error = Some(e.to_string());
                Ok(())
            }
            other => other,
        }
    }

    /// Report progress via callback.
    fn report_progress(&self, report: &ObjectSyncResult, total: Option<u64>) {
        if let Some(ref callback) = self.progress_callback {
            callback(ReplicationProgress {
                object: report.object.clone(),
                state: report.state,
                records_processed: report.records_read,
                total_records: total,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use ObjectState::*;
        let path = [NotStarted, SchemaLoading, MappingLoading, Streaming, Flushing, Done];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(Streaming.can_advance_to(Error));
        assert!(!Done.can_advance_to(Error));
        assert!(!Error.can_advance_to(Done));
        assert!(!NotStarted.can_advance_to(Streaming));
    }

    #[test]
    fn test_invalid_advance_is_rejected() {
        let mut report = ObjectSyncResult::new("Account");
        assert!(report.advance(ObjectState::Flushing).is_err());
        assert_eq!(report.state, ObjectState::NotStarted);
        report.advance(ObjectState::SchemaLoading).unwrap();
        assert_eq!(report.state, ObjectState::SchemaLoading);
    }

    #[test]
    fn test_result_totals() {
        let mut objects = BTreeMap::new();
        objects.insert(
            "Account".to_string(),
            ObjectSyncResult {
                object: "Account".into(),
                state: ObjectState::Done,
                upserted: 100,
                skipped_cached: 5,
                skipped_unchanged: 3,
                failed: 2,
                ..Default::default()
            },
        );
        objects.insert(
            "Contact".to_string(),
            ObjectSyncResult {
                object: "Contact".into(),
                state: ObjectState::Error,
                upserted: 50,
                error: Some("boom".into()),
                ..Default::default()
            },
        );

        let result = ReplicationResult {
            run_id: "r".into(),
            success: false,
            objects,
            order: vec!["Account".into(), "Contact".into()],
            duration_ms: 1500,
            completed_at: "2024-01-01T00:00:00Z".to_string(),
            metrics: MetricsSnapshot::default(),
            error: None,
        };

        assert_eq!(result.total_upserted(), 150);
        assert_eq!(result.total_skipped(), 8);
        assert_eq!(result.total_failed(), 2);
        assert_eq!(result.failed_objects(), ["Contact"]);
    }

    #[test]
    fn test_progress_percent() {
        let progress = ReplicationProgress {
            object: "Account".into(),
            state: ObjectState::Streaming,
            records_processed: 25,
            total_records: Some(200),
        };
        assert_eq!(progress.percent(), Some(12));
        assert_eq!(
            ReplicationProgress {
                total_records: None,
                ..progress
            }
            .percent(),
            None
        );
    }
}
