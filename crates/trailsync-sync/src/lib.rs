//! Reconciliation pipeline: fetch, normalize, merge, match, plan, dispatch and persist.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use trailsync_adapters::{
    fixture_path, normalize_feed, AdapterError, FeedAdapter, FixtureFeedAdapter, InsightAdapter, NormalizedFeed,
    SamsaraAdapter, SkybitzAdapter,
};
use trailsync_core::FeedKind;
use trailsync_storage::{
    bulk_upsert, BatchWriter, HttpClientConfig, HttpFetcher, PersistError, TrailerStatusRow,
};
use uuid::Uuid;

pub mod alert;
pub mod board;
pub mod config;
pub mod dispatch;
pub mod matcher;
pub mod merge;
pub mod planner;
pub mod schedule;

pub use alert::{LastRun, LastRunRecorder, RunEvent, RunFailure, RunObserver, TelegramAlerter};
pub use board::{BoardError, InventorySource, MondayClient};
pub use config::{SyncConfig, SyncSettings};
pub use dispatch::{BatchExecutor, DispatchFailure, DispatchPolicy, Sleeper, TokioSleeper};
pub use matcher::{match_inventory, MatchAmbiguity, MatchReport};
pub use merge::merge_feeds;
pub use planner::{BatchDocument, BatchOperation, BoardTarget, OperationTarget, Plan, Planner};
pub use schedule::{build_scheduler, run_exclusive, RunGuard};

pub const CRATE_NAME: &str = "trailsync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("feed {feed} unavailable: {source}")]
    FeedUnavailable {
        feed: FeedKind,
        #[source]
        source: AdapterError,
    },
    #[error("match ambiguity: {0}")]
    MatchAmbiguity(MatchAmbiguity),
    #[error("document {document} failed transiently: {message}")]
    DispatchRetryable { document: usize, message: String },
    #[error("document {document} failed: {message}")]
    DispatchFatal { document: usize, message: String },
    #[error("document {document} still failing after {attempts} attempts: {message}")]
    DispatchExhausted {
        document: usize,
        attempts: usize,
        message: String,
    },
    #[error(transparent)]
    PersistenceFailure(#[from] PersistError),
    #[error("board inventory query failed: {0}")]
    Inventory(#[source] BoardError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedSummary {
    pub feed: FeedKind,
    pub fragments: usize,
    pub excluded: usize,
    pub unkeyed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feeds: Vec<FeedSummary>,
    pub registry_size: usize,
    pub matched: usize,
    pub ambiguities: usize,
    pub creates: usize,
    pub updates: usize,
    pub documents: usize,
    pub dispatch_attempts: usize,
    pub persisted_rows: usize,
    pub persisted_batches: usize,
}

/// Where feed payloads come from.
#[derive(Debug, Clone)]
pub enum FeedSource {
    Live,
    Fixtures(PathBuf),
}

/// Trait-object seams the pipeline drives.
pub struct Collaborators {
    pub adapters: Vec<Arc<dyn FeedAdapter>>,
    pub inventory: Arc<dyn InventorySource>,
    pub executor: Arc<dyn BatchExecutor>,
    pub writer: Arc<dyn BatchWriter>,
}

pub struct SyncPipeline {
    settings: SyncSettings,
    board: BoardTarget,
    http: HttpFetcher,
    adapters: Vec<Arc<dyn FeedAdapter>>,
    inventory: Arc<dyn InventorySource>,
    executor: Arc<dyn BatchExecutor>,
    writer: Arc<dyn BatchWriter>,
    sleeper: Arc<dyn Sleeper>,
    observers: Vec<Arc<dyn RunObserver>>,
}

pub fn http_config(config: &SyncConfig) -> HttpClientConfig {
    HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        backoff: config.settings.backoff(),
        ..Default::default()
    }
}

impl SyncPipeline {
    pub fn new(settings: SyncSettings, board: BoardTarget, http: HttpFetcher, collaborators: Collaborators) -> Self {
        Self {
            settings,
            board,
            http,
            adapters: collaborators.adapters,
            inventory: collaborators.inventory,
            executor: collaborators.executor,
            writer: collaborators.writer,
            sleeper: Arc::new(TokioSleeper),
            observers: Vec::new(),
        }
    }

    /// Wires the live board client and either live or recorded feeds.
    pub fn from_config(config: &SyncConfig, writer: Arc<dyn BatchWriter>, source: FeedSource) -> Result<Self> {
        let http = http_config(config);
        let adapters: Vec<Arc<dyn FeedAdapter>> = match source {
            FeedSource::Live => vec![
                Arc::new(SkybitzAdapter {
                    base_url: config.skybitz.base_url.clone(),
                    customer: config.skybitz.customer.clone(),
                    password: config.skybitz.password.clone(),
                    version: config.skybitz.version.clone(),
                }),
                Arc::new(SamsaraAdapter {
                    url: config.samsara.url.clone(),
                    api_token: config.samsara.api_token.clone(),
                }),
                Arc::new(InsightAdapter::new(
                    config.insight.username.clone(),
                    config.insight.password.clone(),
                    http.clone(),
                )),
            ],
            FeedSource::Fixtures(root) => FeedKind::DEFAULT_ORDER
                .iter()
                .map(|&feed| {
                    Arc::new(FixtureFeedAdapter {
                        feed,
                        path: fixture_path(&root, feed),
                    }) as Arc<dyn FeedAdapter>
                })
                .collect(),
        };

        let board_client = Arc::new(MondayClient::new(
            config.board.api_url.clone(),
            config.board.api_token.clone(),
            http.clone(),
        )?);

        Ok(Self::new(
            config.settings.clone(),
            BoardTarget {
                board_id: config.board.board_id.clone(),
                group_id: config.board.group_id.clone(),
            },
            HttpFetcher::new(http)?,
            Collaborators {
                adapters,
                inventory: board_client.clone(),
                executor: board_client,
                writer,
            },
        ))
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// One complete reconciliation pass. Observers see exactly one event per call.
    pub async fn run_once(&self) -> Result<RunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "sync run starting");

        let result = self
            .execute(run_id, started_at)
            .instrument(info_span!("sync_run", %run_id))
            .await;

        let event = match &result {
            Ok(summary) => {
                info!(
                    %run_id,
                    registry = summary.registry_size,
                    creates = summary.creates,
                    updates = summary.updates,
                    persisted = summary.persisted_rows,
                    "sync run finished"
                );
                RunEvent::Completed(summary.clone())
            }
            Err(err) => {
                error!(%run_id, error = %err, "sync run failed");
                RunEvent::Failed(RunFailure {
                    run_id,
                    started_at,
                    failed_at: Utc::now(),
                    error: err.to_string(),
                })
            }
        };
        for observer in &self.observers {
            observer.on_event(&event);
        }

        result
    }

    async fn execute(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<RunSummary, SyncError> {
        let feeds = self.fetch_feeds().await?;
        let mut registry = merge_feeds(&self.settings.feed_order, &feeds);
        info!(entries = registry.len(), "registry built");

        let inventory = self
            .inventory
            .list_all_items(&self.board.board_id)
            .await
            .map_err(SyncError::Inventory)?;
        let report = match_inventory(&mut registry, &inventory);

        let planner = Planner {
            board: self.board.clone(),
            columns: self.settings.board.columns.clone(),
            batch_size: self.settings.batch_size,
        };
        let plan = planner.plan(&registry, Utc::now());
        let rows = TrailerStatusRow::from_registry(&registry);
        info!(
            operations = plan.operation_count(),
            documents = plan.documents.len(),
            rows = rows.len(),
            "plan ready"
        );

        let policy = DispatchPolicy {
            backoff: self.settings.backoff(),
            concurrency: self.settings.dispatch_concurrency,
        };
        let (dispatched, persisted) = tokio::join!(
            dispatch::dispatch_all(self.executor.as_ref(), self.sleeper.as_ref(), policy, &plan.documents),
            bulk_upsert(self.writer.as_ref(), &rows, self.settings.persist_batch_size),
        );

        let (dispatched, persisted) = match (dispatched, persisted) {
            (Ok(d), Ok(p)) => (d, p),
            (Err(dispatch_err), Err(persist_err)) => {
                warn!(error = %dispatch_err, "board dispatch also failed");
                return Err(persist_err.into());
            }
            (Err(err), Ok(_)) => return Err(err),
            (Ok(_), Err(err)) => return Err(err.into()),
        };

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            feeds: feeds
                .iter()
                .map(|f| FeedSummary {
                    feed: f.feed,
                    fragments: f.fragments.len(),
                    excluded: f.excluded,
                    unkeyed: f.unkeyed,
                })
                .collect(),
            registry_size: registry.len(),
            matched: report.matched,
            ambiguities: report.ambiguities.len(),
            creates: plan.creates,
            updates: plan.updates,
            documents: dispatched.documents,
            dispatch_attempts: dispatched.attempts,
            persisted_rows: persisted.rows,
            persisted_batches: persisted.batches,
        })
    }

    /// All feeds concurrently; any failure fails the run.
    async fn fetch_feeds(&self) -> Result<Vec<NormalizedFeed>, SyncError> {
        let fetches = self.adapters.iter().map(|adapter| async move {
            let feed = adapter.feed();
            let records = adapter
                .fetch(&self.http)
                .instrument(info_span!("fetch_feed", %feed))
                .await
                .map_err(|source| SyncError::FeedUnavailable { feed, source })?;
            Ok::<_, SyncError>(normalize_feed(feed, &records, &self.settings.exclusions))
        });
        join_all(fetches).await.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;
    use trailsync_adapters::{InsightAsset, RawRecord, SkybitzPosition};
    use trailsync_core::InventoryItem;

    struct StaticFeed {
        feed: FeedKind,
        records: Vec<RawRecord>,
        fail: bool,
    }

    #[async_trait]
    impl FeedAdapter for StaticFeed {
        fn feed(&self) -> FeedKind {
            self.feed
        }

        async fn fetch(&self, _http: &HttpFetcher) -> Result<Vec<RawRecord>, AdapterError> {
            if self.fail {
                return Err(AdapterError::Unavailable {
                    feed: self.feed,
                    message: "connection refused".into(),
                });
            }
            Ok(self.records.clone())
        }
    }

    struct FakeInventory(Vec<InventoryItem>);

    #[async_trait]
    impl InventorySource for FakeInventory {
        async fn list_all_items(&self, _board_id: &str) -> Result<Vec<InventoryItem>, BoardError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct RecordingExecutor {
        documents: Mutex<Vec<BatchDocument>>,
    }

    #[async_trait]
    impl BatchExecutor for RecordingExecutor {
        async fn execute(&self, document: &BatchDocument) -> Result<Value, DispatchFailure> {
            self.documents.lock().unwrap().push(document.clone());
            Ok(Value::Null)
        }
    }

    #[derive(Default)]
    struct RecordingWriter {
        rows: Mutex<Vec<TrailerStatusRow>>,
        fail: bool,
    }

    #[async_trait]
    impl BatchWriter for RecordingWriter {
        async fn write_batch(&self, rows: &[TrailerStatusRow]) -> Result<(), sqlx::Error> {
            if self.fail {
                return Err(sqlx::Error::PoolTimedOut);
            }
            self.rows.lock().unwrap().extend_from_slice(rows);
            Ok(())
        }
    }

    #[derive(Default)]
    struct EventLog(Mutex<Vec<RunEvent>>);

    impl RunObserver for EventLog {
        fn on_event(&self, event: &RunEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn skybitz(id: &str, lat: f64, lon: f64) -> RawRecord {
        RawRecord::Skybitz(SkybitzPosition {
            asset_id: Some(id.into()),
            latitude: Some(lat),
            longitude: Some(lon),
            ..Default::default()
        })
    }

    fn insight(id: &str, lat: f64, lon: f64) -> RawRecord {
        RawRecord::Insight(InsightAsset {
            asset_id: id.into(),
            latitude: Some(lat),
            longitude: Some(lon),
            ..Default::default()
        })
    }

    struct Harness {
        pipeline: SyncPipeline,
        executor: Arc<RecordingExecutor>,
        writer: Arc<RecordingWriter>,
        events: Arc<EventLog>,
    }

    fn harness(feeds: Vec<StaticFeed>, inventory: Vec<InventoryItem>, writer: RecordingWriter) -> Harness {
        let executor = Arc::new(RecordingExecutor::default());
        let writer = Arc::new(writer);
        let events = Arc::new(EventLog::default());
        let pipeline = SyncPipeline::new(
            SyncSettings::default(),
            BoardTarget {
                board_id: "100".into(),
                group_id: "new_group".into(),
            },
            HttpFetcher::new(HttpClientConfig::default()).unwrap(),
            Collaborators {
                adapters: feeds.into_iter().map(|f| Arc::new(f) as Arc<dyn FeedAdapter>).collect(),
                inventory: Arc::new(FakeInventory(inventory)),
                executor: executor.clone(),
                writer: writer.clone(),
            },
        )
        .with_observer(events.clone());
        Harness {
            pipeline,
            executor,
            writer,
            events,
        }
    }

    fn feed(kind: FeedKind, records: Vec<RawRecord>) -> StaticFeed {
        StaticFeed {
            feed: kind,
            records,
            fail: false,
        }
    }

    #[tokio::test]
    async fn later_feed_wins_for_both_board_and_store() {
        let h = harness(
            vec![
                feed(FeedKind::Skybitz, vec![skybitz("T1", 10.0, 20.0)]),
                feed(FeedKind::Samsara, vec![]),
                feed(FeedKind::Insight, vec![insight("T1", 11.0, 21.0)]),
            ],
            vec![],
            RecordingWriter::default(),
        );

        let summary = h.pipeline.run_once().await.unwrap();

        assert_eq!((summary.creates, summary.updates), (1, 0));
        let documents = h.executor.documents.lock().unwrap();
        assert_eq!(documents.len(), 1);
        let op = &documents[0].operations[0];
        assert_eq!(op.target, OperationTarget::Create);
        assert_eq!(op.identity_key.as_str(), "T1");
        assert_eq!(
            op.fields["link_mktvvmv"]["url"],
            "www.google.com/maps/search/?api=1&query=11,21"
        );

        let rows = h.writer.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].trailer_number, "T1");
        assert_eq!((rows[0].latitude, rows[0].longitude), (Some(11.0), Some(21.0)));

        let events = h.events.0.lock().unwrap();
        assert!(matches!(events.as_slice(), [RunEvent::Completed(_)]));
    }

    #[tokio::test]
    async fn inventory_match_drives_update_versus_create() {
        let h = harness(
            vec![feed(FeedKind::Skybitz, vec![skybitz("A", 1.0, 1.0), skybitz("C", 2.0, 2.0)])],
            vec![InventoryItem::new("1", "A"), InventoryItem::new("2", "B")],
            RecordingWriter::default(),
        );

        let summary = h.pipeline.run_once().await.unwrap();

        assert_eq!(summary.matched, 1);
        let documents = h.executor.documents.lock().unwrap();
        let ops: Vec<_> = documents.iter().flat_map(|d| d.operations.iter()).collect();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].identity_key.as_str(), "A");
        assert_eq!(ops[0].target, OperationTarget::Update(trailsync_core::RemoteHandle::new("1")));
        assert_eq!(ops[1].identity_key.as_str(), "C");
        assert_eq!(ops[1].target, OperationTarget::Create);
    }

    #[tokio::test]
    async fn feed_failure_aborts_before_any_side_effect_and_alerts_once() {
        let h = harness(
            vec![
                feed(FeedKind::Skybitz, vec![skybitz("T1", 1.0, 1.0)]),
                StaticFeed {
                    feed: FeedKind::Samsara,
                    records: vec![],
                    fail: true,
                },
            ],
            vec![],
            RecordingWriter::default(),
        );

        let err = h.pipeline.run_once().await.unwrap_err();

        assert!(matches!(err, SyncError::FeedUnavailable { feed: FeedKind::Samsara, .. }));
        assert!(h.executor.documents.lock().unwrap().is_empty());
        assert!(h.writer.rows.lock().unwrap().is_empty());
        let events = h.events.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        let RunEvent::Failed(failure) = &events[0] else {
            panic!("expected failure event");
        };
        assert!(failure.error.contains("samsara"));
    }

    #[tokio::test]
    async fn persistence_failure_fails_the_run_but_board_still_receives_documents() {
        let h = harness(
            vec![feed(FeedKind::Skybitz, vec![skybitz("T1", 1.0, 1.0)])],
            vec![],
            RecordingWriter {
                fail: true,
                ..Default::default()
            },
        );

        let err = h.pipeline.run_once().await.unwrap_err();

        assert!(matches!(err, SyncError::PersistenceFailure(PersistError::BatchFailed { batch: 0, .. })));
        assert_eq!(h.executor.documents.lock().unwrap().len(), 1);
        let events = h.events.0.lock().unwrap();
        assert_eq!(events.iter().filter(|e| matches!(e, RunEvent::Failed(_))).count(), 1);
    }

    struct FlakyExecutor {
        failures_left: Mutex<usize>,
    }

    #[async_trait]
    impl BatchExecutor for FlakyExecutor {
        async fn execute(&self, _document: &BatchDocument) -> Result<Value, DispatchFailure> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(DispatchFailure::Retryable("http 503: busy".into()));
            }
            Ok(Value::Null)
        }
    }

    #[derive(Default)]
    struct RecordingSleeper(Mutex<Vec<Duration>>);

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.0.lock().unwrap().push(duration);
        }
    }

    #[tokio::test]
    async fn transient_board_failure_is_retried_with_backoff() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let pipeline = SyncPipeline::new(
            SyncSettings::default(),
            BoardTarget {
                board_id: "100".into(),
                group_id: "g".into(),
            },
            HttpFetcher::new(HttpClientConfig::default()).unwrap(),
            Collaborators {
                adapters: vec![Arc::new(feed(FeedKind::Skybitz, vec![skybitz("T1", 1.0, 1.0)]))],
                inventory: Arc::new(FakeInventory(vec![])),
                executor: Arc::new(FlakyExecutor {
                    failures_left: Mutex::new(1),
                }),
                writer: Arc::new(RecordingWriter::default()),
            },
        )
        .with_sleeper(sleeper.clone());

        let summary = pipeline.run_once().await.unwrap();

        assert_eq!(summary.documents, 1);
        assert_eq!(summary.dispatch_attempts, 2);
        assert_eq!(*sleeper.0.lock().unwrap(), vec![Duration::from_millis(600)]);
    }

    #[tokio::test]
    async fn exclusions_and_ambiguities_show_in_summary() {
        let mut h = harness(
            vec![feed(
                FeedKind::Skybitz,
                vec![
                    RawRecord::Skybitz(SkybitzPosition {
                        asset_id: Some("9".into()),
                        mtsn: Some("SHB7BJBL231902665".into()),
                        ..Default::default()
                    }),
                    skybitz("A", 1.0, 1.0),
                ],
            )],
            vec![InventoryItem::new("1", "A"), InventoryItem::new("2", "A")],
            RecordingWriter::default(),
        );
        h.pipeline.settings.exclusions = trailsync_adapters::ExclusionList::new(["SHB7BJBL231902665"]);

        let summary = h.pipeline.run_once().await.unwrap();

        assert_eq!(summary.feeds[0].excluded, 1);
        assert_eq!(summary.registry_size, 1);
        assert_eq!(summary.ambiguities, 1);
        assert_eq!(summary.updates, 1);
    }

    #[tokio::test]
    async fn recorded_fixtures_flow_through_the_whole_pipeline() {
        let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
        let adapters: Vec<Arc<dyn FeedAdapter>> = FeedKind::DEFAULT_ORDER
            .iter()
            .map(|&feed| {
                Arc::new(FixtureFeedAdapter {
                    feed,
                    path: fixture_path(&root, feed),
                }) as Arc<dyn FeedAdapter>
            })
            .collect();
        let executor = Arc::new(RecordingExecutor::default());
        let writer = Arc::new(RecordingWriter::default());
        let pipeline = SyncPipeline::new(
            SyncSettings {
                exclusions: trailsync_adapters::ExclusionList::new(["SHB7BJBL231902665"]),
                ..SyncSettings::default()
            },
            BoardTarget {
                board_id: "100".into(),
                group_id: "g".into(),
            },
            HttpFetcher::new(HttpClientConfig::default()).unwrap(),
            Collaborators {
                adapters,
                inventory: Arc::new(FakeInventory(vec![InventoryItem::new("9001", "5302")])),
                executor: executor.clone(),
                writer: writer.clone(),
            },
        );

        let summary = pipeline.run_once().await.unwrap();

        // 5301 and 5304 from skybitz, 5302 from samsara (5301 overwritten), two from insight.
        assert_eq!(summary.registry_size, 5);
        assert_eq!(summary.updates, 1);
        let rows = writer.rows.lock().unwrap();
        let keys: Vec<_> = rows.iter().map(|r| r.trailer_number.as_str()).collect();
        assert_eq!(keys, vec!["5301", "5304", "5302", "5303001", "5302002"]);
        let t5301 = rows.iter().find(|r| r.trailer_number == "5301").unwrap();
        assert_eq!(t5301.idle_duration, None, "samsara replaced the skybitz record");
    }
}
