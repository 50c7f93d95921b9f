//! The workspace facade.
//!
//! A [`Workspace`] owns one [`Transport`] and one [`StorageEngine`] and
//! exposes the whole caller surface: every live query, streaming exports,
//! sequential and parallel fetches, and storage pass-throughs. Credentials
//! resolve at construction (environment first, then the explicit bundle);
//! multiple workspaces may coexist in one process, each with its own
//! lifecycle and no shared global state.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::Credentials;
use crate::error::Result;
use crate::export::{
    EventExportQuery, EventStream, ExportService, ProfileExportQuery, ProfileStream,
    RawEventStream, RawProfileStream,
};
use crate::fetch::{FetchOptions, ParallelFetcher, SequentialFetcher};
use crate::live::{
    ActivityFeedQuery, FrequencyQuery, FunnelQuery, LiveQueryService, NumericQuery,
    RetentionQuery, SegmentationQuery,
};
use crate::storage::StorageEngine;
use crate::transport::{Transport, TransportConfig};
use crate::types::{
    ActivityFeedResult, CohortInfo, ColumnInfo, ColumnStats, FetchResult, FrequencyResult,
    FunnelInfo, FunnelResult, NumericAverageResult, NumericBucketResult, NumericSumResult,
    ParallelFetchResult, RetentionResult, SavedReportInfo, SavedReportResult, SegmentationResult,
    SqlResult, TableKind, TableMetadata, TimeUnit, TopEvent,
};

/// Builder for [`Workspace`].
#[derive(Default)]
pub struct WorkspaceBuilder {
    credentials: Option<Credentials>,
    storage_path: Option<PathBuf>,
    transport_config: TransportConfig,
}

impl WorkspaceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit credentials; the `MP_*` environment variables override
    /// them when all four are present.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Back the local store with a file at `path`.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    /// Keep the local store in memory (the default).
    pub fn in_memory(mut self) -> Self {
        self.storage_path = None;
        self
    }

    /// Override transport behavior (timeouts, retry policy, base URLs).
    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    pub fn build(self) -> Result<Workspace> {
        let credentials = Credentials::resolve(self.credentials)?;
        let transport = Arc::new(Transport::new(credentials.clone(), self.transport_config)?);
        let storage = Arc::new(match &self.storage_path {
            Some(path) => StorageEngine::open(path)?,
            None => StorageEngine::open_in_memory()?,
        });

        Ok(Workspace {
            live: LiveQueryService::new(transport.clone()),
            export: ExportService::new(transport.clone()),
            sequential: SequentialFetcher::new(storage.clone()),
            parallel: ParallelFetcher::new(transport.clone(), storage.clone()),
            credentials,
            storage,
        })
    }
}

/// Facade over the live query, export, fetch, and storage services.
#[derive(Debug)]
pub struct Workspace {
    credentials: Credentials,
    storage: Arc<StorageEngine>,
    live: LiveQueryService,
    export: ExportService,
    sequential: SequentialFetcher,
    parallel: ParallelFetcher,
}

impl Workspace {
    pub fn builder() -> WorkspaceBuilder {
        WorkspaceBuilder::new()
    }

    /// Construct purely from the `MP_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::builder().build()
    }

    /// The resolved (secret-redacting) credentials.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Close the workspace, releasing the HTTP pool and the store exactly
    /// once.
    pub fn close(self) {
        tracing::info!(project = %self.credentials.project_id, "workspace closed");
        drop(self);
    }

    // ── Live queries ─────────────────────────────────────────────────────

    pub async fn event_names(&self) -> Result<Vec<String>> {
        self.live.event_names().await
    }

    pub async fn event_properties(&self, event: &str) -> Result<Vec<String>> {
        self.live.event_properties(event).await
    }

    pub async fn profile_properties(&self) -> Result<Vec<String>> {
        self.live.profile_properties().await
    }

    pub async fn list_properties(&self, event: Option<&str>) -> Result<Vec<String>> {
        self.live.list_properties(event).await
    }

    pub async fn property_values(
        &self,
        event: &str,
        property: &str,
        limit: Option<u32>,
    ) -> Result<Vec<Value>> {
        self.live.property_values(event, property, limit).await
    }

    pub async fn top_events(&self, limit: Option<u32>) -> Result<Vec<TopEvent>> {
        self.live.top_events(limit).await
    }

    pub async fn segmentation(&self, query: &SegmentationQuery) -> Result<SegmentationResult> {
        self.live.segmentation(query).await
    }

    pub async fn segmentation_numeric(&self, query: &NumericQuery) -> Result<NumericBucketResult> {
        self.live.segmentation_numeric(query).await
    }

    pub async fn segmentation_sum(&self, query: &NumericQuery) -> Result<NumericSumResult> {
        self.live.segmentation_sum(query).await
    }

    pub async fn segmentation_average(&self, query: &NumericQuery) -> Result<NumericAverageResult> {
        self.live.segmentation_average(query).await
    }

    pub async fn event_counts(
        &self,
        events: &[String],
        from: chrono::NaiveDate,
        to: chrono::NaiveDate,
        unit: TimeUnit,
    ) -> Result<Map<String, Value>> {
        self.live.event_counts(events, from, to, unit).await
    }

    pub async fn funnels_list(&self) -> Result<Vec<FunnelInfo>> {
        self.live.funnels_list().await
    }

    pub async fn funnel(&self, funnel_id: i64, query: &FunnelQuery) -> Result<FunnelResult> {
        self.live.funnel(funnel_id, query).await
    }

    pub async fn retention(&self, query: &RetentionQuery) -> Result<RetentionResult> {
        self.live.retention(query).await
    }

    pub async fn frequency(&self, query: &FrequencyQuery) -> Result<FrequencyResult> {
        self.live.frequency(query).await
    }

    pub async fn activity_feed(&self, query: &ActivityFeedQuery) -> Result<ActivityFeedResult> {
        self.live.activity_feed(query).await
    }

    pub async fn cohorts_list(&self) -> Result<Vec<CohortInfo>> {
        self.live.cohorts_list().await
    }

    pub async fn bookmarks_list(&self, page: u64, page_size: u64) -> Result<Vec<SavedReportInfo>> {
        self.live.bookmarks_list(page, page_size).await
    }

    pub async fn saved_report(&self, bookmark_id: i64) -> Result<SavedReportResult> {
        self.live.saved_report(bookmark_id).await
    }

    pub async fn jql(&self, script: &str, params: Option<&Value>) -> Result<Vec<Value>> {
        self.live.jql(script, params).await
    }

    // ── Streaming exports ────────────────────────────────────────────────

    pub async fn stream_events(&self, query: &EventExportQuery) -> Result<EventStream> {
        self.export.stream_events(query).await
    }

    pub async fn stream_events_raw(&self, query: &EventExportQuery) -> Result<RawEventStream> {
        self.export.stream_events_raw(query).await
    }

    pub async fn stream_profiles(&self, query: &ProfileExportQuery) -> Result<ProfileStream> {
        self.export.stream_profiles(query).await
    }

    pub async fn stream_profiles_raw(
        &self,
        query: &ProfileExportQuery,
    ) -> Result<RawProfileStream> {
        self.export.stream_profiles_raw(query).await
    }

    // ── Fetches into the local store ─────────────────────────────────────

    /// Sequential event fetch into `name`.
    pub async fn fetch_events(
        &self,
        name: &str,
        query: &EventExportQuery,
        options: &FetchOptions,
    ) -> Result<FetchResult> {
        let stream = self.export.stream_events(query).await?;
        self.sequential
            .fetch_events(name, stream, options, query.where_expr.as_deref())
            .await
    }

    /// Parallel event fetch, one worker slice per calendar day.
    pub async fn fetch_events_parallel(
        &self,
        name: &str,
        query: &EventExportQuery,
        options: &FetchOptions,
    ) -> Result<ParallelFetchResult> {
        self.parallel.fetch_events(name, query, options).await
    }

    /// Sequential profile fetch into `name`.
    pub async fn fetch_profiles(
        &self,
        name: &str,
        query: &ProfileExportQuery,
        options: &FetchOptions,
    ) -> Result<FetchResult> {
        let stream = self.export.stream_profiles(query).await?;
        self.sequential
            .fetch_profiles(name, stream, options, query.where_expr.as_deref())
            .await
    }

    /// Parallel profile fetch, one worker slice per engage page.
    pub async fn fetch_profiles_parallel(
        &self,
        name: &str,
        query: &ProfileExportQuery,
        options: &FetchOptions,
    ) -> Result<ParallelFetchResult> {
        self.parallel.fetch_profiles(name, query, options).await
    }

    // ── Storage pass-throughs ────────────────────────────────────────────

    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    pub fn create_table(&self, name: &str, kind: TableKind, replace: bool) -> Result<()> {
        self.storage.create_table(name, kind, replace, None)
    }

    pub fn list_tables(&self) -> Result<Vec<TableMetadata>> {
        self.storage.list_tables()
    }

    pub fn table_metadata(&self, name: &str) -> Result<TableMetadata> {
        self.storage.metadata(name)
    }

    pub fn table_exists(&self, name: &str) -> Result<bool> {
        self.storage.table_exists(name)
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.storage.drop_table(name)
    }

    pub fn drop_all(&self, kind: Option<TableKind>) -> Result<Vec<String>> {
        self.storage.drop_all(kind)
    }

    pub fn schema(&self, name: &str) -> Result<Vec<ColumnInfo>> {
        self.storage.schema(name)
    }

    pub fn sample(&self, name: &str, n: usize) -> Result<SqlResult> {
        self.storage.sample(name, n)
    }

    pub fn summarize(&self, name: &str) -> Result<SqlResult> {
        self.storage.summarize(name)
    }

    pub fn sql(&self, query: &str) -> Result<SqlResult> {
        self.storage.sql(query)
    }

    pub fn sql_scalar(&self, query: &str) -> Result<Value> {
        self.storage.sql_scalar(query)
    }

    pub fn json_keys(&self, table: &str, column: &str) -> Result<Vec<String>> {
        self.storage.json_keys(table, column)
    }

    pub fn column_stats(&self, table: &str, column: &str) -> Result<ColumnStats> {
        self.storage.column_stats(table, column)
    }
}
