//! Parallel fetch: date-sharded events and page-sharded profiles.
//!
//! Topology: a pool of worker tasks pulls slice keys from a shared queue,
//! fetches and transforms each slice, and produces write tasks onto a
//! bounded channel of capacity `2 × workers`. One dedicated writer task
//! drains the channel and performs every storage write, so Provider reads
//! fan out while the store sees a single writer.
//!
//! Per-slice failures are recorded in the result, never propagated as
//! errors; an authentication failure is job-fatal and cancels the
//! remaining slices. Progress is emitted exactly once per slice, after the
//! writer persisted its batch (success) or the fetcher gave up on it
//! (failure), in completion order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{MixpanelError, Result};
use crate::export::{EventExportQuery, ProfileExportQuery};
use crate::fetch::{prepare_table, CancelHandle, FetchOptions, ProgressCallback};
use crate::shape::{normalize_event, normalize_profile_parts};
use crate::storage::{RecordBatch, StorageEngine};
use crate::transport::{RateBudget, Transport};
use crate::types::{
    ParallelFetchProgress, ParallelFetchResult, ProfileRecord, SliceKey, TableKind,
};

/// Worker count when the caller does not ask for one.
const DEFAULT_WORKERS: usize = 5;
/// Recommended ceiling for event workers; exceeding it is allowed but
/// logged.
const EVENT_WORKER_SOFT_CAP: usize = 10;

/// One slice's transformed records, bound for the writer.
struct WriteTask {
    slice: SliceKey,
    batch: RecordBatch,
}

/// Shared accounting for one fetch job.
struct JobContext {
    state: Mutex<JobState>,
    progress: Option<ProgressCallback>,
    slice_total: Option<u64>,
    cancel: CancelHandle,
    fatal: Mutex<Option<MixpanelError>>,
}

#[derive(Default)]
struct JobState {
    total_rows: u64,
    successful: u64,
    failed: u64,
    failed_keys: Vec<SliceKey>,
}

impl JobContext {
    fn new(
        progress: Option<ProgressCallback>,
        cancel: CancelHandle,
        slice_total: Option<u64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(JobState::default()),
            progress,
            slice_total,
            cancel,
            fatal: Mutex::new(None),
        })
    }

    fn record_success(&self, slice: SliceKey, rows: u64) {
        let cumulative = {
            let mut state = self.state.lock();
            state.total_rows += rows;
            state.successful += 1;
            state.total_rows
        };
        self.emit(ParallelFetchProgress {
            slice,
            slice_total: self.slice_total,
            rows,
            success: true,
            error: None,
            cumulative_rows: cumulative,
        });
    }

    fn record_failure(&self, slice: SliceKey, error: MixpanelError) {
        warn!(slice = %slice, kind = kind_of(&error), %error, "slice failed");
        let message = error.to_string();
        let cumulative = {
            let mut state = self.state.lock();
            state.failed += 1;
            state.failed_keys.push(slice);
            state.total_rows
        };
        self.emit(ParallelFetchProgress {
            slice,
            slice_total: self.slice_total,
            rows: 0,
            success: false,
            error: Some(message),
            cumulative_rows: cumulative,
        });
        if error.is_fatal_for_job() {
            *self.fatal.lock() = Some(error);
            self.cancel.cancel();
        }
    }

    fn emit(&self, progress: ParallelFetchProgress) {
        if let Some(callback) = &self.progress {
            callback(progress);
        }
    }

    fn into_result(self: Arc<Self>, table: &str, started: Instant) -> Result<ParallelFetchResult> {
        if let Some(fatal) = self.fatal.lock().take() {
            return Err(fatal);
        }
        let mut state = self.state.lock();
        let mut failed_keys = std::mem::take(&mut state.failed_keys);
        failed_keys.sort();
        failed_keys.dedup();
        Ok(ParallelFetchResult {
            table: table.to_string(),
            total_rows: state.total_rows,
            successful_slices: state.successful,
            failed_slices: state.failed,
            failed_slice_keys: failed_keys,
            duration: started.elapsed(),
            fetched_at: Utc::now(),
        })
    }
}

fn kind_of(error: &MixpanelError) -> &'static str {
    match error {
        MixpanelError::AuthenticationFailed(_) => "auth",
        MixpanelError::RateLimited { .. } => "rate_limited",
        MixpanelError::Server(_) => "server",
        MixpanelError::Transport(_) => "transport",
        MixpanelError::Protocol(_) => "protocol",
        _ => "other",
    }
}

/// Producer/consumer fetcher over date shards (events) and page shards
/// (profiles).
#[derive(Debug)]
pub struct ParallelFetcher {
    transport: Arc<Transport>,
    storage: Arc<StorageEngine>,
}

impl ParallelFetcher {
    pub fn new(transport: Arc<Transport>, storage: Arc<StorageEngine>) -> Self {
        Self { transport, storage }
    }

    /// Fetch `[from, to]` one calendar day per slice.
    ///
    /// The output rows are independent of the worker count; ordering
    /// within the table is not part of the contract.
    pub async fn fetch_events(
        &self,
        name: &str,
        query: &EventExportQuery,
        options: &FetchOptions,
    ) -> Result<ParallelFetchResult> {
        let started = Instant::now();
        if query.from > query.to {
            return Err(MixpanelError::query(format!(
                "from {} is after to {}",
                query.from, query.to
            )));
        }

        let slices = days_inclusive(query.from, query.to);
        let workers = resolve_event_workers(options.workers).min(slices.len().max(1));
        warn_on_budget(slices.len() as u64, &RateBudget::EXPORT);

        prepare_table(
            &self.storage,
            name,
            TableKind::Events,
            options,
            query.where_expr.as_deref(),
        )?;

        let cancel = options.cancel.clone().unwrap_or_default();
        let ctx = JobContext::new(options.progress.clone(), cancel, Some(slices.len() as u64));
        info!(
            table = name,
            slices = slices.len(),
            workers,
            "parallel event fetch start"
        );

        let pending: Arc<Mutex<VecDeque<NaiveDate>>> =
            Arc::new(Mutex::new(slices.into_iter().collect()));
        let (tx, rx) = mpsc::channel::<WriteTask>(workers * 2);
        let writer = spawn_writer(self.storage.clone(), name.to_string(), rx, ctx.clone());

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let transport = self.transport.clone();
            let query = query.clone();
            let pending = pending.clone();
            let ctx = ctx.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    if ctx.cancel.is_cancelled() {
                        break;
                    }
                    let Some(day) = pending.lock().pop_front() else {
                        break;
                    };
                    let slice = SliceKey::Day(day);
                    match fetch_event_day(&transport, &query, day).await {
                        Ok(batch) => {
                            let task = WriteTask {
                                slice,
                                batch: RecordBatch::Events(batch),
                            };
                            if tx.send(task).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => ctx.record_failure(slice, e),
                    }
                }
            }));
        }
        drop(tx);

        for handle in handles {
            let _ = handle.await;
        }
        let _ = writer.await;

        // Slices never started (cancellation) count as failed.
        let leftover: Vec<NaiveDate> = pending.lock().drain(..).collect();
        for day in leftover {
            ctx.record_failure(
                SliceKey::Day(day),
                MixpanelError::transport("job cancelled before slice started"),
            );
        }

        let result = ctx.into_result(name, started)?;
        info!(
            table = name,
            total_rows = result.total_rows,
            successful = result.successful_slices,
            failed = result.failed_slices,
            elapsed_ms = result.duration.as_millis() as u64,
            "parallel event fetch complete"
        );
        Ok(result)
    }

    /// Fetch every profile page in parallel.
    ///
    /// Page 0 is probed first to obtain `{total, page_size, session_id}`;
    /// an authentication failure there fails the job before any table is
    /// created or worker scheduled. Remaining pages reuse the session for
    /// a consistent snapshot.
    pub async fn fetch_profiles(
        &self,
        name: &str,
        query: &ProfileExportQuery,
        options: &FetchOptions,
    ) -> Result<ParallelFetchResult> {
        let started = Instant::now();

        let page0 = self
            .transport
            .query_engage_page(&query.to_engage_query(0, None))
            .await?;
        let num_pages = page0.page_count().max(1);
        let workers = resolve_profile_workers(options.workers).min(num_pages as usize);
        let session_id = page0.session_id.clone();
        warn_on_budget(num_pages, &RateBudget::QUERY);

        prepare_table(
            &self.storage,
            name,
            TableKind::Profiles,
            options,
            query.where_expr.as_deref(),
        )?;

        let cancel = options.cancel.clone().unwrap_or_default();
        let ctx = JobContext::new(options.progress.clone(), cancel, Some(num_pages));
        info!(
            table = name,
            pages = num_pages,
            workers,
            "parallel profile fetch start"
        );

        let (tx, rx) = mpsc::channel::<WriteTask>(workers * 2);
        let writer = spawn_writer(self.storage.clone(), name.to_string(), rx, ctx.clone());

        // Page 0 was already fetched; it goes through the writer like any
        // other slice.
        match normalize_page(page0.results) {
            Ok(batch) => {
                let task = WriteTask {
                    slice: SliceKey::Page(0),
                    batch: RecordBatch::Profiles(batch),
                };
                if tx.send(task).await.is_err() {
                    ctx.record_failure(
                        SliceKey::Page(0),
                        MixpanelError::storage("writer stopped before page 0"),
                    );
                }
            }
            Err(e) => ctx.record_failure(SliceKey::Page(0), e),
        }

        let pending: Arc<Mutex<VecDeque<u64>>> =
            Arc::new(Mutex::new((1..num_pages).collect()));
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let transport = self.transport.clone();
            let query = query.clone();
            let session_id = session_id.clone();
            let pending = pending.clone();
            let ctx = ctx.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    if ctx.cancel.is_cancelled() {
                        break;
                    }
                    let Some(page) = pending.lock().pop_front() else {
                        break;
                    };
                    let slice = SliceKey::Page(page);
                    match fetch_profile_page(&transport, &query, &session_id, page).await {
                        Ok(batch) => {
                            let task = WriteTask {
                                slice,
                                batch: RecordBatch::Profiles(batch),
                            };
                            if tx.send(task).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => ctx.record_failure(slice, e),
                    }
                }
            }));
        }
        drop(tx);

        for handle in handles {
            let _ = handle.await;
        }
        let _ = writer.await;

        let leftover: Vec<u64> = pending.lock().drain(..).collect();
        for page in leftover {
            ctx.record_failure(
                SliceKey::Page(page),
                MixpanelError::transport("job cancelled before slice started"),
            );
        }

        let result = ctx.into_result(name, started)?;
        info!(
            table = name,
            total_rows = result.total_rows,
            successful = result.successful_slices,
            failed = result.failed_slices,
            elapsed_ms = result.duration.as_millis() as u64,
            "parallel profile fetch complete"
        );
        Ok(result)
    }
}

/// The single writer: drains the bounded queue and owns every storage
/// write. Runs on the blocking pool because DuckDB calls are synchronous.
fn spawn_writer(
    storage: Arc<StorageEngine>,
    table: String,
    mut rx: mpsc::Receiver<WriteTask>,
    ctx: Arc<JobContext>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while let Some(task) = rx.blocking_recv() {
            match storage.append_batch(&table, &task.batch) {
                Ok(rows) => ctx.record_success(task.slice, rows),
                Err(e) => ctx.record_failure(task.slice, e),
            }
        }
    })
}

async fn fetch_event_day(
    transport: &Transport,
    query: &EventExportQuery,
    day: NaiveDate,
) -> Result<Vec<crate::types::EventRecord>> {
    let day_query = EventExportQuery {
        from: day,
        to: day,
        events: query.events.clone(),
        where_expr: query.where_expr.clone(),
    };
    let mut stream = transport
        .stream_ndjson("/export", &day_query.to_params()?)
        .await?;
    let mut records = Vec::new();
    while let Some(value) = stream.next_value().await {
        records.push(normalize_event(value?)?);
    }
    Ok(records)
}

async fn fetch_profile_page(
    transport: &Transport,
    query: &ProfileExportQuery,
    session_id: &str,
    page: u64,
) -> Result<Vec<ProfileRecord>> {
    let engage = query.to_engage_query(page, Some(session_id.to_string()));
    let result = transport.query_engage_page(&engage).await?;
    normalize_page(result.results)
}

fn normalize_page(raw: Vec<crate::types::RawProfile>) -> Result<Vec<ProfileRecord>> {
    raw.into_iter()
        .map(|p| normalize_profile_parts(p.distinct_id, p.properties))
        .collect()
}

fn days_inclusive(from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut day = from;
    while day <= to {
        days.push(day);
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    days
}

/// Zero or absent requests fall back to the default; requests beyond the
/// engage concurrency cap are silently reduced and logged.
fn resolve_profile_workers(requested: Option<usize>) -> usize {
    let cap = RateBudget::QUERY.concurrent;
    match requested {
        None | Some(0) => DEFAULT_WORKERS.min(cap),
        Some(n) if n > cap => {
            warn!(requested = n, cap, "reducing profile workers to engage concurrency cap");
            cap
        }
        Some(n) => n,
    }
}

/// Event workers may exceed the recommended cap when asked explicitly, but
/// never the export API's concurrency allowance.
fn resolve_event_workers(requested: Option<usize>) -> usize {
    let hard_cap = RateBudget::EXPORT.concurrent;
    match requested {
        None | Some(0) => DEFAULT_WORKERS,
        Some(n) if n > hard_cap => {
            warn!(requested = n, cap = hard_cap, "reducing event workers to export concurrency cap");
            hard_cap
        }
        Some(n) => {
            if n > EVENT_WORKER_SOFT_CAP {
                warn!(
                    requested = n,
                    recommended = EVENT_WORKER_SOFT_CAP,
                    "event worker count exceeds the recommended cap"
                );
            }
            n
        }
    }
}

fn warn_on_budget(expected_requests: u64, budget: &RateBudget) {
    if expected_requests > budget.warning_threshold() {
        warn!(
            expected_requests,
            per_hour = budget.per_hour,
            "expected request count exceeds 80% of the hourly budget; consider narrowing the fetch"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_days_inclusive() {
        let from = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        let days = days_inclusive(from, to);
        assert_eq!(days.len(), 5);
        assert_eq!(days[0], from);
        assert_eq!(days[4], to);

        // from == to is a single slice
        assert_eq!(days_inclusive(from, from).len(), 1);
    }

    #[test]
    fn test_profile_worker_caps() {
        assert_eq!(resolve_profile_workers(None), 5);
        assert_eq!(resolve_profile_workers(Some(0)), 5);
        assert_eq!(resolve_profile_workers(Some(3)), 3);
        // silently reduced to the engage cap
        assert_eq!(resolve_profile_workers(Some(12)), 5);
    }

    #[test]
    fn test_event_worker_caps() {
        assert_eq!(resolve_event_workers(None), 5);
        assert_eq!(resolve_event_workers(Some(8)), 8);
        // explicit raises are honored up to the export allowance
        assert_eq!(resolve_event_workers(Some(20)), 20);
        assert_eq!(resolve_event_workers(Some(500)), 100);
    }
}
