//! Sequential fetch: one export stream, batched inserts, one table.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::Result;
use crate::export::{EventStream, ProfileStream};
use crate::fetch::{prepare_table, FetchOptions};
use crate::storage::{RecordBatch, StorageEngine};
use crate::types::{FetchResult, TableKind};

/// Consumes an export stream record by record and writes batches of
/// `batch_size` rows. On any failure the partial table is preserved and
/// the error surfaces to the caller.
#[derive(Debug)]
pub struct SequentialFetcher {
    storage: Arc<StorageEngine>,
}

impl SequentialFetcher {
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        Self { storage }
    }

    /// Drain an event stream into `name`.
    pub async fn fetch_events(
        &self,
        name: &str,
        mut stream: EventStream,
        options: &FetchOptions,
        filter: Option<&str>,
    ) -> Result<FetchResult> {
        let started = Instant::now();
        let batch_size = options.effective_batch_size();
        prepare_table(&self.storage, name, TableKind::Events, options, filter)?;

        let mut batch = Vec::with_capacity(batch_size);
        let mut total = 0u64;
        while let Some(record) = stream.next().await {
            batch.push(record?);
            if batch.len() >= batch_size {
                total += self
                    .storage
                    .append_batch(name, &RecordBatch::Events(std::mem::take(&mut batch)))?;
                debug!(table = name, rows = total, "event batch committed");
            }
        }
        if !batch.is_empty() {
            total += self
                .storage
                .append_batch(name, &RecordBatch::Events(batch))?;
        }

        let result = FetchResult {
            table: name.to_string(),
            rows: total,
            duration: started.elapsed(),
            fetched_at: Utc::now(),
        };
        info!(
            table = name,
            rows = result.rows,
            elapsed_ms = result.duration.as_millis() as u64,
            "sequential event fetch complete"
        );
        Ok(result)
    }

    /// Drain a profile stream into `name`.
    pub async fn fetch_profiles(
        &self,
        name: &str,
        mut stream: ProfileStream,
        options: &FetchOptions,
        filter: Option<&str>,
    ) -> Result<FetchResult> {
        let started = Instant::now();
        let batch_size = options.effective_batch_size();
        prepare_table(&self.storage, name, TableKind::Profiles, options, filter)?;

        let mut batch = Vec::with_capacity(batch_size);
        let mut total = 0u64;
        while let Some(record) = stream.next().await {
            batch.push(record?);
            if batch.len() >= batch_size {
                total += self
                    .storage
                    .append_batch(name, &RecordBatch::Profiles(std::mem::take(&mut batch)))?;
                debug!(table = name, rows = total, "profile batch committed");
            }
        }
        if !batch.is_empty() {
            total += self
                .storage
                .append_batch(name, &RecordBatch::Profiles(batch))?;
        }

        let result = FetchResult {
            table: name.to_string(),
            rows: total,
            duration: started.elapsed(),
            fetched_at: Utc::now(),
        };
        info!(
            table = name,
            rows = result.rows,
            elapsed_ms = result.duration.as_millis() as u64,
            "sequential profile fetch complete"
        );
        Ok(result)
    }
}
