//! Fetchers: pull exported data into the local store.
//!
//! [`SequentialFetcher`] consumes one export stream record by record with
//! batched inserts. [`ParallelFetcher`] shards the export across workers
//! (calendar days for events, engage pages for profiles) and funnels every
//! write through a single writer task, honoring the storage engine's
//! single-writer invariant.

mod parallel;
mod sequential;

pub use parallel::ParallelFetcher;
pub use sequential::SequentialFetcher;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{MixpanelError, Result};
use crate::storage::StorageEngine;
use crate::types::{ParallelFetchProgress, TableKind};

/// Rows per INSERT/COMMIT cycle.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Callback invoked once per completed slice, in completion order.
pub type ProgressCallback = Arc<dyn Fn(ParallelFetchProgress) + Send + Sync + 'static>;

/// Cooperative cancellation for a fetch job.
///
/// Cancelling stops the scheduling of new slices; in-flight slices drain,
/// the writer finishes its current batch, and slices never started are
/// reported in `failed_slice_keys`. Data for completed slices stays on
/// disk.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Options shared by every fetch entry point.
#[derive(Clone, Default)]
pub struct FetchOptions {
    /// Append to an existing table instead of creating one.
    pub append: bool,
    /// Drop and recreate the table if it already exists.
    pub replace: bool,
    /// Worker count for parallel fetches; `None` or 0 uses the default.
    pub workers: Option<usize>,
    /// Rows per insert batch; 0 uses [`DEFAULT_BATCH_SIZE`].
    pub batch_size: usize,
    /// Per-slice progress callback (parallel fetches).
    pub progress: Option<ProgressCallback>,
    /// Cooperative cancellation handle (parallel fetches).
    pub cancel: Option<CancelHandle>,
}

impl FetchOptions {
    pub(crate) fn effective_batch_size(&self) -> usize {
        if self.batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            self.batch_size
        }
    }
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("append", &self.append)
            .field("replace", &self.replace)
            .field("workers", &self.workers)
            .field("batch_size", &self.batch_size)
            .field("progress", &self.progress.is_some())
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

/// Create or validate the target table before any record is fetched.
///
/// Appending requires the table to exist with the matching kind; anything
/// else goes through table creation, which enforces the replace
/// precondition.
pub(crate) fn prepare_table(
    storage: &StorageEngine,
    name: &str,
    kind: TableKind,
    options: &FetchOptions,
    filter: Option<&str>,
) -> Result<()> {
    if options.append && options.replace {
        return Err(MixpanelError::config(
            "append and replace are mutually exclusive",
        ));
    }
    if options.append {
        let meta = storage.metadata(name)?;
        if meta.kind != kind {
            return Err(MixpanelError::storage(format!(
                "table '{}' holds {}, cannot append {}",
                name,
                meta.kind.as_str(),
                kind.as_str()
            )));
        }
        return Ok(());
    }
    storage.create_table(name, kind, options.replace, filter)
}
