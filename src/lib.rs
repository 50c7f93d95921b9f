#![cfg_attr(not(test), deny(clippy::unwrap_used))]

//! # mixpanel-data
//!
//! Embedded analytics workspace for the Mixpanel HTTP API: live analytical
//! queries, streaming bulk exports, and parallel ingestion into a local
//! DuckDB store you can query with arbitrary SQL.
//!
//! ## Quick start
//!
//! ```no_run
//! use mixpanel_data::{Credentials, Region, Workspace};
//! use mixpanel_data::live::SegmentationQuery;
//! use mixpanel_data::types::TimeUnit;
//!
//! #[tokio::main]
//! async fn main() -> mixpanel_data::Result<()> {
//!     let workspace = Workspace::builder()
//!         .credentials(Credentials::new("svc.user", "secret", "12345", Region::Us))
//!         .in_memory()
//!         .build()?;
//!
//!     let from = "2026-01-01".parse().unwrap();
//!     let to = "2026-01-31".parse().unwrap();
//!     let result = workspace
//!         .segmentation(&SegmentationQuery::new("signup", from, to, TimeUnit::Day))
//!         .await?;
//!     println!("{} signups", result.total);
//!     Ok(())
//! }
//! ```
//!
//! ## Fetching into the local store
//!
//! ```no_run
//! # use mixpanel_data::{Workspace, export::EventExportQuery, fetch::FetchOptions};
//! # async fn demo(workspace: Workspace) -> mixpanel_data::Result<()> {
//! let query = EventExportQuery::new(
//!     "2026-01-01".parse().unwrap(),
//!     "2026-01-05".parse().unwrap(),
//! );
//! let options = FetchOptions { workers: Some(3), ..Default::default() };
//! let result = workspace.fetch_events_parallel("jan_events", &query, &options).await?;
//! println!("{} rows across {} slices", result.total_rows, result.total_slices());
//!
//! let count = workspace.sql_scalar("SELECT COUNT(*) FROM jan_events")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`transport`]: authenticated, region-routed HTTP with bounded retry
//! - [`shape`]: pure Provider-envelope → typed-result mapping
//! - [`export`]: lazy single-pass event/profile export streams
//! - [`live`]: one method per analytical query endpoint
//! - [`storage`]: embedded DuckDB store with a single-writer discipline
//! - [`fetch`]: sequential and parallel (sharded producer/consumer) ingestion
//! - [`workspace`]: the facade owning one transport and one store

pub mod config;
pub mod error;
pub mod export;
pub mod fetch;
pub mod live;
pub mod shape;
pub mod storage;
pub mod transport;
pub mod types;
pub mod workspace;

pub use config::{Credentials, Region};
pub use error::{MixpanelError, Result};
pub use export::{EventExportQuery, ProfileExportQuery};
pub use fetch::{CancelHandle, FetchOptions, ProgressCallback};
pub use storage::{RecordBatch, StorageEngine};
pub use transport::{RateBudget, RetryPolicy, Transport, TransportConfig};
pub use types::{
    EventRecord, FetchResult, ParallelFetchProgress, ParallelFetchResult, ProfileRecord,
    SliceKey, TableKind, TableMetadata,
};
pub use workspace::{Workspace, WorkspaceBuilder};
