//! Record and result value types.
//!
//! Everything the Provider returns is shaped into one of the types here
//! before it reaches the caller. All result values are plain owned data,
//! deeply immutable after construction; tabular conversion is a caller
//! concern and deliberately not part of this crate.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::MixpanelError;

/// Open property map with heterogeneous values, preserving Provider
/// iteration order.
pub type Properties = Map<String, Value>;

// ─── Time unit enums ─────────────────────────────────────────────────────────

/// Bucket width for segmentation-style queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl TimeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Minute => "minute",
            TimeUnit::Hour => "hour",
            TimeUnit::Day => "day",
            TimeUnit::Week => "week",
            TimeUnit::Month => "month",
        }
    }
}

impl FromStr for TimeUnit {
    type Err = MixpanelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" => Ok(TimeUnit::Minute),
            "hour" => Ok(TimeUnit::Hour),
            "day" => Ok(TimeUnit::Day),
            "week" => Ok(TimeUnit::Week),
            "month" => Ok(TimeUnit::Month),
            other => Err(MixpanelError::query(format!(
                "invalid unit '{}', expected minute, hour, day, week, or month",
                other
            ))),
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cohort interval for retention queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionInterval {
    Day,
    Week,
    Month,
}

impl RetentionInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionInterval::Day => "day",
            RetentionInterval::Week => "week",
            RetentionInterval::Month => "month",
        }
    }
}

impl FromStr for RetentionInterval {
    type Err = MixpanelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(RetentionInterval::Day),
            "week" => Ok(RetentionInterval::Week),
            "month" => Ok(RetentionInterval::Month),
            other => Err(MixpanelError::query(format!(
                "invalid retention interval '{}', expected day, week, or month",
                other
            ))),
        }
    }
}

/// Sub-period granularity for frequency ("addiction") queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyGranularity {
    Hour,
    Day,
}

impl FrequencyGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrequencyGranularity::Hour => "hour",
            FrequencyGranularity::Day => "day",
        }
    }
}

impl FromStr for FrequencyGranularity {
    type Err = MixpanelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(FrequencyGranularity::Hour),
            "day" => Ok(FrequencyGranularity::Day),
            other => Err(MixpanelError::query(format!(
                "invalid granularity '{}', expected hour or day",
                other
            ))),
        }
    }
}

/// Bucket width for numeric aggregation queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericUnit {
    Hour,
    Day,
}

impl NumericUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            NumericUnit::Hour => "hour",
            NumericUnit::Day => "day",
        }
    }
}

impl FromStr for NumericUnit {
    type Err = MixpanelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(NumericUnit::Hour),
            "day" => Ok(NumericUnit::Day),
            other => Err(MixpanelError::query(format!(
                "invalid unit '{}', expected hour or day",
                other
            ))),
        }
    }
}

// ─── Records ─────────────────────────────────────────────────────────────────

/// A raw event exactly as the export endpoint produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub event: String,
    pub properties: Properties,
}

/// A normalized event record.
///
/// `distinct_id`, `time`, and `$insert_id` are lifted out of the property
/// map; the map retains every other property verbatim. Events without a
/// Provider-assigned `$insert_id` get a synthesized UUIDv4.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event name.
    pub name: String,
    /// Event time in UTC.
    pub time: DateTime<Utc>,
    /// The acting user/device identifier.
    pub distinct_id: String,
    /// Deduplication identifier; synthesized when absent.
    pub insert_id: String,
    /// Remaining event properties.
    pub properties: Properties,
}

/// A raw profile exactly as the engage endpoint produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawProfile {
    #[serde(rename = "$distinct_id")]
    pub distinct_id: String,
    #[serde(rename = "$properties", default)]
    pub properties: Properties,
}

/// A normalized user profile record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub distinct_id: String,
    /// Last-seen instant, when the profile carries `$last_seen`.
    pub last_seen: Option<DateTime<Utc>>,
    /// Remaining profile properties (excludes `$last_seen`).
    pub properties: Properties,
}

// ─── Live query results ──────────────────────────────────────────────────────

/// Result of a segmentation query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationResult {
    pub event: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub unit: TimeUnit,
    /// The segmentation property expression, when one was given.
    pub on: Option<String>,
    /// Sum of every count in `series`.
    pub total: u64,
    /// Segment value (or event name when unsegmented) → bucket start → count.
    pub series: Map<String, Value>,
}

/// One step of a computed funnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelStepReport {
    pub event: String,
    /// Zero-based position in the funnel.
    pub step: usize,
    /// Users reaching this step.
    pub count: u64,
    /// `count / previous step count`; 1.0 for the first step.
    pub conversion_rate: f64,
}

/// Result of a funnel computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelResult {
    pub funnel_id: i64,
    pub name: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    /// `last step count / first step count`; 1.0 for a one-step funnel,
    /// 0.0 for an empty one.
    pub overall_conversion_rate: f64,
    pub steps: Vec<FunnelStepReport>,
}

/// A saved funnel definition, from the funnel listing endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelInfo {
    pub funnel_id: i64,
    pub name: String,
}

/// One birth cohort of a retention query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionCohort {
    /// Cohort-defining date (bucket start).
    pub cohort_date: String,
    /// Cohort size.
    pub size: u64,
    /// Retention rate per elapsed interval; index 0 is the cohort-defining
    /// period. Not-yet-elapsed periods are omitted, never emitted as zero.
    pub retention: Vec<f64>,
}

/// Result of a retention query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionResult {
    pub born_event: String,
    pub return_event: Option<String>,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub interval: RetentionInterval,
    pub interval_count: u32,
    pub cohorts: Vec<RetentionCohort>,
}

/// One event on a user's activity feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEvent {
    pub name: String,
    pub time: DateTime<Utc>,
    pub properties: Properties,
}

/// Result of an activity-feed query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityFeedResult {
    pub distinct_ids: Vec<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    /// Events in Provider order.
    pub events: Vec<UserEvent>,
}

/// Result of a frequency ("addiction") query.
///
/// `data` maps each outer bucket start to an array where index N counts
/// users who performed the event in at least N+1 sub-periods of
/// `granularity`; the array is non-increasing by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyResult {
    pub event: Option<String>,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub unit: TimeUnit,
    pub granularity: FrequencyGranularity,
    pub data: Map<String, Value>,
}

/// Result of a numeric bucketing query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericBucketResult {
    pub event: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    /// Property expression the buckets were computed over.
    pub on: String,
    pub unit: NumericUnit,
    /// Provider-assigned bucket label (e.g. `"0 - 100"`) → bucket start →
    /// count, in Provider iteration order.
    pub series: Map<String, Value>,
}

/// Result of a numeric sum query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericSumResult {
    pub event: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub on: String,
    pub unit: NumericUnit,
    /// Bucket start → sum.
    pub results: Map<String, Value>,
    pub computed_at: Option<DateTime<Utc>>,
}

/// Result of a numeric average query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericAverageResult {
    pub event: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub on: String,
    pub unit: NumericUnit,
    /// Bucket start → average.
    pub results: Map<String, Value>,
}

/// A saved report ("bookmark") listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedReportInfo {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub report_type: String,
}

/// Result of executing a saved Insights report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedReportResult {
    pub bookmark_id: i64,
    pub report_type: String,
    pub computed_at: DateTime<Utc>,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub headers: Vec<String>,
    /// Series label → bucket start → count.
    pub series: Map<String, Value>,
}

/// An event ranked by the top-events endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopEvent {
    pub event: String,
    pub amount: u64,
    #[serde(default)]
    pub percent_change: Option<f64>,
}

/// A saved cohort definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortInfo {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub description: Option<String>,
}

// ─── Storage metadata ────────────────────────────────────────────────────────

/// What a locally stored table holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Events,
    Profiles,
}

impl TableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableKind::Events => "events",
            TableKind::Profiles => "profiles",
        }
    }
}

impl FromStr for TableKind {
    type Err = MixpanelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "events" => Ok(TableKind::Events),
            "profiles" => Ok(TableKind::Profiles),
            other => Err(MixpanelError::storage(format!(
                "unknown table kind '{}'",
                other
            ))),
        }
    }
}

/// Per-table bookkeeping persisted in the `_metadata` system table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub name: String,
    pub kind: TableKind,
    pub rows: u64,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
    /// First covered calendar day (events only).
    pub from: Option<NaiveDate>,
    /// Last covered calendar day (events only).
    pub to: Option<NaiveDate>,
    /// The `where` expression used at fetch time, when one was given.
    pub filter: Option<String>,
}

/// One column of a stored table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
}

/// Statistics over one column of a stored table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub column: String,
    pub count: u64,
    pub nulls: u64,
    pub distinct: u64,
    pub min: Option<Value>,
    pub max: Option<Value>,
}

/// Column names plus row values produced by an arbitrary SQL query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl SqlResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

// ─── Fetch results ───────────────────────────────────────────────────────────

/// Result of a sequential fetch into the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub table: String,
    pub rows: u64,
    pub duration: Duration,
    pub fetched_at: DateTime<Utc>,
}

/// A unit of parallel work: one calendar day for events, one engage page
/// for profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceKey {
    Day(NaiveDate),
    Page(u64),
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SliceKey::Day(d) => write!(f, "{}", d),
            SliceKey::Page(p) => write!(f, "page {}", p),
        }
    }
}

/// Progress report emitted once per completed slice, in completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelFetchProgress {
    pub slice: SliceKey,
    /// Total number of slices in the job, when known up front.
    pub slice_total: Option<u64>,
    /// Rows persisted for this slice (0 on failure).
    pub rows: u64,
    pub success: bool,
    /// Failure detail; `None` exactly when `success` is true.
    pub error: Option<String>,
    /// Rows persisted by the whole job so far.
    pub cumulative_rows: u64,
}

/// Aggregate result of a parallel fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelFetchResult {
    pub table: String,
    pub total_rows: u64,
    pub successful_slices: u64,
    pub failed_slices: u64,
    /// Keys of failed slices, ordered and unique, for caller-driven retry.
    pub failed_slice_keys: Vec<SliceKey>,
    pub duration: Duration,
    pub fetched_at: DateTime<Utc>,
}

impl ParallelFetchResult {
    pub fn total_slices(&self) -> u64 {
        self.successful_slices + self.failed_slices
    }

    pub fn has_failures(&self) -> bool {
        self.failed_slices > 0
    }
}

/// One page of the engage (profile export) endpoint, surfaced verbatim for
/// the parallel fetcher's paging logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagePage {
    pub results: Vec<RawProfile>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
    pub session_id: String,
}

impl EngagePage {
    /// Number of pages the full export spans.
    pub fn page_count(&self) -> u64 {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(self.page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_unit_round_trip() {
        for unit in ["minute", "hour", "day", "week", "month"] {
            assert_eq!(unit.parse::<TimeUnit>().unwrap().as_str(), unit);
        }
        assert!(matches!(
            "fortnight".parse::<TimeUnit>(),
            Err(MixpanelError::Query(_))
        ));
    }

    #[test]
    fn test_invalid_units_fail_as_query_errors() {
        assert!(matches!(
            "year".parse::<RetentionInterval>(),
            Err(MixpanelError::Query(_))
        ));
        assert!(matches!(
            "minute".parse::<FrequencyGranularity>(),
            Err(MixpanelError::Query(_))
        ));
        assert!(matches!(
            "week".parse::<NumericUnit>(),
            Err(MixpanelError::Query(_))
        ));
    }

    #[test]
    fn test_parallel_result_accounting() {
        let result = ParallelFetchResult {
            table: "events".into(),
            total_rows: 4000,
            successful_slices: 4,
            failed_slices: 1,
            failed_slice_keys: vec![SliceKey::Day(
                NaiveDate::from_ymd_opt(2026, 1, 3).unwrap(),
            )],
            duration: Duration::from_secs(3),
            fetched_at: Utc::now(),
        };
        assert_eq!(result.total_slices(), 5);
        assert!(result.has_failures());
        assert_eq!(
            result.failed_slice_keys.len() as u64,
            result.failed_slices
        );
    }

    #[test]
    fn test_engage_page_count() {
        let page = |total, page_size| EngagePage {
            results: vec![],
            total,
            page: 0,
            page_size,
            session_id: "s".into(),
        };
        assert_eq!(page(2500, 1000).page_count(), 3);
        assert_eq!(page(1000, 1000).page_count(), 1);
        assert_eq!(page(0, 1000).page_count(), 0);
        assert_eq!(page(10, 0).page_count(), 0);
    }

    #[test]
    fn test_slice_key_display() {
        let day = SliceKey::Day(NaiveDate::from_ymd_opt(2026, 1, 3).unwrap());
        assert_eq!(day.to_string(), "2026-01-03");
        assert_eq!(SliceKey::Page(4).to_string(), "page 4");
    }

    #[test]
    fn test_raw_profile_deserializes_provider_shape() {
        let raw: RawProfile = serde_json::from_value(serde_json::json!({
            "$distinct_id": "u1",
            "$properties": {"$last_seen": "2026-01-01T00:00:00", "plan": "pro"}
        }))
        .unwrap();
        assert_eq!(raw.distinct_id, "u1");
        assert_eq!(raw.properties["plan"], "pro");
    }
}
