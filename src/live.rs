//! Live analytical queries, one method per Provider endpoint.
//!
//! Each method issues a single request through [`Transport`], applies the
//! matching [`shape`](crate::shape) function, and returns a typed result.
//! Unit parameters are closed enums, so out-of-range values fail before
//! any network I/O; filter (`where`) and `on` expressions are passed
//! verbatim and the Provider is the arbiter. An empty result is a
//! successful envelope with an empty series, not an error.

use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::{Map, Value};

use crate::error::{MixpanelError, Result};
use crate::shape;
use crate::transport::Transport;
use crate::types::{
    ActivityFeedResult, CohortInfo, FrequencyGranularity, FrequencyResult, FunnelInfo,
    FunnelResult, NumericAverageResult, NumericBucketResult, NumericSumResult, NumericUnit,
    RetentionInterval, RetentionResult, SavedReportInfo, SavedReportResult, SegmentationResult,
    TimeUnit, TopEvent,
};

// ─── Query parameter bundles ─────────────────────────────────────────────────

/// Parameters for a segmentation query.
#[derive(Debug, Clone)]
pub struct SegmentationQuery {
    pub event: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub unit: TimeUnit,
    /// Segmentation property expression.
    pub on: Option<String>,
    pub where_expr: Option<String>,
}

impl SegmentationQuery {
    pub fn new(event: impl Into<String>, from: NaiveDate, to: NaiveDate, unit: TimeUnit) -> Self {
        Self {
            event: event.into(),
            from,
            to,
            unit,
            on: None,
            where_expr: None,
        }
    }
}

/// Parameters for the numeric segmentation family (bucket, sum, average).
#[derive(Debug, Clone)]
pub struct NumericQuery {
    pub event: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    /// Property expression the aggregation runs over.
    pub on: String,
    pub unit: NumericUnit,
    pub where_expr: Option<String>,
}

/// Parameters for a funnel computation.
#[derive(Debug, Clone)]
pub struct FunnelQuery {
    pub from: NaiveDate,
    pub to: NaiveDate,
    /// Display name carried into the result; the compute endpoint does not
    /// echo it back.
    pub name: Option<String>,
}

/// Parameters for a retention query.
#[derive(Debug, Clone)]
pub struct RetentionQuery {
    pub born_event: String,
    /// The return event; `None` counts any event.
    pub return_event: Option<String>,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub interval: RetentionInterval,
    pub interval_count: u32,
    pub where_expr: Option<String>,
}

/// Parameters for a frequency ("addiction") query.
#[derive(Debug, Clone)]
pub struct FrequencyQuery {
    pub event: Option<String>,
    pub from: NaiveDate,
    pub to: NaiveDate,
    /// Outer bucket unit; day, week, or month only.
    pub unit: TimeUnit,
    pub granularity: FrequencyGranularity,
    pub where_expr: Option<String>,
}

/// Parameters for an activity-feed query.
#[derive(Debug, Clone)]
pub struct ActivityFeedQuery {
    pub distinct_ids: Vec<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

// ─── Service ─────────────────────────────────────────────────────────────────

/// Method-per-endpoint wrappers over the Provider's query API.
#[derive(Debug)]
pub struct LiveQueryService {
    transport: Arc<Transport>,
}

impl LiveQueryService {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    // ── Schema discovery ─────────────────────────────────────────────────

    /// Names of events seen by the project.
    pub async fn event_names(&self) -> Result<Vec<String>> {
        let value = self.transport.get_json("/query/events/names", &[]).await?;
        string_array(&value, "events/names")
    }

    /// Property names recorded on an event.
    pub async fn event_properties(&self, event: &str) -> Result<Vec<String>> {
        let params = vec![("event".to_string(), event.to_string())];
        let value = self
            .transport
            .get_json("/query/events/properties", &params)
            .await?;
        string_array(&value, "events/properties")
    }

    /// Property names recorded on user profiles.
    pub async fn profile_properties(&self) -> Result<Vec<String>> {
        let value = self
            .transport
            .get_json("/query/engage/properties", &[])
            .await?;
        // The engage properties endpoint keys its results by property name.
        let results = value
            .get("results")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                MixpanelError::protocol("engage/properties", "missing 'results' object")
            })?;
        Ok(results.keys().cloned().collect())
    }

    /// Properties of an event, or profile properties when no event is
    /// given.
    pub async fn list_properties(&self, event: Option<&str>) -> Result<Vec<String>> {
        match event {
            Some(event) => self.event_properties(event).await,
            None => self.profile_properties().await,
        }
    }

    /// Sample values recorded for an event property.
    pub async fn property_values(
        &self,
        event: &str,
        property: &str,
        limit: Option<u32>,
    ) -> Result<Vec<Value>> {
        let mut params = vec![
            ("event".to_string(), event.to_string()),
            ("name".to_string(), property.to_string()),
        ];
        if let Some(limit) = limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        let value = self
            .transport
            .get_json("/query/events/properties/values", &params)
            .await?;
        value
            .as_array()
            .cloned()
            .ok_or_else(|| MixpanelError::protocol("events/properties/values", "expected an array"))
    }

    /// Today's highest-volume events.
    pub async fn top_events(&self, limit: Option<u32>) -> Result<Vec<TopEvent>> {
        let mut params = Vec::new();
        if let Some(limit) = limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        let value = self.transport.get_json("/query/events/top", &params).await?;
        let events = value
            .get("events")
            .cloned()
            .ok_or_else(|| MixpanelError::protocol("events/top", "missing 'events'"))?;
        serde_json::from_value(events)
            .map_err(|e| MixpanelError::protocol("events/top", e.to_string()))
    }

    // ── Segmentation family ──────────────────────────────────────────────

    /// Event counts over time, optionally segmented by a property.
    pub async fn segmentation(&self, query: &SegmentationQuery) -> Result<SegmentationResult> {
        let mut params = vec![
            ("event".to_string(), query.event.clone()),
            ("from_date".to_string(), query.from.to_string()),
            ("to_date".to_string(), query.to.to_string()),
            ("unit".to_string(), query.unit.as_str().to_string()),
        ];
        if let Some(on) = &query.on {
            params.push(("on".to_string(), on.clone()));
        }
        if let Some(where_expr) = &query.where_expr {
            params.push(("where".to_string(), where_expr.clone()));
        }
        let value = self.transport.get_json("/query/segmentation", &params).await?;
        shape::shape_segmentation(
            &query.event,
            query.from,
            query.to,
            query.unit,
            query.on.as_deref(),
            &value,
        )
    }

    /// Event counts bucketed by a numeric property expression.
    pub async fn segmentation_numeric(&self, query: &NumericQuery) -> Result<NumericBucketResult> {
        let value = self
            .transport
            .get_json("/query/segmentation/numeric", &numeric_params(query))
            .await?;
        shape::shape_numeric_bucket(
            &query.event,
            query.from,
            query.to,
            &query.on,
            query.unit,
            &value,
        )
    }

    /// Per-bucket sum of a numeric property expression.
    pub async fn segmentation_sum(&self, query: &NumericQuery) -> Result<NumericSumResult> {
        let value = self
            .transport
            .get_json("/query/segmentation/sum", &numeric_params(query))
            .await?;
        shape::shape_numeric_sum(
            &query.event,
            query.from,
            query.to,
            &query.on,
            query.unit,
            &value,
        )
    }

    /// Per-bucket average of a numeric property expression.
    pub async fn segmentation_average(&self, query: &NumericQuery) -> Result<NumericAverageResult> {
        let value = self
            .transport
            .get_json("/query/segmentation/average", &numeric_params(query))
            .await?;
        shape::shape_numeric_average(
            &query.event,
            query.from,
            query.to,
            &query.on,
            query.unit,
            &value,
        )
    }

    /// Counts for several events at once. Returns event name → bucket
    /// start → count.
    pub async fn event_counts(
        &self,
        events: &[String],
        from: NaiveDate,
        to: NaiveDate,
        unit: TimeUnit,
    ) -> Result<Map<String, Value>> {
        let params = vec![
            ("event".to_string(), serde_json::to_string(events)?),
            ("from_date".to_string(), from.to_string()),
            ("to_date".to_string(), to.to_string()),
            ("unit".to_string(), unit.as_str().to_string()),
        ];
        let value = self
            .transport
            .get_json("/query/segmentation/multi", &params)
            .await?;
        let values = value
            .get("data")
            .and_then(|d| d.get("values"))
            .and_then(Value::as_object)
            .ok_or_else(|| {
                MixpanelError::protocol("segmentation/multi", "missing 'data.values'")
            })?;
        Ok(values.clone())
    }

    // ── Funnels ──────────────────────────────────────────────────────────

    /// Saved funnel definitions.
    pub async fn funnels_list(&self) -> Result<Vec<FunnelInfo>> {
        let value = self.transport.get_json("/query/funnels/list", &[]).await?;
        serde_json::from_value(value)
            .map_err(|e| MixpanelError::protocol("funnels/list", e.to_string()))
    }

    /// Compute a saved funnel over a date range.
    pub async fn funnel(&self, funnel_id: i64, query: &FunnelQuery) -> Result<FunnelResult> {
        let params = vec![
            ("funnel_id".to_string(), funnel_id.to_string()),
            ("from_date".to_string(), query.from.to_string()),
            ("to_date".to_string(), query.to.to_string()),
        ];
        let value = self.transport.get_json("/query/funnels", &params).await?;
        shape::shape_funnel(
            funnel_id,
            query.name.as_deref().unwrap_or_default(),
            query.from,
            query.to,
            &value,
        )
    }

    // ── Retention and frequency ──────────────────────────────────────────

    /// Cohort retention.
    pub async fn retention(&self, query: &RetentionQuery) -> Result<RetentionResult> {
        let mut params = vec![
            ("from_date".to_string(), query.from.to_string()),
            ("to_date".to_string(), query.to.to_string()),
            ("born_event".to_string(), query.born_event.clone()),
            ("interval_count".to_string(), query.interval_count.to_string()),
            ("unit".to_string(), query.interval.as_str().to_string()),
        ];
        if let Some(return_event) = &query.return_event {
            params.push(("event".to_string(), return_event.clone()));
        }
        if let Some(where_expr) = &query.where_expr {
            params.push(("where".to_string(), where_expr.clone()));
        }
        let value = self.transport.get_json("/query/retention", &params).await?;
        shape::shape_retention(
            &query.born_event,
            query.return_event.as_deref(),
            query.from,
            query.to,
            query.interval,
            query.interval_count,
            &value,
        )
    }

    /// Frequency of use ("addiction"): users active in at least N
    /// sub-periods per outer bucket.
    pub async fn frequency(&self, query: &FrequencyQuery) -> Result<FrequencyResult> {
        if matches!(query.unit, TimeUnit::Minute | TimeUnit::Hour) {
            return Err(MixpanelError::query(format!(
                "frequency unit must be day, week, or month, got {}",
                query.unit
            )));
        }

        let mut params = vec![
            ("from_date".to_string(), query.from.to_string()),
            ("to_date".to_string(), query.to.to_string()),
            ("unit".to_string(), query.unit.as_str().to_string()),
            (
                "addiction_unit".to_string(),
                query.granularity.as_str().to_string(),
            ),
        ];
        if let Some(event) = &query.event {
            params.push(("event".to_string(), event.clone()));
        }
        if let Some(where_expr) = &query.where_expr {
            params.push(("where".to_string(), where_expr.clone()));
        }
        let value = self
            .transport
            .get_json("/query/retention/properties", &params)
            .await?;
        shape::shape_frequency(
            query.event.as_deref(),
            query.from,
            query.to,
            query.unit,
            query.granularity,
            &value,
        )
    }

    // ── Activity feed ────────────────────────────────────────────────────

    /// Recent events for specific users, via the dedicated activity
    /// endpoint.
    pub async fn activity_feed(&self, query: &ActivityFeedQuery) -> Result<ActivityFeedResult> {
        if query.distinct_ids.is_empty() {
            return Err(MixpanelError::query(
                "activity_feed requires at least one distinct_id",
            ));
        }
        let mut params = vec![(
            "distinct_ids".to_string(),
            serde_json::to_string(&query.distinct_ids)?,
        )];
        if let Some(from) = query.from {
            params.push(("from_date".to_string(), from.to_string()));
        }
        if let Some(to) = query.to {
            params.push(("to_date".to_string(), to.to_string()));
        }
        let value = self.transport.get_json("/query/stream/query", &params).await?;
        shape::shape_activity_feed(&query.distinct_ids, query.from, query.to, &value)
    }

    // ── Cohorts, bookmarks, scripting ────────────────────────────────────

    /// Saved cohort definitions.
    pub async fn cohorts_list(&self) -> Result<Vec<CohortInfo>> {
        let value = self.transport.get_json("/query/cohorts/list", &[]).await?;
        serde_json::from_value(value)
            .map_err(|e| MixpanelError::protocol("cohorts/list", e.to_string()))
    }

    /// Saved report ("bookmark") listing, paged so the response stays
    /// bounded for large workspaces.
    pub async fn bookmarks_list(
        &self,
        page: u64,
        page_size: u64,
    ) -> Result<Vec<SavedReportInfo>> {
        let params = vec![
            ("page".to_string(), page.to_string()),
            ("page_size".to_string(), page_size.to_string()),
        ];
        let value = self.transport.get_json("/query/bookmarks/list", &params).await?;
        let results = value
            .get("results")
            .cloned()
            .ok_or_else(|| MixpanelError::protocol("bookmarks/list", "missing 'results'"))?;
        serde_json::from_value(results)
            .map_err(|e| MixpanelError::protocol("bookmarks/list", e.to_string()))
    }

    /// Re-execute a saved Insights report.
    pub async fn saved_report(&self, bookmark_id: i64) -> Result<SavedReportResult> {
        let params = vec![("bookmark_id".to_string(), bookmark_id.to_string())];
        let value = self.transport.get_json("/query/insights", &params).await?;
        shape::shape_saved_report(bookmark_id, &value)
    }

    /// Run a JQL script on the scripting endpoint.
    pub async fn jql(&self, script: &str, params: Option<&Value>) -> Result<Vec<Value>> {
        let mut form = vec![("script".to_string(), script.to_string())];
        if let Some(params) = params {
            form.push(("params".to_string(), serde_json::to_string(params)?));
        }
        let value = self.transport.post_form("/query/jql", &[], &form).await?;
        value
            .as_array()
            .cloned()
            .ok_or_else(|| MixpanelError::protocol("jql", "expected a JSON array"))
    }
}

fn numeric_params(query: &NumericQuery) -> Vec<(String, String)> {
    let mut params = vec![
        ("event".to_string(), query.event.clone()),
        ("from_date".to_string(), query.from.to_string()),
        ("to_date".to_string(), query.to.to_string()),
        ("on".to_string(), query.on.clone()),
        ("unit".to_string(), query.unit.as_str().to_string()),
    ];
    if let Some(where_expr) = &query.where_expr {
        params.push(("where".to_string(), where_expr.clone()));
    }
    params
}

fn string_array(value: &Value, context: &str) -> Result<Vec<String>> {
    value
        .as_array()
        .ok_or_else(|| MixpanelError::protocol(context, "expected an array"))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| MixpanelError::protocol(context, "expected string entries"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn test_frequency_rejects_sub_day_unit_before_io() {
        use crate::config::{Credentials, Region};
        use crate::transport::TransportConfig;

        // An unroutable base proves validation fires before any I/O.
        let transport = Transport::new(
            Credentials::new("u", "s", "1", Region::Us),
            TransportConfig {
                api_base: Some("http://127.0.0.1:1".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        let live = LiveQueryService::new(Arc::new(transport));

        let query = FrequencyQuery {
            event: None,
            from: date("2026-01-01"),
            to: date("2026-01-31"),
            unit: TimeUnit::Hour,
            granularity: FrequencyGranularity::Hour,
            where_expr: None,
        };
        let err = live.frequency(&query).await.unwrap_err();
        assert!(matches!(err, MixpanelError::Query(_)));
    }

    #[test]
    fn test_string_array_shapes() {
        let ok = string_array(&serde_json::json!(["a", "b"]), "t").unwrap();
        assert_eq!(ok, vec!["a", "b"]);
        assert!(string_array(&serde_json::json!({"a": 1}), "t").is_err());
        assert!(string_array(&serde_json::json!([1, 2]), "t").is_err());
    }
}
