//! Pure mapping from Provider JSON envelopes to typed results.
//!
//! Every function here is total over well-formed envelopes and raises
//! [`MixpanelError::Protocol`] for malformed ones (missing required keys,
//! wrong value kinds). Nothing in this module performs I/O.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{MixpanelError, Result};
use crate::types::{
    ActivityFeedResult, EventRecord, FrequencyGranularity, FrequencyResult, FunnelResult,
    FunnelStepReport, NumericAverageResult, NumericBucketResult, NumericSumResult, NumericUnit,
    ProfileRecord, RetentionCohort, RetentionInterval, RetentionResult, SavedReportResult,
    SegmentationResult, TimeUnit, UserEvent,
};

// ─── Envelope access helpers ─────────────────────────────────────────────────

fn as_object<'a>(value: &'a Value, context: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| MixpanelError::protocol(context, "expected a JSON object"))
}

fn get<'a>(map: &'a Map<String, Value>, key: &str, context: &str) -> Result<&'a Value> {
    map.get(key)
        .ok_or_else(|| MixpanelError::protocol(context, format!("missing key '{}'", key)))
}

/// Counts arrive as integers but occasionally as floats; accept both.
fn as_count(value: &Value, context: &str) -> Result<u64> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    if let Some(f) = value.as_f64() {
        if f >= 0.0 {
            return Ok(f as u64);
        }
    }
    Err(MixpanelError::protocol(
        context,
        format!("expected a non-negative count, got {}", value),
    ))
}

/// Parse an instant from epoch seconds (integer or float) or a datetime
/// string. Mixpanel renders profile timestamps without a zone suffix.
fn parse_instant(value: &Value, context: &str) -> Result<DateTime<Utc>> {
    if let Some(secs) = value.as_i64() {
        return DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| MixpanelError::protocol(context, format!("timestamp {} out of range", secs)));
    }
    if let Some(f) = value.as_f64() {
        return DateTime::from_timestamp(f as i64, 0)
            .ok_or_else(|| MixpanelError::protocol(context, format!("timestamp {} out of range", f)));
    }
    if let Some(s) = value.as_str() {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
            return Ok(naive.and_utc());
        }
    }
    Err(MixpanelError::protocol(
        context,
        format!("cannot interpret '{}' as an instant", value),
    ))
}

// ─── Record normalization ────────────────────────────────────────────────────

/// Normalize one exported event.
///
/// Lifts `distinct_id`, `time` (epoch seconds), and `$insert_id` out of the
/// property map, synthesizing a UUIDv4 insert id when the Provider did not
/// assign one. Idempotent: a value already in normalized shape passes
/// through unchanged.
pub fn normalize_event(value: Value) -> Result<EventRecord> {
    let obj = as_object(&value, "event")?;

    // Already-normalized records round-trip untouched.
    if obj.contains_key("name") && obj.contains_key("insert_id") {
        return serde_json::from_value(value)
            .map_err(|e| MixpanelError::protocol("event", e.to_string()));
    }

    let name = get(obj, "event", "event")?
        .as_str()
        .ok_or_else(|| MixpanelError::protocol("event", "'event' is not a string"))?
        .to_string();
    let mut properties = get(obj, "properties", "event")?
        .as_object()
        .ok_or_else(|| MixpanelError::protocol("event", "'properties' is not an object"))?
        .clone();

    let time_value = properties
        .remove("time")
        .ok_or_else(|| MixpanelError::protocol("event", "missing 'time' property"))?;
    let time = parse_instant(&time_value, "event.time")?;

    let distinct_id = match properties.remove("distinct_id") {
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    };

    let insert_id = match properties.remove("$insert_id") {
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => Uuid::new_v4().to_string(),
    };

    Ok(EventRecord {
        name,
        time,
        distinct_id,
        insert_id,
        properties,
    })
}

/// Normalize one exported profile, lifting `$distinct_id` and `$last_seen`.
/// Idempotent like [`normalize_event`].
pub fn normalize_profile(value: Value) -> Result<ProfileRecord> {
    let obj = as_object(&value, "profile")?;

    if obj.contains_key("distinct_id") && obj.contains_key("properties") {
        return serde_json::from_value(value)
            .map_err(|e| MixpanelError::protocol("profile", e.to_string()));
    }

    let distinct_id = get(obj, "$distinct_id", "profile")?
        .as_str()
        .ok_or_else(|| MixpanelError::protocol("profile", "'$distinct_id' is not a string"))?
        .to_string();
    let properties = obj
        .get("$properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    normalize_profile_parts(distinct_id, properties)
}

/// Normalization core shared with the paged profile stream, which already
/// holds the raw parts and needs no envelope detection.
pub(crate) fn normalize_profile_parts(
    distinct_id: String,
    mut properties: crate::types::Properties,
) -> Result<ProfileRecord> {
    let last_seen = match properties.remove("$last_seen") {
        Some(v) => Some(parse_instant(&v, "profile.$last_seen")?),
        None => None,
    };

    Ok(ProfileRecord {
        distinct_id,
        last_seen,
        properties,
    })
}

// ─── Live query envelopes ────────────────────────────────────────────────────

/// Shape a segmentation envelope:
/// `{"data": {"series": [...], "values": {<segment>: {<bucket>: count}}}}`.
/// When no segmentation property was given the outer key is the event name.
pub fn shape_segmentation(
    event: &str,
    from: NaiveDate,
    to: NaiveDate,
    unit: TimeUnit,
    on: Option<&str>,
    envelope: &Value,
) -> Result<SegmentationResult> {
    const CTX: &str = "segmentation";
    let obj = as_object(envelope, CTX)?;
    let data = as_object(get(obj, "data", CTX)?, CTX)?;
    let values = as_object(get(data, "values", CTX)?, CTX)?;

    let mut total = 0u64;
    for (segment, buckets) in values {
        let buckets = buckets.as_object().ok_or_else(|| {
            MixpanelError::protocol(CTX, format!("segment '{}' is not an object", segment))
        })?;
        for (bucket, count) in buckets {
            total += as_count(count, &format!("{}.{}.{}", CTX, segment, bucket))?;
        }
    }

    Ok(SegmentationResult {
        event: event.to_string(),
        from,
        to,
        unit,
        on: on.map(str::to_string),
        total,
        series: values.clone(),
    })
}

/// Shape a funnel envelope. The Provider reports steps per date under
/// `data`; counts are summed per step index across dates before conversion
/// rates are computed. A pre-aggregated `{"data": {"steps": [...]}}` shape
/// is accepted as well.
pub fn shape_funnel(
    funnel_id: i64,
    name: &str,
    from: NaiveDate,
    to: NaiveDate,
    envelope: &Value,
) -> Result<FunnelResult> {
    const CTX: &str = "funnel";
    let obj = as_object(envelope, CTX)?;
    let data = as_object(get(obj, "data", CTX)?, CTX)?;

    let mut names: Vec<String> = Vec::new();
    let mut counts: Vec<u64> = Vec::new();

    let mut fold_steps = |steps: &Value| -> Result<()> {
        let steps = steps
            .as_array()
            .ok_or_else(|| MixpanelError::protocol(CTX, "'steps' is not an array"))?;
        for (idx, step) in steps.iter().enumerate() {
            let step = as_object(step, CTX)?;
            let count = as_count(get(step, "count", CTX)?, CTX)?;
            let label = step
                .get("goal")
                .or_else(|| step.get("event"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if idx < counts.len() {
                counts[idx] += count;
            } else {
                counts.push(count);
                names.push(label);
            }
        }
        Ok(())
    };

    if data.contains_key("steps") {
        fold_steps(get(data, "steps", CTX)?)?;
    } else {
        for (date, per_date) in data {
            let per_date = per_date.as_object().ok_or_else(|| {
                MixpanelError::protocol(CTX, format!("entry for '{}' is not an object", date))
            })?;
            fold_steps(get(per_date, "steps", CTX)?)?;
        }
    }

    let first = counts.first().copied().unwrap_or(0);
    let steps: Vec<FunnelStepReport> = counts
        .iter()
        .enumerate()
        .map(|(idx, &count)| {
            let previous = if idx == 0 { count } else { counts[idx - 1] };
            let conversion_rate = if idx == 0 {
                1.0
            } else if previous == 0 {
                0.0
            } else {
                count as f64 / previous as f64
            };
            FunnelStepReport {
                event: names[idx].clone(),
                step: idx,
                count,
                conversion_rate,
            }
        })
        .collect();

    let overall_conversion_rate = match (steps.last(), first) {
        (None, _) | (_, 0) => 0.0,
        (Some(last), first) => last.count as f64 / first as f64,
    };

    Ok(FunnelResult {
        funnel_id,
        name: name.to_string(),
        from,
        to,
        overall_conversion_rate,
        steps,
    })
}

/// Shape a retention envelope: a mapping from cohort date to
/// `{"count": size, "0": retained, "1": retained, ...}`. Periods the
/// Provider has not yet reported are omitted from the rate array rather
/// than emitted as zero.
pub fn shape_retention(
    born_event: &str,
    return_event: Option<&str>,
    from: NaiveDate,
    to: NaiveDate,
    interval: RetentionInterval,
    interval_count: u32,
    envelope: &Value,
) -> Result<RetentionResult> {
    const CTX: &str = "retention";
    let obj = as_object(envelope, CTX)?;

    let mut cohorts = Vec::with_capacity(obj.len());
    for (cohort_date, entry) in obj {
        let entry = as_object(entry, CTX)?;
        let size = as_count(get(entry, "count", CTX)?, CTX)?;

        let mut retention = Vec::new();
        for period in 0..=interval_count {
            match entry.get(&period.to_string()) {
                Some(retained) => {
                    let retained = as_count(retained, CTX)?;
                    let rate = if size == 0 {
                        0.0
                    } else {
                        retained as f64 / size as f64
                    };
                    retention.push(rate);
                }
                None => break,
            }
        }

        cohorts.push(RetentionCohort {
            cohort_date: cohort_date.clone(),
            size,
            retention,
        });
    }

    Ok(RetentionResult {
        born_event: born_event.to_string(),
        return_event: return_event.map(str::to_string),
        from,
        to,
        interval,
        interval_count,
        cohorts,
    })
}

/// Shape a frequency envelope: `{"data": {<bucket>: [n0, n1, ...]}}` where
/// index N counts users active in at least N+1 sub-periods.
pub fn shape_frequency(
    event: Option<&str>,
    from: NaiveDate,
    to: NaiveDate,
    unit: TimeUnit,
    granularity: FrequencyGranularity,
    envelope: &Value,
) -> Result<FrequencyResult> {
    const CTX: &str = "frequency";
    let obj = as_object(envelope, CTX)?;
    let data = as_object(get(obj, "data", CTX)?, CTX)?;

    for (bucket, curve) in data {
        let curve = curve.as_array().ok_or_else(|| {
            MixpanelError::protocol(CTX, format!("bucket '{}' is not an array", bucket))
        })?;
        for entry in curve {
            as_count(entry, &format!("{}.{}", CTX, bucket))?;
        }
    }

    Ok(FrequencyResult {
        event: event.map(str::to_string),
        from,
        to,
        unit,
        granularity,
        data: data.clone(),
    })
}

/// Shape a numeric bucketing envelope; identical wire shape to
/// segmentation, with Provider-assigned bucket labels as the outer keys.
/// Label order is preserved.
pub fn shape_numeric_bucket(
    event: &str,
    from: NaiveDate,
    to: NaiveDate,
    on: &str,
    unit: NumericUnit,
    envelope: &Value,
) -> Result<NumericBucketResult> {
    const CTX: &str = "segmentation/numeric";
    let obj = as_object(envelope, CTX)?;
    let data = as_object(get(obj, "data", CTX)?, CTX)?;
    let values = as_object(get(data, "values", CTX)?, CTX)?;

    for (label, buckets) in values {
        let buckets = buckets.as_object().ok_or_else(|| {
            MixpanelError::protocol(CTX, format!("bucket '{}' is not an object", label))
        })?;
        for (bucket, count) in buckets {
            as_count(count, &format!("{}.{}.{}", CTX, label, bucket))?;
        }
    }

    Ok(NumericBucketResult {
        event: event.to_string(),
        from,
        to,
        on: on.to_string(),
        unit,
        series: values.clone(),
    })
}

/// Shape a numeric sum envelope: `{"results": {<bucket>: sum}, "computed_at"?}`.
pub fn shape_numeric_sum(
    event: &str,
    from: NaiveDate,
    to: NaiveDate,
    on: &str,
    unit: NumericUnit,
    envelope: &Value,
) -> Result<NumericSumResult> {
    const CTX: &str = "segmentation/sum";
    let obj = as_object(envelope, CTX)?;
    let results = as_object(get(obj, "results", CTX)?, CTX)?;

    for (bucket, v) in results {
        if !v.is_number() {
            return Err(MixpanelError::protocol(
                CTX,
                format!("bucket '{}' is not numeric", bucket),
            ));
        }
    }

    let computed_at = match obj.get("computed_at") {
        Some(Value::Null) | None => None,
        Some(v) => Some(parse_instant(v, CTX)?),
    };

    Ok(NumericSumResult {
        event: event.to_string(),
        from,
        to,
        on: on.to_string(),
        unit,
        results: results.clone(),
        computed_at,
    })
}

/// Shape a numeric average envelope: `{"results": {<bucket>: avg}}`.
pub fn shape_numeric_average(
    event: &str,
    from: NaiveDate,
    to: NaiveDate,
    on: &str,
    unit: NumericUnit,
    envelope: &Value,
) -> Result<NumericAverageResult> {
    const CTX: &str = "segmentation/average";
    let obj = as_object(envelope, CTX)?;
    let results = as_object(get(obj, "results", CTX)?, CTX)?;

    for (bucket, v) in results {
        if !v.is_number() {
            return Err(MixpanelError::protocol(
                CTX,
                format!("bucket '{}' is not numeric", bucket),
            ));
        }
    }

    Ok(NumericAverageResult {
        event: event.to_string(),
        from,
        to,
        on: on.to_string(),
        unit,
        results: results.clone(),
    })
}

/// Shape a saved Insights report envelope.
pub fn shape_saved_report(bookmark_id: i64, envelope: &Value) -> Result<SavedReportResult> {
    const CTX: &str = "insights";
    let obj = as_object(envelope, CTX)?;

    let computed_at = parse_instant(get(obj, "computed_at", CTX)?, CTX)?;
    let date_range = as_object(get(obj, "date_range", CTX)?, CTX)?;
    let from = parse_date(get(date_range, "from_date", CTX)?, CTX)?;
    let to = parse_date(get(date_range, "to_date", CTX)?, CTX)?;

    let headers = get(obj, "headers", CTX)?
        .as_array()
        .ok_or_else(|| MixpanelError::protocol(CTX, "'headers' is not an array"))?
        .iter()
        .map(|h| {
            h.as_str()
                .map(str::to_string)
                .ok_or_else(|| MixpanelError::protocol(CTX, "non-string header"))
        })
        .collect::<Result<Vec<_>>>()?;

    let series = as_object(get(obj, "series", CTX)?, CTX)?.clone();
    let report_type = obj
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("insights")
        .to_string();

    Ok(SavedReportResult {
        bookmark_id,
        report_type,
        computed_at,
        from,
        to,
        headers,
        series,
    })
}

/// Shape an activity-feed envelope:
/// `{"results": {"events": [{"event": ..., "properties": {..., "time": secs}}]}}`.
pub fn shape_activity_feed(
    distinct_ids: &[String],
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    envelope: &Value,
) -> Result<ActivityFeedResult> {
    const CTX: &str = "activity_feed";
    let obj = as_object(envelope, CTX)?;
    let results = as_object(get(obj, "results", CTX)?, CTX)?;
    let raw_events = get(results, "events", CTX)?
        .as_array()
        .ok_or_else(|| MixpanelError::protocol(CTX, "'events' is not an array"))?;

    let mut events = Vec::with_capacity(raw_events.len());
    for raw in raw_events {
        let raw = as_object(raw, CTX)?;
        let name = get(raw, "event", CTX)?
            .as_str()
            .ok_or_else(|| MixpanelError::protocol(CTX, "'event' is not a string"))?
            .to_string();
        let mut properties = raw
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let time_value = properties
            .remove("time")
            .ok_or_else(|| MixpanelError::protocol(CTX, "event missing 'time'"))?;
        let time = parse_instant(&time_value, CTX)?;
        events.push(UserEvent {
            name,
            time,
            properties,
        });
    }

    Ok(ActivityFeedResult {
        distinct_ids: distinct_ids.to_vec(),
        from,
        to,
        events,
    })
}

fn parse_date(value: &Value, context: &str) -> Result<NaiveDate> {
    let s = value
        .as_str()
        .ok_or_else(|| MixpanelError::protocol(context, "expected a date string"))?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| MixpanelError::protocol(context, format!("invalid date '{}'", s)))
}
