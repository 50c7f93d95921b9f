//! Property-based tests for shaping invariants and the retry schedule.
//!
//! Uses proptest to generate random inputs and verify invariants hold
//! across a wide range of envelopes that the unit fixtures cannot cover.

use std::time::Duration;

use mixpanel_data::shape::{normalize_event, shape_funnel, shape_retention};
use mixpanel_data::transport::RetryPolicy;
use mixpanel_data::types::RetentionInterval;
use proptest::prelude::*;
use serde_json::json;

/// Strategy for monotonically non-increasing funnel step counts, the
/// shape the Provider guarantees.
fn funnel_counts() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..1_000_000, 1..8).prop_map(|mut counts| {
        counts.sort_unstable_by(|a, b| b.cmp(a));
        counts
    })
}

/// Strategy for one retention cohort: size plus per-period retained
/// counts, each bounded by the size.
fn cohort_entries() -> impl Strategy<Value = (u64, Vec<u64>)> {
    (1u64..100_000).prop_flat_map(|size| {
        let retained = prop::collection::vec(0u64..=size, 1..10).prop_map(move |mut periods| {
            // Period 0 is the cohort-defining period.
            periods[0] = size;
            periods
        });
        (Just(size), retained)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Funnel conversion rates stay in [0, 1] and overall conversion is
    /// last/first for non-increasing counts.
    #[test]
    fn funnel_rates_bounded(counts in funnel_counts()) {
        let steps: Vec<serde_json::Value> = counts
            .iter()
            .map(|c| json!({"goal": "step", "count": c}))
            .collect();
        let envelope = json!({"data": {"steps": steps}});
        let from = "2026-01-01".parse().unwrap();
        let to = "2026-01-31".parse().unwrap();
        let result = shape_funnel(1, "f", from, to, &envelope).unwrap();

        prop_assert!((0.0..=1.0).contains(&result.overall_conversion_rate));
        for step in &result.steps {
            prop_assert!((0.0..=1.0).contains(&step.conversion_rate));
        }
        let first = counts[0];
        let last = *counts.last().unwrap();
        if first > 0 {
            let expected = last as f64 / first as f64;
            prop_assert!((result.overall_conversion_rate - expected).abs() < 1e-9);
        } else {
            prop_assert_eq!(result.overall_conversion_rate, 0.0);
        }
    }

    /// Retention rates stay in [0, 1] and the cohort-defining period is
    /// 1.0 for non-empty cohorts.
    #[test]
    fn retention_rates_bounded((size, retained) in cohort_entries()) {
        let mut entry = serde_json::Map::new();
        entry.insert("count".to_string(), json!(size));
        for (i, r) in retained.iter().enumerate() {
            entry.insert(i.to_string(), json!(r));
        }
        let envelope = json!({"2026-01-01": entry});
        let from = "2026-01-01".parse().unwrap();
        let to = "2026-01-31".parse().unwrap();
        let result = shape_retention(
            "signup",
            None,
            from,
            to,
            RetentionInterval::Day,
            retained.len() as u32,
            &envelope,
        )
        .unwrap();

        let cohort = &result.cohorts[0];
        prop_assert_eq!(cohort.size, size);
        prop_assert!(cohort.retention.iter().all(|r| (0.0..=1.0).contains(r)));
        prop_assert_eq!(cohort.retention[0], 1.0);
        prop_assert_eq!(cohort.retention.len(), retained.len());
    }

    /// Every retry delay respects the exponential schedule and the
    /// cumulative wait is bounded by the sum of the per-attempt ceilings.
    #[test]
    fn retry_delays_bounded(
        base_ms in 1u64..2_000,
        max_ms in 1_000u64..120_000,
        attempts in 1u32..10,
    ) {
        let policy = RetryPolicy {
            max_attempts: attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
        };

        let mut cumulative = Duration::ZERO;
        let mut ceiling_sum = Duration::ZERO;
        for attempt in 1..=attempts {
            let exp = attempt.saturating_sub(1).min(16);
            let ceiling = Duration::from_millis(
                base_ms.saturating_mul(1u64 << exp).min(max_ms),
            );
            let delay = policy.delay_for_attempt(attempt);
            prop_assert!(delay <= ceiling);
            cumulative += delay;
            ceiling_sum += ceiling;
        }
        prop_assert!(cumulative <= ceiling_sum);
    }

    /// Normalization is idempotent for arbitrary property maps.
    #[test]
    fn normalization_idempotent(
        time in 0i64..4_102_444_800,
        distinct_id in "[a-z0-9]{1,12}",
        keys in prop::collection::vec("[a-z]{1,8}", 0..6),
    ) {
        let mut properties = serde_json::Map::new();
        properties.insert("time".to_string(), json!(time));
        properties.insert("distinct_id".to_string(), json!(distinct_id));
        for (i, key) in keys.iter().enumerate() {
            properties.insert(key.clone(), json!(i));
        }
        let raw = json!({"event": "e", "properties": properties});

        let once = normalize_event(raw).unwrap();
        let twice = normalize_event(serde_json::to_value(&once).unwrap()).unwrap();
        prop_assert_eq!(once, twice);
    }
}
