//! Integration tests for the live query surface against wiremock
//! fixtures, including the endpoint-routing contracts (frequency hits the
//! frequency endpoint, property listing without an event hits profile
//! properties, activity feed uses the dedicated stream endpoint).

mod common;

use common::test_workspace;
use mixpanel_data::live::{
    ActivityFeedQuery, FrequencyQuery, FunnelQuery, RetentionQuery, SegmentationQuery,
};
use mixpanel_data::types::{FrequencyGranularity, RetentionInterval, TimeUnit};
use mixpanel_data::MixpanelError;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn date(s: &str) -> chrono::NaiveDate {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_segmentation_small_fixture() {
    // Scenario A from the test plan.
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/query/segmentation"))
        .and(query_param("event", "signup"))
        .and(query_param("from_date", "2026-01-01"))
        .and(query_param("to_date", "2026-01-03"))
        .and(query_param("unit", "day"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "legend_size": 1,
            "data": {
                "series": ["2026-01-01", "2026-01-02", "2026-01-03"],
                "values": {
                    "signup": {"2026-01-01": 100, "2026-01-02": 150, "2026-01-03": 200}
                }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let workspace = test_workspace(&server);
    let result = workspace
        .segmentation(&SegmentationQuery::new(
            "signup",
            date("2026-01-01"),
            date("2026-01-03"),
            TimeUnit::Day,
        ))
        .await
        .unwrap();

    assert_eq!(result.total, 450);
    let series = result.series["signup"].as_object().unwrap();
    assert_eq!(series["2026-01-01"], 100);
    assert_eq!(series["2026-01-02"], 150);
    assert_eq!(series["2026-01-03"], 200);
}

#[tokio::test]
async fn test_funnel_conversion_rates() {
    // Scenario B: counts [1000, 400, 200].
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/query/funnels"))
        .and(query_param("funnel_id", "7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "steps": [
                    {"goal": "visit", "count": 1000},
                    {"goal": "signup", "count": 400},
                    {"goal": "purchase", "count": 200}
                ]
            }
        })))
        .mount(&server)
        .await;

    let workspace = test_workspace(&server);
    let result = workspace
        .funnel(
            7,
            &FunnelQuery {
                from: date("2026-01-01"),
                to: date("2026-01-31"),
                name: Some("checkout".into()),
            },
        )
        .await
        .unwrap();

    assert!((result.overall_conversion_rate - 0.20).abs() < 1e-9);
    assert!((result.steps[1].conversion_rate - 0.40).abs() < 1e-9);
    assert!((result.steps[2].conversion_rate - 0.50).abs() < 1e-9);
    // Counts are monotonically non-increasing.
    assert!(result
        .steps
        .windows(2)
        .all(|pair| pair[0].count >= pair[1].count));
}

#[tokio::test]
async fn test_frequency_routes_to_frequency_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/query/retention/properties"))
        .and(query_param("addiction_unit", "day"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"2026-01-01": [120, 45, 10]}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let workspace = test_workspace(&server);
    let result = workspace
        .frequency(&FrequencyQuery {
            event: Some("open_app".into()),
            from: date("2026-01-01"),
            to: date("2026-01-07"),
            unit: TimeUnit::Week,
            granularity: FrequencyGranularity::Day,
            where_expr: None,
        })
        .await
        .unwrap();

    let curve = result.data["2026-01-01"].as_array().unwrap();
    // Addiction curves are non-increasing.
    let counts: Vec<u64> = curve.iter().map(|v| v.as_u64().unwrap()).collect();
    assert!(counts.windows(2).all(|pair| pair[0] >= pair[1]));
}

#[tokio::test]
async fn test_retention_rates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/query/retention"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "2026-01-01": {"count": 100, "0": 100, "1": 40}
        })))
        .mount(&server)
        .await;

    let workspace = test_workspace(&server);
    let result = workspace
        .retention(&RetentionQuery {
            born_event: "signup".into(),
            return_event: None,
            from: date("2026-01-01"),
            to: date("2026-01-07"),
            interval: RetentionInterval::Day,
            interval_count: 7,
            where_expr: None,
        })
        .await
        .unwrap();

    let cohort = &result.cohorts[0];
    assert_eq!(cohort.retention[0], 1.0);
    assert!(cohort.retention.iter().all(|r| (0.0..=1.0).contains(r)));
}

#[tokio::test]
async fn test_list_properties_without_event_fetches_profile_properties() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/query/engage/properties"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": {"$email": {"count": 10}, "plan": {"count": 8}}
        })))
        .expect(1)
        .mount(&server)
        .await;
    // The event-properties endpoint must NOT be called.
    Mock::given(method("GET"))
        .and(path("/query/events/properties"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let workspace = test_workspace(&server);
    let properties = workspace.list_properties(None).await.unwrap();
    assert!(properties.contains(&"$email".to_string()));
    assert!(properties.contains(&"plan".to_string()));
}

#[tokio::test]
async fn test_list_properties_with_event() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/query/events/properties"))
        .and(query_param("event", "signup"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["plan", "seats"])))
        .expect(1)
        .mount(&server)
        .await;

    let workspace = test_workspace(&server);
    let properties = workspace.list_properties(Some("signup")).await.unwrap();
    assert_eq!(properties, vec!["plan", "seats"]);
}

#[tokio::test]
async fn test_activity_feed_uses_stream_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/query/stream/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": {
                "events": [
                    {"event": "login", "properties": {"time": 1767225600}},
                    {"event": "purchase", "properties": {"time": 1767229200, "amount": 9.5}}
                ]
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let workspace = test_workspace(&server);
    let feed = workspace
        .activity_feed(&ActivityFeedQuery {
            distinct_ids: vec!["u1".into()],
            from: None,
            to: None,
        })
        .await
        .unwrap();
    assert_eq!(feed.events.len(), 2);
    assert_eq!(feed.events[1].properties["amount"], 9.5);
}

#[tokio::test]
async fn test_activity_feed_requires_ids() {
    let server = MockServer::start().await;
    let workspace = test_workspace(&server);
    let err = workspace
        .activity_feed(&ActivityFeedQuery {
            distinct_ids: vec![],
            from: None,
            to: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MixpanelError::Query(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_bookmarks_list_is_paged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/query/bookmarks/list"))
        .and(query_param("page", "2"))
        .and(query_param("page_size", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"id": 42, "name": "Weekly signups", "type": "insights"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let workspace = test_workspace(&server);
    let bookmarks = workspace.bookmarks_list(2, 50).await.unwrap();
    assert_eq!(bookmarks.len(), 1);
    assert_eq!(bookmarks[0].id, 42);
    assert_eq!(bookmarks[0].report_type, "insights");
}

#[tokio::test]
async fn test_saved_report() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/query/insights"))
        .and(query_param("bookmark_id", "42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "computed_at": "2026-02-01T10:00:00",
            "date_range": {"from_date": "2026-01-01", "to_date": "2026-01-31"},
            "headers": ["$event"],
            "series": {"signup": {"2026-01-01": 12}}
        })))
        .mount(&server)
        .await;

    let workspace = test_workspace(&server);
    let report = workspace.saved_report(42).await.unwrap();
    assert_eq!(report.bookmark_id, 42);
    assert_eq!(report.series["signup"]["2026-01-01"], 12);
}

#[tokio::test]
async fn test_jql_posts_script() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query/jql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"key": "a", "value": 1}])))
        .expect(1)
        .mount(&server)
        .await;

    let workspace = test_workspace(&server);
    let rows = workspace
        .jql("function main() { return Events({}).groupBy(['name'], mixpanel.reducer.count()); }", None)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["value"], 1);
}

#[tokio::test]
async fn test_empty_segmentation_is_success_not_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/query/segmentation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "legend_size": 0,
            "data": {"series": [], "values": {}}
        })))
        .mount(&server)
        .await;

    let workspace = test_workspace(&server);
    let result = workspace
        .segmentation(&SegmentationQuery::new(
            "ghost_event",
            date("2026-01-01"),
            date("2026-01-01"),
            TimeUnit::Day,
        ))
        .await
        .unwrap();
    assert_eq!(result.total, 0);
    assert!(result.series.is_empty());
}
