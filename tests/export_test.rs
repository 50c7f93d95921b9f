//! Integration tests for the streaming export surface: NDJSON event
//! export and page-concatenating profile export.

mod common;

use common::{day_body, engage_page_body, event_line, test_workspace};
use mixpanel_data::export::{EventExportQuery, ProfileExportQuery};
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn date(s: &str) -> chrono::NaiveDate {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_stream_events_normalizes_lazily() {
    let server = MockServer::start().await;
    let body = format!(
        "{}\n\n{}\n",
        event_line("signup", "u1", "a-1", 1767225600),
        event_line("purchase", "u2", "a-2", 1767229200),
    );
    Mock::given(method("GET"))
        .and(path("/export"))
        .and(query_param("from_date", "2026-01-01"))
        .and(query_param("to_date", "2026-01-01"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/plain"))
        .mount(&server)
        .await;

    let workspace = test_workspace(&server);
    let mut stream = workspace
        .stream_events(&EventExportQuery::new(date("2026-01-01"), date("2026-01-01")))
        .await
        .unwrap();

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.name, "signup");
    assert_eq!(first.distinct_id, "u1");
    assert_eq!(first.insert_id, "a-1");
    assert_eq!(first.time.timestamp(), 1767225600);
    assert_eq!(first.properties["plan"], "pro");
    assert!(!first.properties.contains_key("distinct_id"));

    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second.name, "purchase");

    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_stream_events_raw_is_byte_equivalent_to_body() {
    let server = MockServer::start().await;
    let lines = vec![
        event_line("signup", "u1", "a-1", 1767225600),
        event_line("login", "u2", "a-2", 1767225601),
    ];
    Mock::given(method("GET"))
        .and(path("/export"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(lines.join("\n"), "text/plain"))
        .mount(&server)
        .await;

    let workspace = test_workspace(&server);
    let mut stream = workspace
        .stream_events_raw(&EventExportQuery::new(date("2026-01-01"), date("2026-01-01")))
        .await
        .unwrap();

    for line in &lines {
        let value = stream.next().await.unwrap().unwrap();
        let expected: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value, expected);
    }
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_stream_events_sends_event_list_as_json_array() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/export"))
        .and(query_param("event", "[\"signup\",\"login\"]"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(day_body("2026-01-01", 2), "text/plain"))
        .expect(1)
        .mount(&server)
        .await;

    let workspace = test_workspace(&server);
    let mut query = EventExportQuery::new(date("2026-01-01"), date("2026-01-01"));
    query.events = Some(vec!["signup".into(), "login".into()]);
    let mut stream = workspace.stream_events(&query).await.unwrap();
    let mut rows = 0;
    while let Some(record) = stream.next().await {
        record.unwrap();
        rows += 1;
    }
    assert_eq!(rows, 2);
}

#[tokio::test]
async fn test_stream_profiles_concatenates_pages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query/engage"))
        .and(body_string_contains("page=0"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(engage_page_body(1500, 0, 1000, 1000, "S1")),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/query/engage"))
        .and(body_string_contains("page=1"))
        .and(body_string_contains("session_id=S1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(engage_page_body(1500, 1, 1000, 500, "S1")),
        )
        .mount(&server)
        .await;

    let workspace = test_workspace(&server);
    let mut stream = workspace
        .stream_profiles(&ProfileExportQuery::default())
        .await
        .unwrap();

    let mut count = 0;
    let mut first_distinct_id = None;
    while let Some(record) = stream.next().await {
        let record = record.unwrap();
        if first_distinct_id.is_none() {
            first_distinct_id = Some(record.distinct_id.clone());
            assert!(record.last_seen.is_some());
            assert!(!record.properties.contains_key("$last_seen"));
        }
        count += 1;
    }
    assert_eq!(count, 1500);
    assert_eq!(first_distinct_id.as_deref(), Some("p0"));
    // Both pages were requested, in order, reusing the session.
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_stream_profiles_empty_export() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query/engage"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(engage_page_body(0, 0, 1000, 0, "S1")),
        )
        .mount(&server)
        .await;

    let workspace = test_workspace(&server);
    let mut stream = workspace
        .stream_profiles(&ProfileExportQuery::default())
        .await
        .unwrap();
    assert!(stream.next().await.is_none());
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_stream_surfaces_error_on_first_access() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query/engage"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "bad where expression"
        })))
        .mount(&server)
        .await;

    let workspace = test_workspace(&server);
    let mut stream = workspace
        .stream_profiles(&ProfileExportQuery {
            where_expr: Some("nonsense(".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let err = stream.next().await.unwrap().unwrap_err();
    assert!(err.to_string().contains("bad where expression"));
}
