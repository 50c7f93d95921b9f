//! Shared fixtures for the integration suite: a workspace wired to a
//! wiremock server with fast retries.
#![allow(dead_code)]

use std::time::Duration;

use mixpanel_data::transport::{RetryPolicy, TransportConfig};
use mixpanel_data::{Credentials, Region, Workspace};
use tracing_subscriber::EnvFilter;
use wiremock::MockServer;

pub const TEST_SECRET: &str = "test-secret-do-not-log";

/// Initialize test logging. Safe to call from every test; only the first
/// call installs the subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("mixpanel_data=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// Retry policy with real bounds but negligible delays.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

pub fn test_transport_config(server: &MockServer) -> TransportConfig {
    init_logging();
    TransportConfig {
        timeout: Duration::from_secs(5),
        idle_read_timeout: Duration::from_secs(5),
        retry: fast_retry(),
        api_base: Some(server.uri()),
        export_base: Some(server.uri()),
    }
}

/// In-memory workspace pointed at the mock server.
pub fn test_workspace(server: &MockServer) -> Workspace {
    Workspace::builder()
        .credentials(Credentials::new(
            "svc.test",
            TEST_SECRET,
            "12345",
            Region::Us,
        ))
        .in_memory()
        .transport_config(test_transport_config(server))
        .build()
        .expect("workspace should build")
}

/// An exported event line for NDJSON fixtures.
pub fn event_line(event: &str, distinct_id: &str, insert_id: &str, time: i64) -> String {
    format!(
        "{{\"event\":\"{}\",\"properties\":{{\"time\":{},\"distinct_id\":\"{}\",\"$insert_id\":\"{}\",\"plan\":\"pro\"}}}}",
        event, time, distinct_id, insert_id
    )
}

/// An NDJSON body with `rows` events for one calendar day.
pub fn day_body(day: &str, rows: usize) -> String {
    // Noon UTC on the given day keeps every record inside the slice.
    let base = chrono::NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap()
        .and_utc()
        .timestamp();
    let mut body = String::new();
    for i in 0..rows {
        body.push_str(&event_line(
            "signup",
            &format!("u{}", i),
            &format!("{}-{}", day, i),
            base + i as i64,
        ));
        body.push('\n');
    }
    body
}

/// An engage page body with `count` profiles starting at `offset`.
pub fn engage_page_body(
    total: u64,
    page: u64,
    page_size: u64,
    count: u64,
    session_id: &str,
) -> serde_json::Value {
    let offset = page * page_size;
    let results: Vec<serde_json::Value> = (0..count)
        .map(|i| {
            serde_json::json!({
                "$distinct_id": format!("p{}", offset + i),
                "$properties": {"$last_seen": "2026-01-15T08:30:00", "plan": "pro"}
            })
        })
        .collect();
    serde_json::json!({
        "results": results,
        "total": total,
        "page": page,
        "page_size": page_size,
        "session_id": session_id,
    })
}
