//! HTTP transport for the Provider API.
//!
//! One [`Transport`] per workspace owns one pooled `reqwest::Client`.
//! Every request carries HTTP basic auth derived from the credentials, the
//! `project_id` query parameter, and a JSON accept header; export bodies
//! are consumed as byte streams and decoded line by line.
//!
//! Retry discipline: connection errors, HTTP 5xx, and HTTP 429 are retried
//! up to the policy's attempt bound with jittered exponential backoff; a
//! `Retry-After` header takes precedence on 429. 401/403 and other 4xx are
//! never retried. The credentials secret never appears in a log event.

mod ndjson;
mod retry;

pub use ndjson::NdjsonStream;
pub use retry::RetryPolicy;

use std::time::{Duration, Instant};

use futures_util::TryStreamExt;
use reqwest::header::{HeaderValue, ACCEPT, RETRY_AFTER};
use reqwest::{Method, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::Credentials;
use crate::error::{MixpanelError, Result};
use crate::types::EngagePage;

/// Advisory request budget for one Provider API family.
///
/// Transport does not enforce these; the fetchers consult them to cap
/// worker counts and to warn when a job is likely to exhaust the hourly
/// allowance.
#[derive(Debug, Clone, Copy)]
pub struct RateBudget {
    /// Maximum concurrent requests the Provider accepts.
    pub concurrent: usize,
    /// Requests allowed per hour.
    pub per_hour: u64,
    /// Requests allowed per second, where the Provider caps it.
    pub per_second: Option<u64>,
}

impl RateBudget {
    /// Query API: 5 concurrent, 60 per hour.
    pub const QUERY: RateBudget = RateBudget {
        concurrent: 5,
        per_hour: 60,
        per_second: None,
    };

    /// Export API: 100 concurrent, 60 per hour, 3 per second.
    pub const EXPORT: RateBudget = RateBudget {
        concurrent: 100,
        per_hour: 60,
        per_second: Some(3),
    };

    /// Request count above which a job should warn (80 % of the hourly
    /// allowance).
    pub fn warning_threshold(&self) -> u64 {
        self.per_hour * 4 / 5
    }
}

/// Transport construction options.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-request timeout for JSON endpoints.
    pub timeout: Duration,
    /// Idle-read timeout for streamed export bodies.
    pub idle_read_timeout: Duration,
    /// Retry discipline.
    pub retry: RetryPolicy,
    /// Override the query API base URL (tests).
    pub api_base: Option<String>,
    /// Override the export base URL (tests).
    pub export_base: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            idle_read_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            api_base: None,
            export_base: None,
        }
    }
}

/// Parameters for one page of the engage (profile export) endpoint.
#[derive(Debug, Clone, Default)]
pub struct EngageQuery {
    pub page: u64,
    /// Session from a prior page, for result consistency across pages.
    pub session_id: Option<String>,
    pub where_expr: Option<String>,
    pub cohort_id: Option<String>,
    /// Projection of profile properties to return.
    pub output_properties: Option<Vec<String>>,
}

/// Outcome of a single request attempt.
enum Attempt {
    Success(Response),
    Retry {
        error: MixpanelError,
        delay_hint: Option<Duration>,
    },
    Fatal(MixpanelError),
}

/// Process-wide HTTP client for the Provider, configured for connection
/// reuse and shared by every component of a workspace.
#[derive(Debug)]
pub struct Transport {
    http: reqwest::Client,
    credentials: Credentials,
    config: TransportConfig,
}

impl Transport {
    pub fn new(credentials: Credentials, config: TransportConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| MixpanelError::transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            credentials,
            config,
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn api_url(&self, path: &str) -> String {
        let base = self
            .config
            .api_base
            .as_deref()
            .unwrap_or_else(|| self.credentials.region.api_base());
        format!("{}{}", base, path)
    }

    fn export_url(&self, path: &str) -> String {
        let base = self
            .config
            .export_base
            .as_deref()
            .unwrap_or_else(|| self.credentials.region.export_base());
        format!("{}{}", base, path)
    }

    /// Query parameters with `project_id` appended.
    fn with_project(&self, query: &[(String, String)]) -> Vec<(String, String)> {
        let mut params = Vec::with_capacity(query.len() + 1);
        params.push(("project_id".to_string(), self.credentials.project_id.clone()));
        params.extend_from_slice(query);
        params
    }

    /// GET a JSON endpoint under the query API base.
    pub async fn get_json(&self, path: &str, query: &[(String, String)]) -> Result<Value> {
        let response = self
            .send_with_retry(Method::GET, self.api_url(path), query, None, path, true)
            .await?;
        Self::parse_json_body(response, path).await
    }

    /// POST a form-encoded body to a JSON endpoint under the query API base.
    pub async fn post_form(
        &self,
        path: &str,
        query: &[(String, String)],
        form: &[(String, String)],
    ) -> Result<Value> {
        let response = self
            .send_with_retry(Method::POST, self.api_url(path), query, Some(form), path, true)
            .await?;
        Self::parse_json_body(response, path).await
    }

    /// GET a newline-delimited JSON endpoint under the export base and
    /// return a lazy decoder over its body.
    ///
    /// Retry applies to establishing the response; once the body is
    /// streaming, failures surface through the stream itself. The total
    /// request timeout is not applied: a bulk export may legitimately run
    /// long, and staleness is caught by the idle-read timeout instead.
    pub async fn stream_ndjson(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<NdjsonStream> {
        let response = self
            .send_with_retry(Method::GET, self.export_url(path), query, None, path, false)
            .await?;
        let bytes = response
            .bytes_stream()
            .map_err(|e| MixpanelError::transport(format!("export body read failed: {}", e)));
        Ok(NdjsonStream::new(bytes, self.config.idle_read_timeout))
    }

    /// Fetch one page of the engage endpoint, surfacing the full paging
    /// envelope for the parallel fetcher.
    pub async fn query_engage_page(&self, query: &EngageQuery) -> Result<EngagePage> {
        let mut form = vec![("page".to_string(), query.page.to_string())];
        if let Some(session_id) = &query.session_id {
            form.push(("session_id".to_string(), session_id.clone()));
        }
        if let Some(where_expr) = &query.where_expr {
            form.push(("where".to_string(), where_expr.clone()));
        }
        if let Some(cohort_id) = &query.cohort_id {
            form.push(("filter_by_cohort".to_string(), format!("{{\"id\":{}}}", cohort_id)));
        }
        if let Some(props) = &query.output_properties {
            form.push((
                "output_properties".to_string(),
                serde_json::to_string(props)?,
            ));
        }

        let value = self.post_form("/query/engage", &[], &form).await?;
        serde_json::from_value(value)
            .map_err(|e| MixpanelError::protocol("engage", e.to_string()))
    }

    async fn send_with_retry(
        &self,
        method: Method,
        url: String,
        query: &[(String, String)],
        form: Option<&[(String, String)]>,
        endpoint: &str,
        total_timeout: bool,
    ) -> Result<Response> {
        let params = self.with_project(query);
        let policy = &self.config.retry;
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(endpoint, attempt, "provider request");

            let mut builder = self
                .http
                .request(method.clone(), &url)
                .basic_auth(&self.credentials.username, Some(&self.credentials.secret))
                .header(ACCEPT, HeaderValue::from_static("application/json"))
                .query(&params);
            if total_timeout {
                builder = builder.timeout(self.config.timeout);
            }
            if let Some(form) = form {
                builder = builder.form(form);
            }

            let outcome = match builder.send().await {
                Ok(response) => Self::classify_response(response, endpoint).await,
                Err(e) => Attempt::Retry {
                    error: MixpanelError::transport(format!("{}: {}", endpoint, e)),
                    delay_hint: None,
                },
            };

            match outcome {
                Attempt::Success(response) => {
                    debug!(
                        endpoint,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "provider request complete"
                    );
                    return Ok(response);
                }
                Attempt::Fatal(error) => {
                    error!(
                        endpoint,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        kind = error_kind(&error),
                        %error,
                        "provider request failed"
                    );
                    return Err(error);
                }
                Attempt::Retry { error, delay_hint } => {
                    if policy.is_exhausted(attempt) {
                        error!(
                            endpoint,
                            attempt,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            kind = error_kind(&error),
                            %error,
                            "provider request failed, retries exhausted"
                        );
                        return Err(error);
                    }
                    let delay = delay_hint.unwrap_or_else(|| policy.delay_for_attempt(attempt));
                    warn!(
                        endpoint,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        kind = error_kind(&error),
                        %error,
                        "provider request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn classify_response(response: Response, endpoint: &str) -> Attempt {
        let status = response.status();

        if status.is_success() {
            return Attempt::Success(response);
        }

        let retry_after = parse_retry_after(&response);
        let message = server_message(response, endpoint).await;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Attempt::Fatal(MixpanelError::authentication(message));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = retry_after.map(|d| d.as_secs()).unwrap_or(60);
            return Attempt::Retry {
                error: MixpanelError::rate_limited(retry_after_secs),
                delay_hint: retry_after,
            };
        }
        if status.is_server_error() {
            return Attempt::Retry {
                error: MixpanelError::server(message),
                delay_hint: None,
            };
        }
        Attempt::Fatal(MixpanelError::query(message))
    }

    async fn parse_json_body(response: Response, endpoint: &str) -> Result<Value> {
        let body = response
            .text()
            .await
            .map_err(|e| MixpanelError::transport(format!("{}: body read failed: {}", endpoint, e)))?;
        serde_json::from_str(&body)
            .map_err(|e| MixpanelError::protocol(endpoint, format!("invalid JSON body: {}", e)))
    }
}

/// The server's own error message when the body carries one, else the
/// status line plus a truncated body.
async fn server_message(response: Response, endpoint: &str) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if let Ok(value) = serde_json::from_str::<Value>(&body) {
        if let Some(msg) = value.get("error").and_then(Value::as_str) {
            return format!("{}: {}", endpoint, msg);
        }
    }
    let preview: String = body.chars().take(200).collect();
    format!("{}: HTTP {} {}", endpoint, status.as_u16(), preview)
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn error_kind(error: &MixpanelError) -> &'static str {
    match error {
        MixpanelError::AuthenticationFailed(_) => "auth",
        MixpanelError::RateLimited { .. } => "rate_limited",
        MixpanelError::Query(_) => "query",
        MixpanelError::Server(_) => "server",
        MixpanelError::Transport(_) => "transport",
        MixpanelError::Protocol(_) => "protocol",
        _ => "other",
    }
}
