//! Streaming bulk export of events and profiles.
//!
//! Both exports are finite, single-pass sequences: records are decoded
//! lazily as the Provider produces them, and re-iterating requires a fresh
//! call. Dropping a stream mid-iteration releases the underlying HTTP
//! connection. Errors surface on first record access or mid-stream, never
//! at stream construction for body-level failures.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::Value;

use crate::error::Result;
use crate::shape::{normalize_event, normalize_profile_parts};
use crate::transport::{EngageQuery, NdjsonStream, Transport};
use crate::types::{EventRecord, ProfileRecord, RawProfile};

/// Parameters for a bulk event export.
#[derive(Debug, Clone)]
pub struct EventExportQuery {
    /// First calendar day, inclusive, in the project timezone.
    pub from: NaiveDate,
    /// Last calendar day, inclusive.
    pub to: NaiveDate,
    /// Restrict to these event names.
    pub events: Option<Vec<String>>,
    /// Provider-side filter expression, passed verbatim.
    pub where_expr: Option<String>,
}

impl EventExportQuery {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            from,
            to,
            events: None,
            where_expr: None,
        }
    }

    pub(crate) fn to_params(&self) -> Result<Vec<(String, String)>> {
        let mut params = vec![
            ("from_date".to_string(), self.from.to_string()),
            ("to_date".to_string(), self.to.to_string()),
        ];
        if let Some(events) = &self.events {
            params.push(("event".to_string(), serde_json::to_string(events)?));
        }
        if let Some(where_expr) = &self.where_expr {
            params.push(("where".to_string(), where_expr.clone()));
        }
        Ok(params)
    }
}

/// Parameters for a paged profile export.
#[derive(Debug, Clone, Default)]
pub struct ProfileExportQuery {
    /// Provider-side filter expression, passed verbatim.
    pub where_expr: Option<String>,
    /// Restrict to members of this saved cohort.
    pub cohort_id: Option<String>,
    /// Projection of profile properties to return.
    pub output_properties: Option<Vec<String>>,
}

impl ProfileExportQuery {
    pub(crate) fn to_engage_query(&self, page: u64, session_id: Option<String>) -> EngageQuery {
        EngageQuery {
            page,
            session_id,
            where_expr: self.where_expr.clone(),
            cohort_id: self.cohort_id.clone(),
            output_properties: self.output_properties.clone(),
        }
    }
}

/// Iterator-producing methods over [`Transport`] for the bulk endpoints.
#[derive(Debug)]
pub struct ExportService {
    transport: Arc<Transport>,
}

impl ExportService {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    /// Stream normalized events from the export endpoint.
    pub async fn stream_events(&self, query: &EventExportQuery) -> Result<EventStream> {
        let inner = self
            .transport
            .stream_ndjson("/export", &query.to_params()?)
            .await?;
        Ok(EventStream { inner })
    }

    /// Stream events exactly as the Provider's NDJSON body decodes them.
    pub async fn stream_events_raw(&self, query: &EventExportQuery) -> Result<RawEventStream> {
        let inner = self
            .transport
            .stream_ndjson("/export", &query.to_params()?)
            .await?;
        Ok(RawEventStream { inner })
    }

    /// Stream normalized profiles, concatenating engage pages transparently.
    pub async fn stream_profiles(&self, query: &ProfileExportQuery) -> Result<ProfileStream> {
        Ok(ProfileStream {
            inner: RawProfileStream::new(self.transport.clone(), query.clone()),
        })
    }

    /// Stream profiles exactly as the engage endpoint produced them.
    pub async fn stream_profiles_raw(&self, query: &ProfileExportQuery) -> Result<RawProfileStream> {
        Ok(RawProfileStream::new(self.transport.clone(), query.clone()))
    }
}

/// Lazy sequence of normalized [`EventRecord`]s.
pub struct EventStream {
    inner: NdjsonStream,
}

impl EventStream {
    /// Next record, or `None` at end of data.
    pub async fn next(&mut self) -> Option<Result<EventRecord>> {
        let value = self.inner.next_value().await?;
        Some(value.and_then(normalize_event))
    }
}

/// Lazy sequence of raw event envelopes.
pub struct RawEventStream {
    inner: NdjsonStream,
}

impl RawEventStream {
    pub async fn next(&mut self) -> Option<Result<Value>> {
        self.inner.next_value().await
    }
}

/// Lazy sequence of raw profiles across engage pages.
///
/// Page 0 establishes a `session_id`; every subsequent page reuses it so
/// the Provider serves a consistent snapshot.
pub struct RawProfileStream {
    transport: Arc<Transport>,
    query: ProfileExportQuery,
    session_id: Option<String>,
    next_page: u64,
    buffer: VecDeque<RawProfile>,
    done: bool,
}

impl RawProfileStream {
    fn new(transport: Arc<Transport>, query: ProfileExportQuery) -> Self {
        Self {
            transport,
            query,
            session_id: None,
            next_page: 0,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    pub async fn next(&mut self) -> Option<Result<RawProfile>> {
        loop {
            if let Some(profile) = self.buffer.pop_front() {
                return Some(Ok(profile));
            }
            if self.done {
                return None;
            }

            let engage = self
                .query
                .to_engage_query(self.next_page, self.session_id.clone());
            let page = match self.transport.query_engage_page(&engage).await {
                Ok(page) => page,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            self.session_id = Some(page.session_id.clone());
            self.next_page = page.page + 1;
            if page.results.is_empty() || self.next_page >= page.page_count() {
                self.done = true;
            }
            self.buffer.extend(page.results);
        }
    }
}

/// Lazy sequence of normalized [`ProfileRecord`]s across engage pages.
pub struct ProfileStream {
    inner: RawProfileStream,
}

impl ProfileStream {
    pub async fn next(&mut self) -> Option<Result<ProfileRecord>> {
        let raw = self.inner.next().await?;
        Some(raw.and_then(|p| normalize_profile_parts(p.distinct_id, p.properties)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_event_query_params() {
        let mut query = EventExportQuery::new(date("2026-01-01"), date("2026-01-05"));
        query.events = Some(vec!["signup".into(), "purchase".into()]);
        query.where_expr = Some("properties[\"plan\"] == \"pro\"".into());

        let params = query.to_params().unwrap();
        assert!(params.contains(&("from_date".into(), "2026-01-01".into())));
        assert!(params.contains(&("to_date".into(), "2026-01-05".into())));
        // Event lists are serialized as JSON arrays.
        assert!(params.contains(&("event".into(), "[\"signup\",\"purchase\"]".into())));
        assert!(params.iter().any(|(k, _)| k == "where"));
    }

    #[test]
    fn test_profile_query_carries_session() {
        let query = ProfileExportQuery {
            cohort_id: Some("77".into()),
            ..Default::default()
        };
        let engage = query.to_engage_query(3, Some("sess-1".into()));
        assert_eq!(engage.page, 3);
        assert_eq!(engage.session_id.as_deref(), Some("sess-1"));
        assert_eq!(engage.cohort_id.as_deref(), Some("77"));
    }
}
