//! Minimal REST implementation of [`ApiClient`].
//!
//! Speaks the management server's JSON query dialect: offset-paginated
//! `GET {base}/{resource}.json` with `firstResult`/`maxResults`, records
//! wrapped one level deep under `queryResponse.entity`. Authentication is
//! HTTP basic. Anything richer (query-filter syntax, retry policy) belongs
//! to the server-specific client this trait abstracts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use tracing::debug;

use crate::catalog::ResourceDescriptor;

use super::{ApiClient, Query, RateLimits, RecordStream, TransportError};

/// Relative URL of the server's rate-limit discovery endpoint.
const RATE_LIMITS_URL: &str = "op/rateService/rateLimits.json";

/// REST client for the upstream management server.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    errors: Arc<AtomicU64>,
}

impl RestClient {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let base_url = base_url.into();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Decode {
                url: base_url.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            http,
            base_url,
            username: username.into(),
            password: password.into(),
            errors: Arc::new(AtomicU64::new(0)),
        })
    }

    fn resource_url(&self, descriptor: &ResourceDescriptor) -> String {
        format!(
            "{}/{}/data/{}.json",
            self.base_url.trim_end_matches('/'),
            descriptor.version,
            descriptor.name
        )
    }

    async fn fetch_page(
        &self,
        url: &str,
        descriptor: &ResourceDescriptor,
        query: &Query,
        first: usize,
    ) -> Result<Vec<Value>, TransportError> {
        let mut request = self
            .http
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .query(&[(".full", "true")])
            .query(&[("firstResult", first), ("maxResults", query.page_size)]);

        if let Some(cursor) = query.after_cursor {
            request = request.query(&[("@id", format!("gt({cursor})"))]);
        }
        if let (Some(time_field), Some(min), Some(max)) =
            (&descriptor.time_field, query.min_time, query.max_time)
        {
            let min_ms = (min * 1000.0) as i64;
            let max_ms = (max * 1000.0) as i64;
            request = request.query(&[(time_field.as_str(), format!("between({min_ms},{max_ms})"))]);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                TransportError::Refused {
                    server: self.base_url.clone(),
                }
            } else {
                TransportError::Reset {
                    resource: descriptor.name.clone(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body: Value = response.json().await.map_err(|e| TransportError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        if body.get("queryResponse").is_none() {
            // Malformed page; counted, surfaced after the stream drains.
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        Ok(extract_entities(&body))
    }
}

/// Pull the record objects out of a query response.
///
/// Each entity wraps its DTO one level deep under a single key; the
/// wrapper is discarded.
fn extract_entities(body: &Value) -> Vec<Value> {
    let entities = body
        .get("queryResponse")
        .and_then(|q| q.get("entity"))
        .and_then(Value::as_array);

    match entities {
        Some(list) => list.iter().map(unwrap_dto).collect(),
        None => Vec::new(),
    }
}

fn unwrap_dto(entity: &Value) -> Value {
    if let Value::Object(map) = entity {
        if map.len() == 1 {
            return map.values().next().cloned().unwrap_or(Value::Null);
        }
    }
    entity.clone()
}

struct PageState {
    client: RestClient,
    descriptor: ResourceDescriptor,
    query: Query,
    url: String,
    first: usize,
    done: bool,
}

#[async_trait]
impl ApiClient for RestClient {
    async fn rate_limits(&self) -> Result<RateLimits, TransportError> {
        let url = format!(
            "{}/v4/{}",
            self.base_url.trim_end_matches('/'),
            RATE_LIMITS_URL
        );
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|_| TransportError::Refused {
                server: self.base_url.clone(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                url,
            });
        }
        let body: Value = response.json().await.map_err(|e| TransportError::Decode {
            url: url.clone(),
            message: e.to_string(),
        })?;

        let record = extract_entities(&body)
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Decode {
                url: url.clone(),
                message: "rate-limit response has no entity".to_string(),
            })?;

        let field = |name: &str| {
            record
                .get(name)
                .and_then(Value::as_f64)
                .ok_or_else(|| TransportError::Decode {
                    url: url.clone(),
                    message: format!("rate-limit response missing {name}"),
                })
        };

        Ok(RateLimits {
            // Server reports the window in milliseconds
            window_size_secs: field("windowSize")? / 1000.0,
            segment_count: field("windowSegments")? as u32,
            max_page_size: field("limitPageSize")? as usize,
            per_user_threshold: field("perUserThreshold")? as u32,
        })
    }

    async fn records(
        &self,
        descriptor: &ResourceDescriptor,
        query: &Query,
    ) -> Result<RecordStream, TransportError> {
        self.errors.store(0, Ordering::Relaxed);

        let state = PageState {
            client: self.clone(),
            url: self.resource_url(descriptor),
            descriptor: descriptor.clone(),
            query: query.clone(),
            first: 0,
            done: false,
        };

        let pages = stream::try_unfold(state, |mut st| async move {
            if st.done {
                return Ok(None);
            }
            let page = st
                .client
                .fetch_page(&st.url, &st.descriptor, &st.query, st.first)
                .await?;
            debug!(
                resource = %st.descriptor.name,
                first = st.first,
                records = page.len(),
                "Fetched page"
            );
            st.first += page.len();
            if page.len() < st.query.page_size {
                st.done = true;
            }
            if page.is_empty() {
                return Ok(None);
            }
            Ok(Some((page, st)))
        });

        Ok(pages
            .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
            .try_flatten()
            .boxed())
    }

    fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_entities_unwraps_dto() {
        let body = json!({
            "queryResponse": {
                "entity": [
                    {"clientSessionsDTO": {"macAddress": "aa:bb", "ssid": "eduroam"}},
                    {"clientSessionsDTO": {"macAddress": "cc:dd", "ssid": "guest"}}
                ]
            }
        });
        let entities = extract_entities(&body);
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0]["macAddress"], "aa:bb");
    }

    #[test]
    fn test_extract_entities_empty_response() {
        assert!(extract_entities(&json!({})).is_empty());
        assert!(extract_entities(&json!({"queryResponse": {}})).is_empty());
    }

    #[test]
    fn test_resource_url_includes_version() {
        let client = RestClient::new(
            "https://ncs01.example.edu/webacs/api/",
            "user",
            "pass",
            Duration::from_secs(180),
        )
        .unwrap();
        let desc = ResourceDescriptor::new("ClientSessions", false).with_version("v4");
        assert_eq!(
            client.resource_url(&desc),
            "https://ncs01.example.edu/webacs/api/v4/data/ClientSessions.json"
        );
    }
}
