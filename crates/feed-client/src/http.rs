use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use feed_core::backend::{FeedBackend, PageRequest};
use feed_core::errors::BackendError;
use feed_core::event::{EventBatch, FeedEvent};
use feed_core::ids::ItemId;
use feed_core::item::FeedPage;

/// Connection settings for the REST backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpBackendConfig {
    pub base_url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".into(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
        }
    }
}

/// `FeedBackend` over HTTP/JSON.
pub struct HttpBackend {
    client: Client,
    base_url: Url,
    request_timeout: Duration,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self, BackendError> {
        let request_timeout = Duration::from_millis(config.request_timeout_ms);
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(request_timeout)
            .build()
            .map_err(|e| BackendError::InvalidRequest(format!("http client: {e}")))?;
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| BackendError::InvalidRequest(format!("base url {}: {e}", config.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::InvalidRequest(format!(
                "base url {} cannot carry a path",
                config.base_url
            )));
        }
        Ok(Self {
            client,
            base_url,
            request_timeout,
        })
    }

    /// Base URL with `segments` appended, each percent-encoded as one segment.
    fn url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                BackendError::InvalidRequest(format!("base url {} cannot carry a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn transport_error(&self, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout(self.request_timeout)
        } else {
            BackendError::NetworkError(e.to_string())
        }
    }

    /// Turn a non-2xx response into a classified error.
    async fn check(&self, resp: Response) -> Result<Response, BackendError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = resp.text().await.unwrap_or_default();
        Err(match BackendError::from_status(status, body) {
            BackendError::RateLimited { .. } => BackendError::RateLimited { retry_after },
            other => other,
        })
    }
}

#[async_trait]
impl FeedBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, request), fields(cursor = ?request.cursor, limit = request.limit))]
    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, BackendError> {
        let mut query = vec![
            ("lat", request.geo.lat.to_string()),
            ("lng", request.geo.lng.to_string()),
            ("radiusKm", request.geo.radius_km.to_string()),
            ("limit", request.limit.to_string()),
        ];
        if let Some(cursor) = &request.cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let resp = self
            .client
            .get(self.url(&["feed"])?)
            .query(&query)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let resp = self.check(resp).await?;

        resp.json::<FeedPage>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn send_events(&self, events: &[FeedEvent]) -> Result<(), BackendError> {
        let resp = self
            .client
            .post(self.url(&["feed", "events"])?)
            .json(&EventBatch { events })
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.check(resp).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(item_id = %item_id))]
    async fn set_favorite(&self, item_id: &ItemId, favorited: bool) -> Result<(), BackendError> {
        let url = self.url(&["favorites", item_id.as_str()])?;
        let req = if favorited {
            self.client.post(url)
        } else {
            self.client.delete(url)
        };
        let resp = req.send().await.map_err(|e| self.transport_error(e))?;
        self.check(resp).await?;
        Ok(())
    }
}
