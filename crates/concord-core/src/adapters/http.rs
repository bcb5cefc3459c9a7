//! Adapter for an HTTP document bridge.
//!
//! The bridge fronts one cloud editor and exposes a small JSON API:
//!
//! - `PUT  {base}/v1/orgs/{org}/files/{file}/content` with `{"content": ...}`
//! - `GET  {base}/v1/orgs/{org}/files/{file}/content` returning
//!   `{"content": ..., "modified_at": <ms> | "modified_time": "<rfc3339>"}`
//! - `GET  {base}/v1/orgs/{org}/files/{file}` returning `{"web_url": "..."}`

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{CloudAdapter, PulledContent, PushOutcome};
use crate::error::{Error, Result};
use crate::util::{compact_text, is_http_url, normalize_text_option};

#[derive(Clone)]
pub struct HttpCloudAdapter {
    provider: String,
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpCloudAdapter {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpCloudAdapter")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl HttpCloudAdapter {
    pub fn new(
        provider: impl Into<String>,
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self> {
        let provider = normalize_text_option(Some(provider.into()))
            .ok_or_else(|| Error::validation("cloud provider name must not be empty"))?;
        let token = normalize_text_option(Some(token.into()))
            .ok_or_else(|| Error::validation("cloud bridge token must not be empty"))?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|error| Error::adapter(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            provider,
            base_url: normalize_base_url(base_url.into())?,
            token,
            client,
        })
    }

    fn file_url(&self, organization_id: &str, file_id: &str) -> String {
        format!(
            "{}/v1/orgs/{}/files/{}",
            self.base_url,
            urlencoding::encode(organization_id),
            urlencoding::encode(file_id)
        )
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<Option<T>> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|error| transport_error(&self.provider, &error))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::adapter(format!(
                "{}: {}",
                self.provider,
                parse_api_error(status, &body)
            )));
        }

        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|error| Error::adapter(format!("{}: invalid response: {error}", self.provider)))
    }
}

#[async_trait]
impl CloudAdapter for HttpCloudAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn push_content(
        &self,
        organization_id: &str,
        file_id: &str,
        content: &Value,
    ) -> Result<PushOutcome> {
        let url = format!("{}/content", self.file_url(organization_id, file_id));
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .json(&json!({ "content": content }))
            .send()
            .await
            .map_err(|error| transport_error(&self.provider, &error))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Ok(PushOutcome::failed(parse_api_error(status, &body)));
        }

        let modified_at = serde_json::from_str::<ContentResponse>(&body)
            .ok()
            .and_then(|payload| payload.modified_at_millis());
        Ok(PushOutcome::succeeded(modified_at))
    }

    async fn pull_content(
        &self,
        organization_id: &str,
        file_id: &str,
    ) -> Result<Option<PulledContent>> {
        let url = format!("{}/content", self.file_url(organization_id, file_id));
        let Some(payload) = self.get_json::<ContentResponse>(&url).await? else {
            return Ok(None);
        };
        payload.into_pulled(&self.provider).map(Some)
    }

    async fn web_url(&self, organization_id: &str, file_id: &str) -> Result<Option<String>> {
        let url = self.file_url(organization_id, file_id);
        Ok(self
            .get_json::<FileResponse>(&url)
            .await?
            .and_then(|file| normalize_text_option(file.web_url)))
    }
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    content: Option<Value>,
    modified_at: Option<i64>,
    modified_time: Option<String>,
}

impl ContentResponse {
    fn modified_at_millis(&self) -> Option<i64> {
        self.modified_at.or_else(|| {
            self.modified_time.as_deref().and_then(|raw| {
                chrono::DateTime::parse_from_rfc3339(raw.trim())
                    .ok()
                    .map(|timestamp| timestamp.timestamp_millis())
            })
        })
    }

    fn into_pulled(self, provider: &str) -> Result<PulledContent> {
        let external_modified_at = self.modified_at_millis().ok_or_else(|| {
            Error::adapter(format!(
                "{provider}: response did not include modified_at/modified_time"
            ))
        })?;
        let content = self
            .content
            .ok_or_else(|| Error::adapter(format!("{provider}: response did not include content")))?;
        Ok(PulledContent {
            content,
            external_modified_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    web_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn transport_error(provider: &str, error: &reqwest::Error) -> Error {
    Error::adapter(format!("{provider}: request failed: {error}"))
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let compact = compact_text(body);
    if compact.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", compact, status.as_u16())
    }
}

fn normalize_base_url(raw: String) -> Result<String> {
    let base_url = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::validation("cloud bridge URL must not be empty"))?;
    if is_http_url(&base_url) {
        Ok(base_url.trim_end_matches('/').to_string())
    } else {
        Err(Error::validation(
            "cloud bridge URL must include http:// or https://",
        ))
    }
}
