//! Outbound HTTP to providers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::error::AppError;
use crate::models::channel::{Channel, ChannelType};
use crate::transformer::{join_url, ProviderRequest};

pub type ByteStream = BoxStream<'static, Result<Bytes, AppError>>;

/// Upper bound on the error body quoted back in an `Upstream` error.
const ERROR_BODY_LIMIT: usize = 512;

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send a converted request. Non-2xx statuses are `Upstream` errors; the
    /// body of a successful response is yielded as it arrives.
    async fn send(&self, channel: &Channel, request: ProviderRequest) -> Result<ByteStream, AppError>;

    /// Plain GET, used for model discovery.
    async fn get(
        &self,
        channel: &Channel,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Bytes, AppError>;

    /// Round trip to the channel's base URL. Any HTTP status counts as reachable.
    async fn probe(&self, channel: &Channel, timeout: Duration) -> Result<Duration, AppError>;
}

pub struct HttpUpstream {
    timeout: Duration,
    /// One client per proxy setting; `None` is the direct client.
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl HttpUpstream {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, channel: &Channel) -> Result<reqwest::Client, AppError> {
        let proxy = channel.proxy.clone().filter(|p| !p.trim().is_empty());
        if let Some(client) = self.clients.lock().get(&proxy) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder();
        if let Some(url) = &proxy {
            let p = reqwest::Proxy::all(url.as_str())
                .map_err(|e| AppError::BadRequest(format!("invalid proxy {url}: {e}")))?;
            builder = builder.proxy(p);
        }
        let client = builder.build()?;
        self.clients.lock().insert(proxy, client.clone());
        Ok(client)
    }
}

fn upstream_err(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::Upstream("request timed out".into())
    } else {
        AppError::Upstream(e.to_string())
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, AppError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    Err(AppError::Upstream(format!("status {}: {}", status.as_u16(), snippet)))
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(&self, channel: &Channel, request: ProviderRequest) -> Result<ByteStream, AppError> {
        let mut req = self
            .client(channel)?
            .post(&request.url)
            .timeout(self.timeout)
            .body(request.body);
        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let resp = ensure_success(req.send().await.map_err(upstream_err)?).await?;
        Ok(resp.bytes_stream().map(|r| r.map_err(upstream_err)).boxed())
    }

    async fn get(
        &self,
        channel: &Channel,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Bytes, AppError> {
        let mut req = self.client(channel)?.get(url).timeout(self.timeout);
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let resp = ensure_success(req.send().await.map_err(upstream_err)?).await?;
        resp.bytes().await.map_err(upstream_err)
    }

    async fn probe(&self, channel: &Channel, timeout: Duration) -> Result<Duration, AppError> {
        let start = Instant::now();
        self.client(channel)?
            .get(&channel.base_url)
            .timeout(timeout)
            .send()
            .await
            .map_err(upstream_err)?;
        Ok(start.elapsed())
    }
}

// ── Model discovery ──

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<OpenAiModel>,
    #[serde(default)]
    models: Vec<GeminiModel>,
    #[serde(default, rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModel {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GeminiModel {
    name: String,
}

fn list_headers(channel: &Channel) -> Vec<(String, String)> {
    match channel.channel_type {
        ChannelType::OpenaiChat | ChannelType::OpenaiResponse => {
            vec![("authorization".into(), format!("Bearer {}", channel.key))]
        }
        ChannelType::Anthropic => vec![
            ("x-api-key".into(), channel.key.clone()),
            ("anthropic-version".into(), crate::transformer::anthropic::API_VERSION.into()),
        ],
        ChannelType::Gemini => vec![("x-goog-api-key".into(), channel.key.clone())],
    }
}

fn page_url(base: &str, token: &str) -> Result<String, AppError> {
    reqwest::Url::parse_with_params(base, &[("pageToken", token)])
        .map(|url| url.to_string())
        .map_err(|e| AppError::BadRequest(format!("invalid base url {base}: {e}")))
}

/// Model names a provider advertises, following `nextPageToken` until the
/// last page. Gemini's `models/` prefix is stripped.
pub async fn fetch_model_names(
    upstream: &dyn Upstream,
    channel: &Channel,
) -> Result<Vec<String>, AppError> {
    let base = join_url(&channel.base_url, "models");
    let headers = list_headers(channel);
    let mut names: Vec<String> = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        let url = match &page_token {
            Some(token) => page_url(&base, token)?,
            None => base.clone(),
        };
        let body = upstream.get(channel, &url, &headers).await?;
        let page: ModelList = serde_json::from_slice(&body)
            .map_err(|e| AppError::Upstream(format!("unexpected model list: {e}")))?;

        let found = page
            .data
            .into_iter()
            .map(|m| m.id)
            .chain(page.models.into_iter().map(|m| {
                m.name
                    .strip_prefix("models/")
                    .map(str::to_string)
                    .unwrap_or(m.name)
            }));
        for name in found {
            if !names.contains(&name) {
                names.push(name);
            }
        }

        match page.next_page_token.filter(|t| !t.is_empty()) {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    Ok(names)
}


#[cfg(test)]
mod tests {
    use super::fake::FakeUpstream;
    use super::*;
    use crate::models::channel::test_channel;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn gemini_listing_follows_page_tokens() {
        let upstream = FakeUpstream::new();
        let channel = test_channel(1, ChannelType::Gemini);
        upstream.page(
            "https://upstream.test/v1/models",
            r#"{"models":[{"name":"models/gemini-2.5-pro"}],"nextPageToken":"p2"}"#,
        );
        upstream.page(
            "https://upstream.test/v1/models?pageToken=p2",
            r#"{"models":[{"name":"models/gemini-2.5-flash"}],"nextPageToken":""}"#,
        );

        let names = fetch_model_names(&upstream, &channel).await.unwrap();
        assert_eq!(names, vec!["gemini-2.5-pro", "gemini-2.5-flash"]);
    }

    #[tokio::test]
    async fn page_tokens_are_query_encoded() {
        let upstream = FakeUpstream::new();
        let channel = test_channel(1, ChannelType::Gemini);
        upstream.page(
            "https://upstream.test/v1/models",
            r#"{"models":[{"name":"models/a"}],"nextPageToken":"a+b/c=&x"}"#,
        );
        upstream.page(
            "https://upstream.test/v1/models?pageToken=a%2Bb%2Fc%3D%26x",
            r#"{"models":[{"name":"models/b"}]}"#,
        );

        let names = fetch_model_names(&upstream, &channel).await.unwrap();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn openai_listing_reads_data_ids() {
        let upstream = FakeUpstream::new();
        let channel = test_channel(1, ChannelType::OpenaiChat);
        upstream.page(
            "https://upstream.test/v1/models",
            r#"{"object":"list","data":[{"id":"gpt-4o","object":"model"},{"id":"gpt-4o-mini"}]}"#,
        );
        let names = fetch_model_names(&upstream, &channel).await.unwrap();
        assert_eq!(names, vec!["gpt-4o", "gpt-4o-mini"]);
    }

    #[tokio::test]
    async fn listing_failure_is_upstream_error() {
        let upstream = FakeUpstream::new();
        let channel = test_channel(1, ChannelType::Anthropic);
        assert!(matches!(
            fetch_model_names(&upstream, &channel).await,
            Err(AppError::Upstream(_))
        ));
        assert_eq!(list_headers(&channel)[0].0, "x-api-key");
    }
}
