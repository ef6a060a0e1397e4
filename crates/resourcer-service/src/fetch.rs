//! Fetching JSON resources over HTTP.
//!
//! [`HttpFetcher`] is the building block for [`RequestDriver`](crate::requests::RequestDriver)
//! implementations talking to an HTTP API. It maps HTTP status codes into [`RequestError`]s so
//! the request handler can decide whether to retry, refresh the authorization, or give up.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::{Client, Response, StatusCode, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::cancelable::Cancelable;
use crate::clock::TimeProbe;
use crate::requests::RequestError;

/// The default time a single HTTP request may take, including reading the body.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("resourcer/", env!("CARGO_PKG_VERSION"));

/// Fetches JSON documents, optionally authorized with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Starts fetching `url` and decoding its body as JSON.
    ///
    /// Canceling the operation aborts the HTTP request.
    pub fn fetch_json<T>(&self, url: Url, token: Option<String>) -> Cancelable<Result<T, RequestError>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let fetcher = self.clone();
        Cancelable::spawn(async move { fetcher.get_json(url, token.as_deref()).await })
    }

    /// Fetches `url` and decodes its body as JSON.
    pub async fn get_json<T>(&self, url: Url, token: Option<&str>) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
    {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.get_json_inner(url, token)).await {
            Ok(result) => result,
            Err(_) => Err(RequestError::Timeout(timeout)),
        }
    }

    async fn get_json_inner<T>(&self, url: Url, token: Option<&str>) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
    {
        tracing::debug!("Fetching `{}`", url);
        let start = Instant::now();

        let mut builder = self
            .client
            .get(url.clone())
            .header(header::USER_AGENT, USER_AGENT)
            .header(header::ACCEPT, "application/json");
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        metric!(
            timer("http.fetch.duration") = start.elapsed(),
            "status" => status.as_str(),
        );

        if !status.is_success() {
            return Err(status_error(&url, response).await);
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Client::new(), DEFAULT_TIMEOUT)
    }
}

/// Infers the [`RequestError`] for an unsuccessful response.
async fn status_error(url: &Url, response: Response) -> RequestError {
    let status = response.status();
    debug_assert!(!status.is_success());

    match status {
        StatusCode::UNAUTHORIZED => {
            tracing::debug!("Authorization rejected for `{url}`: {status}");
            RequestError::Expired
        }
        StatusCode::FORBIDDEN => {
            tracing::debug!("Insufficient permissions to fetch `{url}`: {status}");
            let details = match response.text().await {
                Ok(text) if !text.is_empty() => text,
                _ => status.to_string(),
            };
            RequestError::PermissionDenied(details)
        }
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or_default();
            tracing::debug!("Rate limited by `{url}`, retry after {retry_after:?}");
            RequestError::RateLimited(retry_after)
        }
        status if status.is_client_error() => {
            // If it's a client error, chances are it's a 404.
            tracing::debug!("Unexpected client error status code from `{url}`: {status}");
            RequestError::NotFound
        }
        status => {
            tracing::debug!("Unexpected status code from `{url}`: {status}");
            RequestError::FetchError(status.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServerNow {
    /// Seconds since the unix epoch, with fractions.
    now: f64,
}

/// Asks an HTTP endpoint answering `{"now": <seconds>}` for the server time.
#[derive(Debug, Clone)]
pub struct HttpTimeProbe {
    fetcher: HttpFetcher,
    url: Url,
}

impl HttpTimeProbe {
    pub fn new(fetcher: HttpFetcher, url: Url) -> Self {
        Self { fetcher, url }
    }
}

impl TimeProbe for HttpTimeProbe {
    fn server_time(&self) -> BoxFuture<'_, Result<DateTime<Utc>, RequestError>> {
        async move {
            let ServerNow { now } = self.fetcher.get_json(self.url.clone(), None).await?;
            DateTime::from_timestamp_millis((now * 1000.0).round() as i64)
                .ok_or_else(|| RequestError::Malformed(format!("invalid server time {now}")))
        }
        .boxed()
    }
}
