//! Upstream HTTP client and the connect-retry policy shared by every
//! forwarding path.

use crate::error::ProxyError;
use axum::http::HeaderMap;
use bytes::Bytes;
use std::time::Duration;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Read timeout for non-streaming upstream replies. Streaming paths pass
/// `None` and run until either side disconnects.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Delays between connect attempts. One initial attempt plus one retry per
/// entry; no sleep after the final failure.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(2000),
];

/// Pooled client for all upstream traffic. Redirects are disabled; upstream
/// endpoints are configured with their final URL.
pub fn build_client() -> Result<reqwest::Client, ProxyError> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| ProxyError::Config(format!("build upstream HTTP client: {e}")))
}

/// Send `method url` with retries on connect errors, timeouts, and 5xx
/// replies. Any non-5xx response (including 4xx) is returned to the caller
/// for forwarding.
pub async fn send_with_retries(
    client: &reqwest::Client,
    method: reqwest::Method,
    url: reqwest::Url,
    headers: HeaderMap,
    body: Option<Bytes>,
    read_timeout: Option<Duration>,
) -> Result<reqwest::Response, ProxyError> {
    send_with_retry_schedule(client, method, url, headers, body, read_timeout, &RETRY_DELAYS).await
}

pub(crate) async fn send_with_retry_schedule(
    client: &reqwest::Client,
    method: reqwest::Method,
    url: reqwest::Url,
    headers: HeaderMap,
    body: Option<Bytes>,
    read_timeout: Option<Duration>,
    delays: &[Duration],
) -> Result<reqwest::Response, ProxyError> {
    let mut last_error = String::new();

    for attempt in 0..=delays.len() {
        let mut request = client
            .request(method.clone(), url.clone())
            .headers(headers.clone());
        if let Some(body) = &body {
            request = request.body(body.clone());
        }
        if let Some(timeout) = read_timeout {
            request = request.timeout(timeout);
        }

        match request.send().await {
            Ok(response) if response.status().is_server_error() => {
                last_error = format!("upstream returned {}", response.status().as_u16());
            }
            Ok(response) => return Ok(response),
            Err(e) => {
                last_error = e.to_string();
            }
        }

        if attempt < delays.len() {
            tracing::debug!(
                url = %url,
                attempt = attempt + 1,
                error = %last_error,
                "upstream attempt failed; retrying"
            );
            tokio::time::sleep(delays[attempt]).await;
        }
    }

    Err(ProxyError::Upstream(last_error))
}
