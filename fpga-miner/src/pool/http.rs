//! HTTP transport for getwork requests.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};

use super::{
    rpc::{RpcRequest, RpcResponse, RpcTransport},
    PoolError, Result, USER_AGENT,
};

/// reqwest-backed [`RpcTransport`].
///
/// Compressed responses (gzip, deflate) are decoded by the client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(
            HeaderName::from_static("x-mining-extensions"),
            HeaderValue::from_static("longpoll submitold"),
        );

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .connect_timeout(connect_timeout)
            .gzip(true)
            .deflate(true)
            .build()
            .map_err(|e| PoolError::Network(format!("HTTP client setup failed: {e}")))?;

        Ok(Self { client })
    }
}

fn header(resp: &reqwest::Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn post(&self, request: RpcRequest) -> Result<RpcResponse> {
        let resp = self
            .client
            .post(request.url.clone())
            .basic_auth(&request.user, Some(&request.password))
            .timeout(request.timeout)
            .body(request.body)
            .send()
            .await
            .map_err(|e| PoolError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PoolError::Network(format!("HTTP {status}")));
        }

        let reject_reason = header(&resp, "X-Reject-Reason");
        let long_polling = header(&resp, "X-Long-Polling");

        let body = resp.text().await.map_err(|e| {
            if e.is_decode() {
                PoolError::Protocol(e.to_string())
            } else {
                PoolError::Network(e.to_string())
            }
        })?;

        Ok(RpcResponse {
            body,
            reject_reason,
            long_polling,
        })
    }
}
