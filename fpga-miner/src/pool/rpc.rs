//! JSON-RPC envelope and response field extraction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use url::Url;

use super::{PoolError, Result};
use crate::work::WORK_LEN;

/// Request ids are unique across all sessions.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// One HTTP JSON-RPC call.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub url: Url,
    pub user: String,
    pub password: String,
    pub body: String,
    pub timeout: Duration,
}

impl RpcRequest {
    /// Build a `getwork` call. An empty `data` fetches work, a hex string
    /// submits a solution.
    pub fn getwork(url: Url, user: &str, password: &str, data: Option<&str>, timeout: Duration) -> Self {
        let params: Vec<Value> = data.map(|d| Value::String(d.to_string())).into_iter().collect();
        let body = json!({
            "jsonrpc": "1.0",
            "id": next_id(),
            "method": "getwork",
            "params": params,
        })
        .to_string();
        Self {
            url,
            user: user.to_string(),
            password: password.to_string(),
            body,
            timeout,
        }
    }
}

/// Response body plus the protocol headers the miner reacts to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RpcResponse {
    pub body: String,
    /// `X-Reject-Reason` header.
    pub reject_reason: Option<String>,
    /// `X-Long-Polling` header.
    pub long_polling: Option<String>,
}

/// Transport that performs a JSON-RPC POST.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn post(&self, request: RpcRequest) -> Result<RpcResponse>;
}

/// Extract the value of `name` from a response body.
///
/// Pools differ enough in their JSON that a strict parser rejects working
/// servers. The field name is located case-insensitively, the value starts
/// after the following `:` and whitespace, and is either a quoted string or
/// a bare token ending at `,` or `}` (or the end of the body).
pub fn extract_field(body: &str, name: &str) -> Result<String> {
    let haystack = body.to_ascii_lowercase();
    let needle = name.to_ascii_lowercase();
    let start = haystack
        .find(&needle)
        .ok_or_else(|| PoolError::Protocol(format!("field `{name}` not found")))?;

    let bytes = body.as_bytes();
    let mut i = start + needle.len();
    while i < bytes.len() && bytes[i] != b':' {
        i += 1;
    }
    i += 1;
    while i < bytes.len() && bytes[i] <= b' ' {
        i += 1;
    }
    if i >= bytes.len() {
        return Err(PoolError::Protocol(format!("value expected after `{name}`")));
    }

    if bytes[i] == b'"' {
        let value_start = i + 1;
        let len = bytes[value_start..]
            .iter()
            .position(|&b| b == b'"')
            .ok_or_else(|| PoolError::Protocol(format!("unterminated value for `{name}`")))?;
        Ok(body[value_start..value_start + len].to_string())
    } else {
        let len = bytes[i..]
            .iter()
            .position(|&b| b == b',' || b == b'}')
            .unwrap_or(bytes.len() - i);
        Ok(body[i..i + len].trim_end().to_string())
    }
}

/// Decode the `data` field of a getwork response into the wire buffer.
///
/// Pools send at least 128 bytes; only the first 128 are used.
pub fn decode_work_data(body: &str) -> Result<[u8; WORK_LEN]> {
    let data = extract_field(body, "data")?;
    let hex = data
        .get(..WORK_LEN * 2)
        .ok_or_else(|| PoolError::Protocol(format!("work data too short: {} hex chars", data.len())))?;
    let mut wire = [0u8; WORK_LEN];
    hex::decode_to_slice(hex, &mut wire)
        .map_err(|e| PoolError::Protocol(format!("invalid work data: {e}")))?;
    Ok(wire)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted transport recording every request.
    #[derive(Default)]
    pub(crate) struct MockTransport {
        pub responses: Mutex<VecDeque<Result<RpcResponse>>>,
        pub requests: Mutex<Vec<RpcRequest>>,
    }

    impl MockTransport {
        pub fn push(&self, response: Result<RpcResponse>) {
            self.responses.lock().unwrap().push_back(response);
        }

        pub fn push_body(&self, body: impl Into<String>) {
            self.push(Ok(RpcResponse {
                body: body.into(),
                ..Default::default()
            }));
        }

        pub fn requests(&self) -> Vec<RpcRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RpcTransport for MockTransport {
        async fn post(&self, request: RpcRequest) -> Result<RpcResponse> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(PoolError::Network("connection refused".into())))
        }
    }

    #[test]
    fn test_extract_quoted_and_bare_values() {
        let body = r#"{"result": {"data": "abcd", "target":"ff00"}, "error": null, "id": 7}"#;
        assert_eq!(extract_field(body, "data").unwrap(), "abcd");
        assert_eq!(extract_field(body, "target").unwrap(), "ff00");
        assert_eq!(extract_field(body, "error").unwrap(), "null");
        assert_eq!(extract_field(body, "id").unwrap(), "7");
    }

    #[test]
    fn test_extract_is_case_insensitive() {
        let body = r#"{"SubmitOld": FALSE}"#;
        assert_eq!(extract_field(body, "submitold").unwrap(), "FALSE");
    }

    #[test]
    fn test_extract_bare_token_to_end_of_body() {
        assert_eq!(extract_field(r#""result": true  "#, "result").unwrap(), "true");
    }

    #[test]
    fn test_extract_errors() {
        assert!(matches!(extract_field("{}", "data"), Err(PoolError::Protocol(_))));
        assert!(matches!(extract_field(r#"{"data":   "#, "data"), Err(PoolError::Protocol(_))));
        assert!(matches!(extract_field(r#"{"data": "abc"#, "data"), Err(PoolError::Protocol(_))));
    }

    #[test]
    fn test_decode_work_data() {
        let data = "ab".repeat(128) + &"00".repeat(64);
        let body = format!(r#"{{"result":{{"data":"{data}"}},"error":null}}"#);
        assert_eq!(decode_work_data(&body).unwrap(), [0xab; WORK_LEN]);

        let short = format!(r#"{{"data":"{}"}}"#, "ab".repeat(100));
        assert!(matches!(decode_work_data(&short), Err(PoolError::Protocol(_))));

        let bad = format!(r#"{{"data":"{}"}}"#, "zz".repeat(128));
        assert!(matches!(decode_work_data(&bad), Err(PoolError::Protocol(_))));
    }

    #[test]
    fn test_getwork_envelope() {
        let url = Url::parse("http://pool.example:8332").unwrap();
        let fetch = RpcRequest::getwork(url.clone(), "u", "p", None, Duration::from_secs(4));
        let submit = RpcRequest::getwork(url, "u", "p", Some("00ff"), Duration::from_secs(4));

        let fetch: Value = serde_json::from_str(&fetch.body).unwrap();
        let submit: Value = serde_json::from_str(&submit.body).unwrap();
        assert_eq!(fetch["jsonrpc"], "1.0");
        assert_eq!(fetch["method"], "getwork");
        assert_eq!(fetch["params"], json!([]));
        assert_eq!(submit["params"], json!(["00ff"]));
        assert!(submit["id"].as_u64().unwrap() > fetch["id"].as_u64().unwrap());
    }
}
