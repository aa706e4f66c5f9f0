//! Per-session getwork client with endpoint failover.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::{
    endpoint::{EndpointState, PoolEndpoint},
    rpc::{decode_work_data, extract_field, RpcRequest, RpcResponse, RpcTransport},
    PoolError, Result,
};
use crate::{
    block_monitor::{BlockMonitor, LongPollEndpoint},
    tracing::prelude::*,
    types::DecayedAverage,
    work::{Target, WorkUnit},
};

/// Cool-down after a response that could not be decoded.
pub const PROTOCOL_COOLDOWN: Duration = Duration::from_secs(60);

/// Reject reasons that are part of normal operation.
const BENIGN_REJECT_REASONS: [&str; 4] = ["", "high-hash", "stale-prevblk", "duplicate"];

/// Client settings derived from the miner configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Scales timeouts and the I/O error threshold.
    pub connection_effort: f64,
    /// Use the pool's `target` instead of the default share target.
    pub target_check: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_effort: 2.0,
            target_check: false,
        }
    }
}

impl ClientConfig {
    /// Connect and read timeout of regular requests.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(2.0 * self.connection_effort)
    }

    /// Consecutive I/O errors before an endpoint cools down.
    pub fn io_error_threshold(&self, endpoints: usize) -> u32 {
        let base = if endpoints > 1 { 2.0 } else { 4.0 };
        ((base * self.connection_effort).round() as u32).max(1)
    }

    /// Cool-down after too many I/O errors.
    pub fn io_cooldown(&self, endpoints: usize) -> Duration {
        Duration::from_secs(if endpoints > 1 { 60 } else { 30 })
    }
}

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitAck {
    pub accepted: bool,
    /// URL of the endpoint the nonce was submitted to.
    pub endpoint: String,
}

/// Decayed request latencies in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolTiming {
    pub getwork_ms: f64,
    pub getwork_weight: f64,
    pub submit_ms: f64,
    pub submit_weight: f64,
}

/// Getwork client owned by one device session.
pub struct PoolClient {
    name: String,
    endpoints: Vec<EndpointState>,
    transport: Arc<dyn RpcTransport>,
    monitor: Arc<BlockMonitor>,
    config: ClientConfig,
    getwork_time: DecayedAverage,
    submit_time: DecayedAverage,
}

impl PoolClient {
    /// Create a client. `name` identifies the owning device in logs.
    pub fn new(
        name: impl Into<String>,
        endpoints: Vec<PoolEndpoint>,
        transport: Arc<dyn RpcTransport>,
        monitor: Arc<BlockMonitor>,
        config: ClientConfig,
    ) -> Self {
        Self {
            name: name.into(),
            endpoints: endpoints.into_iter().map(EndpointState::new).collect(),
            transport,
            monitor,
            config,
            getwork_time: DecayedAverage::new(0.99),
            submit_time: DecayedAverage::new(0.99),
        }
    }

    /// Whether endpoint `index` is outside its cool-down.
    pub fn is_available(&self, index: usize, now: Instant) -> bool {
        self.endpoints
            .get(index)
            .is_some_and(|ep| ep.is_available(now))
    }

    /// First endpoint in priority order that is not cooling down.
    pub fn select_endpoint(&self, now: Instant) -> Option<usize> {
        self.endpoints.iter().position(|ep| ep.is_available(now))
    }

    pub fn timing(&self) -> PoolTiming {
        PoolTiming {
            getwork_ms: self.getwork_time.value(),
            getwork_weight: self.getwork_time.weight(),
            submit_ms: self.submit_time.value(),
            submit_weight: self.submit_time.weight(),
        }
    }

    /// Fetch new work from the first available endpoint.
    pub async fn fetch_work(&mut self, now: Instant) -> Result<WorkUnit> {
        let index = self
            .select_endpoint(now)
            .ok_or(PoolError::NoEndpointAvailable)?;

        let started = Instant::now();
        let response = self.call(index, None, now).await?;
        self.getwork_time
            .add(started.elapsed().as_secs_f64() * 1000.0);

        let wire = match decode_work_data(&response.body) {
            Ok(wire) => wire,
            Err(e) => {
                self.cool_down_protocol(index, now, &e);
                return Err(e);
            }
        };

        let target = if self.config.target_check {
            extract_field(&response.body, "target")
                .ok()
                .and_then(|hex| Target::from_pool_hex(&hex).ok())
                .unwrap_or(Target::MAX)
        } else {
            Target::MAX
        };

        Ok(WorkUnit::new(wire, target, index, now))
    }

    /// Submit a golden nonce for `work` to the endpoint the work came from.
    pub async fn submit_nonce(&mut self, work: &WorkUnit, nonce: u32, now: Instant) -> Result<SubmitAck> {
        let index = work.endpoint;
        let endpoint = self
            .endpoints
            .get(index)
            .map(|ep| ep.endpoint.url.to_string())
            .ok_or(PoolError::NoEndpointAvailable)?;

        let data = work.submission_hex(nonce);
        debug!(
            device = %self.name,
            nonce = %format!("{nonce:08x}"),
            data = %data,
            endpoint = %endpoint,
            "Submitting nonce"
        );

        let started = Instant::now();
        let response = self.call(index, Some(&data), now).await?;

        if let Ok(error) = extract_field(&response.body, "error") {
            if !error.is_empty() && error != "null" {
                warn!(device = %self.name, error = %error, "Error attempting to submit nonce");
            }
        }
        let accepted = extract_field(&response.body, "result")
            .is_ok_and(|r| r.eq_ignore_ascii_case("true"));

        self.submit_time
            .add(started.elapsed().as_secs_f64() * 1000.0);

        Ok(SubmitAck { accepted, endpoint })
    }

    /// Perform one request against endpoint `index`, applying the failure
    /// policy and reacting to the protocol headers.
    async fn call(&mut self, index: usize, data: Option<&str>, now: Instant) -> Result<RpcResponse> {
        let ep = &self.endpoints[index].endpoint;
        let request = RpcRequest::getwork(
            ep.url.clone(),
            &ep.user,
            &ep.password,
            data,
            self.config.request_timeout(),
        );

        let response = match self.transport.post(request).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    PoolError::Network(_) => self.record_io_error(index, now),
                    PoolError::Protocol(_) => self.cool_down_protocol(index, now, &e),
                    _ => {}
                }
                return Err(e);
            }
        };
        self.endpoints[index].record_success();

        if let Some(reason) = response.reject_reason.as_deref() {
            if !BENIGN_REJECT_REASONS.contains(&reason) {
                warn!(device = %self.name, reason = %reason, "Rejected block");
            }
        }

        if let Some(header) = response.long_polling.as_deref().filter(|h| !h.is_empty()) {
            let ep = &self.endpoints[index].endpoint;
            self.monitor.offer_long_poll(LongPollEndpoint {
                url: ep.resolve_long_poll(header),
                user: ep.user.clone(),
                password: ep.password.clone(),
            });
        }

        Ok(response)
    }

    fn record_io_error(&mut self, index: usize, now: Instant) {
        let count = self.endpoints.len();
        let threshold = self.config.io_error_threshold(count);
        let cooldown = self.config.io_cooldown(count);
        let state = &mut self.endpoints[index];
        if state.record_io_error(now, threshold, cooldown) {
            warn!(
                device = %self.name,
                endpoint = %state.endpoint.url,
                secs = cooldown.as_secs(),
                "Disabling pool endpoint after repeated I/O errors"
            );
        }
    }

    fn cool_down_protocol(&mut self, index: usize, now: Instant, error: &PoolError) {
        let state = &mut self.endpoints[index];
        state.disable(now, PROTOCOL_COOLDOWN);
        warn!(
            device = %self.name,
            endpoint = %state.endpoint.url,
            error = %error,
            secs = PROTOCOL_COOLDOWN.as_secs(),
            "Disabling pool endpoint"
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pool::rpc::tests::MockTransport;
    use crate::work::WORK_LEN;

    pub(crate) fn work_body(wire: &[u8; WORK_LEN], target: Option<&str>) -> String {
        let data = hex::encode(wire) + &"00".repeat(64);
        match target {
            Some(t) => format!(r#"{{"result":{{"data":"{data}","target":"{t}"}},"error":null,"id":1}}"#),
            None => format!(r#"{{"result":{{"data":"{data}"}},"error":null,"id":1}}"#),
        }
    }

    fn endpoints(n: usize) -> Vec<PoolEndpoint> {
        (0..n)
            .map(|i| PoolEndpoint::parse(&format!("http://pool{i}.example:8332"), "u", "p").unwrap())
            .collect()
    }

    fn client(n: usize, transport: &Arc<MockTransport>, config: ClientConfig) -> PoolClient {
        PoolClient::new(
            "test",
            endpoints(n),
            Arc::clone(transport) as Arc<dyn RpcTransport>,
            Arc::new(BlockMonitor::new(None)),
            config,
        )
    }

    #[test]
    fn test_failure_policy_constants() {
        let config = ClientConfig::default();
        assert_eq!(config.io_error_threshold(1), 8);
        assert_eq!(config.io_error_threshold(3), 4);
        assert_eq!(config.io_cooldown(1), Duration::from_secs(30));
        assert_eq!(config.io_cooldown(2), Duration::from_secs(60));
        assert_eq!(config.request_timeout(), Duration::from_secs(4));

        let low = ClientConfig {
            connection_effort: 0.1,
            ..Default::default()
        };
        assert_eq!(low.io_error_threshold(2), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_work_decodes_buffer() {
        let transport = Arc::new(MockTransport::default());
        let wire = [0x5au8; WORK_LEN];
        transport.push_body(work_body(&wire, None));

        let mut client = client(1, &transport, ClientConfig::default());
        let work = client.fetch_work(Instant::now()).await.unwrap();
        assert_eq!(work.wire(), &wire);
        assert_eq!(work.endpoint, 0);
        assert_eq!(work.target(), Target::MAX);
        assert_eq!(client.timing().getwork_weight, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_taken_only_when_checking() {
        let transport = Arc::new(MockTransport::default());
        let wire = [1u8; WORK_LEN];
        let target_hex = "00".repeat(31) + "01";
        transport.push_body(work_body(&wire, Some(&target_hex)));
        transport.push_body(work_body(&wire, Some("zz")));
        transport.push_body(work_body(&wire, Some(&target_hex)));

        let config = ClientConfig {
            target_check: true,
            ..Default::default()
        };
        let mut checking = client(1, &transport, config);
        let work = checking.fetch_work(Instant::now()).await.unwrap();
        let mut expected = [0u8; 32];
        expected[31] = 1;
        assert_eq!(work.target(), Target::from_be_bytes(expected));

        // Undecodable target falls back to the default.
        let work = checking.fetch_work(Instant::now()).await.unwrap();
        assert_eq!(work.target(), Target::MAX);

        let mut plain = client(1, &transport, ClientConfig::default());
        let work = plain.fetch_work(Instant::now()).await.unwrap();
        assert_eq!(work.target(), Target::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_and_cooldown_expiry() {
        let transport = Arc::new(MockTransport::default());
        let mut client = client(2, &transport, ClientConfig::default());
        let now = Instant::now();

        // Threshold with two endpoints and effort 2.0 is 4.
        for _ in 0..4 {
            assert!(matches!(client.fetch_work(now).await, Err(PoolError::Network(_))));
        }
        assert!(!client.is_available(0, now));
        assert_eq!(client.select_endpoint(now), Some(1));

        transport.push_body(work_body(&[2u8; WORK_LEN], None));
        let work = client.fetch_work(now).await.unwrap();
        assert_eq!(work.endpoint, 1);
        assert_eq!(transport.requests().last().unwrap().url.host_str(), Some("pool1.example"));

        for _ in 0..4 {
            let _ = client.fetch_work(now).await;
        }
        assert!(matches!(client.fetch_work(now).await, Err(PoolError::NoEndpointAvailable)));

        let later = now + Duration::from_secs(60);
        assert_eq!(client.select_endpoint(later), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_io_errors() {
        let transport = Arc::new(MockTransport::default());
        let mut client = client(1, &transport, ClientConfig::default());
        let now = Instant::now();

        for _ in 0..7 {
            let _ = client.fetch_work(now).await;
        }
        transport.push_body(work_body(&[3u8; WORK_LEN], None));
        client.fetch_work(now).await.unwrap();
        for _ in 0..7 {
            let _ = client.fetch_work(now).await;
        }
        assert!(client.is_available(0, now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parse_failure_cools_down_immediately() {
        let transport = Arc::new(MockTransport::default());
        transport.push_body(r#"{"result":null,"error":"busy"}"#);
        let mut client = client(1, &transport, ClientConfig::default());
        let now = Instant::now();

        assert!(matches!(client.fetch_work(now).await, Err(PoolError::Protocol(_))));
        assert!(!client.is_available(0, now + Duration::from_secs(59)));
        assert!(client.is_available(0, now + PROTOCOL_COOLDOWN));
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_faults_walk_through_endpoints() {
        let transport = Arc::new(MockTransport::default());
        for _ in 0..3 {
            transport.push_body(r#"{"result":{"data":"0011"},"error":null}"#);
        }
        let mut client = client(3, &transport, ClientConfig::default());
        let now = Instant::now();

        for _ in 0..2 {
            assert!(matches!(client.fetch_work(now).await, Err(PoolError::Protocol(_))));
        }
        let available: Vec<_> = (0..3).filter(|&i| client.is_available(i, now)).collect();
        assert_eq!(available, vec![2]);
        assert_eq!(client.select_endpoint(now), Some(2));

        assert!(matches!(client.fetch_work(now).await, Err(PoolError::Protocol(_))));
        assert!(matches!(client.fetch_work(now).await, Err(PoolError::NoEndpointAvailable)));
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_header_published_once() {
        let transport = Arc::new(MockTransport::default());
        let monitor = Arc::new(BlockMonitor::new(None));
        let mut client = PoolClient::new(
            "test",
            endpoints(1),
            Arc::clone(&transport) as Arc<dyn RpcTransport>,
            Arc::clone(&monitor),
            ClientConfig::default(),
        );

        for lp in ["/LP", "/other"] {
            transport.push(Ok(RpcResponse {
                body: work_body(&[4u8; WORK_LEN], None),
                long_polling: Some(lp.into()),
                ..Default::default()
            }));
            client.fetch_work(Instant::now()).await.unwrap();
        }

        let lp = monitor.long_poll_endpoint().unwrap();
        assert_eq!(lp.url, "http://pool0.example:8332/LP");
        assert_eq!(lp.user, "u");
        assert_eq!(lp.password, "p");
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_goes_to_work_endpoint() {
        let transport = Arc::new(MockTransport::default());
        let mut client = client(2, &transport, ClientConfig::default());
        let now = Instant::now();

        let wire = [6u8; WORK_LEN];
        let work = WorkUnit::new(wire, Target::MAX, 1, now);
        transport.push_body(r#"{"result":true,"error":null,"id":3}"#);
        transport.push_body(r#"{"result":false,"error":"stale","id":4}"#);

        let ack = client.submit_nonce(&work, 0xdead_beef, now).await.unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.endpoint, "http://pool1.example:8332/");

        let ack = client.submit_nonce(&work, 0xdead_beef, now).await.unwrap();
        assert!(!ack.accepted);

        let request = &transport.requests()[0];
        let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
        assert_eq!(body["params"][0], work.submission_hex(0xdead_beef));
        assert!((client.timing().submit_weight - 1.99).abs() < 1e-9);
    }
}
