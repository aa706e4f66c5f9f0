//! New block detection.
//!
//! Two paths feed the same state. The passive path compares the block
//! reference of every fetched work buffer with the last one seen. The active
//! path keeps a long-poll request open against the pool, which only returns
//! when a new block has been found.
//!
//! Consumers remember the generation their work was fetched at and compare it
//! with [`BlockMonitor::generation`] to tell whether the block changed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    pool::{decode_work_data, extract_field, PoolError, RpcRequest, RpcTransport},
    tracing::prelude::*,
    work::BlockFingerprint,
};

/// Minimum interval between long-poll attempts.
const MIN_LONG_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Read timeout of a long-poll request.
pub const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(1000);

/// Failures faster than this disable long polling for [`FAST_FAILURE_COOLDOWN`].
const FAST_FAILURE: Duration = Duration::from_millis(500);
const FAST_FAILURE_COOLDOWN: Duration = Duration::from_secs(60);

/// Retry delay while no long-poll URL is known.
const DISCOVERY_RETRY: Duration = Duration::from_secs(2);

/// Long-poll URL with the credentials of the endpoint it was discovered on.
#[derive(Debug, Clone, PartialEq)]
pub struct LongPollEndpoint {
    pub url: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Default)]
struct MonitorState {
    fingerprint: Option<BlockFingerprint>,
    long_poll: Option<LongPollEndpoint>,
}

/// Shared new-block signal.
#[derive(Debug)]
pub struct BlockMonitor {
    generation: AtomicU64,
    submit_stale: AtomicBool,
    state: Mutex<MonitorState>,
}

impl BlockMonitor {
    /// Create a monitor. An explicitly configured long-poll endpoint takes
    /// precedence over any discovered one.
    pub fn new(long_poll: Option<LongPollEndpoint>) -> Self {
        Self {
            generation: AtomicU64::new(0),
            submit_stale: AtomicBool::new(true),
            state: Mutex::new(MonitorState {
                fingerprint: None,
                long_poll,
            }),
        }
    }

    /// Current block generation. Only ever increases.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether results computed for the previous block may still be
    /// submitted.
    pub fn submit_stale(&self) -> bool {
        self.submit_stale.load(Ordering::Acquire)
    }

    /// Compare a freshly fetched work buffer against the recorded block.
    ///
    /// Returns true if a new block was detected. The first buffer ever seen
    /// is only recorded.
    pub fn check_fetched(&self, wire: &[u8]) -> Result<bool, PoolError> {
        let fingerprint = BlockFingerprint::from_wire(wire).ok_or_else(|| {
            PoolError::Protocol(format!("invalid length of work data: {}", wire.len()))
        })?;

        let mut state = self.state.lock().unwrap();
        match state.fingerprint.replace(fingerprint) {
            None => Ok(false),
            Some(previous) if previous == fingerprint => Ok(false),
            Some(_) => {
                self.submit_stale.store(true, Ordering::Release);
                self.generation.fetch_add(1, Ordering::AcqRel);
                info!("New block detected by block monitor");
                Ok(true)
            }
        }
    }

    /// Offer a discovered long-poll endpoint. Only the first offer is kept.
    ///
    /// Returns true if the offer was accepted.
    pub fn offer_long_poll(&self, endpoint: LongPollEndpoint) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.long_poll.is_some() {
            return false;
        }
        info!(url = %endpoint.url, "Using long polling URL");
        state.long_poll = Some(endpoint);
        true
    }

    pub fn long_poll_endpoint(&self) -> Option<LongPollEndpoint> {
        self.state.lock().unwrap().long_poll.clone()
    }

    /// Apply a completed long-poll response. A response always means a new
    /// block.
    pub(crate) fn apply_long_poll(&self, body: &str) -> Result<(), PoolError> {
        let wire = decode_work_data(body)?;
        let fingerprint = BlockFingerprint::from_wire(&wire)
            .ok_or_else(|| PoolError::Protocol("invalid length of work data".into()))?;

        let submit_old = extract_field(body, "submitold").ok();
        let submit_stale = !submit_old
            .as_deref()
            .is_some_and(|v| v.eq_ignore_ascii_case("false"));

        let mut state = self.state.lock().unwrap();
        state.fingerprint = Some(fingerprint);
        self.submit_stale.store(submit_stale, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        drop(state);

        match submit_old {
            Some(v) => info!(submitold = %v, "New block detected by long polling"),
            None => info!("New block detected by long polling"),
        }
        Ok(())
    }

    /// Run the long-poll loop until `shutdown` is cancelled.
    ///
    /// An outstanding request is abandoned on shutdown.
    pub async fn run_long_poll(
        self: Arc<Self>,
        transport: Arc<dyn RpcTransport>,
        shutdown: CancellationToken,
    ) {
        let mut enabled = true;
        let mut warn_once = true;
        let mut enable_at: Option<Instant> = None;

        while enabled {
            let started = Instant::now();
            let endpoint = self.long_poll_endpoint();

            if let Some(endpoint) = &endpoint {
                if enable_at.map_or(true, |t| started >= t) {
                    let outcome = match Url::parse(&endpoint.url) {
                        Err(e) => Err(PoolError::MalformedUrl(format!("{}: {e}", endpoint.url))),
                        Ok(url) => {
                            let request = RpcRequest::getwork(
                                url,
                                &endpoint.user,
                                &endpoint.password,
                                None,
                                LONG_POLL_TIMEOUT,
                            );
                            tokio::select! {
                                _ = shutdown.cancelled() => break,
                                result = transport.post(request) => {
                                    result.and_then(|resp| self.apply_long_poll(&resp.body))
                                }
                            }
                        }
                    };

                    match outcome {
                        Ok(()) => {}
                        Err(PoolError::MalformedUrl(e)) => {
                            warn!(error = %e, "Disabling long polling");
                            enabled = false;
                        }
                        Err(PoolError::Network(e)) => {
                            if started.elapsed() < FAST_FAILURE {
                                warn!(
                                    error = %e,
                                    secs = FAST_FAILURE_COOLDOWN.as_secs(),
                                    "Disabling long polling"
                                );
                                enable_at = Some(Instant::now() + FAST_FAILURE_COOLDOWN);
                            }
                        }
                        Err(e) => {
                            if warn_once {
                                warn!(error = %e, "Long polling failed");
                                warn_once = false;
                            }
                        }
                    }
                }
            } else {
                enable_at = Some(Instant::now() + DISCOVERY_RETRY);
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep_until(started + MIN_LONG_POLL_INTERVAL) => {}
            }
        }

        debug!("Long polling stopped");
    }
}
