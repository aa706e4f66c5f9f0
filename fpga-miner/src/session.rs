//! One device bound to its pool client and frequency controllers.
//!
//! A session is stepped once per scheduler cycle. For every compute unit of
//! the board it decides whether new work is needed, fetches and dispatches
//! it (harvesting results of the previous work first when the block policy
//! allows), otherwise reads and submits results, and finally lets the
//! frequency controller tune the clock.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;

use crate::{
    block_monitor::BlockMonitor,
    device::{
        DescriptorError, DeviceDescriptor, DeviceError, FpgaDevice, ResultRecords, DESCRIPTOR_LEN,
        DEVICE_TARGET, OP_READ_DESCRIPTOR, OP_READ_RESULTS, OP_SEND_WORK, WORK_PAYLOAD_LEN,
    },
    frequency::{FrequencyConfig, FrequencyController, FrequencyFault},
    pool::{ClientConfig, PoolClient, PoolEndpoint, PoolError, PoolTiming, RpcTransport},
    pow::PowHash,
    share_log::ShareLog,
    tracing::prelude::*,
    types::HashRate,
    work::{RecentNonces, WorkUnit, HASHES_PER_NONCE, RECENT_NONCES},
};

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub frequency: FrequencyConfig,
    /// Consecutive device errors tolerated before the device is given up.
    pub max_transport_errors: u32,
    /// Fetch new work at least this often.
    pub max_work_age: Duration,
    /// Interval of the per-unit status line.
    pub status_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frequency: FrequencyConfig::default(),
            max_transport_errors: 8,
            max_work_age: Duration::from_secs(20),
            status_interval: Duration::from_secs(15),
        }
    }
}

/// Everything a session shares with the rest of the miner.
#[derive(Clone)]
pub struct SessionContext {
    pub endpoints: Vec<PoolEndpoint>,
    pub transport: Arc<dyn RpcTransport>,
    pub monitor: Arc<BlockMonitor>,
    pub pow: Arc<dyn PowHash>,
    pub client: ClientConfig,
    pub session: SessionConfig,
    pub share_log: Option<Arc<ShareLog>>,
}

/// How the scheduler treats an error returned from a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Pool trouble; the client has already applied its cool-down.
    Pool,
    /// Device trouble; fatal after too many in a row.
    Transport,
    /// The device is given up.
    Fatal,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("pool: {0}")]
    Pool(#[from] PoolError),

    #[error("device: {0}")]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Fault(#[from] FrequencyFault),

    #[error("firmware: {0}")]
    Descriptor(#[from] DescriptorError),
}

impl SessionError {
    pub fn class(&self) -> FaultClass {
        match self {
            SessionError::Pool(_) => FaultClass::Pool,
            SessionError::Device(_) => FaultClass::Transport,
            SessionError::Fault(_) | SessionError::Descriptor(_) => FaultClass::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Whether results of the previous work may be harvested before new work
/// replaces it.
///
/// Allowed while no new block has been seen since the work was fetched, or
/// across exactly one block change when the pool accepts stale work.
pub fn harvest_allowed(local_gen: u64, monitor_gen: u64, submit_stale: bool) -> bool {
    local_gen >= monitor_gen || (submit_stale && monitor_gen == local_gen + 1)
}

/// Per compute unit state.
struct UnitState {
    index: usize,
    name: String,
    controller: FrequencyController,
    work: Option<WorkUnit>,
    /// Block generation the current work belongs to.
    local_gen: u64,
    /// Last progress counter per nonce unit.
    progress: Vec<u32>,
    recent: RecentNonces,
    last_temperature: Option<f64>,
    last_status: Option<Instant>,
    submitted_since_status: u64,
    total_submitted: u64,
    invalid: u64,
    stats_started: Instant,
}

/// One attached device.
pub struct DeviceSession {
    name: String,
    device: Box<dyn FpgaDevice>,
    descriptor: DeviceDescriptor,
    pool: PoolClient,
    units: Vec<UnitState>,
    ctx: SessionContext,
    overflows: u64,
    transport_errors: u32,
    network_time: Duration,
}

impl DeviceSession {
    /// Read the firmware descriptor and bring every unit to its default
    /// clock.
    pub async fn open(name: String, mut device: Box<dyn FpgaDevice>, ctx: SessionContext) -> Result<Self> {
        let raw = device.read_result(OP_READ_DESCRIPTOR, DESCRIPTOR_LEN).await?;
        let descriptor = DeviceDescriptor::parse(&raw)?;
        if descriptor.is_outdated() {
            warn!(device = %name, version = descriptor.version, "Firmware out of date");
        }
        info!(device = %name, descriptor = %descriptor.summary(), "Device attached");

        let now = Instant::now();
        let unit_count = device.unit_count().max(1);
        let mut units = Vec::with_capacity(unit_count);
        for index in 0..unit_count {
            let unit_name = if unit_count > 1 {
                format!("{}-{}", name, index + 1)
            } else {
                name.clone()
            };
            let mut controller = FrequencyController::new(&descriptor, ctx.session.frequency);
            device.select_unit(index).await?;
            device.set_frequency_step(controller.current_step()).await?;
            controller.note_frequency_change(now);

            units.push(UnitState {
                index,
                name: unit_name,
                controller,
                work: None,
                local_gen: ctx.monitor.generation(),
                progress: vec![0; descriptor.num_nonces],
                recent: RecentNonces::new(),
                last_temperature: None,
                last_status: None,
                submitted_since_status: 0,
                total_submitted: 0,
                invalid: 0,
                stats_started: now,
            });
        }

        let pool = PoolClient::new(
            name.clone(),
            ctx.endpoints.clone(),
            Arc::clone(&ctx.transport),
            Arc::clone(&ctx.monitor),
            ctx.client.clone(),
        );

        Ok(Self {
            name,
            device,
            descriptor,
            pool,
            units,
            ctx,
            overflows: 0,
            transport_errors: 0,
            network_time: Duration::ZERO,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serial(&self) -> &str {
        self.device.serial()
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn pool_timing(&self) -> PoolTiming {
        self.pool.timing()
    }

    /// Consecutive device errors so far.
    pub fn transport_errors(&self) -> u32 {
        self.transport_errors
    }

    /// Whether `error` ends this session.
    pub fn is_fatal(&self, error: &SessionError) -> bool {
        match error.class() {
            FaultClass::Pool => false,
            FaultClass::Transport => self.transport_errors > self.ctx.session.max_transport_errors,
            FaultClass::Fatal => true,
        }
    }

    /// Progress counter overflows since the last call.
    pub fn take_overflows(&mut self) -> u64 {
        std::mem::take(&mut self.overflows)
    }

    /// Time spent in pool requests since the last call.
    pub fn take_network_time(&mut self) -> Duration {
        std::mem::take(&mut self.network_time)
    }

    /// Current estimated hash rate over all units.
    pub fn hash_rate(&self) -> HashRate {
        self.units
            .iter()
            .map(|unit| self.unit_hash_rate(unit))
            .sum()
    }

    fn unit_hash_rate(&self, unit: &UnitState) -> HashRate {
        let rate = unit.controller.current_bin().rate;
        HashRate(unit.controller.frequency_mhz() * 1e6 * (1.0 - rate) * self.descriptor.hashes_per_clock)
    }

    /// Run one cycle for every unit.
    pub async fn step(&mut self, now: Instant) -> Result<()> {
        let result = self.step_units(now).await;
        match &result {
            Ok(()) => self.transport_errors = 0,
            Err(SessionError::Device(_)) => self.transport_errors += 1,
            Err(_) => {}
        }
        result
    }

    async fn step_units(&mut self, now: Instant) -> Result<()> {
        let mut pool_error = None;
        for u in 0..self.units.len() {
            let index = self.units[u].index;
            self.device.select_unit(index).await?;

            // Pool faults wait until every unit had its thermal check.
            match self.exchange(u, now).await {
                Err(e @ SessionError::Pool(_)) => {
                    pool_error.get_or_insert(e);
                }
                result => result?,
            }

            self.tune(u, now).await?;
            self.report_status(u, now);
        }
        pool_error.map_or(Ok(()), Err)
    }

    /// Fetch and dispatch work for unit `u` when needed, otherwise harvest.
    async fn exchange(&mut self, u: usize, now: Instant) -> Result<()> {
        if !self.needs_work(u, now) {
            return self.harvest(u, now).await.map(drop);
        }

        let started = Instant::now();
        let fetched = self.pool.fetch_work(now).await;
        self.network_time += started.elapsed();

        match fetched {
            Ok(work) => self.replace_work(u, work, now).await,
            Err(PoolError::NoEndpointAvailable) => self.harvest(u, now).await.map(drop),
            Err(e) => {
                self.harvest(u, now).await?;
                Err(e.into())
            }
        }
    }

    fn needs_work(&self, u: usize, now: Instant) -> bool {
        let unit = &self.units[u];
        let Some(work) = &unit.work else {
            return true;
        };
        if unit.controller.in_grace(now) {
            return false;
        }
        if !self.pool.is_available(work.endpoint, now) {
            return true;
        }
        if now.saturating_duration_since(work.fetched_at) >= self.ctx.session.max_work_age {
            return true;
        }
        let mut rng = rand::thread_rng();
        unit.progress.iter().any(|&nonce| {
            let limit = 0x3800_0000u32 + rng.gen_range(0..=0x1000_0000u32);
            (nonce >> 1) & 0x7fff_ffff > limit
        })
    }

    /// Feed fresh work to unit `u`.
    async fn replace_work(&mut self, u: usize, work: WorkUnit, now: Instant) -> Result<()> {
        self.ctx.monitor.check_fetched(work.wire())?;
        let monitor_gen = self.ctx.monitor.generation();
        let submit_stale = self.ctx.monitor.submit_stale();

        let unit = &self.units[u];
        if unit.work.is_some() && harvest_allowed(unit.local_gen, monitor_gen, submit_stale) {
            for _ in 0..RECENT_NONCES {
                if self.harvest(u, now).await? == 0 {
                    break;
                }
            }
        }

        let mut payload = [0u8; WORK_PAYLOAD_LEN];
        payload[..4].copy_from_slice(&DEVICE_TARGET);
        payload[4..].copy_from_slice(&work.header());
        self.device.send_command(OP_SEND_WORK, &payload).await?;
        debug!(device = %self.units[u].name, endpoint = work.endpoint, "Sent new work");

        let unit = &mut self.units[u];
        unit.local_gen = monitor_gen;
        unit.work = Some(work);
        unit.progress.iter_mut().for_each(|p| *p = 0);
        unit.controller.note_dispatch(now);
        Ok(())
    }

    /// Read results of unit `u`, record the error-rate outcome and submit
    /// new golden nonces. Returns the number of submissions.
    async fn harvest(&mut self, u: usize, now: Instant) -> Result<usize> {
        let Some(work) = self.units[u].work.clone() else {
            return Ok(0);
        };
        if !self.pool.is_available(work.endpoint, now) {
            return Ok(0);
        }

        let len = self.descriptor.num_nonces * self.descriptor.record_len();
        let raw = self.device.read_result(OP_READ_RESULTS, len).await?;
        let records = ResultRecords::decode(&self.descriptor, &raw)?;

        let header = work.header();
        let pow = Arc::clone(&self.ctx.pow);
        let unit = &mut self.units[u];

        let mut overflow = false;
        let mut failures = 0;
        for (prev, sample) in unit.progress.iter_mut().zip(&records.samples) {
            overflow |= (sample.nonce >> 4) & 0x0fff_ffff < (*prev >> 4) & 0x0fff_ffff;
            *prev = sample.nonce;
            if pow.hash7(&header, sample.nonce) != sample.hash7 {
                failures += 1;
            }
        }
        if overflow {
            self.overflows += 1;
        }
        unit.controller
            .record_outcomes(failures, records.samples.len(), now);

        let mut submitted = 0;
        for nonce in records.golden {
            let unit = &mut self.units[u];
            if unit.recent.contains(nonce) {
                continue;
            }
            if !work.target().is_met_by(&pow.hash(&header, nonce)) {
                // Remembered so a unit repeating it is not counted twice.
                unit.recent.insert(nonce);
                unit.invalid += 1;
                debug!(device = %unit.name, nonce = %format!("{nonce:08x}"), "Golden nonce does not meet target");
                continue;
            }

            let started = Instant::now();
            let ack = self.pool.submit_nonce(&work, nonce, now).await;
            self.network_time += started.elapsed();
            let ack = ack?;

            let unit = &mut self.units[u];
            unit.recent.insert(nonce);
            unit.submitted_since_status += 1;
            unit.total_submitted += 1;
            submitted += 1;

            info!(
                device = %unit.name,
                nonce = %format!("{nonce:08x}"),
                accepted = ack.accepted,
                "Submitted nonce"
            );
            if let Some(log) = &self.ctx.share_log {
                log.record(&unit.name, nonce, &ack.endpoint, ack.accepted);
            }
        }
        Ok(submitted)
    }

    /// Let the controller tune unit `u` and check its fault conditions.
    async fn tune(&mut self, u: usize, now: Instant) -> Result<()> {
        let temperature = self.device.read_temperature().await.ok();
        let unit = &mut self.units[u];
        unit.last_temperature = temperature;

        let previous = unit.controller.current_step();
        match unit.controller.evaluate(temperature) {
            Ok(None) => Ok(()),
            Ok(Some(step)) => {
                info!(
                    device = %unit.name,
                    change = %unit.controller.describe_change(previous, step),
                    "Set frequency"
                );
                unit.controller.note_frequency_change(now);
                self.device.set_frequency_step(step).await?;
                Ok(())
            }
            Err(fault) => {
                error!(device = %unit.name, error = %fault, "Shutting down unit");
                if let Err(e) = self.device.reset_unit().await {
                    warn!(device = %unit.name, error = %e, "Unit reset failed");
                }
                Err(fault.into())
            }
        }
    }

    fn report_status(&mut self, u: usize, now: Instant) {
        let interval = self.ctx.session.status_interval;
        let hash_rate = self.unit_hash_rate(&self.units[u]);
        let unit = &mut self.units[u];
        if unit.work.is_none() {
            return;
        }
        if unit.last_status.is_some_and(|t| now < t + interval) {
            return;
        }
        unit.last_status = Some(now);

        let bin = unit.controller.current_bin();
        let elapsed = now.saturating_duration_since(unit.stats_started).as_secs_f64();
        let submitted_rate = if elapsed > 0.0 {
            unit.total_submitted as f64 * HASHES_PER_NONCE / elapsed
        } else {
            0.0
        };
        let luck = if hash_rate.0 > 0.0 {
            submitted_rate / hash_rate.0
        } else {
            0.0
        };

        let error_rate = (bin.weight > 20.0).then(|| format!("{:.2}%", bin.rate * 100.0));
        let max_error_rate = (bin.weight > 100.0).then(|| format!("{:.2}%", bin.max_rate * 100.0));
        let rate = (bin.weight > 20.0).then(|| hash_rate.to_human_readable());
        let temperature = unit.last_temperature.map(|t| format!("{t:.1}C"));

        info!(
            device = %unit.name,
            freq = %format!("{:.2}MHz", unit.controller.frequency_mhz()),
            error_rate = error_rate.as_deref(),
            max_error_rate = max_error_rate.as_deref(),
            hash_rate = rate.as_deref(),
            temperature = temperature.as_deref(),
            submitted = unit.submitted_since_status,
            invalid = unit.invalid,
            luck = %format!("{luck:.2}"),
            "Status"
        );
        unit.submitted_since_status = 0;
    }

    /// Forget most of the tuning statistics and restart the submission
    /// statistics of every unit.
    pub fn reset_counters(&mut self, now: Instant) {
        for unit in &mut self.units {
            unit.controller.reset_counters();
            unit.total_submitted = 0;
            unit.invalid = 0;
            unit.stats_started = now;
        }
    }

    /// Put every unit into its suspended state before the device is
    /// released.
    pub async fn suspend(&mut self) {
        for u in 0..self.units.len() {
            let index = self.units[u].index;
            let result = match self.device.select_unit(index).await {
                Ok(()) => self.device.suspend().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(true) => debug!(device = %self.units[u].name, "Suspended"),
                Ok(false) => warn!(device = %self.units[u].name, "Suspend not supported, update firmware"),
                Err(e) => warn!(device = %self.units[u].name, error = %e, "Suspend command failed"),
            }
        }
    }
}
