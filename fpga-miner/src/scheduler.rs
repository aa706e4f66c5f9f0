//! Per-bus poll loop.
//!
//! Each bus gets one scheduler task that owns the sessions of the devices on
//! that bus. Every cycle it steps each session once, walking the session
//! order from the end backward so that a session removed after a fatal fault
//! does not disturb the indices still to be visited. Attach, detach and
//! reset requests arrive on a channel and are applied between sweeps, never
//! during one.
//!
//! The scheduler finishes when its last session is gone and no attach is
//! pending. Attach requests that race with the exit are handed back to the
//! registry in [`BusEvent::Finished`].

use std::time::Duration;

use slotmap::SlotMap;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::session::DeviceSession;
use crate::tracing::prelude::*;
use crate::types::{DecayedAverage, DecayedRatio, HashRate};

/// Handle of a session inside a bus arena.
pub type SessionId = slotmap::DefaultKey;

/// Decay of the bus timing statistics, applied once per sweep.
const TIMING_DECAY: f64 = 0.9998;

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Minimum duration of one sweep.
    pub poll_interval: Duration,
    /// Interval of the bus report.
    pub report_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            report_interval: Duration::from_secs(30),
        }
    }
}

/// Requests applied between sweeps.
pub enum BusCommand {
    /// Start scheduling an opened session.
    Attach(DeviceSession),
    /// Suspend and release every session of the device with this serial.
    Detach { serial: String },
    /// Reset the statistics of every session.
    ResetCounters,
    /// Log the bus report now.
    Report,
}

/// A device given up after a fatal fault.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultRecord {
    pub bus: String,
    pub device: String,
    pub reason: String,
}

/// Notifications from a scheduler to the registry.
pub enum BusEvent {
    Fault(FaultRecord),
    /// The scheduler exited. `orphans` are sessions attached while it was
    /// shutting down; they still need a scheduler.
    Finished {
        bus: String,
        id: u64,
        orphans: Vec<DeviceSession>,
    },
}

/// Fixed-period cycle clock.
///
/// Sleeps until the next deadline. When a sweep overran the period the
/// sleep is skipped and the next deadline counts from now, so a slow sweep
/// never causes a burst of catch-up cycles.
#[derive(Debug)]
pub struct Ticker {
    period: Duration,
    next: Instant,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    pub async fn tick(&mut self) {
        let now = Instant::now();
        if now < self.next {
            sleep_until(self.next).await;
            self.next += self.period;
        } else {
            self.next = now + self.period;
        }
    }
}

/// Decayed timing of the sweeps of one bus, in milliseconds.
#[derive(Debug, Clone, Copy)]
struct BusTiming {
    sweep: DecayedAverage,
    device: DecayedRatio,
    network: DecayedRatio,
}

impl BusTiming {
    fn new() -> Self {
        Self {
            sweep: DecayedAverage::new(TIMING_DECAY),
            device: DecayedRatio::new(TIMING_DECAY),
            network: DecayedRatio::new(TIMING_DECAY),
        }
    }

    fn record(&mut self, sweep: Duration, network: Duration) {
        let sweep_ms = sweep.as_secs_f64() * 1000.0;
        let network_ms = network.as_secs_f64() * 1000.0;
        self.sweep.add(sweep_ms);
        self.device.add((sweep_ms - network_ms).max(0.0), 1.0);
        self.network.add(network_ms, 1.0);
    }
}

/// Scheduler of one bus.
pub struct BusScheduler {
    bus: String,
    id: u64,
    config: SchedulerConfig,
    sessions: SlotMap<SessionId, DeviceSession>,
    /// Service order; newest session last.
    order: Vec<SessionId>,
    commands: mpsc::Receiver<BusCommand>,
    events: mpsc::UnboundedSender<BusEvent>,
    shutdown: CancellationToken,
    timing: BusTiming,
    overflows: u64,
    last_report: Instant,
}

impl BusScheduler {
    pub fn new(
        bus: String,
        id: u64,
        config: SchedulerConfig,
        commands: mpsc::Receiver<BusCommand>,
        events: mpsc::UnboundedSender<BusEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            bus,
            id,
            config,
            sessions: SlotMap::new(),
            order: Vec::new(),
            commands,
            events,
            shutdown,
            timing: BusTiming::new(),
            overflows: 0,
            last_report: Instant::now(),
        }
    }

    /// Run until the bus is empty or shutdown is requested.
    pub async fn run(mut self) {
        debug!(bus = %self.bus, "Scheduler started");
        let mut ticker = Ticker::new(self.config.poll_interval);

        let orphans = loop {
            self.apply_pending().await;

            if self.shutdown.is_cancelled() {
                self.release_all().await;
                break Vec::new();
            }
            if self.sessions.is_empty() {
                break self.close().await;
            }

            self.sweep().await;

            if self.last_report.elapsed() >= self.config.report_interval {
                self.report();
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = ticker.tick() => {}
            }
        };

        debug!(bus = %self.bus, orphans = orphans.len(), "Scheduler finished");
        let _ = self.events.send(BusEvent::Finished {
            bus: self.bus.clone(),
            id: self.id,
            orphans,
        });
    }

    async fn apply_pending(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.apply(command).await,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    async fn apply(&mut self, command: BusCommand) {
        match command {
            BusCommand::Attach(session) => {
                info!(bus = %self.bus, device = %session.name(), "Scheduling device");
                let id = self.sessions.insert(session);
                self.order.push(id);
            }
            BusCommand::Detach { serial } => {
                for i in (0..self.order.len()).rev() {
                    let id = self.order[i];
                    if self.sessions.get(id).is_some_and(|s| s.serial() == serial) {
                        self.order.remove(i);
                        if let Some(mut session) = self.sessions.remove(id) {
                            info!(bus = %self.bus, device = %session.name(), "Device detached");
                            session.suspend().await;
                        }
                    }
                }
            }
            BusCommand::ResetCounters => {
                let now = Instant::now();
                for session in self.sessions.values_mut() {
                    session.reset_counters(now);
                }
                info!(bus = %self.bus, "Counters reset");
            }
            BusCommand::Report => self.report(),
        }
    }

    /// Step every session once.
    async fn sweep(&mut self) {
        let started = Instant::now();
        let mut network = Duration::ZERO;

        for i in (0..self.order.len()).rev() {
            let id = self.order[i];
            let Some(session) = self.sessions.get_mut(id) else {
                self.order.remove(i);
                continue;
            };

            let result = session.step(Instant::now()).await;
            network += session.take_network_time();
            self.overflows += session.take_overflows();

            let Err(e) = result else {
                continue;
            };
            if session.is_fatal(&e) {
                let reason = e.to_string();
                self.retire(i, reason).await;
            } else {
                debug!(device = %session.name(), error = %e, "Step failed");
            }
        }

        self.timing.record(started.elapsed(), network);
    }

    /// Remove the session at `order[i]` after a fatal fault.
    async fn retire(&mut self, i: usize, reason: String) {
        let id = self.order.remove(i);
        let Some(mut session) = self.sessions.remove(id) else {
            return;
        };
        error!(device = %session.name(), reason = %reason, "Device disabled");
        session.suspend().await;
        let _ = self.events.send(BusEvent::Fault(FaultRecord {
            bus: self.bus.clone(),
            device: session.name().to_string(),
            reason,
        }));
    }

    async fn release_all(&mut self) {
        for id in self.order.drain(..) {
            if let Some(mut session) = self.sessions.remove(id) {
                session.suspend().await;
            }
        }
    }

    /// Stop accepting requests. Returns sessions attached in the meantime.
    async fn close(&mut self) -> Vec<DeviceSession> {
        self.commands.close();
        let mut orphans: Vec<DeviceSession> = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                BusCommand::Attach(session) => orphans.push(session),
                BusCommand::Detach { serial } => {
                    let (gone, kept): (Vec<_>, Vec<_>) = orphans.into_iter().partition(|s| s.serial() == serial);
                    orphans = kept;
                    for mut session in gone {
                        session.suspend().await;
                    }
                }
                BusCommand::ResetCounters | BusCommand::Report => {}
            }
        }
        orphans
    }

    fn report(&mut self) {
        self.last_report = Instant::now();

        let (mut getwork, mut getwork_weight, mut submit, mut submit_weight) = (0.0, 0.0, 0.0, 0.0);
        for session in self.sessions.values() {
            let t = session.pool_timing();
            getwork += t.getwork_ms * t.getwork_weight;
            getwork_weight += t.getwork_weight;
            submit += t.submit_ms * t.submit_weight;
            submit_weight += t.submit_weight;
        }
        let avg = |sum: f64, weight: f64| if weight > 0.0 { sum / weight } else { 0.0 };
        let hash_rate: HashRate = self.sessions.values().map(DeviceSession::hash_rate).sum();

        info!(
            bus = %self.bus,
            devices = self.sessions.len(),
            hash_rate = %hash_rate.to_human_readable(),
            loop_ms = %format!("{:.1}", self.timing.sweep.value()),
            device_ms = %format!("{:.1}", self.timing.device.ratio()),
            network_ms = %format!("{:.1}", self.timing.network.ratio()),
            getwork_ms = %format!("{:.1}", avg(getwork, getwork_weight)),
            submit_ms = %format!("{:.1}", avg(submit, submit_weight)),
            "Bus status"
        );

        if self.overflows > 0 {
            warn!(
                bus = %self.bus,
                overflows = self.overflows,
                "Nonce counter overflows detected, poll interval too long"
            );
            self.overflows = 0;
        }
    }
}
