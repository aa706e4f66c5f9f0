//! Bus registry: where devices plug in.
//!
//! Devices reported by the transports are opened into sessions and routed to
//! the scheduler of their bus, which is spawned on the first device and
//! finishes on its own when the bus empties. Disconnects are forwarded to
//! every bus. Devices given up after a fatal fault are remembered and
//! repeated in every status report.

use std::collections::HashMap;

use tokio::sync::mpsc::{self, error::SendError};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    scheduler::{BusCommand, BusEvent, BusScheduler, FaultRecord, SchedulerConfig},
    session::{DeviceSession, SessionContext},
    tracing::prelude::*,
    transport::TransportEvent,
};

/// Queue depth of a bus command channel.
const BUS_COMMAND_CAPACITY: usize = 16;

/// Requests to the registry from outside its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryCommand {
    ResetCounters,
    Report,
}

/// Cloneable handle for controlling a running registry.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Reset the statistics of every scheduled device.
    pub async fn reset_counters(&self) {
        if self.tx.send(RegistryCommand::ResetCounters).await.is_err() {
            debug!("Registry gone, counter reset dropped");
        }
    }

    /// Log bus reports and the list of disabled devices.
    pub async fn report(&self) {
        let _ = self.tx.send(RegistryCommand::Report).await;
    }
}

struct BusHandle {
    id: u64,
    commands: mpsc::Sender<BusCommand>,
}

/// Registry of buses and their schedulers.
pub struct BusRegistry {
    ctx: SessionContext,
    config: SchedulerConfig,
    buses: HashMap<String, BusHandle>,
    next_id: u64,
    faults: Vec<FaultRecord>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    control_rx: mpsc::Receiver<RegistryCommand>,
    events_tx: mpsc::UnboundedSender<BusEvent>,
    events_rx: mpsc::UnboundedReceiver<BusEvent>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl BusRegistry {
    /// Create a registry. Schedulers are spawned on `tracker`.
    pub fn new(
        ctx: SessionContext,
        config: SchedulerConfig,
        transport_rx: mpsc::Receiver<TransportEvent>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> (Self, RegistryHandle) {
        let (control_tx, control_rx) = mpsc::channel(8);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Self {
            ctx,
            config,
            buses: HashMap::new(),
            next_id: 0,
            faults: Vec::new(),
            transport_rx,
            control_rx,
            events_tx,
            events_rx,
            tracker,
            shutdown,
        };
        (registry, RegistryHandle { tx: control_tx })
    }

    /// Run the registry event loop until shutdown.
    pub async fn run(mut self) {
        let mut report = tokio::time::interval(self.config.report_interval);
        report.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        report.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(event) = self.transport_rx.recv() => self.handle_transport(event).await,
                Some(event) = self.events_rx.recv() => self.handle_bus_event(event).await,
                Some(command) = self.control_rx.recv() => self.handle_command(command).await,
                _ = report.tick() => self.report_faults(),
            }
        }

        debug!(buses = self.buses.len(), "Registry stopped");
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { bus, device } => {
                let name = format!("{}/{}", bus, device.serial());
                match DeviceSession::open(name.clone(), device, self.ctx.clone()).await {
                    Ok(session) => self.attach(&bus, session).await,
                    Err(e) => {
                        error!(device = %name, error = %e, "Device not scheduled");
                        self.faults.push(FaultRecord {
                            bus,
                            device: name,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            TransportEvent::Disconnected { serial } => {
                debug!(serial = %serial, "Device disconnected");
                for handle in self.buses.values() {
                    let detach = BusCommand::Detach {
                        serial: serial.clone(),
                    };
                    // A closed bus has no sessions left.
                    let _ = handle.commands.send(detach).await;
                }
            }
        }
    }

    async fn handle_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Fault(record) => self.faults.push(record),
            BusEvent::Finished { bus, id, orphans } => {
                if self.buses.get(&bus).is_some_and(|h| h.id == id) {
                    self.buses.remove(&bus);
                    debug!(bus = %bus, "Bus scheduler finished");
                }
                for session in orphans {
                    self.attach(&bus, session).await;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: RegistryCommand) {
        let bus_command: fn() -> BusCommand = match command {
            RegistryCommand::ResetCounters => {
                info!("Resetting counters");
                || BusCommand::ResetCounters
            }
            RegistryCommand::Report => {
                self.report_faults();
                || BusCommand::Report
            }
        };
        for handle in self.buses.values() {
            let _ = handle.commands.send(bus_command()).await;
        }
    }

    /// Route a session to the scheduler of `bus`, spawning one if needed.
    async fn attach(&mut self, bus: &str, session: DeviceSession) {
        let session = match self.buses.get(bus) {
            Some(handle) => match handle.commands.send(BusCommand::Attach(session)).await {
                Ok(()) => return,
                // The scheduler finished in the meantime.
                Err(SendError(BusCommand::Attach(session))) => session,
                Err(_) => return,
            },
            None => session,
        };
        self.spawn_bus(bus, vec![session]);
    }

    fn spawn_bus(&mut self, bus: &str, sessions: Vec<DeviceSession>) {
        self.next_id += 1;
        let id = self.next_id;

        // Queue the sessions before the scheduler first looks at its arena.
        let (tx, rx) = mpsc::channel(BUS_COMMAND_CAPACITY.max(sessions.len()));
        for session in sessions {
            if let Err(e) = tx.try_send(BusCommand::Attach(session)) {
                error!(bus = %bus, error = %e, "Failed to queue device");
            }
        }

        let scheduler = BusScheduler::new(
            bus.to_string(),
            id,
            self.config.clone(),
            rx,
            self.events_tx.clone(),
            self.shutdown.clone(),
        );
        self.tracker.spawn(scheduler.run());
        self.buses.insert(bus.to_string(), BusHandle { id, commands: tx });
        debug!(bus = %bus, "Bus scheduler spawned");
    }

    fn report_faults(&self) {
        for fault in &self.faults {
            warn!(
                bus = %fault.bus,
                device = %fault.device,
                reason = %fault.reason,
                "Device disabled"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_monitor::BlockMonitor;
    use crate::device::tests::descriptor_bytes;
    use crate::pool::client::tests::work_body;
    use crate::pool::rpc::tests::MockTransport;
    use crate::session::tests::{context, wire, MockDevice};
    use std::sync::Arc;
    use std::time::Duration;

    fn registry(transport: &Arc<MockTransport>) -> (BusRegistry, mpsc::Sender<TransportEvent>) {
        let monitor = Arc::new(BlockMonitor::new(None));
        let (tx, rx) = mpsc::channel(8);
        let (registry, _handle) = BusRegistry::new(
            context(transport, &monitor),
            SchedulerConfig::default(),
            rx,
            TaskTracker::new(),
            CancellationToken::new(),
        );
        (registry, tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_schedules_and_disconnect_releases() {
        let transport = Arc::new(MockTransport::default());
        transport.push_body(work_body(&wire(1, 1), None));
        let (mut registry, _tx) = registry(&transport);

        let (device, state) = MockDevice::new("dev1");
        registry
            .handle_transport(TransportEvent::Connected {
                bus: "usb0".into(),
                device: Box::new(device),
            })
            .await;
        assert!(registry.buses.contains_key("usb0"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(state.lock().unwrap().sent.len(), 1);

        registry
            .handle_transport(TransportEvent::Disconnected {
                serial: "dev1".into(),
            })
            .await;
        match registry.events_rx.recv().await {
            Some(event @ BusEvent::Finished { .. }) => registry.handle_bus_event(event).await,
            _ => panic!("expected Finished"),
        }
        assert_eq!(state.lock().unwrap().suspended, 1);
        assert!(registry.buses.is_empty());
        assert!(registry.faults.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_descriptor_not_scheduled() {
        let transport = Arc::new(MockTransport::default());
        let (mut registry, _tx) = registry(&transport);

        let (mut device, _state) = MockDevice::new("old");
        device.descriptor = descriptor_bytes(3, 1, 0, "x");
        registry
            .handle_transport(TransportEvent::Connected {
                bus: "usb0".into(),
                device: Box::new(device),
            })
            .await;

        assert!(registry.buses.is_empty());
        assert_eq!(registry.faults.len(), 1);
        assert_eq!(registry.faults[0].device, "usb0/old");
        assert!(registry.faults[0].reason.contains("version 3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphans_get_new_scheduler() {
        let transport = Arc::new(MockTransport::default());
        let (mut registry, _tx) = registry(&transport);

        let monitor = Arc::new(BlockMonitor::new(None));
        let (device, state) = MockDevice::new("late");
        let session = DeviceSession::open("usb1/late".into(), Box::new(device), context(&transport, &monitor))
            .await
            .unwrap();

        registry
            .handle_bus_event(BusEvent::Finished {
                bus: "usb1".into(),
                id: 42,
                orphans: vec![session],
            })
            .await;
        assert!(registry.buses.contains_key("usb1"));

        // The new scheduler polls the pool for the orphan.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!transport.requests().is_empty());
        assert_eq!(state.lock().unwrap().suspended, 0);
    }
}
