//! Daemon lifecycle management for fpga-miner.
//!
//! This module handles the core daemon functionality including initialization,
//! task management, signal handling, and graceful shutdown.

use std::sync::Arc;

use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::tracing::prelude::*;
use crate::{
    backplane::BusRegistry,
    block_monitor::BlockMonitor,
    config::MinerConfig,
    error::{Error, Result},
    pool::{HttpTransport, RpcTransport},
    pow::Sha256d,
    session::SessionContext,
    share_log::ShareLog,
    transport::{SimulatedBus, TransportEvent},
};

/// The main daemon.
pub struct Daemon {
    config: MinerConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Create a new daemon instance.
    pub fn new(config: MinerConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = &self.config;
        let monitor = Arc::new(BlockMonitor::new(config.long_poll.clone()));
        let ctx = session_context(config, &monitor)?;
        let transport = Arc::clone(&ctx.transport);

        for endpoint in &config.endpoints {
            info!(url = %endpoint.url, user = %endpoint.user, "Pool endpoint");
        }

        // Create and start the bus registry
        let (transport_tx, transport_rx) = mpsc::channel::<TransportEvent>(100);
        let (registry, registry_handle) = BusRegistry::new(
            ctx,
            config.scheduler_config(),
            transport_rx,
            self.tracker.clone(),
            self.shutdown.clone(),
        );
        self.tracker.spawn(registry.run());

        // New block detection by long polling
        self.tracker
            .spawn(Arc::clone(&monitor).run_long_poll(transport, self.shutdown.clone()));

        // Attach simulated boards if configured
        if config.sim_devices > 0 {
            let bus = SimulatedBus {
                devices: config.sim_devices,
                units: config.sim_units,
            };
            info!(devices = bus.devices, units = bus.units, "Simulated devices enabled");
            bus.connect_all(&transport_tx).await?;
        } else {
            warn!("No devices configured (set FPGA_MINER_SIM_DEVICES to attach simulated boards)");
        }

        self.tracker.close();

        info!("Started.");
        info!("For debugging, set RUST_LOG=fpga_miner=debug or trace.");

        // Install signal handlers
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        let mut sighup = unix::signal(SignalKind::hangup())?;

        // Wait for shutdown signal, resetting counters on SIGHUP
        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT.");
                    break;
                },
                _ = sigterm.recv() => {
                    info!("Received SIGTERM.");
                    break;
                },
                _ = sighup.recv() => {
                    info!("Received SIGHUP.");
                    registry_handle.reset_counters().await;
                },
            }
        }

        // Initiate shutdown
        drop(transport_tx);
        self.shutdown.cancel();

        // Wait for all tasks to complete
        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }
}

/// Build the state shared by every device session.
fn session_context(config: &MinerConfig, monitor: &Arc<BlockMonitor>) -> Result<SessionContext> {
    let client = config.client_config();
    let transport: Arc<dyn RpcTransport> = Arc::new(HttpTransport::new(client.request_timeout())?);

    let share_log = match &config.share_log {
        Some(path) => {
            let log = ShareLog::open(path).map_err(|source| Error::ShareLog {
                path: path.clone(),
                source,
            })?;
            Some(Arc::new(log))
        }
        None => None,
    };

    Ok(SessionContext {
        endpoints: config.endpoints.clone(),
        transport,
        monitor: Arc::clone(monitor),
        pow: Arc::new(Sha256d),
        client,
        session: config.session_config(),
        share_log,
    })
}
