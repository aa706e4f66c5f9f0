//! Simulated bus.
//!
//! Unlike hardware buses, its devices are synthesized at startup from the
//! configuration rather than discovered.

use tokio::sync::mpsc;

use super::TransportEvent;
use crate::{
    device::sim::{SimParams, SimulatedDevice},
    error::{Error, Result},
};

/// Name of the bus simulated devices appear on.
pub const SIM_BUS: &str = "sim";

/// Virtual bus with a fixed number of simulated boards.
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    /// Number of boards.
    pub devices: usize,
    /// Compute units per board.
    pub units: usize,
}

impl SimulatedBus {
    pub fn new(devices: usize) -> Self {
        Self { devices, units: 1 }
    }

    /// Serial number of board `index`.
    pub fn serial(index: usize) -> String {
        format!("sim-{:02}", index + 1)
    }

    /// Announce every board.
    pub async fn connect_all(&self, event_tx: &mpsc::Sender<TransportEvent>) -> Result<()> {
        for index in 0..self.devices {
            let mut params = SimParams::new(Self::serial(index));
            params.units = self.units;
            let event = TransportEvent::Connected {
                bus: SIM_BUS.to_string(),
                device: Box::new(SimulatedDevice::new(params)),
            };
            event_tx
                .send(event)
                .await
                .map_err(|_| Error::Other("transport event channel closed".into()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_all_announces_boards() {
        let (tx, mut rx) = mpsc::channel(8);
        let bus = SimulatedBus {
            devices: 2,
            units: 2,
        };
        bus.connect_all(&tx).await.unwrap();

        for expected in ["sim-01", "sim-02"] {
            match rx.recv().await {
                Some(TransportEvent::Connected { bus, device }) => {
                    assert_eq!(bus, SIM_BUS);
                    assert_eq!(device.serial(), expected);
                    assert_eq!(device.unit_count(), 2);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_closed_channel_is_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(SimulatedBus::new(1).connect_all(&tx).await.is_err());
    }
}
