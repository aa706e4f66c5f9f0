//! Device discovery events.
//!
//! Discovery produces opened devices on a named bus and reports their
//! removal by serial number. What the devices are and how they are mined is
//! decided by the registry, not here.

pub mod sim;

use std::fmt;

use crate::device::FpgaDevice;

pub use sim::SimulatedBus;

/// Device appeared on or disappeared from a bus.
pub enum TransportEvent {
    Connected {
        bus: String,
        device: Box<dyn FpgaDevice>,
    },
    Disconnected {
        serial: String,
    },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Connected { bus, device } => f
                .debug_struct("Connected")
                .field("bus", bus)
                .field("serial", &device.serial())
                .finish(),
            TransportEvent::Disconnected { serial } => f
                .debug_struct("Disconnected")
                .field("serial", serial)
                .finish(),
        }
    }
}
