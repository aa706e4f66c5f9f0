//! Simulated FPGA board.
//!
//! Provides a virtual device for development and tests. The board hashes a
//! small window of nonces on the host each time results are read, advances
//! its progress counters with wall-clock time and the selected frequency,
//! and corrupts a share of its results above a configurable stable step so
//! the frequency controller has something to tune against.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;

use super::{
    DeviceError, FpgaDevice, Result, DESCRIPTOR_LEN, OP_READ_DESCRIPTOR, OP_READ_RESULTS,
    OP_SEND_WORK, WORK_PAYLOAD_LEN,
};
use crate::{
    pow::{PowHash, Sha256d},
    work::HEADER_LEN,
};

/// Parameters of a simulated board.
#[derive(Debug, Clone)]
pub struct SimParams {
    pub serial: String,
    pub units: usize,
    /// MHz per frequency step.
    pub freq_unit_mhz: f64,
    pub default_step: u8,
    pub max_step: u8,
    /// Highest step that produces no errors.
    pub stable_step: u8,
    /// Additional error probability per step above `stable_step`.
    pub error_slope: f64,
    /// Nonces hashed on the host per unit and read.
    pub scan_window: u32,
    /// Simulated die temperature in degrees Celsius.
    pub temperature: f64,
}

impl SimParams {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            units: 1,
            freq_unit_mhz: 4.0,
            default_step: 49,
            max_step: 59,
            stable_step: 54,
            error_slope: 0.02,
            scan_window: 256,
            temperature: 45.0,
        }
    }
}

struct SimUnit {
    header: Option<[u8; HEADER_LEN]>,
    started: Instant,
    /// Next nonce the host-side scan checks.
    scan_next: u32,
    golden: Vec<u32>,
    step: u8,
    suspended: bool,
}

impl SimUnit {
    fn new(step: u8) -> Self {
        Self {
            header: None,
            started: Instant::now(),
            scan_next: 0,
            golden: Vec::new(),
            step,
            suspended: false,
        }
    }
}

/// Virtual FPGA board implementing [`FpgaDevice`].
pub struct SimulatedDevice {
    params: SimParams,
    units: Vec<SimUnit>,
    selected: usize,
    pow: Arc<dyn PowHash>,
}

impl SimulatedDevice {
    pub fn new(params: SimParams) -> Self {
        let units = (0..params.units)
            .map(|_| SimUnit::new(params.default_step))
            .collect();
        Self {
            params,
            units,
            selected: 0,
            pow: Arc::new(Sha256d),
        }
    }

    /// 64-byte descriptor in the current (version 5) layout.
    fn descriptor(&self) -> Vec<u8> {
        let mut buf = vec![0u8; DESCRIPTOR_LEN];
        buf[0] = 5;
        buf[1] = 0; // one nonce unit
        buf[2..4].copy_from_slice(&10000u16.to_le_bytes());
        let unit = (self.params.freq_unit_mhz * 100.0).round() as u16;
        buf[4..6].copy_from_slice(&unit.to_le_bytes());
        buf[6] = self.params.default_step;
        buf[7] = self.params.max_step;
        buf[8..10].copy_from_slice(&127u16.to_le_bytes());
        buf[10] = 0;
        let name = b"sim_ltc_1";
        buf[11..11 + name.len()].copy_from_slice(name);
        buf
    }

    fn unit(&mut self) -> &mut SimUnit {
        &mut self.units[self.selected]
    }

    fn error_probability(&self, step: u8) -> f64 {
        let over = f64::from(step.saturating_sub(self.params.stable_step));
        (over * self.params.error_slope).min(1.0)
    }

    fn read_results(&mut self) -> Vec<u8> {
        let freq_hz = {
            let step = self.units[self.selected].step;
            f64::from(step as u32 + 1) * self.params.freq_unit_mhz * 1e6
        };
        let error_p = self.error_probability(self.units[self.selected].step);
        let window = self.params.scan_window;
        let pow = Arc::clone(&self.pow);
        let unit = &mut self.units[self.selected];

        let Some(header) = unit.header else {
            return vec![0u8; 12];
        };

        let progress = if unit.suspended {
            unit.scan_next
        } else {
            let done = unit.started.elapsed().as_secs_f64() * freq_hz;
            (done.min(f64::from(u32::MAX))) as u32
        };

        // The host scan trails the simulated progress counter.
        let scan_end = progress.min(unit.scan_next.saturating_add(window));
        for nonce in unit.scan_next..scan_end {
            let hash = pow.hash(&header, nonce);
            if hash[29..32] == [0, 0, 0] {
                unit.golden.push(nonce);
            }
        }
        unit.scan_next = scan_end.max(unit.scan_next);

        let mut hash7 = pow.hash7(&header, progress);
        if rand::thread_rng().gen_bool(error_p) {
            hash7 ^= 1;
        }
        let golden = if unit.golden.is_empty() {
            0
        } else {
            unit.golden.remove(0)
        };

        let mut buf = Vec::with_capacity(12);
        buf.extend_from_slice(&golden.to_le_bytes());
        buf.extend_from_slice(&progress.to_le_bytes());
        buf.extend_from_slice(&hash7.to_le_bytes());
        buf
    }
}

#[async_trait]
impl FpgaDevice for SimulatedDevice {
    fn serial(&self) -> &str {
        &self.params.serial
    }

    fn unit_count(&self) -> usize {
        self.units.len()
    }

    async fn select_unit(&mut self, index: usize) -> Result<()> {
        if index >= self.units.len() {
            return Err(DeviceError::NoSuchUnit(index));
        }
        self.selected = index;
        Ok(())
    }

    async fn send_command(&mut self, opcode: u8, payload: &[u8; WORK_PAYLOAD_LEN]) -> Result<()> {
        if opcode != OP_SEND_WORK {
            return Err(DeviceError::NotSupported(format!("opcode {opcode:#04x}")));
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&payload[4..]);
        let unit = self.unit();
        unit.header = Some(header);
        unit.started = Instant::now();
        unit.scan_next = 0;
        unit.golden.clear();
        unit.suspended = false;
        Ok(())
    }

    async fn read_result(&mut self, opcode: u8, len: usize) -> Result<Vec<u8>> {
        let buf = match opcode {
            OP_READ_DESCRIPTOR => self.descriptor(),
            OP_READ_RESULTS => self.read_results(),
            _ => return Err(DeviceError::NotSupported(format!("opcode {opcode:#04x}"))),
        };
        if buf.len() < len {
            return Err(DeviceError::ShortRead {
                expected: len,
                actual: buf.len(),
            });
        }
        Ok(buf[..len].to_vec())
    }

    async fn set_frequency_step(&mut self, step: u8) -> Result<()> {
        let step = step.min(self.params.max_step);
        self.unit().step = step;
        Ok(())
    }

    async fn read_temperature(&mut self) -> Result<f64> {
        Ok(self.params.temperature)
    }

    async fn reset_unit(&mut self) -> Result<()> {
        let step = self.params.default_step;
        *self.unit() = SimUnit::new(step);
        Ok(())
    }

    async fn suspend(&mut self) -> Result<bool> {
        self.unit().suspended = true;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceDescriptor, ResultRecords, DEVICE_TARGET};

    fn payload() -> [u8; WORK_PAYLOAD_LEN] {
        let mut payload = [0u8; WORK_PAYLOAD_LEN];
        payload[..4].copy_from_slice(&DEVICE_TARGET);
        payload[4] = 1;
        payload
    }

    #[tokio::test]
    async fn test_descriptor_parses() {
        let mut dev = SimulatedDevice::new(SimParams::new("sim-0"));
        let raw = dev.read_result(OP_READ_DESCRIPTOR, DESCRIPTOR_LEN).await.unwrap();
        let desc = DeviceDescriptor::parse(&raw).unwrap();
        assert_eq!(desc.num_nonces, 1);
        assert_eq!(desc.default_step, 49);
        assert_eq!(desc.max_step, 59);
        assert!((desc.freq_unit_mhz - 4.0).abs() < 1e-9);
        assert!(desc.suspend_supported);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_hash_correctly_below_stable_step() {
        let mut dev = SimulatedDevice::new(SimParams::new("sim-0"));
        let raw = dev.read_result(OP_READ_DESCRIPTOR, DESCRIPTOR_LEN).await.unwrap();
        let desc = DeviceDescriptor::parse(&raw).unwrap();

        let payload = payload();
        dev.send_command(OP_SEND_WORK, &payload).await.unwrap();
        tokio::time::advance(std::time::Duration::from_millis(10)).await;

        let raw = dev.read_result(OP_READ_RESULTS, desc.record_len()).await.unwrap();
        let records = ResultRecords::decode(&desc, &raw).unwrap();
        let sample = records.samples[0];
        assert!(sample.nonce > 0);

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&payload[4..]);
        assert_eq!(Sha256d.hash7(&header, sample.nonce), sample.hash7);
    }

    #[tokio::test]
    async fn test_rejects_unknown_unit_and_opcode() {
        let mut dev = SimulatedDevice::new(SimParams::new("sim-0"));
        assert!(matches!(dev.select_unit(3).await, Err(DeviceError::NoSuchUnit(3))));
        assert!(matches!(
            dev.send_command(0x10, &payload()).await,
            Err(DeviceError::NotSupported(_))
        ));
    }
}
