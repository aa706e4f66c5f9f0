//! Device capability used by the mining core.
//!
//! The physical transport (USB vendor requests, bitstream upload,
//! enumeration) lives behind [`FpgaDevice`]. The core only selects a compute
//! unit, exchanges fixed-size command buffers and adjusts the clock. The
//! firmware descriptor and result records are interpreted here because their
//! layout is part of the mining protocol, not of the transport.

pub mod sim;

use async_trait::async_trait;
use thiserror::Error;

/// Send 84 bytes of work (4-byte device target + 80-byte header).
pub const OP_SEND_WORK: u8 = 0x80;
/// Read one result record per nonce unit.
pub const OP_READ_RESULTS: u8 = 0x81;
/// Read the 64-byte firmware descriptor.
pub const OP_READ_DESCRIPTOR: u8 = 0x82;

/// Length of the work payload sent with [`OP_SEND_WORK`].
pub const WORK_PAYLOAD_LEN: usize = 84;
/// Length of the firmware descriptor.
pub const DESCRIPTOR_LEN: usize = 64;

/// Device target prefix of the work payload.
pub const DEVICE_TARGET: [u8; 4] = [0x00, 0x00, 0x7f, 0xff];

/// Errors from the device transport.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer timeout")]
    Timeout,

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("no compute unit {0}")]
    NoSuchUnit(usize),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("device disconnected")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Narrow interface to one FPGA board.
///
/// A board may carry several compute units (FPGAs); each unit is driven by
/// its own session, which selects the unit before every transfer.
#[async_trait]
pub trait FpgaDevice: Send {
    /// Serial number of the board.
    fn serial(&self) -> &str;

    /// Number of configured compute units on the board.
    fn unit_count(&self) -> usize;

    /// Make `index` the target of subsequent transfers.
    async fn select_unit(&mut self, index: usize) -> Result<()>;

    /// Send a command with a fixed-size payload.
    async fn send_command(&mut self, opcode: u8, payload: &[u8; WORK_PAYLOAD_LEN]) -> Result<()>;

    /// Read `len` bytes of response data for `opcode`.
    async fn read_result(&mut self, opcode: u8, len: usize) -> Result<Vec<u8>>;

    /// Set the clock to frequency step `step`.
    async fn set_frequency_step(&mut self, step: u8) -> Result<()>;

    /// Temperature of the selected unit in degrees Celsius.
    async fn read_temperature(&mut self) -> Result<f64>;

    /// Reset the selected unit into its safe (non-hashing) state.
    async fn reset_unit(&mut self) -> Result<()>;

    /// Suspend the selected unit. Returns false if unsupported.
    async fn suspend(&mut self) -> Result<bool>;
}

/// Errors parsing the firmware descriptor.
#[derive(Debug, Error, PartialEq)]
pub enum DescriptorError {
    #[error("invalid descriptor version {0}, firmware must be updated")]
    UnsupportedVersion(u8),

    #[error("descriptor too short: {0} bytes")]
    TooShort(usize),

    #[error("invalid bitstream file name")]
    InvalidBitstreamName,
}

/// Mining parameters reported by the firmware.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    pub version: u8,
    /// Result records per read (one per nonce unit).
    pub num_nonces: usize,
    /// Offset subtracted from every nonce the device reports.
    pub offs_nonces: i32,
    /// MHz per frequency step.
    pub freq_unit_mhz: f64,
    pub default_step: u8,
    pub max_step: u8,
    pub hashes_per_clock: f64,
    pub extra_solutions: usize,
    pub bitstream: String,
    pub suspend_supported: bool,
}

impl DeviceDescriptor {
    /// Parse a raw descriptor.
    pub fn parse(buf: &[u8]) -> std::result::Result<Self, DescriptorError> {
        if buf.len() < DESCRIPTOR_LEN {
            return Err(DescriptorError::TooShort(buf.len()));
        }

        let version = buf[0];
        if !matches!(version, 2 | 4 | 5) {
            return Err(DescriptorError::UnsupportedVersion(version));
        }

        let num_nonces = buf[1] as usize + 1;
        let offs_nonces = i32::from(u16::from_le_bytes([buf[2], buf[3]])) - 10000;
        let freq_unit_mhz = f64::from(u16::from_le_bytes([buf[4], buf[5]])) * 0.01;
        let max_step = buf[7];
        let default_step = buf[6].min(max_step);

        let mut hashes_per_clock = if version > 2 {
            f64::from(u16::from_le_bytes([buf[8], buf[9]]) as u32 + 1) / 128.0
        } else {
            1.0
        };
        let extra_solutions = if version > 4 { buf[10] as usize } else { 0 };

        let name_start = match version {
            5 => 11,
            4 => 10,
            _ => 8,
        };
        let name_len = buf[name_start..]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DESCRIPTOR_LEN - name_start);
        if name_len == 0 {
            return Err(DescriptorError::InvalidBitstreamName);
        }
        let bitstream = String::from_utf8_lossy(&buf[name_start..name_start + name_len]).into_owned();

        if version < 4 && bitstream.starts_with("ztex_ufm1_15b") {
            hashes_per_clock = 0.5;
        }

        Ok(Self {
            version,
            num_nonces,
            offs_nonces,
            freq_unit_mhz,
            default_step,
            max_step,
            hashes_per_clock,
            extra_solutions,
            bitstream,
            suspend_supported: version == 5,
        })
    }

    /// Whether the firmware predates the current descriptor layout.
    pub fn is_outdated(&self) -> bool {
        self.version != 5
    }

    /// Size of one result record.
    pub fn record_len(&self) -> usize {
        12 + 4 * self.extra_solutions
    }

    /// Frequency of `step` in MHz.
    pub fn frequency_mhz(&self, step: u8) -> f64 {
        f64::from(step as u32 + 1) * self.freq_unit_mhz
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "bitfile={} f_default={:.2}MHz f_max={:.2}MHz HpC={}H",
            self.bitstream,
            self.frequency_mhz(self.default_step),
            self.frequency_mhz(self.max_step),
            self.hashes_per_clock
        )
    }
}

/// Results decoded from one [`OP_READ_RESULTS`] transfer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultRecords {
    /// One sample per nonce unit.
    pub samples: Vec<crate::work::NonceCandidate>,
    /// Golden nonces reported by the units, empty slots removed.
    pub golden: Vec<u32>,
}

impl ResultRecords {
    /// Decode the raw response for `desc`.
    pub fn decode(desc: &DeviceDescriptor, buf: &[u8]) -> Result<Self> {
        let bs = desc.record_len();
        let expected = desc.num_nonces * bs;
        if buf.len() < expected {
            return Err(DeviceError::ShortRead {
                expected,
                actual: buf.len(),
            });
        }

        let word = |offs: usize| u32::from_le_bytes([buf[offs], buf[offs + 1], buf[offs + 2], buf[offs + 3]]);
        let offs = desc.offs_nonces as u32;

        let mut records = Self::default();
        for i in 0..desc.num_nonces {
            let base = i * bs;
            let mut golden_at = |at: usize| {
                let raw = word(at);
                // Raw zero marks an empty slot.
                if raw != 0 {
                    records.golden.push(raw.wrapping_sub(offs));
                }
            };
            golden_at(base);
            for j in 0..desc.extra_solutions {
                golden_at(base + 12 + j * 4);
            }
            records.samples.push(crate::work::NonceCandidate {
                nonce: word(base + 4).wrapping_sub(offs),
                hash7: word(base + 8),
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a descriptor buffer for tests.
    pub(crate) fn descriptor_bytes(version: u8, num_nonces: u8, extra: u8, name: &str) -> Vec<u8> {
        let mut buf = vec![0u8; DESCRIPTOR_LEN];
        buf[0] = version;
        buf[1] = num_nonces - 1;
        buf[2..4].copy_from_slice(&10000u16.to_le_bytes());
        buf[4..6].copy_from_slice(&500u16.to_le_bytes()); // 5.00 MHz per step
        buf[6] = 29;
        buf[7] = 39;
        buf[8..10].copy_from_slice(&127u16.to_le_bytes());
        buf[10] = extra;
        let start = match version {
            5 => 11,
            4 => 10,
            _ => 8,
        };
        buf[start..start + name.len()].copy_from_slice(name.as_bytes());
        buf
    }

    #[test]
    fn test_parse_current_descriptor() {
        let desc = DeviceDescriptor::parse(&descriptor_bytes(5, 2, 1, "ltc_ufm1_15y1")).unwrap();
        assert_eq!(desc.num_nonces, 2);
        assert_eq!(desc.offs_nonces, 0);
        assert!((desc.freq_unit_mhz - 5.0).abs() < 1e-9);
        assert_eq!(desc.default_step, 29);
        assert_eq!(desc.max_step, 39);
        assert_eq!(desc.hashes_per_clock, 1.0);
        assert_eq!(desc.extra_solutions, 1);
        assert_eq!(desc.bitstream, "ltc_ufm1_15y1");
        assert!(desc.suspend_supported);
        assert!(!desc.is_outdated());
        assert_eq!(desc.record_len(), 16);
        assert!((desc.frequency_mhz(29) - 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_outdated_descriptor() {
        let desc = DeviceDescriptor::parse(&descriptor_bytes(4, 1, 0, "ltc_old")).unwrap();
        assert!(desc.is_outdated());
        assert!(!desc.suspend_supported);
        assert_eq!(desc.extra_solutions, 0);
        assert_eq!(desc.bitstream, "ltc_old");
    }

    #[test]
    fn test_default_step_clamped_to_max() {
        let mut buf = descriptor_bytes(5, 1, 0, "x");
        buf[6] = 50;
        let desc = DeviceDescriptor::parse(&buf).unwrap();
        assert_eq!(desc.default_step, 39);
    }

    #[test]
    fn test_reject_bad_descriptors() {
        assert_eq!(
            DeviceDescriptor::parse(&descriptor_bytes(3, 1, 0, "x")),
            Err(DescriptorError::UnsupportedVersion(3))
        );
        assert_eq!(
            DeviceDescriptor::parse(&descriptor_bytes(5, 1, 0, "")),
            Err(DescriptorError::InvalidBitstreamName)
        );
        assert_eq!(
            DeviceDescriptor::parse(&[5u8; 10]),
            Err(DescriptorError::TooShort(10))
        );
    }

    #[test]
    fn test_decode_result_records() {
        let mut raw = descriptor_bytes(5, 2, 1, "x");
        raw[2..4].copy_from_slice(&10005u16.to_le_bytes()); // offset 5
        let desc = DeviceDescriptor::parse(&raw).unwrap();

        let mut buf = Vec::new();
        for (golden, nonce, hash7, extra) in [(105u32, 1005u32, 0xaabbu32, 0u32), (0, 2005, 0xccdd, 305)] {
            for w in [golden, nonce, hash7, extra] {
                buf.extend_from_slice(&w.to_le_bytes());
            }
        }

        let records = ResultRecords::decode(&desc, &buf).unwrap();
        assert_eq!(records.golden, vec![100, 300]);
        assert_eq!(records.samples.len(), 2);
        assert_eq!(records.samples[0].nonce, 1000);
        assert_eq!(records.samples[0].hash7, 0xaabb);
        assert_eq!(records.samples[1].nonce, 2000);

        assert!(matches!(
            ResultRecords::decode(&desc, &buf[..20]),
            Err(DeviceError::ShortRead { expected: 32, actual: 20 })
        ));
    }
}
