//! Proof-of-work hash primitive.
//!
//! The miner only needs `hash(header, nonce)`. The algorithm is whatever the
//! bitstream on the device implements; the host uses it to double-check
//! device results and golden nonces.

use bitcoin::hashes::{sha256d, Hash};

use crate::work::HEADER_LEN;

/// Hash primitive used to verify device results.
pub trait PowHash: Send + Sync {
    /// Hash an 80-byte canonical header with `nonce` written into bytes 76..80.
    fn hash(&self, header: &[u8; HEADER_LEN], nonce: u32) -> [u8; 32];

    /// Word 7 of the hash (little-endian bytes 28..32), as reported by devices.
    fn hash7(&self, header: &[u8; HEADER_LEN], nonce: u32) -> u32 {
        let hash = self.hash(header, nonce);
        u32::from_le_bytes([hash[28], hash[29], hash[30], hash[31]])
    }
}

/// Double SHA-256 over the header.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256d;

impl PowHash for Sha256d {
    fn hash(&self, header: &[u8; HEADER_LEN], nonce: u32) -> [u8; 32] {
        let mut data = *header;
        data[76..80].copy_from_slice(&nonce.to_le_bytes());
        sha256d::Hash::hash(&data).to_byte_array()
    }
}
