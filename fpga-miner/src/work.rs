//! Work units fetched from a getwork pool and the byte-order helpers around
//! them.
//!
//! Getwork delivers a 128-byte buffer in which every 32-bit word is byte
//! swapped relative to the serialized block header. The buffer is kept
//! verbatim (for echoing back on submission) and canonicalized exactly once
//! on receipt. The device is fed the first 80 canonical bytes.

use tokio::time::Instant;

/// Length of the getwork `data` buffer.
pub const WORK_LEN: usize = 128;

/// Length of the mining header inside the work buffer.
pub const HEADER_LEN: usize = 80;

/// Hashes behind one golden nonce at difficulty 1.
pub const HASHES_PER_NONCE: f64 = 4_294_967_296.0;

/// Number of recently submitted nonces remembered per device.
pub const RECENT_NONCES: usize = 8;

/// Reverse the byte order of every 4-byte chunk.
///
/// Trailing bytes that do not fill a whole chunk are copied unchanged.
pub fn chunk_swap(bytes: &[u8]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    for chunk in out.chunks_exact_mut(4) {
        chunk.reverse();
    }
    out
}

/// Reverse the whole buffer.
pub fn full_reverse(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().rev().copied().collect()
}

/// 32-byte block reference used to detect block changes.
///
/// Compared by byte equality only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockFingerprint(pub [u8; 32]);

impl BlockFingerprint {
    /// Extract the fingerprint from a fetched work buffer (wire order).
    ///
    /// The reference is bytes 4..36 of the fully reversed buffer. Returns
    /// `None` if the buffer is shorter than 36 bytes.
    pub fn from_wire(wire: &[u8]) -> Option<Self> {
        if wire.len() < 36 {
            return None;
        }
        let reversed = full_reverse(wire);
        let mut out = [0u8; 32];
        out.copy_from_slice(&reversed[4..36]);
        Some(Self(out))
    }
}

/// 256-bit share target, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target([u8; 32]);

impl Target {
    /// Target every hash meets, used when target checking is disabled.
    pub const MAX: Self = Self([0xff; 32]);

    /// Build from big-endian bytes.
    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse the pool's big-endian hex representation.
    ///
    /// Only the first 32 bytes are used; longer values are accepted.
    pub fn from_pool_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let s = s.get(..64).ok_or(hex::FromHexError::InvalidStringLength)?;
        let mut be = [0u8; 32];
        hex::decode_to_slice(s, &mut be)?;
        Ok(Self(be))
    }

    pub fn to_be_bytes(self) -> [u8; 32] {
        self.0
    }

    /// Whether a hash meets the target (hash <= target).
    ///
    /// The hash is interpreted as a little-endian number, so comparison
    /// starts at its last byte.
    pub fn is_met_by(&self, hash: &[u8; 32]) -> bool {
        for (h, t) in hash.iter().rev().zip(self.0.iter()) {
            if h > t {
                return false;
            }
            if h < t {
                return true;
            }
        }
        true
    }
}

/// A unit of work fetched from a pool endpoint.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    /// Buffer exactly as received, used for echoing on submission.
    wire: [u8; WORK_LEN],
    /// Chunk-swapped buffer.
    canonical: [u8; WORK_LEN],
    target: Target,
    /// Index of the endpoint this work came from.
    pub endpoint: usize,
    /// When the work was fetched.
    pub fetched_at: Instant,
}

impl WorkUnit {
    /// Build a work unit from the decoded `data` field.
    pub fn new(wire: [u8; WORK_LEN], target: Target, endpoint: usize, fetched_at: Instant) -> Self {
        let mut canonical = [0u8; WORK_LEN];
        canonical.copy_from_slice(&chunk_swap(&wire));
        Self {
            wire,
            canonical,
            target,
            endpoint,
            fetched_at,
        }
    }

    pub fn wire(&self) -> &[u8; WORK_LEN] {
        &self.wire
    }

    /// The 80-byte mining header in canonical byte order.
    pub fn header(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(&self.canonical[..HEADER_LEN]);
        out
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Header with a nonce written into bytes 76..80 (little-endian).
    pub fn header_with_nonce(&self, nonce: u32) -> [u8; HEADER_LEN] {
        let mut header = self.header();
        header[76..80].copy_from_slice(&nonce.to_le_bytes());
        header
    }

    /// Hex submission parameter: the header with the nonce patched in,
    /// converted back to the pool's word order.
    pub fn submission_hex(&self, nonce: u32) -> String {
        hex::encode(chunk_swap(&self.header_with_nonce(nonce)))
    }
}

/// Result sample reported by one compute unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NonceCandidate {
    /// Progress counter of the unit (last nonce tried).
    pub nonce: u32,
    /// Word 7 of the hash the device computed for `nonce`.
    pub hash7: u32,
}

/// Ring of recently submitted golden nonces.
#[derive(Debug, Clone, Default)]
pub struct RecentNonces {
    slots: [Option<u32>; RECENT_NONCES],
    next: usize,
}

impl RecentNonces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, nonce: u32) -> bool {
        self.slots.contains(&Some(nonce))
    }

    /// Remember a nonce, evicting the oldest entry.
    pub fn insert(&mut self, nonce: u32) {
        self.slots[self.next] = Some(nonce);
        self.next = (self.next + 1) % RECENT_NONCES;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_wire() -> [u8; WORK_LEN] {
        let mut wire = [0u8; WORK_LEN];
        for (i, b) in wire.iter_mut().enumerate() {
            *b = (i * 7 + 3) as u8;
        }
        wire
    }

    #[test]
    fn test_chunk_swap_is_involution() {
        let wire = sample_wire();
        let once = chunk_swap(&wire);
        assert_ne!(once.as_slice(), wire.as_slice());
        assert_eq!(chunk_swap(&once).as_slice(), wire.as_slice());
    }

    #[test]
    fn test_chunk_swap_reverses_words() {
        assert_eq!(chunk_swap(&[1, 2, 3, 4, 5, 6, 7, 8]), vec![4, 3, 2, 1, 8, 7, 6, 5]);
    }

    /// Little-endian hash whose most significant bytes are `msb`.
    fn hash_with_msb(msb: &[u8]) -> [u8; 32] {
        let mut hash = [0u8; 32];
        for (i, b) in msb.iter().enumerate() {
            hash[31 - i] = *b;
        }
        hash
    }

    #[test]
    fn test_target_boundary_inclusive() {
        let target = Target::from_pool_hex(&("0000ffff".to_string() + &"00".repeat(28))).unwrap();

        // Hash equal to the target.
        let mut hash = target.to_be_bytes();
        hash.reverse();
        assert!(target.is_met_by(&hash));

        // One unit above in the most significant differing byte.
        assert!(!target.is_met_by(&hash_with_msb(&[0x00, 0x01])));
        assert!(!target.is_met_by(&hash_with_msb(&[0x00, 0x00, 0xff, 0xff, 0x01])));

        // Lower value passes.
        assert!(target.is_met_by(&hash_with_msb(&[0x00, 0x00, 0xff, 0xfe, 0xff])));
    }

    #[test]
    fn test_pool_target_first_byte_is_most_significant() {
        let hard = Target::from_pool_hex(&("00000000".to_string() + &"ff".repeat(28))).unwrap();
        assert_eq!(hard.to_be_bytes()[..4], [0, 0, 0, 0]);
        assert!(!hard.is_met_by(&hash_with_msb(&[0xff])));
        assert!(!hard.is_met_by(&hash_with_msb(&[0x00, 0x00, 0x00, 0x01])));
        assert!(hard.is_met_by(&hash_with_msb(&[0x00, 0x00, 0x00, 0x00, 0xff])));

        let easy = Target::from_pool_hex(&("ff".repeat(28) + "00000000")).unwrap();
        assert!(easy.is_met_by(&hash_with_msb(&[0xff, 0xff, 0xfe])));
    }

    #[test]
    fn test_max_target_accepts_any_hash() {
        assert!(Target::MAX.is_met_by(&[0xff; 32]));
        assert!(Target::MAX.is_met_by(&hash_with_msb(&[0x01])));
        assert!(Target::MAX.is_met_by(&[0u8; 32]));
    }

    #[test]
    fn test_target_from_long_hex_uses_first_32_bytes() {
        let long = "ab".repeat(32) + "00000000";
        assert_eq!(long.len(), 72);
        assert_eq!(Target::from_pool_hex(&long).unwrap(), Target::from_be_bytes([0xab; 32]));
        assert!(Target::from_pool_hex("ffff").is_err());
    }

    #[test]
    fn test_submission_patches_nonce_in_wire_order() {
        let wire = sample_wire();
        let work = WorkUnit::new(wire, Target::MAX, 0, Instant::now());
        let submitted = hex::decode(work.submission_hex(0x1122_3344)).unwrap();

        assert_eq!(submitted.len(), HEADER_LEN);
        assert_eq!(&submitted[..76], &wire[..76]);
        assert_eq!(&submitted[76..80], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(&work.header_with_nonce(0x1122_3344)[76..80], &[0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn test_fingerprint_uses_reversed_buffer() {
        let wire = sample_wire();
        let fp = BlockFingerprint::from_wire(&wire).unwrap();
        let reversed = full_reverse(&wire);
        assert_eq!(&fp.0[..], &reversed[4..36]);
        assert!(BlockFingerprint::from_wire(&wire[..35]).is_none());
    }

    #[test]
    fn test_recent_nonces_ring_evicts_oldest() {
        let mut ring = RecentNonces::new();
        for n in 0..RECENT_NONCES as u32 {
            ring.insert(n);
        }
        assert!(ring.contains(0));
        ring.insert(100);
        assert!(!ring.contains(0));
        assert!(ring.contains(1));
        assert!(ring.contains(100));
    }
}
