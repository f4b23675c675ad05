use std::fmt;
use std::str::FromStr;

/// Bumped whenever the on-disk layout or anything feeding a fingerprint
/// changes meaning. Older caches are discarded on open.
pub const CACHE_FORMAT_VERSION: u32 = 1;

const FNV_OFFSET: u128 = 0x6c62272e07bb014262b821756295c58d;
const FNV_PRIME: u128 = 0x0000000001000000000000000000013b;

/// Stable 128-bit key of a reconstruction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u128);

impl Fingerprint {
    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub(crate) fn to_le_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    pub(crate) fn from_le_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_le_bytes(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u128::from_str_radix(s, 16).map(Self)
    }
}

/// FNV-1a over a canonical little-endian encoding. Unlike `std::hash`, the
/// output is identical across platforms, processes and compiler versions.
#[derive(Debug, Clone)]
pub(crate) struct FingerprintHasher {
    state: u128,
}

impl FingerprintHasher {
    pub(crate) fn new() -> Self {
        Self { state: FNV_OFFSET }
    }

    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u128::from(byte);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }

    pub(crate) fn write_u8(&mut self, value: u8) {
        self.write_bytes(&[value]);
    }

    pub(crate) fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub(crate) fn write_u64(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Negative zero is folded into positive zero.
    pub(crate) fn write_f64(&mut self, value: f64) {
        let value = if value == 0.0 { 0.0 } else { value };
        self.write_bytes(&value.to_bits().to_le_bytes());
    }

    /// Length-prefixed, so adjacent strings cannot alias.
    pub(crate) fn write_str(&mut self, value: &str) {
        self.write_u64(value.len() as u64);
        self.write_bytes(value.as_bytes());
    }

    pub(crate) fn finish(&self) -> Fingerprint {
        Fingerprint(self.state)
    }
}
