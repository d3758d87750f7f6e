/// Length of the raw hash that identifies a key inside the directory.
pub const HASH_SIZE: usize = 16;

pub type RawHash = [u8; HASH_SIZE];

/// Maps keys to raw hashes. Every process attached to a segment must use an
/// implementation that produces identical output for identical keys.
pub trait KeyHasher: Send + Sync {
    fn raw_hash(&self, key: &[u8]) -> RawHash;
}

/// Default hasher: two `ahash` states with fixed seeds, concatenated.
pub struct SeededHasher {
    low: ahash::RandomState,
    high: ahash::RandomState,
}

impl SeededHasher {
    pub fn new() -> Self {
        SeededHasher {
            low: ahash::RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
            high: ahash::RandomState::with_seeds(
                0x4528_21e6_38d0_1377,
                0xbe54_66cf_34e9_0c6c,
                0xc0ac_29b7_c97c_50dd,
                0x3f84_d5b5_b547_0917,
            ),
        }
    }
}

impl Default for SeededHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyHasher for SeededHasher {
    fn raw_hash(&self, key: &[u8]) -> RawHash {
        let mut out = [0u8; HASH_SIZE];
        out[..8].copy_from_slice(&self.low.hash_one(key).to_le_bytes());
        out[8..].copy_from_slice(&self.high.hash_one(key).to_le_bytes());
        out
    }
}

/// All-zero hashes mark free directory slots, so they are never handed out.
#[inline]
pub fn to_raw_hash(hasher: &dyn KeyHasher, key: &[u8]) -> RawHash {
    let mut raw = hasher.raw_hash(key);
    if is_all_nil(&raw) {
        raw[0] = b' ';
    }
    raw
}

#[inline]
pub fn is_all_nil(raw: &[u8]) -> bool {
    raw.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ZeroHasher;

    impl KeyHasher for ZeroHasher {
        fn raw_hash(&self, _key: &[u8]) -> RawHash {
            [0; HASH_SIZE]
        }
    }

    #[test]
    fn seeded_hasher_is_stable() {
        let a = SeededHasher::new();
        let b = SeededHasher::new();
        assert_eq!(a.raw_hash(b"200"), b.raw_hash(b"200"));
        assert_ne!(a.raw_hash(b"200"), a.raw_hash(b"404"));
    }

    #[test]
    fn all_zero_hash_is_remapped() {
        let raw = to_raw_hash(&ZeroHasher, b"anything");
        assert!(!is_all_nil(&raw));
        assert_eq!(raw[0], b' ');
        assert!(raw[1..].iter().all(|&b| b == 0));
    }
}
