//! Stable 64-bit fingerprints. `DefaultHasher` is not stable across releases,
//! and kernel binaries persisted on disk are named by these values.

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

#[derive(Debug, Clone, Copy)]
pub struct Fingerprint {
    state: u64,
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self { state: FNV1A_OFFSET }
    }
}

impl Fingerprint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        for b in bytes {
            self.state ^= *b as u64;
            self.state = self.state.wrapping_mul(FNV1A_PRIME);
        }
        self
    }

    pub fn update_str(&mut self, s: &str) -> &mut Self {
        self.update(s.as_bytes())
    }

    pub fn finish(&self) -> u64 {
        self.state
    }
}

pub fn hash_str(s: &str) -> u64 {
    Fingerprint::new().update_str(s).finish()
}
