//! Decoy Entropy - seed material for noise buffers
//!
//! Noise buffers should not share a byte pattern across builds or across
//! processes, otherwise a scanner can learn and skip them. The seed is put
//! together from two shards:
//!
//! 1. **Build-Time Seed**: 64-bit value generated by `build.rs`
//! 2. **Runtime Shard**: wall clock, PID, a per-process counter and an ASLR
//!    address
//!
//! ```text
//! SEED = Avalanche(BUILD_SEED ^ RUNTIME_SHARD)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::SeedableRng;

const BUILD_TIME_SEED: u64 = include!(concat!(env!("OUT_DIR"), "/decoy_seed.rs"));

/// Process-wide base seed, computed once
static BASE_SEED: OnceLock<u64> = OnceLock::new();

/// Distinguishes generators created within the same process
static GENERATOR_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct DecoyEntropy;

impl DecoyEntropy {
    /// Seed shared by every generator in this process.
    pub fn base_seed() -> u64 {
        *BASE_SEED.get_or_init(|| Self::avalanche_mix(BUILD_TIME_SEED ^ Self::runtime_shard()))
    }

    /// A fresh generator; two calls never yield the same stream.
    pub fn generator() -> StdRng {
        let n = GENERATOR_COUNTER.fetch_add(1, Ordering::Relaxed);
        StdRng::seed_from_u64(Self::avalanche_mix(Self::base_seed() ^ n.wrapping_mul(0x9E37_79B9_7F4A_7C15)))
    }

    fn runtime_shard() -> u64 {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let pid = std::process::id() as u64;

        // Stack address differs per run under ASLR
        let marker = 0u8;
        let aslr = std::ptr::addr_of!(marker) as usize as u64;

        nanos ^ pid.rotate_left(32) ^ aslr.rotate_left(13)
    }

    /// MurmurHash3 64-bit finalizer
    fn avalanche_mix(mut x: u64) -> u64 {
        x ^= x >> 33;
        x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
        x ^= x >> 33;
        x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
        x ^= x >> 33;
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn test_base_seed_is_stable() {
        assert_eq!(DecoyEntropy::base_seed(), DecoyEntropy::base_seed());
    }

    #[test]
    fn test_generators_diverge() {
        let mut a = DecoyEntropy::generator();
        let mut b = DecoyEntropy::generator();

        let mut buf_a = [0u8; 64];
        let mut buf_b = [0u8; 64];
        a.fill_bytes(&mut buf_a);
        b.fill_bytes(&mut buf_b);

        assert_ne!(buf_a, buf_b);
    }

    #[test]
    fn test_avalanche_effect() {
        let diff = DecoyEntropy::avalanche_mix(0x1234_5678) ^ DecoyEntropy::avalanche_mix(0x1234_5679);
        assert!(diff.count_ones() >= 16, "got {} bits changed", diff.count_ones());
    }
}
