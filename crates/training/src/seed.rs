//! Deterministic randomness for a run.
//!
//! There is no process-global RNG to seed, so every consumer asks the
//! [`SeedManager`] for its own stream. Streams are derived from the run seed
//! and a purpose tag, so adding a new consumer never shifts existing streams.

use candle_core::Device;
use log::{debug, warn};
use rand::{rngs::StdRng, SeedableRng};

const INIT_STREAM: u64 = 0x1;
const SHUFFLE_STREAM: u64 = 0x2;
const SAMPLE_STREAM: u64 = 0x3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedManager {
    seed: u64,
}

impl SeedManager {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Seeds the device-side generator. Backends without a seedable RNG are
    /// reported and skipped.
    pub fn apply(&self, device: &Device) {
        if device.is_cpu() {
            debug!("cpu backend draws no device-side randomness; seed {} applies to host streams", self.seed);
            return;
        }
        if let Err(err) = device.set_seed(self.seed) {
            warn!("failed to seed device RNG: {err}");
        }
    }

    /// Stream for parameter initialization.
    pub fn init_rng(&self) -> StdRng {
        self.derive(INIT_STREAM, 0, 0)
    }

    /// Stream for the sample order of one epoch.
    pub fn shuffle_rng(&self, epoch: usize) -> StdRng {
        self.derive(SHUFFLE_STREAM, epoch as u64, 0)
    }

    /// Stream for the per-sample transform of sample `index` in `epoch`.
    pub fn sample_rng(&self, epoch: usize, index: usize) -> StdRng {
        self.derive(SAMPLE_STREAM, epoch as u64, index as u64)
    }

    fn derive(&self, stream: u64, a: u64, b: u64) -> StdRng {
        let state = splitmix64(splitmix64(splitmix64(self.seed ^ stream) ^ a) ^ b);
        StdRng::seed_from_u64(state)
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}
