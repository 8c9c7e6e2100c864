use std::fmt::Write;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::error::{HmcError, Result};

/// Source of the random variates used by the sampler.
///
/// The state of the generator must survive a round trip through
/// `serialize_state` and `restore_state` exactly, so that an interrupted
/// run continues with the same stream of draws.
pub trait RandomSource {
    /// A uniform draw from `[0, 1)`.
    fn uniform(&mut self) -> f64;
    /// A standard normal draw.
    fn normal(&mut self) -> f64;
    fn seed(&mut self, seed: u64);
    fn serialize_state(&self) -> String;
    fn restore_state(&mut self, state: &str) -> Result<()>;
}

/// A ChaCha8 stream with a textual state representation.
#[derive(Debug, Clone)]
pub struct ChaChaSource {
    rng: ChaCha8Rng,
}

impl ChaChaSource {
    pub fn new(seed: u64) -> Self {
        Self::with_stream(seed, 0)
    }

    /// Independent streams for the same seed, one per chain.
    pub fn with_stream(seed: u64, stream: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(stream);
        Self { rng }
    }

    pub fn stream(&self) -> u64 {
        self.rng.get_stream()
    }
}

impl RandomSource for ChaChaSource {
    fn uniform(&mut self) -> f64 {
        self.rng.random::<f64>()
    }

    fn normal(&mut self) -> f64 {
        self.rng.sample(StandardNormal)
    }

    fn seed(&mut self, seed: u64) {
        let stream = self.rng.get_stream();
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self.rng.set_stream(stream);
    }

    fn serialize_state(&self) -> String {
        let mut out = String::with_capacity(64 + 48);
        for byte in self.rng.get_seed() {
            let _ = write!(out, "{:02x}", byte);
        }
        let _ = write!(
            out,
            " {} {}",
            self.rng.get_stream(),
            self.rng.get_word_pos()
        );
        out
    }

    fn restore_state(&mut self, state: &str) -> Result<()> {
        let invalid = || HmcError::InvalidRandomState(state.to_string());

        let mut parts = state.split_whitespace();
        let (Some(seed_hex), Some(stream), Some(word_pos), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        if seed_hex.len() != 64 || !seed_hex.is_ascii() {
            return Err(invalid());
        }
        let mut seed = [0u8; 32];
        for (byte, chunk) in seed.iter_mut().zip(seed_hex.as_bytes().chunks_exact(2)) {
            let chunk = std::str::from_utf8(chunk).map_err(|_| invalid())?;
            *byte = u8::from_str_radix(chunk, 16).map_err(|_| invalid())?;
        }
        let stream: u64 = stream.parse().map_err(|_| invalid())?;
        let word_pos: u128 = word_pos.parse().map_err(|_| invalid())?;

        let mut rng = ChaCha8Rng::from_seed(seed);
        rng.set_stream(stream);
        rng.set_word_pos(word_pos);
        self.rng = rng;
        Ok(())
    }
}
