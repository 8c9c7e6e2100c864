use faer::Mat;

use crate::error::Result;
use crate::mass_matrix::KineticEnergy;
use crate::potential::PotentialEnergy;
use crate::proposal::HmcProposal;
use crate::random::{ChaChaSource, RandomSource};

/// Draw samples from the target distribution with Hamiltonian MCMC.
pub trait Chain {
    /// The dimensionality of the target.
    fn dim(&self) -> usize;

    /// The current position of the chain.
    fn position(&self) -> &[f64];

    fn set_position(&mut self, position: &[f64]);

    /// Fill every row of `samples` with an accepted draw.
    ///
    /// The acceptance statistics are reset at the start of each call.
    fn generate(&mut self, samples: &mut Mat<f64>) -> Result<()>;

    /// Acceptance rate of the most recent call to `generate`.
    fn acceptance_rate(&self) -> f64;

    fn rand_state(&self) -> String;

    fn set_rand_state(&mut self, state: &str) -> Result<()>;

    fn seed(&mut self, seed: u64);
}

/// Metropolis test: accept iff `u < exp(-delta_h)`.
///
/// A NaN energy difference is never accepted.
pub fn accept(u: f64, delta_h: f64) -> bool {
    u < (-delta_h).exp()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptanceStats {
    pub accepted: u64,
    pub attempted: u64,
}

impl AcceptanceStats {
    pub fn rate(&self) -> f64 {
        if self.attempted == 0 {
            return 0.;
        }
        self.accepted as f64 / self.attempted as f64
    }
}

/// Single chain HMC with a Metropolis correction.
#[derive(Debug, Clone)]
pub struct ClassicHmc<P, K, R = ChaChaSource> {
    proposal: HmcProposal<P, K>,
    rng: R,
    position: Vec<f64>,
    stats: AcceptanceStats,
}

impl<P, K, R> ClassicHmc<P, K, R>
where
    P: PotentialEnergy,
    K: KineticEnergy,
    R: RandomSource,
{
    pub fn new(proposal: HmcProposal<P, K>, start: &[f64], rng: R) -> Self {
        assert!(
            start.len() == proposal.dim(),
            "The starting point should have {} elements, got {}",
            proposal.dim(),
            start.len()
        );
        Self {
            proposal,
            rng,
            position: start.to_vec(),
            stats: AcceptanceStats::default(),
        }
    }

    pub fn stats(&self) -> AcceptanceStats {
        self.stats
    }

    pub fn proposal(&self) -> &HmcProposal<P, K> {
        &self.proposal
    }
}

impl<P, K, R> Chain for ClassicHmc<P, K, R>
where
    P: PotentialEnergy,
    K: KineticEnergy,
    R: RandomSource,
{
    fn dim(&self) -> usize {
        self.proposal.dim()
    }

    fn position(&self) -> &[f64] {
        &self.position
    }

    fn set_position(&mut self, position: &[f64]) {
        assert!(position.len() == self.dim(), "position should have {} elements", self.dim());
        self.position.copy_from_slice(position);
    }

    fn generate(&mut self, samples: &mut Mat<f64>) -> Result<()> {
        assert!(
            samples.ncols() == self.dim(),
            "The sample buffer should have {} columns, got {}",
            self.dim(),
            samples.ncols()
        );
        self.stats = AcceptanceStats::default();

        for row in 0..samples.nrows() {
            loop {
                let trajectory = self.proposal.propose(&self.position, &mut self.rng);
                let u = self.rng.uniform();
                self.stats.attempted += 1;
                if accept(u, trajectory.delta_h) {
                    self.stats.accepted += 1;
                    self.position = trajectory.position;
                    break;
                }
            }
            write_row(samples, row, &self.position);
        }
        Ok(())
    }

    fn acceptance_rate(&self) -> f64 {
        self.stats.rate()
    }

    fn rand_state(&self) -> String {
        self.rng.serialize_state()
    }

    fn set_rand_state(&mut self, state: &str) -> Result<()> {
        self.rng.restore_state(state)
    }

    fn seed(&mut self, seed: u64) {
        self.rng.seed(seed)
    }
}

pub(crate) fn write_row(samples: &mut Mat<f64>, row: usize, values: &[f64]) {
    values
        .iter()
        .enumerate()
        .for_each(|(col, &val)| samples[(row, col)] = val);
}
