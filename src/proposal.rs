use crate::integrator::Leapfrog;
use crate::mass_matrix::KineticEnergy;
use crate::potential::PotentialEnergy;
use crate::random::RandomSource;

/// The outcome of one simulated trajectory.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub position: Vec<f64>,
    pub delta_h: f64,
    pub step_size: f64,
    pub num_steps: usize,
}

/// Classic HMC proposal with randomized step size and trajectory length.
///
/// Each call draws `u1 ~ U(0, 1]`, `u2 ~ U[0, 1)` and integrates with
/// `eps = eps_max * eps_max * u1` and `L = floor(eps_max * u2 * max_steps)`.
#[derive(Debug, Clone)]
pub struct HmcProposal<P, K> {
    integrator: Leapfrog<P, K>,
    eps_max: f64,
    max_steps: usize,
}

impl<P: PotentialEnergy, K: KineticEnergy> HmcProposal<P, K> {
    pub fn new(integrator: Leapfrog<P, K>, eps_max: f64, max_steps: usize) -> Self {
        assert!(
            (eps_max > 0.) & (eps_max < 2.),
            "The maximum step size should satisfy 0 < eps_max < 2, got {}",
            eps_max
        );
        // The largest realised step size is eps_max^2
        assert!(
            eps_max * eps_max < 2.,
            "eps_max^2 should be smaller than 2, got eps_max = {}",
            eps_max
        );
        assert!(max_steps > 0, "The maximum number of steps should be positive");
        Self {
            integrator,
            eps_max,
            max_steps,
        }
    }

    pub fn dim(&self) -> usize {
        self.integrator.dim()
    }

    pub fn eps_max(&self) -> f64 {
        self.eps_max
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn integrator(&self) -> &Leapfrog<P, K> {
        &self.integrator
    }

    /// Simulate a trajectory starting at `start` with a fresh momentum.
    pub fn propose<R: RandomSource + ?Sized>(&self, start: &[f64], rng: &mut R) -> Trajectory {
        // u1 in (0, 1], a zero step size would violate the leapfrog bounds
        let step_size = self.eps_max * (self.eps_max * (1. - rng.uniform()));
        let num_steps = (self.eps_max * rng.uniform() * self.max_steps as f64).floor() as usize;

        let mut momentum: Vec<f64> = (0..self.dim()).map(|_| rng.normal()).collect();
        let mut position = start.to_vec();

        let delta_h = self
            .integrator
            .integrate(&mut position, &mut momentum, step_size, num_steps);

        Trajectory {
            position,
            delta_h,
            step_size,
            num_steps,
        }
    }
}
