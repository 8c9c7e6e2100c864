use crate::mass_matrix::KineticEnergy;
use crate::math::axpy;
use crate::potential::PotentialEnergy;

/// Leapfrog discretisation of the Hamiltonian dynamics defined by a
/// potential and a kinetic energy.
#[derive(Debug, Clone)]
pub struct Leapfrog<P, K> {
    potential: P,
    kinetic: K,
}

impl<P: PotentialEnergy, K: KineticEnergy> Leapfrog<P, K> {
    pub fn new(potential: P, kinetic: K) -> Self {
        assert!(
            potential.dim() == kinetic.dim(),
            "Potential and kinetic energy should have the same dimensionality: {} != {}",
            potential.dim(),
            kinetic.dim()
        );
        Self { potential, kinetic }
    }

    pub fn dim(&self) -> usize {
        self.potential.dim()
    }

    pub fn potential(&self) -> &P {
        &self.potential
    }

    /// Move `(position, momentum)` by `num_steps` leapfrog steps of size
    /// `step_size` and return the change of the Hamiltonian.
    ///
    /// The momentum is expected to be a standard normal draw, it is rotated
    /// by the kinetic energy before the first step. With `num_steps == 0`
    /// nothing changes and the energy difference is zero.
    pub fn integrate(
        &self,
        position: &mut [f64],
        momentum: &mut [f64],
        step_size: f64,
        num_steps: usize,
    ) -> f64 {
        let dim = self.dim();
        assert!(
            position.len() == dim,
            "position should have {} elements, got {}",
            dim,
            position.len()
        );
        assert!(
            momentum.len() == dim,
            "momentum should have {} elements, got {}",
            dim,
            momentum.len()
        );
        assert!(
            (step_size > 0.) & (step_size < 2.),
            "For stability of the leapfrog we require 0 < eps < 2, got {}",
            step_size
        );

        if num_steps == 0 {
            return 0.;
        }

        self.kinetic.rotate(momentum);

        let mut grad_q = vec![0f64; dim];
        let mut grad_p = vec![0f64; dim];
        let mut logp = self.potential.evaluate(position, &mut grad_q);
        let logk = self.kinetic.evaluate(momentum, &mut grad_p);
        let h0 = -(logp + logk);

        axpy(&grad_q, momentum, 0.5 * step_size);

        for _ in 0..num_steps {
            self.kinetic.evaluate(momentum, &mut grad_p);
            axpy(&grad_p, position, -step_size);
            logp = self.potential.evaluate(position, &mut grad_q);
            axpy(&grad_q, momentum, step_size);
        }

        // the loop took a full momentum step at the end, undo half of it
        axpy(&grad_q, momentum, -0.5 * step_size);

        let logk = self.kinetic.evaluate(momentum, &mut grad_p);
        let h1 = -(logp + logk);
        h1 - h0
    }
}
