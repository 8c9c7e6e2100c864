use faer::Mat;
use itertools::izip;

use crate::math::{mat_vec, vector_dot};

/// The target density of the sampler.
///
/// This needs to be implemented by users of the library to define
/// what distribution they want to sample from. `evaluate` returns the
/// unnormalized log density at `position` (the negated potential energy)
/// and writes its gradient into `gradient`.
pub trait PotentialEnergy {
    fn dim(&self) -> usize;
    fn evaluate(&self, position: &[f64], gradient: &mut [f64]) -> f64;
}

impl<T: PotentialEnergy + ?Sized> PotentialEnergy for &T {
    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn evaluate(&self, position: &[f64], gradient: &mut [f64]) -> f64 {
        (**self).evaluate(position, gradient)
    }
}

/// Multivariate normal log density with a dense precision matrix.
#[derive(Debug, Clone)]
pub struct GaussPotential {
    mean: Vec<f64>,
    precision: Mat<f64>,
}

impl GaussPotential {
    pub fn new(mean: Vec<f64>, precision: Mat<f64>) -> Self {
        assert!(
            precision.nrows() == precision.ncols(),
            "Sigma^-1 should be a square matrix: rows==cols"
        );
        assert!(
            precision.nrows() == mean.len(),
            "Sigma^-1 and mu should have the same dimensionality"
        );
        assert!(!mean.is_empty(), "mu should have at least one element");
        Self { mean, precision }
    }

    pub fn standard(dim: usize) -> Self {
        Self::new(vec![0f64; dim], Mat::identity(dim, dim))
    }
}

impl PotentialEnergy for GaussPotential {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    fn evaluate(&self, position: &[f64], gradient: &mut [f64]) -> f64 {
        assert!(position.len() == self.dim(), "q should have {} elements", self.dim());
        assert!(gradient.len() == self.dim(), "q and dq should have the same dimensionality");

        let diff: Vec<f64> = izip!(&self.mean, position).map(|(mu, q)| mu - q).collect();
        mat_vec(&self.precision, &diff, 1., gradient);
        -0.5 * vector_dot(&diff, gradient)
    }
}

/// Multivariate normal log density with a diagonal precision matrix.
#[derive(Debug, Clone)]
pub struct DiagGaussPotential {
    mean: Vec<f64>,
    precision: Vec<f64>,
}

impl DiagGaussPotential {
    pub fn new(mean: Vec<f64>, precision: Vec<f64>) -> Self {
        assert!(
            precision.len() == mean.len(),
            "Sigma^-1 and mu should have the same dimensionality"
        );
        assert!(!mean.is_empty(), "mu should have at least one element");
        Self { mean, precision }
    }
}

impl PotentialEnergy for DiagGaussPotential {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    fn evaluate(&self, position: &[f64], gradient: &mut [f64]) -> f64 {
        assert!(position.len() == self.dim(), "q should have {} elements", self.dim());
        assert!(gradient.len() == self.dim(), "q and dq should have the same dimensionality");

        let mut logp = 0f64;
        izip!(&self.mean, &self.precision, position, gradient.iter_mut()).for_each(
            |(mu, prec, q, grad)| {
                let diff = mu - q;
                *grad = prec * diff;
                logp -= 0.5 * diff * *grad;
            },
        );
        logp
    }
}
