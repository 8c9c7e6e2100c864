use faer::{Mat, Side};
use itertools::izip;

use crate::math::{mat_vec, multiply_inplace, vector_dot};

/// Gaussian kinetic energy of the auxiliary momentum.
///
/// `evaluate` returns the negated kinetic energy `-0.5 pᵀ M⁻¹ p` and writes
/// its gradient `-M⁻¹ p`. `rotate` maps a standard normal vector to a
/// momentum distributed as `N(0, M)`.
pub trait KineticEnergy {
    fn dim(&self) -> usize;
    fn evaluate(&self, momentum: &[f64], gradient: &mut [f64]) -> f64;
    fn rotate(&self, momentum: &mut [f64]);
}

#[derive(Debug, Clone)]
pub struct DenseMassMatrix {
    mass_inv: Mat<f64>,
    mass_sqrt: Mat<f64>,
}

impl DenseMassMatrix {
    /// Create a kinetic energy from the inverse mass matrix.
    ///
    /// Panics if the matrix is not square or not positive definite.
    pub fn new(mass_inv: Mat<f64>) -> Self {
        assert!(
            mass_inv.nrows() == mass_inv.ncols(),
            "Mass^-1 should be a square matrix: rows==cols"
        );
        let Ok(eigs) = mass_inv.self_adjoint_eigen(Side::Lower) else {
            panic!("Could not compute the eigendecomposition of Mass^-1");
        };

        // M^(1/2) = U S^(-1/2) Uᵀ
        let u = eigs.U();
        let mut stds = eigs.S().column_vector().to_owned();
        stds.iter_mut().for_each(|val| {
            assert!(
                val.is_finite() & (*val > 0f64),
                "Illegal value on mass matrix: {}",
                val
            );
            *val = val.sqrt().recip();
        });
        let mass_sqrt = u * stds.into_diagonal() * u.transpose();

        Self {
            mass_inv,
            mass_sqrt,
        }
    }

    pub fn identity(dim: usize) -> Self {
        Self::new(Mat::identity(dim, dim))
    }

    pub(crate) fn mass_sqrt(&self) -> &Mat<f64> {
        &self.mass_sqrt
    }
}

impl KineticEnergy for DenseMassMatrix {
    fn dim(&self) -> usize {
        self.mass_inv.nrows()
    }

    fn evaluate(&self, momentum: &[f64], gradient: &mut [f64]) -> f64 {
        assert!(
            momentum.len() == gradient.len(),
            "p and dp should have the same dimensionality"
        );
        mat_vec(&self.mass_inv, momentum, -1., gradient);
        0.5 * vector_dot(momentum, gradient)
    }

    fn rotate(&self, momentum: &mut [f64]) {
        let white = momentum.to_vec();
        mat_vec(&self.mass_sqrt, &white, 1., momentum);
    }
}

#[derive(Debug, Clone)]
pub struct DiagMassMatrix {
    mass_inv: Box<[f64]>,
    stds: Box<[f64]>,
}

impl DiagMassMatrix {
    pub fn new(mass_inv: Vec<f64>) -> Self {
        let stds = mass_inv
            .iter()
            .map(|&x| {
                assert!(x.is_finite(), "Illegal value on mass matrix: {}", x);
                assert!(x > 0f64, "Illegal value on mass matrix: {}", x);
                x.recip().sqrt()
            })
            .collect();
        Self {
            mass_inv: mass_inv.into(),
            stds,
        }
    }

    pub fn identity(dim: usize) -> Self {
        Self::new(vec![1f64; dim])
    }
}

impl KineticEnergy for DiagMassMatrix {
    fn dim(&self) -> usize {
        self.mass_inv.len()
    }

    fn evaluate(&self, momentum: &[f64], gradient: &mut [f64]) -> f64 {
        assert!(
            momentum.len() == gradient.len(),
            "p and dp should have the same dimensionality"
        );
        izip!(self.mass_inv.iter(), momentum, gradient.iter_mut())
            .for_each(|(m, p, g)| *g = -m * p);
        0.5 * vector_dot(momentum, gradient)
    }

    fn rotate(&self, momentum: &mut [f64]) {
        multiply_inplace(&self.stds, momentum);
    }
}
