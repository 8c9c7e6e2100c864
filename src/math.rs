use faer::Mat;
use itertools::izip;

pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    izip!(a, b).map(|(x, y)| x * y).sum()
}

/// y += a * x
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    let n = x.len();
    assert!(y.len() == n);

    izip!(x, y).for_each(|(x, y)| {
        *y += a * x;
    });
}

/// out = scale * mat * x
pub(crate) fn mat_vec(mat: &Mat<f64>, x: &[f64], scale: f64, out: &mut [f64]) {
    let n = mat.ncols();
    assert!(x.len() == n);
    assert!(out.len() == mat.nrows());

    out.iter_mut().enumerate().for_each(|(i, out)| {
        let row: f64 = x.iter().enumerate().map(|(j, &x)| mat[(i, j)] * x).sum();
        *out = scale * row;
    });
}

/// x_i *= factors_i
pub(crate) fn multiply_inplace(factors: &[f64], x: &mut [f64]) {
    assert!(factors.len() == x.len());
    izip!(factors, x).for_each(|(f, x)| *x *= f);
}
