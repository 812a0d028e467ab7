//! Small dense linear algebra kernels the fitting core needs beyond matrix products.

use ndarray::prelude::*;

/// Columns whose residual norm falls below this fraction of the largest column norm are
/// treated as linearly dependent.
pub const RANK_TOLERANCE: f32 = 1e-3;

/// Result of a column pivoted modified Gram-Schmidt pass over an `n × w` matrix `A`.
#[derive(Debug, Clone)]
pub struct PivotedQr {
    /// Orthonormal basis of the kept columns, one entry per pivot.
    pub q: Vec<Array1<f32>>,
    /// `r[[k, j]]` is the component of column `j` along `q[k]`.
    pub r: Array2<f32>,
    /// Kept column indices in pivot order.
    pub pivots: Vec<usize>,
    /// Columns left out of the basis.
    pub dependent: Vec<usize>,
    /// Largest column norm of `A`, the scale tolerances are relative to.
    pub scale: f32,
}

impl PivotedQr {
    pub fn rank(&self) -> usize {
        self.pivots.len()
    }

    /// Expresses a dependent column as a combination of the pivot columns.
    ///
    /// Solves the upper triangular system `R[:, pivots] c = R[:, j]` by back substitution.
    ///
    /// # Returns
    /// Coefficients aligned with `pivots`.
    pub fn coefficients(&self, j: usize) -> Vec<f32> {
        let rank = self.rank();
        let mut c = vec![0.; rank];
        for k in (0..rank).rev() {
            let tail: f32 = (k + 1..rank)
                .map(|m| self.r[[k, self.pivots[m]]] * c[m])
                .sum();
            c[k] = (self.r[[k, j]] - tail) / self.r[[k, self.pivots[k]]];
        }
        c
    }

    /// The norm of the part of `v` orthogonal to the current basis.
    pub fn residual(&self, v: ArrayView1<f32>) -> Array1<f32> {
        let mut r = v.to_owned();
        for q in &self.q {
            let d = q.dot(&r);
            r.scaled_add(-d, q);
        }
        r
    }

    /// Appends a direction to the basis.
    pub fn push(&mut self, residual: Array1<f32>) {
        let norm = residual.dot(&residual).sqrt();
        if norm > 0. {
            self.q.push(residual / norm);
        }
    }
}

/// Orthonormalizes the columns of `a` picking the largest remaining column each round.
///
/// # Arguments
/// * `a` - An `n × w` matrix.
/// * `tolerance` - Relative norm below which remaining columns count as dependent.
pub fn pivoted_qr(a: ArrayView2<f32>, tolerance: f32) -> PivotedQr {
    let (n, w) = a.dim();
    let mut work = a.to_owned();
    let mut r = Array2::zeros((n.min(w), w));
    let mut used = vec![false; w];
    let mut q = Vec::new();
    let mut pivots = Vec::new();

    let norm = |c: ArrayView1<f32>| c.dot(&c).sqrt();
    let scale = (0..w).map(|j| norm(a.column(j))).fold(0., f32::max);

    for k in 0..n.min(w) {
        let best = (0..w)
            .filter(|&j| !used[j])
            .map(|j| (j, norm(work.column(j))))
            .max_by(|x, y| x.1.total_cmp(&y.1));
        let Some((p, len)) = best else { break };
        if scale == 0. || len <= tolerance * scale {
            break;
        }

        used[p] = true;
        let qk = work.column(p).mapv(|v| v / len);
        r[[k, p]] = len;
        for j in (0..w).filter(|&j| !used[j]) {
            let d = qk.dot(&work.column(j));
            r[[k, j]] = d;
            work.column_mut(j).scaled_add(-d, &qk);
        }
        q.push(qk);
        pivots.push(p);
    }

    let dependent = (0..w).filter(|&j| !used[j]).collect();
    PivotedQr {
        q,
        r,
        pivots,
        dependent,
        scale,
    }
}

/// Eigenpairs of a symmetric positive semi-definite matrix by power iteration with
/// re-orthogonalization against the pairs already found.
///
/// # Returns
/// `(eigenvalue, unit eigenvector)` pairs in decreasing eigenvalue order.
pub fn symmetric_eigen(c: ArrayView2<f64>, iterations: usize) -> Vec<(f64, Array1<f64>)> {
    let d = c.nrows();
    let mut pairs: Vec<(f64, Array1<f64>)> = Vec::with_capacity(d);

    let orthogonalize = |v: &mut Array1<f64>, pairs: &[(f64, Array1<f64>)]| {
        for (_, u) in pairs {
            let p = u.dot(v);
            v.scaled_add(-p, u);
        }
        let norm = v.dot(v).sqrt();
        if norm > 1e-12 {
            *v /= norm;
            true
        } else {
            false
        }
    };

    for k in 0..d {
        let start = (0..d).map(|i| (k + i) % d).find_map(|e| {
            let mut v = Array1::from_shape_fn(d, |i| if i == e { 1. } else { 0.1 });
            orthogonalize(&mut v, &pairs).then_some(v)
        });
        let Some(mut v) = start else { break };

        for _ in 0..iterations {
            let mut next = c.dot(&v);
            if !orthogonalize(&mut next, &pairs) {
                break;
            }
            v = next;
        }
        let lambda = v.dot(&c.dot(&v)).max(0.);
        pairs.push((lambda, v));
    }

    pairs.sort_by(|a, b| b.0.total_cmp(&a.0));
    pairs
}
