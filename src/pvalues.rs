use ndarray::{Array1, Array2, Zip};
use statrs::distribution::{Beta, ContinuousCDF};

/// Null distribution of Pearson's r for `n_samples` pairs, as Beta(n/2 - 1, n/2 - 1)
/// on [0, 1]. `None` when the shape parameter would not be positive.
pub fn beta_for_corr(n_samples: usize) -> Option<Beta> {
    if n_samples <= 2 {
        return None;
    }
    let shape = n_samples as f64 / 2.0 - 1.0;
    Beta::new(shape, shape).ok()
}

/// Two-sided p-value: 2 * CDF(-|r|) of the Beta null rescaled to [-1, 1].
pub fn corr_pvalue_from_beta(r: f64, beta: &Beta) -> f64 {
    if !r.is_finite() {
        return f64::NAN;
    }
    let r = r.clamp(-1.0, 1.0);
    // loc = -1, scale = 2
    let x = (1.0 - r.abs()) / 2.0;
    let p = 2.0 * beta.cdf(x);
    p.clamp(0.0, 1.0)
}

pub fn corr_pvalue(r: f64, n_samples: usize) -> f64 {
    match beta_for_corr(n_samples) {
        Some(beta) => corr_pvalue_from_beta(r, &beta),
        None => f64::NAN,
    }
}

/// P-values for a correlation block whose entries all share one effective N.
pub fn p_values(corr: &Array2<f64>, effective_n: usize) -> Array2<f64> {
    let Some(beta) = beta_for_corr(effective_n) else {
        return Array2::from_elem(corr.dim(), f64::NAN);
    };
    corr.mapv(|r| corr_pvalue_from_beta(r, &beta))
}

/// Benjamini-Hochberg adjustment over the finite entries of `pvalues`.
/// Non-finite inputs stay NaN and do not count towards the number of tests.
pub fn benjamini_hochberg(pvalues: &[f64]) -> Vec<f64> {
    let mut qvalues = vec![f64::NAN; pvalues.len()];
    let mut order: Vec<usize> = (0..pvalues.len())
        .filter(|&i| pvalues[i].is_finite())
        .collect();
    let m = order.len();
    if m == 0 {
        return qvalues;
    }
    order.sort_by(|&a, &b| pvalues[a].total_cmp(&pvalues[b]).then(a.cmp(&b)));

    let mut running = 1.0f64;
    for rank in (0..m).rev() {
        let idx = order[rank];
        let adjusted = pvalues[idx] * m as f64 / (rank + 1) as f64;
        running = running.min(adjusted);
        qvalues[idx] = running;
    }
    qvalues
}

/// Applies [`benjamini_hochberg`] to each row independently.
pub fn q_values_rowwise(pvalues: &Array2<f64>) -> Array2<f64> {
    let mut qvalues = Array2::<f64>::from_elem(pvalues.dim(), f64::NAN);
    Zip::from(qvalues.rows_mut())
        .and(pvalues.rows())
        .par_for_each(|mut q_row, p_row| {
            let adjusted = benjamini_hochberg(&p_row.to_vec());
            q_row.assign(&Array1::from(adjusted));
        });
    qvalues
}
