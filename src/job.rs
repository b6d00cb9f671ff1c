use crate::batch::{BatchCorrelator, NoopProgress, PairResult, ProgressSink};
use crate::config::Thresholds;
use crate::error::{CorrError, Result};
use crate::matrix::{DatasetMeta, FeatureMatrix};
use crate::store::{ResultStore, StoreHandle};
use crate::topk::{by_magnitude, TopKFilter};
use log::info;

#[derive(Clone, Debug)]
pub struct JobOutcome {
    /// Retained pairs, grouped by anchor id and strongest first within each anchor.
    pub results: Vec<PairResult>,
    /// Pairs that passed `min_samples` and had a defined correlation and p-value.
    pub evaluated_pairs: usize,
    pub chunks: usize,
}

/// Correlates every column of `a` with every column of `b` and keeps the
/// per-anchor top pairs. Each chunk is filtered as soon as it is produced;
/// chunks never share an anchor.
pub fn run_job(
    a: &FeatureMatrix,
    b: &FeatureMatrix,
    thresholds: &Thresholds,
    progress: &dyn ProgressSink,
) -> Result<JobOutcome> {
    let correlator = BatchCorrelator::new(a, b, thresholds)?;
    let chunks = correlator.n_chunks();
    let filter = TopKFilter::from(thresholds);

    let mut evaluated_pairs = 0usize;
    let mut results = Vec::new();
    for chunk in correlator.run(progress) {
        evaluated_pairs += chunk.len();
        results.extend(filter.filter(chunk));
    }
    results.sort_by(|x, y| x.anchor.cmp(&y.anchor).then_with(|| by_magnitude(x, y)));

    info!(
        "Retained {} of {} evaluated pair(s) for '{}' x '{}'",
        results.len(),
        evaluated_pairs,
        a.dataset().id,
        b.dataset().id
    );
    Ok(JobOutcome {
        results,
        evaluated_pairs,
        chunks,
    })
}

/// [`run_job`] followed by persisting the retained pairs. Nothing is stored
/// when the computation fails.
pub fn run_and_store(
    store: &ResultStore,
    a: &FeatureMatrix,
    b: &FeatureMatrix,
    thresholds: &Thresholds,
    progress: &dyn ProgressSink,
) -> Result<(JobOutcome, StoreHandle)> {
    let outcome = run_job(a, b, thresholds, progress)?;
    let handle = store.write(a.catalog(), b.catalog(), Some(thresholds), &outcome.results)?;
    Ok((outcome, handle))
}

/// Correlates one query vector, aligned to `matrix`'s observations, against
/// every column of `matrix`. Same kernel and filter as [`run_job`].
pub fn correlate_vector(
    query_id: &str,
    values: &[f64],
    matrix: &FeatureMatrix,
    thresholds: &Thresholds,
) -> Result<Vec<PairResult>> {
    if values.len() != matrix.n_observations() {
        return Err(CorrError::ShapeMismatch(format!(
            "query '{}' has {} values but '{}' has {} observations",
            query_id,
            values.len(),
            matrix.dataset().id,
            matrix.n_observations()
        )));
    }
    let query = FeatureMatrix::from_columns(
        DatasetMeta::new(query_id, query_id),
        matrix.observations().to_vec(),
        vec![(query_id.to_string(), values.to_vec())],
    )?;
    Ok(run_job(&query, matrix, thresholds, &NoopProgress)?.results)
}
