use crate::config::Thresholds;
use crate::error::{CorrError, Result};
use crate::mask::{group_column_range, group_columns, MaskGroup};
use crate::matrix::FeatureMatrix;
use crate::pearson::{correlate_groups, GroupCorrelation};
use crate::pvalues::{p_values, q_values_rowwise};
use log::{debug, info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use std::error::Error;
use std::ops::Range;
use std::sync::Arc;

/// One evaluated (anchor, counterpart) column pair.
#[derive(Clone, Debug, PartialEq)]
pub struct PairResult {
    /// Feature id from the first matrix.
    pub anchor: Arc<str>,
    /// Feature id from the second matrix.
    pub counterpart: Arc<str>,
    pub correlation: f64,
    pub effective_n: usize,
    pub p_value: f64,
    pub q_value: f64,
}

/// Progress after a finished chunk. `fraction` reaches exactly 1.0 on the last one.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Progress {
    pub completed_chunks: usize,
    pub total_chunks: usize,
    pub fraction: f64,
}

impl Progress {
    pub fn label(&self) -> String {
        format!(
            "correlating chunk {}/{}",
            self.completed_chunks, self.total_chunks
        )
    }
}

pub type ProgressError = Box<dyn Error + Send + Sync + 'static>;

/// Receives one report per finished chunk. Failures are logged and ignored.
pub trait ProgressSink {
    fn report(&self, progress: Progress) -> std::result::Result<(), ProgressError>;
}

pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _progress: Progress) -> std::result::Result<(), ProgressError> {
        Ok(())
    }
}

/// Logs each report at info level.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, progress: Progress) -> std::result::Result<(), ProgressError> {
        info!("{} ({:.1}%)", progress.label(), progress.fraction * 100.0);
        Ok(())
    }
}

impl<F> ProgressSink for F
where
    F: Fn(Progress) -> std::result::Result<(), ProgressError>,
{
    fn report(&self, progress: Progress) -> std::result::Result<(), ProgressError> {
        self(progress)
    }
}

/// Drives the grouped correlation kernel over consecutive column chunks of `a`
/// against all of `b`.
pub struct BatchCorrelator<'a> {
    a: &'a FeatureMatrix,
    b: &'a FeatureMatrix,
    thresholds: &'a Thresholds,
    b_groups: Vec<MaskGroup>,
}

impl<'a> BatchCorrelator<'a> {
    /// Checks every precondition up front so a job never fails halfway through.
    pub fn new(
        a: &'a FeatureMatrix,
        b: &'a FeatureMatrix,
        thresholds: &'a Thresholds,
    ) -> Result<Self> {
        thresholds.validate()?;
        for m in [a, b] {
            if m.is_empty() {
                return Err(CorrError::EmptyMatrix(m.dataset().id.clone()));
            }
        }
        a.check_aligned(b)?;

        let b_groups = group_columns(b.values());
        info!(
            "Correlating {} x {} features over {} observations in {} chunk(s); {} mask group(s) in '{}'",
            a.n_features(),
            b.n_features(),
            a.n_observations(),
            a.n_features().div_ceil(thresholds.batch_size),
            b_groups.len(),
            b.dataset().id
        );

        Ok(Self {
            a,
            b,
            thresholds,
            b_groups,
        })
    }

    pub fn n_chunks(&self) -> usize {
        self.a.n_features().div_ceil(self.thresholds.batch_size)
    }

    fn chunk_range(&self, chunk: usize) -> Range<usize> {
        let start = chunk * self.thresholds.batch_size;
        let end = (start + self.thresholds.batch_size).min(self.a.n_features());
        start..end
    }

    /// Unfiltered results for the anchors in `range`. Anchor rows are complete:
    /// every counterpart in `b` has been considered.
    pub fn correlate_chunk(&self, range: Range<usize>) -> Vec<PairResult> {
        let a_values = self.a.values();
        let b_values = self.b.values();
        let min_samples = self.thresholds.min_samples;
        let a_groups = group_column_range(a_values, range.clone());

        let combos: Vec<(usize, usize)> = (0..a_groups.len())
            .flat_map(|i| (0..self.b_groups.len()).map(move |j| (i, j)))
            .collect();

        let blocks: Vec<(usize, usize, GroupCorrelation, Array2<f64>)> = combos
            .par_iter()
            .filter_map(|&(i, j)| {
                let block =
                    correlate_groups(a_values, &a_groups[i], b_values, &self.b_groups[j], min_samples)?;
                let pvals = p_values(&block.corr, block.effective_n);
                Some((i, j, block, pvals))
            })
            .collect();

        debug!(
            "Chunk {:?}: {} mask group(s), {}/{} group pair(s) met min_samples={}",
            range,
            a_groups.len(),
            blocks.len(),
            combos.len(),
            min_samples
        );

        let n_rows = range.len();
        let n_b = self.b.n_features();
        let mut corr = Array2::<f64>::from_elem((n_rows, n_b), f64::NAN);
        let mut pvals = Array2::<f64>::from_elem((n_rows, n_b), f64::NAN);
        let mut counts = Array2::<usize>::zeros((n_rows, n_b));

        for (i, j, block, block_p) in &blocks {
            for (bi, &a_col) in a_groups[*i].columns.iter().enumerate() {
                let row = a_col - range.start;
                for (bj, &b_col) in self.b_groups[*j].columns.iter().enumerate() {
                    corr[[row, b_col]] = block.corr[[bi, bj]];
                    pvals[[row, b_col]] = block_p[[bi, bj]];
                    counts[[row, b_col]] = block.effective_n;
                }
            }
        }
        drop(blocks);

        let qvals = q_values_rowwise(&pvals);

        let a_ids = self.a.feature_ids();
        let b_ids = self.b.feature_ids();
        let mut results = Vec::new();
        for row in 0..n_rows {
            let anchor = &a_ids[range.start + row];
            for col in 0..n_b {
                let r = corr[[row, col]];
                let p = pvals[[row, col]];
                // Undefined correlations (constant columns) and pairs too small
                // for a null distribution (n <= 2) never leave the chunk.
                if !r.is_finite() || !p.is_finite() {
                    continue;
                }
                results.push(PairResult {
                    anchor: Arc::clone(anchor),
                    counterpart: Arc::clone(&b_ids[col]),
                    correlation: r,
                    effective_n: counts[[row, col]],
                    p_value: p,
                    q_value: qvals[[row, col]],
                });
            }
        }
        results
    }

    /// Lazily yields each chunk's results in column order of `a`, reporting
    /// progress after every chunk.
    pub fn run<'p>(self, progress: &'p dyn ProgressSink) -> ChunkedResults<'a, 'p> {
        let total_chunks = self.n_chunks();
        ChunkedResults {
            correlator: self,
            progress,
            next_chunk: 0,
            total_chunks,
        }
    }
}

pub struct ChunkedResults<'a, 'p> {
    correlator: BatchCorrelator<'a>,
    progress: &'p dyn ProgressSink,
    next_chunk: usize,
    total_chunks: usize,
}

impl Iterator for ChunkedResults<'_, '_> {
    type Item = Vec<PairResult>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_chunk >= self.total_chunks {
            return None;
        }
        let range = self.correlator.chunk_range(self.next_chunk);
        let results = self.correlator.correlate_chunk(range);
        self.next_chunk += 1;

        let progress = Progress {
            completed_chunks: self.next_chunk,
            total_chunks: self.total_chunks,
            fraction: self.next_chunk as f64 / self.total_chunks as f64,
        };
        if let Err(err) = self.progress.report(progress) {
            warn!("Progress sink failed at {}: {}", progress.label(), err);
        }
        Some(results)
    }
}
