use crate::batch::PairResult;
use crate::config::Thresholds;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Per-anchor retention: top `limit` by |r|, plus the top `limit_per_sign`
/// positive and negative pairs, all among pairs with q below the ceiling.
#[derive(Clone, Debug)]
pub struct TopKFilter {
    pub limit: usize,
    pub limit_per_sign: usize,
    pub max_q_value: f64,
}

impl From<&Thresholds> for TopKFilter {
    fn from(t: &Thresholds) -> Self {
        Self {
            limit: t.limit,
            limit_per_sign: t.limit_per_sign,
            max_q_value: t.max_q_value,
        }
    }
}

fn by_counterpart(a: &PairResult, b: &PairResult) -> Ordering {
    a.counterpart.cmp(&b.counterpart)
}

/// Descending |r|, ties by counterpart id.
pub fn by_magnitude(a: &PairResult, b: &PairResult) -> Ordering {
    b.correlation
        .abs()
        .total_cmp(&a.correlation.abs())
        .then_with(|| by_counterpart(a, b))
}

impl TopKFilter {
    /// Filters a whole stream. Output is grouped by anchor id (ascending) and
    /// sorted by descending |r| within each anchor, whatever the input order.
    pub fn filter<I>(&self, results: I) -> Vec<PairResult>
    where
        I: IntoIterator<Item = PairResult>,
    {
        let mut by_anchor: BTreeMap<Arc<str>, Vec<PairResult>> = BTreeMap::new();
        for pair in results {
            by_anchor
                .entry(Arc::clone(&pair.anchor))
                .or_default()
                .push(pair);
        }
        by_anchor
            .into_values()
            .flat_map(|pairs| self.select_anchor(pairs))
            .collect()
    }

    /// Retention for the pairs of a single anchor.
    pub fn select_anchor(&self, pairs: Vec<PairResult>) -> Vec<PairResult> {
        // q ceiling first, ranking second
        let mut candidates: Vec<PairResult> = pairs
            .into_iter()
            .filter(|p| p.q_value < self.max_q_value && p.correlation.is_finite())
            .collect();
        candidates.sort_by(by_magnitude);

        let mut keep: HashSet<usize> = (0..candidates.len().min(self.limit)).collect();

        let mut negative: Vec<usize> = (0..candidates.len())
            .filter(|&i| candidates[i].correlation < 0.0)
            .collect();
        negative.sort_by(|&i, &j| {
            candidates[i]
                .correlation
                .total_cmp(&candidates[j].correlation)
                .then_with(|| by_counterpart(&candidates[i], &candidates[j]))
        });
        keep.extend(negative.into_iter().take(self.limit_per_sign));

        let mut positive: Vec<usize> = (0..candidates.len())
            .filter(|&i| candidates[i].correlation > 0.0)
            .collect();
        positive.sort_by(|&i, &j| {
            candidates[j]
                .correlation
                .total_cmp(&candidates[i].correlation)
                .then_with(|| by_counterpart(&candidates[i], &candidates[j]))
        });
        keep.extend(positive.into_iter().take(self.limit_per_sign));

        candidates
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep.contains(i))
            .map(|(_, p)| p)
            .collect()
    }
}
