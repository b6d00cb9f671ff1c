use crate::error::{CorrError, Result};
use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Identity of one input dataset, carried into the persisted table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub id: String,
    pub name: String,
}

impl DatasetMeta {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Ordered feature ids and labels of one matrix. Position `i` is column `i`.
#[derive(Clone, Debug)]
pub struct FeatureCatalog {
    pub dataset: DatasetMeta,
    pub ids: Vec<Arc<str>>,
    pub labels: Vec<String>,
}

impl FeatureCatalog {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn positions(&self) -> HashMap<&str, usize> {
        self.ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_ref(), i))
            .collect()
    }
}

/// Observations x features matrix. Missing entries are stored as NaN.
#[derive(Clone, Debug)]
pub struct FeatureMatrix {
    catalog: FeatureCatalog,
    observations: Vec<String>,
    values: Array2<f64>,
}

impl FeatureMatrix {
    pub fn new(
        dataset: DatasetMeta,
        observations: Vec<String>,
        feature_ids: Vec<String>,
        labels: Option<Vec<String>>,
        values: Array2<f64>,
    ) -> Result<Self> {
        let (n_rows, n_cols) = values.dim();
        if n_rows != observations.len() {
            return Err(CorrError::ShapeMismatch(format!(
                "matrix '{}' has {} rows but {} observation ids",
                dataset.id,
                n_rows,
                observations.len()
            )));
        }
        if n_cols != feature_ids.len() {
            return Err(CorrError::ShapeMismatch(format!(
                "matrix '{}' has {} columns but {} feature ids",
                dataset.id,
                n_cols,
                feature_ids.len()
            )));
        }
        let labels = match labels {
            Some(labels) if labels.len() != n_cols => {
                return Err(CorrError::ShapeMismatch(format!(
                    "matrix '{}' has {} columns but {} labels",
                    dataset.id,
                    n_cols,
                    labels.len()
                )));
            }
            Some(labels) => labels,
            None => feature_ids.clone(),
        };

        let mut seen = HashSet::with_capacity(n_cols);
        for id in &feature_ids {
            if !seen.insert(id.as_str()) {
                return Err(CorrError::DuplicateFeature(id.clone()));
            }
        }
        let mut seen_obs = HashSet::with_capacity(n_rows);
        for obs in &observations {
            if !seen_obs.insert(obs.as_str()) {
                return Err(CorrError::NotAligned(format!(
                    "duplicate observation id '{}' in matrix '{}'",
                    obs, dataset.id
                )));
            }
        }

        // NaN is the missing-value sentinel; infinities are never valid input.
        if let Some(((row, column), _)) = values.indexed_iter().find(|(_, v)| v.is_infinite()) {
            return Err(CorrError::NonFinite {
                dataset: dataset.id,
                row,
                column,
            });
        }

        Ok(Self {
            catalog: FeatureCatalog {
                dataset,
                ids: feature_ids.into_iter().map(Arc::from).collect(),
                labels,
            },
            observations,
            values,
        })
    }

    /// Builds a matrix from named columns; every column must have one value per observation.
    pub fn from_columns(
        dataset: DatasetMeta,
        observations: Vec<String>,
        columns: Vec<(String, Vec<f64>)>,
    ) -> Result<Self> {
        let n_rows = observations.len();
        let mut values = Array2::<f64>::zeros((n_rows, columns.len()));
        let mut ids = Vec::with_capacity(columns.len());
        for (j, (id, column)) in columns.into_iter().enumerate() {
            if column.len() != n_rows {
                return Err(CorrError::ShapeMismatch(format!(
                    "column '{}' has {} values, expected {}",
                    id,
                    column.len(),
                    n_rows
                )));
            }
            for (i, v) in column.into_iter().enumerate() {
                values[[i, j]] = v;
            }
            ids.push(id);
        }
        Self::new(dataset, observations, ids, None, values)
    }

    pub fn dataset(&self) -> &DatasetMeta {
        &self.catalog.dataset
    }

    pub fn catalog(&self) -> &FeatureCatalog {
        &self.catalog
    }

    pub fn feature_ids(&self) -> &[Arc<str>] {
        &self.catalog.ids
    }

    pub fn labels(&self) -> &[String] {
        &self.catalog.labels
    }

    pub fn observations(&self) -> &[String] {
        &self.observations
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn n_observations(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.values.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.n_observations() == 0 || self.n_features() == 0
    }

    /// Copy of this matrix restricted to the given observation rows, in that order.
    pub fn select_observations(&self, rows: &[usize]) -> FeatureMatrix {
        FeatureMatrix {
            catalog: self.catalog.clone(),
            observations: rows.iter().map(|&i| self.observations[i].clone()).collect(),
            values: self.values.select(Axis(0), rows),
        }
    }

    /// Fails unless both matrices share the exact same ordered observation axis.
    pub fn check_aligned(&self, other: &FeatureMatrix) -> Result<()> {
        if self.n_observations() != other.n_observations() {
            return Err(CorrError::NotAligned(format!(
                "'{}' has {} observations, '{}' has {}",
                self.dataset().id,
                self.n_observations(),
                other.dataset().id,
                other.n_observations()
            )));
        }
        if let Some(pos) = self
            .observations
            .iter()
            .zip(other.observations.iter())
            .position(|(a, b)| a != b)
        {
            return Err(CorrError::NotAligned(format!(
                "observation {} is '{}' in '{}' but '{}' in '{}'",
                pos,
                self.observations[pos],
                self.dataset().id,
                other.observations[pos],
                other.dataset().id
            )));
        }
        Ok(())
    }
}

/// Intersects the observation ids of both matrices (in `a`'s order) and reindexes both.
pub fn align_observations(
    a: &FeatureMatrix,
    b: &FeatureMatrix,
) -> Result<(FeatureMatrix, FeatureMatrix)> {
    let b_index: HashMap<&str, usize> = b
        .observations()
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    let mut rows_a = Vec::new();
    let mut rows_b = Vec::new();
    for (i, id) in a.observations().iter().enumerate() {
        if let Some(&j) = b_index.get(id.as_str()) {
            rows_a.push(i);
            rows_b.push(j);
        }
    }

    if rows_a.is_empty() {
        return Err(CorrError::NotAligned(format!(
            "'{}' and '{}' share no observation ids",
            a.dataset().id,
            b.dataset().id
        )));
    }

    Ok((a.select_observations(&rows_a), b.select_observations(&rows_b)))
}
