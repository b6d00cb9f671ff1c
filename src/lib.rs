// Cross-matrix Pearson correlation with missing values, Beta-exact p-values,
// row-wise BH q-values, per-anchor top-K retention and indexed result tables.

pub mod batch;
pub mod config;
pub mod error;
pub mod io;
pub mod job;
pub mod mask;
pub mod matrix;
pub mod pearson;
pub mod pvalues;
pub mod store;
pub mod topk;

pub use batch::{BatchCorrelator, LogProgress, NoopProgress, PairResult, Progress, ProgressSink};
pub use config::Thresholds;
pub use error::{CorrError, Result};
pub use job::{correlate_vector, run_and_store, run_job, JobOutcome};
pub use matrix::{align_observations, DatasetMeta, FeatureCatalog, FeatureMatrix};
pub use store::{CorrelationHit, CorrelationTable, ResultStore, StoreHandle};
pub use topk::TopKFilter;
