//! Persisted, per-feature indexed correlation tables.
//!
//! One file per dataset pair:
//!
//! ```text
//! b"XCORTAB1" | header length (u64 LE) | bincode header | fixed-width rows
//! ```
//!
//! Rows reference features by position in the header's feature lists and are
//! grouped by anchor, strongest first, so an anchor lookup is one contiguous
//! read and a counterpart lookup seeks only the rows listed for it.

use crate::batch::PairResult;
use crate::config::Thresholds;
use crate::error::{CorrError, Result};
use crate::matrix::{DatasetMeta, FeatureCatalog};
use crate::topk::by_magnitude;
use bincode::config::Config;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

const MAGIC: &[u8; 8] = b"XCORTAB1";
const FORMAT_VERSION: u32 = 1;
const TABLE_EXTENSION: &str = "xcorr";
/// Encoded size of one [`StoredRow`] under [`record_config`].
pub const RECORD_LEN: usize = 40;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
struct StoredRow {
    anchor: u32,
    counterpart: u32,
    correlation: f64,
    p_value: f64,
    q_value: f64,
    effective_n: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TableHeader {
    version: u32,
    dataset_a: DatasetMeta,
    dataset_b: DatasetMeta,
    features_a: Vec<String>,
    labels_a: Vec<String>,
    features_b: Vec<String>,
    labels_b: Vec<String>,
    thresholds: Option<Thresholds>,
    /// Per anchor position: first row and row count.
    anchor_ranges: Vec<(u64, u64)>,
    /// Per counterpart position: rows that reference it, ascending.
    counterpart_rows: Vec<Vec<u64>>,
    row_count: u64,
}

fn record_config() -> impl Config {
    bincode::config::standard().with_fixed_int_encoding()
}

fn header_config() -> impl Config {
    bincode::config::standard()
}

/// Location of a written table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreHandle {
    pub path: PathBuf,
}

/// One line of a retrieval query.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrelationHit {
    pub counterpart_id: String,
    pub counterpart_label: String,
    pub correlation: f64,
    pub q_value: f64,
}

/// Directory of correlation tables, one per dataset pair.
pub struct ResultStore {
    root: PathBuf,
}

// Percent-encodes everything but ASCII alphanumerics, '-' and '.', so the
// encoded ids never contain the "__" pair separator and distinct ids never
// share a file name.
fn file_safe(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'.' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn position_u32(pos: usize) -> Result<u32> {
    u32::try_from(pos)
        .map_err(|_| CorrError::ShapeMismatch(format!("feature position {} exceeds u32", pos)))
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_path(&self, dataset_a: &str, dataset_b: &str) -> PathBuf {
        self.root.join(format!(
            "{}__{}.{}",
            file_safe(dataset_a),
            file_safe(dataset_b),
            TABLE_EXTENSION
        ))
    }

    /// Writes `results` for the pair (a, b), replacing any previous table.
    ///
    /// The table is assembled in a temporary file next to its destination and
    /// only renamed into place once fully written, so readers never observe a
    /// partial table.
    pub fn write(
        &self,
        a: &FeatureCatalog,
        b: &FeatureCatalog,
        thresholds: Option<&Thresholds>,
        results: &[PairResult],
    ) -> Result<StoreHandle> {
        let positions_a = a.positions();
        let positions_b = b.positions();

        let mut rows = Vec::with_capacity(results.len());
        for pair in results {
            let anchor = *positions_a
                .get(pair.anchor.as_ref())
                .ok_or_else(|| CorrError::UnknownFeature(pair.anchor.to_string()))?;
            let counterpart = *positions_b
                .get(pair.counterpart.as_ref())
                .ok_or_else(|| CorrError::UnknownFeature(pair.counterpart.to_string()))?;
            rows.push((anchor, counterpart, pair));
        }
        rows.sort_by(|x, y| x.0.cmp(&y.0).then_with(|| by_magnitude(x.2, y.2)));

        let mut anchor_ranges = vec![(0u64, 0u64); a.len()];
        let mut counterpart_rows = vec![Vec::new(); b.len()];
        for (row, &(anchor, counterpart, _)) in rows.iter().enumerate() {
            let range = &mut anchor_ranges[anchor];
            if range.1 == 0 {
                range.0 = row as u64;
            }
            range.1 += 1;
            counterpart_rows[counterpart].push(row as u64);
        }

        let header = TableHeader {
            version: FORMAT_VERSION,
            dataset_a: a.dataset.clone(),
            dataset_b: b.dataset.clone(),
            features_a: a.ids.iter().map(|id| id.to_string()).collect(),
            labels_a: a.labels.clone(),
            features_b: b.ids.iter().map(|id| id.to_string()).collect(),
            labels_b: b.labels.clone(),
            thresholds: thresholds.cloned(),
            anchor_ranges,
            counterpart_rows,
            row_count: rows.len() as u64,
        };
        let header_bytes = bincode::serde::encode_to_vec(&header, header_config())?;

        let path = self.table_path(&a.dataset.id, &b.dataset.id);
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        {
            let mut writer = BufWriter::new(&mut tmp);
            writer.write_all(MAGIC)?;
            writer.write_all(&(header_bytes.len() as u64).to_le_bytes())?;
            writer.write_all(&header_bytes)?;
            for (anchor, counterpart, pair) in &rows {
                let stored = StoredRow {
                    anchor: position_u32(*anchor)?,
                    counterpart: position_u32(*counterpart)?,
                    correlation: pair.correlation,
                    p_value: pair.p_value,
                    q_value: pair.q_value,
                    effective_n: pair.effective_n as u64,
                };
                let written =
                    bincode::serde::encode_into_std_write(stored, &mut writer, record_config())?;
                debug_assert_eq!(written, RECORD_LEN);
            }
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&path)?;

        info!(
            "Stored {} correlation(s) for '{}' x '{}' in {}",
            rows.len(),
            a.dataset.id,
            b.dataset.id,
            path.display()
        );
        Ok(StoreHandle { path })
    }

    pub fn open(&self, dataset_a: &str, dataset_b: &str) -> Result<CorrelationTable> {
        let path = self.table_path(dataset_a, dataset_b);
        if !path.is_file() {
            return Err(CorrError::UnknownDataset(
                dataset_a.to_string(),
                dataset_b.to_string(),
            ));
        }
        let table = CorrelationTable::open(&StoreHandle { path })?;
        if table.dataset_a().id != dataset_a || table.dataset_b().id != dataset_b {
            return Err(CorrError::UnknownDataset(
                dataset_a.to_string(),
                dataset_b.to_string(),
            ));
        }
        Ok(table)
    }

    /// All stored correlations involving `feature_id`, strongest first.
    pub fn get_correlations_for(
        &self,
        dataset_a: &str,
        dataset_b: &str,
        feature_id: &str,
    ) -> Result<Vec<CorrelationHit>> {
        self.open(dataset_a, dataset_b)?.hits(feature_id)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Anchor,
    Counterpart,
}

/// An opened table; only the header is held in memory.
pub struct CorrelationTable {
    path: PathBuf,
    header: TableHeader,
    data_offset: u64,
    lookup_a: HashMap<String, usize>,
    lookup_b: HashMap<String, usize>,
}

impl CorrelationTable {
    pub fn open(handle: &StoreHandle) -> Result<Self> {
        let file = File::open(&handle.path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(CorrError::CorruptTable(format!(
                "{} is not a correlation table",
                handle.path.display()
            )));
        }
        let mut len_bytes = [0u8; 8];
        reader.read_exact(&mut len_bytes)?;
        let header_len = u64::from_le_bytes(len_bytes);
        if header_len > file_len {
            return Err(CorrError::CorruptTable(format!(
                "header length {} exceeds file size {}",
                header_len, file_len
            )));
        }
        let mut header_bytes = vec![0u8; header_len as usize];
        reader.read_exact(&mut header_bytes)?;
        let (header, _): (TableHeader, usize) =
            bincode::serde::decode_from_slice(&header_bytes, header_config())?;

        if header.version != FORMAT_VERSION {
            return Err(CorrError::CorruptTable(format!(
                "unsupported table version {}",
                header.version
            )));
        }
        let data_offset = (MAGIC.len() + 8) as u64 + header_len;
        let expected_len = header
            .row_count
            .checked_mul(RECORD_LEN as u64)
            .and_then(|bytes| bytes.checked_add(data_offset))
            .ok_or_else(|| {
                CorrError::CorruptTable(format!("row count {} overflows", header.row_count))
            })?;
        if file_len != expected_len {
            return Err(CorrError::CorruptTable(format!(
                "expected {} bytes for {} rows, found {}",
                expected_len, header.row_count, file_len
            )));
        }
        if header.anchor_ranges.len() != header.features_a.len()
            || header.counterpart_rows.len() != header.features_b.len()
            || header.labels_a.len() != header.features_a.len()
            || header.labels_b.len() != header.features_b.len()
        {
            return Err(CorrError::CorruptTable(
                "feature lists and indexes disagree in length".into(),
            ));
        }
        let row_count = header.row_count;
        let range_ok = |&(first, count): &(u64, u64)| {
            first.checked_add(count).is_some_and(|end| end <= row_count)
        };
        if !header.anchor_ranges.iter().all(range_ok) {
            return Err(CorrError::CorruptTable(format!(
                "anchor range beyond {} rows",
                row_count
            )));
        }
        if header
            .counterpart_rows
            .iter()
            .flatten()
            .any(|&row| row >= row_count)
        {
            return Err(CorrError::CorruptTable(format!(
                "counterpart row index beyond {} rows",
                row_count
            )));
        }

        let index = |ids: &[String]| -> HashMap<String, usize> {
            ids.iter()
                .enumerate()
                .map(|(i, id)| (id.clone(), i))
                .collect()
        };
        let lookup_a = index(header.features_a.as_slice());
        let lookup_b = index(header.features_b.as_slice());
        debug!(
            "Opened {} ({} rows, {} x {} features)",
            handle.path.display(),
            header.row_count,
            header.features_a.len(),
            header.features_b.len()
        );

        Ok(Self {
            path: handle.path.clone(),
            header,
            data_offset,
            lookup_a,
            lookup_b,
        })
    }

    pub fn dataset_a(&self) -> &DatasetMeta {
        &self.header.dataset_a
    }

    pub fn dataset_b(&self) -> &DatasetMeta {
        &self.header.dataset_b
    }

    pub fn features_a(&self) -> &[String] {
        &self.header.features_a
    }

    pub fn features_b(&self) -> &[String] {
        &self.header.features_b
    }

    pub fn thresholds(&self) -> Option<&Thresholds> {
        self.header.thresholds.as_ref()
    }

    pub fn row_count(&self) -> u64 {
        self.header.row_count
    }

    fn decode_rows(bytes: &[u8]) -> Result<Vec<StoredRow>> {
        bytes
            .chunks_exact(RECORD_LEN)
            .map(|chunk| -> Result<StoredRow> {
                let (row, _): (StoredRow, usize) =
                    bincode::serde::decode_from_slice(chunk, record_config())?;
                Ok(row)
            })
            .collect()
    }

    fn rows_for(&self, feature_id: &str) -> Result<Vec<(StoredRow, Side)>> {
        let as_anchor = self.lookup_a.get(feature_id).copied();
        let as_counterpart = self.lookup_b.get(feature_id).copied();
        if as_anchor.is_none() && as_counterpart.is_none() {
            return Err(CorrError::UnknownFeature(feature_id.to_string()));
        }

        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut out = Vec::new();
        let mut taken: HashSet<u64> = HashSet::new();

        if let Some(pos) = as_anchor {
            let (first, count) = self.header.anchor_ranges[pos];
            if count > 0 {
                reader.seek(SeekFrom::Start(
                    self.data_offset + first * RECORD_LEN as u64,
                ))?;
                let mut buf = vec![0u8; count as usize * RECORD_LEN];
                reader.read_exact(&mut buf)?;
                for (k, row) in Self::decode_rows(&buf)?.into_iter().enumerate() {
                    taken.insert(first + k as u64);
                    out.push((row, Side::Anchor));
                }
            }
        }

        if let Some(pos) = as_counterpart {
            let mut buf = [0u8; RECORD_LEN];
            for &row_idx in &self.header.counterpart_rows[pos] {
                if taken.contains(&row_idx) {
                    continue;
                }
                reader.seek(SeekFrom::Start(
                    self.data_offset + row_idx * RECORD_LEN as u64,
                ))?;
                reader.read_exact(&mut buf)?;
                for row in Self::decode_rows(&buf)? {
                    out.push((row, Side::Counterpart));
                }
            }
        }
        Ok(out)
    }

    fn resolve(&self, row: &StoredRow) -> Result<PairResult> {
        let anchor = self
            .header
            .features_a
            .get(row.anchor as usize)
            .ok_or_else(|| CorrError::CorruptTable(format!("anchor position {}", row.anchor)))?;
        let counterpart = self
            .header
            .features_b
            .get(row.counterpart as usize)
            .ok_or_else(|| {
                CorrError::CorruptTable(format!("counterpart position {}", row.counterpart))
            })?;
        Ok(PairResult {
            anchor: Arc::from(anchor.as_str()),
            counterpart: Arc::from(counterpart.as_str()),
            correlation: row.correlation,
            effective_n: row.effective_n as usize,
            p_value: row.p_value,
            q_value: row.q_value,
        })
    }

    /// Every stored pair involving `feature_id` on either side, with feature
    /// ids resolved from the stored lists.
    pub fn read(&self, feature_id: &str) -> Result<Vec<PairResult>> {
        self.rows_for(feature_id)?
            .iter()
            .map(|(row, _)| self.resolve(row))
            .collect()
    }

    /// Counterparts of `feature_id` ordered by descending |r|.
    pub fn hits(&self, feature_id: &str) -> Result<Vec<CorrelationHit>> {
        let mut hits = Vec::new();
        for (row, side) in self.rows_for(feature_id)? {
            let (ids, labels, pos) = match side {
                Side::Anchor => (
                    &self.header.features_b,
                    &self.header.labels_b,
                    row.counterpart as usize,
                ),
                Side::Counterpart => (
                    &self.header.features_a,
                    &self.header.labels_a,
                    row.anchor as usize,
                ),
            };
            let (Some(id), Some(label)) = (ids.get(pos), labels.get(pos)) else {
                return Err(CorrError::CorruptTable(format!(
                    "feature position {} out of range",
                    pos
                )));
            };
            hits.push(CorrelationHit {
                counterpart_id: id.clone(),
                counterpart_label: label.clone(),
                correlation: row.correlation,
                q_value: row.q_value,
            });
        }
        hits.sort_by(|x, y| {
            y.correlation
                .abs()
                .total_cmp(&x.correlation.abs())
                .then_with(|| x.counterpart_id.cmp(&y.counterpart_id))
        });
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_encoding_is_fixed_width() {
        let row = StoredRow {
            anchor: u32::MAX,
            counterpart: 3,
            correlation: -0.25,
            p_value: 1e-300,
            q_value: f64::NAN,
            effective_n: 12,
        };
        let bytes = bincode::serde::encode_to_vec(row, record_config()).unwrap();
        assert_eq!(bytes.len(), RECORD_LEN);
        let back = CorrelationTable::decode_rows(&bytes).unwrap();
        assert_eq!(back[0].anchor, u32::MAX);
        assert_eq!(back[0].correlation, -0.25);
        assert!(back[0].q_value.is_nan());
    }

    #[test]
    fn file_names_are_sanitised() {
        let store = ResultStore {
            root: PathBuf::from("/tmp/x"),
        };
        let path = store.table_path("crispr/v2", "rna seq");
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "crispr%2Fv2__rna%20seq.xcorr"
        );
        assert_ne!(
            store.table_path("crispr/v2", "x"),
            store.table_path("crispr_v2", "x")
        );
        assert_ne!(store.table_path("x__y", "z"), store.table_path("x", "y__z"));
    }

    fn header(
        anchor_ranges: Vec<(u64, u64)>,
        counterpart_rows: Vec<Vec<u64>>,
        row_count: u64,
    ) -> TableHeader {
        TableHeader {
            version: FORMAT_VERSION,
            dataset_a: DatasetMeta::new("a", "a"),
            dataset_b: DatasetMeta::new("b", "b"),
            features_a: vec!["x".into()],
            labels_a: vec!["x".into()],
            features_b: vec!["y".into()],
            labels_b: vec!["y".into()],
            thresholds: None,
            anchor_ranges,
            counterpart_rows,
            row_count,
        }
    }

    // Writes a header followed by `rows` zeroed records.
    fn write_raw(path: &Path, header: &TableHeader, rows: usize) {
        let bytes = bincode::serde::encode_to_vec(header, header_config()).unwrap();
        let mut file = File::create(path).unwrap();
        file.write_all(MAGIC).unwrap();
        file.write_all(&(bytes.len() as u64).to_le_bytes()).unwrap();
        file.write_all(&bytes).unwrap();
        file.write_all(&vec![0u8; rows * RECORD_LEN]).unwrap();
    }

    fn open_raw(dir: &Path, header: &TableHeader, rows: usize) -> Result<CorrelationTable> {
        let path = dir.join("raw.xcorr");
        write_raw(&path, header, rows);
        CorrelationTable::open(&StoreHandle { path })
    }

    #[test]
    fn well_formed_raw_table_opens() {
        let dir = tempfile::tempdir().unwrap();
        let table = open_raw(dir.path(), &header(vec![(0, 1)], vec![vec![0]], 1), 1).unwrap();
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.read("y").unwrap().len(), 1);
    }

    #[test]
    fn overflowing_row_count_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let result = open_raw(dir.path(), &header(vec![(0, 0)], vec![vec![]], u64::MAX / 8), 0);
        assert!(matches!(result, Err(CorrError::CorruptTable(_))));
    }

    #[test]
    fn indexes_past_the_last_row_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let huge_range = header(vec![(0, 1 << 40)], vec![vec![]], 1);
        assert!(matches!(
            open_raw(dir.path(), &huge_range, 1),
            Err(CorrError::CorruptTable(_))
        ));

        let wrapping_range = header(vec![(u64::MAX, 2)], vec![vec![]], 1);
        assert!(matches!(
            open_raw(dir.path(), &wrapping_range, 1),
            Err(CorrError::CorruptTable(_))
        ));

        let stray_row = header(vec![(0, 1)], vec![vec![0, 1]], 1);
        assert!(matches!(
            open_raw(dir.path(), &stray_row, 1),
            Err(CorrError::CorruptTable(_))
        ));
    }
}
