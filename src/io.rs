use crate::batch::PairResult;
use crate::error::{CorrError, Result};
use crate::matrix::{DatasetMeta, FeatureMatrix};
use csv::{ReaderBuilder, WriterBuilder};
use flate2::{
    read::{GzDecoder, MultiGzDecoder},
    write::GzEncoder,
    Compression,
};
use log::debug;
use ndarray::Array2;
use std::{
    fs::File,
    io::{Cursor, Read},
    path::Path,
};
use tar::{Archive, Builder, Header};

const MISSING_TOKENS: [&str; 7] = ["", "NA", "NaN", "nan", "N/A", "null", "NULL"];

/// Dataset id for a matrix file: the file stem, without a `.tar` or `.tsv` suffix.
pub fn dataset_id_from_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("data");
    let stem = stem.strip_suffix(".tar").unwrap_or(stem);
    let stem = stem.strip_suffix(".tsv").unwrap_or(stem);
    stem.to_string()
}

fn parse_cell(raw: &str, line: usize, column: usize) -> Result<f64> {
    let trimmed = raw.trim();
    if MISSING_TOKENS.contains(&trimmed) {
        return Ok(f64::NAN);
    }
    trimmed.parse::<f64>().map_err(|_| CorrError::NonNumeric {
        line,
        column,
        value: trimmed.to_string(),
    })
}

/// Reads a tab-separated matrix with one feature per line.
///
/// The header's first cell is ignored; an optional second column named
/// `label` holds display labels; the remaining header cells are observation
/// ids. Empty cells and `NA`/`NaN`/`null` are missing values.
pub fn read_matrix_data<R: Read>(reader: R, dataset: DatasetMeta) -> Result<FeatureMatrix> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let has_labels = headers
        .get(1)
        .map(|h| h.trim().eq_ignore_ascii_case("label"))
        .unwrap_or(false);
    let first_value = if has_labels { 2 } else { 1 };
    let observations: Vec<String> = headers
        .iter()
        .skip(first_value)
        .map(|h| h.trim().to_string())
        .collect();
    if observations.is_empty() {
        return Err(CorrError::EmptyMatrix(dataset.id));
    }

    let mut ids = Vec::new();
    let mut labels = Vec::new();
    let mut columns: Vec<Vec<f64>> = Vec::new();
    for (idx, record) in rdr.records().enumerate() {
        let record = record?;
        let line = idx + 2; // header offset

        let raw_id = record.get(0).unwrap_or("").trim();
        if raw_id.is_empty() {
            return Err(CorrError::ShapeMismatch(format!(
                "empty feature id on line {}",
                line
            )));
        }
        let label = if has_labels {
            record.get(1).map(str::trim).unwrap_or("")
        } else {
            ""
        };

        let values = record
            .iter()
            .enumerate()
            .skip(first_value)
            .map(|(col, cell)| parse_cell(cell, line, col + 1))
            .collect::<Result<Vec<f64>>>()?;

        ids.push(raw_id.to_string());
        labels.push(if label.is_empty() {
            raw_id.to_string()
        } else {
            label.to_string()
        });
        columns.push(values);
    }

    let n_obs = observations.len();
    let values = Array2::from_shape_fn((n_obs, columns.len()), |(i, j)| columns[j][i]);
    debug!(
        "Read '{}': {} features x {} observations",
        dataset.id,
        ids.len(),
        n_obs
    );
    FeatureMatrix::new(dataset, observations, ids, Some(labels), values)
}

/// Reads `.tsv`, `.gz` or `.tar.gz` (first regular file) matrices.
pub fn read_feature_matrix(path: &Path) -> Result<FeatureMatrix> {
    let id = dataset_id_from_path(path);
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(id.as_str())
        .to_string();
    let dataset = DatasetMeta::new(id, name);

    let file_name = path.to_string_lossy();
    if file_name.ends_with(".tar.gz") {
        let file = File::open(path)?;
        let mut archive = Archive::new(GzDecoder::new(file));
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.header().entry_type().is_file() {
                return read_matrix_data(&mut entry, dataset);
            }
        }
        Err(CorrError::EmptyMatrix(format!(
            "{} (no readable file in tar archive)",
            dataset.id
        )))
    } else if file_name.ends_with(".gz") {
        read_matrix_data(MultiGzDecoder::new(File::open(path)?), dataset)
    } else {
        read_matrix_data(File::open(path)?, dataset)
    }
}

/// Writes retained pairs as one TSV inside a gzip-compressed tar archive.
pub fn write_results_archive(path: &Path, entry_name: &str, results: &[PairResult]) -> Result<()> {
    let mut csv_buf = Vec::<u8>::new();
    {
        let mut wtr = WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(&mut csv_buf);
        wtr.write_record([
            "anchor",
            "counterpart",
            "correlation",
            "p_value",
            "q_value",
            "effective_n",
        ])?;
        for pair in results {
            wtr.write_record([
                pair.anchor.to_string(),
                pair.counterpart.to_string(),
                pair.correlation.to_string(),
                pair.p_value.to_string(),
                pair.q_value.to_string(),
                pair.effective_n.to_string(),
            ])?;
        }
        wtr.flush()?;
    }

    let enc = GzEncoder::new(File::create(path)?, Compression::default());
    let mut tar_builder = Builder::new(enc);

    let mut header = Header::new_gnu();
    header.set_size(csv_buf.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    tar_builder.append_data(&mut header, entry_name, &mut Cursor::new(csv_buf))?;
    tar_builder.into_inner()?.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TSV: &str = "gene\tlabel\ts1\ts2\ts3\n\
                       g1\tAlpha\t1.0\tNA\t3\n\
                       g2\t\t4\t5\t\n";

    #[test]
    fn reads_features_as_columns_with_labels() {
        let m = read_matrix_data(TSV.as_bytes(), DatasetMeta::new("x", "x")).unwrap();
        assert_eq!(m.observations(), ["s1", "s2", "s3"]);
        assert_eq!(m.n_features(), 2);
        assert_eq!(m.labels(), ["Alpha", "g2"]);
        let v = m.values();
        assert_eq!(v[[0, 0]], 1.0);
        assert!(v[[1, 0]].is_nan());
        assert_eq!(v[[1, 1]], 5.0);
        assert!(v[[2, 1]].is_nan());
    }

    #[test]
    fn non_numeric_cells_are_rejected_with_position() {
        let tsv = "id\ts1\ts2\nf1\t1\tabc\n";
        let err = read_matrix_data(tsv.as_bytes(), DatasetMeta::new("x", "x")).unwrap_err();
        assert!(matches!(
            err,
            CorrError::NonNumeric { line: 2, column: 3, ref value } if value == "abc"
        ));
    }

    #[test]
    fn dataset_id_strips_archive_suffixes() {
        assert_eq!(dataset_id_from_path(Path::new("/d/crispr.tar.gz")), "crispr");
        assert_eq!(dataset_id_from_path(Path::new("expr.tsv.gz")), "expr");
        assert_eq!(dataset_id_from_path(Path::new("plain.tsv")), "plain");
    }
}
