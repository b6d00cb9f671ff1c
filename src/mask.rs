use ndarray::{ArrayView1, ArrayView2};
use std::collections::HashMap;
use std::ops::Range;

const WORD_BITS: usize = 64;

/// Fixed-width bit set: bit `i` is set when observation `i` holds a value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PresenceMask {
    words: Vec<u64>,
    len: usize,
}

impl PresenceMask {
    pub fn from_column(column: ArrayView1<f64>) -> Self {
        let len = column.len();
        let mut words = vec![0u64; len.div_ceil(WORD_BITS)];
        for (i, v) in column.iter().enumerate() {
            if !v.is_nan() {
                words[i / WORD_BITS] |= 1u64 << (i % WORD_BITS);
            }
        }
        Self { words, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_present(&self, i: usize) -> bool {
        i < self.len && self.words[i / WORD_BITS] & (1u64 << (i % WORD_BITS)) != 0
    }

    /// Number of present observations.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn and(&self, other: &PresenceMask) -> PresenceMask {
        debug_assert_eq!(self.len, other.len);
        PresenceMask {
            words: self
                .words
                .iter()
                .zip(other.words.iter())
                .map(|(a, b)| a & b)
                .collect(),
            len: self.len.min(other.len),
        }
    }

    /// Indices of present observations, ascending.
    pub fn indices(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.count());
        for (w, &word) in self.words.iter().enumerate() {
            let mut bits = word;
            while bits != 0 {
                let tz = bits.trailing_zeros() as usize;
                out.push(w * WORD_BITS + tz);
                bits &= bits - 1;
            }
        }
        out
    }
}

/// Columns sharing one exact presence pattern.
#[derive(Clone, Debug)]
pub struct MaskGroup {
    pub mask: PresenceMask,
    pub columns: Vec<usize>,
}

pub fn group_columns(values: ArrayView2<f64>) -> Vec<MaskGroup> {
    group_column_range(values, 0..values.ncols())
}

/// Partitions `range` of the matrix columns by presence pattern. Column indices
/// refer to the full matrix; groups appear in order of first occurrence.
pub fn group_column_range(values: ArrayView2<f64>, range: Range<usize>) -> Vec<MaskGroup> {
    let mut slots: HashMap<PresenceMask, usize> = HashMap::new();
    let mut groups: Vec<MaskGroup> = Vec::new();

    for col in range {
        let mask = PresenceMask::from_column(values.column(col));
        match slots.get(&mask) {
            Some(&slot) => groups[slot].columns.push(col),
            None => {
                slots.insert(mask.clone(), groups.len());
                groups.push(MaskGroup {
                    mask,
                    columns: vec![col],
                });
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn groups_partition_columns_by_exact_pattern() {
        let nan = f64::NAN;
        let data = array![
            [1.0, 2.0, nan, 4.0, nan],
            [1.0, nan, nan, 4.0, nan],
            [1.0, 2.0, nan, 4.0, 5.0],
        ];
        let groups = group_columns(data.view());

        let mut seen: Vec<usize> = groups.iter().flat_map(|g| g.columns.clone()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        assert_eq!(groups.len(), 4);
        assert_eq!(groups[0].columns, vec![0, 3]);
        assert_eq!(groups[1].columns, vec![1]);
        assert_eq!(groups[2].columns, vec![2]);
        assert_eq!(groups[2].mask.count(), 0);
        assert_eq!(groups[3].columns, vec![4]);

        for (gi, g) in groups.iter().enumerate() {
            for (gj, h) in groups.iter().enumerate() {
                assert_eq!(gi == gj, g.mask == h.mask);
            }
        }
    }

    #[test]
    fn range_grouping_reports_absolute_indices() {
        let data = Array2::<f64>::ones((3, 6));
        let groups = group_column_range(data.view(), 2..5);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].columns, vec![2, 3, 4]);
    }

    #[test]
    fn masks_wider_than_one_word() {
        let mut col = vec![1.0; 130];
        col[0] = f64::NAN;
        col[64] = f64::NAN;
        col[129] = f64::NAN;
        let mask = PresenceMask::from_column(ndarray::ArrayView1::from(&col));
        assert_eq!(mask.len(), 130);
        assert_eq!(mask.count(), 127);
        assert!(!mask.is_present(64));
        assert!(mask.is_present(65));

        let other = PresenceMask::from_column(ndarray::ArrayView1::from(&vec![1.0; 130]));
        let joint = mask.and(&other);
        assert_eq!(joint, mask);
        let idx = joint.indices();
        assert_eq!(idx.len(), 127);
        assert_eq!(idx[0], 1);
        assert!(!idx.contains(&129));
    }
}
