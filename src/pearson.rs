use crate::mask::MaskGroup;
use ndarray::{Array1, Array2, ArrayBase, ArrayView2, Axis, Data, Ix2};

/// Dense correlations between the columns of two mask groups, computed over
/// the observations valid for both.
#[derive(Clone, Debug)]
pub struct GroupCorrelation {
    pub corr: Array2<f64>,
    pub effective_n: usize,
}

/// Pearson correlation between every column of `lhs` and every column of `rhs`.
///
/// Both inputs are observations x features with no missing values. Entries
/// involving a constant column are NaN; all others are clamped to [-1, 1].
pub fn correlation_cross_matrix<S1, S2>(
    lhs: &ArrayBase<S1, Ix2>,
    rhs: &ArrayBase<S2, Ix2>,
) -> Array2<f64>
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
{
    let (lhs_rows, lhs_cols) = lhs.dim();
    let (rhs_rows, rhs_cols) = rhs.dim();
    assert_eq!(
        lhs_rows, rhs_rows,
        "Pearson cross-correlation requires equal observation count in both matrices"
    );

    let (Some(means_lhs), Some(means_rhs)) = (lhs.mean_axis(Axis(0)), rhs.mean_axis(Axis(0)))
    else {
        return Array2::<f64>::from_elem((lhs_cols, rhs_cols), f64::NAN);
    };

    let centered_lhs = lhs - &means_lhs;
    let centered_rhs = rhs - &means_rhs;

    let cross = centered_lhs.t().dot(&centered_rhs);

    let ss_lhs = sum_squares(lhs, &centered_lhs);
    let ss_rhs = sum_squares(rhs, &centered_rhs);

    let mut corr = cross;
    for i in 0..lhs_cols {
        for j in 0..rhs_cols {
            let scale = (ss_lhs[i] * ss_rhs[j]).sqrt();
            corr[[i, j]] = if scale.is_finite() && scale > 0.0 {
                (corr[[i, j]] / scale).clamp(-1.0, 1.0)
            } else {
                f64::NAN
            };
        }
    }
    corr
}

// Constant columns get 0 so the caller maps them to NaN; centering a constant
// column does not always produce exact zeros.
fn sum_squares<S>(raw: &ArrayBase<S, Ix2>, centered: &Array2<f64>) -> Array1<f64>
where
    S: Data<Elem = f64>,
{
    Array1::from_iter(raw.axis_iter(Axis(1)).zip(centered.axis_iter(Axis(1))).map(
        |(raw_col, centered_col)| {
            let first = raw_col.iter().next().copied();
            if raw_col.iter().all(|v| Some(*v) == first) {
                0.0
            } else {
                centered_col.iter().map(|v| v * v).sum()
            }
        },
    ))
}

/// Correlates every column of `a_group` against every column of `b_group`.
///
/// Returns `None` when fewer than `min_samples` observations (or none at all)
/// are valid for both groups; such pairs are never computed.
pub fn correlate_groups(
    a_values: ArrayView2<f64>,
    a_group: &MaskGroup,
    b_values: ArrayView2<f64>,
    b_group: &MaskGroup,
    min_samples: usize,
) -> Option<GroupCorrelation> {
    let joint = a_group.mask.and(&b_group.mask);
    let effective_n = joint.count();
    if effective_n == 0 || effective_n < min_samples {
        return None;
    }

    let rows = joint.indices();
    let x = a_values
        .select(Axis(1), &a_group.columns)
        .select(Axis(0), &rows);
    let y = b_values
        .select(Axis(1), &b_group.columns)
        .select(Axis(0), &rows);

    Some(GroupCorrelation {
        corr: correlation_cross_matrix(&x, &y),
        effective_n,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::group_columns;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn perfectly_linear_columns() {
        let x = array![[1.0, 4.0], [2.0, 3.0], [3.0, 2.0], [4.0, 1.0]];
        let y = array![[10.0], [20.0], [30.0], [40.0]];
        let corr = correlation_cross_matrix(&x, &y);
        assert_eq!(corr.dim(), (2, 1));
        assert_abs_diff_eq!(corr[[0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(corr[[1, 0]], -1.0, epsilon = 1e-12);
    }

    #[test]
    fn constant_column_is_undefined() {
        let x = array![[0.1], [0.1], [0.1]];
        let y = array![[1.0], [2.0], [4.0]];
        let corr = correlation_cross_matrix(&x, &y);
        assert!(corr[[0, 0]].is_nan());
    }

    #[test]
    fn groups_use_only_jointly_valid_rows() {
        let nan = f64::NAN;
        let a = array![[1.0], [2.0], [3.0], [100.0], [4.0]];
        let b = array![[2.0], [4.0], [6.0], [nan], [8.0]];
        let ga = group_columns(a.view());
        let gb = group_columns(b.view());

        let res = correlate_groups(a.view(), &ga[0], b.view(), &gb[0], 3).unwrap();
        assert_eq!(res.effective_n, 4);
        assert_abs_diff_eq!(res.corr[[0, 0]], 1.0, epsilon = 1e-12);

        assert!(correlate_groups(a.view(), &ga[0], b.view(), &gb[0], 5).is_none());
    }
}
