use approx::assert_abs_diff_eq;
use crosscorr::{
    correlate_vector, run_job, BatchCorrelator, DatasetMeta, FeatureMatrix, NoopProgress,
    PairResult, Thresholds,
};
use std::collections::HashMap;

fn observations(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("cell{}", i)).collect()
}

fn matrix(id: &str, columns: Vec<(String, Vec<f64>)>) -> FeatureMatrix {
    let n = columns.first().map(|c| c.1.len()).unwrap_or(0);
    FeatureMatrix::from_columns(DatasetMeta::new(id, id), observations(n), columns)
        .expect("valid matrix")
}

fn keep_everything() -> Thresholds {
    Thresholds {
        batch_size: 1000,
        limit: 100_000,
        limit_per_sign: 100_000,
        max_q_value: 100.0,
        min_samples: 0,
    }
}

// Deterministic pseudo-data with a few holes: whole observations missing for
// some columns (shared patterns) and scattered single gaps.
fn synthetic(id: &str, n_rows: usize, n_cols: usize, seed: f64, with_gaps: bool) -> FeatureMatrix {
    let columns = (0..n_cols)
        .map(|j| {
            let values = (0..n_rows)
                .map(|i| {
                    if with_gaps && j % 3 == 0 && i < 2 {
                        return f64::NAN;
                    }
                    if with_gaps && j % 5 == 4 && (i + j) % 7 == 0 {
                        return f64::NAN;
                    }
                    let x = i as f64 + 1.0;
                    (x * (0.37 + seed) + j as f64 * 1.3).sin() * (j as f64 + 1.0)
                        + ((x * x + seed * j as f64) * 0.11).cos()
                })
                .collect();
            (format!("{}_{}", id, j), values)
        })
        .collect();
    matrix(id, columns)
}

fn all_pairs(a: &FeatureMatrix, b: &FeatureMatrix, t: &Thresholds) -> Vec<PairResult> {
    BatchCorrelator::new(a, b, t)
        .unwrap()
        .run(&NoopProgress)
        .flatten()
        .collect()
}

#[test]
fn perfect_and_null_correlation_scenario() {
    let a = matrix("a", vec![("A".into(), vec![1.0, 2.0, 3.0, 4.0])]);
    let b = matrix(
        "b",
        vec![
            ("C".into(), vec![10.0, 20.0, 30.0, 40.0]),
            ("D".into(), vec![-10.0, 10.0, 10.0, -10.0]),
        ],
    );
    let out = run_job(&a, &b, &keep_everything(), &NoopProgress).unwrap();
    assert_eq!(out.results.len(), 2);

    let by_id: HashMap<&str, &PairResult> = out
        .results
        .iter()
        .map(|p| (p.counterpart.as_ref(), p))
        .collect();
    assert_abs_diff_eq!(by_id["C"].correlation, 1.0, epsilon = 1e-5);
    assert_abs_diff_eq!(by_id["D"].correlation, 0.0, epsilon = 1e-5);
    assert_eq!(by_id["C"].effective_n, 4);
    assert!(by_id["C"].q_value <= by_id["D"].q_value);
}

#[test]
fn pairs_below_min_samples_are_not_emitted() {
    let nan = f64::NAN;
    let a = matrix("a", vec![("x".into(), vec![1.0, 2.0, 3.0, 4.0, 5.0])]);
    let b = matrix(
        "b",
        vec![
            ("sparse".into(), vec![1.0, nan, nan, nan, 3.0]),
            ("dense".into(), vec![2.0, 1.0, 4.0, 3.0, 5.0]),
        ],
    );
    let t = Thresholds {
        min_samples: 3,
        ..keep_everything()
    };
    let out = run_job(&a, &b, &t, &NoopProgress).unwrap();
    assert_eq!(out.results.len(), 1);
    assert_eq!(out.results[0].counterpart.as_ref(), "dense");
    assert_eq!(out.evaluated_pairs, 1);
}

#[test]
fn complete_data_matches_normalized_cross_product() {
    let a = synthetic("a", 30, 7, 0.0, false);
    let b = synthetic("b", 30, 5, 0.5, false);
    let pairs = all_pairs(&a, &b, &keep_everything());
    assert_eq!(pairs.len(), 35);

    let zscore = |v: Vec<f64>| -> Vec<f64> {
        let n = v.len() as f64;
        let mean = v.iter().sum::<f64>() / n;
        let centered: Vec<f64> = v.iter().map(|x| x - mean).collect();
        let norm = centered.iter().map(|x| x * x).sum::<f64>().sqrt();
        centered.iter().map(|x| x / norm).collect()
    };

    for pair in &pairs {
        let i = a
            .feature_ids()
            .iter()
            .position(|id| *id == pair.anchor)
            .unwrap();
        let j = b
            .feature_ids()
            .iter()
            .position(|id| *id == pair.counterpart)
            .unwrap();
        let x = zscore(a.values().column(i).to_vec());
        let y = zscore(b.values().column(j).to_vec());
        let expected: f64 = x.iter().zip(y.iter()).map(|(p, q)| p * q).sum();
        assert_abs_diff_eq!(pair.correlation, expected, epsilon = 1e-9);
        assert!((-1.0..=1.0).contains(&pair.correlation));
        assert_eq!(pair.effective_n, 30);
    }
}

#[test]
fn chunk_size_does_not_change_the_output() {
    let a = synthetic("a", 40, 11, 0.2, true);
    let b = synthetic("b", 40, 9, 0.9, true);

    for (limit, per_sign) in [(100_000, 100_000), (3, 2)] {
        let base = Thresholds {
            batch_size: a.n_features(),
            limit,
            limit_per_sign: per_sign,
            max_q_value: 1.01,
            min_samples: 5,
        };
        let reference = run_job(&a, &b, &base, &NoopProgress).unwrap().results;
        assert!(!reference.is_empty());

        for batch_size in [1, 2, 4, 10] {
            let t = Thresholds {
                batch_size,
                ..base.clone()
            };
            let chunked = run_job(&a, &b, &t, &NoopProgress).unwrap().results;
            assert_eq!(chunked.len(), reference.len(), "batch_size={}", batch_size);

            let lookup: HashMap<(&str, &str), &PairResult> = chunked
                .iter()
                .map(|p| ((p.anchor.as_ref(), p.counterpart.as_ref()), p))
                .collect();
            for p in &reference {
                let q = lookup[&(p.anchor.as_ref(), p.counterpart.as_ref())];
                assert_abs_diff_eq!(p.correlation, q.correlation, epsilon = 1e-12);
                assert_abs_diff_eq!(p.q_value, q.q_value, epsilon = 1e-12);
                assert_eq!(p.effective_n, q.effective_n);
            }
        }
    }
}

#[test]
fn one_per_sign_keeps_extremes_of_each_sign() {
    let n = 12;
    let anchor: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let mut columns = Vec::new();
    for k in 0..5 {
        let pos: Vec<f64> = (0..n)
            .map(|i| i as f64 + (k as f64 + 1.0) * ((i * 7 % 5) as f64))
            .collect();
        let neg: Vec<f64> = (0..n)
            .map(|i| -(i as f64) + (k as f64 + 1.5) * ((i * 3 % 4) as f64))
            .collect();
        columns.push((format!("pos{}", k), pos));
        columns.push((format!("neg{}", k), neg));
    }
    let a = matrix("a", vec![("anchor".into(), anchor)]);
    let b = matrix("b", columns);

    let everything = all_pairs(&a, &b, &keep_everything());
    assert_eq!(everything.len(), 10);
    let most_negative = everything
        .iter()
        .min_by(|x, y| x.correlation.total_cmp(&y.correlation))
        .unwrap();
    let most_positive = everything
        .iter()
        .max_by(|x, y| x.correlation.total_cmp(&y.correlation))
        .unwrap();
    assert!(most_negative.correlation < 0.0);
    assert!(most_positive.correlation > 0.0);

    let t = Thresholds {
        limit: 0,
        limit_per_sign: 1,
        max_q_value: 1.01,
        ..keep_everything()
    };
    let out = run_job(&a, &b, &t, &NoopProgress).unwrap().results;
    let mut ids: Vec<&str> = out.iter().map(|p| p.counterpart.as_ref()).collect();
    ids.sort_unstable();
    let mut expected = vec![
        most_negative.counterpart.as_ref(),
        most_positive.counterpart.as_ref(),
    ];
    expected.sort_unstable();
    assert_eq!(ids, expected);

    let t = Thresholds {
        limit: 3,
        ..t
    };
    let out = run_job(&a, &b, &t, &NoopProgress).unwrap().results;
    assert!(out.len() >= 3 && out.len() <= 3 + 2);
}

#[test]
fn vector_query_uses_the_matrix_path() {
    let b = synthetic("b", 25, 6, 0.4, true);
    let query: Vec<f64> = b.values().column(1).iter().map(|v| v * 2.0 + 1.0).collect();
    let t = Thresholds {
        min_samples: 3,
        ..keep_everything()
    };

    let hits = correlate_vector("probe", &query, &b, &t).unwrap();
    assert_eq!(hits[0].counterpart.as_ref(), "b_1");
    assert_abs_diff_eq!(hits[0].correlation, 1.0, epsilon = 1e-12);
    assert!(hits
        .windows(2)
        .all(|w| w[0].correlation.abs() >= w[1].correlation.abs()));

    let a = matrix("probe", vec![("probe".into(), query)]);
    let job = run_job(&a, &b, &t, &NoopProgress).unwrap().results;
    assert_eq!(hits, job);

    assert!(correlate_vector("short", &[1.0, 2.0], &b, &t).is_err());
}
