//! ADASYN による少数クラスのオーバーサンプリング
//!
//! 近傍に他クラスが多い（＝少数クラスが疎な）サンプルほど多くの合成点を割り当て、
//! 各クラスを多数クラスと同数まで増やします。学習データにのみ適用すること。

use ndarray::{s, Array2, ArrayView1};
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dataset::class_counts;
use crate::error::{PipelineError, Result, Stage};
use crate::types::Label;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdasynConfig {
    /// 近傍数 k
    pub n_neighbors: usize,
    pub seed: u64,
}

impl Default for AdasynConfig {
    fn default() -> Self {
        Self {
            n_neighbors: 5,
            seed: 42,
        }
    }
}

impl AdasynConfig {
    /// 学習開始前の設定チェック
    ///
    /// 増やす必要のあるクラスは、自身を除いて k 個の同クラス近傍を持てる数が必要。
    pub fn validate(&self, labels: &[Label]) -> Result<()> {
        if self.n_neighbors == 0 {
            return Err(PipelineError::invalid_config(
                Stage::Resampling,
                "n_neighbors must be positive",
            ));
        }

        let counts = class_counts(labels);
        if counts.len() < 2 {
            return Err(PipelineError::invalid_input(
                Stage::Resampling,
                format!("at least two classes are required, found {}", counts.len()),
            ));
        }

        let majority = counts.values().copied().max().unwrap_or(0);
        let required = self.n_neighbors + 1;
        for (&label, &count) in &counts {
            if count < majority && count < required {
                return Err(PipelineError::InsufficientSamples {
                    label,
                    count,
                    required,
                });
            }
        }
        Ok(())
    }

    /// 元のサンプルの後ろに合成サンプルを連結して返す
    pub fn fit_resample(&self, x: &Array2<f64>, labels: &[Label]) -> Result<(Array2<f64>, Vec<Label>)> {
        if x.nrows() != labels.len() {
            return Err(PipelineError::invalid_input(
                Stage::Resampling,
                format!("{} feature rows but {} labels", x.nrows(), labels.len()),
            ));
        }
        self.validate(labels)?;

        let counts = class_counts(labels);
        let majority = counts.values().copied().max().unwrap_or(0);
        let k = self.n_neighbors;
        let all: Vec<usize> = (0..labels.len()).collect();

        // クラスごとの合成計画: (ラベル, 元サンプル, 合成数)
        let mut plans = Vec::new();
        for (&label, &count) in &counts {
            if count == majority {
                continue;
            }
            let n_generate = majority - count;
            let members: Vec<usize> = all.iter().copied().filter(|&i| labels[i] == label).collect();

            // 全データ上の k 近傍のうち他クラスが占める割合
            let ratios: Vec<f64> = members
                .par_iter()
                .map(|&i| {
                    let neighbours = nearest_neighbours(x, i, &all, k);
                    let foreign = neighbours.iter().filter(|&&j| labels[j] != label).count();
                    foreign as f64 / k as f64
                })
                .collect();

            let total: f64 = ratios.iter().sum();
            if total == 0.0 {
                return Err(PipelineError::NoNeighboursInOtherClasses { label });
            }

            let per_sample = largest_remainder(&ratios, n_generate);
            tracing::debug!(
                "[adasyn] クラス {}: {} -> {} (合成 {})",
                label,
                count,
                majority,
                n_generate
            );
            plans.push((label, members, per_sample));
        }

        let n_new: usize = plans.iter().map(|(_, _, p)| p.iter().sum::<usize>()).sum();
        let (n, d) = x.dim();
        let mut out = Array2::<f64>::zeros((n + n_new, d));
        out.slice_mut(s![..n, ..]).assign(x);
        let mut out_labels = labels.to_vec();
        out_labels.reserve(n_new);

        let mut rng = rand::rngs::StdRng::seed_from_u64(self.seed);
        let mut row = n;

        for (label, members, per_sample) in &plans {
            for (pos, &i) in members.iter().enumerate() {
                let n_samples = per_sample[pos];
                if n_samples == 0 {
                    continue;
                }
                let neighbours = nearest_neighbours(x, i, members, k);
                let base = x.row(i);
                for _ in 0..n_samples {
                    let j = neighbours[rng.gen_range(0..neighbours.len())];
                    let step: f64 = rng.gen();
                    let other = x.row(j);
                    let mut target = out.row_mut(row);
                    for ((t, &a), &b) in target.iter_mut().zip(base.iter()).zip(other.iter()) {
                        *t = a + step * (b - a);
                    }
                    out_labels.push(*label);
                    row += 1;
                }
            }
        }

        tracing::info!("ADASYN: {} -> {} サンプル", n, out.nrows());
        Ok((out, out_labels))
    }
}

/// 候補集合の中から `index` 自身を除いた k 近傍（距離, インデックス順で決定的）
fn nearest_neighbours(x: &Array2<f64>, index: usize, candidates: &[usize], k: usize) -> Vec<usize> {
    let origin = x.row(index);
    let mut distances: Vec<(f64, usize)> = candidates
        .iter()
        .copied()
        .filter(|&j| j != index)
        .map(|j| (squared_distance(origin, x.row(j)), j))
        .collect();
    distances.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    distances.truncate(k);
    distances.into_iter().map(|(_, j)| j).collect()
}

fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(p, q)| (p - q) * (p - q)).sum()
}

/// 重みに比例して `total` を整数配分する（端数は大きい順、同値は先頭優先）
fn largest_remainder(weights: &[f64], total: usize) -> Vec<usize> {
    let sum: f64 = weights.iter().sum();
    let quotas: Vec<f64> = weights.iter().map(|w| w / sum * total as f64).collect();
    let mut counts: Vec<usize> = quotas.iter().map(|q| q.floor() as usize).collect();

    let assigned: usize = counts.iter().sum();
    let mut order: Vec<usize> = (0..weights.len()).collect();
    order.sort_by(|&a, &b| {
        let fa = quotas[a] - quotas[a].floor();
        let fb = quotas[b] - quotas[b].floor();
        fb.total_cmp(&fa).then(a.cmp(&b))
    });
    for &i in order.iter().take(total.saturating_sub(assigned)) {
        counts[i] += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;

    /// 多数クラス 100 / 少数クラス 20 の重なりのある 2 次元データ
    fn imbalanced() -> (Array2<f64>, Vec<Label>) {
        let mut rng = StdRng::seed_from_u64(7);
        let mut data = Vec::new();
        let mut labels = Vec::new();
        for _ in 0..100 {
            data.push(rng.gen_range(0.0..1.0));
            data.push(rng.gen_range(0.0..1.0));
            labels.push(0);
        }
        for _ in 0..20 {
            data.push(rng.gen_range(0.6..1.2));
            data.push(rng.gen_range(0.6..1.2));
            labels.push(1);
        }
        (Array2::from_shape_vec((120, 2), data).unwrap(), labels)
    }

    #[test]
    fn test_classes_are_exactly_balanced() {
        let (x, y) = imbalanced();
        let (xr, yr) = AdasynConfig::default().fit_resample(&x, &y).unwrap();

        let counts = class_counts(&yr);
        assert_eq!(counts.get(&0), Some(&100));
        assert_eq!(counts.get(&1), Some(&100));
        assert_eq!(xr.nrows(), yr.len());
        assert!(xr.nrows() >= x.nrows());
        // 元サンプルは先頭にそのまま残る
        assert_eq!(xr.slice(s![..120, ..]), x);
    }

    #[test]
    fn test_synthetic_points_stay_within_minority_hull_box() {
        let (x, y) = imbalanced();
        let (xr, yr) = AdasynConfig::default().fit_resample(&x, &y).unwrap();
        for (row, label) in xr.rows().into_iter().zip(yr.iter()).skip(120) {
            assert_eq!(*label, 1);
            assert!(row.iter().all(|v| (0.6..=1.2).contains(v)));
        }
    }

    #[test]
    fn test_resampling_is_deterministic() {
        let (x, y) = imbalanced();
        let a = AdasynConfig::default().fit_resample(&x, &y).unwrap();
        let b = AdasynConfig::default().fit_resample(&x, &y).unwrap();
        assert_eq!(a.0, b.0);
        assert_eq!(a.1, b.1);
    }

    #[test]
    fn test_balanced_input_is_returned_unchanged() {
        let x = Array2::from_shape_fn((12, 2), |(i, j)| (i * 2 + j) as f64);
        let y: Vec<Label> = (0..12).map(|i| i % 2).collect();
        let (xr, yr) = AdasynConfig::default().fit_resample(&x, &y).unwrap();
        assert_eq!(xr, x);
        assert_eq!(yr, y);
    }

    #[test]
    fn test_too_few_minority_samples_is_a_configuration_error() {
        let x = Array2::from_shape_fn((24, 2), |(i, j)| (i + j) as f64);
        let y: Vec<Label> = (0..24).map(|i| if i < 20 { 0 } else { 1 }).collect();
        let err = AdasynConfig::default().validate(&y).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InsufficientSamples {
                label: 1,
                count: 4,
                required: 6
            }
        ));
        assert!(AdasynConfig::default().fit_resample(&x, &y).is_err());
    }

    #[test]
    fn test_isolated_minority_cluster_is_rejected() {
        let mut data = Vec::new();
        let mut labels = Vec::new();
        for i in 0..20 {
            data.extend_from_slice(&[i as f64 * 0.01, 0.0]);
            labels.push(0);
        }
        for i in 0..8 {
            data.extend_from_slice(&[1000.0 + i as f64 * 0.01, 1000.0]);
            labels.push(1);
        }
        let x = Array2::from_shape_vec((28, 2), data).unwrap();
        let err = AdasynConfig::default().fit_resample(&x, &labels).unwrap_err();
        assert!(matches!(err, PipelineError::NoNeighboursInOtherClasses { label: 1 }));
    }

    #[test]
    fn test_single_class_is_rejected() {
        assert!(AdasynConfig::default().validate(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_largest_remainder_distributes_exact_total() {
        let counts = largest_remainder(&[0.2, 0.2, 0.6], 7);
        assert_eq!(counts.iter().sum::<usize>(), 7);
        assert_eq!(counts, vec![2, 1, 4]);
    }
}
