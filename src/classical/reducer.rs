//! 主成分分析（PCA）による次元削減
//!
//! [`PcaConfig`]（未学習）を `fit` すると [`FittedPca`]（学習済み）になり、
//! `transform` は学習済み側にしか存在しません。推論時は必ず学習時の状態を読み込んで使うこと。

use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result, Stage};

/// 固有値をゼロとみなす相対閾値
const RANK_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcaConfig {
    /// 残す主成分数 K
    pub n_components: usize,
}

impl Default for PcaConfig {
    fn default() -> Self {
        Self { n_components: 100 }
    }
}

impl PcaConfig {
    pub fn new(n_components: usize) -> Self {
        Self { n_components }
    }

    /// 学習データを中心化し、分散最大の K 軸を求める
    pub fn fit(&self, x: &Array2<f64>) -> Result<FittedPca> {
        let (n, d) = x.dim();
        if n < 2 {
            return Err(PipelineError::invalid_input(
                Stage::Reduction,
                format!("at least two samples are required, got {}", n),
            ));
        }
        let k = self.n_components;
        if k == 0 || k > n.min(d) {
            return Err(PipelineError::invalid_config(
                Stage::Reduction,
                format!(
                    "n_components={} must be between 1 and min(n_samples={}, n_features={})",
                    k, n, d
                ),
            ));
        }

        let mean = x
            .mean_axis(Axis(0))
            .ok_or_else(|| PipelineError::invalid_input(Stage::Reduction, "empty feature matrix"))?;
        let centered = x - &mean;
        let total_ss: f64 = centered.iter().map(|v| v * v).sum();

        // 小さい方の対称行列を固有分解する
        let use_gram = n < d;
        let (eigenvalues, eigenvectors) = if use_gram {
            symmetric_eigen(&centered.dot(&centered.t()))
        } else {
            symmetric_eigen(&centered.t().dot(&centered))
        };

        let mut order: Vec<usize> = (0..eigenvalues.len()).collect();
        order.sort_by(|&a, &b| eigenvalues[b].total_cmp(&eigenvalues[a]).then(a.cmp(&b)));

        let top = eigenvalues[order[0]].max(f64::MIN_POSITIVE);
        let mut components = Array2::<f64>::zeros((k, d));
        let mut degenerate = Vec::new();
        let mut variances = Vec::with_capacity(k);

        for (slot, &idx) in order.iter().take(k).enumerate() {
            let lambda = eigenvalues[idx].max(0.0);
            variances.push(lambda / (n - 1) as f64);

            if lambda <= RANK_TOLERANCE * top {
                degenerate.push(slot);
                continue;
            }

            let axis = if use_gram {
                let u = eigenvectors.column(idx);
                centered.t().dot(&u) / lambda.sqrt()
            } else {
                eigenvectors.column(idx).to_owned()
            };
            components.row_mut(slot).assign(&axis);
        }

        if !degenerate.is_empty() {
            tracing::warn!(
                "PCA: {} 個の成分の分散がほぼ 0 です。直交補完で埋めます",
                degenerate.len()
            );
            complete_orthonormal(&mut components, &degenerate);
        }

        for mut row in components.rows_mut() {
            let pivot = row
                .iter()
                .copied()
                .fold(0.0_f64, |acc, v| if v.abs() > acc.abs() { v } else { acc });
            if pivot < 0.0 {
                row.mapv_inplace(|v| -v);
            }
        }

        let explained_variance = Array1::from_vec(variances);
        let total_variance = total_ss / (n - 1) as f64;
        let explained_variance_ratio = if total_variance > 0.0 {
            &explained_variance / total_variance
        } else {
            Array1::zeros(k)
        };

        tracing::info!(
            "PCA: {}x{} -> {} 成分 (累積寄与率 {:.4})",
            n,
            d,
            k,
            explained_variance_ratio.sum()
        );

        Ok(FittedPca {
            mean,
            components,
            explained_variance,
            explained_variance_ratio,
            n_samples_seen: n,
        })
    }
}

/// 学習済み PCA の状態（読み取り専用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedPca {
    mean: Array1<f64>,
    /// K x d、各行が単位長の主軸
    components: Array2<f64>,
    explained_variance: Array1<f64>,
    explained_variance_ratio: Array1<f64>,
    n_samples_seen: usize,
}

impl FittedPca {
    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn n_components(&self) -> usize {
        self.components.nrows()
    }

    pub fn n_samples_seen(&self) -> usize {
        self.n_samples_seen
    }

    pub fn components(&self) -> &Array2<f64> {
        &self.components
    }

    pub fn explained_variance(&self) -> &Array1<f64> {
        &self.explained_variance
    }

    pub fn explained_variance_ratio(&self) -> &Array1<f64> {
        &self.explained_variance_ratio
    }

    /// 学習時と同じ中心化・主軸で射影する
    pub fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.n_features() {
            return Err(PipelineError::DimensionMismatch {
                stage: Stage::Reduction,
                expected: self.n_features(),
                actual: x.ncols(),
            });
        }
        Ok((x - &self.mean).dot(&self.components.t()))
    }

    /// 射影を元の特徴空間へ戻す
    pub fn inverse_transform(&self, z: &Array2<f64>) -> Result<Array2<f64>> {
        if z.ncols() != self.n_components() {
            return Err(PipelineError::DimensionMismatch {
                stage: Stage::Reduction,
                expected: self.n_components(),
                actual: z.ncols(),
            });
        }
        Ok(z.dot(&self.components) + &self.mean)
    }
}

/// 退化した行を既存の主軸と直交する単位ベクトルで埋める
///
/// [既存の主軸 | 標準基底] を QR 分解し、Q の後半の列を使う。
fn complete_orthonormal(components: &mut Array2<f64>, slots: &[usize]) {
    let (k, d) = components.dim();
    let filled: Vec<usize> = (0..k).filter(|i| !slots.contains(i)).collect();
    let cols = filled.len() + slots.len();

    let basis = DMatrix::<f64>::from_fn(d, cols, |row, col| match filled.get(col) {
        Some(&axis) => components[[axis, row]],
        None => {
            if row == col - filled.len() {
                1.0
            } else {
                0.0
            }
        }
    });
    let q = basis.qr().q();

    for (offset, &slot) in slots.iter().enumerate() {
        let column = q.column(filled.len() + offset);
        for (j, value) in column.iter().enumerate() {
            components[[slot, j]] = *value;
        }
    }
}

/// 対称行列の固有分解
///
/// 戻り値は (固有値, 固有ベクトルを列に持つ行列)。
fn symmetric_eigen(a: &Array2<f64>) -> (Vec<f64>, Array2<f64>) {
    let n = a.nrows();
    let matrix = DMatrix::<f64>::from_fn(n, n, |i, j| a[[i, j]]);
    let eigen = SymmetricEigen::new(matrix);

    let eigenvalues = eigen.eigenvalues.iter().copied().collect();
    let eigenvectors = Array2::from_shape_fn((n, n), |(i, j)| eigen.eigenvectors[(i, j)]);
    (eigenvalues, eigenvectors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn random_matrix(n: usize, d: usize, seed: u64) -> Array2<f64> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((n, d), |(_, j)| rng.gen_range(-1.0..1.0) * (j + 1) as f64)
    }

    fn reconstruction_error(pca: &FittedPca, x: &Array2<f64>) -> f64 {
        let z = pca.transform(x).unwrap();
        let back = pca.inverse_transform(&z).unwrap();
        (&back - x).iter().map(|v| v * v).sum()
    }

    fn assert_orthonormal(components: &Array2<f64>) {
        let gram = components.dot(&components.t());
        for i in 0..gram.nrows() {
            for j in 0..gram.ncols() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((gram[[i, j]] - expected).abs() < 1e-8, "gram[{i},{j}] = {}", gram[[i, j]]);
            }
        }
    }

    #[test]
    fn test_symmetric_eigen_recovers_known_eigenvalues() {
        let a = Array2::from_shape_vec((2, 2), vec![2.0, 1.0, 1.0, 2.0]).unwrap();
        let (mut values, vectors) = symmetric_eigen(&a);
        // A v = λ v
        for (i, &lambda) in values.iter().enumerate() {
            let v = vectors.column(i);
            let av = a.dot(&v);
            for j in 0..2 {
                assert!((av[j] - lambda * v[j]).abs() < 1e-12);
            }
        }
        values.sort_by(|a, b| a.total_cmp(b));
        assert!((values[0] - 1.0).abs() < 1e-12);
        assert!((values[1] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_reconstruction_error_non_increasing_in_k() {
        let x = random_matrix(30, 10, 1);
        let mut previous = f64::INFINITY;
        for k in 1..=10 {
            let pca = PcaConfig::new(k).fit(&x).unwrap();
            let err = reconstruction_error(&pca, &x);
            assert!(err <= previous + 1e-9, "k={k}: {err} > {previous}");
            previous = err;
        }
        assert!(previous < 1e-9);
    }

    #[test]
    fn test_wide_matrix_uses_orthonormal_axes() {
        let x = random_matrix(8, 20, 2);
        let pca = PcaConfig::new(5).fit(&x).unwrap();
        assert_eq!(pca.components().dim(), (5, 20));
        assert_orthonormal(pca.components());

        let ratios = pca.explained_variance_ratio();
        for w in ratios.as_slice().unwrap().windows(2) {
            assert!(w[0] + 1e-12 >= w[1]);
        }
    }

    #[test]
    fn test_rank_deficient_components_are_completed() {
        // 5 サンプルを中心化すると階数は高々 4
        let x = random_matrix(5, 12, 3);
        let pca = PcaConfig::new(5).fit(&x).unwrap();
        assert_orthonormal(pca.components());
        assert!(pca.explained_variance()[4].abs() < 1e-9);
    }

    #[test]
    fn test_both_decomposition_paths_are_orthonormal() {
        // 共分散行列経路 (n >= d) とグラム行列経路 (n < d)
        let x = random_matrix(6, 6, 4);
        let tall = PcaConfig::new(3).fit(&x).unwrap();
        let wide = PcaConfig::new(3).fit(&x.slice(ndarray::s![..5, ..]).to_owned()).unwrap();
        assert_eq!(tall.n_samples_seen(), 6);
        assert_eq!(wide.n_samples_seen(), 5);
        assert_orthonormal(tall.components());
        assert_orthonormal(wide.components());
    }

    #[test]
    fn test_wide_feature_matrix_keeps_requested_components() {
        // 学習データは特徴量次元よりずっと少ない (HOG 後の典型)
        let x = random_matrix(120, 1500, 9);
        let pca = PcaConfig::new(100).fit(&x).unwrap();
        assert_eq!(pca.components().dim(), (100, 1500));
        assert_orthonormal(pca.components());
        assert!(pca.explained_variance_ratio().sum() <= 1.0 + 1e-9);
    }

    #[test]
    fn test_transform_rejects_dimension_mismatch() {
        let pca = PcaConfig::new(2).fit(&random_matrix(10, 4, 5)).unwrap();
        let err = pca.transform(&Array2::zeros((1, 5))).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DimensionMismatch {
                stage: Stage::Reduction,
                expected: 4,
                actual: 5
            }
        ));
    }

    #[test]
    fn test_too_many_components_is_rejected() {
        assert!(PcaConfig::new(11).fit(&random_matrix(10, 20, 6)).is_err());
        assert!(PcaConfig::new(0).fit(&random_matrix(10, 20, 6)).is_err());
    }

    #[test]
    fn test_unseen_data_uses_fitted_axes() {
        let train = random_matrix(20, 6, 7);
        let pca = PcaConfig::new(3).fit(&train).unwrap();
        let unseen = random_matrix(4, 6, 8);
        let a = pca.transform(&unseen).unwrap();
        let b = pca.transform(&unseen).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.dim(), (4, 3));
    }
}
