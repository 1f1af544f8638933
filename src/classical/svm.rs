//! 多項式カーネル SVM による二値分類
//!
//! - カーネル: k(x, y) = (γ·⟨x, y⟩ + coef0)^degree
//! - γ = "scale" のとき 1 / (n_features · Var(X))
//!
//! ソルバは linfa-svm の SMO。linfa の多項式カーネルは γ を持たないため、
//! 入力を √γ 倍してから渡すことで同じカーネル値を得る。

use linfa::prelude::*;
use linfa_svm::Svm;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result, Stage};
use crate::types::Label;

/// カーネル係数 γ の決め方
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gamma {
    /// 1 / (n_features · Var(X))
    Scale,
    Value(f64),
}

impl Gamma {
    fn resolve(&self, x: &Array2<f64>) -> Result<f64> {
        match *self {
            Gamma::Value(g) if g > 0.0 => Ok(g),
            Gamma::Value(g) => Err(PipelineError::invalid_config(
                Stage::Classification,
                format!("gamma must be positive, got {}", g),
            )),
            Gamma::Scale => {
                let n = x.len() as f64;
                let mean = x.sum() / n;
                let var = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
                if var > 0.0 {
                    Ok(1.0 / (x.ncols() as f64 * var))
                } else {
                    Ok(1.0)
                }
            }
        }
    }
}

/// 未学習の分類器設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SvmConfig {
    pub degree: u32,
    pub gamma: Gamma,
    /// カーネルの独立項
    pub coef0: f64,
    /// ソフトマージンの正則化係数
    pub c: f64,
    /// SMO の停止許容誤差
    pub tolerance: f64,
}

impl Default for SvmConfig {
    fn default() -> Self {
        Self {
            degree: 3,
            gamma: Gamma::Scale,
            coef0: 2.0,
            c: 1.0,
            tolerance: 1e-3,
        }
    }
}

impl SvmConfig {
    pub fn fit(&self, x: &Array2<f64>, labels: &[Label]) -> Result<FittedSvm> {
        if x.nrows() != labels.len() {
            return Err(PipelineError::invalid_input(
                Stage::Classification,
                format!("{} feature rows but {} labels", x.nrows(), labels.len()),
            ));
        }
        if self.degree == 0 || !(self.c > 0.0) || !(self.tolerance > 0.0) {
            return Err(PipelineError::invalid_config(
                Stage::Classification,
                "degree, C and tolerance must be positive",
            ));
        }

        let mut classes = labels.to_vec();
        classes.sort_unstable();
        classes.dedup();
        if classes.len() != 2 {
            return Err(PipelineError::invalid_input(
                Stage::Classification,
                format!("exactly two classes are required, found {:?}", classes),
            ));
        }
        let classes = [classes[0], classes[1]];

        let gamma = self.gamma.resolve(x)?;
        let scaled = x * gamma.sqrt();
        let targets: Array1<bool> = labels.iter().map(|&l| l == classes[1]).collect();
        let dataset = Dataset::new(scaled, targets);

        let model = Svm::<f64, bool>::params()
            .pos_neg_weights(self.c, self.c)
            .eps(self.tolerance)
            .polynomial_kernel(self.coef0, self.degree as f64)
            .fit(&dataset)
            .map_err(|e| PipelineError::model(Stage::Classification, e.to_string()))?;

        tracing::info!(
            "SVM: {} サンプル, {} 次元, gamma={:.6}, サポートベクタ {}",
            x.nrows(),
            x.ncols(),
            gamma,
            model.nsupport()
        );

        Ok(FittedSvm {
            model,
            gamma,
            degree: self.degree,
            coef0: self.coef0,
            n_features: x.ncols(),
            classes,
        })
    }
}

/// 学習済み分類器（サポートベクタと双対係数は linfa のモデルが保持）
#[derive(Clone, Serialize, Deserialize)]
pub struct FittedSvm {
    model: Svm<f64, bool>,
    gamma: f64,
    degree: u32,
    coef0: f64,
    n_features: usize,
    /// [負例ラベル, 正例ラベル]
    classes: [Label; 2],
}

impl std::fmt::Debug for FittedSvm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FittedSvm")
            .field("gamma", &self.gamma)
            .field("degree", &self.degree)
            .field("coef0", &self.coef0)
            .field("n_features", &self.n_features)
            .field("classes", &self.classes)
            .field("n_support", &self.model.nsupport())
            .finish()
    }
}

impl FittedSvm {
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    pub fn classes(&self) -> [Label; 2] {
        self.classes
    }

    pub fn n_support(&self) -> usize {
        self.model.nsupport()
    }

    /// 行ごとにラベルを返す。単一サンプルも 1 x d の行列で渡すこと
    pub fn predict(&self, x: &Array2<f64>) -> Result<Vec<Label>> {
        if x.ncols() != self.n_features {
            return Err(PipelineError::DimensionMismatch {
                stage: Stage::Classification,
                expected: self.n_features,
                actual: x.ncols(),
            });
        }
        if x.nrows() == 0 {
            return Ok(Vec::new());
        }

        let scaled = x * self.gamma.sqrt();
        let predicted: Array1<bool> = self.model.predict(&scaled);
        Ok(predicted
            .iter()
            .map(|&positive| if positive { self.classes[1] } else { self.classes[0] })
            .collect())
    }

    /// 1サンプル版（内部で 1 x d に整形してから [`FittedSvm::predict`] を呼ぶ）
    pub fn predict_one(&self, features: &Array1<f64>) -> Result<Label> {
        let row = features.view().insert_axis(Axis(0)).to_owned();
        self.predict(&row)?
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::model(Stage::Classification, "empty prediction"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    /// (-1,-1) と (1,1) 周辺の2クラス
    fn two_blobs(n_per_class: usize, seed: u64) -> (Array2<f64>, Vec<Label>) {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut data = Vec::new();
        let mut labels = Vec::new();
        for label in 0..2usize {
            let center = if label == 0 { -1.0 } else { 1.0 };
            for _ in 0..n_per_class {
                data.push(center + rng.gen_range(-0.4..0.4));
                data.push(center + rng.gen_range(-0.4..0.4));
                labels.push(label);
            }
        }
        (Array2::from_shape_vec((2 * n_per_class, 2), data).unwrap(), labels)
    }

    #[test]
    fn test_separable_blobs_are_classified() {
        let (x, y) = two_blobs(30, 1);
        let svm = SvmConfig::default().fit(&x, &y).unwrap();
        let predicted = svm.predict(&x).unwrap();
        assert_eq!(predicted, y);

        let (x_new, y_new) = two_blobs(10, 2);
        assert_eq!(svm.predict(&x_new).unwrap(), y_new);
    }

    #[test]
    fn test_scale_gamma_uses_feature_variance() {
        let x = Array2::from_shape_vec((2, 2), vec![0.0, 0.0, 2.0, 2.0]).unwrap();
        // 全要素の分散 = 1.0, 特徴数 = 2
        let gamma = Gamma::Scale.resolve(&x).unwrap();
        assert!((gamma - 0.5).abs() < 1e-12);

        let constant = Array2::from_elem((3, 4), 0.25);
        assert_eq!(Gamma::Scale.resolve(&constant).unwrap(), 1.0);
        assert!(Gamma::Value(-1.0).resolve(&constant).is_err());
    }

    #[test]
    fn test_labels_other_than_zero_one_are_mapped_back() {
        let (x, y) = two_blobs(15, 3);
        let relabeled: Vec<Label> = y.iter().map(|l| l * 5 + 2).collect();
        let svm = SvmConfig::default().fit(&x, &relabeled).unwrap();
        assert_eq!(svm.classes(), [2, 7]);
        assert_eq!(svm.predict(&x).unwrap(), relabeled);
    }

    #[test]
    fn test_single_row_prediction_matches_batch() {
        let (x, y) = two_blobs(20, 4);
        let svm = SvmConfig::default().fit(&x, &y).unwrap();
        let batch = svm.predict(&x).unwrap();
        for (i, row) in x.rows().into_iter().enumerate() {
            assert_eq!(svm.predict_one(&row.to_owned()).unwrap(), batch[i]);
        }
    }

    #[test]
    fn test_prediction_dimension_mismatch_is_fatal() {
        let (x, y) = two_blobs(10, 5);
        let svm = SvmConfig::default().fit(&x, &y).unwrap();
        let err = svm.predict(&Array2::zeros((1, 3))).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DimensionMismatch {
                stage: Stage::Classification,
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_single_class_training_is_rejected() {
        let x = Array2::zeros((4, 2));
        assert!(SvmConfig::default().fit(&x, &[1, 1, 1, 1]).is_err());
    }

    #[test]
    fn test_fit_is_deterministic() {
        let (x, y) = two_blobs(25, 6);
        let a = SvmConfig::default().fit(&x, &y).unwrap();
        let b = SvmConfig::default().fit(&x, &y).unwrap();
        let grid = Array2::from_shape_fn((11, 2), |(i, j)| -1.0 + 0.2 * i as f64 + 0.01 * j as f64);
        assert_eq!(a.predict(&grid).unwrap(), b.predict(&grid).unwrap());
        assert_eq!(a.n_support(), b.n_support());
    }
}
