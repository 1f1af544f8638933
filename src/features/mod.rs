//! 特徴量抽出
//!
//! 学習時と推論時で同じ [`FeaturePipeline`] を通すことで、リサイズ先・HOG パラメータ・
//! 輝度スケールのずれを防ぎます。

pub mod hog;

use image::DynamicImage;
use ndarray::{Array2, ArrayViewMut2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result, Stage};

pub use hog::{HogConfig, HogExtractor};

/// 全サンプル共通の定数で割って [0, 1] に収める線形スケーラ
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntensityScaler {
    /// 想定される最大輝度
    pub scale: f64,
}

impl Default for IntensityScaler {
    fn default() -> Self {
        Self { scale: 255.0 }
    }
}

impl IntensityScaler {
    pub fn new(scale: f64) -> Result<Self> {
        if !(scale > 0.0) {
            return Err(PipelineError::invalid_config(
                Stage::FeatureExtraction,
                format!("intensity scale must be positive, got {}", scale),
            ));
        }
        Ok(Self { scale })
    }

    /// バッチ全体に同じ係数を適用する（サンプル単位の正規化はしない）
    pub fn apply(&self, mut features: ArrayViewMut2<'_, f64>) {
        features.mapv_inplace(|v| v / self.scale);
    }
}

/// HOG 抽出 + 輝度スケーリング
#[derive(Debug, Clone)]
pub struct FeaturePipeline {
    extractor: HogExtractor,
    scaler: IntensityScaler,
}

impl FeaturePipeline {
    pub fn new(hog: HogConfig, scaler: IntensityScaler) -> Result<Self> {
        Ok(Self {
            extractor: HogExtractor::new(hog)?,
            scaler: IntensityScaler::new(scaler.scale)?,
        })
    }

    pub fn feature_len(&self) -> usize {
        self.extractor.feature_len()
    }

    pub fn hog_config(&self) -> &HogConfig {
        self.extractor.config()
    }

    pub fn scaler(&self) -> IntensityScaler {
        self.scaler
    }

    /// 画像1枚を 1 x d の行列に変換する
    pub fn transform_one(&self, image: &DynamicImage) -> Array2<f64> {
        let mut row = self.extractor.extract(image).insert_axis(Axis(0));
        self.scaler.apply(row.view_mut());
        row
    }

    /// 画像群を n x d の行列に変換する
    ///
    /// 画像ごとの抽出は並列に行い、行の順序は入力順を保つ。
    pub fn transform_batch(&self, images: &[DynamicImage]) -> Array2<f64> {
        let dim = self.feature_len();
        let rows: Vec<_> = images
            .par_iter()
            .map(|image| self.extractor.extract(image))
            .collect();

        let mut matrix = Array2::<f64>::zeros((rows.len(), dim));
        for (mut dst, row) in matrix.axis_iter_mut(Axis(0)).zip(rows.iter()) {
            dst.assign(row);
        }
        self.scaler.apply(matrix.view_mut());

        tracing::debug!("特徴量抽出: {} 枚 -> {}x{}", images.len(), matrix.nrows(), matrix.ncols());
        matrix
    }
}
