//! 多クラス分類（タスクB）の協調インターフェース
//!
//! ネットワークの中身はこのトレイトの向こう側にあり、パイプライン側は
//! 「学習して検証精度を返す」「画像ごとのクラス確率を返す」だけを前提にする。

use image::DynamicImage;

use crate::classical::MetricReport;
use crate::dataset::ImageDataset;
use crate::error::{PipelineError, Result, Stage};
use crate::pipeline::Predictor;
use crate::types::Label;

/// 学習済み多クラス分類器
pub trait MultiClassModel {
    fn num_classes(&self) -> usize;

    /// 長さ `num_classes()` の確率分布
    fn class_probabilities(&self, image: &DynamicImage) -> Result<Vec<f32>>;

    /// 確率最大のクラス
    fn predict(&self, image: &DynamicImage) -> Result<Label> {
        let probabilities = self.class_probabilities(image)?;
        if probabilities.len() != self.num_classes() {
            return Err(PipelineError::DimensionMismatch {
                stage: Stage::Network,
                expected: self.num_classes(),
                actual: probabilities.len(),
            });
        }
        argmax(&probabilities).ok_or_else(|| PipelineError::model(Stage::Network, "empty probability vector"))
    }
}

/// 多クラス分類器の学習器
pub trait MultiClassTrainer {
    type Model: MultiClassModel;

    /// 学習済みモデルと検証データでの正解率を返す
    fn train(&self, images: &[DynamicImage], labels: &[Label]) -> Result<(Self::Model, f64)>;
}

/// 最大値のインデックス（同値は先頭、NaN は無視）
pub fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

/// 任意の [`MultiClassModel`] を範囲推論で使えるようにする
pub struct ArgmaxPredictor<M> {
    model: M,
}

impl<M: MultiClassModel> ArgmaxPredictor<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

impl<M: MultiClassModel> Predictor for ArgmaxPredictor<M> {
    fn predict_image(&self, image: &DynamicImage) -> Result<Label> {
        self.model.predict(image)
    }
}

/// データセット全体を推論して分類レポートと混同行列を作る
pub fn evaluate<M: MultiClassModel + ?Sized>(model: &M, dataset: &ImageDataset) -> Result<MetricReport> {
    let predicted = dataset
        .images()
        .iter()
        .map(|image| model.predict(image))
        .collect::<Result<Vec<Label>>>()?;
    MetricReport::new(dataset.labels(), &predicted, None)
}
