//! 学習・推論の駆動部
//!
//! 学習コンテキストと推論コンテキストはそれぞれ自分の状態を所有し、グローバル状態は持たない。
//! 推論は永続化された学習済み状態だけを使う。

pub mod binary;
pub mod multiclass;

use image::DynamicImage;

use crate::dataset::ImageDataset;
use crate::error::{PipelineError, Result};
use crate::types::Label;

pub use binary::{BinaryInference, BinaryTraining, BinaryTrainingOutcome};
pub use multiclass::{argmax, ArgmaxPredictor, MultiClassModel, MultiClassTrainer};

/// 画像1枚からラベルを予測するもの
pub trait Predictor {
    fn predict_image(&self, image: &DynamicImage) -> Result<Label>;
}

/// 範囲推論の集計
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RangeScore {
    pub processed: usize,
    pub correct: usize,
}

impl RangeScore {
    /// 正解率（%）。1件も処理していなければ None
    pub fn accuracy_percent(&self) -> Option<f64> {
        if self.processed == 0 {
            None
        } else {
            Some(self.correct as f64 / self.processed as f64 * 100.0)
        }
    }
}

impl std::fmt::Display for RangeScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.accuracy_percent() {
            Some(acc) => write!(f, "{} / {} correct ({:.2}%)", self.correct, self.processed, acc),
            None => write!(f, "0 samples processed"),
        }
    }
}

/// `dataset[min..max]` を1枚ずつ推論して正解数を数える
///
/// 範囲は推論を始める前に検査する（`min <= max <= len`）。
pub fn score_range<P: Predictor + ?Sized>(
    predictor: &P,
    dataset: &ImageDataset,
    min: usize,
    max: usize,
) -> Result<RangeScore> {
    if min > max || max > dataset.len() {
        return Err(PipelineError::RangeOutOfBounds {
            min,
            max,
            len: dataset.len(),
        });
    }

    let mut score = RangeScore::default();
    for index in min..max {
        let (image, truth) = dataset.get(index).ok_or(PipelineError::RangeOutOfBounds {
            min,
            max,
            len: dataset.len(),
        })?;
        let predicted = predictor.predict_image(image)?;
        tracing::debug!("[{}] 予測 {} / 正解 {}", index, predicted, truth);
        score.processed += 1;
        if predicted == truth {
            score.correct += 1;
        }
    }

    tracing::info!("範囲 {}..{}: {}", min, max, score);
    Ok(score)
}
