//! 古典的パイプライン（タスクA）の構成要素
//!
//! HOG 特徴 → ADASYN → PCA → 多項式カーネル SVM → 評価

pub mod evaluation;
pub mod reducer;
pub mod resample;
pub mod svm;

pub use evaluation::{
    cross_val_score, ClassificationReport, ConfusionMatrix, CrossValidation, MetricReport,
};
pub use reducer::{FittedPca, PcaConfig};
pub use resample::AdasynConfig;
pub use svm::{FittedSvm, Gamma, SvmConfig};
