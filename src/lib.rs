//! 医用画像分類パイプライン
//!
//! - 乳腺画像の二値分類: HOG 特徴 → ADASYN → PCA → 多項式カーネル SVM
//! - 血球画像の8クラス分類: burn による CNN（`ml` フィーチャ）

pub mod classical;
pub mod dataset;
pub mod error;
pub mod features;
pub mod model;
pub mod pipeline;
pub mod types;

#[cfg(feature = "ml")]
pub mod ml;

pub use error::{PipelineError, Result, Stage};
pub use types::{Label, Task};
