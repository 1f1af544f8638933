//! パイプライン共通のエラー定義
//!
//! 次元不一致・リサンプリング設定不備・永続化状態の欠損などは
//! すべて致命的エラーとして呼び出し元へ即座に返します（リトライなし）。

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::Label;

/// エラーが発生したパイプライン段階
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FeatureExtraction,
    Resampling,
    Split,
    Reduction,
    Classification,
    Evaluation,
    Inference,
    Persistence,
    Network,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::FeatureExtraction => "feature extraction",
            Stage::Resampling => "resampling",
            Stage::Split => "split",
            Stage::Reduction => "dimensionality reduction",
            Stage::Classification => "classification",
            Stage::Evaluation => "evaluation",
            Stage::Inference => "inference",
            Stage::Persistence => "persistence",
            Stage::Network => "network",
        };
        write!(f, "{}", name)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("[{stage}] dimension mismatch: expected {expected} features, got {actual}")]
    DimensionMismatch {
        stage: Stage,
        expected: usize,
        actual: usize,
    },

    #[error("[resampling] class {label} has {count} samples, at least {required} are required")]
    InsufficientSamples {
        label: Label,
        count: usize,
        required: usize,
    },

    #[error("[resampling] no neighbours of class {label} belong to another class")]
    NoNeighboursInOtherClasses { label: Label },

    #[error("[{stage}] invalid configuration: {message}")]
    InvalidConfig { stage: Stage, message: String },

    #[error("[{stage}] invalid input: {message}")]
    InvalidInput { stage: Stage, message: String },

    #[error("[inference] requested range {min}..{max} is outside the dataset (len {len})")]
    RangeOutOfBounds { min: usize, max: usize, len: usize },

    #[error("[persistence] artifact not found: {path}")]
    ArtifactMissing { path: PathBuf },

    #[error("[persistence] artifact {path} is corrupt: {reason}")]
    ArtifactCorrupt { path: PathBuf, reason: String },

    #[error("[persistence] artifact kind mismatch: expected {expected}, found {found}")]
    ArtifactKind { expected: String, found: String },

    #[error("[{stage}] model error: {message}")]
    Model { stage: Stage, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl PipelineError {
    pub fn invalid_config<S: Into<String>>(stage: Stage, message: S) -> Self {
        PipelineError::InvalidConfig {
            stage,
            message: message.into(),
        }
    }

    pub fn invalid_input<S: Into<String>>(stage: Stage, message: S) -> Self {
        PipelineError::InvalidInput {
            stage,
            message: message.into(),
        }
    }

    pub fn model<S: Into<String>>(stage: Stage, message: S) -> Self {
        PipelineError::Model {
            stage,
            message: message.into(),
        }
    }

    /// エラーが属する段階（特定できる場合）
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::DimensionMismatch { stage, .. }
            | PipelineError::InvalidConfig { stage, .. }
            | PipelineError::InvalidInput { stage, .. }
            | PipelineError::Model { stage, .. } => Some(*stage),
            PipelineError::InsufficientSamples { .. }
            | PipelineError::NoNeighboursInOtherClasses { .. } => Some(Stage::Resampling),
            PipelineError::RangeOutOfBounds { .. } => Some(Stage::Inference),
            PipelineError::ArtifactMissing { .. }
            | PipelineError::ArtifactCorrupt { .. }
            | PipelineError::ArtifactKind { .. } => Some(Stage::Persistence),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
