//! 永続化アーティファクトのメタデータ
//!
//! tar.gz 形式で保存される情報：
//! - metadata.json: このメタデータ（JSON形式）
//! - model.bin: 学習済み状態（バイナリ）

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::features::HogConfig;

/// アーティファクトの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// 学習済み PCA（+ 特徴量抽出設定）
    Reducer,
    /// 学習済み SVM
    Classifier,
    /// 学習済み CNN の重み
    Network,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::Reducer => write!(f, "reducer"),
            ArtifactKind::Classifier => write!(f, "classifier"),
            ArtifactKind::Network => write!(f, "network"),
        }
    }
}

/// アーティファクトメタデータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub kind: ArtifactKind,

    /// 入力次元（PCA/SVM は特徴量数、CNN は 3 * 画像サイズ^2）
    pub input_dim: usize,

    /// 出力次元（PCA は主成分数、分類器はクラス数）
    pub output_dim: usize,

    /// クラス名（ラベル順）
    #[serde(default)]
    pub class_labels: Vec<String>,

    /// 学習時の入力画像サイズ（正方形の一辺）
    pub image_size: u32,

    /// HOG 設定（reducer のみ）。推論時の特徴量抽出はこれを使う
    #[serde(default)]
    pub hog: Option<HogConfig>,

    /// 輝度スケール（reducer のみ）
    #[serde(default)]
    pub intensity_scale: Option<f64>,

    /// 学習エポック数（network のみ）
    #[serde(default)]
    pub num_epochs: Option<usize>,

    /// 保存したクレートのバージョン
    pub crate_version: String,

    /// 学習時刻（RFC 3339）
    pub trained_at: String,
}

impl ArtifactMetadata {
    /// 新しいメタデータを作成（時刻とバージョンは自動設定）
    pub fn new(
        kind: ArtifactKind,
        input_dim: usize,
        output_dim: usize,
        class_labels: Vec<String>,
        image_size: u32,
    ) -> Self {
        Self {
            kind,
            input_dim,
            output_dim,
            class_labels,
            image_size,
            hog: None,
            intensity_scale: None,
            num_epochs: None,
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn with_features(mut self, hog: HogConfig, intensity_scale: f64) -> Self {
        self.hog = Some(hog);
        self.intensity_scale = Some(intensity_scale);
        self
    }

    pub fn with_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = Some(num_epochs);
        self
    }

    /// 期待した種類でなければエラー
    pub fn expect_kind(&self, expected: ArtifactKind) -> Result<()> {
        if self.kind != expected {
            return Err(PipelineError::ArtifactKind {
                expected: expected.to_string(),
                found: self.kind.to_string(),
            });
        }
        Ok(())
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
