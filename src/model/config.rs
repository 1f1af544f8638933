//! アプリケーション設定管理モジュール
//!
//! 計算デバイス・各段階のハイパーパラメータ・アーティファクトの保存先をJSON形式で
//! 保存・読み込みします。すべての項目は省略可能で、省略時は既定値を使います。

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::classical::{AdasynConfig, PcaConfig, SvmConfig};
use crate::features::{HogConfig, IntensityScaler};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// 特徴量抽出設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSettings {
    pub hog: HogConfig,
    /// HOG 出力を割る定数
    pub intensity_scale: f64,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            hog: HogConfig::default(),
            intensity_scale: IntensityScaler::default().scale,
        }
    }
}

/// 二値分類（HOG + PCA + SVM）の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinarySettings {
    pub adasyn: AdasynConfig,
    pub pca: PcaConfig,
    pub svm: SvmConfig,
    /// 評価用データの割合
    pub test_ratio: f64,
    /// 交差検証の分割数
    pub cv_folds: usize,
    /// 分割用シード
    pub seed: u64,
}

impl Default for BinarySettings {
    fn default() -> Self {
        Self {
            adasyn: AdasynConfig::default(),
            pca: PcaConfig::default(),
            svm: SvmConfig::default(),
            test_ratio: 0.2,
            cv_folds: 5,
            seed: 42,
        }
    }
}

/// CNN トレーニング設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// 検証データの割合（層化分割）
    pub test_ratio: f64,
    /// 検証損失が改善しないまま許容するエポック数（0 で早期終了なし）
    pub patience: usize,
    /// 検証損失が停滞したときに学習率へ掛ける係数
    pub lr_factor: f64,
    /// 学習率を縮小するまでに待つエポック数
    pub lr_patience: usize,
    /// 学習率の下限
    pub min_learning_rate: f64,
    /// ネットワーク入力サイズ（正方形の一辺）
    pub image_size: u32,
    /// 分類クラス数
    pub num_classes: usize,
    /// ドロップアウト率
    pub dropout: f64,
    /// 学習時のデータ拡張
    pub augment: bool,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 5,
            batch_size: 32,
            num_workers: 1,
            learning_rate: 1e-3,
            seed: 42,
            test_ratio: 0.3,
            patience: 3,
            lr_factor: 0.2,
            lr_patience: 2,
            min_learning_rate: 1e-5,
            image_size: 224,
            num_classes: 8,
            dropout: 0.5,
            augment: true,
        }
    }
}

/// アーティファクトの保存先
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactPaths {
    pub reducer: PathBuf,
    pub classifier: PathBuf,
    pub network: PathBuf,
}

impl Default for ArtifactPaths {
    fn default() -> Self {
        Self {
            reducer: PathBuf::from("models/breast_pca.tar.gz"),
            classifier: PathBuf::from("models/breast_svm.tar.gz"),
            network: PathBuf::from("models/blood_cnn.tar.gz"),
        }
    }
}

/// データセットのルートディレクトリ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetPaths {
    pub binary_root: PathBuf,
    pub multiclass_root: PathBuf,
}

impl Default for DatasetPaths {
    fn default() -> Self {
        Self {
            binary_root: PathBuf::from("data/breastmnist"),
            multiclass_root: PathBuf::from("data/bloodmnist"),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    pub features: FeatureSettings,
    pub binary: BinarySettings,
    pub training: TrainingSettings,
    pub artifacts: ArtifactPaths,
    pub datasets: DatasetPaths,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("medscan.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パス（省略時はデフォルトパス）から読み込む。存在しない場合はデフォルト設定を返す
    ///
    /// 明示的に指定したファイルが読めない場合はエラーにする。
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let config = Self::load(path)?;
                tracing::info!("設定ファイルを読み込みました: {}", path.display());
                Ok(config)
            }
            None => {
                let path = Self::default_path();
                if !path.exists() {
                    tracing::debug!("設定ファイルが存在しません。デフォルト設定を使用します");
                    return Ok(Self::default());
                }
                match Self::load(&path) {
                    Ok(config) => {
                        tracing::info!("設定ファイルを読み込みました: {}", path.display());
                        Ok(config)
                    }
                    Err(e) => {
                        tracing::warn!(
                            "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                            path.display(),
                            e
                        );
                        Ok(Self::default())
                    }
                }
            }
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("\n--- 特徴量 ---");
        println!(
            "HOG: {}px, {} bins, {}px セル, {}x{} ブロック",
            self.features.hog.image_size,
            self.features.hog.orientations,
            self.features.hog.pixels_per_cell,
            self.features.hog.cells_per_block,
            self.features.hog.cells_per_block
        );
        println!("輝度スケール: {}", self.features.intensity_scale);
        println!("\n--- 二値分類 ---");
        println!("ADASYN 近傍数: {}", self.binary.adasyn.n_neighbors);
        println!("PCA 主成分数: {}", self.binary.pca.n_components);
        println!(
            "SVM: degree={}, gamma={:?}, coef0={}, C={}",
            self.binary.svm.degree, self.binary.svm.gamma, self.binary.svm.coef0, self.binary.svm.c
        );
        println!("評価データ割合: {}", self.binary.test_ratio);
        println!("交差検証: {}-fold", self.binary.cv_folds);
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!(
            "学習率縮小: x{} ({} エポック停滞, 下限 {})",
            self.training.lr_factor, self.training.lr_patience, self.training.min_learning_rate
        );
        println!("早期終了: {} エポック", self.training.patience);
        println!("シード: {}", self.training.seed);
        println!("入力サイズ: {}x{}", self.training.image_size, self.training.image_size);
        println!("分類クラス数: {}", self.training.num_classes);
        println!("\n--- 保存先 ---");
        println!("PCA: {}", self.artifacts.reducer.display());
        println!("SVM: {}", self.artifacts.classifier.display());
        println!("CNN: {}", self.artifacts.network.display());
        println!("========================\n");
    }
}
