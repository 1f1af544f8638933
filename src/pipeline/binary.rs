//! 二値分類パイプライン（HOG → スケーリング → ADASYN → 分割 → PCA → SVM）

use std::path::Path;

use image::DynamicImage;
use ndarray::Axis;
use serde::de::DeserializeOwned;

use crate::classical::{cross_val_score, FittedPca, FittedSvm, MetricReport};
use crate::dataset::{train_test_split, ImageDataset};
use crate::error::{PipelineError, Result, Stage};
use crate::features::{FeaturePipeline, IntensityScaler};
use crate::model::{load_artifact, save_artifact, ArtifactKind, ArtifactMetadata, ArtifactPaths, BinarySettings, FeatureSettings};
use crate::pipeline::Predictor;
use crate::types::{Label, Task};

/// 学習コンテキスト: 生データと設定を所有する
pub struct BinaryTraining {
    dataset: ImageDataset,
    features: FeatureSettings,
    settings: BinarySettings,
}

/// 学習結果: 学習済み状態と評価
pub struct BinaryTrainingOutcome {
    pub pipeline: FeaturePipeline,
    pub pca: FittedPca,
    pub svm: FittedSvm,
    pub report: MetricReport,
}

impl BinaryTraining {
    pub fn new(dataset: ImageDataset, features: FeatureSettings, settings: BinarySettings) -> Self {
        Self {
            dataset,
            features,
            settings,
        }
    }

    pub fn run(&self) -> Result<BinaryTrainingOutcome> {
        let settings = &self.settings;

        // 特徴量抽出より前に設定不備を検出する
        settings.adasyn.validate(self.dataset.labels())?;
        let pipeline = FeaturePipeline::new(
            self.features.hog.clone(),
            IntensityScaler::new(self.features.intensity_scale)?,
        )?;

        tracing::info!("特徴量抽出: {} 枚", self.dataset.len());
        let x = pipeline.transform_batch(self.dataset.images());

        let (x, y) = settings.adasyn.fit_resample(&x, self.dataset.labels())?;

        let split = train_test_split(y.len(), settings.test_ratio, settings.seed)?;
        let x_train = x.select(Axis(0), &split.train);
        let x_test = x.select(Axis(0), &split.test);
        let y_train: Vec<Label> = split.train.iter().map(|&i| y[i]).collect();
        let y_test: Vec<Label> = split.test.iter().map(|&i| y[i]).collect();
        tracing::info!("分割: 学習 {} / 評価 {}", y_train.len(), y_test.len());

        let pca = settings.pca.fit(&x_train)?;
        let z_train = pca.transform(&x_train)?;
        let z_test = pca.transform(&x_test)?;
        tracing::info!(
            "PCA: {} -> {} 次元 (累積寄与率 {:.4})",
            pca.n_features(),
            pca.n_components(),
            pca.explained_variance_ratio().sum()
        );

        let svm = settings.svm.fit(&z_train, &y_train)?;
        let y_pred = svm.predict(&z_test)?;

        let cross_validation = if settings.cv_folds > 1 {
            let cv = cross_val_score(&settings.svm, &z_train, &y_train, settings.cv_folds)?;
            tracing::info!("交差検証: {}", cv);
            Some(cv)
        } else {
            None
        };

        let report = MetricReport::new(&y_test, &y_pred, cross_validation)?;
        tracing::info!("評価データ正解率: {:.4}", report.report.accuracy);

        Ok(BinaryTrainingOutcome {
            pipeline,
            pca,
            svm,
            report,
        })
    }
}

fn class_labels() -> Vec<String> {
    Task::Binary.class_names().iter().map(|s| s.to_string()).collect()
}

impl BinaryTrainingOutcome {
    /// PCA と SVM をそれぞれアーティファクトとして保存する
    pub fn save(&self, paths: &ArtifactPaths) -> Result<()> {
        let hog = self.pipeline.hog_config().clone();
        let image_size = hog.image_size;

        let reducer_meta = ArtifactMetadata::new(
            ArtifactKind::Reducer,
            self.pca.n_features(),
            self.pca.n_components(),
            class_labels(),
            image_size,
        )
        .with_features(hog, self.pipeline.scaler().scale);
        save_artifact(&paths.reducer, &reducer_meta, &bincode::serialize(&self.pca)?)?;

        let classifier_meta = ArtifactMetadata::new(
            ArtifactKind::Classifier,
            self.svm.n_features(),
            self.svm.classes().len(),
            class_labels(),
            image_size,
        );
        save_artifact(&paths.classifier, &classifier_meta, &bincode::serialize(&self.svm)?)?;
        Ok(())
    }

    pub fn into_inference(self) -> Result<BinaryInference> {
        BinaryInference::from_parts(self.pipeline, self.pca, self.svm)
    }
}

/// 推論コンテキスト: 読み込んだ学習済み状態のみを所有する
#[derive(Debug)]
pub struct BinaryInference {
    pipeline: FeaturePipeline,
    pca: FittedPca,
    svm: FittedSvm,
}

fn decode_payload<T: DeserializeOwned>(path: &Path, payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).map_err(|e| PipelineError::ArtifactCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

impl BinaryInference {
    /// 各段階の次元が連続しているか検査して組み立てる
    pub fn from_parts(pipeline: FeaturePipeline, pca: FittedPca, svm: FittedSvm) -> Result<Self> {
        if pipeline.feature_len() != pca.n_features() {
            return Err(PipelineError::DimensionMismatch {
                stage: Stage::Reduction,
                expected: pca.n_features(),
                actual: pipeline.feature_len(),
            });
        }
        if pca.n_components() != svm.n_features() {
            return Err(PipelineError::DimensionMismatch {
                stage: Stage::Classification,
                expected: svm.n_features(),
                actual: pca.n_components(),
            });
        }
        Ok(Self { pipeline, pca, svm })
    }

    /// 保存済みアーティファクトから読み込む（無い・壊れている場合はエラー）
    pub fn load(paths: &ArtifactPaths) -> Result<Self> {
        let (reducer_meta, reducer_bytes) = load_artifact(&paths.reducer, ArtifactKind::Reducer)?;
        let pca: FittedPca = decode_payload(&paths.reducer, &reducer_bytes)?;

        let missing_features = || PipelineError::ArtifactCorrupt {
            path: paths.reducer.clone(),
            reason: "feature extraction settings are missing".to_string(),
        };
        let hog = reducer_meta.hog.clone().ok_or_else(missing_features)?;
        let scale = reducer_meta.intensity_scale.ok_or_else(missing_features)?;
        let pipeline = FeaturePipeline::new(hog, IntensityScaler::new(scale)?)?;

        let (_, classifier_bytes) = load_artifact(&paths.classifier, ArtifactKind::Classifier)?;
        let svm: FittedSvm = decode_payload(&paths.classifier, &classifier_bytes)?;

        tracing::info!(
            "学習済みモデルを読み込みました ({} -> {} 次元, 学習日時 {})",
            pca.n_features(),
            pca.n_components(),
            reducer_meta.trained_at
        );
        Self::from_parts(pipeline, pca, svm)
    }

    pub fn pipeline(&self) -> &FeaturePipeline {
        &self.pipeline
    }

    pub fn pca(&self) -> &FittedPca {
        &self.pca
    }

    pub fn svm(&self) -> &FittedSvm {
        &self.svm
    }

    /// 画像1枚を 1 x d 行列として各段階に通す
    pub fn predict_image(&self, image: &DynamicImage) -> Result<Label> {
        let features = self.pipeline.transform_one(image);
        let reduced = self.pca.transform(&features)?;
        self.svm
            .predict(&reduced)?
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::model(Stage::Inference, "empty prediction"))
    }
}

impl Predictor for BinaryInference {
    fn predict_image(&self, image: &DynamicImage) -> Result<Label> {
        BinaryInference::predict_image(self, image)
    }
}
