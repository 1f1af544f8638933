//! 学習済みCNNの保存・読み込みと推論

use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use image::imageops::FilterType;
use image::DynamicImage;

use crate::error::{PipelineError, Result, Stage};
use crate::ml::cell_net::{normalize_rgb, CellClassifier, CellNetConfig};
use crate::model::{load_artifact, save_artifact, ArtifactKind, ArtifactMetadata};
use crate::pipeline::MultiClassModel;
use crate::types::Task;

/// 画像をネットワーク入力サイズの RGB に揃えて正規化する
pub fn prepare_image(image: &DynamicImage, image_size: usize) -> Vec<f32> {
    let size = image_size as u32;
    let rgb = if image.width() == size && image.height() == size {
        image.to_rgb8()
    } else {
        image.resize_exact(size, size, FilterType::Triangle).to_rgb8()
    };
    normalize_rgb(&rgb)
}

/// 推論用の学習済みネットワーク
#[derive(Debug)]
pub struct CellNetModel<B: Backend> {
    model: CellClassifier<B>,
    image_size: usize,
    num_classes: usize,
    device: B::Device,
}

impl<B: Backend> CellNetModel<B> {
    pub fn new(model: CellClassifier<B>, image_size: usize, num_classes: usize, device: B::Device) -> Self {
        Self {
            model,
            image_size,
            num_classes,
            device,
        }
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn network(&self) -> &CellClassifier<B> {
        &self.model
    }

    /// 重みをアーティファクトとして保存する
    pub fn save(&self, path: &Path, num_epochs: usize) -> Result<PathBuf> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let bytes = recorder
            .record(self.model.clone().into_record(), ())
            .map_err(|e| PipelineError::model(Stage::Persistence, format!("{:?}", e)))?;

        let metadata = ArtifactMetadata::new(
            ArtifactKind::Network,
            3 * self.image_size * self.image_size,
            self.num_classes,
            Task::Multiclass.class_names().iter().map(|s| s.to_string()).collect(),
            self.image_size as u32,
        )
        .with_epochs(num_epochs);

        save_artifact(path, &metadata, &bytes)
    }

    /// アーティファクトからモデルを復元する
    pub fn load(path: &Path, device: B::Device) -> Result<Self> {
        let (metadata, bytes) = load_artifact(path, ArtifactKind::Network)?;
        let image_size = metadata.image_size as usize;
        let num_classes = metadata.output_dim;

        // 推論時はドロップアウトなし
        let config = CellNetConfig::new(num_classes).with_image_size(image_size).with_dropout(0.0);
        let model = config.init::<B>(&device)?;

        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder.load(bytes, &device).map_err(|e| PipelineError::ArtifactCorrupt {
            path: path.to_path_buf(),
            reason: format!("{:?}", e),
        })?;
        let model = model.load_record(record);

        tracing::info!(
            "CNN を読み込みました: {} クラス, 入力 {}x{}, 学習日時 {}",
            num_classes,
            image_size,
            image_size,
            metadata.trained_at
        );
        Ok(Self::new(model, image_size, num_classes, device))
    }
}

impl<B: Backend> MultiClassModel for CellNetModel<B> {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn class_probabilities(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let data = prepare_image(image, self.image_size);
        let tensor = Tensor::<B, 1>::from_floats(data.as_slice(), &self.device).reshape([
            1,
            3,
            self.image_size,
            self.image_size,
        ]);

        self.model
            .probabilities(tensor)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| PipelineError::model(Stage::Network, format!("推論結果の取得エラー: {:?}", e)))
    }
}
