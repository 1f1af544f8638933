//! 血球画像の多クラス分類（burn による CNN）

pub mod augment;
pub mod cell_net;
pub mod inference;
pub mod schedule;
pub mod training;

use std::path::Path;

use burn::backend::Wgpu;
use burn_autodiff::Autodiff;
use burn::tensor::backend::AutodiffBackend;
use burn_ndarray::NdArray;
use burn_wgpu::WgpuDevice;
use image::DynamicImage;

use crate::dataset::ImageDataset;
use crate::error::Result;
use crate::model::{DeviceType, TrainingSettings};
use crate::pipeline::{multiclass, ArgmaxPredictor, MultiClassTrainer, Predictor};

pub use augment::{AugmentConfig, Augmenter};
pub use cell_net::{CellClassifier, CellNetConfig};
pub use inference::CellNetModel;
pub use schedule::{EarlyStopping, PlateauConfig, ReduceOnPlateau};
pub use training::{BurnCellTrainer, CellBatch, CellBatcher, CellDataset, CellItem, EpochStats, TrainingRun};

/// 学習・評価・保存をまとめて行い、検証データ正解率を返す
fn train_on<B: AutodiffBackend>(
    settings: &TrainingSettings,
    device: B::Device,
    images: &[DynamicImage],
    labels: &[usize],
    output: &Path,
    test_set: Option<&ImageDataset>,
) -> Result<f64> {
    let trainer = BurnCellTrainer::<B>::new(settings.clone(), device);
    let (model, accuracy) = trainer.train(images, labels)?;
    model.save(output, settings.num_epochs)?;

    if let Some(test_set) = test_set {
        let report = multiclass::evaluate(&model, test_set)?;
        println!("{}", report);
    }
    Ok(accuracy)
}

/// 設定されたデバイスでCNNを学習し、ネットワークを保存する
pub fn train_network(
    settings: &TrainingSettings,
    device_type: DeviceType,
    dataset: &ImageDataset,
    output: &Path,
    test_set: Option<&ImageDataset>,
) -> Result<f64> {
    tracing::info!("使用デバイス: {}", device_type);
    match device_type {
        DeviceType::Wgpu => train_on::<Autodiff<Wgpu>>(
            settings,
            WgpuDevice::default(),
            dataset.images(),
            dataset.labels(),
            output,
            test_set,
        ),
        DeviceType::Cpu => train_on::<Autodiff<NdArray>>(
            settings,
            Default::default(),
            dataset.images(),
            dataset.labels(),
            output,
            test_set,
        ),
    }
}

/// 保存済みネットワークを読み込み、範囲推論用の予測器にする
pub fn load_predictor(device_type: DeviceType, path: &Path) -> Result<Box<dyn Predictor>> {
    Ok(match device_type {
        DeviceType::Wgpu => Box::new(ArgmaxPredictor::new(CellNetModel::<Wgpu>::load(
            path,
            WgpuDevice::default(),
        )?)),
        DeviceType::Cpu => Box::new(ArgmaxPredictor::new(CellNetModel::<NdArray>::load(
            path,
            Default::default(),
        )?)),
    })
}
