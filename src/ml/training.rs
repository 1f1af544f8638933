//! CNN の学習（Adam + 検証損失による学習率縮小・早期終了）

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use image::DynamicImage;

use crate::dataset::{class_counts, stratified_split};
use crate::error::{PipelineError, Result, Stage};
use crate::ml::augment::{AugmentConfig, Augmenter};
use crate::ml::cell_net::{CellClassifier, CellNetConfig};
use crate::ml::inference::{prepare_image, CellNetModel};
use crate::ml::schedule::{EarlyStopping, PlateauConfig, ReduceOnPlateau, Verdict};
use crate::model::TrainingSettings;
use crate::pipeline::MultiClassTrainer;
use crate::types::Label;

/// データセットアイテム（元画像のまま保持し、バッチ化時にリサイズする）
#[derive(Clone, Debug)]
pub struct CellItem {
    pub image: DynamicImage,
    pub label: Label,
}

/// 学習データセット
pub struct CellDataset {
    items: Vec<CellItem>,
}

impl CellDataset {
    pub fn new(images: &[DynamicImage], labels: &[Label], indices: &[usize]) -> Self {
        Self {
            items: indices
                .iter()
                .map(|&i| CellItem {
                    image: images[i].clone(),
                    label: labels[i],
                })
                .collect(),
        }
    }
}

impl Dataset<CellItem> for CellDataset {
    fn get(&self, index: usize) -> Option<CellItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// バッチャー（学習用のみデータ拡張を掛ける）
#[derive(Clone)]
pub struct CellBatcher {
    image_size: usize,
    augmenter: Option<Augmenter>,
}

impl CellBatcher {
    pub fn new(image_size: usize, augmenter: Option<Augmenter>) -> Self {
        Self { image_size, augmenter }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct CellBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, CellItem, CellBatch<B>> for CellBatcher {
    fn batch(&self, items: Vec<CellItem>, device: &B::Device) -> CellBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets = Vec::with_capacity(batch_size);

        for item in items {
            let data = match &self.augmenter {
                Some(augmenter) => {
                    let resized = DynamicImage::ImageRgb8(
                        item.image
                            .resize_exact(size as u32, size as u32, image::imageops::FilterType::Triangle)
                            .to_rgb8(),
                    );
                    let warped = augmenter.apply(&resized.to_rgb8());
                    prepare_image(&DynamicImage::ImageRgb8(warped), size)
                }
                None => prepare_image(&item.image, size),
            };
            pixels.extend_from_slice(&data);
            targets.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(pixels.as_slice(), device).reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), device);

        CellBatch { images, targets }
    }
}

/// burn による [`MultiClassTrainer`] 実装
///
/// エポック末ごとに検証損失を測り、停滞時の学習率縮小と早期終了を行う。
/// 返すのは検証損失が最良だったエポックの重み。
pub struct BurnCellTrainer<B: AutodiffBackend> {
    settings: TrainingSettings,
    device: B::Device,
}

impl<B: AutodiffBackend> BurnCellTrainer<B> {
    pub fn new(settings: TrainingSettings, device: B::Device) -> Self {
        Self { settings, device }
    }

    fn validate(&self, images: &[DynamicImage], labels: &[Label]) -> Result<()> {
        let s = &self.settings;
        if images.len() != labels.len() {
            return Err(PipelineError::invalid_input(
                Stage::Network,
                format!("{} images but {} labels", images.len(), labels.len()),
            ));
        }
        if s.num_epochs == 0 || s.batch_size == 0 {
            return Err(PipelineError::invalid_config(
                Stage::Network,
                "num_epochs and batch_size must be positive",
            ));
        }
        if !(s.lr_factor > 0.0 && s.lr_factor < 1.0) {
            return Err(PipelineError::invalid_config(
                Stage::Network,
                format!("lr_factor must be in (0, 1), got {}", s.lr_factor),
            ));
        }
        if let Some(&label) = labels.iter().find(|&&l| l >= s.num_classes) {
            return Err(PipelineError::invalid_input(
                Stage::Network,
                format!("label {} is out of range for {} classes", label, s.num_classes),
            ));
        }
        Ok(())
    }
}

/// 1エポック分の検証結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub loss: f64,
    pub accuracy: f64,
}

/// 検証データ全体の平均損失と正解率（ドロップアウトなしの推論バックエンドで計算）
fn evaluate_epoch<B: Backend>(
    model: &CellClassifier<B>,
    dataloader: &dyn DataLoader<B, CellBatch<B>>,
    device: &B::Device,
) -> EpochStats {
    let mut loss_sum = 0.0;
    let mut correct = 0usize;
    let mut seen = 0usize;

    for batch in dataloader.iter() {
        let images = batch.images.to_device(device);
        let targets = batch.targets.to_device(device);
        let [batch_size, _, _, _] = images.dims();

        let output = model.forward_classification(images, targets);
        let loss: f64 = output.loss.into_scalar().elem();
        let predicted = output.output.argmax(1).flatten::<1>(0, 1);
        let hits = predicted.equal(output.targets).int().sum().into_scalar();

        loss_sum += loss * batch_size as f64;
        correct += num_to_usize(hits);
        seen += batch_size;
    }

    if seen == 0 {
        return EpochStats { loss: 0.0, accuracy: 0.0 };
    }
    EpochStats {
        loss: loss_sum / seen as f64,
        accuracy: correct as f64 / seen as f64,
    }
}

fn num_to_usize<E: ElementConversion>(value: E) -> usize {
    value.elem::<i64>().max(0) as usize
}

/// 学習結果: 最良エポックのモデルとエポックごとの検証結果
pub struct TrainingRun<B: Backend> {
    pub model: CellNetModel<B>,
    pub history: Vec<EpochStats>,
    /// 復元したエポック（1始まり）
    pub best_epoch: Option<usize>,
    pub accuracy: f64,
}

impl<B: AutodiffBackend> BurnCellTrainer<B> {
    pub fn fit(&self, images: &[DynamicImage], labels: &[Label]) -> Result<TrainingRun<B::InnerBackend>> {
        self.validate(images, labels)?;
        let s = &self.settings;

        let split = stratified_split(labels, s.test_ratio, s.seed)?;
        let dataset_train = CellDataset::new(images, labels, &split.train);
        let dataset_val = CellDataset::new(images, labels, &split.test);

        tracing::info!("学習データ: {} 枚 / 検証データ: {} 枚", dataset_train.len(), dataset_val.len());
        for (label, count) in class_counts(labels) {
            tracing::debug!("  クラス {}: {} 枚", label, count);
        }

        let image_size = s.image_size as usize;
        let augmenter = s.augment.then(|| Augmenter::new(AugmentConfig::default(), s.seed));

        let dataloader_train = DataLoaderBuilder::<B, _, _>::new(CellBatcher::new(image_size, augmenter))
            .batch_size(s.batch_size)
            .shuffle(s.seed)
            .num_workers(s.num_workers)
            .build(dataset_train);
        let dataloader_val = DataLoaderBuilder::<B::InnerBackend, _, _>::new(CellBatcher::new(image_size, None))
            .batch_size(s.batch_size)
            .num_workers(s.num_workers)
            .build(dataset_val);

        let mut model = CellNetConfig::new(s.num_classes)
            .with_dropout(s.dropout)
            .with_image_size(image_size)
            .init::<B>(&self.device)?;
        let mut optimizer = AdamConfig::new().init::<B, CellClassifier<B>>();

        let mut schedule = ReduceOnPlateau::new(
            s.learning_rate,
            PlateauConfig {
                factor: s.lr_factor,
                patience: s.lr_patience,
                min_lr: s.min_learning_rate,
                ..PlateauConfig::default()
            },
        );
        let mut stopping = EarlyStopping::new(s.patience);
        let mut best: Option<(CellClassifier<B::InnerBackend>, EpochStats)> = None;
        let mut history = Vec::with_capacity(s.num_epochs);

        tracing::info!(
            "学習を開始します: エポック数 {}, バッチサイズ {}, 学習率 {}",
            s.num_epochs,
            s.batch_size,
            s.learning_rate
        );

        for epoch in 1..=s.num_epochs {
            let lr = schedule.lr();
            let mut train_loss = 0.0;
            let mut batches = 0usize;

            for batch in dataloader_train.iter() {
                let output = model.forward_classification(
                    batch.images.to_device(&self.device),
                    batch.targets.to_device(&self.device),
                );
                let loss: f64 = output.loss.clone().into_scalar().elem();
                let grads = GradientsParams::from_grads(output.loss.backward(), &model);
                model = optimizer.step(lr, model, grads);

                train_loss += loss;
                batches += 1;
            }

            let network = model.valid();
            let stats = evaluate_epoch(&network, dataloader_val.as_ref(), &self.device);
            tracing::info!(
                "エポック {}/{}: 学習損失 {:.4}, 検証損失 {:.4}, 検証正解率 {:.4}, 学習率 {:.2e}",
                epoch,
                s.num_epochs,
                train_loss / batches.max(1) as f64,
                stats.loss,
                stats.accuracy,
                lr
            );

            history.push(stats);
            schedule.observe(stats.loss);
            match stopping.observe(stats.loss) {
                Verdict::Improved => best = Some((network, stats)),
                Verdict::Continue => {}
                Verdict::Stop => {
                    tracing::info!("検証損失が {} エポック改善しないため学習を終了します", s.patience);
                    break;
                }
            }
        }

        let (network, stats) = match best {
            Some(best) => best,
            None => {
                // 検証損失が NaN のまま終わった場合
                let network = model.valid();
                let stats = evaluate_epoch(&network, dataloader_val.as_ref(), &self.device);
                (network, stats)
            }
        };
        if let Some((epoch, loss)) = stopping.best() {
            tracing::info!("最良エポック {} の重みを復元しました (検証損失 {:.4})", epoch, loss);
        }
        tracing::info!("検証データ正解率: {:.4}", stats.accuracy);

        Ok(TrainingRun {
            model: CellNetModel::new(network, image_size, s.num_classes, self.device.clone()),
            history,
            best_epoch: stopping.best().map(|(epoch, _)| epoch),
            accuracy: stats.accuracy,
        })
    }
}

impl<B: AutodiffBackend> MultiClassTrainer for BurnCellTrainer<B> {
    type Model = CellNetModel<B::InnerBackend>;

    fn train(&self, images: &[DynamicImage], labels: &[Label]) -> Result<(Self::Model, f64)> {
        let run = self.fit(images, labels)?;
        Ok((run.model, run.accuracy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    fn solid(color: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(12, 12, Rgb(color)))
    }

    #[test]
    fn test_batcher_shapes_and_targets() {
        let items = vec![
            CellItem { image: solid([255, 0, 0]), label: 3 },
            CellItem { image: solid([0, 255, 0]), label: 5 },
        ];
        let batcher = CellBatcher::new(16, None);
        let batch: CellBatch<TestBackend> = batcher.batch(items, &Default::default());
        assert_eq!(batch.images.dims(), [2, 3, 16, 16]);
        assert_eq!(batch.targets.into_data().to_vec::<i64>().unwrap(), vec![3, 5]);
    }

    #[test]
    fn test_augmented_batch_keeps_shape() {
        let items = vec![CellItem { image: solid([10, 20, 30]), label: 0 }];
        let batcher = CellBatcher::new(16, Some(Augmenter::new(AugmentConfig::default(), 1)));
        let batch: CellBatch<TestBackend> = batcher.batch(items, &Default::default());
        assert_eq!(batch.images.dims(), [1, 3, 16, 16]);
    }

    #[test]
    fn test_out_of_range_labels_are_rejected_before_training() {
        let trainer = BurnCellTrainer::<Autodiff<TestBackend>>::new(TrainingSettings::default(), Default::default());
        let images = vec![solid([0, 0, 0]); 2];
        let err = trainer.train(&images, &[0, 9]).err().unwrap();
        assert!(matches!(err, PipelineError::InvalidInput { stage: Stage::Network, .. }));
    }

    fn two_colour_set(n: usize) -> (Vec<DynamicImage>, Vec<Label>) {
        let mut images = Vec::new();
        let mut labels = Vec::new();
        for i in 0..n {
            let label = i % 2;
            images.push(solid(if label == 0 { [250, 10, 10] } else { [10, 10, 250] }));
            labels.push(label);
        }
        (images, labels)
    }

    #[test]
    fn test_returned_weights_come_from_lowest_validation_loss_epoch() {
        let settings = TrainingSettings {
            num_epochs: 4,
            batch_size: 4,
            image_size: 8,
            num_classes: 2,
            learning_rate: 1e-2,
            patience: 0,
            augment: false,
            ..TrainingSettings::default()
        };
        let (images, labels) = two_colour_set(20);
        let run = BurnCellTrainer::<Autodiff<TestBackend>>::new(settings.clone(), Default::default())
            .fit(&images, &labels)
            .unwrap();
        assert_eq!(run.history.len(), 4);

        let (best_index, best) = run
            .history
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.loss.total_cmp(&b.1.loss))
            .unwrap();
        assert_eq!(run.best_epoch, Some(best_index + 1));
        assert_eq!(run.accuracy, best.accuracy);

        // 同じ検証分割で測り直すと最良エポックの損失になる
        let split = stratified_split(&labels, settings.test_ratio, settings.seed).unwrap();
        let loader = DataLoaderBuilder::<TestBackend, _, _>::new(CellBatcher::new(8, None))
            .batch_size(4)
            .build(CellDataset::new(&images, &labels, &split.test));
        let stats = evaluate_epoch(run.model.network(), loader.as_ref(), &Default::default());
        assert!((stats.loss - best.loss).abs() < 1e-5, "{} vs {}", stats.loss, best.loss);
    }

    #[test]
    fn test_invalid_lr_factor_is_rejected() {
        let settings = TrainingSettings {
            lr_factor: 1.5,
            ..TrainingSettings::default()
        };
        let trainer = BurnCellTrainer::<Autodiff<TestBackend>>::new(settings, Default::default());
        let (images, labels) = two_colour_set(4);
        let err = trainer.train(&images, &labels).err().unwrap();
        assert!(matches!(err, PipelineError::InvalidConfig { stage: Stage::Network, .. }));
    }

    #[test]
    fn test_short_training_run_produces_model() {
        let settings = TrainingSettings {
            num_epochs: 1,
            batch_size: 4,
            image_size: 8,
            num_classes: 2,
            augment: false,
            ..TrainingSettings::default()
        };
        let trainer = BurnCellTrainer::<Autodiff<TestBackend>>::new(settings, Default::default());
        let (images, labels) = two_colour_set(20);

        let (model, accuracy) = trainer.train(&images, &labels).unwrap();
        assert!((0.0..=1.0).contains(&accuracy));
        let probs = crate::pipeline::MultiClassModel::class_probabilities(&model, &images[0]).unwrap();
        assert_eq!(probs.len(), 2);
    }
}
