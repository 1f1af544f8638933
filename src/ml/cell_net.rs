//! 血球画像分類用のCNNモデル定義

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};

use crate::error::{PipelineError, Stage};

/// 3 回の 2x2 プーリング後も 1 画素以上残る最小サイズ
pub const MIN_IMAGE_SIZE: usize = 8;

/// 全結合層の幅
const HIDDEN: usize = 128;

/// ImageNet の平均（RGB）
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet の標準偏差（RGB）
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// モデル設定
#[derive(Config, Debug)]
pub struct CellNetConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
}

impl CellNetConfig {
    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::error::Result<CellClassifier<B>> {
        if self.image_size < MIN_IMAGE_SIZE {
            return Err(PipelineError::invalid_config(
                Stage::Network,
                format!("input size {} is too small (minimum {})", self.image_size, MIN_IMAGE_SIZE),
            ));
        }
        if self.num_classes < 2 {
            return Err(PipelineError::invalid_config(
                Stage::Network,
                format!("at least two classes are required, got {}", self.num_classes),
            ));
        }

        let final_size = self.image_size / 8;
        tracing::debug!(
            "[CellNet] 入力 {}x{} -> 128 x {}x{} -> GAP -> {} -> {}",
            self.image_size,
            self.image_size,
            final_size,
            final_size,
            HIDDEN,
            self.num_classes
        );

        let conv = |channels: [usize; 2]| {
            Conv2dConfig::new(channels, [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init::<B>(device)
        };

        Ok(CellClassifier {
            conv1: conv([3, 32]),
            conv2: conv([32, 64]),
            conv3: conv([64, 128]),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            gap: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(128, HIDDEN).init(device),
            norm: LayerNormConfig::new(HIDDEN).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(HIDDEN, self.num_classes).init(device),
            activation: Relu::new(),
        })
    }
}

/// 血球分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 (same padding) + ReLU + MaxPool 2x2} x 3層 (32 / 64 / 128ch)
/// - Global Average Pooling
/// - FC: 128 -> 128 + ReLU
/// - LayerNorm
/// - Dropout
/// - FC: 128 -> num_classes
/// - Softmax (予測時)
#[derive(Module, Debug)]
pub struct CellClassifier<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    pool: MaxPool2d,
    gap: AdaptiveAvgPool2d,

    fc1: Linear<B>,
    norm: LayerNorm<B>,
    dropout: Dropout,
    fc2: Linear<B>,

    activation: Relu,
}

impl<B: Backend> CellClassifier<B> {
    /// 順伝播
    ///
    /// - `images`: [batch_size, 3, size, size]
    /// - 戻り値: ロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.pool.forward(self.activation.forward(self.conv1.forward(images)));
        let x = self.pool.forward(self.activation.forward(self.conv2.forward(x)));
        let x = self.pool.forward(self.activation.forward(self.conv3.forward(x)));

        let x = self.gap.forward(x);
        let [_, c, _, _] = x.dims();
        let x = x.reshape([batch_size, c]);

        let x = self.activation.forward(self.fc1.forward(x));
        let x = self.norm.forward(x);
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(&self, images: Tensor<B, 4>, targets: Tensor<B, 1, Int>) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

/// RGB 画像を ImageNet の平均・標準偏差で正規化し (C, H, W) 順に平坦化
pub fn normalize_rgb(image: &image::RgbImage) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let mut data = Vec::with_capacity(3 * (width * height) as usize);

    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                let value = image.get_pixel(x, y)[channel] as f32 / 255.0;
                data.push((value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel]);
            }
        }
    }

    data
}
