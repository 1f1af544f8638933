//! 勾配方向ヒストグラム（HOG）特徴量
//!
//! 正規サイズへバイリニア縮小した画像から、セルごとの勾配方向ヒストグラムを作り、
//! 重なりのあるブロック単位で L2-Hys 正規化して1本のベクトルに平坦化します。

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::{Array1, Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result, Stage};

/// L2-Hys の分母に加える微小値
const L2_EPS: f64 = 1e-5;

/// HOG 設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HogConfig {
    /// リサイズ後の一辺（正方形）
    pub image_size: u32,
    /// 方向ビン数（0〜180度を等分）
    pub orientations: usize,
    /// セルの一辺（ピクセル）
    pub pixels_per_cell: usize,
    /// ブロックの一辺（セル数）
    pub cells_per_block: usize,
    /// L2-Hys のクリップ閾値
    pub clip: f64,
}

impl Default for HogConfig {
    fn default() -> Self {
        Self {
            image_size: 128,
            orientations: 9,
            pixels_per_cell: 8,
            cells_per_block: 2,
            clip: 0.2,
        }
    }
}

impl HogConfig {
    pub fn validate(&self) -> Result<()> {
        if self.orientations == 0 || self.pixels_per_cell == 0 || self.cells_per_block == 0 {
            return Err(PipelineError::invalid_config(
                Stage::FeatureExtraction,
                "orientations, pixels_per_cell and cells_per_block must be positive",
            ));
        }
        if self.cells_per_side() < self.cells_per_block {
            return Err(PipelineError::invalid_config(
                Stage::FeatureExtraction,
                format!(
                    "image size {} holds {} cells per side, fewer than the block size {}",
                    self.image_size,
                    self.cells_per_side(),
                    self.cells_per_block
                ),
            ));
        }
        if !(self.clip > 0.0) {
            return Err(PipelineError::invalid_config(
                Stage::FeatureExtraction,
                format!("clip threshold must be positive, got {}", self.clip),
            ));
        }
        Ok(())
    }

    fn cells_per_side(&self) -> usize {
        self.image_size as usize / self.pixels_per_cell
    }

    fn blocks_per_side(&self) -> usize {
        self.cells_per_side() + 1 - self.cells_per_block
    }

    /// 出力ベクトル長（設定のみから決まる）
    ///
    /// 128px / 8px セル / 2x2 ブロック / 9 ビンなら 15 * 15 * 2 * 2 * 9 = 8100
    pub fn feature_len(&self) -> usize {
        let blocks = self.blocks_per_side();
        blocks * blocks * self.cells_per_block * self.cells_per_block * self.orientations
    }
}

/// HOG 抽出器
#[derive(Debug, Clone)]
pub struct HogExtractor {
    config: HogConfig,
}

impl HogExtractor {
    pub fn new(config: HogConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &HogConfig {
        &self.config
    }

    pub fn feature_len(&self) -> usize {
        self.config.feature_len()
    }

    /// 画像1枚から特徴ベクトルを作る
    pub fn extract(&self, image: &DynamicImage) -> Array1<f64> {
        let size = self.config.image_size;
        let resized = image.resize_exact(size, size, FilterType::Triangle);
        let channels = channel_planes(&resized);
        let (g_row, g_col) = dominant_gradients(&channels);
        let histograms = self.cell_histograms(&g_row, &g_col);
        self.normalize_blocks(&histograms)
    }

    fn cell_histograms(&self, g_row: &Array2<f64>, g_col: &Array2<f64>) -> Array3<f64> {
        let cfg = &self.config;
        let cells = cfg.cells_per_side();
        let cell_area = (cfg.pixels_per_cell * cfg.pixels_per_cell) as f64;
        let bin_width = 180.0 / cfg.orientations as f64;

        let mut hist = Array3::<f64>::zeros((cells, cells, cfg.orientations));

        for cell_r in 0..cells {
            for cell_c in 0..cells {
                for dy in 0..cfg.pixels_per_cell {
                    for dx in 0..cfg.pixels_per_cell {
                        let r = cell_r * cfg.pixels_per_cell + dy;
                        let c = cell_c * cfg.pixels_per_cell + dx;
                        let gr = g_row[[r, c]];
                        let gc = g_col[[r, c]];
                        let magnitude = gr.hypot(gc);
                        if magnitude == 0.0 {
                            continue;
                        }
                        let angle = gr.atan2(gc).to_degrees().rem_euclid(180.0);
                        let bin = ((angle / bin_width) as usize).min(cfg.orientations - 1);
                        hist[[cell_r, cell_c, bin]] += magnitude / cell_area;
                    }
                }
            }
        }

        hist
    }

    fn normalize_blocks(&self, hist: &Array3<f64>) -> Array1<f64> {
        let cfg = &self.config;
        let blocks = cfg.blocks_per_side();
        let block_len = cfg.cells_per_block * cfg.cells_per_block * cfg.orientations;

        let mut out = Vec::with_capacity(self.feature_len());
        let mut block = Vec::with_capacity(block_len);

        for block_r in 0..blocks {
            for block_c in 0..blocks {
                block.clear();
                for cell_r in block_r..block_r + cfg.cells_per_block {
                    for cell_c in block_c..block_c + cfg.cells_per_block {
                        for bin in 0..cfg.orientations {
                            block.push(hist[[cell_r, cell_c, bin]]);
                        }
                    }
                }
                l2_hys(&mut block, cfg.clip);
                out.extend_from_slice(&block);
            }
        }

        Array1::from_vec(out)
    }
}

/// L2 正規化 → 閾値でクリップ → 再度 L2 正規化
fn l2_hys(block: &mut [f64], clip: f64) {
    l2_normalize(block);
    for v in block.iter_mut() {
        *v = v.min(clip);
    }
    l2_normalize(block);
}

fn l2_normalize(block: &mut [f64]) {
    let norm = (block.iter().map(|v| v * v).sum::<f64>() + L2_EPS * L2_EPS).sqrt();
    for v in block.iter_mut() {
        *v /= norm;
    }
}

/// チャネルごとの輝度平面（0〜255 の実数）
fn channel_planes(image: &DynamicImage) -> Vec<Array2<f64>> {
    let (width, height) = (image.width() as usize, image.height() as usize);

    if image.color().has_color() {
        let rgb = image.to_rgb8();
        (0..3)
            .map(|channel| {
                Array2::from_shape_fn((height, width), |(y, x)| {
                    rgb.get_pixel(x as u32, y as u32)[channel] as f64
                })
            })
            .collect()
    } else {
        let gray = image.to_luma8();
        vec![Array2::from_shape_fn((height, width), |(y, x)| {
            gray.get_pixel(x as u32, y as u32)[0] as f64
        })]
    }
}

/// 中心差分による勾配。境界の行・列は 0
///
/// 複数チャネルの場合は画素ごとに勾配強度が最大のチャネルを採用する。
fn dominant_gradients(channels: &[Array2<f64>]) -> (Array2<f64>, Array2<f64>) {
    let (height, width) = channels[0].dim();
    let mut best_row = Array2::<f64>::zeros((height, width));
    let mut best_col = Array2::<f64>::zeros((height, width));
    let mut best_mag = Array2::<f64>::from_elem((height, width), -1.0);

    for plane in channels {
        for y in 0..height {
            for x in 0..width {
                let gr = if y > 0 && y + 1 < height {
                    plane[[y + 1, x]] - plane[[y - 1, x]]
                } else {
                    0.0
                };
                let gc = if x > 0 && x + 1 < width {
                    plane[[y, x + 1]] - plane[[y, x - 1]]
                } else {
                    0.0
                };
                let mag = gr.hypot(gc);
                if mag > best_mag[[y, x]] {
                    best_mag[[y, x]] = mag;
                    best_row[[y, x]] = gr;
                    best_col[[y, x]] = gc;
                }
            }
        }
    }

    (best_row, best_col)
}
