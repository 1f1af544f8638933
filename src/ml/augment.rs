//! 学習時のランダムデータ拡張（回転・平行移動・拡大縮小・左右反転）
//!
//! 出力画素ごとに逆アフィン変換で入力座標を求め、バイリニア補間で値を取る。
//! 画像外は最近傍の端の画素で埋める。

use std::sync::Arc;

use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// 拡張の範囲
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentConfig {
    /// 回転角の最大値（度）
    pub rotation_deg: f32,
    /// 平行移動の最大値（画像サイズに対する割合）
    pub shift: f32,
    /// 拡大縮小の最大変化率
    pub zoom: f32,
    pub horizontal_flip: bool,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            rotation_deg: 15.0,
            shift: 0.1,
            zoom: 0.1,
            horizontal_flip: true,
        }
    }
}

/// 1枚分の変換パラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineParams {
    pub angle_deg: f32,
    /// 画素単位の平行移動 (x, y)
    pub shift: (f32, f32),
    pub scale: f32,
    pub flip: bool,
}

impl AffineParams {
    pub fn identity() -> Self {
        Self {
            angle_deg: 0.0,
            shift: (0.0, 0.0),
            scale: 1.0,
            flip: false,
        }
    }
}

/// 乱数生成器を共有する拡張器（バッチャーの複製間で同じ系列を使う）
#[derive(Clone)]
pub struct Augmenter {
    config: AugmentConfig,
    rng: Arc<Mutex<StdRng>>,
}

impl Augmenter {
    pub fn new(config: AugmentConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    pub fn sample(&self, width: u32, height: u32) -> AffineParams {
        let cfg = &self.config;
        let mut guard = self.rng.lock();
        let rng: &mut StdRng = &mut guard;
        AffineParams {
            angle_deg: symmetric(rng, cfg.rotation_deg),
            shift: (
                symmetric(rng, cfg.shift) * width as f32,
                symmetric(rng, cfg.shift) * height as f32,
            ),
            scale: 1.0 + symmetric(rng, cfg.zoom),
            flip: cfg.horizontal_flip && rng.gen_bool(0.5),
        }
    }

    pub fn apply(&self, image: &RgbImage) -> RgbImage {
        let params = self.sample(image.width(), image.height());
        warp(image, &params)
    }
}

/// [-limit, limit] の一様乱数
fn symmetric(rng: &mut StdRng, limit: f32) -> f32 {
    if limit > 0.0 {
        rng.gen_range(-limit..=limit)
    } else {
        0.0
    }
}

/// 画像中心まわりのアフィン変換
pub fn warp(image: &RgbImage, params: &AffineParams) -> RgbImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }

    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;
    let (sin, cos) = params.angle_deg.to_radians().sin_cos();
    let inv_scale = 1.0 / params.scale;

    RgbImage::from_fn(width, height, |x, y| {
        // 出力 -> 入力の逆変換: 平行移動を戻し、回転・拡大を戻し、反転を戻す
        let dx = x as f32 - cx - params.shift.0;
        let dy = y as f32 - cy - params.shift.1;
        let sx = (cos * dx + sin * dy) * inv_scale;
        let sy = (-sin * dx + cos * dy) * inv_scale;
        let sx = if params.flip { -sx } else { sx };
        bilinear(image, sx + cx, sy + cy)
    })
}

fn bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let max_x = (image.width() - 1) as f32;
    let max_y = (image.height() - 1) as f32;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(image.width() - 1);
    let y1 = (y0 + 1).min(image.height() - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = image.get_pixel(x0, y0);
    let p10 = image.get_pixel(x1, y0);
    let p01 = image.get_pixel(x0, y1);
    let p11 = image.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern() -> RgbImage {
        RgbImage::from_fn(9, 7, |x, y| Rgb([(x * 20) as u8, (y * 30) as u8, ((x + y) * 10) as u8]))
    }

    #[test]
    fn test_identity_keeps_image() {
        let image = pattern();
        assert_eq!(warp(&image, &AffineParams::identity()), image);
    }

    #[test]
    fn test_flip_mirrors_columns() {
        let image = pattern();
        let flipped = warp(
            &image,
            &AffineParams {
                flip: true,
                ..AffineParams::identity()
            },
        );
        assert_eq!(flipped, image::imageops::flip_horizontal(&image));
    }

    #[test]
    fn test_integer_shift_moves_pixels() {
        let image = pattern();
        let shifted = warp(
            &image,
            &AffineParams {
                shift: (2.0, 0.0),
                ..AffineParams::identity()
            },
        );
        assert_eq!(shifted.get_pixel(5, 3), image.get_pixel(3, 3));
        // 左端は端の画素で埋まる
        assert_eq!(shifted.get_pixel(0, 3), image.get_pixel(0, 3));
    }

    #[test]
    fn test_sampled_params_stay_in_range() {
        let augmenter = Augmenter::new(AugmentConfig::default(), 42);
        for _ in 0..200 {
            let p = augmenter.sample(100, 50);
            assert!(p.angle_deg.abs() <= 15.0);
            assert!(p.shift.0.abs() <= 10.0 + 1e-4);
            assert!(p.shift.1.abs() <= 5.0 + 1e-4);
            assert!(p.scale >= 0.9 - 1e-6 && p.scale <= 1.1 + 1e-6);
        }
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let a = Augmenter::new(AugmentConfig::default(), 7);
        let b = Augmenter::new(AugmentConfig::default(), 7);
        let image = pattern();
        assert_eq!(a.apply(&image), b.apply(&image));
        // 複製は乱数列を共有する
        let c = a.clone();
        assert_ne!(a.sample(10, 10), c.sample(10, 10));
    }
}
