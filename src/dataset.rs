//! 画像データセットの読み込みと分割
//!
//! ディレクトリ構成:
//! - `<root>/<split>/<label>/*.png` (`split` は `train` / `test`、`label` は整数クラスID)

use std::collections::BTreeMap;
use std::path::Path;

use image::DynamicImage;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{PipelineError, Result, Stage};
use crate::types::Label;

/// データセット分割の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitKind {
    Train,
    Test,
}

impl SplitKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            SplitKind::Train => "train",
            SplitKind::Test => "test",
        }
    }
}

/// ラベル付き画像の集合（読み込み後は不変）
#[derive(Debug, Clone, Default)]
pub struct ImageDataset {
    images: Vec<DynamicImage>,
    labels: Vec<Label>,
}

impl ImageDataset {
    pub fn new(images: Vec<DynamicImage>, labels: Vec<Label>) -> Result<Self> {
        if images.len() != labels.len() {
            return Err(PipelineError::invalid_input(
                Stage::Split,
                format!(
                    "{} images but {} labels",
                    images.len(),
                    labels.len()
                ),
            ));
        }
        Ok(Self { images, labels })
    }

    /// `<root>/<split>/<label>/` から画像を読み込む
    ///
    /// ラベルディレクトリは数値順に走査し、各ディレクトリ内はファイル名順。
    pub fn from_directory(root: &Path, split: SplitKind) -> Result<Self> {
        let split_dir = root.join(split.dir_name());
        if !split_dir.is_dir() {
            return Err(PipelineError::invalid_input(
                Stage::Split,
                format!("dataset directory not found: {}", split_dir.display()),
            ));
        }

        let mut class_dirs = BTreeMap::new();
        for entry in std::fs::read_dir(&split_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let label = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<Label>().ok());
            match label {
                Some(label) => {
                    class_dirs.insert(label, path);
                }
                None => {
                    tracing::warn!("ラベルとして解釈できないディレクトリをスキップ: {}", path.display());
                }
            }
        }

        let mut images = Vec::new();
        let mut labels = Vec::new();

        for (label, class_dir) in &class_dirs {
            let mut paths = Vec::new();
            for entry in std::fs::read_dir(class_dir)? {
                let path = entry?.path();
                if !path.is_file() {
                    continue;
                }
                if let Some(ext) = path.extension() {
                    let ext_str = ext.to_string_lossy().to_lowercase();
                    if ext_str == "png" || ext_str == "jpg" || ext_str == "jpeg" {
                        paths.push(path);
                    }
                }
            }
            paths.sort();

            for path in paths {
                images.push(image::open(&path)?);
                labels.push(*label);
            }
            tracing::debug!("  クラス {}: {} 枚", label, labels.iter().filter(|l| *l == label).count());
        }

        if images.is_empty() {
            return Err(PipelineError::invalid_input(
                Stage::Split,
                format!("no images found in {}", split_dir.display()),
            ));
        }

        tracing::info!(
            "{} から {} 枚を読み込みました ({} クラス)",
            split_dir.display(),
            images.len(),
            class_dirs.len()
        );

        Ok(Self { images, labels })
    }

    /// 分割ディレクトリが無ければ `None`。あれば [`ImageDataset::from_directory`] と同じく読み込み、
    /// 壊れた画像などのエラーはそのまま返す
    pub fn from_directory_if_present(root: &Path, split: SplitKind) -> Result<Option<Self>> {
        if !root.join(split.dir_name()).is_dir() {
            tracing::info!("{} に {} 分割がありません", root.display(), split.dir_name());
            return Ok(None);
        }
        Self::from_directory(root, split).map(Some)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn images(&self) -> &[DynamicImage] {
        &self.images
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn get(&self, index: usize) -> Option<(&DynamicImage, Label)> {
        Some((self.images.get(index)?, *self.labels.get(index)?))
    }

    /// インデックス集合で部分データセットを作る
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            images: indices.iter().map(|&i| self.images[i].clone()).collect(),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }

    /// クラスごとのサンプル数（ラベル昇順）
    pub fn class_counts(&self) -> BTreeMap<Label, usize> {
        class_counts(&self.labels)
    }
}

pub fn class_counts(labels: &[Label]) -> BTreeMap<Label, usize> {
    let mut counts = BTreeMap::new();
    for &label in labels {
        *counts.entry(label).or_insert(0) += 1;
    }
    counts
}

/// 学習用と評価用のインデックス（互いに素）
#[derive(Debug, Clone)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// シャッフルして分割する（評価側のサイズは `ceil(n * test_ratio)`）
pub fn train_test_split(n: usize, test_ratio: f64, seed: u64) -> Result<SplitIndices> {
    let n_test = test_size(n, test_ratio)?;

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let test = indices[..n_test].to_vec();
    let train = indices[n_test..].to_vec();

    Ok(SplitIndices { train, test })
}

/// クラス比率を保ったまま分割する
pub fn stratified_split(labels: &[Label], test_ratio: f64, seed: u64) -> Result<SplitIndices> {
    test_size(labels.len(), test_ratio)?;

    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();

    for label in class_counts(labels).keys() {
        let mut members: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, l)| *l == label)
            .map(|(i, _)| i)
            .collect();
        members.shuffle(&mut rng);

        let n_test = ((members.len() as f64) * test_ratio).round() as usize;
        let n_test = n_test.min(members.len().saturating_sub(1));
        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }

    train.shuffle(&mut rng);
    test.shuffle(&mut rng);

    Ok(SplitIndices { train, test })
}

fn test_size(n: usize, test_ratio: f64) -> Result<usize> {
    if !(test_ratio > 0.0 && test_ratio < 1.0) {
        return Err(PipelineError::invalid_config(
            Stage::Split,
            format!("test ratio must be in (0, 1), got {}", test_ratio),
        ));
    }
    let n_test = ((n as f64) * test_ratio).ceil() as usize;
    if n_test == 0 || n_test >= n {
        return Err(PipelineError::invalid_input(
            Stage::Split,
            format!("cannot split {} samples with test ratio {}", n, test_ratio),
        ));
    }
    Ok(n_test)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_optional_split_is_none_only_when_directory_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageDataset::from_directory_if_present(dir.path(), SplitKind::Test)
            .unwrap()
            .is_none());

        let class_dir = dir.path().join("test").join("0");
        std::fs::create_dir_all(&class_dir).unwrap();
        image::GrayImage::from_pixel(4, 4, image::Luma([9]))
            .save(class_dir.join("a.png"))
            .unwrap();
        let loaded = ImageDataset::from_directory_if_present(dir.path(), SplitKind::Test)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.len(), 1);

        // 読めない画像はエラーとして伝わる
        std::fs::write(class_dir.join("b.png"), b"not a png").unwrap();
        let err = ImageDataset::from_directory_if_present(dir.path(), SplitKind::Test).unwrap_err();
        assert!(matches!(err, PipelineError::Image(_)));
    }

    #[test]
    fn test_split_is_disjoint_and_complete() {
        let split = train_test_split(120, 0.2, 42).unwrap();
        assert_eq!(split.test.len(), 24);
        assert_eq!(split.train.len(), 96);

        let train: HashSet<_> = split.train.iter().copied().collect();
        let test: HashSet<_> = split.test.iter().copied().collect();
        assert!(train.is_disjoint(&test));
        assert_eq!(train.len() + test.len(), 120);
    }

    #[test]
    fn test_split_is_reproducible() {
        let a = train_test_split(50, 0.2, 42).unwrap();
        let b = train_test_split(50, 0.2, 42).unwrap();
        assert_eq!(a.train, b.train);
        assert_eq!(a.test, b.test);
    }

    #[test]
    fn test_stratified_split_keeps_every_class_in_train() {
        let labels: Vec<Label> = (0..40).map(|i| if i < 30 { 0 } else { 1 }).collect();
        let split = stratified_split(&labels, 0.3, 42).unwrap();

        let test_minority = split.test.iter().filter(|&&i| labels[i] == 1).count();
        let train_minority = split.train.iter().filter(|&&i| labels[i] == 1).count();
        assert_eq!(test_minority, 3);
        assert_eq!(train_minority, 7);
        assert_eq!(split.train.len() + split.test.len(), 40);
    }

    #[test]
    fn test_invalid_ratio_is_rejected() {
        assert!(train_test_split(10, 0.0, 42).is_err());
        assert!(train_test_split(10, 1.0, 42).is_err());
    }

    #[test]
    fn test_dataset_rejects_length_mismatch() {
        let images = vec![DynamicImage::new_luma8(4, 4)];
        assert!(ImageDataset::new(images, vec![0, 1]).is_err());
    }

    #[test]
    fn test_from_directory_reads_numeric_class_dirs() {
        let dir = tempfile::tempdir().unwrap();
        for (label, count) in [(0usize, 2usize), (1, 3)] {
            let class_dir = dir.path().join("train").join(label.to_string());
            std::fs::create_dir_all(&class_dir).unwrap();
            for i in 0..count {
                let img = image::GrayImage::from_pixel(8, 8, image::Luma([(i * 40) as u8]));
                img.save(class_dir.join(format!("{i}.png"))).unwrap();
            }
        }
        std::fs::create_dir_all(dir.path().join("train").join("notes")).unwrap();

        let dataset = ImageDataset::from_directory(dir.path(), SplitKind::Train).unwrap();
        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.labels(), &[0, 0, 1, 1, 1]);
        assert_eq!(dataset.class_counts().get(&1), Some(&3));
    }
}
