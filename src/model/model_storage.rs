//! アーティファクトとメタデータの永続化
//!
//! Tar.gz形式で学習済み状態とメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（種類、次元、クラス名など）
//! - model.bin       - 学習済み状態（バイナリ）
//!
//! 読み込み時にファイルが無い・壊れている・種類が違う場合はすべて致命的エラーで、
//! 未学習状態へのフォールバックはありません。

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

use crate::error::{PipelineError, Result};
use crate::model::model_metadata::{ArtifactKind, ArtifactMetadata};

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// `.gz` で終わっていなければ `.tar.gz` を付ける
pub fn archive_path(path: &Path) -> PathBuf {
    if path.extension().and_then(|s| s.to_str()) == Some("gz") {
        path.to_path_buf()
    } else {
        path.with_extension("tar.gz")
    }
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, bytes)?;
    Ok(())
}

/// メタデータと共に学習済み状態を保存し、実際の保存先を返す
pub fn save_artifact(output_path: &Path, metadata: &ArtifactMetadata, payload: &[u8]) -> Result<PathBuf> {
    let tar_gz_path = archive_path(output_path);

    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(&tar_gz_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);

    append_entry(&mut builder, METADATA_ENTRY, metadata.to_json_string()?.as_bytes())?;
    append_entry(&mut builder, MODEL_ENTRY, payload)?;

    // gzip のフッタまで書き切る
    builder.into_inner()?.finish()?;

    tracing::info!(
        "{} を保存しました: {} ({} bytes)",
        metadata.kind,
        tar_gz_path.display(),
        payload.len()
    );
    Ok(tar_gz_path)
}

/// アーカイブ内の2エントリを読み出す（種類の検査はしない）
fn read_entries(path: &Path) -> Result<(Option<ArtifactMetadata>, Option<Vec<u8>>)> {
    let corrupt = |reason: String| PipelineError::ArtifactCorrupt {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path)?;
    let mut archive = Archive::new(GzDecoder::new(file));

    let mut metadata = None;
    let mut payload = None;

    let entries = archive.entries().map_err(|e| corrupt(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| corrupt(e.to_string()))?;
        let name = entry
            .path()
            .map_err(|e| corrupt(e.to_string()))?
            .to_string_lossy()
            .into_owned();

        match name.as_str() {
            METADATA_ENTRY => {
                let mut json = String::new();
                entry.read_to_string(&mut json).map_err(|e| corrupt(e.to_string()))?;
                metadata = Some(
                    ArtifactMetadata::from_json_string(&json)
                        .map_err(|e| corrupt(format!("invalid metadata: {}", e)))?,
                );
            }
            MODEL_ENTRY => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer).map_err(|e| corrupt(e.to_string()))?;
                payload = Some(buffer);
            }
            _ => {}
        }
    }

    Ok((metadata, payload))
}

fn resolve_existing(path: &Path) -> Result<PathBuf> {
    let tar_gz_path = archive_path(path);
    if !tar_gz_path.is_file() {
        return Err(PipelineError::ArtifactMissing { path: tar_gz_path });
    }
    Ok(tar_gz_path)
}

/// メタデータのみ読み込む
pub fn load_metadata(path: &Path) -> Result<ArtifactMetadata> {
    let tar_gz_path = resolve_existing(path)?;
    match read_entries(&tar_gz_path)? {
        (Some(metadata), _) => Ok(metadata),
        (None, _) => Err(PipelineError::ArtifactCorrupt {
            path: tar_gz_path,
            reason: format!("{} not found in archive", METADATA_ENTRY),
        }),
    }
}

/// メタデータと学習済み状態を読み込み、種類を検査する
pub fn load_artifact(path: &Path, expected: ArtifactKind) -> Result<(ArtifactMetadata, Vec<u8>)> {
    let tar_gz_path = resolve_existing(path)?;
    let (metadata, payload) = read_entries(&tar_gz_path)?;

    let missing = |entry: &str| PipelineError::ArtifactCorrupt {
        path: tar_gz_path.clone(),
        reason: format!("{} not found in archive", entry),
    };
    let metadata = metadata.ok_or_else(|| missing(METADATA_ENTRY))?;
    let payload = payload.ok_or_else(|| missing(MODEL_ENTRY))?;
    metadata.expect_kind(expected)?;

    tracing::debug!("{} を読み込みました: {}", expected, tar_gz_path.display());
    Ok((metadata, payload))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ArtifactMetadata) {
    println!("\n=== アーティファクトメタデータ ===");
    println!("種類: {}", metadata.kind);
    println!("入力次元: {}", metadata.input_dim);
    println!("出力次元: {}", metadata.output_dim);
    if !metadata.class_labels.is_empty() {
        println!("クラス: {}", metadata.class_labels.join(", "));
    }
    println!("入力画像サイズ: {}x{}", metadata.image_size, metadata.image_size);
    if let Some(hog) = &metadata.hog {
        println!(
            "HOG: {} bins, {}px セル, {}x{} ブロック",
            hog.orientations, hog.pixels_per_cell, hog.cells_per_block, hog.cells_per_block
        );
    }
    if let Some(scale) = metadata.intensity_scale {
        println!("輝度スケール: {}", scale);
    }
    if let Some(epochs) = metadata.num_epochs {
        println!("学習エポック数: {}", epochs);
    }
    println!("バージョン: {}", metadata.crate_version);
    println!("学習日時: {}", metadata.trained_at);
    println!("================================");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> ArtifactMetadata {
        ArtifactMetadata::new(ArtifactKind::Classifier, 100, 2, vec!["0".into(), "1".into()], 128)
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let saved = save_artifact(&dir.path().join("svm"), &sample_metadata(), &[1, 2, 3, 4]).unwrap();
        assert_eq!(saved, dir.path().join("svm.tar.gz"));

        let (meta, payload) = load_artifact(&dir.path().join("svm"), ArtifactKind::Classifier).unwrap();
        assert_eq!(meta, sample_metadata_with_time(&meta));
        assert_eq!(payload, vec![1, 2, 3, 4]);
        assert_eq!(load_metadata(&saved).unwrap().kind, ArtifactKind::Classifier);
    }

    fn sample_metadata_with_time(loaded: &ArtifactMetadata) -> ArtifactMetadata {
        ArtifactMetadata {
            trained_at: loaded.trained_at.clone(),
            ..sample_metadata()
        }
    }

    #[test]
    fn test_missing_artifact_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_artifact(&dir.path().join("nothing.tar.gz"), ArtifactKind::Reducer).unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactMissing { .. }));
    }

    #[test]
    fn test_wrong_kind_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_artifact(&dir.path().join("svm.tar.gz"), &sample_metadata(), &[0]).unwrap();
        let err = load_artifact(&path, ArtifactKind::Reducer).unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactKind { .. }));
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.tar.gz");
        std::fs::write(&path, b"definitely not gzip").unwrap();
        let err = load_artifact(&path, ArtifactKind::Classifier).unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactCorrupt { .. }));
    }
}
