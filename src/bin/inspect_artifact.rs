//! 保存済みアーティファクトのメタデータ表示ツール

use medscan_lib::model::{load_metadata, print_metadata_info};
use std::path::PathBuf;

fn main() {
    let paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        eprintln!("usage: inspect_artifact <artifact.tar.gz>...");
        std::process::exit(2);
    }

    let mut failed = false;
    for path in &paths {
        match load_metadata(path) {
            Ok(metadata) => {
                println!("{}", path.display());
                print_metadata_info(&metadata);
            }
            Err(e) => {
                eprintln!("✗ {}: {}", path.display(), e);
                failed = true;
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
}
