pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, ArtifactPaths, BinarySettings, DatasetPaths, DeviceType, FeatureSettings, TrainingSettings};
pub use model_metadata::{ArtifactKind, ArtifactMetadata};
pub use model_storage::{load_artifact, load_metadata, print_metadata_info, save_artifact};
