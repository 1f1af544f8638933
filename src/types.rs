use serde::{Deserialize, Serialize};

/// クラスID（二値タスクでは 0/1）
pub type Label = usize;

/// BreastMNIST のクラス名（ラベル順）
pub const BREAST_CLASS_NAMES: [&str; 2] = ["malignant", "normal/benign"];

/// BloodMNIST のクラス名（ラベル順）
pub const BLOOD_CLASS_NAMES: [&str; 8] = [
    "basophil",
    "eosinophil",
    "erythroblast",
    "immature granulocyte",
    "lymphocyte",
    "monocyte",
    "neutrophil",
    "platelet",
];

/// 対象タスク
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    /// 乳腺画像の二値分類（HOG + PCA + SVM）
    Binary,
    /// 血球画像の8クラス分類（CNN）
    Multiclass,
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Binary => write!(f, "binary (breast)"),
            Task::Multiclass => write!(f, "multi-class (blood)"),
        }
    }
}

impl Task {
    pub fn class_names(&self) -> &'static [&'static str] {
        match self {
            Task::Binary => &BREAST_CLASS_NAMES,
            Task::Multiclass => &BLOOD_CLASS_NAMES,
        }
    }
}
