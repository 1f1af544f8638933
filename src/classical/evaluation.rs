//! 評価: 分類レポート・混同行列・層化 k-fold 交差検証

use std::collections::BTreeMap;
use std::fmt;

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::classical::svm::SvmConfig;
use crate::error::{PipelineError, Result, Stage};
use crate::types::Label;

/// 1クラス分の指標
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub label: Label,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// 平均値（macro / weighted）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AveragedMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub classes: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: AveragedMetrics,
    pub weighted_avg: AveragedMetrics,
    pub total: usize,
}

fn safe_div(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

fn check_lengths(y_true: &[Label], y_pred: &[Label]) -> Result<()> {
    if y_true.len() != y_pred.len() {
        return Err(PipelineError::invalid_input(
            Stage::Evaluation,
            format!("{} true labels but {} predictions", y_true.len(), y_pred.len()),
        ));
    }
    if y_true.is_empty() {
        return Err(PipelineError::invalid_input(Stage::Evaluation, "no samples to evaluate"));
    }
    Ok(())
}

impl ClassificationReport {
    /// 0 除算になる指標は 0 とする
    pub fn new(y_true: &[Label], y_pred: &[Label]) -> Result<Self> {
        let matrix = ConfusionMatrix::new(y_true, y_pred)?;
        let total = y_true.len();

        let classes: Vec<ClassMetrics> = matrix
            .labels
            .iter()
            .enumerate()
            .map(|(i, &label)| {
                let tp = matrix.counts[[i, i]] as f64;
                let predicted = matrix.counts.column(i).sum() as f64;
                let support = matrix.counts.row(i).sum();
                let precision = safe_div(tp, predicted);
                let recall = safe_div(tp, support as f64);
                let f1 = safe_div(2.0 * precision * recall, precision + recall);
                ClassMetrics {
                    label,
                    precision,
                    recall,
                    f1,
                    support,
                }
            })
            .collect();

        let n_classes = classes.len() as f64;
        let macro_avg = AveragedMetrics {
            precision: classes.iter().map(|c| c.precision).sum::<f64>() / n_classes,
            recall: classes.iter().map(|c| c.recall).sum::<f64>() / n_classes,
            f1: classes.iter().map(|c| c.f1).sum::<f64>() / n_classes,
        };
        let weight = |f: fn(&ClassMetrics) -> f64| {
            classes.iter().map(|c| f(c) * c.support as f64).sum::<f64>() / total as f64
        };
        let weighted_avg = AveragedMetrics {
            precision: weight(|c| c.precision),
            recall: weight(|c| c.recall),
            f1: weight(|c| c.f1),
        };

        Ok(Self {
            accuracy: matrix.trace() as f64 / total as f64,
            classes,
            macro_avg,
            weighted_avg,
            total,
        })
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>12} {:>10} {:>9} {:>9} {:>9}", "", "precision", "recall", "f1-score", "support")?;
        writeln!(f)?;
        for c in &self.classes {
            writeln!(
                f,
                "{:>12} {:>10.2} {:>9.2} {:>9.2} {:>9}",
                c.label, c.precision, c.recall, c.f1, c.support
            )?;
        }
        writeln!(f)?;
        writeln!(f, "{:>12} {:>10} {:>9} {:>9.2} {:>9}", "accuracy", "", "", self.accuracy, self.total)?;
        for (name, avg) in [("macro avg", &self.macro_avg), ("weighted avg", &self.weighted_avg)] {
            writeln!(
                f,
                "{:>12} {:>10.2} {:>9.2} {:>9.2} {:>9}",
                name, avg.precision, avg.recall, avg.f1, self.total
            )?;
        }
        Ok(())
    }
}

/// 行 = 正解ラベル、列 = 予測ラベル
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    /// 正解と予測に現れたラベルの和集合（昇順）
    pub labels: Vec<Label>,
    pub counts: Array2<usize>,
}

impl ConfusionMatrix {
    pub fn new(y_true: &[Label], y_pred: &[Label]) -> Result<Self> {
        check_lengths(y_true, y_pred)?;

        let mut labels: Vec<Label> = y_true.iter().chain(y_pred.iter()).copied().collect();
        labels.sort_unstable();
        labels.dedup();
        let index: BTreeMap<Label, usize> = labels.iter().enumerate().map(|(i, &l)| (l, i)).collect();

        let mut counts = Array2::<usize>::zeros((labels.len(), labels.len()));
        for (t, p) in y_true.iter().zip(y_pred.iter()) {
            counts[[index[t], index[p]]] += 1;
        }
        Ok(Self { labels, counts })
    }

    /// 正解数（対角和）
    pub fn trace(&self) -> usize {
        self.counts.diag().sum()
    }
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>9}", "true\\pred")?;
        for label in &self.labels {
            write!(f, " {:>6}", label)?;
        }
        writeln!(f)?;
        for (label, row) in self.labels.iter().zip(self.counts.axis_iter(Axis(0))) {
            write!(f, "{:>9}", label)?;
            for v in row.iter() {
                write!(f, " {:>6}", v)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// 交差検証の結果（観察用。モデル選択には使わない）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidation {
    pub fold_scores: Vec<f64>,
    pub mean: f64,
}

impl fmt::Display for CrossValidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scores: Vec<String> = self.fold_scores.iter().map(|s| format!("{:.4}", s)).collect();
        write!(f, "fold scores: [{}], mean accuracy: {:.4}", scores.join(", "), self.mean)
    }
}

/// 層化 k-fold（シャッフルなし）のテスト側フォールド番号を返す
///
/// ラベルを安定ソートした列を k 個おきに振り分けた件数を各クラスの各フォールドへ割り当て、
/// クラス内では元の順序のまま先頭から詰める。
pub fn stratified_folds(labels: &[Label], k: usize) -> Result<Vec<usize>> {
    if k < 2 {
        return Err(PipelineError::invalid_config(
            Stage::Evaluation,
            format!("at least 2 folds are required, got {}", k),
        ));
    }
    if labels.len() < k {
        return Err(PipelineError::invalid_input(
            Stage::Evaluation,
            format!("{} samples cannot be split into {} folds", labels.len(), k),
        ));
    }

    let mut sorted = labels.to_vec();
    sorted.sort();

    // allocation[(fold, label)] = 件数
    let mut allocation: BTreeMap<(usize, Label), usize> = BTreeMap::new();
    for (pos, &label) in sorted.iter().enumerate() {
        *allocation.entry((pos % k, label)).or_insert(0) += 1;
    }

    let mut assignment = vec![0usize; labels.len()];
    let mut classes = sorted;
    classes.dedup();
    for label in classes {
        let mut folds = (0..k).flat_map(|fold| {
            let n = allocation.get(&(fold, label)).copied().unwrap_or(0);
            std::iter::repeat(fold).take(n)
        });
        for (i, _) in labels.iter().enumerate().filter(|(_, l)| **l == label) {
            if let Some(fold) = folds.next() {
                assignment[i] = fold;
            }
        }
    }
    Ok(assignment)
}

/// 未学習の設定から各フォールドで新しい分類器を学習し、正解率を集計する
pub fn cross_val_score(config: &SvmConfig, x: &Array2<f64>, y: &[Label], k: usize) -> Result<CrossValidation> {
    if x.nrows() != y.len() {
        return Err(PipelineError::invalid_input(
            Stage::Evaluation,
            format!("{} feature rows but {} labels", x.nrows(), y.len()),
        ));
    }
    let assignment = stratified_folds(y, k)?;

    let mut fold_scores = Vec::with_capacity(k);
    for fold in 0..k {
        let train: Vec<usize> = (0..y.len()).filter(|&i| assignment[i] != fold).collect();
        let test: Vec<usize> = (0..y.len()).filter(|&i| assignment[i] == fold).collect();

        let x_train = x.select(Axis(0), &train);
        let y_train: Vec<Label> = train.iter().map(|&i| y[i]).collect();
        let x_test = x.select(Axis(0), &test);
        let y_test: Vec<Label> = test.iter().map(|&i| y[i]).collect();

        let model = config.fit(&x_train, &y_train)?;
        let predicted = model.predict(&x_test)?;
        let correct = predicted.iter().zip(y_test.iter()).filter(|(p, t)| p == t).count();
        let score = safe_div(correct as f64, y_test.len() as f64);
        tracing::debug!("[cv] fold {}/{}: {:.4} ({} / {})", fold + 1, k, score, correct, y_test.len());
        fold_scores.push(score);
    }

    let mean = fold_scores.iter().sum::<f64>() / fold_scores.len() as f64;
    Ok(CrossValidation { fold_scores, mean })
}

/// 学習1回分の評価結果まとめ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    pub report: ClassificationReport,
    pub confusion: ConfusionMatrix,
    pub cross_validation: Option<CrossValidation>,
}

impl MetricReport {
    pub fn new(y_true: &[Label], y_pred: &[Label], cross_validation: Option<CrossValidation>) -> Result<Self> {
        Ok(Self {
            report: ClassificationReport::new(y_true, y_pred)?,
            confusion: ConfusionMatrix::new(y_true, y_pred)?,
            cross_validation,
        })
    }
}

impl fmt::Display for MetricReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Classification report:")?;
        write!(f, "{}", self.report)?;
        writeln!(f)?;
        writeln!(f, "Confusion matrix:")?;
        write!(f, "{}", self.confusion)?;
        if let Some(cv) = &self.cross_validation {
            writeln!(f)?;
            writeln!(f, "Cross-validation: {}", cv)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_matches_hand_computed_values() {
        let y_true = [0, 0, 0, 1, 1, 1, 1, 1];
        let y_pred = [0, 0, 1, 1, 1, 1, 0, 1];
        let report = ClassificationReport::new(&y_true, &y_pred).unwrap();

        let c0 = &report.classes[0];
        assert!((c0.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((c0.recall - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(c0.support, 3);

        let c1 = &report.classes[1];
        assert!((c1.precision - 0.8).abs() < 1e-12);
        assert!((c1.recall - 0.8).abs() < 1e-12);
        assert_eq!(c1.support, 5);

        assert!((report.accuracy - 0.75).abs() < 1e-12);
        assert!((report.macro_avg.f1 - (2.0 / 3.0 + 0.8) / 2.0).abs() < 1e-12);
        assert!((report.weighted_avg.recall - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_zero_division_yields_zero() {
        // クラス 1 は一度も予測されない
        let report = ClassificationReport::new(&[0, 1, 1], &[0, 0, 0]).unwrap();
        assert_eq!(report.classes[1].precision, 0.0);
        assert_eq!(report.classes[1].f1, 0.0);
        assert!(report.to_string().contains("weighted avg"));
    }

    #[test]
    fn test_confusion_rows_are_true_labels() {
        let m = ConfusionMatrix::new(&[0, 0, 1, 1, 1], &[0, 1, 1, 1, 0]).unwrap();
        assert_eq!(m.labels, vec![0, 1]);
        assert_eq!(m.counts, ndarray::arr2(&[[1, 1], [1, 2]]));
        assert_eq!(m.trace(), 3);
    }

    #[test]
    fn test_confusion_includes_labels_only_seen_in_predictions() {
        let m = ConfusionMatrix::new(&[0, 0], &[0, 2]).unwrap();
        assert_eq!(m.labels, vec![0, 2]);
        assert_eq!(m.counts, ndarray::arr2(&[[1, 1], [0, 0]]));
    }

    #[test]
    fn test_mismatched_lengths_are_rejected() {
        assert!(ConfusionMatrix::new(&[0, 1], &[0]).is_err());
        assert!(ClassificationReport::new(&[], &[]).is_err());
    }

    #[test]
    fn test_stratified_folds_preserve_class_proportions() {
        let labels: Vec<Label> = (0..50).map(|i| if i < 30 { 0 } else { 1 }).collect();
        let folds = stratified_folds(&labels, 5).unwrap();
        for fold in 0..5 {
            let zeros = (0..50).filter(|&i| folds[i] == fold && labels[i] == 0).count();
            let ones = (0..50).filter(|&i| folds[i] == fold && labels[i] == 1).count();
            assert_eq!(zeros, 6);
            assert_eq!(ones, 4);
        }
        // シャッフルなし: クラス内で元の順序のまま詰める
        assert_eq!(&folds[..6], &[0; 6]);
    }

    #[test]
    fn test_too_many_folds_is_rejected() {
        assert!(stratified_folds(&[0, 1, 0], 5).is_err());
        assert!(stratified_folds(&[0, 1, 0], 1).is_err());
    }

    #[test]
    fn test_cross_validation_on_separable_data() {
        let n = 40;
        let x = Array2::from_shape_fn((n, 2), |(i, j)| {
            let center = if i % 2 == 0 { -1.0 } else { 1.0 };
            center + 0.01 * ((i * 7 + j * 3) % 11) as f64
        });
        let y: Vec<Label> = (0..n).map(|i| i % 2).collect();
        let cv = cross_val_score(&SvmConfig::default(), &x, &y, 5).unwrap();
        assert_eq!(cv.fold_scores.len(), 5);
        assert!(cv.fold_scores.iter().all(|s| (*s - 1.0).abs() < 1e-12));
        assert!((cv.mean - 1.0).abs() < 1e-12);
    }
}
