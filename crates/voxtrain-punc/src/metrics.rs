//! Precision / recall / F1 reporting for punctuation tags.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::{PuncError, Result};

/// Scores of one class, or of an averaged row.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClassScores {
    /// Precision.
    pub precision: f64,
    /// Recall.
    pub recall: f64,
    /// F1 score.
    pub f1: f64,
    /// Number of gold labels.
    pub support: usize,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn harmonic(p: f64, r: f64) -> f64 {
    if p + r == 0.0 {
        0.0
    } else {
        2.0 * p * r / (p + r)
    }
}

fn check_lengths(labels: &[i32], preds: &[i32]) -> Result<()> {
    if labels.len() != preds.len() {
        return Err(PuncError::Metric(format!(
            "{} labels but {} predictions",
            labels.len(),
            preds.len()
        )));
    }
    Ok(())
}

/// Scores of `class`, treating it as the positive label.
pub fn class_scores(labels: &[i32], preds: &[i32], class: i32) -> ClassScores {
    let mut tp = 0;
    let mut predicted = 0;
    let mut support = 0;
    for (&l, &p) in labels.iter().zip(preds) {
        if p == class {
            predicted += 1;
        }
        if l == class {
            support += 1;
            if p == class {
                tp += 1;
            }
        }
    }
    let precision = ratio(tp, predicted);
    let recall = ratio(tp, support);
    ClassScores {
        precision,
        recall,
        f1: harmonic(precision, recall),
        support,
    }
}

fn present_classes(labels: &[i32], preds: &[i32]) -> BTreeSet<i32> {
    labels.iter().chain(preds).copied().collect()
}

/// Macro F1 over every class seen in `labels` or `preds`.
pub fn f1_macro(labels: &[i32], preds: &[i32]) -> Result<f64> {
    check_lengths(labels, preds)?;
    let classes = present_classes(labels, preds);
    if classes.is_empty() {
        return Ok(0.0);
    }
    let total: f64 = classes
        .iter()
        .map(|&c| class_scores(labels, preds, c).f1)
        .sum();
    Ok(total / classes.len() as f64)
}

/// Per-class report with accuracy and averaged rows.
#[derive(Debug, Clone)]
pub struct ClassificationReport {
    /// `(name, scores)` per class, in class id order.
    pub classes: Vec<(String, ClassScores)>,
    /// Fraction of exact matches.
    pub accuracy: f64,
    /// Unweighted mean over classes.
    pub macro_avg: ClassScores,
    /// Support-weighted mean over classes.
    pub weighted_avg: ClassScores,
}

impl ClassificationReport {
    /// Build a report.
    ///
    /// Classes are the ids present in `labels` or `preds`. `target_names[id]`
    /// names a class when available; otherwise the id is used.
    pub fn new(labels: &[i32], preds: &[i32], target_names: &[String]) -> Result<Self> {
        check_lengths(labels, preds)?;
        if labels.is_empty() {
            return Err(PuncError::Metric("no labels to report on".into()));
        }

        let classes: Vec<(String, ClassScores)> = present_classes(labels, preds)
            .into_iter()
            .map(|c| {
                let name = usize::try_from(c)
                    .ok()
                    .and_then(|i| target_names.get(i))
                    .map(|n| display_name(n))
                    .unwrap_or_else(|| c.to_string());
                (name, class_scores(labels, preds, c))
            })
            .collect();

        let correct = labels.iter().zip(preds).filter(|(l, p)| l == p).count();
        let total = labels.len();
        let n = classes.len() as f64;

        let mut macro_avg = ClassScores {
            support: total,
            ..Default::default()
        };
        let mut weighted_avg = macro_avg;
        for (_, s) in &classes {
            macro_avg.precision += s.precision / n;
            macro_avg.recall += s.recall / n;
            macro_avg.f1 += s.f1 / n;
            let w = s.support as f64 / total as f64;
            weighted_avg.precision += s.precision * w;
            weighted_avg.recall += s.recall * w;
            weighted_avg.f1 += s.f1 * w;
        }

        Ok(Self {
            classes,
            accuracy: ratio(correct, total),
            macro_avg,
            weighted_avg,
        })
    }

    fn total_support(&self) -> usize {
        self.macro_avg.support
    }
}

// The blank class is a single space, which would vanish in a table.
fn display_name(name: &str) -> String {
    if name.trim().is_empty() {
        "<blank>".to_string()
    } else {
        name.to_string()
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .classes
            .iter()
            .map(|(name, _)| name.chars().count())
            .chain(std::iter::once("weighted avg".len()))
            .max()
            .unwrap_or(12);

        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        writeln!(f)?;
        for (name, s) in &self.classes {
            writeln!(
                f,
                "{:>width$} {:>9.4} {:>9.4} {:>9.4} {:>9}",
                name, s.precision, s.recall, s.f1, s.support
            )?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9.4} {:>9}",
            "accuracy",
            "",
            "",
            self.accuracy,
            self.total_support()
        )?;
        for (name, s) in [("macro avg", &self.macro_avg), ("weighted avg", &self.weighted_avg)] {
            writeln!(
                f,
                "{:>width$} {:>9.4} {:>9.4} {:>9.4} {:>9}",
                name, s.precision, s.recall, s.f1, s.support
            )?;
        }
        Ok(())
    }
}

/// Punctuation classes scored by [`evaluation`], with their ids.
pub const EVALUATED_PUNCTUATION: [(&str, i32); 3] = [("COMMA", 1), ("PERIOD", 2), ("QUESTION", 3)];

/// Precision / recall / F1 table over COMMA, PERIOD and QUESTION.
#[derive(Debug, Clone)]
pub struct PuncEvaluation {
    /// `(name, scores)` per evaluated punctuation.
    pub columns: Vec<(&'static str, ClassScores)>,
    /// Mean over the evaluated columns.
    pub overall: ClassScores,
}

/// Score the three main punctuation classes and their macro average.
pub fn evaluation(labels: &[i32], preds: &[i32]) -> Result<PuncEvaluation> {
    check_lengths(labels, preds)?;
    let columns: Vec<(&'static str, ClassScores)> = EVALUATED_PUNCTUATION
        .iter()
        .map(|&(name, id)| (name, class_scores(labels, preds, id)))
        .collect();

    let n = columns.len() as f64;
    let mut overall = ClassScores::default();
    for (_, s) in &columns {
        overall.precision += s.precision / n;
        overall.recall += s.recall / n;
        overall.f1 += s.f1 / n;
        overall.support += s.support;
    }
    Ok(PuncEvaluation { columns, overall })
}

impl fmt::Display for PuncEvaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<10}", "")?;
        for (name, _) in &self.columns {
            write!(f, "{:>10}", name)?;
        }
        writeln!(f, "{:>10}", "OVERALL")?;

        let rows: [(&str, fn(&ClassScores) -> f64); 3] = [
            ("Precision", |s| s.precision),
            ("Recall", |s| s.recall),
            ("F1-Score", |s| s.f1),
        ];
        for (label, get) in rows {
            write!(f, "{:<10}", label)?;
            for (_, s) in &self.columns {
                write!(f, "{:>10.6}", get(s))?;
            }
            writeln!(f, "{:>10.6}", get(&self.overall))?;
        }
        Ok(())
    }
}
