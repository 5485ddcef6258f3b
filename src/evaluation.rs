use serde::Serialize;

use crate::dataset::group_by_era;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValidationMetrics {
    pub samples: usize,
    pub eras: usize,
    pub mean_corr: f64,
    pub std_corr: f64,
    pub sharpe: f64,
    pub overall_corr: f64,
}

pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.len() < 2 {
        return 0.0;
    }
    let n = a.len() as f64;
    let ma = a.iter().sum::<f64>() / n;
    let mb = b.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for (x, y) in a.iter().zip(b) {
        cov += (x - ma) * (y - mb);
        va += (x - ma).powi(2);
        vb += (y - mb).powi(2);
    }
    let den = (va * vb).sqrt();
    if den <= 1e-12 { 0.0 } else { cov / den }
}

pub fn spearman(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    pearson(&average_ranks(a), &average_ranks(b))
}

/// 1-based ranks; tied values share the mean of their positions.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&i, &j| values[i].total_cmp(&values[j]));
    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < idx.len() {
        let mut end = start + 1;
        while end < idx.len() && values[idx[end]] == values[idx[start]] {
            end += 1;
        }
        let rank = (start + end + 1) as f64 / 2.0;
        for &i in &idx[start..end] {
            ranks[i] = rank;
        }
        start = end;
    }
    ranks
}

/// Spearman correlation per era, summarised the way tournament scoring
/// reports it.
pub fn evaluate_by_era(predictions: &[f64], targets: &[f64], eras: &[String]) -> ValidationMetrics {
    let empty = ValidationMetrics {
        samples: 0,
        eras: 0,
        mean_corr: 0.0,
        std_corr: 0.0,
        sharpe: 0.0,
        overall_corr: 0.0,
    };
    if predictions.is_empty()
        || predictions.len() != targets.len()
        || predictions.len() != eras.len()
    {
        return empty;
    }

    let mut per_era = Vec::new();
    for (_, rows) in group_by_era(eras) {
        if rows.len() < 2 {
            continue;
        }
        let p: Vec<f64> = rows.iter().map(|&i| predictions[i]).collect();
        let t: Vec<f64> = rows.iter().map(|&i| targets[i]).collect();
        per_era.push(spearman(&p, &t));
    }
    if per_era.is_empty() {
        return ValidationMetrics {
            samples: predictions.len(),
            overall_corr: spearman(predictions, targets),
            ..empty
        };
    }

    let n = per_era.len() as f64;
    let mean = per_era.iter().sum::<f64>() / n;
    let std = if per_era.len() > 1 {
        (per_era.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        0.0
    };
    ValidationMetrics {
        samples: predictions.len(),
        eras: per_era.len(),
        mean_corr: mean,
        std_corr: std,
        sharpe: if std > 1e-12 { mean / std } else { 0.0 },
        overall_corr: spearman(predictions, targets),
    }
}
