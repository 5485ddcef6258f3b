use anyhow::{Result, anyhow};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::dataset::FeatureMatrix;
use crate::error::PipelineError;

const MAX_DLOSS: f64 = 1e12;

/// Running per-feature mean and variance that can absorb data in batches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    n_samples_seen: u64,
    mean: Vec<f64>,
    var: Vec<f64>,
}

impl StandardScaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partial_fit(&mut self, x: &FeatureMatrix) -> Result<()> {
        ensure_finite(x)?;
        if x.rows() == 0 {
            return Ok(());
        }
        if self.n_samples_seen > 0 && x.cols() != self.mean.len() {
            return Err(anyhow!(PipelineError::Shape(format!(
                "scaler fitted on {} features, got {}",
                self.mean.len(),
                x.cols()
            ))));
        }

        let m = x.rows() as f64;
        let mut batch_mean = vec![0.0; x.cols()];
        for r in 0..x.rows() {
            for (acc, v) in batch_mean.iter_mut().zip(x.row(r)) {
                *acc += v;
            }
        }
        for v in &mut batch_mean {
            *v /= m;
        }
        let mut batch_ssd = vec![0.0; x.cols()];
        for r in 0..x.rows() {
            for ((acc, v), mu) in batch_ssd.iter_mut().zip(x.row(r)).zip(&batch_mean) {
                *acc += (v - mu).powi(2);
            }
        }

        if self.n_samples_seen == 0 {
            self.mean = batch_mean;
            self.var = batch_ssd.into_iter().map(|s| s / m).collect();
            self.n_samples_seen = x.rows() as u64;
            return Ok(());
        }

        // Pairwise merge of (n, mean, M2) summaries.
        let n = self.n_samples_seen as f64;
        let total = n + m;
        for j in 0..self.mean.len() {
            let delta = batch_mean[j] - self.mean[j];
            let m2 = self.var[j] * n + batch_ssd[j] + delta * delta * n * m / total;
            self.mean[j] += delta * m / total;
            self.var[j] = m2 / total;
        }
        self.n_samples_seen += x.rows() as u64;
        Ok(())
    }

    pub fn transform(&self, x: &FeatureMatrix) -> Result<FeatureMatrix> {
        if self.n_samples_seen == 0 {
            return Err(anyhow!("scaler has not been fitted"));
        }
        if x.cols() != self.mean.len() {
            return Err(anyhow!(PipelineError::Shape(format!(
                "scaler fitted on {} features, got {}",
                self.mean.len(),
                x.cols()
            ))));
        }
        ensure_finite(x)?;
        let scale = self.scale();
        let mut out = x.clone();
        for r in 0..out.rows() {
            for ((v, mu), s) in out.row_mut(r).iter_mut().zip(&self.mean).zip(&scale) {
                *v = (*v - mu) / s;
            }
        }
        Ok(out)
    }

    /// Standard deviations, with near-constant features mapped to 1.
    pub fn scale(&self) -> Vec<f64> {
        self.var
            .iter()
            .map(|v| {
                let s = v.sqrt();
                if s < 10.0 * f64::EPSILON { 1.0 } else { s }
            })
            .collect()
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn var(&self) -> &[f64] {
        &self.var
    }

    pub fn n_samples_seen(&self) -> u64 {
        self.n_samples_seen
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Loss {
    SquaredError,
    Huber { epsilon: f64 },
}

impl Loss {
    /// Derivative of the loss with respect to the prediction.
    fn dloss(self, y: f64, p: f64) -> f64 {
        let r = p - y;
        match self {
            Loss::SquaredError => r,
            Loss::Huber { epsilon } => {
                if r.abs() <= epsilon {
                    r
                } else if r > epsilon {
                    epsilon
                } else {
                    -epsilon
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRate {
    Constant,
    InvScaling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdParams {
    pub loss: Loss,
    pub alpha: f64,
    pub learning_rate: LearningRate,
    pub eta0: f64,
    pub power_t: f64,
    pub fit_intercept: bool,
    pub shuffle: bool,
    pub seed: u64,
}

impl Default for SgdParams {
    fn default() -> Self {
        Self {
            loss: Loss::Huber { epsilon: 0.1 },
            alpha: 1e-4,
            learning_rate: LearningRate::InvScaling,
            eta0: 0.01,
            power_t: 0.25,
            fit_intercept: true,
            shuffle: true,
            seed: 42,
        }
    }
}

/// Linear model fitted by plain SGD with an L2 penalty. Each
/// `partial_fit` call is a single pass; the step counter carries over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdRegressor {
    params: SgdParams,
    coef: Vec<f64>,
    intercept: f64,
    t: f64,
}

impl SgdRegressor {
    pub fn new(params: SgdParams) -> Self {
        Self {
            params,
            coef: Vec::new(),
            intercept: 0.0,
            t: 1.0,
        }
    }

    pub fn partial_fit(&mut self, x: &FeatureMatrix, y: &[f64]) -> Result<()> {
        if x.rows() != y.len() {
            return Err(anyhow!(PipelineError::Shape(format!(
                "{} feature rows but {} targets",
                x.rows(),
                y.len()
            ))));
        }
        ensure_finite(x)?;
        if y.iter().any(|v| !v.is_finite()) {
            return Err(anyhow!("targets must be finite"));
        }
        if self.coef.is_empty() {
            self.coef = vec![0.0; x.cols()];
        } else if self.coef.len() != x.cols() {
            return Err(anyhow!(PipelineError::Shape(format!(
                "model fitted on {} features, got {}",
                self.coef.len(),
                x.cols()
            ))));
        }

        let mut order: Vec<usize> = (0..x.rows()).collect();
        if self.params.shuffle {
            let mut rng = StdRng::seed_from_u64(self.params.seed);
            order.shuffle(&mut rng);
        }

        let p = &self.params;
        for i in order {
            let row = x.row(i);
            let eta = match p.learning_rate {
                LearningRate::Constant => p.eta0,
                LearningRate::InvScaling => p.eta0 / self.t.powf(p.power_t),
            };
            let pred = dot(&self.coef, row) + self.intercept;
            let dloss = p.loss.dloss(y[i], pred).clamp(-MAX_DLOSS, MAX_DLOSS);
            let update = -eta * dloss;

            if p.alpha > 0.0 {
                let decay = (1.0 - eta * p.alpha).max(0.0);
                for w in &mut self.coef {
                    *w *= decay;
                }
            }
            if update != 0.0 {
                for (w, v) in self.coef.iter_mut().zip(row) {
                    *w += update * v;
                }
                if p.fit_intercept {
                    self.intercept += update;
                }
            }
            self.t += 1.0;
        }
        Ok(())
    }

    pub fn predict(&self, x: &FeatureMatrix) -> Result<Vec<f64>> {
        if self.coef.is_empty() {
            return Err(anyhow!("model has not been fitted"));
        }
        if x.cols() != self.coef.len() {
            return Err(anyhow!(PipelineError::Shape(format!(
                "model fitted on {} features, got {}",
                self.coef.len(),
                x.cols()
            ))));
        }
        Ok((0..x.rows())
            .map(|r| dot(&self.coef, x.row(r)) + self.intercept)
            .collect())
    }

    pub fn coef(&self) -> &[f64] {
        &self.coef
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn steps(&self) -> u64 {
        (self.t - 1.0) as u64
    }
}

/// `(y - mean) / (std + 1e-8)` with the population standard deviation.
pub fn zscore(y: &[f64]) -> Vec<f64> {
    if y.is_empty() {
        return Vec::new();
    }
    let n = y.len() as f64;
    let mean = y.iter().sum::<f64>() / n;
    let std = (y.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    y.iter().map(|v| (v - mean) / (std + 1e-8)).collect()
}

fn ensure_finite(x: &FeatureMatrix) -> Result<()> {
    match x.first_non_finite_column() {
        Some(col) => Err(anyhow!(PipelineError::NonFinite(col))),
        None => Ok(()),
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
