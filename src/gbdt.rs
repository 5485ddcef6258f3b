//! Histogram gradient-boosted regression trees.
//!
//! Trees grow leaf-wise: every round the leaf with the largest loss
//! reduction is split until the leaf budget is used up. Feature values are
//! bucketed once up front; NaN and `-inf` land in bin 0 and therefore
//! follow the left branch of every split, during training and prediction
//! alike.

use anyhow::{Result, anyhow};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::FeatureMatrix;
use crate::error::PipelineError;

const MAX_VALUE_BINS: usize = 255;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbdtParams {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub num_leaves: usize,
    #[serde(default)]
    pub max_depth: Option<usize>,
    pub min_data_in_leaf: usize,
    pub min_sum_hessian_in_leaf: f64,
    pub lambda_l2: f64,
    pub min_gain_to_split: f64,
    pub max_bin: usize,
    pub bin_sample_count: usize,
    pub seed: u64,
}

impl Default for GbdtParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            learning_rate: 0.05,
            num_leaves: 31,
            max_depth: None,
            min_data_in_leaf: 20,
            min_sum_hessian_in_leaf: 1e-3,
            lambda_l2: 0.0,
            min_gain_to_split: 0.0,
            max_bin: 255,
            bin_sample_count: 200_000,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        gain: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn predict_row(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    let v = row[*feature];
                    idx = if v.is_nan() || v <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    pub fn num_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbdtRegressor {
    params: GbdtParams,
    n_features: usize,
    init_score: f64,
    trees: Vec<Tree>,
}

impl GbdtRegressor {
    pub fn fit(params: GbdtParams, x: &FeatureMatrix, y: &[f64]) -> Result<Self> {
        if x.rows() != y.len() {
            return Err(anyhow!(PipelineError::Shape(format!(
                "{} feature rows but {} targets",
                x.rows(),
                y.len()
            ))));
        }
        if x.rows() == 0 {
            return Err(anyhow!(PipelineError::EmptyTrainingSet));
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(anyhow!("targets must be finite"));
        }

        let n = x.rows();
        let data = BinnedData::build(x, &params);
        let init_score = y.iter().sum::<f64>() / n as f64;

        let mut preds = vec![init_score; n];
        let mut grad = vec![0.0; n];
        let hess = vec![1.0; n];
        let mut trees = Vec::with_capacity(params.n_estimators);

        for iteration in 0..params.n_estimators {
            grad.par_iter_mut()
                .zip(preds.par_iter())
                .zip(y.par_iter())
                .for_each(|((g, p), t)| *g = p - t);

            let grown = grow_tree(&params, &data, &grad, &hess);
            for (rows, value) in &grown.leaves {
                for &r in rows {
                    preds[r as usize] += value;
                }
            }
            trees.push(grown.tree);

            if (iteration + 1) % 10 == 0 {
                let mse = preds
                    .iter()
                    .zip(y)
                    .map(|(p, t)| (p - t).powi(2))
                    .sum::<f64>()
                    / n as f64;
                debug!(iteration = iteration + 1, rmse = mse.sqrt(), "boosting");
            }
        }

        Ok(Self {
            params,
            n_features: x.cols(),
            init_score,
            trees,
        })
    }

    pub fn predict(&self, x: &FeatureMatrix) -> Result<Vec<f64>> {
        if x.cols() != self.n_features {
            return Err(anyhow!(PipelineError::Shape(format!(
                "model expects {} features, got {}",
                self.n_features,
                x.cols()
            ))));
        }
        Ok((0..x.rows())
            .into_par_iter()
            .map(|r| self.predict_row(x.row(r)))
            .collect())
    }

    pub fn predict_row(&self, row: &[f64]) -> f64 {
        self.init_score + self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
    }

    /// Total split gain per feature.
    pub fn feature_importance(&self) -> Vec<f64> {
        let mut out = vec![0.0; self.n_features];
        for tree in &self.trees {
            for node in &tree.nodes {
                if let Node::Split { feature, gain, .. } = node {
                    out[*feature] += gain;
                }
            }
        }
        out
    }

    pub fn params(&self) -> &GbdtParams {
        &self.params
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn trees(&self) -> &[Tree] {
        &self.trees
    }

    pub fn init_score(&self) -> f64 {
        self.init_score
    }
}

#[derive(Debug, Clone)]
struct BinMapper {
    // Upper bound of each value bin; the last one is +inf.
    upper_bounds: Vec<f64>,
}

impl BinMapper {
    fn fit(sample: &[f64], max_bins: usize) -> Self {
        let max_bins = max_bins.clamp(1, MAX_VALUE_BINS);
        let mut vals: Vec<f64> = sample
            .iter()
            .copied()
            .filter(|v| v.is_finite() && *v > f64::MIN)
            .collect();
        vals.sort_by(|a, b| a.total_cmp(b));

        let mut distinct: Vec<f64> = Vec::new();
        for v in &vals {
            if distinct.last().is_none_or(|last| last != v) {
                distinct.push(*v);
            }
        }

        let mut bounds = Vec::new();
        if distinct.len() <= max_bins {
            for w in distinct.windows(2) {
                bounds.push(w[0] + (w[1] - w[0]) / 2.0);
            }
        } else {
            let n = vals.len();
            for k in 1..max_bins {
                let cut = vals[k * n / max_bins];
                if bounds.last().is_none_or(|last| *last < cut) {
                    bounds.push(cut);
                }
            }
        }
        bounds.push(f64::INFINITY);
        Self {
            upper_bounds: bounds,
        }
    }

    fn bin(&self, v: f64) -> u8 {
        // Mirrors `Tree::predict_row`, where bin 0 splits at `f64::MIN`.
        if v.is_nan() || v <= f64::MIN {
            return 0;
        }
        (1 + self.upper_bounds.partition_point(|ub| *ub < v)) as u8
    }

    fn num_bins(&self) -> usize {
        self.upper_bounds.len() + 1
    }

    /// Raw-value threshold equivalent to "bin <= `bin`".
    fn threshold(&self, bin: usize) -> f64 {
        if bin == 0 {
            f64::MIN
        } else {
            self.upper_bounds[bin - 1]
        }
    }
}

struct BinnedData {
    mappers: Vec<BinMapper>,
    bins: Vec<Vec<u8>>,
    num_bins: Vec<usize>,
}

impl BinnedData {
    fn build(x: &FeatureMatrix, params: &GbdtParams) -> Self {
        let n = x.rows();
        let sample_rows: Vec<usize> = if n > params.bin_sample_count.max(1) {
            let mut rng = StdRng::seed_from_u64(params.seed);
            let mut idx =
                rand::seq::index::sample(&mut rng, n, params.bin_sample_count.max(1)).into_vec();
            idx.sort_unstable();
            idx
        } else {
            (0..n).collect()
        };

        let per_feature: Vec<(BinMapper, Vec<u8>)> = (0..x.cols())
            .into_par_iter()
            .map(|f| {
                let sample: Vec<f64> = sample_rows.iter().map(|&r| x.row(r)[f]).collect();
                let mapper = BinMapper::fit(&sample, params.max_bin);
                let bins = (0..n).map(|r| mapper.bin(x.row(r)[f])).collect();
                (mapper, bins)
            })
            .collect();

        let mut mappers = Vec::with_capacity(per_feature.len());
        let mut bins = Vec::with_capacity(per_feature.len());
        for (mapper, col) in per_feature {
            mappers.push(mapper);
            bins.push(col);
        }
        let num_bins = mappers.iter().map(BinMapper::num_bins).collect();
        Self {
            mappers,
            bins,
            num_bins,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BinStat {
    grad: f64,
    hess: f64,
    count: u32,
}

type Histogram = Vec<Vec<BinStat>>;

fn build_histogram(data: &BinnedData, rows: &[u32], grad: &[f64], hess: &[f64]) -> Histogram {
    data.bins
        .par_iter()
        .zip(data.num_bins.par_iter())
        .map(|(col, &nb)| {
            let mut h = vec![BinStat::default(); nb];
            for &r in rows {
                let r = r as usize;
                let s = &mut h[col[r] as usize];
                s.grad += grad[r];
                s.hess += hess[r];
                s.count += 1;
            }
            h
        })
        .collect()
}

fn subtract_histogram(parent: &Histogram, child: &Histogram) -> Histogram {
    parent
        .iter()
        .zip(child)
        .map(|(p, c)| {
            p.iter()
                .zip(c)
                .map(|(a, b)| BinStat {
                    grad: a.grad - b.grad,
                    hess: a.hess - b.hess,
                    count: a.count - b.count,
                })
                .collect()
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    feature: usize,
    bin: usize,
    gain: f64,
    left_grad: f64,
    left_hess: f64,
}

struct LeafState {
    node: usize,
    rows: Vec<u32>,
    hist: Histogram,
    grad: f64,
    hess: f64,
    depth: usize,
    split: Option<SplitCandidate>,
}

struct GrownTree {
    tree: Tree,
    leaves: Vec<(Vec<u32>, f64)>,
}

fn leaf_score(grad: f64, hess: f64, l2: f64) -> f64 {
    grad * grad / (hess + l2)
}

fn find_best_split(
    params: &GbdtParams,
    hist: &Histogram,
    total_grad: f64,
    total_hess: f64,
    total_count: u32,
) -> Option<SplitCandidate> {
    let min_data = params.min_data_in_leaf.max(1) as u32;
    if total_count < 2 * min_data {
        return None;
    }
    let l2 = params.lambda_l2;
    let parent = leaf_score(total_grad, total_hess, l2);

    let per_feature: Vec<Option<SplitCandidate>> = hist
        .par_iter()
        .enumerate()
        .map(|(feature, h)| {
            let mut best: Option<SplitCandidate> = None;
            let (mut gl, mut hl, mut cl) = (0.0_f64, 0.0_f64, 0u32);
            for (bin, stat) in h.iter().enumerate().take(h.len().saturating_sub(1)) {
                gl += stat.grad;
                hl += stat.hess;
                cl += stat.count;
                if cl < min_data {
                    continue;
                }
                if total_count - cl < min_data {
                    break;
                }
                let hr = total_hess - hl;
                if hl < params.min_sum_hessian_in_leaf || hr < params.min_sum_hessian_in_leaf {
                    continue;
                }
                let gain = leaf_score(gl, hl, l2) + leaf_score(total_grad - gl, hr, l2) - parent;
                if gain > params.min_gain_to_split && best.is_none_or(|b| gain > b.gain) {
                    best = Some(SplitCandidate {
                        feature,
                        bin,
                        gain,
                        left_grad: gl,
                        left_hess: hl,
                    });
                }
            }
            best
        })
        .collect();

    // Lowest feature index wins ties so fits are reproducible.
    per_feature
        .into_iter()
        .flatten()
        .fold(None, |acc: Option<SplitCandidate>, c| match acc {
            Some(a) if a.gain >= c.gain => Some(a),
            _ => Some(c),
        })
}

fn grow_tree(params: &GbdtParams, data: &BinnedData, grad: &[f64], hess: &[f64]) -> GrownTree {
    let n = grad.len();
    let depth_ok = |depth: usize| params.max_depth.is_none_or(|d| depth < d);

    let root_rows: Vec<u32> = (0..n as u32).collect();
    let root_hist = build_histogram(data, &root_rows, grad, hess);
    let root_grad = grad.iter().sum::<f64>();
    let root_hess = hess.iter().sum::<f64>();
    let root_split = if depth_ok(0) {
        find_best_split(params, &root_hist, root_grad, root_hess, n as u32)
    } else {
        None
    };

    let mut nodes = vec![Node::Leaf { value: 0.0 }];
    let mut leaves = vec![LeafState {
        node: 0,
        rows: root_rows,
        hist: root_hist,
        grad: root_grad,
        hess: root_hess,
        depth: 0,
        split: root_split,
    }];

    while leaves.len() < params.num_leaves.max(1) {
        let best = leaves
            .iter()
            .enumerate()
            .filter_map(|(i, l)| l.split.map(|s| (i, s.gain)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i);
        let Some(best) = best else {
            break;
        };
        let leaf = leaves.swap_remove(best);
        let Some(split) = leaf.split else {
            break;
        };

        let col = &data.bins[split.feature];
        let (left_rows, right_rows): (Vec<u32>, Vec<u32>) = leaf
            .rows
            .into_iter()
            .partition(|&r| (col[r as usize] as usize) <= split.bin);

        let (left_hist, right_hist) = if left_rows.len() <= right_rows.len() {
            let small = build_histogram(data, &left_rows, grad, hess);
            let large = subtract_histogram(&leaf.hist, &small);
            (small, large)
        } else {
            let small = build_histogram(data, &right_rows, grad, hess);
            let large = subtract_histogram(&leaf.hist, &small);
            (large, small)
        };

        let left_node = nodes.len();
        nodes.push(Node::Leaf { value: 0.0 });
        let right_node = nodes.len();
        nodes.push(Node::Leaf { value: 0.0 });
        nodes[leaf.node] = Node::Split {
            feature: split.feature,
            threshold: data.mappers[split.feature].threshold(split.bin),
            gain: split.gain,
            left: left_node,
            right: right_node,
        };

        let depth = leaf.depth + 1;
        let children = [
            (left_node, left_rows, left_hist, split.left_grad, split.left_hess),
            (
                right_node,
                right_rows,
                right_hist,
                leaf.grad - split.left_grad,
                leaf.hess - split.left_hess,
            ),
        ];
        for (node, rows, hist, g, h) in children {
            let split = if depth_ok(depth) {
                find_best_split(params, &hist, g, h, rows.len() as u32)
            } else {
                None
            };
            leaves.push(LeafState {
                node,
                rows,
                // A leaf that cannot split never needs its histogram again.
                hist: if split.is_some() { hist } else { Vec::new() },
                grad: g,
                hess: h,
                depth,
                split,
            });
        }
    }

    let mut out = Vec::with_capacity(leaves.len());
    for leaf in leaves {
        let value = -leaf.grad / (leaf.hess + params.lambda_l2) * params.learning_rate;
        nodes[leaf.node] = Node::Leaf { value };
        out.push((leaf.rows, value));
    }

    GrownTree {
        tree: Tree { nodes },
        leaves: out,
    }
}
