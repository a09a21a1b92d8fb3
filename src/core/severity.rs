//! Severity model inference and bias correction.
//!
//! A pretrained regression ensemble maps six predictor bands to the
//! continuous Composite Burn Index. Training happens offline; the model
//! arrives as a JSON artifact carrying its provenance, and inference is a
//! pure per-pixel map over the burn-metric grids. Predictions are kept at
//! two-decimal precision, and a two-piece linear stretch calibrated
//! against field plots produces the bias-corrected surface.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use log::{debug, info, warn};
use ndarray::{Array2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::burn_metrics::BurnMetrics;
use crate::types::{BandGrid, ClassGrid, Crs, FireError, FireResult, GridSpec};

/// Predictor bands in training order. Feature indices inside a model
/// artifact refer to positions in this list.
pub const MODEL_FEATURES: [&str; 6] = ["def", "lat", "rbr", "dmirbi", "dndvi", "post_mirbi"];

/// Valid range of the Composite Burn Index.
pub const CBI_MIN: f32 = 0.0;
pub const CBI_MAX: f32 = 3.0;

const BIAS_PIVOT: f32 = 1.5;
const BIAS_SLOPE_LOW: f32 = 1.3;
const BIAS_SLOPE_HIGH: f32 = 1.175;

/// Severity regression contract. Implementations must be stateless per
/// call so rows can be predicted in parallel.
pub trait SeverityModel: Send + Sync {
    /// Predict CBI from one pixel's feature vector, ordered as
    /// [`MODEL_FEATURES`].
    fn predict(&self, features: &[f32; 6]) -> f32;
}

/// Training provenance carried by a model artifact. Logged when the
/// model is loaded and otherwise never consulted during inference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Number of trees in the ensemble.
    pub estimators: usize,
    /// Minimum leaf population used when the trees were grown.
    pub min_leaf_population: usize,
    /// RNG seed the training run was fixed to.
    pub seed: u64,
    /// Number of field observations in the training table.
    pub training_rows: usize,
}

/// Minimum leaf population the training recipe derives from its own row
/// count: a seventy-fifth of the table, split across the six folds.
pub fn min_leaf_population(training_rows: usize) -> usize {
    (training_rows as f64 / 75.0 / 6.0).round() as usize
}

/// One node of a regression tree. Split nodes route a feature value
/// less than or equal to the threshold to the left child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeNode {
    Leaf {
        value: f32,
    },
    Split {
        feature: usize,
        threshold: f32,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

impl TreeNode {
    fn evaluate(&self, features: &[f32; 6]) -> f32 {
        match self {
            TreeNode::Leaf { value } => *value,
            TreeNode::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if features[*feature] <= *threshold {
                    left.evaluate(features)
                } else {
                    right.evaluate(features)
                }
            }
        }
    }

    fn check_feature_indices(&self) -> FireResult<()> {
        match self {
            TreeNode::Leaf { .. } => Ok(()),
            TreeNode::Split {
                feature,
                left,
                right,
                ..
            } => {
                if *feature >= MODEL_FEATURES.len() {
                    return Err(FireError::InvalidInput(format!(
                        "model split references feature {} but only {} features exist",
                        feature,
                        MODEL_FEATURES.len()
                    )));
                }
                left.check_feature_indices()?;
                right.check_feature_indices()
            }
        }
    }
}

/// Regression ensemble: the prediction is the mean over all tree
/// outputs. Artifacts are produced by the offline training pipeline
/// (500 trees, fixed seed) and shipped alongside the crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionForest {
    pub metadata: ModelMetadata,
    pub trees: Vec<TreeNode>,
}

impl RegressionForest {
    /// Parse a model from its JSON text and validate the tree structure.
    pub fn from_json(json: &str) -> FireResult<Self> {
        let forest: RegressionForest = serde_json::from_str(json)?;
        forest.validate()?;
        Ok(forest)
    }

    /// Load a model artifact from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> FireResult<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let forest: RegressionForest = serde_json::from_reader(reader)?;
        forest.validate()?;
        Ok(forest)
    }

    fn validate(&self) -> FireResult<()> {
        if self.trees.is_empty() {
            return Err(FireError::InvalidInput(
                "model artifact contains no trees".into(),
            ));
        }
        for tree in &self.trees {
            tree.check_feature_indices()?;
        }
        if self.metadata.estimators != self.trees.len() {
            warn!(
                "model metadata declares {} estimators but artifact holds {} trees",
                self.metadata.estimators,
                self.trees.len()
            );
        }
        info!(
            "loaded severity model: {} trees, min leaf {}, seed {}, {} training rows",
            self.trees.len(),
            self.metadata.min_leaf_population,
            self.metadata.seed,
            self.metadata.training_rows
        );
        Ok(())
    }
}

impl SeverityModel for RegressionForest {
    fn predict(&self, features: &[f32; 6]) -> f32 {
        let sum: f64 = self
            .trees
            .iter()
            .map(|tree| tree.evaluate(features) as f64)
            .sum();
        (sum / self.trees.len() as f64) as f32
    }
}

/// Drop everything past the second decimal place.
pub fn truncate_two_decimals(v: f32) -> f32 {
    (v * 100.0).floor() / 100.0
}

/// Two-piece linear bias correction. Values at or below the pivot are
/// stretched with the low-severity slope, values above with the
/// high-severity slope, then clamped to the CBI range and truncated to
/// two decimals. NaN passes through.
pub fn bias_correct(v: f32) -> f32 {
    let stretched = if v <= BIAS_PIVOT {
        (v - BIAS_PIVOT) * BIAS_SLOPE_LOW + BIAS_PIVOT
    } else {
        (v - BIAS_PIVOT) * BIAS_SLOPE_HIGH + BIAS_PIVOT
    };
    truncate_two_decimals(stretched.clamp(CBI_MIN, CBI_MAX))
}

/// Modeled severity for one fire year. `cbi` is the raw two-decimal
/// prediction without range clamping; `cbi_bc` is the bias-corrected
/// surface clamped to [0, 3].
#[derive(Debug, Clone)]
pub struct SeveritySurface {
    pub year: i32,
    pub cbi: BandGrid,
    pub cbi_bc: BandGrid,
}

impl SeveritySurface {
    pub fn shape(&self) -> (usize, usize) {
        self.cbi.dim()
    }
}

/// Runs a severity model across burn-metric grids and masks pixels the
/// model cannot be trusted on.
pub struct SeverityEstimator<M: SeverityModel> {
    model: M,
}

impl<M: SeverityModel> SeverityEstimator<M> {
    pub fn new(model: M) -> Self {
        SeverityEstimator { model }
    }

    /// Predict CBI and bias-corrected CBI for one fire year.
    ///
    /// A pixel is predicted only when every model input is unmasked and
    /// the water datamask reports land (value 1); a masked NBR on either
    /// side of the fire propagates into the delta features and so masks
    /// the prediction. All other pixels come back as NaN in both bands.
    ///
    /// The latitude feature is read off the grid's y axis, so the grid
    /// must be in geographic coordinates.
    pub fn estimate(
        &self,
        year: i32,
        metrics: &BurnMetrics,
        deficit: &BandGrid,
        water_datamask: &ClassGrid,
        grid: &GridSpec,
    ) -> FireResult<SeveritySurface> {
        if let Crs::Projected { epsg } = grid.crs {
            return Err(FireError::InvalidInput(format!(
                "severity inference needs a geographic grid for the latitude feature, got EPSG:{epsg}"
            )));
        }
        let (rows, cols) = grid.shape();
        if metrics.shape() != (rows, cols) {
            return Err(FireError::ShapeMismatch {
                expected: (rows, cols),
                actual: metrics.shape(),
            });
        }
        if deficit.dim() != (rows, cols) {
            return Err(FireError::ShapeMismatch {
                expected: (rows, cols),
                actual: deficit.dim(),
            });
        }
        if water_datamask.dim() != (rows, cols) {
            return Err(FireError::ShapeMismatch {
                expected: (rows, cols),
                actual: water_datamask.dim(),
            });
        }
        debug!("severity inference for {year} over {rows}x{cols} grid");

        let mut cbi = Array2::from_elem((rows, cols), f32::NAN);
        let mut cbi_bc = Array2::from_elem((rows, cols), f32::NAN);

        cbi.axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(cbi_bc.axis_iter_mut(Axis(0)).into_par_iter())
            .enumerate()
            .for_each(|(row, (mut cbi_row, mut bc_row))| {
                let lat = grid.transform.xy_at(row, 0).1.round() as f32;
                for col in 0..cols {
                    if water_datamask[[row, col]] != 1 {
                        continue;
                    }
                    let features = [
                        deficit[[row, col]].trunc(),
                        lat,
                        metrics.rbr[[row, col]],
                        metrics.dmirbi[[row, col]],
                        metrics.dndvi[[row, col]],
                        metrics.post_mirbi[[row, col]],
                    ];
                    if features.iter().any(|v| !v.is_finite()) {
                        continue;
                    }
                    let prediction = truncate_two_decimals(self.model.predict(&features));
                    cbi_row[col] = prediction;
                    bc_row[col] = bias_correct(prediction);
                }
            });

        Ok(SeveritySurface { year, cbi, cbi_bc })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn leaf(value: f32) -> TreeNode {
        TreeNode::Leaf { value }
    }

    fn split(feature: usize, threshold: f32, left: TreeNode, right: TreeNode) -> TreeNode {
        TreeNode::Split {
            feature,
            threshold,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn forest(trees: Vec<TreeNode>) -> RegressionForest {
        let metadata = ModelMetadata {
            estimators: trees.len(),
            min_leaf_population: 6,
            seed: 123,
            training_rows: 2700,
        };
        RegressionForest { metadata, trees }
    }

    fn uniform_metrics(rows: usize, cols: usize, value: f32) -> BurnMetrics {
        let band = || Array2::from_elem((rows, cols), value);
        BurnMetrics {
            dnbr: band(),
            rbr: band(),
            rdnbr: band(),
            dndvi: band(),
            devi: band(),
            dndmi: band(),
            dmirbi: band(),
            post_nbr: band(),
            post_mirbi: band(),
        }
    }

    fn geographic_grid(rows: usize, cols: usize) -> GridSpec {
        GridSpec {
            transform: GeoTransform {
                top_left_x: -120.0,
                pixel_width: 2.0,
                top_left_y: 40.0,
                pixel_height: -2.0,
            },
            rows,
            cols,
            crs: Crs::Geographic,
        }
    }

    #[test]
    fn truncation_keeps_two_decimals() {
        assert_abs_diff_eq!(truncate_two_decimals(2.379), 2.37);
        assert_abs_diff_eq!(truncate_two_decimals(0.1), 0.1);
        assert_abs_diff_eq!(truncate_two_decimals(-1.234), -1.24);
        assert!(truncate_two_decimals(f32::NAN).is_nan());
    }

    #[test]
    fn bias_correction_stretches_around_the_pivot() {
        assert_abs_diff_eq!(bias_correct(1.0), 0.85);
        assert_abs_diff_eq!(bias_correct(2.0), 2.08);
        assert_abs_diff_eq!(bias_correct(1.5), 1.5);
    }

    #[test]
    fn bias_correction_clamps_to_the_cbi_range() {
        assert_abs_diff_eq!(bias_correct(3.0), 3.0);
        assert_abs_diff_eq!(bias_correct(0.0), 0.0);
        for step in 0..=300 {
            let v = step as f32 / 100.0;
            let out = bias_correct(v);
            assert!((CBI_MIN..=CBI_MAX).contains(&out), "{v} mapped to {out}");
        }
        assert!(bias_correct(f32::NAN).is_nan());
    }

    #[test]
    fn leaf_population_follows_the_training_recipe() {
        assert_eq!(min_leaf_population(2700), 6);
        assert_eq!(min_leaf_population(5000), 11);
        assert_eq!(min_leaf_population(0), 0);
    }

    #[test]
    fn forest_prediction_is_the_mean_of_its_trees() {
        let model = forest(vec![leaf(1.0), leaf(2.0)]);
        assert_abs_diff_eq!(model.predict(&[0.0; 6]), 1.5);
    }

    #[test]
    fn splits_route_on_the_threshold_inclusively() {
        let model = forest(vec![split(2, 100.5, leaf(0.5), leaf(2.5))]);
        assert_abs_diff_eq!(model.predict(&[0.0, 0.0, 100.5, 0.0, 0.0, 0.0]), 0.5);
        assert_abs_diff_eq!(model.predict(&[0.0, 0.0, 100.6, 0.0, 0.0, 0.0]), 2.5);
    }

    #[test]
    fn artifacts_round_trip_through_json() {
        let model = forest(vec![leaf(1.0), split(2, 100.5, leaf(0.5), leaf(2.0))]);
        let json = serde_json::to_string(&model).unwrap();
        let reloaded = RegressionForest::from_json(&json).unwrap();
        assert_eq!(reloaded.trees, model.trees);
        assert_abs_diff_eq!(
            reloaded.predict(&[0.0, 0.0, 50.0, 0.0, 0.0, 0.0]),
            0.75
        );
    }

    #[test]
    fn artifacts_use_a_tagged_node_encoding() {
        let json = r#"{
            "metadata": {"estimators": 1, "min_leaf_population": 6, "seed": 123, "training_rows": 2700},
            "trees": [
                {"kind": "split", "feature": 2, "threshold": 100.5,
                 "left": {"kind": "leaf", "value": 0.5},
                 "right": {"kind": "leaf", "value": 2.0}}
            ]
        }"#;
        let model = RegressionForest::from_json(json).unwrap();
        assert_abs_diff_eq!(model.predict(&[0.0, 0.0, 200.0, 0.0, 0.0, 0.0]), 2.0);
    }

    #[test]
    fn out_of_range_feature_indices_are_rejected() {
        let model = forest(vec![split(6, 0.0, leaf(0.0), leaf(1.0))]);
        let json = serde_json::to_string(&model).unwrap();
        assert!(matches!(
            RegressionForest::from_json(&json),
            Err(FireError::InvalidInput(_))
        ));
    }

    #[test]
    fn empty_artifacts_are_rejected() {
        let json = r#"{
            "metadata": {"estimators": 0, "min_leaf_population": 0, "seed": 123, "training_rows": 0},
            "trees": []
        }"#;
        assert!(matches!(
            RegressionForest::from_json(json),
            Err(FireError::InvalidInput(_))
        ));
    }

    #[test]
    fn estimation_masks_water_and_masked_metrics() {
        let mut metrics = uniform_metrics(2, 2, 10.0);
        metrics.rbr[[0, 1]] = f32::NAN;
        let deficit = Array2::from_elem((2, 2), 117.9);
        let mut water = Array2::from_elem((2, 2), 1u8);
        water[[1, 0]] = 0;

        let estimator = SeverityEstimator::new(forest(vec![leaf(2.5)]));
        let surface = estimator
            .estimate(2020, &metrics, &deficit, &water, &geographic_grid(2, 2))
            .unwrap();

        assert_eq!(surface.year, 2020);
        assert_abs_diff_eq!(surface.cbi[[0, 0]], 2.5);
        assert_abs_diff_eq!(surface.cbi_bc[[0, 0]], 2.67);
        assert!(surface.cbi[[0, 1]].is_nan());
        assert!(surface.cbi_bc[[0, 1]].is_nan());
        assert!(surface.cbi[[1, 0]].is_nan());
        assert!(surface.cbi_bc[[1, 0]].is_nan());
        assert_abs_diff_eq!(surface.cbi[[1, 1]], 2.5);
    }

    #[test]
    fn deficit_is_truncated_toward_zero() {
        let metrics = uniform_metrics(1, 1, 10.0);
        let deficit = Array2::from_elem((1, 1), -3.7);
        let water = Array2::from_elem((1, 1), 1u8);

        let model = forest(vec![split(0, -3.5, leaf(1.0), leaf(2.0))]);
        let surface = SeverityEstimator::new(model)
            .estimate(2020, &metrics, &deficit, &water, &geographic_grid(1, 1))
            .unwrap();

        assert_abs_diff_eq!(surface.cbi[[0, 0]], 2.0);
    }

    #[test]
    fn latitude_feature_comes_from_the_row_center() {
        // Rows sit at y = 39 and y = 37 on the 2-degree test grid.
        let metrics = uniform_metrics(2, 1, 10.0);
        let deficit = Array2::from_elem((2, 1), 100.0);
        let water = Array2::from_elem((2, 1), 1u8);

        let model = forest(vec![split(1, 38.0, leaf(1.0), leaf(2.0))]);
        let surface = SeverityEstimator::new(model)
            .estimate(2020, &metrics, &deficit, &water, &geographic_grid(2, 1))
            .unwrap();

        assert_abs_diff_eq!(surface.cbi[[0, 0]], 2.0);
        assert_abs_diff_eq!(surface.cbi[[1, 0]], 1.0);
    }

    #[test]
    fn projected_grids_are_refused() {
        let metrics = uniform_metrics(1, 1, 10.0);
        let deficit = Array2::zeros((1, 1));
        let water = Array2::from_elem((1, 1), 1u8);
        let mut grid = geographic_grid(1, 1);
        grid.crs = Crs::Projected { epsg: 5070 };

        let result = SeverityEstimator::new(forest(vec![leaf(1.0)]))
            .estimate(2020, &metrics, &deficit, &water, &grid);
        assert!(matches!(result, Err(FireError::InvalidInput(_))));
    }
}
