//! Ecological classification of severity surfaces.
//!
//! Crosses bias-corrected severity with the historical fire regime to
//! separate fire burning as its landscape evolved with it from fire
//! burning out of regime. Severity tiers are cut inside the prior-year
//! forest mask, weighted by per-pixel ground area, and exposed as named
//! layers ready for zonal reduction.

use log::debug;
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

use crate::core::severity::SeveritySurface;
use crate::types::{BandGrid, ClassGrid, CodeGrid, FireError, FireResult, GridSpec};

/// Reclassification table from raw fire-regime-group codes to the
/// 3-class regime mask: low/mixed regimes collapse to 1, stand
/// replacement stays 2, non-vegetated fill codes collapse to 3.
pub const FIRE_REGIME_TABLE: [(i32, u8); 10] = [
    (1, 1),
    (2, 2),
    (3, 1),
    (4, 1),
    (5, 1),
    (111, 3),
    (112, 3),
    (131, 3),
    (132, 3),
    (133, 3),
];

/// Low/mixed-severity historical regime.
pub const REGIME_LOW_MIXED: u8 = 1;
/// Stand-replacement historical regime.
pub const REGIME_REPLACEMENT: u8 = 2;

const LCMAP_TREE_COVER: i32 = 4;
const LCMS_FOREST: i32 = 1;

/// Reclassify integer codes through a lookup table. Codes absent from
/// the table map to `default`.
pub fn remap_codes(codes: &CodeGrid, table: &[(i32, u8)], default: u8) -> ClassGrid {
    let mut out = Array2::from_elem(codes.dim(), default);
    Zip::from(&mut out).and(codes).par_for_each(|o, &code| {
        if let Some(&(_, class)) = table.iter().find(|&&(c, _)| c == code) {
            *o = class;
        }
    });
    out
}

/// Collapse raw fire-regime-group codes into the 3-class regime mask.
pub fn fire_regime_classes(codes: &CodeGrid) -> ClassGrid {
    remap_codes(codes, &FIRE_REGIME_TABLE, 0)
}

/// Which land-cover agreement builds the forest mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForestMaskStrategy {
    /// Both land-cover products must agree the pixel is forest.
    #[default]
    Conservative,
    /// The second product alone decides; used on the per-event path.
    SingleProduct,
}

/// Binary forest mask for one year. 1 where forest, 0 elsewhere.
pub fn forest_mask(
    strategy: ForestMaskStrategy,
    lcmap: &CodeGrid,
    lcms: &CodeGrid,
) -> FireResult<ClassGrid> {
    if lcmap.dim() != lcms.dim() {
        return Err(FireError::ShapeMismatch {
            expected: lcmap.dim(),
            actual: lcms.dim(),
        });
    }
    let mut out = Array2::zeros(lcms.dim());
    match strategy {
        ForestMaskStrategy::Conservative => {
            Zip::from(&mut out)
                .and(lcmap)
                .and(lcms)
                .par_for_each(|o, &a, &b| {
                    *o = u8::from(a == LCMAP_TREE_COVER && b == LCMS_FOREST);
                });
        }
        ForestMaskStrategy::SingleProduct => {
            Zip::from(&mut out).and(lcms).par_for_each(|o, &b| {
                *o = u8::from(b == LCMS_FOREST);
            });
        }
    }
    Ok(out)
}

/// Severity tier cuts and forest strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierParams {
    /// Exclusive upper bound of the unburned tier.
    pub unburned_max: f32,
    /// Inclusive lower bound of the high-severity tier.
    pub high_min: f32,
    pub forest_strategy: ForestMaskStrategy,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        ClassifierParams {
            unburned_max: 0.1,
            high_min: 2.25,
            forest_strategy: ForestMaskStrategy::default(),
        }
    }
}

/// Classification layer names in output-column order.
pub const LAYER_NAMES: [&str; 12] = [
    "lower_good_fire",
    "high_good_fire",
    "lower_regime_high_sev",
    "replace_regime_low_sev",
    "lower_regime_unburned",
    "replace_regime_unburned",
    "sev_low_moderate",
    "sev_high",
    "sev_unburned",
    "sev_any_burned",
    "forest_area",
    "total_area",
];

/// Area-weighted classification layers for one fire year.
///
/// Every layer except `total_area` holds the pixel's ground area in m²
/// where its condition holds and NaN elsewhere, so a zonal sum yields
/// the condition's area directly. `total_area` is unmasked everywhere;
/// its regional sum is the region's full area.
#[derive(Debug, Clone)]
pub struct GoodFireLayers {
    pub year: i32,
    pub lower_good_fire: BandGrid,
    pub high_good_fire: BandGrid,
    pub lower_regime_high_sev: BandGrid,
    pub replace_regime_low_sev: BandGrid,
    pub lower_regime_unburned: BandGrid,
    pub replace_regime_unburned: BandGrid,
    pub sev_low_moderate: BandGrid,
    pub sev_high: BandGrid,
    pub sev_unburned: BandGrid,
    pub sev_any_burned: BandGrid,
    pub forest_area: BandGrid,
    pub total_area: BandGrid,
}

impl GoodFireLayers {
    /// Layers paired with their names, in [`LAYER_NAMES`] order.
    pub fn layers(&self) -> [(&'static str, &BandGrid); 12] {
        [
            ("lower_good_fire", &self.lower_good_fire),
            ("high_good_fire", &self.high_good_fire),
            ("lower_regime_high_sev", &self.lower_regime_high_sev),
            ("replace_regime_low_sev", &self.replace_regime_low_sev),
            ("lower_regime_unburned", &self.lower_regime_unburned),
            ("replace_regime_unburned", &self.replace_regime_unburned),
            ("sev_low_moderate", &self.sev_low_moderate),
            ("sev_high", &self.sev_high),
            ("sev_unburned", &self.sev_unburned),
            ("sev_any_burned", &self.sev_any_burned),
            ("forest_area", &self.forest_area),
            ("total_area", &self.total_area),
        ]
    }

    pub fn shape(&self) -> (usize, usize) {
        self.total_area.dim()
    }
}

/// 0/1 view of an area-weighted layer.
pub fn binary_layer(layer: &BandGrid) -> ClassGrid {
    layer.mapv(|v| u8::from(v.is_finite()))
}

/// Crosses a severity surface with regime and forest context.
pub struct EcologicalClassifier {
    params: ClassifierParams,
}

impl EcologicalClassifier {
    pub fn new(params: ClassifierParams) -> Self {
        EcologicalClassifier { params }
    }

    /// Build the yearly layer set from the bias-corrected surface, the
    /// regime mask, and the forest mask for the year before the fire.
    /// Fire alters land cover, so the forest mask always lags a year.
    pub fn classify(
        &self,
        surface: &SeveritySurface,
        regime: &ClassGrid,
        prior_forest: &ClassGrid,
        grid: &GridSpec,
    ) -> FireResult<GoodFireLayers> {
        let (rows, cols) = grid.shape();
        if surface.shape() != (rows, cols) {
            return Err(FireError::ShapeMismatch {
                expected: (rows, cols),
                actual: surface.shape(),
            });
        }
        if regime.dim() != (rows, cols) {
            return Err(FireError::ShapeMismatch {
                expected: (rows, cols),
                actual: regime.dim(),
            });
        }
        if prior_forest.dim() != (rows, cols) {
            return Err(FireError::ShapeMismatch {
                expected: (rows, cols),
                actual: prior_forest.dim(),
            });
        }
        debug!(
            "classifying year {} over {rows}x{cols} grid",
            surface.year
        );

        let area = grid.pixel_area_grid();

        let mut cbi_forest = Array2::from_elem((rows, cols), f32::NAN);
        Zip::from(&mut cbi_forest)
            .and(&surface.cbi_bc)
            .and(prior_forest)
            .par_for_each(|o, &c, &f| {
                if f == 1 {
                    *o = c;
                }
            });

        let unburned_max = self.params.unburned_max;
        let high_min = self.params.high_min;
        let sev_low_moderate = tier_layer(&cbi_forest, &area, |c| c >= unburned_max && c < high_min);
        let sev_high = tier_layer(&cbi_forest, &area, |c| c >= high_min);
        let sev_any_burned = tier_layer(&cbi_forest, &area, |c| c >= unburned_max);
        let sev_unburned = tier_layer(&cbi_forest, &area, |c| c >= 0.0 && c < unburned_max);

        let lower_good_fire = crossed(&sev_low_moderate, regime, REGIME_LOW_MIXED);
        let high_good_fire = crossed(&sev_high, regime, REGIME_REPLACEMENT);
        let lower_regime_high_sev = crossed(&sev_high, regime, REGIME_LOW_MIXED);
        let replace_regime_low_sev = crossed(&sev_low_moderate, regime, REGIME_REPLACEMENT);
        let lower_regime_unburned = crossed(&sev_unburned, regime, REGIME_LOW_MIXED);
        let replace_regime_unburned = crossed(&sev_unburned, regime, REGIME_REPLACEMENT);

        let mut forest_area = Array2::from_elem((rows, cols), f32::NAN);
        Zip::from(&mut forest_area)
            .and(prior_forest)
            .and(&area)
            .par_for_each(|o, &f, &a| {
                if f == 1 {
                    *o = a;
                }
            });

        Ok(GoodFireLayers {
            year: surface.year,
            lower_good_fire,
            high_good_fire,
            lower_regime_high_sev,
            replace_regime_low_sev,
            lower_regime_unburned,
            replace_regime_unburned,
            sev_low_moderate,
            sev_high,
            sev_unburned,
            sev_any_burned,
            forest_area,
            total_area: area,
        })
    }
}

/// Area where the tier predicate holds on the forest-masked severity,
/// NaN elsewhere. NaN severity fails every predicate.
fn tier_layer<F>(cbi_forest: &BandGrid, area: &BandGrid, pred: F) -> BandGrid
where
    F: Fn(f32) -> bool + Sync + Send,
{
    let mut out = Array2::from_elem(cbi_forest.dim(), f32::NAN);
    Zip::from(&mut out)
        .and(cbi_forest)
        .and(area)
        .par_for_each(|o, &c, &a| {
            if pred(c) {
                *o = a;
            }
        });
    out
}

/// Restrict a tier layer to one regime class.
fn crossed(tier: &BandGrid, regime: &ClassGrid, class: u8) -> BandGrid {
    let mut out = Array2::from_elem(tier.dim(), f32::NAN);
    Zip::from(&mut out)
        .and(tier)
        .and(regime)
        .par_for_each(|o, &t, &r| {
            if r == class {
                *o = t;
            }
        });
    out
}

/// No-data in the flattened good-fire composite.
pub const FLAT_NODATA: u8 = 0;
/// Low/moderate severity inside a low/mixed regime.
pub const FLAT_LOWER_GOOD: u8 = 1;
/// High severity inside a replacement regime.
pub const FLAT_HIGH_GOOD: u8 = 2;
/// Severity out of regime in either direction.
pub const FLAT_BAD_FIRE: u8 = 3;

/// Collapse yearly layer sets into one categorical map. Each pixel
/// takes the strongest class it ever saw: bad fire over high-severity
/// good fire over low-severity good fire over background.
pub fn flatten_good_fire(years: &[GoodFireLayers]) -> FireResult<ClassGrid> {
    let first = years.first().ok_or_else(|| {
        FireError::InvalidInput("no yearly layers to flatten".into())
    })?;
    let (rows, cols) = first.shape();
    let mut flat: ClassGrid = Array2::zeros((rows, cols));
    for layers in years {
        if layers.shape() != (rows, cols) {
            return Err(FireError::ShapeMismatch {
                expected: (rows, cols),
                actual: layers.shape(),
            });
        }
        Zip::from(&mut flat)
            .and(&layers.lower_good_fire)
            .and(&layers.high_good_fire)
            .and(&layers.lower_regime_high_sev)
            .and(&layers.replace_regime_low_sev)
            .par_for_each(|f, &lg, &hg, &lrh, &rrl| {
                let class = if lrh.is_finite() || rrl.is_finite() {
                    FLAT_BAD_FIRE
                } else if hg.is_finite() {
                    FLAT_HIGH_GOOD
                } else if lg.is_finite() {
                    FLAT_LOWER_GOOD
                } else {
                    FLAT_NODATA
                };
                *f = (*f).max(class);
            });
    }
    Ok(flat)
}

/// Categorical severity raster from the bias-corrected surface:
/// 1 unburned, 2 low/moderate, 3 high, 0 where masked.
pub fn severity_classes(surface: &SeveritySurface, params: &ClassifierParams) -> ClassGrid {
    let unburned_max = params.unburned_max;
    let high_min = params.high_min;
    let mut out = Array2::zeros(surface.shape());
    Zip::from(&mut out).and(&surface.cbi_bc).par_for_each(|o, &c| {
        *o = if !c.is_finite() || c < 0.0 {
            0
        } else if c < unburned_max {
            1
        } else if c < high_min {
            2
        } else {
            3
        };
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Crs, GeoTransform};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn projected_grid(rows: usize, cols: usize) -> GridSpec {
        GridSpec {
            transform: GeoTransform {
                top_left_x: 0.0,
                pixel_width: 30.0,
                top_left_y: 0.0,
                pixel_height: -30.0,
            },
            rows,
            cols,
            crs: Crs::Projected { epsg: 5070 },
        }
    }

    fn surface(year: i32, cbi_bc: BandGrid) -> SeveritySurface {
        SeveritySurface {
            year,
            cbi: cbi_bc.clone(),
            cbi_bc,
        }
    }

    fn blank_layers(year: i32, rows: usize, cols: usize) -> GoodFireLayers {
        let masked = || Array2::from_elem((rows, cols), f32::NAN);
        GoodFireLayers {
            year,
            lower_good_fire: masked(),
            high_good_fire: masked(),
            lower_regime_high_sev: masked(),
            replace_regime_low_sev: masked(),
            lower_regime_unburned: masked(),
            replace_regime_unburned: masked(),
            sev_low_moderate: masked(),
            sev_high: masked(),
            sev_unburned: masked(),
            sev_any_burned: masked(),
            forest_area: masked(),
            total_area: Array2::from_elem((rows, cols), 900.0),
        }
    }

    #[test]
    fn regime_table_collapses_raw_codes() {
        let codes = array![[1, 2, 3, 4, 5], [111, 133, 999, 0, -5]];
        let classes = fire_regime_classes(&codes);
        assert_eq!(classes, array![[1u8, 2, 1, 1, 1], [3, 3, 0, 0, 0]]);
    }

    #[test]
    fn conservative_forest_requires_both_products() {
        let lcmap = array![[4, 4], [3, 3]];
        let lcms = array![[1, 2], [1, 2]];
        let conservative =
            forest_mask(ForestMaskStrategy::Conservative, &lcmap, &lcms).unwrap();
        assert_eq!(conservative, array![[1u8, 0], [0, 0]]);

        let single = forest_mask(ForestMaskStrategy::SingleProduct, &lcmap, &lcms).unwrap();
        assert_eq!(single, array![[1u8, 0], [1, 0]]);
    }

    #[test]
    fn forest_mask_rejects_mismatched_products() {
        let lcmap: CodeGrid = Array2::zeros((2, 2));
        let lcms: CodeGrid = Array2::zeros((2, 3));
        assert!(matches!(
            forest_mask(ForestMaskStrategy::Conservative, &lcmap, &lcms),
            Err(FireError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn severity_tiers_are_half_open() {
        let cbi = array![[0.05, 0.1, 2.24, 2.25]];
        let forest = Array2::from_elem((1, 4), 1u8);
        let regime = Array2::from_elem((1, 4), REGIME_LOW_MIXED);
        let grid = projected_grid(1, 4);

        let layers = EcologicalClassifier::new(ClassifierParams::default())
            .classify(&surface(2020, cbi), &regime, &forest, &grid)
            .unwrap();

        assert!(layers.sev_unburned[[0, 0]].is_finite());
        assert!(layers.sev_unburned[[0, 1]].is_nan());
        assert!(layers.sev_low_moderate[[0, 1]].is_finite());
        assert!(layers.sev_low_moderate[[0, 2]].is_finite());
        assert!(layers.sev_low_moderate[[0, 3]].is_nan());
        assert!(layers.sev_high[[0, 3]].is_finite());
        assert!(layers.sev_any_burned[[0, 0]].is_nan());
        assert!(layers.sev_any_burned[[0, 1]].is_finite());
        assert!(layers.sev_any_burned[[0, 3]].is_finite());
    }

    #[test]
    fn negative_severity_is_not_unburned() {
        let cbi = array![[-0.5]];
        let forest = Array2::from_elem((1, 1), 1u8);
        let regime = Array2::from_elem((1, 1), REGIME_LOW_MIXED);

        let layers = EcologicalClassifier::new(ClassifierParams::default())
            .classify(&surface(2020, cbi), &regime, &forest, &projected_grid(1, 1))
            .unwrap();

        assert!(layers.sev_unburned[[0, 0]].is_nan());
        assert!(layers.sev_low_moderate[[0, 0]].is_nan());
    }

    #[test]
    fn layers_carry_pixel_area_inside_the_forest() {
        let cbi = array![[1.0, 2.5], [2.5, 1.0]];
        let forest = array![[1u8, 1], [1, 0]];
        let regime = array![[1u8, 2], [3, 1]];
        let grid = projected_grid(2, 2);

        let layers = EcologicalClassifier::new(ClassifierParams::default())
            .classify(&surface(2020, cbi), &regime, &forest, &grid)
            .unwrap();

        assert_abs_diff_eq!(layers.lower_good_fire[[0, 0]], 900.0);
        assert_abs_diff_eq!(layers.high_good_fire[[0, 1]], 900.0);
        assert_abs_diff_eq!(layers.sev_high[[1, 0]], 900.0);
        assert!(layers.high_good_fire[[1, 0]].is_nan());
        assert!(layers.lower_regime_high_sev[[1, 0]].is_nan());

        // out of forest: every severity layer masked, total area untouched
        assert!(layers.sev_low_moderate[[1, 1]].is_nan());
        assert!(layers.forest_area[[1, 1]].is_nan());
        assert_abs_diff_eq!(layers.forest_area[[0, 0]], 900.0);
        for (_, layer) in layers.layers().iter().take(11) {
            assert!(layer[[1, 1]].is_nan());
        }
        assert_abs_diff_eq!(layers.total_area[[1, 1]], 900.0);

        assert_eq!(binary_layer(&layers.sev_high), array![[0u8, 1], [1, 0]]);
    }

    #[test]
    fn crossings_track_the_regime_of_each_tier() {
        let cbi = array![[2.5, 0.05]];
        let forest = Array2::from_elem((1, 2), 1u8);
        let regime = array![[REGIME_LOW_MIXED, REGIME_REPLACEMENT]];

        let layers = EcologicalClassifier::new(ClassifierParams::default())
            .classify(&surface(2020, cbi), &regime, &forest, &projected_grid(1, 2))
            .unwrap();

        assert!(layers.lower_regime_high_sev[[0, 0]].is_finite());
        assert!(layers.high_good_fire[[0, 0]].is_nan());
        assert!(layers.replace_regime_unburned[[0, 1]].is_finite());
        assert!(layers.lower_regime_unburned[[0, 1]].is_nan());
    }

    #[test]
    fn flatten_takes_the_strongest_class_across_years() {
        let mut y1 = blank_layers(2019, 1, 3);
        y1.lower_good_fire[[0, 0]] = 900.0;
        y1.high_good_fire[[0, 1]] = 900.0;

        let mut y2 = blank_layers(2020, 1, 3);
        y2.lower_regime_high_sev[[0, 0]] = 900.0;
        y2.lower_good_fire[[0, 2]] = 900.0;

        let flat = flatten_good_fire(&[y1, y2]).unwrap();
        assert_eq!(flat, array![[3u8, 2, 1]]);
    }

    #[test]
    fn flatten_rejects_empty_or_mismatched_input() {
        assert!(matches!(
            flatten_good_fire(&[]),
            Err(FireError::InvalidInput(_))
        ));
        let years = vec![blank_layers(2019, 1, 3), blank_layers(2020, 2, 3)];
        assert!(matches!(
            flatten_good_fire(&years),
            Err(FireError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn severity_class_raster_encodes_tiers() {
        let cbi = array![[f32::NAN, 0.05], [1.0, 2.9]];
        let classes = severity_classes(&surface(2020, cbi), &ClassifierParams::default());
        assert_eq!(classes, array![[0u8, 1], [2, 3]]);
    }
}
