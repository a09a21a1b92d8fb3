//! In-memory image/feature store.
//!
//! Stands in for the satellite-archive collaborator: scenes and ancillary
//! layers arrive already resampled to the shared analysis grid, and the
//! collection type supports the spatial/temporal filters the pipeline
//! needs (bounds, date range, day-of-year, attribute equality) plus the
//! first/mean/mosaic reductions. A production archive client would expose
//! the same surface.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use log::debug;
use ndarray::{Array2, Axis};
use ndarray::parallel::prelude::*;

use crate::types::{
    BandGrid, ClassGrid, CodeGrid, FireError, FireResult, GeoBounds, GridSpec, GrowingSeason,
    IndexComposite, IndexScene, RawScene, SensorGeneration,
};

/// Raw scene archive for one pipeline run
#[derive(Debug, Clone)]
pub struct SceneCatalog {
    grid: GridSpec,
    scenes: Vec<Arc<RawScene>>,
}

impl SceneCatalog {
    pub fn new(grid: GridSpec) -> Self {
        SceneCatalog { grid, scenes: Vec::new() }
    }

    /// Add a scene, validating that its grids match the analysis grid
    pub fn add_scene(&mut self, scene: RawScene) -> FireResult<()> {
        let expected = self.grid.shape();
        for band in &scene.bands {
            if band.dim() != expected {
                return Err(FireError::ShapeMismatch { expected, actual: band.dim() });
            }
        }
        if scene.qa.dim() != expected {
            return Err(FireError::ShapeMismatch { expected, actual: scene.qa.dim() });
        }
        debug!("catalog: added scene {} ({})", scene.id, scene.sensor);
        self.scenes.push(Arc::new(scene));
        Ok(())
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn scenes(&self) -> &[Arc<RawScene>] {
        &self.scenes
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }
}

/// A filterable set of index scenes.
///
/// Filters return new collections sharing the underlying scenes
/// through [`Arc`], so chains never copy pixel data; reductions
/// evaluate eagerly.
#[derive(Debug, Clone)]
pub struct IndexCollection {
    grid: GridSpec,
    scenes: Vec<Arc<IndexScene>>,
}

impl IndexCollection {
    pub fn new(grid: GridSpec, scenes: Vec<Arc<IndexScene>>) -> Self {
        IndexCollection { grid, scenes }
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    pub fn scenes(&self) -> &[Arc<IndexScene>] {
        &self.scenes
    }

    /// Keep scenes whose footprint intersects the bounds
    pub fn filter_bounds(&self, bounds: &GeoBounds) -> Self {
        self.filtered(|s| s.footprint.intersects(bounds))
    }

    /// Keep scenes acquired in [start, end)
    pub fn filter_date(&self, start: NaiveDate, end: NaiveDate) -> Self {
        self.filtered(|s| {
            let d = s.acquired.date_naive();
            d >= start && d < end
        })
    }

    /// Keep scenes whose acquisition day-of-year falls inside the season,
    /// inclusive on both ends
    pub fn filter_day_of_year(&self, season: &GrowingSeason) -> Self {
        self.filtered(|s| season.contains(s.acquired.ordinal()))
    }

    /// Attribute-equality filter on the sensor generation
    pub fn filter_sensor(&self, sensor: SensorGeneration) -> Self {
        self.filtered(|s| s.sensor == sensor)
    }

    /// General predicate filter; the named filters above all route here
    pub fn filtered<F>(&self, pred: F) -> Self
    where
        F: Fn(&IndexScene) -> bool,
    {
        let scenes = self
            .scenes
            .iter()
            .filter(|s| pred(s))
            .cloned()
            .collect();
        IndexCollection { grid: self.grid, scenes }
    }

    /// First scene in collection order
    pub fn first(&self) -> Option<Arc<IndexScene>> {
        self.scenes.first().cloned()
    }

    /// Per-pixel mean of every index band across the collection, skipping
    /// masked pixels. Returns None for an empty collection; a pixel masked
    /// in every scene stays masked.
    pub fn mean(&self) -> Option<IndexComposite> {
        if self.scenes.is_empty() {
            return None;
        }
        let (rows, cols) = self.grid.shape();
        let mut out = IndexComposite::fully_masked(rows, cols);
        for (name, band) in out.bands_mut() {
            let sources: Vec<&BandGrid> = self.scenes.iter().map(|s| scene_band(s, name)).collect();
            mean_into(band, &sources);
        }
        Some(out)
    }

    /// Per-pixel composite where scenes later in the collection paint over
    /// earlier ones, and masked pixels let earlier values show through
    pub fn mosaic(&self) -> Option<IndexComposite> {
        if self.scenes.is_empty() {
            return None;
        }
        let (rows, cols) = self.grid.shape();
        let mut out = IndexComposite::fully_masked(rows, cols);
        for (name, band) in out.bands_mut() {
            for scene in &self.scenes {
                let src = scene_band(scene, name);
                band.zip_mut_with(src, |dst, &v| {
                    if v.is_finite() {
                        *dst = v;
                    }
                });
            }
        }
        Some(out)
    }
}

fn scene_band<'a>(scene: &'a IndexScene, name: &str) -> &'a BandGrid {
    match name {
        "nbr" => &scene.nbr,
        "ndvi" => &scene.ndvi,
        "ndmi" => &scene.ndmi,
        "evi" => &scene.evi,
        "mirbi" => &scene.mirbi,
        other => unreachable!("unknown index band {other}"),
    }
}

/// NaN-skipping per-pixel mean of the source grids, written into `out`
fn mean_into(out: &mut BandGrid, sources: &[&BandGrid]) {
    let cols = out.ncols();
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(r, mut row)| {
            for c in 0..cols {
                let mut sum = 0.0f32;
                let mut n = 0u32;
                for src in sources {
                    let v = src[(r, c)];
                    if v.is_finite() {
                        sum += v;
                        n += 1;
                    }
                }
                if n > 0 {
                    row[c] = sum / n as f32;
                }
            }
        });
}

/// Categorical land-cover grid for one calendar year
#[derive(Debug, Clone)]
pub struct YearlyCodes {
    pub year: i32,
    pub codes: CodeGrid,
}

/// Static and yearly ancillary layers shared read-only by a pipeline run
#[derive(Debug, Clone)]
pub struct AncillaryStack {
    /// Annual climatic water deficit, the `def` model feature
    pub deficit: BandGrid,
    /// Surface-water datamask; 1 marks mapped land
    pub water_datamask: ClassGrid,
    /// Raw fire-regime-group codes
    pub fire_regime_codes: CodeGrid,
    /// Land-cover product A by year (forest where code == 4)
    pub lcmap_landcover: Vec<YearlyCodes>,
    /// Land-cover product B by year (forest where code == 1)
    pub lcms_landcover: Vec<YearlyCodes>,
}

impl AncillaryStack {
    /// Check that every layer matches the analysis grid
    pub fn validate(&self, grid: &GridSpec) -> FireResult<()> {
        let expected = grid.shape();
        let check = |actual: (usize, usize)| -> FireResult<()> {
            if actual != expected {
                return Err(FireError::ShapeMismatch { expected, actual });
            }
            Ok(())
        };
        check(self.deficit.dim())?;
        check(self.water_datamask.dim())?;
        check(self.fire_regime_codes.dim())?;
        for yearly in self.lcmap_landcover.iter().chain(self.lcms_landcover.iter()) {
            check(yearly.codes.dim())?;
        }
        Ok(())
    }

    pub fn lcmap_for(&self, year: i32) -> FireResult<&CodeGrid> {
        yearly_lookup(&self.lcmap_landcover, year, "land-cover product A")
    }

    pub fn lcms_for(&self, year: i32) -> FireResult<&CodeGrid> {
        yearly_lookup(&self.lcms_landcover, year, "land-cover product B")
    }
}

fn yearly_lookup<'a>(layers: &'a [YearlyCodes], year: i32, what: &str) -> FireResult<&'a CodeGrid> {
    layers
        .iter()
        .find(|y| y.year == year)
        .map(|y| &y.codes)
        .ok_or_else(|| FireError::InvalidInput(format!("{what} has no grid for year {year}")))
}

/// Convenience for tests and synthetic fixtures
pub fn uniform_band(rows: usize, cols: usize, value: f32) -> BandGrid {
    Array2::from_elem((rows, cols), value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn test_grid(rows: usize, cols: usize) -> GridSpec {
        GridSpec {
            transform: crate::types::GeoTransform {
                top_left_x: -120.0,
                pixel_width: 0.25,
                top_left_y: 45.0,
                pixel_height: -0.25,
            },
            rows,
            cols,
            crs: crate::types::Crs::Geographic,
        }
    }

    fn scene_with(value: f32, day: &str, id: &str) -> IndexScene {
        let band = Array2::from_elem((2, 2), value);
        IndexScene {
            id: id.to_string(),
            acquired: NaiveDateTime::parse_from_str(&format!("{day} 18:30:00"), "%Y-%m-%d %H:%M:%S")
                .unwrap()
                .and_utc(),
            sensor: SensorGeneration::Oli,
            footprint: GeoBounds::new(-120.0, -119.5, 44.5, 45.0),
            nbr: band.clone(),
            ndvi: band.clone(),
            ndmi: band.clone(),
            evi: band.clone(),
            mirbi: band,
            quality: Array2::zeros((2, 2)),
        }
    }

    fn collection(scenes: Vec<IndexScene>) -> IndexCollection {
        IndexCollection::new(test_grid(2, 2), scenes.into_iter().map(Arc::new).collect())
    }

    #[test]
    fn date_filter_is_half_open() {
        let col = collection(vec![
            scene_with(0.1, "2014-07-01", "a"),
            scene_with(0.2, "2015-01-01", "b"),
        ]);
        let start = NaiveDate::from_ymd_opt(2014, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2015, 1, 1).unwrap();
        let filtered = col.filter_date(start, end);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.first().unwrap().id, "a");
    }

    #[test]
    fn day_of_year_filter_is_inclusive() {
        // 2014-06-01 is day 152, 2014-09-15 is day 258
        let col = collection(vec![
            scene_with(0.1, "2014-06-01", "first_day"),
            scene_with(0.2, "2014-09-15", "last_day"),
            scene_with(0.3, "2014-05-31", "too_early"),
        ]);
        let filtered = col.filter_day_of_year(&GrowingSeason::default());
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn mean_skips_masked_pixels() {
        let mut a = scene_with(0.4, "2014-07-01", "a");
        a.nbr[(0, 0)] = f32::NAN;
        let b = scene_with(0.2, "2014-07-09", "b");
        let col = collection(vec![a, b]);

        let composite = col.mean().unwrap();
        // one valid source at (0,0), two everywhere else
        assert_eq!(composite.nbr[(0, 0)], 0.2);
        assert!((composite.nbr[(1, 1)] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn mean_of_empty_collection_is_none() {
        let col = collection(vec![]);
        assert!(col.mean().is_none());
    }

    #[test]
    fn mean_keeps_all_masked_pixels_masked() {
        let mut a = scene_with(0.4, "2014-07-01", "a");
        a.nbr[(0, 1)] = f32::NAN;
        let mut b = scene_with(0.2, "2014-07-09", "b");
        b.nbr[(0, 1)] = f32::NAN;
        let col = collection(vec![a, b]);
        assert!(col.mean().unwrap().nbr[(0, 1)].is_nan());
    }

    #[test]
    fn mosaic_paints_later_scenes_on_top() {
        let a = scene_with(0.1, "2014-07-01", "under");
        let mut b = scene_with(0.9, "2014-07-09", "over");
        b.nbr[(0, 0)] = f32::NAN;
        let col = collection(vec![a, b]);

        let m = col.mosaic().unwrap();
        assert_eq!(m.nbr[(0, 0)], 0.1); // masked on top, underlying shows
        assert_eq!(m.nbr[(1, 1)], 0.9);
    }

    #[test]
    fn sensor_filter_matches_attribute() {
        let mut legacy = scene_with(0.1, "1999-07-01", "etm");
        legacy.sensor = SensorGeneration::TmEtm;
        let col = collection(vec![legacy, scene_with(0.2, "2014-07-01", "oli")]);
        assert_eq!(col.filter_sensor(SensorGeneration::TmEtm).len(), 1);
        assert_eq!(col.filter_sensor(SensorGeneration::Oli).len(), 1);
    }

    #[test]
    fn ancillary_year_lookup_reports_missing_years() {
        let stack = AncillaryStack {
            deficit: uniform_band(2, 2, 400.0),
            water_datamask: Array2::ones((2, 2)),
            fire_regime_codes: Array2::ones((2, 2)),
            lcmap_landcover: vec![YearlyCodes { year: 2014, codes: Array2::from_elem((2, 2), 4) }],
            lcms_landcover: vec![YearlyCodes { year: 2014, codes: Array2::ones((2, 2)) }],
        };
        assert!(stack.lcmap_for(2014).is_ok());
        assert!(stack.lcmap_for(2015).is_err());
        assert!(stack.validate(&test_grid(2, 2)).is_ok());
        assert!(stack.validate(&test_grid(3, 2)).is_err());
    }
}
