//! Temporal compositing with data-availability fallback.
//!
//! For each fire year the compositor mean-reduces index scenes inside a
//! growing-season day-of-year window: pre-fire from the calendar year
//! before the fire, post-fire from the year after. Sparse archives
//! degrade instead of failing: a wider calendar window fills pixels the
//! narrow window left masked (the narrow result always wins where it has
//! data), and when both windows are empty the composite is fully masked
//! so downstream arithmetic yields no-data.

use chrono::NaiveDate;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::io::catalog::IndexCollection;
use crate::types::{
    FireError, FireResult, GeoBounds, GridSpec, GrowingSeason, IndexComposite,
};

/// A spatial bound composited with its own growing-season window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubRegionWindow {
    pub name: String,
    pub bounds: GeoBounds,
    pub season: GrowingSeason,
}

/// Compositor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositorParams {
    /// Day-of-year window used when no sub-regions are configured
    pub season: GrowingSeason,
    /// Sub-regions composited separately and mosaicked per year; later
    /// entries paint over earlier ones where they overlap
    pub sub_regions: Vec<SubRegionWindow>,
}

impl Default for CompositorParams {
    fn default() -> Self {
        CompositorParams {
            season: GrowingSeason::default(),
            sub_regions: Vec::new(),
        }
    }
}

/// Builds pre-/post-fire mean composites from an index collection
#[derive(Debug, Clone)]
pub struct TemporalCompositor {
    params: CompositorParams,
}

impl TemporalCompositor {
    pub fn new(params: CompositorParams) -> Self {
        TemporalCompositor { params }
    }

    pub fn params(&self) -> &CompositorParams {
        &self.params
    }

    /// Pre-fire composite for one bound: mean over [year−1, year), with
    /// [year−2, year) filling pixels the narrow window left masked
    pub fn pre_fire(
        &self,
        scenes: &IndexCollection,
        year: i32,
        bounds: &GeoBounds,
        season: &GrowingSeason,
    ) -> FireResult<IndexComposite> {
        let narrow = self.windowed_mean(scenes, bounds, season, year_start(year - 1)?, year_start(year)?);
        let wide = self.windowed_mean(scenes, bounds, season, year_start(year - 2)?, year_start(year)?);
        Ok(deliver(narrow, wide, scenes.grid(), "pre-fire", year))
    }

    /// Post-fire composite for one bound: mean over [year+1, year+2), with
    /// [year+1, year+3) filling pixels the narrow window left masked
    pub fn post_fire(
        &self,
        scenes: &IndexCollection,
        year: i32,
        bounds: &GeoBounds,
        season: &GrowingSeason,
    ) -> FireResult<IndexComposite> {
        let narrow =
            self.windowed_mean(scenes, bounds, season, year_start(year + 1)?, year_start(year + 2)?);
        let wide =
            self.windowed_mean(scenes, bounds, season, year_start(year + 1)?, year_start(year + 3)?);
        Ok(deliver(narrow, wide, scenes.grid(), "post-fire", year))
    }

    /// Pre/post pair for one fire year across the full analysis grid.
    ///
    /// With sub-regions configured, each is composited under its own
    /// season and painted into the output clipped to its bounds; without
    /// them, one pair covers the whole grid under the default season.
    pub fn year_pair(
        &self,
        scenes: &IndexCollection,
        year: i32,
    ) -> FireResult<(IndexComposite, IndexComposite)> {
        let grid = *scenes.grid();
        if self.params.sub_regions.is_empty() {
            let bounds = grid.bounds();
            let pre = self.pre_fire(scenes, year, &bounds, &self.params.season)?;
            let post = self.post_fire(scenes, year, &bounds, &self.params.season)?;
            return Ok((pre, post));
        }

        let (rows, cols) = grid.shape();
        let mut pre = IndexComposite::fully_masked(rows, cols);
        let mut post = IndexComposite::fully_masked(rows, cols);
        for sub in &self.params.sub_regions {
            debug!(
                "compositor: year {year} sub-region {} (doy {}..={})",
                sub.name, sub.season.start_day, sub.season.end_day
            );
            let sub_pre = self.pre_fire(scenes, year, &sub.bounds, &sub.season)?;
            let sub_post = self.post_fire(scenes, year, &sub.bounds, &sub.season)?;
            paint_within(&mut pre, &sub_pre, &sub.bounds, &grid);
            paint_within(&mut post, &sub_post, &sub.bounds, &grid);
        }
        Ok((pre, post))
    }

    fn windowed_mean(
        &self,
        scenes: &IndexCollection,
        bounds: &GeoBounds,
        season: &GrowingSeason,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Option<IndexComposite> {
        let filtered = scenes
            .filter_bounds(bounds)
            .filter_date(start, end)
            .filter_day_of_year(season);
        if filtered.is_empty() {
            debug!(
                "compositor: no scenes in [{start}, {end}) doy {}..={}",
                season.start_day, season.end_day
            );
            return None;
        }
        filtered.mean()
    }
}

/// Combine narrow and wide window means into the delivered composite
fn deliver(
    narrow: Option<IndexComposite>,
    wide: Option<IndexComposite>,
    grid: &GridSpec,
    label: &str,
    year: i32,
) -> IndexComposite {
    match (narrow, wide) {
        (Some(mut n), Some(w)) => {
            fill_masked(&mut n, &w);
            n
        }
        (None, Some(w)) => {
            warn!("compositor: {label} {year} narrow window empty, using widened window");
            w
        }
        (Some(n), None) => n,
        (None, None) => {
            warn!("compositor: {label} {year} has no imagery, composite fully masked");
            IndexComposite::fully_masked(grid.rows, grid.cols)
        }
    }
}

/// Fill masked pixels of `base` from `fallback`, leaving valid pixels
/// untouched. Both composites must share a shape; the compositor only
/// calls this on composites built from one grid.
pub fn fill_masked(base: &mut IndexComposite, fallback: &IndexComposite) {
    for ((_, dst), (_, src)) in base.bands_mut().into_iter().zip(fallback.bands()) {
        dst.zip_mut_with(src, |d, &s| {
            if d.is_nan() && s.is_finite() {
                *d = s;
            }
        });
    }
}

/// Paint `src` into `dst` for cells whose center lies inside `bounds`.
/// Valid source pixels overwrite; masked ones leave `dst` alone.
fn paint_within(dst: &mut IndexComposite, src: &IndexComposite, bounds: &GeoBounds, grid: &GridSpec) {
    let (rows, cols) = grid.shape();
    for ((_, d), (_, s)) in dst.bands_mut().into_iter().zip(src.bands()) {
        for r in 0..rows {
            for c in 0..cols {
                let (x, y) = grid.transform.xy_at(r, c);
                if !bounds.contains(x, y) {
                    continue;
                }
                let v = s[(r, c)];
                if v.is_finite() {
                    d[(r, c)] = v;
                }
            }
        }
    }
}

fn year_start(year: i32) -> FireResult<NaiveDate> {
    NaiveDate::from_ymd_opt(year, 1, 1)
        .ok_or_else(|| FireError::InvalidInput(format!("year {year} out of calendar range")))
}
