//! Zonal reduction and the year/event batch drivers.
//!
//! The reducer walks the analysis grid and accumulates statistics for
//! every pixel whose center falls inside a region geometry. The driver
//! feeds it yearly layer sets and turns the results into flat summary
//! rows. Each reduction is independent; one failed region or event is
//! logged and reported without stopping the batch, and a failed
//! reduction gets one retry with a doubled subdivision hint.

use std::borrow::Cow;
use std::collections::HashMap;

use geo::{BoundingRect, Contains, MultiPolygon, Point, Simplify};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::classify::{GoodFireLayers, LAYER_NAMES};
use crate::types::{
    BandGrid, FireError, FireEvent, FireResult, GridSpec, SummaryRegion,
};

/// Units attached to every area summary row.
pub const AREA_UNITS: &str = "m^2";

/// Scalar statistics from one zonal reduction of one band.
///
/// `sum` is 0 and `mean`/`max` are `None` when no unmasked pixel fell
/// inside the region.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReduceStats {
    pub sum: f64,
    pub mean: Option<f64>,
    pub max: Option<f64>,
    pub count: u64,
}

/// Zonal statistics over named rasters within a region geometry.
///
/// `tile_scale` subdivides the work to bound per-chunk working sets;
/// implementations must return the same values for any setting of it.
pub trait RegionReducer {
    fn reduce(
        &self,
        layers: &[(&str, &BandGrid)],
        geometry: &MultiPolygon<f64>,
        grid: &GridSpec,
        scale_m: f64,
        tile_scale: u32,
    ) -> FireResult<HashMap<String, ReduceStats>>;
}

/// Rasterize-and-scan reference reducer.
///
/// Reduces at the native grid resolution; `scale_m` is carried for
/// parity with archive-backed reducers and only logged. Per-row partial
/// sums are folded in fixed row order, so results are bit-identical
/// across runs and tile scales.
#[derive(Debug, Clone, Copy, Default)]
pub struct GridReducer;

impl RegionReducer for GridReducer {
    fn reduce(
        &self,
        layers: &[(&str, &BandGrid)],
        geometry: &MultiPolygon<f64>,
        grid: &GridSpec,
        scale_m: f64,
        tile_scale: u32,
    ) -> FireResult<HashMap<String, ReduceStats>> {
        let (rows, cols) = grid.shape();
        for (name, band) in layers {
            if band.dim() != (rows, cols) {
                debug!("layer {name} shape {:?} off-grid", band.dim());
                return Err(FireError::ShapeMismatch {
                    expected: (rows, cols),
                    actual: band.dim(),
                });
            }
        }
        let rect = geometry.bounding_rect().ok_or_else(|| {
            FireError::InvalidInput("cannot reduce over an empty geometry".into())
        })?;

        let t = &grid.transform;
        let (r_a, c_a) = t.index_of(rect.min().x, rect.min().y);
        let (r_b, c_b) = t.index_of(rect.max().x, rect.max().y);
        let row_start = r_a.min(r_b).clamp(0, rows as i64) as usize;
        let row_end = (r_a.max(r_b) + 1).clamp(0, rows as i64) as usize;
        let col_start = c_a.min(c_b).clamp(0, cols as i64) as usize;
        let col_end = (c_a.max(c_b) + 1).clamp(0, cols as i64) as usize;
        debug!(
            "reducing {} layers over a {}x{} window at {scale_m} m, tile scale {tile_scale}",
            layers.len(),
            row_end.saturating_sub(row_start),
            col_end.saturating_sub(col_start),
        );

        let chunk_rows = (row_end.saturating_sub(row_start) / tile_scale.max(1) as usize).max(1);
        let partials: Vec<Vec<(f64, f64, u64)>> = (row_start..row_end)
            .into_par_iter()
            .with_min_len(chunk_rows)
            .map(|row| {
                let mut acc = vec![(0.0f64, f64::NEG_INFINITY, 0u64); layers.len()];
                for col in col_start..col_end {
                    let (x, y) = t.xy_at(row, col);
                    if !geometry.contains(&Point::new(x, y)) {
                        continue;
                    }
                    for (slot, (_, band)) in acc.iter_mut().zip(layers.iter()) {
                        let v = band[[row, col]];
                        if v.is_finite() {
                            slot.0 += v as f64;
                            slot.1 = slot.1.max(v as f64);
                            slot.2 += 1;
                        }
                    }
                }
                acc
            })
            .collect();

        let mut totals = vec![(0.0f64, f64::NEG_INFINITY, 0u64); layers.len()];
        for row_acc in partials {
            for (total, part) in totals.iter_mut().zip(row_acc) {
                total.0 += part.0;
                total.1 = total.1.max(part.1);
                total.2 += part.2;
            }
        }

        let mut out = HashMap::with_capacity(layers.len());
        for ((name, _), (sum, max, count)) in layers.iter().zip(totals) {
            out.insert(
                (*name).to_string(),
                ReduceStats {
                    sum,
                    mean: (count > 0).then(|| sum / count as f64),
                    max: (count > 0).then_some(max),
                    count,
                },
            );
        }
        Ok(out)
    }
}

/// Reduction configuration shared by the batch drivers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationParams {
    /// Linear ground resolution handed to the reducer, meters.
    pub scale_m: f64,
    /// Subdivision hint; bounds per-chunk working sets, never the result.
    pub tile_scale: u32,
    /// Perimeter simplification tolerance for the event paths, in the
    /// geometry's units. `None` reduces over the exact perimeter.
    pub simplify_tolerance: Option<f64>,
}

impl Default for AggregationParams {
    fn default() -> Self {
        AggregationParams {
            scale_m: 30.0,
            tile_scale: 16,
            simplify_tolerance: Some(100.0),
        }
    }
}

/// Convert a summed area in m² to hectares at one-decimal precision,
/// the reporting convention of the event tables.
pub fn hectares(sum_m2: f64) -> f64 {
    (sum_m2 * 0.001).round() / 10.0
}

pub(crate) fn reduce_with_retry<R: RegionReducer>(
    reducer: &R,
    layers: &[(&str, &BandGrid)],
    geometry: &MultiPolygon<f64>,
    grid: &GridSpec,
    params: &AggregationParams,
) -> FireResult<HashMap<String, ReduceStats>> {
    match reducer.reduce(layers, geometry, grid, params.scale_m, params.tile_scale) {
        Ok(stats) => Ok(stats),
        Err(err) => {
            let doubled = params.tile_scale.saturating_mul(2);
            warn!("reduction failed ({err}); retrying with tile scale {doubled}");
            reducer.reduce(layers, geometry, grid, params.scale_m, doubled)
        }
    }
}

pub(crate) fn simplified<'a>(
    geometry: &'a MultiPolygon<f64>,
    tolerance: Option<f64>,
) -> Cow<'a, MultiPolygon<f64>> {
    match tolerance {
        Some(tol) => Cow::Owned(geometry.simplify(&tol)),
        None => Cow::Borrowed(geometry),
    }
}

/// One row of a summary table: identifier, year, units, named sums.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub id: String,
    pub year: i32,
    pub units: &'static str,
    pub values: Vec<(&'static str, f64)>,
}

/// A reduction that failed its retry as well.
#[derive(Debug)]
pub struct FailedTask {
    pub id: String,
    pub year: i32,
    pub error: FireError,
}

/// Rows that succeeded plus the tasks that did not.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub rows: Vec<SummaryRow>,
    pub failures: Vec<FailedTask>,
}

/// Forest persistence inputs for one year: the forest mask's
/// area-weighted layer plus unmasked pixel area.
#[derive(Debug, Clone)]
pub struct ForestYear {
    pub year: i32,
    pub forest_area: BandGrid,
    pub total_area: BandGrid,
}

impl ForestYear {
    pub fn layers(&self) -> [(&'static str, &BandGrid); 2] {
        [
            ("forest_area", &self.forest_area),
            ("total_area", &self.total_area),
        ]
    }
}

/// Per-event severity summary: one-decimal hectares per layer plus
/// continuous severity statistics over the prior-year forest.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSeverity {
    pub event_id: String,
    pub year: i32,
    pub cbi_mean: Option<f64>,
    pub cbi_max: Option<f64>,
    pub valid_pixels: u64,
    /// Aligned with [`LAYER_NAMES`].
    pub hectares: [f64; 12],
}

/// Event summaries that succeeded plus the events that did not.
#[derive(Debug, Default)]
pub struct EventSeverityBatch {
    pub events: Vec<EventSeverity>,
    pub failures: Vec<FailedTask>,
}

/// Feeds yearly layer sets through a [`RegionReducer`] and collects
/// flat summary rows.
pub struct AggregationDriver<R: RegionReducer> {
    reducer: R,
    params: AggregationParams,
}

impl<R: RegionReducer> AggregationDriver<R> {
    pub fn new(reducer: R, params: AggregationParams) -> Self {
        AggregationDriver { reducer, params }
    }

    pub fn params(&self) -> &AggregationParams {
        &self.params
    }

    /// Sum every layer over every region for every yearly layer set.
    /// Rows come back sorted by (year, region name).
    pub fn regional_summaries(
        &self,
        years: &[GoodFireLayers],
        regions: &[SummaryRegion],
        grid: &GridSpec,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for layers in years {
            let named = layers.layers();
            for region in regions {
                match reduce_with_retry(&self.reducer, &named, &region.geometry, grid, &self.params)
                {
                    Ok(stats) => {
                        outcome
                            .rows
                            .push(layer_row(region.name.clone(), layers.year, &stats));
                    }
                    Err(error) => {
                        error!("region {} year {}: {error}", region.name, layers.year);
                        outcome.failures.push(FailedTask {
                            id: region.name.clone(),
                            year: layers.year,
                            error,
                        });
                    }
                }
            }
        }
        sort_rows(&mut outcome.rows);
        info!(
            "regional summaries: {} rows, {} failures",
            outcome.rows.len(),
            outcome.failures.len()
        );
        outcome
    }

    /// Sum every layer over each event's own perimeter, matched to the
    /// event's ignition year. An event whose year has no layer set is a
    /// loud per-event failure; the batch continues. Rows come back
    /// sorted by (year, event id).
    pub fn event_rows(
        &self,
        years: &[GoodFireLayers],
        events: &[FireEvent],
        grid: &GridSpec,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for event in events {
            let Some(layers) = years.iter().find(|l| l.year == event.year) else {
                let error = FireError::MissingYear { year: event.year };
                error!("event {}: {error}", event.id);
                outcome.failures.push(FailedTask {
                    id: event.id.clone(),
                    year: event.year,
                    error,
                });
                continue;
            };
            let geometry = simplified(&event.geometry, self.params.simplify_tolerance);
            let named = layers.layers();
            match reduce_with_retry(&self.reducer, &named, &geometry, grid, &self.params) {
                Ok(stats) => {
                    outcome
                        .rows
                        .push(layer_row(event.id.clone(), event.year, &stats));
                }
                Err(error) => {
                    error!("event {} year {}: {error}", event.id, event.year);
                    outcome.failures.push(FailedTask {
                        id: event.id.clone(),
                        year: event.year,
                        error,
                    });
                }
            }
        }
        sort_rows(&mut outcome.rows);
        info!(
            "event rows: {} rows, {} failures",
            outcome.rows.len(),
            outcome.failures.len()
        );
        outcome
    }

    /// Sum the forest persistence layers over every region per year.
    pub fn forest_summaries(
        &self,
        years: &[ForestYear],
        regions: &[SummaryRegion],
        grid: &GridSpec,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for year in years {
            let named = year.layers();
            for region in regions {
                match reduce_with_retry(&self.reducer, &named, &region.geometry, grid, &self.params)
                {
                    Ok(stats) => {
                        let values = named
                            .iter()
                            .map(|(name, _)| (*name, stats.get(*name).map_or(0.0, |s| s.sum)))
                            .collect();
                        outcome.rows.push(SummaryRow {
                            id: region.name.clone(),
                            year: year.year,
                            units: AREA_UNITS,
                            values,
                        });
                    }
                    Err(error) => {
                        error!("region {} year {}: {error}", region.name, year.year);
                        outcome.failures.push(FailedTask {
                            id: region.name.clone(),
                            year: year.year,
                            error,
                        });
                    }
                }
            }
        }
        sort_rows(&mut outcome.rows);
        outcome
    }
}

fn layer_row(id: String, year: i32, stats: &HashMap<String, ReduceStats>) -> SummaryRow {
    let values = LAYER_NAMES
        .iter()
        .map(|name| (*name, stats.get(*name).map_or(0.0, |s| s.sum)))
        .collect();
    SummaryRow {
        id,
        year,
        units: AREA_UNITS,
        values,
    }
}

fn sort_rows(rows: &mut [SummaryRow]) {
    rows.sort_by(|a, b| (a.year, a.id.as_str()).cmp(&(b.year, b.id.as_str())));
}
