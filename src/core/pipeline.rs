//! End-to-end pipeline orchestration.
//!
//! Owns everything derived once per run: the spectral-index collection,
//! the reclassified fire-regime mask, and the per-year forest masks,
//! shared read-only across years and events. Yearly products are
//! computed on demand and each year or event stands alone, so one
//! failure never blocks the rest of a batch.

use std::collections::HashMap;
use std::sync::Arc;

use geo::BoundingRect;
use log::{debug, error, info};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

use crate::core::aggregate::{
    hectares, reduce_with_retry, simplified, AggregationParams, EventSeverity,
    EventSeverityBatch, FailedTask, ForestYear, RegionReducer,
};
use crate::core::burn_metrics::{BurnMetricCalculator, BurnMetricParams};
use crate::core::classify::{
    fire_regime_classes, forest_mask, ClassifierParams, EcologicalClassifier,
    ForestMaskStrategy, GoodFireLayers, LAYER_NAMES,
};
use crate::core::composite::{CompositorParams, TemporalCompositor};
use crate::core::indices::build_index_collection;
use crate::core::severity::{SeverityEstimator, SeverityModel, SeveritySurface};
use crate::io::catalog::{AncillaryStack, IndexCollection, SceneCatalog};
use crate::types::{BandGrid, ClassGrid, FireError, FireEvent, FireResult, GeoBounds, GridSpec};

/// Everything configurable about a run, in one deserializable document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub compositor: CompositorParams,
    pub metrics: BurnMetricParams,
    pub classifier: ClassifierParams,
    pub aggregation: AggregationParams,
}

/// Severity pipeline for one analysis grid.
pub struct SeverityPipeline<M: SeverityModel> {
    grid: GridSpec,
    collection: IndexCollection,
    ancillary: AncillaryStack,
    regime: Arc<ClassGrid>,
    forests: HashMap<i32, Arc<ClassGrid>>,
    compositor: TemporalCompositor,
    calculator: BurnMetricCalculator,
    classifier_params: ClassifierParams,
    aggregation: AggregationParams,
    estimator: SeverityEstimator<M>,
}

impl<M: SeverityModel> SeverityPipeline<M> {
    /// Derive the once-per-run products and wire the components together.
    pub fn new(
        catalog: &SceneCatalog,
        ancillary: AncillaryStack,
        model: M,
        config: PipelineConfig,
    ) -> FireResult<Self> {
        let grid = *catalog.grid();
        ancillary.validate(&grid)?;
        let collection = build_index_collection(catalog)?;
        let regime = Arc::new(fire_regime_classes(&ancillary.fire_regime_codes));
        let forests = build_forest_masks(&ancillary, config.classifier.forest_strategy)?;
        info!(
            "pipeline ready: {} index scenes, {} forest years",
            collection.len(),
            forests.len()
        );
        Ok(SeverityPipeline {
            grid,
            collection,
            ancillary,
            regime,
            forests,
            compositor: TemporalCompositor::new(config.compositor),
            calculator: BurnMetricCalculator::new(config.metrics),
            classifier_params: config.classifier,
            aggregation: config.aggregation,
            estimator: SeverityEstimator::new(model),
        })
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn index_collection(&self) -> &IndexCollection {
        &self.collection
    }

    /// Reclassified 3-class fire-regime mask.
    pub fn regime(&self) -> &ClassGrid {
        &self.regime
    }

    /// Forest mask for one land-cover year.
    pub fn forest_for(&self, year: i32) -> FireResult<&Arc<ClassGrid>> {
        self.forests.get(&year).ok_or_else(|| {
            FireError::InvalidInput(format!("no forest mask derived for year {year}"))
        })
    }

    /// Severity surface for one fire year over the full grid.
    pub fn severity_surface(&self, year: i32) -> FireResult<SeveritySurface> {
        let (pre, post) = self.compositor.year_pair(&self.collection, year)?;
        let metrics = self.calculator.derive(&pre, &post)?;
        self.estimator.estimate(
            year,
            &metrics,
            &self.ancillary.deficit,
            &self.ancillary.water_datamask,
            &self.grid,
        )
    }

    /// Classification layers for one fire year.
    pub fn layers_for_year(&self, year: i32) -> FireResult<GoodFireLayers> {
        let surface = self.severity_surface(year)?;
        self.classify_surface(&surface)
    }

    /// Classify an already computed severity surface.
    pub fn classify_surface(&self, surface: &SeveritySurface) -> FireResult<GoodFireLayers> {
        let prior_forest = self.forest_for(surface.year - 1)?;
        EcologicalClassifier::new(self.classifier_params).classify(
            surface,
            &self.regime,
            prior_forest,
            &self.grid,
        )
    }

    /// Forest persistence inputs for every derived forest year, sorted.
    pub fn forest_years(&self) -> Vec<ForestYear> {
        let area = self.grid.pixel_area_grid();
        let mut years: Vec<ForestYear> = self
            .forests
            .iter()
            .map(|(&year, mask)| {
                let mut forest_area = Array2::from_elem(self.grid.shape(), f32::NAN);
                Zip::from(&mut forest_area)
                    .and(mask.as_ref())
                    .and(&area)
                    .par_for_each(|o, &f, &a| {
                        if f == 1 {
                            *o = a;
                        }
                    });
                ForestYear {
                    year,
                    forest_area,
                    total_area: area.clone(),
                }
            })
            .collect();
        years.sort_by_key(|y| y.year);
        years
    }

    /// Full severity summary for one fire event, composited over the
    /// event's own bounds and reduced over its (optionally simplified)
    /// perimeter with combined statistics.
    pub fn event_severity<R: RegionReducer>(
        &self,
        event: &FireEvent,
        reducer: &R,
    ) -> FireResult<EventSeverity> {
        let rect = event.geometry.bounding_rect().ok_or_else(|| {
            FireError::InvalidInput(format!("event {} has an empty geometry", event.id))
        })?;
        let bounds = GeoBounds::new(rect.min().x, rect.max().x, rect.min().y, rect.max().y);
        let season = &self.compositor.params().season;
        debug!(
            "event {}: compositing year {} over its own bounds",
            event.id, event.year
        );

        let pre = self
            .compositor
            .pre_fire(&self.collection, event.year, &bounds, season)?;
        let post = self
            .compositor
            .post_fire(&self.collection, event.year, &bounds, season)?;
        let metrics = self.calculator.derive(&pre, &post)?;
        let surface = self.estimator.estimate(
            event.year,
            &metrics,
            &self.ancillary.deficit,
            &self.ancillary.water_datamask,
            &self.grid,
        )?;
        let prior_forest = self.forest_for(event.year - 1)?;
        let layers = EcologicalClassifier::new(self.classifier_params).classify(
            &surface,
            &self.regime,
            prior_forest,
            &self.grid,
        )?;

        // continuous severity over the prior-year forest for mean/max
        let mut cbi_forest = Array2::from_elem(self.grid.shape(), f32::NAN);
        Zip::from(&mut cbi_forest)
            .and(&surface.cbi_bc)
            .and(prior_forest.as_ref())
            .par_for_each(|o, &c, &f| {
                if f == 1 {
                    *o = c;
                }
            });

        let mut named: Vec<(&str, &BandGrid)> = layers.layers().to_vec();
        named.push(("cbi", &cbi_forest));

        let geometry = simplified(&event.geometry, self.aggregation.simplify_tolerance);
        let stats = reduce_with_retry(reducer, &named, &geometry, &self.grid, &self.aggregation)?;

        let mut layer_hectares = [0.0f64; 12];
        for (slot, name) in layer_hectares.iter_mut().zip(LAYER_NAMES.iter()) {
            *slot = hectares(stats.get(*name).map_or(0.0, |s| s.sum));
        }
        let cbi_stats = stats.get("cbi");
        Ok(EventSeverity {
            event_id: event.id.clone(),
            year: event.year,
            cbi_mean: cbi_stats.and_then(|s| s.mean),
            cbi_max: cbi_stats.and_then(|s| s.max),
            valid_pixels: cbi_stats.map_or(0, |s| s.count),
            hectares: layer_hectares,
        })
    }

    /// Event summaries for a batch; failed events are reported, the
    /// rest proceed. Summaries come back sorted by (year, event id).
    pub fn event_severities<R: RegionReducer>(
        &self,
        events: &[FireEvent],
        reducer: &R,
    ) -> EventSeverityBatch {
        let mut batch = EventSeverityBatch::default();
        for event in events {
            match self.event_severity(event, reducer) {
                Ok(summary) => batch.events.push(summary),
                Err(error) => {
                    error!("event {} year {}: {error}", event.id, event.year);
                    batch.failures.push(FailedTask {
                        id: event.id.clone(),
                        year: event.year,
                        error,
                    });
                }
            }
        }
        batch
            .events
            .sort_by(|a, b| (a.year, a.event_id.as_str()).cmp(&(b.year, b.event_id.as_str())));
        batch
    }
}

fn build_forest_masks(
    ancillary: &AncillaryStack,
    strategy: ForestMaskStrategy,
) -> FireResult<HashMap<i32, Arc<ClassGrid>>> {
    let mut forests = HashMap::new();
    for yearly in &ancillary.lcms_landcover {
        let mask = match strategy {
            ForestMaskStrategy::Conservative => {
                let Ok(lcmap) = ancillary.lcmap_for(yearly.year) else {
                    debug!(
                        "land-cover product A has no grid for {}; skipping forest year",
                        yearly.year
                    );
                    continue;
                };
                forest_mask(strategy, lcmap, &yearly.codes)?
            }
            ForestMaskStrategy::SingleProduct => {
                forest_mask(strategy, &yearly.codes, &yearly.codes)?
            }
        };
        forests.insert(yearly.year, Arc::new(mask));
    }
    Ok(forests)
}
