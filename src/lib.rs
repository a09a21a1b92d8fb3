//! goodfire: A Landsat Burn-Severity and Ecological Fire Classification Pipeline
//!
//! This library composites growing-season Landsat spectral indices around fire
//! years, estimates Composite Burn Index severity with a regression-forest model,
//! classifies burned forest as ecologically beneficial or harmful against
//! historical fire regimes, and aggregates the results per region, per year,
//! and per fire event.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    BandGrid, ClassGrid, CodeGrid, Crs, FireError, FireEvent, FireResult, GeoBounds,
    GeoTransform, GridSpec, GrowingSeason, IndexComposite, IndexScene, QaGrid, RawScene,
    SensorGeneration, SummaryRegion,
};

pub use io::{AncillaryStack, IndexCollection, PerimeterSchema, SceneCatalog};

pub use crate::core::{
    AggregationDriver, AggregationParams, BurnMetricCalculator, BurnMetricParams, BurnMetrics,
    ClassifierParams, CompositorParams, EcologicalClassifier, ForestMaskStrategy, GoodFireLayers,
    GridReducer, PipelineConfig, RegionReducer, RegressionForest, SeverityEstimator,
    SeverityModel, SeverityPipeline, SeveritySurface, TemporalCompositor,
};
