//! Core severity-processing modules

pub mod aggregate;
pub mod burn_metrics;
pub mod classify;
pub mod composite;
pub mod indices;
pub mod pipeline;
pub mod severity;

// Re-export main types
pub use aggregate::{
    AggregationDriver, AggregationParams, BatchOutcome, EventSeverity, EventSeverityBatch,
    FailedTask, ForestYear, GridReducer, ReduceStats, RegionReducer, SummaryRow,
};
pub use burn_metrics::{BurnMetricCalculator, BurnMetricParams, BurnMetrics, RdnbrDenominator};
pub use classify::{
    binary_layer, fire_regime_classes, flatten_good_fire, forest_mask, severity_classes,
    ClassifierParams, EcologicalClassifier, ForestMaskStrategy, GoodFireLayers, LAYER_NAMES,
};
pub use composite::{CompositorParams, SubRegionWindow, TemporalCompositor};
pub use indices::{build_index_collection, build_index_scene};
pub use pipeline::{PipelineConfig, SeverityPipeline};
pub use severity::{
    bias_correct, RegressionForest, SeverityEstimator, SeverityModel, SeveritySurface,
};
