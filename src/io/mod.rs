//! I/O modules for scene catalogs, fire perimeters, and export

pub mod catalog;
pub mod export;
pub mod perimeters;

pub use catalog::{AncillaryStack, IndexCollection, SceneCatalog, YearlyCodes};
pub use export::{write_class_raster, write_event_csv, write_summary_csv};
pub use perimeters::{
    fire_events_from_json, load_fire_events, load_summary_regions, summary_regions_from_json,
    PerimeterSchema,
};
