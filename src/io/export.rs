//! Tabular and raster export.
//!
//! Summary tables go out as CSV, one row per (identifier, year) with a
//! units column and one column per named layer; categorical rasters go
//! out as single-band grayscale GeoTIFF with a JSON sidecar carrying the
//! grid georeferencing. Writers are deterministic so reruns over the
//! same inputs produce byte-identical files.

use std::fs::File;
use std::path::Path;

use log::info;
use tiff::encoder::colortype::Gray8;
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;

use crate::core::aggregate::{EventSeverity, SummaryRow};
use crate::core::classify::LAYER_NAMES;
use crate::types::{ClassGrid, Crs, FireError, FireResult, GridSpec};

// GeoTIFF tag ids (OGC GeoTIFF 1.1)
const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GEO_KEY_DIRECTORY: u16 = 34735;

/// Write summary rows as CSV. The column set comes from the first row;
/// every row must carry the same layer names in the same order.
pub fn write_summary_csv<P: AsRef<Path>>(path: P, rows: &[SummaryRow]) -> FireResult<()> {
    let path = path.as_ref();
    let first = rows
        .first()
        .ok_or_else(|| FireError::InvalidInput("no summary rows to write".to_string()))?;

    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec!["id", "year", "units"];
    header.extend(first.values.iter().map(|(name, _)| *name));
    writer.write_record(&header)?;

    for row in rows {
        let aligned = row.values.len() == first.values.len()
            && row.values.iter().zip(&first.values).all(|(a, b)| a.0 == b.0);
        if !aligned {
            return Err(FireError::InvalidInput(format!(
                "row {} year {} does not share the table's layer columns",
                row.id, row.year
            )));
        }
        let mut record = vec![row.id.clone(), row.year.to_string(), row.units.to_string()];
        record.extend(row.values.iter().map(|(_, v)| v.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    info!("wrote {} summary rows to {}", rows.len(), path.display());
    Ok(())
}

/// Write per-event severity summaries as CSV. Layer columns carry
/// hectares at one-decimal precision; events with no valid severity
/// pixels report empty mean/max fields.
pub fn write_event_csv<P: AsRef<Path>>(path: P, events: &[EventSeverity]) -> FireResult<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec!["event_id", "year", "units", "cbi_mean", "cbi_max", "valid_pixels"];
    header.extend(LAYER_NAMES);
    writer.write_record(&header)?;

    for event in events {
        let mut record = vec![
            event.event_id.clone(),
            event.year.to_string(),
            "ha".to_string(),
            event.cbi_mean.map(|v| v.to_string()).unwrap_or_default(),
            event.cbi_max.map(|v| v.to_string()).unwrap_or_default(),
            event.valid_pixels.to_string(),
        ];
        record.extend(event.hectares.iter().map(|v| format!("{v:.1}")));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    info!("wrote {} event rows to {}", events.len(), path.display());
    Ok(())
}

/// Write a categorical class grid as a single-band grayscale GeoTIFF.
///
/// Georeferencing goes into the standard GeoTIFF tags plus a `.json`
/// sidecar next to the raster carrying the full [`GridSpec`].
pub fn write_class_raster<P: AsRef<Path>>(
    path: P,
    classes: &ClassGrid,
    grid: &GridSpec,
) -> FireResult<()> {
    let path = path.as_ref();
    if classes.dim() != grid.shape() {
        return Err(FireError::ShapeMismatch {
            expected: grid.shape(),
            actual: classes.dim(),
        });
    }

    let file = File::create(path)?;
    let mut encoder = TiffEncoder::new(file)?;
    let mut image = encoder.new_image::<Gray8>(grid.cols as u32, grid.rows as u32)?;

    let t = &grid.transform;
    let scale = [t.pixel_width, t.pixel_height.abs(), 0.0];
    image.encoder().write_tag(Tag::Unknown(MODEL_PIXEL_SCALE), &scale[..])?;
    let tiepoint = [0.0, 0.0, 0.0, t.top_left_x, t.top_left_y, 0.0];
    image.encoder().write_tag(Tag::Unknown(MODEL_TIEPOINT), &tiepoint[..])?;
    image.encoder().write_tag(Tag::Unknown(GEO_KEY_DIRECTORY), &geo_keys(&grid.crs)[..])?;

    let data: Vec<u8> = classes.iter().copied().collect();
    image.write_data(&data)?;

    let sidecar = path.with_extension("json");
    serde_json::to_writer_pretty(File::create(&sidecar)?, grid)?;
    info!(
        "wrote {}x{} class raster to {}",
        grid.rows,
        grid.cols,
        path.display()
    );
    Ok(())
}

/// Minimal GeoKey directory: model type, raster type, and the EPSG code
/// when the grid is projected.
fn geo_keys(crs: &Crs) -> Vec<u16> {
    match crs {
        Crs::Geographic => vec![
            1, 1, 0, 2, // directory version 1.1.0, two keys
            1024, 0, 1, 2, // GTModelTypeGeoKey = geographic
            1025, 0, 1, 1, // GTRasterTypeGeoKey = pixel-is-area
        ],
        Crs::Projected { epsg } => vec![
            1, 1, 0, 3,
            1024, 0, 1, 1, // GTModelTypeGeoKey = projected
            1025, 0, 1, 1,
            3072, 0, 1, *epsg as u16, // ProjectedCSTypeGeoKey
        ],
    }
}
