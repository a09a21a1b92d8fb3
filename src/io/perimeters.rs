//! Fire-perimeter and summary-region ingestion.
//!
//! Reads GeoJSON-shaped documents (`FeatureCollection` of polygonal
//! features) into [`FireEvent`] and [`SummaryRegion`] records. Attribute
//! names vary between perimeter archives, so the event loader takes a
//! [`PerimeterSchema`] mapping; the defaults match the MTBS export
//! convention. Positions may carry an altitude term, which is dropped.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::NaiveDate;
use geo::{Coord, LineString, MultiPolygon, Polygon};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{FireError, FireEvent, FireResult, SummaryRegion};

/// Property names carrying the event attributes in a perimeter file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerimeterSchema {
    pub id_field: String,
    pub year_field: String,
    pub ignition_date_field: String,
}

impl Default for PerimeterSchema {
    fn default() -> Self {
        PerimeterSchema {
            id_field: "Event_ID".to_string(),
            year_field: "Fire_Year".to_string(),
            ignition_date_field: "Ig_Date".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FeatureCollectionDoc {
    features: Vec<FeatureDoc>,
}

#[derive(Debug, Deserialize)]
struct FeatureDoc {
    #[serde(default)]
    properties: serde_json::Map<String, Value>,
    geometry: Option<GeometryDoc>,
}

/// A position is `[x, y]` or `[x, y, z]`; rings are lists of positions.
type PolygonCoords = Vec<Vec<Vec<f64>>>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum GeometryDoc {
    Polygon { coordinates: PolygonCoords },
    MultiPolygon { coordinates: Vec<PolygonCoords> },
}

/// Parse fire events from a GeoJSON-shaped string.
pub fn fire_events_from_json(json: &str, schema: &PerimeterSchema) -> FireResult<Vec<FireEvent>> {
    events_from_doc(serde_json::from_str(json)?, schema)
}

/// Load fire events from a GeoJSON-shaped file.
pub fn load_fire_events<P: AsRef<Path>>(
    path: P,
    schema: &PerimeterSchema,
) -> FireResult<Vec<FireEvent>> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let events = events_from_doc(serde_json::from_reader(reader)?, schema)?;
    info!("loaded {} fire events from {}", events.len(), path.display());
    Ok(events)
}

/// Parse summary regions from a GeoJSON-shaped string, naming each by
/// the given property.
pub fn summary_regions_from_json(json: &str, name_field: &str) -> FireResult<Vec<SummaryRegion>> {
    regions_from_doc(serde_json::from_str(json)?, name_field)
}

/// Load summary regions from a GeoJSON-shaped file.
pub fn load_summary_regions<P: AsRef<Path>>(
    path: P,
    name_field: &str,
) -> FireResult<Vec<SummaryRegion>> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let regions = regions_from_doc(serde_json::from_reader(reader)?, name_field)?;
    info!("loaded {} summary regions from {}", regions.len(), path.display());
    Ok(regions)
}

fn events_from_doc(
    doc: FeatureCollectionDoc,
    schema: &PerimeterSchema,
) -> FireResult<Vec<FireEvent>> {
    let mut events = Vec::with_capacity(doc.features.len());
    for (i, feature) in doc.features.into_iter().enumerate() {
        let geometry = multi_polygon_of(feature.geometry, i)?;
        let id = string_property(&feature.properties, &schema.id_field, i)?;
        let year = year_property(&feature.properties, &schema.year_field, i)?;
        let ignition_date = date_property(&feature.properties, &schema.ignition_date_field, &id);
        events.push(FireEvent { id, year, ignition_date, geometry });
    }
    Ok(events)
}

fn regions_from_doc(doc: FeatureCollectionDoc, name_field: &str) -> FireResult<Vec<SummaryRegion>> {
    let mut regions = Vec::with_capacity(doc.features.len());
    for (i, feature) in doc.features.into_iter().enumerate() {
        let geometry = multi_polygon_of(feature.geometry, i)?;
        let name = string_property(&feature.properties, name_field, i)?;
        regions.push(SummaryRegion { name, geometry });
    }
    Ok(regions)
}

fn multi_polygon_of(geometry: Option<GeometryDoc>, index: usize) -> FireResult<MultiPolygon<f64>> {
    match geometry {
        Some(GeometryDoc::Polygon { coordinates }) => {
            Ok(MultiPolygon::new(vec![polygon_of(coordinates, index)?]))
        }
        Some(GeometryDoc::MultiPolygon { coordinates }) => {
            let mut polygons = Vec::with_capacity(coordinates.len());
            for coords in coordinates {
                polygons.push(polygon_of(coords, index)?);
            }
            Ok(MultiPolygon::new(polygons))
        }
        None => Err(FireError::InvalidInput(format!(
            "feature {index} has no geometry"
        ))),
    }
}

fn polygon_of(coords: PolygonCoords, index: usize) -> FireResult<Polygon<f64>> {
    let mut rings = coords.into_iter();
    let exterior = rings.next().ok_or_else(|| {
        FireError::InvalidInput(format!("feature {index} has a polygon with no rings"))
    })?;
    let exterior = ring_of(exterior, index)?;
    let interiors = rings
        .map(|ring| ring_of(ring, index))
        .collect::<FireResult<Vec<_>>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn ring_of(positions: Vec<Vec<f64>>, index: usize) -> FireResult<LineString<f64>> {
    let mut coords = Vec::with_capacity(positions.len());
    for position in positions {
        match position.as_slice() {
            [x, y, ..] => coords.push(Coord { x: *x, y: *y }),
            _ => {
                return Err(FireError::InvalidInput(format!(
                    "feature {index} has a ring position without both x and y"
                )))
            }
        }
    }
    Ok(LineString::from(coords))
}

fn string_property(
    properties: &serde_json::Map<String, Value>,
    field: &str,
    index: usize,
) -> FireResult<String> {
    match properties.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(FireError::InvalidInput(format!(
            "feature {index} is missing property {field}"
        ))),
    }
}

/// Years arrive as integers, floats, or numeric strings depending on
/// which tool exported the file.
fn year_property(
    properties: &serde_json::Map<String, Value>,
    field: &str,
    index: usize,
) -> FireResult<i32> {
    let value = properties.get(field).ok_or_else(|| {
        FireError::InvalidInput(format!("feature {index} is missing property {field}"))
    })?;
    let year = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match year {
        Some(y) if y.fract() == 0.0 => Ok(y as i32),
        _ => Err(FireError::InvalidInput(format!(
            "feature {index}: property {field} is not a year: {value}"
        ))),
    }
}

fn date_property(
    properties: &serde_json::Map<String, Value>,
    field: &str,
    event_id: &str,
) -> Option<NaiveDate> {
    let Some(Value::String(s)) = properties.get(field) else {
        return None;
    };
    match NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        Ok(date) => Some(date),
        Err(_) => {
            warn!("event {event_id}: unparsable ignition date {s:?}, keeping none");
            None
        }
    }
}
