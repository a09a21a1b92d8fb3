use chrono::{DateTime, NaiveDate, Utc};
use geo::MultiPolygon;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Continuous raster value type; NaN marks a masked pixel
pub type GridValue = f32;

/// 2D continuous band grid (rows x cols); NaN marks masked pixels
pub type BandGrid = Array2<GridValue>;

/// 2D categorical code grid (land-cover codes, fire-regime codes)
pub type CodeGrid = Array2<i32>;

/// 2D class/binary grid; 0 means "no" or no-data
pub type ClassGrid = Array2<u8>;

/// 2D quality-flag grid (Landsat QA_PIXEL bit flags)
pub type QaGrid = Array2<u16>;

/// Authalic Earth radius in meters, used for geographic pixel areas
pub const EARTH_RADIUS_M: f64 = 6_371_007.181;

/// Coordinate reference system of the analysis grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Crs {
    /// Geographic coordinates (longitude, latitude in degrees)
    Geographic,
    /// Projected coordinates (e.g., CONUS Albers equal-area)
    Projected { epsg: u32 },
}

/// Landsat sensor generations with different source band layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorGeneration {
    /// OLI/OLI-2 sensors (Landsat 8/9)
    Oli,
    /// TM and ETM+ sensors (Landsat 4/5/7)
    TmEtm,
}

impl std::fmt::Display for SensorGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorGeneration::Oli => write!(f, "OLI"),
            SensorGeneration::TmEtm => write!(f, "TM/ETM+"),
        }
    }
}

/// Geospatial bounding box in grid coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl GeoBounds {
    pub fn new(min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> Self {
        Self { min_x, max_x, min_y, max_y }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn intersects(&self, other: &GeoBounds) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }
}

/// Geospatial transformation parameters (north-up affine)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub top_left_y: f64,
    pub pixel_height: f64, // negative for north-up grids
}

impl GeoTransform {
    /// Coordinates of the center of pixel (row, col)
    pub fn xy_at(&self, row: usize, col: usize) -> (f64, f64) {
        let x = self.top_left_x + (col as f64 + 0.5) * self.pixel_width;
        let y = self.top_left_y + (row as f64 + 0.5) * self.pixel_height;
        (x, y)
    }

    /// Pixel indices containing the point, unbounded (caller clamps to grid)
    pub fn index_of(&self, x: f64, y: f64) -> (i64, i64) {
        let col = ((x - self.top_left_x) / self.pixel_width).floor() as i64;
        let row = ((y - self.top_left_y) / self.pixel_height).floor() as i64;
        (row, col)
    }
}

/// Shared analysis grid: affine transform, dimensions, and CRS.
///
/// Every raster in a pipeline run is aligned to one of these; the
/// image/feature store resamples on ingest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub transform: GeoTransform,
    pub rows: usize,
    pub cols: usize,
    pub crs: Crs,
}

impl GridSpec {
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn bounds(&self) -> GeoBounds {
        let t = &self.transform;
        let x0 = t.top_left_x;
        let x1 = t.top_left_x + t.pixel_width * self.cols as f64;
        let y0 = t.top_left_y;
        let y1 = t.top_left_y + t.pixel_height * self.rows as f64;
        GeoBounds::new(x0.min(x1), x0.max(x1), y0.min(y1), y0.max(y1))
    }

    /// Ground area of one pixel in row `row`, in square meters.
    ///
    /// Projected grids have constant cell area; geographic grids use a
    /// spherical strip area that varies with latitude.
    pub fn pixel_area_m2(&self, row: usize) -> f64 {
        let t = &self.transform;
        match self.crs {
            Crs::Projected { .. } => (t.pixel_width * t.pixel_height).abs(),
            Crs::Geographic => {
                let lat_top = t.top_left_y + t.pixel_height * row as f64;
                let lat_bottom = lat_top + t.pixel_height;
                let dlon = t.pixel_width.to_radians().abs();
                let strip = (lat_top.to_radians().sin() - lat_bottom.to_radians().sin()).abs();
                EARTH_RADIUS_M * EARTH_RADIUS_M * dlon * strip
            }
        }
    }

    /// Per-pixel ground area as a full grid; constant along each row.
    pub fn pixel_area_grid(&self) -> BandGrid {
        let by_row: Vec<f32> = (0..self.rows).map(|r| self.pixel_area_m2(r) as f32).collect();
        Array2::from_shape_fn((self.rows, self.cols), |(r, _)| by_row[r])
    }
}

/// Day-of-year window bounding the growing season, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrowingSeason {
    pub start_day: u32,
    pub end_day: u32,
}

impl GrowingSeason {
    /// Early growing season used for the two southwestern sub-regions
    pub const SOUTHWEST: GrowingSeason = GrowingSeason { start_day: 91, end_day: 181 };

    pub fn contains(&self, day_of_year: u32) -> bool {
        day_of_year >= self.start_day && day_of_year <= self.end_day
    }
}

impl Default for GrowingSeason {
    fn default() -> Self {
        // June through mid-September, the western-US default
        GrowingSeason { start_day: 152, end_day: 258 }
    }
}

/// One satellite acquisition as delivered by the store: raw digital-number
/// surface-reflectance bands plus the pixel quality band.
#[derive(Debug, Clone)]
pub struct RawScene {
    pub id: String,
    pub acquired: DateTime<Utc>,
    pub sensor: SensorGeneration,
    pub footprint: GeoBounds,
    /// Source bands indexed by Landsat band number minus one (b1 at index 0)
    pub bands: Vec<BandGrid>,
    pub qa: QaGrid,
}

impl RawScene {
    /// Source band by 1-based Landsat band number
    pub fn band(&self, number: usize) -> Option<&BandGrid> {
        if number == 0 {
            return None;
        }
        self.bands.get(number - 1)
    }
}

/// One acquisition reduced to the five spectral index bands, with
/// cloud/shadow/snow/water pixels masked out. The acquisition timestamp
/// survives the transform for temporal filtering downstream.
#[derive(Debug, Clone)]
pub struct IndexScene {
    pub id: String,
    pub acquired: DateTime<Utc>,
    pub sensor: SensorGeneration,
    pub footprint: GeoBounds,
    pub nbr: BandGrid,
    pub ndvi: BandGrid,
    pub ndmi: BandGrid,
    pub evi: BandGrid,
    pub mirbi: BandGrid,
    pub quality: QaGrid,
}

/// Mean-reduced index bands for one temporal window (pre-fire or post-fire)
#[derive(Debug, Clone)]
pub struct IndexComposite {
    pub nbr: BandGrid,
    pub ndvi: BandGrid,
    pub ndmi: BandGrid,
    pub evi: BandGrid,
    pub mirbi: BandGrid,
}

impl IndexComposite {
    /// Composite with every pixel masked, for windows with no imagery
    pub fn fully_masked(rows: usize, cols: usize) -> Self {
        let nan = Array2::from_elem((rows, cols), f32::NAN);
        IndexComposite {
            nbr: nan.clone(),
            ndvi: nan.clone(),
            ndmi: nan.clone(),
            evi: nan.clone(),
            mirbi: nan,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.nbr.dim()
    }

    pub fn bands(&self) -> [(&'static str, &BandGrid); 5] {
        [
            ("nbr", &self.nbr),
            ("ndvi", &self.ndvi),
            ("ndmi", &self.ndmi),
            ("evi", &self.evi),
            ("mirbi", &self.mirbi),
        ]
    }

    pub fn bands_mut(&mut self) -> [(&'static str, &mut BandGrid); 5] {
        [
            ("nbr", &mut self.nbr),
            ("ndvi", &mut self.ndvi),
            ("ndmi", &mut self.ndmi),
            ("evi", &mut self.evi),
            ("mirbi", &mut self.mirbi),
        ]
    }
}

/// A fire perimeter with its ignition attributes. Immutable once ingested.
#[derive(Debug, Clone)]
pub struct FireEvent {
    pub id: String,
    pub year: i32,
    pub ignition_date: Option<NaiveDate>,
    pub geometry: MultiPolygon<f64>,
}

/// A named aggregation boundary (state, ecoregion, watershed)
#[derive(Debug, Clone)]
pub struct SummaryRegion {
    pub name: String,
    pub geometry: MultiPolygon<f64>,
}

/// Error types for severity processing
#[derive(Debug, thiserror::Error)]
pub enum FireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Grid shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("No classification layers for year {year}")]
    MissingYear { year: i32 },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),
}

/// Result type for severity operations
pub type FireResult<T> = Result<T, FireError>;
