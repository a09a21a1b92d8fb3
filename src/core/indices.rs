//! Spectral index derivation for Landsat Collection 2 surface reflectance.
//!
//! Scenes arrive from the store as raw digital numbers. The builder
//! rescales them to reflectance, masks pixels the QA band flags as cloud,
//! cloud shadow, snow, or water, and computes the five index bands the
//! severity pipeline consumes: NBR, NDVI, NDMI, EVI, and MIRBI. Band
//! formulas differ between the OLI and TM/ETM+ sensor generations because
//! the source band numbering shifted.

use log::{debug, info};
use ndarray::Zip;

use crate::io::catalog::{IndexCollection, SceneCatalog};
use crate::types::{
    BandGrid, FireError, FireResult, IndexScene, QaGrid, RawScene, SensorGeneration,
};

/// Linear rescale from Collection 2 digital numbers to surface reflectance
pub const REFLECTANCE_SCALE: f32 = 0.000_027_5;
pub const REFLECTANCE_OFFSET: f32 = -0.2;

// QA_PIXEL bit flags
const QA_CLOUD: u16 = 1 << 3;
const QA_CLOUD_SHADOW: u16 = 1 << 4;
const QA_SNOW: u16 = 1 << 5;
const QA_WATER: u16 = 1 << 7;

/// Which 1-based source band plays each spectral role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpectralRoles {
    pub blue: usize,
    pub red: usize,
    pub nir: usize,
    pub swir1: usize,
    pub swir2: usize,
}

impl SensorGeneration {
    pub fn spectral_roles(&self) -> SpectralRoles {
        match self {
            SensorGeneration::Oli => SpectralRoles { blue: 2, red: 4, nir: 5, swir1: 6, swir2: 7 },
            SensorGeneration::TmEtm => SpectralRoles { blue: 1, red: 3, nir: 4, swir1: 5, swir2: 7 },
        }
    }
}

/// A pixel is usable only when none of the cloud, cloud-shadow, snow, and
/// water bits are set
pub fn qa_clear(qa: u16) -> bool {
    qa & (QA_CLOUD | QA_CLOUD_SHADOW | QA_SNOW | QA_WATER) == 0
}

/// (a - b) / (a + b), masked where the denominator is zero
pub fn normalized_difference(a: f32, b: f32) -> f32 {
    let sum = a + b;
    if sum == 0.0 {
        return f32::NAN;
    }
    finite_or_nan((a - b) / sum)
}

fn finite_or_nan(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        f32::NAN
    }
}

fn rescale(dn: &BandGrid) -> BandGrid {
    dn.mapv(|v| v * REFLECTANCE_SCALE + REFLECTANCE_OFFSET)
}

fn normalized_difference_grid(a: &BandGrid, b: &BandGrid) -> BandGrid {
    let mut out = BandGrid::zeros(a.dim());
    Zip::from(&mut out)
        .and(a)
        .and(b)
        .par_for_each(|o, &a, &b| *o = normalized_difference(a, b));
    out
}

fn evi_grid(nir: &BandGrid, red: &BandGrid, blue: &BandGrid) -> BandGrid {
    let mut out = BandGrid::zeros(nir.dim());
    Zip::from(&mut out)
        .and(nir)
        .and(red)
        .and(blue)
        .par_for_each(|o, &n, &r, &b| {
            *o = finite_or_nan(2.5 * (n - r) / (n + 6.0 * r - 7.5 * b + 1.0));
        });
    out
}

fn mirbi_grid(swir1: &BandGrid, swir2: &BandGrid) -> BandGrid {
    let mut out = BandGrid::zeros(swir1.dim());
    Zip::from(&mut out)
        .and(swir1)
        .and(swir2)
        .par_for_each(|o, &s1, &s2| *o = finite_or_nan(10.0 * s1 - 9.8 * s2 + 2.0));
    out
}

fn apply_qa(band: &mut BandGrid, qa: &QaGrid) {
    Zip::from(band).and(qa).par_for_each(|v, &q| {
        if !qa_clear(q) {
            *v = f32::NAN;
        }
    });
}

/// Reduce one raw scene to its index bands.
///
/// Pure transform: the acquisition timestamp, sensor tag, footprint, and
/// quality band all carry through unchanged.
pub fn build_index_scene(raw: &RawScene) -> FireResult<IndexScene> {
    let roles = raw.sensor.spectral_roles();
    let fetch = |number: usize| -> FireResult<&BandGrid> {
        raw.band(number).ok_or_else(|| {
            FireError::InvalidInput(format!("scene {} has no source band {number}", raw.id))
        })
    };
    let blue = fetch(roles.blue)?;
    let red = fetch(roles.red)?;
    let nir = fetch(roles.nir)?;
    let swir1 = fetch(roles.swir1)?;
    let swir2 = fetch(roles.swir2)?;

    let shape = raw.qa.dim();
    for band in [blue, red, nir, swir1, swir2] {
        if band.dim() != shape {
            return Err(FireError::ShapeMismatch { expected: shape, actual: band.dim() });
        }
    }

    let blue = rescale(blue);
    let red = rescale(red);
    let nir = rescale(nir);
    let swir1 = rescale(swir1);
    let swir2 = rescale(swir2);

    let mut nbr = normalized_difference_grid(&nir, &swir2);
    let mut ndvi = normalized_difference_grid(&nir, &red);
    let mut ndmi = normalized_difference_grid(&nir, &swir1);
    let mut evi = evi_grid(&nir, &red, &blue);
    let mut mirbi = mirbi_grid(&swir1, &swir2);

    for band in [&mut nbr, &mut ndvi, &mut ndmi, &mut evi, &mut mirbi] {
        apply_qa(band, &raw.qa);
    }

    debug!("indices: built {} ({}, {})", raw.id, raw.sensor, raw.acquired.date_naive());

    Ok(IndexScene {
        id: raw.id.clone(),
        acquired: raw.acquired,
        sensor: raw.sensor,
        footprint: raw.footprint,
        nbr,
        ndvi,
        ndmi,
        evi,
        mirbi,
        quality: raw.qa.clone(),
    })
}

/// Map the index builder across the whole catalog
pub fn build_index_collection(catalog: &SceneCatalog) -> FireResult<IndexCollection> {
    let mut scenes = Vec::with_capacity(catalog.len());
    for raw in catalog.scenes() {
        scenes.push(std::sync::Arc::new(build_index_scene(raw)?));
    }
    info!("indices: {} scenes reduced to index bands", scenes.len());
    Ok(IndexCollection::new(*catalog.grid(), scenes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoBounds, GridValue};
    use approx::assert_relative_eq;
    use chrono::NaiveDateTime;
    use ndarray::Array2;

    /// Digital number that rescales to the requested reflectance
    fn dn_for(reflectance: GridValue) -> GridValue {
        (reflectance - REFLECTANCE_OFFSET) / REFLECTANCE_SCALE
    }

    fn raw_scene(sensor: SensorGeneration, reflectances: [f32; 7]) -> RawScene {
        let bands = reflectances
            .iter()
            .map(|&r| Array2::from_elem((2, 2), dn_for(r)))
            .collect();
        RawScene {
            id: "TEST_SCENE".into(),
            acquired: NaiveDateTime::parse_from_str("2015-07-04 18:30:00", "%Y-%m-%d %H:%M:%S")
                .unwrap()
                .and_utc(),
            sensor,
            footprint: GeoBounds::new(-120.0, -119.0, 38.0, 39.0),
            bands,
            qa: Array2::zeros((2, 2)),
        }
    }

    #[test]
    fn rescale_applies_collection2_gain_and_offset() {
        let dn = Array2::from_elem((1, 1), 43636.0f32);
        let r = rescale(&dn);
        assert_relative_eq!(r[(0, 0)], 43636.0 * 0.0000275 - 0.2, epsilon = 1e-6);
    }

    #[test]
    fn oli_nbr_uses_nir_and_swir2() {
        // b5 = 0.5 (NIR), b7 = 0.1 (SWIR2) -> NBR = 0.4 / 0.6
        let scene = raw_scene(SensorGeneration::Oli, [0.0, 0.05, 0.0, 0.2, 0.5, 0.3, 0.1]);
        let idx = build_index_scene(&scene).unwrap();
        assert_relative_eq!(idx.nbr[(0, 0)], (0.5 - 0.1) / (0.5 + 0.1), epsilon = 1e-5);
        assert_relative_eq!(idx.ndvi[(0, 0)], (0.5 - 0.2) / (0.5 + 0.2), epsilon = 1e-5);
        assert_relative_eq!(idx.ndmi[(0, 0)], (0.5 - 0.3) / (0.5 + 0.3), epsilon = 1e-5);
    }

    #[test]
    fn legacy_sensor_reads_shifted_bands() {
        // same values placed one band lower: b4 = NIR, b5 = SWIR1, b3 = red, b1 = blue
        let scene = raw_scene(SensorGeneration::TmEtm, [0.05, 0.0, 0.2, 0.5, 0.3, 0.0, 0.1]);
        let idx = build_index_scene(&scene).unwrap();
        assert_relative_eq!(idx.nbr[(0, 0)], (0.5 - 0.1) / (0.5 + 0.1), epsilon = 1e-5);
        assert_relative_eq!(idx.ndvi[(0, 0)], (0.5 - 0.2) / (0.5 + 0.2), epsilon = 1e-5);
        assert_relative_eq!(
            idx.mirbi[(0, 0)],
            10.0 * 0.3 - 9.8 * 0.1 + 2.0,
            epsilon = 1e-4
        );
    }

    #[test]
    fn evi_matches_reference_formula() {
        let scene = raw_scene(SensorGeneration::Oli, [0.0, 0.05, 0.0, 0.2, 0.5, 0.3, 0.1]);
        let idx = build_index_scene(&scene).unwrap();
        let expected = 2.5 * (0.5 - 0.2) / (0.5 + 6.0 * 0.2 - 7.5 * 0.05 + 1.0);
        assert_relative_eq!(idx.evi[(0, 0)], expected, epsilon = 1e-5);
    }

    #[test]
    fn qa_flags_mask_every_index_band() {
        for bit in [3u16, 4, 5, 7] {
            let mut scene = raw_scene(SensorGeneration::Oli, [0.0, 0.05, 0.0, 0.2, 0.5, 0.3, 0.1]);
            scene.qa[(0, 1)] = 1 << bit;
            let idx = build_index_scene(&scene).unwrap();
            for (_, band) in [
                ("nbr", &idx.nbr),
                ("ndvi", &idx.ndvi),
                ("ndmi", &idx.ndmi),
                ("evi", &idx.evi),
                ("mirbi", &idx.mirbi),
            ] {
                assert!(band[(0, 1)].is_nan(), "bit {bit} not masked");
                assert!(band[(0, 0)].is_finite());
            }
        }
    }

    #[test]
    fn unrelated_qa_bits_do_not_mask() {
        let mut scene = raw_scene(SensorGeneration::Oli, [0.0, 0.05, 0.0, 0.2, 0.5, 0.3, 0.1]);
        scene.qa[(0, 0)] = (1 << 1) | (1 << 6); // dilated cloud + clear confidence bits
        let idx = build_index_scene(&scene).unwrap();
        assert!(idx.nbr[(0, 0)].is_finite());
    }

    #[test]
    fn acquisition_metadata_survives_the_transform() {
        let scene = raw_scene(SensorGeneration::Oli, [0.0, 0.05, 0.0, 0.2, 0.5, 0.3, 0.1]);
        let idx = build_index_scene(&scene).unwrap();
        assert_eq!(idx.acquired, scene.acquired);
        assert_eq!(idx.sensor, scene.sensor);
        assert_eq!(idx.footprint, scene.footprint);
    }

    #[test]
    fn zero_denominator_masks_normalized_difference() {
        assert!(normalized_difference(0.5, -0.5).is_nan());
        assert_relative_eq!(normalized_difference(0.5, 0.1), 0.4 / 0.6);
    }

    #[test]
    fn missing_band_is_reported() {
        let mut scene = raw_scene(SensorGeneration::Oli, [0.0, 0.05, 0.0, 0.2, 0.5, 0.3, 0.1]);
        scene.bands.truncate(5); // drop b6/b7
        assert!(build_index_scene(&scene).is_err());
    }
}
