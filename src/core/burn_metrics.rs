//! Burn-metric derivation from paired pre-/post-fire composites.
//!
//! Every delta is scaled by 1000 and truncated toward zero, matching the
//! units of the plot extractions the severity model was trained against.
//! The RdNBR denominator diverged across published formulations, so the
//! strategy is explicit configuration rather than a silent default.

use log::debug;
use ndarray::Zip;
use serde::{Deserialize, Serialize};

use crate::types::{BandGrid, FireError, FireResult, IndexComposite};

/// Integer scaling applied to index deltas
const DELTA_SCALE: f32 = 1000.0;

/// Denominator magnitude floor guarding RdNBR against division blowup
const RDNBR_FLOOR: f32 = 0.001;

/// How the RdNBR denominator is formed from pre-fire NBR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RdnbrDenominator {
    /// sqrt(max(|pre_nbr|, 0.001)); the Parks et al. (2019) updated
    /// formulation, with the floor preventing division blowup
    #[default]
    FlooredSqrt,
    /// sqrt(|pre_nbr|) with no floor; zero pre-fire NBR masks the pixel
    PlainSqrt,
    /// pre_nbr + 1.001, the flat-offset historical variant
    FlatOffset,
}

impl RdnbrDenominator {
    fn evaluate(&self, pre_nbr: f32) -> f32 {
        match self {
            RdnbrDenominator::FlooredSqrt => pre_nbr.abs().max(RDNBR_FLOOR).sqrt(),
            RdnbrDenominator::PlainSqrt => pre_nbr.abs().sqrt(),
            RdnbrDenominator::FlatOffset => pre_nbr + 1.001,
        }
    }
}

/// Burn-metric configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BurnMetricParams {
    pub rdnbr_denominator: RdnbrDenominator,
}

/// The derived bands consumed by inference, classification, and export
#[derive(Debug, Clone)]
pub struct BurnMetrics {
    pub dnbr: BandGrid,
    pub rbr: BandGrid,
    pub rdnbr: BandGrid,
    pub dndvi: BandGrid,
    pub devi: BandGrid,
    pub dndmi: BandGrid,
    pub dmirbi: BandGrid,
    /// Post-fire NBR, unscaled; drives validity masking downstream
    pub post_nbr: BandGrid,
    /// Post-fire MIRBI × 1000, the scale the model was trained on
    pub post_mirbi: BandGrid,
}

impl BurnMetrics {
    pub fn shape(&self) -> (usize, usize) {
        self.dnbr.dim()
    }

    pub fn bands(&self) -> [(&'static str, &BandGrid); 9] {
        [
            ("dnbr", &self.dnbr),
            ("rbr", &self.rbr),
            ("rdnbr", &self.rdnbr),
            ("dndvi", &self.dndvi),
            ("devi", &self.devi),
            ("dndmi", &self.dndmi),
            ("dmirbi", &self.dmirbi),
            ("post_nbr", &self.post_nbr),
            ("post_mirbi", &self.post_mirbi),
        ]
    }
}

/// Derives burn metrics from composite pairs
#[derive(Debug, Clone)]
pub struct BurnMetricCalculator {
    params: BurnMetricParams,
}

impl BurnMetricCalculator {
    pub fn new(params: BurnMetricParams) -> Self {
        BurnMetricCalculator { params }
    }

    pub fn params(&self) -> &BurnMetricParams {
        &self.params
    }

    /// Compute all metric bands for one pre/post pair.
    ///
    /// Deterministic, no side effects; masked input pixels propagate into
    /// every metric that references them.
    pub fn derive(&self, pre: &IndexComposite, post: &IndexComposite) -> FireResult<BurnMetrics> {
        if pre.shape() != post.shape() {
            return Err(FireError::ShapeMismatch {
                expected: pre.shape(),
                actual: post.shape(),
            });
        }
        debug!(
            "burn metrics: deriving over {:?} with {:?} denominator",
            pre.shape(),
            self.params.rdnbr_denominator
        );

        let dnbr = scaled_delta(&pre.nbr, &post.nbr);

        // dNBR feeds both relativized forms in its truncated integer form
        let mut rbr = BandGrid::zeros(dnbr.dim());
        Zip::from(&mut rbr)
            .and(&dnbr)
            .and(&pre.nbr)
            .par_for_each(|o, &d, &p| *o = trunc_or_mask(d / (p + 1.001)));

        let denom = self.params.rdnbr_denominator;
        let mut rdnbr = BandGrid::zeros(dnbr.dim());
        Zip::from(&mut rdnbr)
            .and(&dnbr)
            .and(&pre.nbr)
            .par_for_each(|o, &d, &p| *o = trunc_or_mask(d / denom.evaluate(p)));

        let dndvi = scaled_delta(&pre.ndvi, &post.ndvi);
        let devi = scaled_delta(&pre.evi, &post.evi);
        let dndmi = scaled_delta(&pre.ndmi, &post.ndmi);
        let dmirbi = scaled_delta(&pre.mirbi, &post.mirbi);

        let post_mirbi = post.mirbi.mapv(|v| trunc_or_mask(v * DELTA_SCALE));

        Ok(BurnMetrics {
            dnbr,
            rbr,
            rdnbr,
            dndvi,
            devi,
            dndmi,
            dmirbi,
            post_nbr: post.nbr.clone(),
            post_mirbi,
        })
    }
}

/// ((pre - post) * 1000) truncated toward zero, masked where either side is
fn scaled_delta(pre: &BandGrid, post: &BandGrid) -> BandGrid {
    let mut out = BandGrid::zeros(pre.dim());
    Zip::from(&mut out)
        .and(pre)
        .and(post)
        .par_for_each(|o, &a, &b| *o = trunc_or_mask((a - b) * DELTA_SCALE));
    out
}

fn trunc_or_mask(v: f32) -> f32 {
    if v.is_finite() {
        v.trunc()
    } else {
        f32::NAN
    }
}
