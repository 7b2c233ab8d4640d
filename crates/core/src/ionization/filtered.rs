//! Filtered copies of the step's input fields
//!
//! Each input is clipped and transformed once per step. For every radius the
//! spectrum is copied into a shared scratch buffer, smoothed (except on the
//! smallest radius, which keeps the cell scale), brought back to real space
//! and clipped to its physical range.

use crate::filter::{FilterKind, GridFilterEngine};
use crate::grid::{Field3D, SpectralField};
use crate::radii::RadiusSpec;

/// One input field and its smoothed real-space copy
#[derive(Debug)]
pub(super) struct SmoothedField {
    unfiltered: SpectralField,
    kernel: FilterKind,
    clip: (f32, f32),
    /// Smoothed field of the current radius
    pub(super) real: Field3D,
}

impl SmoothedField {
    /// Clip `field × factor` into `input_clip` and transform it
    ///
    /// After every refresh the smoothed field is clipped into `output_clip`.
    pub(super) fn prepare(
        engine: &GridFilterEngine,
        field: &Field3D,
        factor: f64,
        input_clip: (f32, f32),
        kernel: FilterKind,
        output_clip: (f32, f32),
    ) -> Self {
        let mut input = field.clone();
        if factor != 1.0 {
            input.scale(factor);
        }
        input.clamp(input_clip.0, input_clip.1);
        Self {
            unfiltered: engine.forward(&input),
            kernel,
            clip: output_clip,
            real: Field3D::new(field.layout),
        }
    }

    fn refresh(&mut self, engine: &GridFilterEngine, scratch: &mut SpectralField, radius: &RadiusSpec) {
        scratch.copy_from(&self.unfiltered);
        if radius.index > 0 {
            engine.filter(scratch, self.kernel, radius.radius);
        }
        engine.inverse(scratch, &mut self.real);
        self.real.clamp(self.clip.0, self.clip.1);
    }

    /// Value in cell `index`
    #[inline]
    pub(super) fn at(&self, index: usize) -> f64 {
        f64::from(self.real.data[index])
    }

    /// Smallest and largest smoothed value
    pub(super) fn extrema(&self) -> (f64, f64) {
        let (lo, hi) = self.real.min_max();
        (f64::from(lo), f64::from(hi))
    }
}

/// Inputs of the excursion-set loop, filtered per radius
#[derive(Debug)]
pub(super) struct FilteredGrids<'e> {
    engine: &'e GridFilterEngine,
    scratch: SpectralField,
    pub(super) density: SmoothedField,
    pub(super) prev_density: Option<SmoothedField>,
    pub(super) x_e: Option<SmoothedField>,
    pub(super) n_rec: Option<SmoothedField>,
    /// Ionizing photon density of the halo box
    pub(super) stars: Option<SmoothedField>,
    /// Escape-weighted star formation rate of the halo box
    pub(super) sfr: Option<SmoothedField>,
    pub(super) log10_mturn: Option<SmoothedField>,
    pub(super) log10_mturn_mini: Option<SmoothedField>,
}

impl<'e> FilteredGrids<'e> {
    pub(super) fn new(engine: &'e GridFilterEngine, density: SmoothedField) -> Self {
        Self {
            engine,
            scratch: SpectralField::new(engine.layout()),
            density,
            prev_density: None,
            x_e: None,
            n_rec: None,
            stars: None,
            sfr: None,
            log10_mturn: None,
            log10_mturn_mini: None,
        }
    }

    /// Smooth every field on `radius`
    pub(super) fn refresh(&mut self, radius: &RadiusSpec) {
        let fields = [
            Some(&mut self.density),
            self.prev_density.as_mut(),
            self.x_e.as_mut(),
            self.n_rec.as_mut(),
            self.stars.as_mut(),
            self.sfr.as_mut(),
            self.log10_mturn.as_mut(),
            self.log10_mturn_mini.as_mut(),
        ];
        for field in fields.into_iter().flatten() {
            field.refresh(self.engine, &mut self.scratch, radius);
        }
    }
}
