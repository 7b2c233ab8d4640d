//! Real-to-complex and complex-to-real 3D transforms
//!
//! Built from 1D `rustfft` passes along each axis. The forward transform keeps
//! only the non-redundant half of the last axis. The inverse rebuilds the
//! missing half from Hermitian symmetry and is unnormalised, so a forward pass
//! followed by an inverse pass scales a field by the number of cells.

use crate::grid::{Field3D, GridLayout, SpectralField};
use rayon::prelude::*;
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::fmt;
use std::sync::Arc;

/// Planned 3D transforms for one grid layout
pub struct Fft3d {
    layout: GridLayout,
    forward: [Arc<dyn Fft<f32>>; 3],
    inverse: [Arc<dyn Fft<f32>>; 3],
}

impl fmt::Debug for Fft3d {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fft3d")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl Fft3d {
    /// Plan transforms for `layout`
    pub fn new(layout: GridLayout) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let forward = [
            planner.plan_fft_forward(layout.nx),
            planner.plan_fft_forward(layout.ny),
            planner.plan_fft_forward(layout.nz),
        ];
        let inverse = [
            planner.plan_fft_inverse(layout.nx),
            planner.plan_fft_inverse(layout.ny),
            planner.plan_fft_inverse(layout.nz),
        ];
        Self {
            layout,
            forward,
            inverse,
        }
    }

    /// Grid this transform was planned for
    pub fn layout(&self) -> GridLayout {
        self.layout
    }

    /// Unnormalised forward transform of `field` into `out`
    ///
    /// # Panics
    ///
    /// Panics if either buffer does not match the planned layout
    pub fn forward(&self, field: &Field3D, out: &mut SpectralField) {
        assert_eq!(field.layout, self.layout, "Grid layouts differ");
        assert_eq!(out.layout, self.layout, "Grid layouts differ");
        let mut full: Vec<Complex32> = field
            .as_slice()
            .par_iter()
            .map(|&v| Complex32::new(v, 0.0))
            .collect();
        self.transform_all(&mut full, &self.forward);

        let (nz, half) = (self.layout.nz, self.layout.nz_half());
        out.as_mut_slice()
            .par_chunks_mut(half)
            .zip(full.par_chunks(nz))
            .for_each(|(dst, src)| dst.copy_from_slice(&src[..half]));
    }

    /// Unnormalised inverse transform of `spectrum` into `out`
    ///
    /// # Panics
    ///
    /// Panics if either buffer does not match the planned layout
    pub fn inverse(&self, spectrum: &SpectralField, out: &mut Field3D) {
        assert_eq!(spectrum.layout, self.layout, "Grid layouts differ");
        assert_eq!(out.layout, self.layout, "Grid layouts differ");
        let GridLayout { nx, ny, nz, .. } = self.layout;
        let half = self.layout.nz_half();
        let modes = spectrum.as_slice();

        let mut full = vec![Complex32::new(0.0, 0.0); self.layout.real_len()];
        full.par_chunks_mut(nz).enumerate().for_each(|(row, dst)| {
            let (x, y) = (row / ny, row % ny);
            let (mx, my) = ((nx - x) % nx, (ny - y) % ny);
            for (z, value) in dst.iter_mut().enumerate() {
                *value = if z < half {
                    modes[z + half * (y + ny * x)]
                } else {
                    modes[(nz - z) + half * (my + ny * mx)].conj()
                };
            }
        });
        self.transform_all(&mut full, &self.inverse);

        out.as_mut_slice()
            .par_iter_mut()
            .zip(full.par_iter())
            .for_each(|(dst, src)| *dst = src.re);
    }

    fn transform_all(&self, buf: &mut [Complex32], plans: &[Arc<dyn Fft<f32>>; 3]) {
        let GridLayout { nx, ny, nz, .. } = self.layout;

        // z: contiguous rows
        let plan = &plans[2];
        buf.par_chunks_mut(nz).for_each(|row| plan.process(row));

        // y: strided within each x-slab
        let plan = &plans[1];
        buf.par_chunks_mut(ny * nz).for_each(|slab| {
            let mut line = vec![Complex32::new(0.0, 0.0); ny];
            for z in 0..nz {
                for (y, v) in line.iter_mut().enumerate() {
                    *v = slab[z + nz * y];
                }
                plan.process(&mut line);
                for (y, v) in line.iter().enumerate() {
                    slab[z + nz * y] = *v;
                }
            }
        });

        // x: stride of a whole slab
        let plan = &plans[0];
        let plane = ny * nz;
        let columns: Vec<Vec<Complex32>> = (0..plane)
            .into_par_iter()
            .map(|j| {
                let mut line: Vec<Complex32> = (0..nx).map(|x| buf[j + plane * x]).collect();
                plan.process(&mut line);
                line
            })
            .collect();
        for (j, line) in columns.into_iter().enumerate() {
            for (x, v) in line.into_iter().enumerate() {
                buf[j + plane * x] = v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_roundtrip_scales_by_cell_count() {
        let layout = GridLayout::new(4, 6, 4.0, 6.0);
        let fft = Fft3d::new(layout);
        let mut field = Field3D::new(layout);
        for (i, v) in field.as_mut_slice().iter_mut().enumerate() {
            *v = ((i * 7) % 11) as f32 - 3.0;
        }
        let mut spectrum = SpectralField::new(layout);
        fft.forward(&field, &mut spectrum);
        let mut back = Field3D::new(layout);
        fft.inverse(&spectrum, &mut back);
        let n = layout.real_len() as f32;
        for (a, b) in field.as_slice().iter().zip(back.as_slice()) {
            assert_relative_eq!(*a, *b / n, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_zero_mode_is_sum() {
        let layout = GridLayout::cubic(4, 1.0);
        let fft = Fft3d::new(layout);
        let field = Field3D::with_value(layout, 0.5);
        let mut spectrum = SpectralField::new(layout);
        fft.forward(&field, &mut spectrum);
        assert_relative_eq!(spectrum.as_slice()[0].re, 32.0, epsilon = 1e-4);
        assert!(spectrum.as_slice()[1..].iter().all(|c| c.norm() < 1e-4));
    }
}
