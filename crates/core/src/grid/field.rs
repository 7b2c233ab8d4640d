//! Real and spectral field containers
//!
//! Both containers own one contiguous buffer and carry the [`GridLayout`]
//! that produced them. Mixing a real field with a spectral buffer of the
//! wrong size is caught by construction.

use super::GridLayout;
use rayon::prelude::*;
use rustfft::num_complex::Complex32;

/// Real-valued 3D field stored as a flat `Vec<f32>`
#[derive(Debug, Clone, PartialEq)]
pub struct Field3D {
    /// Values in real-space order (see [`GridLayout::real_index`])
    pub data: Vec<f32>,
    /// Grid shape
    pub layout: GridLayout,
}

impl Field3D {
    /// Create a new field initialized to zero
    #[must_use]
    pub fn new(layout: GridLayout) -> Self {
        Self::with_value(layout, 0.0)
    }

    /// Create a new field with every cell set to `value`
    ///
    /// # Arguments
    ///
    /// * `layout` - Grid shape
    /// * `value` - Initial value for all cells
    ///
    /// # Returns
    ///
    /// New field initialized to the specified value
    #[must_use]
    pub fn with_value(layout: GridLayout, value: f32) -> Self {
        Self {
            data: vec![value; layout.real_len()],
            layout,
        }
    }

    /// Wrap an existing buffer
    ///
    /// # Panics
    ///
    /// Panics if the buffer length does not match the layout
    #[must_use]
    pub fn from_vec(layout: GridLayout, data: Vec<f32>) -> Self {
        assert_eq!(
            data.len(),
            layout.real_len(),
            "Field length does not match grid layout"
        );
        Self { data, layout }
    }

    /// Get reference to field data
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Get mutable reference to field data
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Number of cells
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-sized grid
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get value at grid position
    ///
    /// # Panics
    ///
    /// Panics if coordinates are out of bounds
    #[must_use]
    pub fn get(&self, x: usize, y: usize, z: usize) -> f32 {
        self.data[self.layout.real_index(x, y, z)]
    }

    /// Set value at grid position
    ///
    /// # Panics
    ///
    /// Panics if coordinates are out of bounds
    pub fn set(&mut self, x: usize, y: usize, z: usize, value: f32) {
        let index = self.layout.real_index(x, y, z);
        self.data[index] = value;
    }

    /// Fill entire field with a value
    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    /// Box average, accumulated in double precision
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.data.par_iter().map(|&v| f64::from(v)).sum();
        sum / self.data.len() as f64
    }

    /// Smallest and largest value
    #[must_use]
    pub fn min_max(&self) -> (f32, f32) {
        self.data
            .par_iter()
            .fold(
                || (f32::INFINITY, f32::NEG_INFINITY),
                |(lo, hi), &v| (lo.min(v), hi.max(v)),
            )
            .reduce(
                || (f32::INFINITY, f32::NEG_INFINITY),
                |a, b| (a.0.min(b.0), a.1.max(b.1)),
            )
    }

    /// Multiply every cell by `factor`
    pub fn scale(&mut self, factor: f64) {
        self.data
            .par_iter_mut()
            .for_each(|v| *v = (f64::from(*v) * factor) as f32);
    }

    /// Clamp every cell into `[lo, hi]`
    pub fn clamp(&mut self, lo: f32, hi: f32) {
        self.data.par_iter_mut().for_each(|v| *v = v.clamp(lo, hi));
    }

    /// Element-wise `self += other`
    ///
    /// # Panics
    ///
    /// Panics if the layouts differ
    pub fn accumulate(&mut self, other: &Field3D) {
        assert_eq!(self.layout, other.layout, "Grid layouts differ");
        self.data
            .par_iter_mut()
            .zip(other.data.par_iter())
            .for_each(|(a, &b)| *a += b);
    }
}

/// Half-complex spectrum of a real [`Field3D`]
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralField {
    /// Modes in k-space order (see [`GridLayout::spectral_index`])
    pub data: Vec<Complex32>,
    /// Real-space grid this spectrum belongs to
    pub layout: GridLayout,
}

impl SpectralField {
    /// Zeroed spectrum for `layout`
    #[must_use]
    pub fn new(layout: GridLayout) -> Self {
        Self {
            data: vec![Complex32::new(0.0, 0.0); layout.spectral_len()],
            layout,
        }
    }

    /// Get reference to the modes
    #[must_use]
    pub fn as_slice(&self) -> &[Complex32] {
        &self.data
    }

    /// Get mutable reference to the modes
    pub fn as_mut_slice(&mut self) -> &mut [Complex32] {
        &mut self.data
    }

    /// Overwrite this spectrum with `other` without reallocating
    ///
    /// # Panics
    ///
    /// Panics if the layouts differ
    pub fn copy_from(&mut self, other: &SpectralField) {
        assert_eq!(self.layout, other.layout, "Grid layouts differ");
        self.data.copy_from_slice(&other.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_creation() {
        let field = Field3D::new(GridLayout::cubic(4, 8.0));
        assert_eq!(field.len(), 64);
        assert!(field.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_field_get_set() {
        let layout = GridLayout::new(3, 5, 3.0, 5.0);
        let mut field = Field3D::new(layout);
        field.set(2, 1, 4, 7.5);
        assert_eq!(field.get(2, 1, 4), 7.5);
        assert_eq!(field.data[layout.real_index(2, 1, 4)], 7.5);
    }

    #[test]
    fn test_mean_and_extrema() {
        let layout = GridLayout::cubic(2, 1.0);
        let field = Field3D::from_vec(layout, vec![1.0, 2.0, 3.0, 4.0, -1.0, 0.0, 5.0, 2.0]);
        assert!((field.mean() - 2.0).abs() < 1e-12);
        assert_eq!(field.min_max(), (-1.0, 5.0));
    }

    #[test]
    fn test_spectral_length() {
        let layout = GridLayout::new(4, 6, 1.0, 1.5);
        assert_eq!(SpectralField::new(layout).as_slice().len(), 4 * 4 * 4);
    }

    #[test]
    #[should_panic(expected = "Field length does not match grid layout")]
    fn test_from_vec_length_check() {
        let _ = Field3D::from_vec(GridLayout::cubic(2, 1.0), vec![0.0; 7]);
    }

    #[test]
    #[should_panic(expected = "Coordinates out of bounds")]
    fn test_field_bounds_check() {
        let field = Field3D::new(GridLayout::cubic(4, 1.0));
        let _ = field.get(4, 0, 0);
    }
}
