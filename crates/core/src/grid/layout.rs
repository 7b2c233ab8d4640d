//! Real-space and Hermitian k-space index layouts
//!
//! Real grids are stored row-major as `(x, y, z)` with `z` fastest. The
//! half-complex spectrum of a real grid keeps only `z ≤ nz/2`, so its rows are
//! `nz/2 + 1` long. Both layouts live here so no caller ever computes an
//! offset by hand.

use std::f64::consts::PI;

/// Shape and physical extent of a simulation grid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridLayout {
    /// Cells along x
    pub nx: usize,
    /// Cells along y
    pub ny: usize,
    /// Cells along z (line of sight)
    pub nz: usize,
    /// Comoving side length along x and y (Mpc)
    pub box_len: f64,
    /// Comoving side length along z (Mpc)
    pub box_len_para: f64,
}

impl GridLayout {
    /// Layout for an `n × n × nz` box
    ///
    /// # Arguments
    ///
    /// * `n` - Cells along the transverse axes
    /// * `nz` - Cells along the line of sight
    /// * `box_len` - Transverse side length (Mpc)
    /// * `box_len_para` - Line-of-sight side length (Mpc)
    #[must_use]
    pub fn new(n: usize, nz: usize, box_len: f64, box_len_para: f64) -> Self {
        Self {
            nx: n,
            ny: n,
            nz,
            box_len,
            box_len_para,
        }
    }

    /// Cubic layout with `n` cells per side
    #[must_use]
    pub fn cubic(n: usize, box_len: f64) -> Self {
        Self::new(n, n, box_len, box_len)
    }

    /// Low-resolution layout described by the user parameters
    #[must_use]
    pub fn from_user(user: &crate::config::UserParams) -> Self {
        Self::new(
            user.hii_dim,
            user.d_para(),
            user.box_len,
            user.box_len * user.non_cubic_factor,
        )
    }

    /// Number of real-space cells
    #[must_use]
    pub fn real_len(&self) -> usize {
        self.nx * self.ny * self.nz
    }

    /// Length of a half-complex row
    #[must_use]
    pub fn nz_half(&self) -> usize {
        self.nz / 2 + 1
    }

    /// Number of k-space modes stored for a real grid
    #[must_use]
    pub fn spectral_len(&self) -> usize {
        self.nx * self.ny * self.nz_half()
    }

    /// Flattened real-space offset of `(x, y, z)`
    ///
    /// # Panics
    ///
    /// Panics if coordinates are out of bounds
    #[inline]
    #[must_use]
    pub fn real_index(&self, x: usize, y: usize, z: usize) -> usize {
        assert!(
            x < self.nx && y < self.ny && z < self.nz,
            "Coordinates out of bounds"
        );
        z + self.nz * (y + self.ny * x)
    }

    /// Inverse of [`GridLayout::real_index`]
    #[inline]
    #[must_use]
    pub fn real_coords(&self, index: usize) -> [usize; 3] {
        let z = index % self.nz;
        let rest = index / self.nz;
        [rest / self.ny, rest % self.ny, z]
    }

    /// Flattened k-space offset of mode `(x, y, z)` with `z ≤ nz/2`
    ///
    /// # Panics
    ///
    /// Panics if coordinates are out of bounds
    #[inline]
    #[must_use]
    pub fn spectral_index(&self, x: usize, y: usize, z: usize) -> usize {
        assert!(
            x < self.nx && y < self.ny && z < self.nz_half(),
            "Coordinates out of bounds"
        );
        z + self.nz_half() * (y + self.ny * x)
    }

    /// Inverse of [`GridLayout::spectral_index`]
    #[inline]
    #[must_use]
    pub fn spectral_coords(&self, index: usize) -> [usize; 3] {
        let half = self.nz_half();
        let z = index % half;
        let rest = index / half;
        [rest / self.ny, rest % self.ny, z]
    }

    /// Wavenumber magnitude (Mpc⁻¹) of the mode stored at a k-space offset
    #[must_use]
    pub fn wavenumber(&self, index: usize) -> f64 {
        let [x, y, z] = self.spectral_coords(index);
        let dk = 2.0 * PI / self.box_len;
        let dk_para = 2.0 * PI / self.box_len_para;
        let kx = signed_mode(x, self.nx) * dk;
        let ky = signed_mode(y, self.ny) * dk;
        let kz = z as f64 * dk_para;
        (kx * kx + ky * ky + kz * kz).sqrt()
    }

    /// Comoving cell side length along x (Mpc)
    #[must_use]
    pub fn cell_len(&self) -> f64 {
        self.box_len / self.nx as f64
    }

    /// Wrap a physical position in Mpc to the cell containing it
    #[must_use]
    pub fn cell_of_position(&self, pos: [f64; 3]) -> [usize; 3] {
        let wrap = |p: f64, len: f64, n: usize| -> usize {
            let frac = (p / len).rem_euclid(1.0);
            ((frac * n as f64) as usize).min(n - 1)
        };
        [
            wrap(pos[0], self.box_len, self.nx),
            wrap(pos[1], self.box_len, self.ny),
            wrap(pos[2], self.box_len_para, self.nz),
        ]
    }
}

/// Mode number in `(-n/2, n/2]` for a stored index
#[inline]
fn signed_mode(i: usize, n: usize) -> f64 {
    if i > n / 2 {
        i as f64 - n as f64
    } else {
        i as f64
    }
}
