//! Photon non-conservation corrections
//!
//! The excursion-set ionization field does not conserve photons: its global
//! ionized fraction lags the analytic expectation. A calibration run maps
//! each redshift to the shift that realigns the two histories.
//!
//! # References
//! - Park, J., Greig, B., Mesinger, A. (2022). "Calibrating excursion set
//!   reionization models to approximately conserve ionizing photons."
//!   MNRAS, 517, 192-200.

use super::PhotonConservation;
use crate::tables::RGTable1D;

/// No correction: the sampled redshift is the requested one
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCorrection;

impl PhotonConservation for NoCorrection {
    fn adjust_redshift(&self, z: f64) -> (f64, f64) {
        (z, 0.0)
    }

    fn escape_fit(&self, _z: f64) -> Option<f64> {
        None
    }
}

/// Calibrated redshift shift and escape-parameter fit
#[derive(Debug, Clone)]
pub struct CalibrationCurve {
    delta_z: RGTable1D,
    escape_poly: Vec<f64>,
}

impl CalibrationCurve {
    /// Curve from Δz sampled uniformly over `[z_min, z_max]`
    pub fn new(z_min: f64, z_max: f64, delta_z: Vec<f64>) -> Self {
        Self {
            delta_z: RGTable1D::from_samples("photon-cons dz", z_min, z_max, delta_z),
            escape_poly: Vec::new(),
        }
    }

    /// Attach a polynomial fit in `z` (lowest order first) for the escape
    /// parameter replaced by photon-conservation modes 2 and 3
    pub fn with_escape_fit(mut self, coefficients: Vec<f64>) -> Self {
        self.escape_poly = coefficients;
        self
    }
}

impl PhotonConservation for CalibrationCurve {
    fn adjust_redshift(&self, z: f64) -> (f64, f64) {
        match self.delta_z.eval(z) {
            Ok(dz) => (z + dz, dz),
            Err(_) => (f64::NAN, f64::NAN),
        }
    }

    fn escape_fit(&self, z: f64) -> Option<f64> {
        if self.escape_poly.is_empty() {
            return None;
        }
        Some(self.escape_poly.iter().rev().fold(0.0, |acc, &c| acc * z + c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity_without_correction() {
        assert_eq!(NoCorrection.adjust_redshift(7.5), (7.5, 0.0));
        assert!(NoCorrection.escape_fit(7.5).is_none());
    }

    #[test]
    fn test_curve_shifts_inside_domain() {
        let curve = CalibrationCurve::new(5.0, 15.0, vec![0.0, 0.2, 0.4]);
        let (z, dz) = curve.adjust_redshift(7.5);
        assert_relative_eq!(dz, 0.1, epsilon = 1e-12);
        assert_relative_eq!(z, 7.6, epsilon = 1e-12);
    }

    #[test]
    fn test_curve_non_finite_outside_domain() {
        let curve = CalibrationCurve::new(5.0, 15.0, vec![0.0, 0.2, 0.4]);
        let (z, dz) = curve.adjust_redshift(20.0);
        assert!(z.is_nan() && dz.is_nan());
    }

    #[test]
    fn test_escape_polynomial() {
        let curve = CalibrationCurve::new(5.0, 15.0, vec![0.0, 0.0]).with_escape_fit(vec![-0.5, 0.01]);
        assert_relative_eq!(curve.escape_fit(10.0).unwrap(), -0.4);
    }
}
