//! Flat ΛCDM background
//!
//! # References
//! - Carroll, S.M., Press, W.H., Turner, E.L. (1992). "The cosmological
//!   constant." ARA&A, 30, 499-542.
//! - Bardeen, J.M., Bond, J.R., Kaiser, N., Szalay, A.S. (1986). "The
//!   statistics of peaks of Gaussian random fields." ApJ, 304, 15-61.
//! - Sugiyama, N. (1995). "Cosmic background anisotropies in cold dark matter
//!   cosmology." ApJS, 100, 281.

use super::quadrature::simpson;
use super::units::{self, HO_PER_H};
use super::Cosmology;
use crate::config::CosmoParams;
use crate::filter::top_hat;
use crate::tables::RGTable1D;
use std::f64::consts::PI;

/// Mass range of the σ(M) tables (ln Msun)
const LN_MASS_MIN: f64 = 4.6;
const LN_MASS_MAX: f64 = 46.0;
const SIGMA_TABLE_POINTS: usize = 400;

/// Wavenumber range of the variance integral (Mpc⁻¹)
const K_MIN: f64 = 1e-4;
const K_MAX: f64 = 1e3;

/// Analytic flat ΛCDM cosmology with a BBKS power spectrum
#[derive(Debug, Clone)]
pub struct FlatLcdm {
    params: CosmoParams,
    growth_norm: f64,
    sigma_table: RGTable1D,
    dsigma_sq_table: RGTable1D,
}

impl FlatLcdm {
    /// Build the background and tabulate σ(M) normalised to `sigma_8`
    pub fn new(params: CosmoParams) -> Self {
        let growth_norm = unnormalised_growth(&params, 0.0);

        let radius_8 = 8.0 / params.hlittle;
        let norm = params.sigma_8 * params.sigma_8 / raw_variance(&params, radius_8);
        let radius_of = |ln_mass: f64| {
            (3.0 * ln_mass.exp() / (4.0 * PI * params.omm * units::rho_crit(&params))).cbrt()
        };

        let sigma_table = RGTable1D::build(
            "sigma(M)",
            LN_MASS_MIN,
            LN_MASS_MAX,
            SIGMA_TABLE_POINTS,
            |ln_mass| (norm * raw_variance(&params, radius_of(ln_mass))).sqrt(),
        );
        let step = 0.01;
        let dsigma_sq_table = RGTable1D::build(
            "dsigma^2/dlnM",
            LN_MASS_MIN,
            LN_MASS_MAX,
            SIGMA_TABLE_POINTS,
            |ln_mass| {
                let hi = raw_variance(&params, radius_of(ln_mass + step));
                let lo = raw_variance(&params, radius_of(ln_mass - step));
                norm * (hi - lo) / (2.0 * step)
            },
        );

        Self {
            params,
            growth_norm,
            sigma_table,
            dsigma_sq_table,
        }
    }

    fn clamp_mass(ln_mass: f64) -> f64 {
        ln_mass.clamp(LN_MASS_MIN, LN_MASS_MAX)
    }
}

impl Cosmology for FlatLcdm {
    fn params(&self) -> &CosmoParams {
        &self.params
    }

    /// Carroll-Press-Turner growth factor
    ///
    /// # Formula
    /// ```text
    /// g(z) = 5/2 Ωm(z) / (Ωm(z)^(4/7) - ΩΛ(z) + (1 + Ωm(z)/2)(1 + ΩΛ(z)/70))
    /// D(z) = g(z) / (1+z) / g(0)
    /// ```
    fn growth(&self, z: f64) -> f64 {
        unnormalised_growth(&self.params, z) / self.growth_norm
    }

    fn growth_derivative(&self, z: f64) -> f64 {
        let h = 1e-3 * (1.0 + z);
        (self.growth(z + h) - self.growth(z - h)) / (2.0 * h)
    }

    fn hubble(&self, z: f64) -> f64 {
        let zp1 = 1.0 + z;
        self.params.hlittle
            * HO_PER_H
            * (self.params.omm * zp1 * zp1 * zp1 + self.params.oml()).sqrt()
    }

    fn sigma(&self, ln_mass: f64) -> f64 {
        // Clamped input always lies inside the table
        self.sigma_table.eval(Self::clamp_mass(ln_mass)).unwrap_or(0.0)
    }

    fn dsigma_sq_dlnm(&self, ln_mass: f64) -> f64 {
        self.dsigma_sq_table
            .eval(Self::clamp_mass(ln_mass))
            .unwrap_or(0.0)
    }
}

fn unnormalised_growth(p: &CosmoParams, z: f64) -> f64 {
    let zp1_3 = (1.0 + z).powi(3);
    let e2 = p.omm * zp1_3 + p.oml();
    let om_z = p.omm * zp1_3 / e2;
    let ol_z = p.oml() / e2;
    let g = 2.5 * om_z / (om_z.powf(4.0 / 7.0) - ol_z + (1.0 + om_z / 2.0) * (1.0 + ol_z / 70.0));
    g / (1.0 + z)
}

/// BBKS transfer function with the Sugiyama shape parameter
fn transfer(p: &CosmoParams, k: f64) -> f64 {
    let gamma = p.omm
        * p.hlittle
        * (-p.omb - (2.0 * p.hlittle).sqrt() * p.omb / p.omm).exp();
    let q = k / (p.hlittle * gamma);
    let poly = 1.0 + 3.89 * q + (16.1 * q).powi(2) + (5.46 * q).powi(3) + (6.71 * q).powi(4);
    (1.0 + 2.34 * q).ln() / (2.34 * q) * poly.powf(-0.25)
}

/// Top-hat variance at radius `r` before σ8 normalisation
fn raw_variance(p: &CosmoParams, r: f64) -> f64 {
    let integral = simpson(K_MIN.ln(), K_MAX.ln(), 1000, |ln_k| {
        let k = ln_k.exp();
        let t = transfer(p, k);
        let w = top_hat(k * r);
        k * k * k * k.powf(p.power_index) * t * t * w * w
    });
    integral / (2.0 * PI * PI)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cosmo() -> FlatLcdm {
        FlatLcdm::new(CosmoParams::default())
    }

    #[test]
    fn test_growth_normalisation() {
        let c = cosmo();
        assert_relative_eq!(c.growth(0.0), 1.0, epsilon = 1e-12);
        assert!(c.growth(10.0) < c.growth(5.0));
        assert!(c.growth_derivative(8.0) < 0.0);
    }

    #[test]
    fn test_growth_matter_dominated() {
        // D ∝ 1/(1+z) once Λ is negligible
        let c = cosmo();
        assert_relative_eq!(c.growth(20.0) * 21.0, c.growth(30.0) * 31.0, max_relative = 1e-3);
    }

    #[test]
    fn test_sigma_8_normalisation() {
        let c = cosmo();
        let mass = c.mass_from_radius(8.0 / c.params().hlittle);
        assert_relative_eq!(c.sigma(mass.ln()), c.params().sigma_8, max_relative = 1e-3);
    }

    #[test]
    fn test_sigma_decreases_with_mass() {
        let c = cosmo();
        assert!(c.sigma(1e8_f64.ln()) > c.sigma(1e10_f64.ln()));
        assert!(c.dsigma_sq_dlnm(1e9_f64.ln()) < 0.0);
    }

    #[test]
    fn test_radius_mass_roundtrip() {
        let c = cosmo();
        let r = c.radius_from_mass(c.mass_from_radius(3.7));
        assert_relative_eq!(r, 3.7, epsilon = 1e-10);
    }

    #[test]
    fn test_time_per_redshift_negative() {
        let c = cosmo();
        assert!(c.dt_dz(10.0) < 0.0);
        assert_relative_eq!(c.hubble_time(0.0), 1.0 / (c.params().hlittle * HO_PER_H));
    }
}
