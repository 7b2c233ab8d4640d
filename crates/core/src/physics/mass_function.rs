//! Press-Schechter mass function integrals
//!
//! # References
//! - Press, W.H., Schechter, P. (1974). ApJ, 187, 425-438.
//! - Lacey, C., Cole, S. (1993). "Merger rates in hierarchical models of
//!   galaxy formation." MNRAS, 262, 627-649.
//! - Mo, H.J., White, S.D.M. (1996). "An analytic model for the spatial
//!   clustering of dark matter haloes." MNRAS, 282, 347-361.

use super::quadrature::simpson;
use super::{Cosmology, MassFunction};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use std::f64::consts::{PI, SQRT_2};
use std::sync::Arc;

/// Simpson panels over the log-mass range
const MASS_INTERVALS: usize = 200;

/// Above this fraction of δc a region is treated as fully collapsed
const MAX_DELTAC_FRAC: f64 = 0.999;

/// Mass-dependent efficiency `(M/pivot)^alpha`, optionally with a second
/// power law above an upper pivot
///
/// Shapes are normalised to 1 at the pivot and capped at `1/norm` so the
/// efficiency `norm × shape` never exceeds unity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EfficiencyLaw {
    pub norm: f64,
    pub pivot: f64,
    pub alpha: f64,
    /// `(pivot, alpha)` of the upper power law
    pub upper: Option<(f64, f64)>,
}

impl EfficiencyLaw {
    /// Single power law
    pub fn power_law(norm: f64, pivot: f64, alpha: f64) -> Self {
        Self {
            norm,
            pivot,
            alpha,
            upper: None,
        }
    }

    /// Unnormalised shape at `mass`
    ///
    /// # Formula
    /// ```text
    /// single: (M/Mp)^α
    /// double: (Mu/Mp)^α / ((M/Mu)^-α + (M/Mu)^-αu)
    /// ```
    /// The double form applies only when `αu < α`, so it never turns up.
    #[inline]
    pub fn shape(&self, mass: f64) -> f64 {
        match self.upper {
            Some((upper_pivot, upper_alpha)) if upper_alpha < self.alpha => {
                let x = mass / upper_pivot;
                (upper_pivot / self.pivot).powf(self.alpha)
                    / (x.powf(-self.alpha) + x.powf(-upper_alpha))
            }
            _ => (mass / self.pivot).powf(self.alpha),
        }
    }

    /// Shape capped at `1/norm`
    #[inline]
    pub fn capped(&self, mass: f64) -> f64 {
        self.shape(mass).min(1.0 / self.norm)
    }
}

/// Weighting of halos in a mass function integral
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceModel {
    /// Lower turnover `exp(-Mt/M)`; zero disables it
    pub turnover_low: f64,
    /// Upper cut-off `exp(-M/Mt)`; infinity disables it
    pub turnover_high: f64,
    pub star: Option<EfficiencyLaw>,
    pub esc: Option<EfficiencyLaw>,
}

impl SourceModel {
    /// Unweighted collapsed mass
    pub fn collapsed() -> Self {
        Self {
            turnover_low: 0.0,
            turnover_high: f64::INFINITY,
            star: None,
            esc: None,
        }
    }

    /// Stellar mass weighting with a lower turnover
    pub fn stellar(star: EfficiencyLaw, turnover_low: f64) -> Self {
        Self {
            turnover_low,
            turnover_high: f64::INFINITY,
            star: Some(star),
            esc: None,
        }
    }

    /// Escaping ionizing photon weighting
    pub fn ionizing(star: EfficiencyLaw, esc: EfficiencyLaw, turnover_low: f64) -> Self {
        Self {
            turnover_low,
            turnover_high: f64::INFINITY,
            star: Some(star),
            esc: Some(esc),
        }
    }

    /// Add an upper cut-off, used for minihalos above the atomic threshold
    pub fn with_upper_cutoff(mut self, turnover_high: f64) -> Self {
        self.turnover_high = turnover_high;
        self
    }

    /// Weight of a halo of `mass`
    #[inline]
    pub fn fraction(&self, mass: f64) -> f64 {
        let mut f = (-self.turnover_low / mass - mass / self.turnover_high).exp();
        if let Some(star) = &self.star {
            f *= star.capped(mass);
        }
        if let Some(esc) = &self.esc {
            f *= esc.capped(mass);
        }
        f
    }
}

/// Region a conditional integral is evaluated in
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Condition {
    /// Growth factor at the redshift of the region
    pub growth: f64,
    /// ln of the region mass
    pub ln_mass: f64,
    /// σ of the region mass at `z = 0`
    pub sigma: f64,
    /// Linear overdensity of the region at its redshift
    pub delta: f64,
}

/// Press-Schechter / extended Press-Schechter integrals
#[derive(Debug, Clone)]
pub struct PressSchechter {
    cosmology: Arc<dyn Cosmology>,
    delta_crit: f64,
}

impl PressSchechter {
    pub fn new(cosmology: Arc<dyn Cosmology>, delta_crit: f64) -> Self {
        Self {
            cosmology,
            delta_crit,
        }
    }

    /// Unconditional `dF/dlnM`
    ///
    /// # Formula
    /// ```text
    /// ν = δc / (D σ)
    /// dF/dlnM = sqrt(2/π) ν exp(-ν²/2) |dlnσ/dlnM|
    /// ```
    fn dfdlnm(&self, growth: f64, ln_mass: f64) -> f64 {
        let sigma = self.cosmology.sigma(ln_mass);
        let nu = self.delta_crit / (growth * sigma);
        let dlnsigma = self.cosmology.dsigma_sq_dlnm(ln_mass).abs() / (2.0 * sigma * sigma);
        (2.0 / PI).sqrt() * nu * (-nu * nu / 2.0).exp() * dlnsigma
    }

    /// Conditional `dF/dlnM`, zero at and above the region variance
    ///
    /// # Formula
    /// ```text
    /// Δδ = (δc - δ) / D,  Δσ² = σ²(M) - σ²(Mcond)
    /// dF/dlnM = Δδ / sqrt(2π) (Δσ²)^(-3/2) exp(-Δδ²/(2Δσ²)) |dσ²/dlnM|
    /// ```
    fn conditional_dfdlnm(&self, condition: &Condition, ln_mass: f64) -> f64 {
        let sigma = self.cosmology.sigma(ln_mass);
        let dsigma_sq = sigma * sigma - condition.sigma * condition.sigma;
        if dsigma_sq <= 0.0 {
            return 0.0;
        }
        let ddelta = (self.delta_crit - condition.delta) / condition.growth;
        ddelta / (2.0 * PI).sqrt()
            * dsigma_sq.powf(-1.5)
            * (-ddelta * ddelta / (2.0 * dsigma_sq)).exp()
            * self.cosmology.dsigma_sq_dlnm(ln_mass).abs()
    }

    fn upper_limit(condition: &Condition, ln_m_max: f64) -> f64 {
        ln_m_max.min(condition.ln_mass)
    }
}

impl MassFunction for PressSchechter {
    fn delta_crit(&self) -> f64 {
        self.delta_crit
    }

    fn unconditional(&self, z: f64, ln_m_min: f64, ln_m_max: f64, source: &SourceModel) -> f64 {
        let growth = self.cosmology.growth(z);
        simpson(ln_m_min, ln_m_max, MASS_INTERVALS, |ln_m| {
            self.dfdlnm(growth, ln_m) * source.fraction(ln_m.exp())
        })
    }

    fn conditional(
        &self,
        condition: &Condition,
        ln_m_min: f64,
        ln_m_max: f64,
        source: &SourceModel,
    ) -> f64 {
        if condition.delta >= MAX_DELTAC_FRAC * self.delta_crit {
            return source.fraction(condition.ln_mass.exp());
        }
        if condition.delta <= -1.0 {
            return 0.0;
        }
        let upper = Self::upper_limit(condition, ln_m_max);
        simpson(ln_m_min, upper, MASS_INTERVALS, |ln_m| {
            self.conditional_dfdlnm(condition, ln_m) * source.fraction(ln_m.exp())
        })
    }

    fn halo_number_conditional(&self, condition: &Condition, ln_m_min: f64, ln_m_max: f64) -> f64 {
        if condition.delta >= MAX_DELTAC_FRAC * self.delta_crit {
            return (-condition.ln_mass).exp();
        }
        if condition.delta <= -1.0 {
            return 0.0;
        }
        let upper = Self::upper_limit(condition, ln_m_max);
        simpson(ln_m_min, upper, MASS_INTERVALS, |ln_m| {
            self.conditional_dfdlnm(condition, ln_m) * (-ln_m).exp()
        })
    }

    fn fcoll_unconditional(&self, z: f64, m_min: f64) -> f64 {
        let sigma = self.cosmology.sigma(m_min.ln());
        erfc(self.delta_crit / (SQRT_2 * self.cosmology.growth(z) * sigma))
    }

    /// Mo & White (1996) spherical-collapse inversion
    ///
    /// # Formula
    /// ```text
    /// δL = δc/1.68647 [1.68647 - 1.35(1+δ)^(-2/3) - 1.12431(1+δ)^(-1/2)
    ///                  + 0.78785(1+δ)^(-0.58661)]
    /// ```
    fn euler_to_lagrangian(&self, delta: f64) -> f64 {
        let x = (1.0 + delta).max(1e-6);
        self.delta_crit / 1.68647
            * (1.68647 - 1.35 * x.powf(-2.0 / 3.0) - 1.12431 * x.powf(-0.5)
                + 0.78785 * x.powf(-0.58661))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CosmoParams;
    use crate::physics::FlatLcdm;
    use approx::assert_relative_eq;

    fn mass_function() -> PressSchechter {
        PressSchechter::new(Arc::new(FlatLcdm::new(CosmoParams::default())), 1.686)
    }

    #[test]
    fn test_unconditional_matches_erfc() {
        let mf = mass_function();
        let (m_min, z) = (1e8_f64, 10.0);
        let integral = mf.unconditional(z, m_min.ln(), 1e18_f64.ln(), &SourceModel::collapsed());
        assert_relative_eq!(integral, mf.fcoll_unconditional(z, m_min), max_relative = 2e-2);
    }

    #[test]
    fn test_conditional_increases_with_density() {
        let mf = mass_function();
        let cosmo = FlatLcdm::new(CosmoParams::default());
        let ln_mass = 1e12_f64.ln();
        let base = Condition {
            growth: cosmo.growth(8.0),
            ln_mass,
            sigma: cosmo.sigma(ln_mass),
            delta: -0.2,
        };
        let source = SourceModel::collapsed();
        let low = mf.conditional(&base, 1e8_f64.ln(), ln_mass, &source);
        let high = mf.conditional(
            &Condition {
                delta: 0.5,
                ..base
            },
            1e8_f64.ln(),
            ln_mass,
            &source,
        );
        assert!(high > low);
        assert!((0.0..=1.0).contains(&high));
    }

    #[test]
    fn test_conditional_saturates_near_threshold() {
        let mf = mass_function();
        let condition = Condition {
            growth: 0.1,
            ln_mass: 1e11_f64.ln(),
            sigma: 2.0,
            delta: 1.686,
        };
        let source = SourceModel::collapsed();
        assert_eq!(mf.conditional(&condition, 1e8_f64.ln(), 1e16_f64.ln(), &source), 1.0);
    }

    #[test]
    fn test_empty_mass_range() {
        let mf = mass_function();
        let condition = Condition {
            growth: 0.1,
            ln_mass: 1e8_f64.ln(),
            sigma: 5.0,
            delta: 0.0,
        };
        let source = SourceModel::collapsed();
        assert_eq!(mf.conditional(&condition, 1e9_f64.ln(), 1e16_f64.ln(), &source), 0.0);
    }

    #[test]
    fn test_fcoll_delta_limits() {
        let mf = mass_function();
        assert_eq!(mf.fcoll_delta(1.7, 0.1, 3.0, 1.0), 1.0);
        assert_eq!(mf.fcoll_delta(0.0, 0.1, 1.0, 2.0), 1.0);
        let f = mf.fcoll_delta(0.0, 0.1, 3.0, 1.0);
        assert!(f > 0.0 && f < 1.0);
    }

    #[test]
    fn test_lagrangian_is_linear_for_small_delta() {
        let mf = mass_function();
        assert_relative_eq!(mf.euler_to_lagrangian(0.0), 0.0, epsilon = 1e-4);
        let small = mf.euler_to_lagrangian(1e-3);
        assert_relative_eq!(small, 1e-3, max_relative = 0.05);
        assert!(mf.euler_to_lagrangian(5.0) < 1.686);
    }

    #[test]
    fn test_efficiency_cap() {
        let law = EfficiencyLaw::power_law(0.5, 1e10, 1.0);
        assert_relative_eq!(law.capped(1e10), 1.0);
        assert_relative_eq!(law.capped(1e12), 2.0);
    }

    #[test]
    fn test_upper_turnover_never_turns_up() {
        let single = EfficiencyLaw::power_law(0.05, 1e10, 0.5);
        let double = EfficiencyLaw {
            upper: Some((2.8e11, -0.6)),
            ..single
        };
        assert!(double.shape(1e13) < single.shape(1e13));
        let flat = EfficiencyLaw {
            upper: Some((2.8e11, 0.8)),
            ..single
        };
        assert_eq!(flat.shape(1e13), single.shape(1e13));
    }
}
