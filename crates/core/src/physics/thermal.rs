//! IGM temperature and recombination models
//!
//! # References
//! - Abel, T., Anninos, P., Zhang, Y., Norman, M.L. (1997). "Modeling
//!   primordial gas in numerical cosmology." New Astronomy, 2, 181-207.
//! - McQuinn, M., Upton Sanderbeck, P.R. (2016). "On the intergalactic
//!   temperature-density relation." MNRAS, 456, 47-54.
//! - Seager, S., Sasselov, D.D., Scott, D. (1999). "A new calculation of the
//!   recombination epoch." ApJ, 523, L1-L5.

use super::units::{self, MIN_DENSITY_LOW_LIMIT, T_CMB, T_RE};
use super::ThermalHistory;
use crate::config::CosmoParams;

/// Redshift where gas decouples thermally from the CMB
const Z_DECOUPLING: f64 = 132.0;

/// Photoionization rate (1e-12 s⁻¹) at which half of the gas is unshielded
const GAMMA12_SELF_SHIELD: f64 = 1.0;

/// Analytic temperature history
#[derive(Debug, Clone)]
pub struct AnalyticThermal {
    cosmo: CosmoParams,
    clumping_factor: f64,
}

impl AnalyticThermal {
    pub fn new(cosmo: CosmoParams, clumping_factor: f64) -> Self {
        Self {
            cosmo,
            clumping_factor,
        }
    }
}

impl ThermalHistory for AnalyticThermal {
    /// Temperature of gas ionized at `z_re`, relaxed towards the
    /// photoheating equilibrium by adiabatic and Compton cooling
    ///
    /// # Formula
    /// ```text
    /// r = ((1+δ)/(1+δ_re))^1.1333 ((1+z)/(1+z_re))^3.4
    ///     exp(((1+z)/7.1)^2.5 - ((1+z_re)/7.1)^2.5)
    /// T = (r T_RE^1.7 + (1e4 (1+z)/4)^1.7 (1+δ))^0.5882
    /// ```
    fn fully_ionized_temperature(&self, z_re: f64, z: f64, delta: f64) -> f64 {
        let delta = delta.max(-1.0 + MIN_DENSITY_LOW_LIMIT);
        let ratio = if (z - z_re).abs() < 1e-4 {
            1.0
        } else {
            let delta_re = (delta * (1.0 + z) / (1.0 + z_re)).max(-1.0 + MIN_DENSITY_LOW_LIMIT);
            ((1.0 + delta) / (1.0 + delta_re)).powf(1.1333)
                * ((1.0 + z) / (1.0 + z_re)).powf(3.4)
                * (((1.0 + z) / 7.1).powf(2.5) - ((1.0 + z_re) / 7.1).powf(2.5)).exp()
        };
        let floor = (1e4 * (1.0 + z) / 4.0).powf(1.7) * (1.0 + delta);
        (ratio * T_RE.powf(1.7) + floor).powf(0.5882)
    }

    fn partially_ionized_temperature(&self, t_hi: f64, x_h: f64) -> f64 {
        if x_h <= 0.0 {
            T_RE
        } else if x_h >= 1.0 {
            t_hi
        } else {
            T_RE * (1.0 - x_h) + t_hi * x_h
        }
    }

    /// Case-B recombinations in clumped gas, reduced where self-shielded
    /// gas stays neutral
    fn recombination_rate(&self, z_eff: f64, gamma12: f64) -> f64 {
        let zp1 = 1.0 + z_eff;
        let n_h = units::n_hydrogen0(&self.cosmo) * zp1 * zp1 * zp1;
        let exposure = gamma12.max(0.0).powf(2.0 / 3.0);
        let unshielded = exposure / (exposure + GAMMA12_SELF_SHIELD);
        self.clumping_factor * self.alpha_b(1e4) * n_h * unshielded
    }

    /// Abel et al. (1997) fit
    fn alpha_a(&self, t: f64) -> f64 {
        const COEFFS: [f64; 10] = [
            -28.6130338,
            -0.72411256,
            -2.02604473e-2,
            -2.38086188e-3,
            -3.21260521e-4,
            -1.42150291e-5,
            4.98910892e-6,
            5.75561414e-7,
            -1.85676704e-8,
            -3.07113524e-9,
        ];
        let log_t = (t / 1.1604505e4).ln();
        let exponent = COEFFS.iter().rev().fold(0.0, |acc, &c| acc * log_t + c);
        exponent.exp()
    }

    fn alpha_b(&self, t: f64) -> f64 {
        2.59e-13 * (t / 1e4).powf(-0.7)
    }

    fn recfast_temperature(&self, z: f64) -> f64 {
        T_CMB * (1.0 + z) / (1.0 + (1.0 + Z_DECOUPLING) / (1.0 + z))
    }

    fn recfast_xe(&self, z: f64) -> f64 {
        (2e-4 * ((1.0 + z) / 36.0).powf(0.3)).clamp(0.0, 1.0)
    }

    fn adiabatic_index(&self, z: f64) -> f64 {
        0.58 - 0.005 * (z - 10.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn thermal() -> AnalyticThermal {
        AnalyticThermal::new(CosmoParams::default(), 2.0)
    }

    #[test]
    fn test_case_a_coefficient_at_1e4() {
        assert_relative_eq!(thermal().alpha_a(1e4), 4.2e-13, max_relative = 0.05);
        assert!(thermal().alpha_a(1e3) > thermal().alpha_a(1e4));
    }

    #[test]
    fn test_fresh_ionization_near_t_re() {
        let t = thermal().fully_ionized_temperature(8.0, 8.0, 0.0);
        assert!(t > T_RE && t < 3.0 * T_RE, "got {t}");
    }

    #[test]
    fn test_ionized_gas_cools() {
        let th = thermal();
        assert!(th.fully_ionized_temperature(10.0, 7.0, 0.0) < th.fully_ionized_temperature(7.0, 7.0, 0.0));
    }

    #[test]
    fn test_partial_temperature_bounds() {
        let th = thermal();
        assert_eq!(th.partially_ionized_temperature(50.0, 1.0), 50.0);
        assert_eq!(th.partially_ionized_temperature(50.0, 0.0), T_RE);
        assert_relative_eq!(th.partially_ionized_temperature(50.0, 0.5), 0.5 * T_RE + 25.0);
    }

    #[test]
    fn test_recombinations_need_ionizing_flux() {
        let th = thermal();
        assert_eq!(th.recombination_rate(8.0, 0.0), 0.0);
        assert!(th.recombination_rate(8.0, 1.0) > th.recombination_rate(6.0, 1.0));
    }

    #[test]
    fn test_recfast_limits() {
        let th = thermal();
        assert!(th.recfast_temperature(35.0) < T_CMB * 36.0);
        assert!(th.recfast_temperature(35.0) > 10.0);
        assert!(th.recfast_xe(35.0) > 0.0);
    }
}
