//! Turnover masses from cooling and radiative feedback
//!
//! # References
//! - Barkana, R., Loeb, A. (2001). "In the beginning: the first sources of
//!   light and the reionization of the universe." Phys. Rep., 349, 125-238.
//! - Sobacchi, E., Mesinger, A. (2013). "Inhomogeneous recombinations during
//!   cosmic reionization." MNRAS, 432, 3340-3348.
//! - Muñoz, J.B. et al. (2022). "The impact of the first galaxies on cosmic
//!   dawn and reionization." MNRAS, 511, 3657-3681.

use super::units::SIGMA_VCB;
use super::{Cosmology, Feedback};
use crate::config::SimulationConfig;
use std::f64::consts::PI;
use std::sync::Arc;

/// Virial temperature of atomic cooling (K)
const ATOMIC_COOLING_TEMPERATURE: f64 = 1e4;

/// Virial mass of a halo with virial temperature `t_vir`
///
/// # Formula
/// ```text
/// Δc = 18π² + 82d - 39d²,  d = Ωm(z) - 1
/// M = 7030.97/h sqrt(Ωm(z)/(Ωm Δc)) (T/(μ(1+z)))^1.5
/// ```
pub fn virial_mass(cosmology: &dyn Cosmology, z: f64, t_vir: f64, mu: f64) -> f64 {
    let p = cosmology.params();
    let zp1_3 = (1.0 + z).powi(3);
    let om_z = p.omm * zp1_3 / (p.omm * zp1_3 + p.oml());
    let d = om_z - 1.0;
    let delta_c = 18.0 * PI * PI + 82.0 * d - 39.0 * d * d;
    7030.97 / p.hlittle * (om_z / (p.omm * delta_c)).sqrt() * (t_vir / (mu * (1.0 + z))).powf(1.5)
}

/// Analytic feedback thresholds
#[derive(Debug, Clone)]
pub struct ThresholdFeedback {
    cosmology: Arc<dyn Cosmology>,
    a_lw: f64,
    beta_lw: f64,
    a_vcb: f64,
    beta_vcb: f64,
    f_h2_shield: f64,
    m_turn: f64,
    ion_tvir_min: f64,
    m_min_integral: f64,
    use_mini_halos: bool,
    use_mass_dependent_zeta: bool,
    m_min_in_mass: bool,
}

impl ThresholdFeedback {
    pub fn new(cosmology: Arc<dyn Cosmology>, config: &SimulationConfig) -> Self {
        let astro = &config.astro;
        Self {
            cosmology,
            a_lw: astro.a_lw,
            beta_lw: astro.beta_lw,
            a_vcb: astro.a_vcb,
            beta_vcb: astro.beta_vcb,
            f_h2_shield: astro.f_h2_shield,
            m_turn: astro.m_turn,
            ion_tvir_min: astro.ion_tvir_min,
            m_min_integral: config.global.m_min_integral,
            use_mini_halos: config.flags.use_mini_halos,
            use_mass_dependent_zeta: config.flags.use_mass_dependent_zeta,
            m_min_in_mass: config.flags.m_min_in_mass,
        }
    }
}

impl Feedback for ThresholdFeedback {
    fn atomic_cooling_threshold(&self, z: f64) -> f64 {
        virial_mass(self.cosmology.as_ref(), z, ATOMIC_COOLING_TEMPERATURE, 0.59)
    }

    /// # Formula
    /// ```text
    /// M = 3.314e7 (1+z)^-1.5 (1 + A_LW (J21(1-f_shield))^β_LW)
    ///     (1 + A_vcb vcb/σ_vcb)^β_vcb
    /// ```
    fn lyman_werner_threshold(&self, z: f64, j21: f64, vcb: f64) -> f64 {
        let lw = 1.0 + self.a_lw * (j21 * (1.0 - self.f_h2_shield)).powf(self.beta_lw);
        let streaming = (1.0 + self.a_vcb * vcb / SIGMA_VCB).powf(self.beta_vcb);
        3.314e7 * (1.0 + z).powf(-1.5) * lw * streaming
    }

    /// # Formula
    /// ```text
    /// M = 3e9 (2Γ12)^0.17 ((1+z)/10)^-2.1 (1 - ((1+z)/(1+z_re))²)^2.5
    /// ```
    fn reionization_threshold(&self, z: f64, gamma12: f64, z_re: f64) -> f64 {
        if z_re <= 1e-19 {
            return 1e-40;
        }
        let ratio = (1.0 + z) / (1.0 + z_re);
        let age = (1.0 - ratio * ratio).max(0.0);
        3e9 * (2.0 * gamma12).powf(0.17) * ((1.0 + z) / 10.0).powf(-2.1) * age.powf(2.5)
    }

    fn minimum_source_mass(&self, z: f64) -> f64 {
        if self.use_mini_halos {
            self.m_min_integral
        } else if self.use_mass_dependent_zeta {
            self.m_turn / 50.0
        } else if self.m_min_in_mass {
            self.m_turn
        } else {
            let mu = if self.ion_tvir_min < ATOMIC_COOLING_TEMPERATURE {
                1.22
            } else {
                0.59
            };
            virial_mass(self.cosmology.as_ref(), z, self.ion_tvir_min, mu)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::FlatLcdm;
    use approx::assert_relative_eq;

    fn feedback(config: &SimulationConfig) -> ThresholdFeedback {
        let cosmology = Arc::new(FlatLcdm::new(config.cosmo.clone()));
        ThresholdFeedback::new(cosmology, config)
    }

    #[test]
    fn test_atomic_threshold_scale() {
        let fb = feedback(&SimulationConfig::default());
        let m = fb.atomic_cooling_threshold(10.0);
        assert!(m > 1e7 && m < 3e8, "unexpected threshold {m:e}");
        assert!(fb.atomic_cooling_threshold(20.0) < m);
    }

    #[test]
    fn test_lyman_werner_without_flux() {
        let fb = feedback(&SimulationConfig::default());
        assert_relative_eq!(fb.lyman_werner_threshold(9.0, 0.0, 0.0), 3.314e7 / 10f64.powf(1.5));
        assert!(fb.lyman_werner_threshold(9.0, 1.0, 0.0) > fb.lyman_werner_threshold(9.0, 0.0, 0.0));
    }

    #[test]
    fn test_reionization_threshold_unionized() {
        let fb = feedback(&SimulationConfig::default());
        assert_eq!(fb.reionization_threshold(8.0, 1.0, 0.0), 1e-40);
        assert_eq!(fb.reionization_threshold(8.0, 1.0, 8.0), 0.0);
        assert!(fb.reionization_threshold(8.0, 1.0, 10.0) > 1e8);
    }

    #[test]
    fn test_minimum_source_mass_modes() {
        let mut config = SimulationConfig::default();
        assert_relative_eq!(
            feedback(&config).minimum_source_mass(8.0),
            config.astro.m_turn / 50.0
        );
        config.flags.use_mini_halos = true;
        assert_eq!(
            feedback(&config).minimum_source_mass(8.0),
            config.global.m_min_integral
        );
        config.flags.use_mini_halos = false;
        config.flags.use_mass_dependent_zeta = false;
        assert!(feedback(&config).minimum_source_mass(8.0) > 1e8);
    }
}
