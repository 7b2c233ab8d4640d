//! Physical collaborators of the box solvers
//!
//! Each concern sits behind a trait so a caller can swap in a calibrated or
//! tabulated model. [`Physics::analytic`] assembles the analytic defaults:
//!
//! - [`Cosmology`]: flat ΛCDM background, growth and σ(M) ([`FlatLcdm`])
//! - [`MassFunction`]: Press-Schechter and extended Press-Schechter integrals
//!   ([`PressSchechter`])
//! - [`Feedback`]: turnover-mass thresholds ([`ThresholdFeedback`])
//! - [`ThermalHistory`]: IGM temperatures and recombinations
//!   ([`AnalyticThermal`])
//! - [`PhotonConservation`]: redshift adjustment ([`NoCorrection`],
//!   [`CalibrationCurve`])
//! - [`RadiationPhysics`]: emissivities, X-ray integrals and 21cm coupling
//!   ([`StandardRadiation`])
//!
//! All trait objects are `Send + Sync`; one bundle is shared read-only by
//! every worker thread of a step.

pub(crate) mod cosmology;
pub(crate) mod feedback;
pub(crate) mod mass_function;
pub(crate) mod photon_cons;
pub(crate) mod quadrature;
pub(crate) mod radiation;
pub(crate) mod thermal;
pub mod units;

pub use cosmology::FlatLcdm;
pub use feedback::{virial_mass, ThresholdFeedback};
pub use mass_function::{Condition, EfficiencyLaw, PressSchechter, SourceModel};
pub use photon_cons::{CalibrationCurve, NoCorrection};
pub use radiation::{
    nu_n, zmax, Band, CollisionRates, DepositionChannel, LyaPhotons, Population,
    StandardRadiation,
};
pub use thermal::AnalyticThermal;

use crate::config::{CosmoParams, SimulationConfig};
use std::fmt::Debug;
use std::sync::Arc;

// ============================================================================
// COLLABORATOR TRAITS
// ============================================================================

/// Homogeneous background cosmology
///
/// Masses are in Msun, lengths in comoving Mpc, times in seconds.
pub trait Cosmology: Send + Sync + Debug {
    /// Parameters this background was built from
    fn params(&self) -> &CosmoParams;

    /// Linear growth factor normalised to `D(0) = 1`
    fn growth(&self, z: f64) -> f64;

    /// `dD/dz`
    fn growth_derivative(&self, z: f64) -> f64;

    /// Hubble rate (s⁻¹)
    fn hubble(&self, z: f64) -> f64;

    /// `1/H(z)` (s)
    fn hubble_time(&self, z: f64) -> f64 {
        1.0 / self.hubble(z)
    }

    /// Proper time per unit redshift (s), negative
    fn dt_dz(&self, z: f64) -> f64 {
        -1.0 / (self.hubble(z) * (1.0 + z))
    }

    /// Comoving distance per unit redshift (cm)
    fn dr_dz(&self, z: f64) -> f64 {
        units::C / self.hubble(z)
    }

    /// Mass enclosed by a sphere of comoving radius `r` at mean density
    fn mass_from_radius(&self, r: f64) -> f64 {
        let p = self.params();
        4.0 / 3.0 * std::f64::consts::PI * r * r * r * p.omm * units::rho_crit(p)
    }

    /// Inverse of [`Cosmology::mass_from_radius`]
    fn radius_from_mass(&self, mass: f64) -> f64 {
        let p = self.params();
        (3.0 * mass / (4.0 * std::f64::consts::PI * p.omm * units::rho_crit(p))).cbrt()
    }

    /// Linear mass variance σ(M) at `z = 0`
    fn sigma(&self, ln_mass: f64) -> f64;

    /// `dσ²/dlnM` at `z = 0`
    fn dsigma_sq_dlnm(&self, ln_mass: f64) -> f64;
}

/// Unconditional and conditional halo mass function integrals
///
/// Every integral is mass-weighted: it returns the fraction of the mass of
/// the region in halos between the limits, weighted by
/// [`SourceModel::fraction`].
pub trait MassFunction: Send + Sync + Debug {
    /// Linear collapse threshold
    fn delta_crit(&self) -> f64;

    /// Global weighted collapsed fraction at `z`
    fn unconditional(&self, z: f64, ln_m_min: f64, ln_m_max: f64, source: &SourceModel) -> f64;

    /// Weighted collapsed fraction inside a region described by `condition`
    fn conditional(
        &self,
        condition: &Condition,
        ln_m_min: f64,
        ln_m_max: f64,
        source: &SourceModel,
    ) -> f64;

    /// Expected halo count per Msun of the conditioning region
    fn halo_number_conditional(&self, condition: &Condition, ln_m_min: f64, ln_m_max: f64) -> f64;

    /// Collapsed fraction above `σ_min`'s mass in a region of variance `σ_max`
    fn fcoll_delta(&self, delta: f64, growth: f64, sigma_min: f64, sigma_max: f64) -> f64 {
        let dc = self.delta_crit();
        if delta >= dc || sigma_max >= sigma_min {
            return 1.0;
        }
        let width = (sigma_min * sigma_min - sigma_max * sigma_max).sqrt();
        statrs::function::erf::erfc((dc - delta) / (std::f64::consts::SQRT_2 * growth * width))
    }

    /// Press-Schechter collapsed fraction above `m_min`
    fn fcoll_unconditional(&self, z: f64, m_min: f64) -> f64;

    /// Linear (Lagrangian) overdensity of an Eulerian overdensity
    fn euler_to_lagrangian(&self, delta: f64) -> f64;
}

/// Turnover-mass thresholds from cooling and radiative feedback
pub trait Feedback: Send + Sync + Debug {
    /// Halo mass with a virial temperature of 1e4 K
    fn atomic_cooling_threshold(&self, z: f64) -> f64;

    /// Minihalo turnover from Lyman-Werner flux `j21` and streaming velocity `vcb`
    fn lyman_werner_threshold(&self, z: f64, j21: f64, vcb: f64) -> f64;

    /// Turnover from photoheating in a region ionized at `z_re`
    fn reionization_threshold(&self, z: f64, gamma12: f64, z_re: f64) -> f64;

    /// Lower limit of the source mass integrals
    fn minimum_source_mass(&self, z: f64) -> f64;
}

/// Thermal and recombination history of the IGM
pub trait ThermalHistory: Send + Sync + Debug {
    /// Kinetic temperature of gas ionized at `z_re`, observed at `z`
    fn fully_ionized_temperature(&self, z_re: f64, z: f64, delta: f64) -> f64;

    /// Volume-weighted temperature of a partially ionized cell
    fn partially_ionized_temperature(&self, t_hi: f64, x_h: f64) -> f64;

    /// Recombinations per hydrogen atom per second
    fn recombination_rate(&self, z_eff: f64, gamma12: f64) -> f64;

    /// Case-A recombination coefficient (cm³ s⁻¹)
    fn alpha_a(&self, t: f64) -> f64;

    /// Case-B recombination coefficient (cm³ s⁻¹)
    fn alpha_b(&self, t: f64) -> f64;

    /// Mean IGM kinetic temperature before heating starts
    fn recfast_temperature(&self, z: f64) -> f64;

    /// Mean free-electron fraction before heating starts
    fn recfast_xe(&self, z: f64) -> f64;

    /// Linear response of the gas temperature to density
    fn adiabatic_index(&self, z: f64) -> f64;
}

/// Photon non-conservation correction
pub trait PhotonConservation: Send + Sync + Debug {
    /// Sampled redshift and its shift from `z`
    ///
    /// Outside the calibrated range the result is non-finite and the caller
    /// treats it as fatal.
    fn adjust_redshift(&self, z: f64) -> (f64, f64);

    /// Redshift-dependent escape parameter fit, if calibrated
    fn escape_fit(&self, z: f64) -> Option<f64>;
}

/// Radiative transfer ingredients of the spin-temperature solver
pub trait RadiationPhysics: Send + Sync + Debug {
    /// Photons per baryon per unit `ν/ν_LL` emitted at `nu_norm`
    fn spectral_emissivity(&self, nu_norm: f64, band: Band, population: Population) -> f64;

    /// Fraction of Lyman-n photons that cascade through Lyman-alpha
    fn recycle_fraction(&self, n: u32) -> f64;

    /// X-ray energy deposition integral from `nu_min` (Hz) upwards
    fn frequency_integral(&self, zp: f64, x_e: f64, nu_min: f64, channel: DepositionChannel) -> f64;

    /// Frequency (Hz) at which the IGM between `zpp` and `zp` has unit depth
    fn nu_tau_one(&self, zp: f64, zpp: f64, x_e: f64, filling_factor: f64) -> f64;

    /// Spin-exchange rate coefficients at kinetic temperature `t_k`
    fn collisional_rates(&self, t_k: f64) -> CollisionRates;

    /// Lyman-alpha Gunn-Peterson optical depth
    fn gunn_peterson_depth(&self, z: f64, delta: f64, x_e: f64) -> f64;

    /// Energy (erg) deposited per Lyman-alpha photon, positive for heating
    fn lya_heating_energy(&self, t_k: f64, t_s: f64, tau_gp: f64, photons: LyaPhotons) -> f64;
}

// ============================================================================
// COLLABORATOR BUNDLE
// ============================================================================

/// Set of collaborators used by one simulation
#[derive(Debug, Clone)]
pub struct Physics {
    pub cosmology: Arc<dyn Cosmology>,
    pub mass_function: Arc<dyn MassFunction>,
    pub feedback: Arc<dyn Feedback>,
    pub thermal: Arc<dyn ThermalHistory>,
    pub photon_cons: Arc<dyn PhotonConservation>,
    pub radiation: Arc<dyn RadiationPhysics>,
}

impl Physics {
    /// Analytic defaults for `config`, without photon-conservation correction
    pub fn analytic(config: &SimulationConfig) -> Self {
        let cosmology: Arc<dyn Cosmology> = Arc::new(FlatLcdm::new(config.cosmo.clone()));
        Self {
            mass_function: Arc::new(PressSchechter::new(
                cosmology.clone(),
                config.global.delta_crit,
            )),
            feedback: Arc::new(ThresholdFeedback::new(cosmology.clone(), config)),
            thermal: Arc::new(AnalyticThermal::new(
                config.cosmo.clone(),
                config.global.clumping_factor,
            )),
            photon_cons: Arc::new(NoCorrection),
            radiation: Arc::new(StandardRadiation::new(cosmology.clone(), &config.astro)),
            cosmology,
        }
    }

    /// Replace the photon-conservation model
    pub fn with_photon_conservation(mut self, model: Arc<dyn PhotonConservation>) -> Self {
        self.photon_cons = model;
        self
    }
}
