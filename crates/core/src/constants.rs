//! Per-step derived constants
//!
//! Both box solvers need the same efficiency laws, turnover floors, time
//! scales and mass limits for a redshift step. [`StepConstants`] evaluates
//! them once from the configuration and the current/previous redshift; every
//! per-cell computation of the step borrows it.

use crate::config::PhotonConsType;
use crate::context::SimulationContext;
use crate::error::{ErrorContext, ReionError, Result};
use crate::physics::units::{self, CM_PER_MPC, SIGMA_HI};
use crate::physics::{EfficiencyLaw, Physics, SourceModel};
use tracing::debug;

/// Upper limit of the log10 turnover-mass tables
pub const LOG10_MTURN_MAX: f64 = 10.0;

/// Stellar-mass pivot of the atomic-cooling population (Msun)
pub const ACG_PIVOT: f64 = 1e10;

/// Stellar-mass pivot of the minihalo population (Msun)
pub const MCG_PIVOT: f64 = 1e7;

/// Scale of the X-ray luminosities stored on grids (erg/s)
pub const LX_UNIT: f64 = 1e38;

/// Read-only scalars of one redshift step
#[derive(Debug, Clone, PartialEq)]
pub struct StepConstants {
    /// Redshift the source fields are sampled at
    pub redshift: f64,
    /// Redshift requested by the caller, before any photon-conservation shift
    pub stored_redshift: f64,
    /// Redshift of the previous step, or a value below 1 on the first step
    pub prev_redshift: f64,
    pub growth: f64,
    pub prev_growth: f64,
    /// `D(z_sampled)/D(z_requested)` applied to the density field
    pub photoncons_adjustment: f64,
    /// Redshift interval since the previous step, positive
    pub dz: f64,
    /// `|dt/dz|` at the requested redshift (s)
    pub abs_dtdz: f64,
    /// Rescale integrated fields to the unconditional expectation
    pub fix_mean: bool,
    /// Filter the cumulative recombinations instead of using the cell value
    pub filter_recombinations: bool,

    /// Stellar fraction of atomic-cooling galaxies
    pub star: EfficiencyLaw,
    /// Escape fraction of atomic-cooling galaxies
    pub esc: EfficiencyLaw,
    pub star_mini: EfficiencyLaw,
    pub esc_mini: EfficiencyLaw,
    pub sigma_star: f64,
    pub sigma_sfr_lim: f64,
    pub sigma_sfr_index: f64,
    pub sigma_xray: f64,
    /// Hubble time (s)
    pub t_h: f64,
    /// Star formation timescale in Hubble times
    pub t_star: f64,
    /// Star formation timescale (s)
    pub t_star_sec: f64,
    /// X-ray luminosity per SFR in units of [`LX_UNIT`]
    pub l_x: f64,
    pub l_x_mini: f64,

    /// Atomic-cooling turnover without radiative feedback (Msun)
    pub mturn_a_nofb: f64,
    /// Molecular-cooling turnover without radiative feedback (Msun)
    pub mturn_m_nofb: f64,
    /// Streaming velocity used where no velocity grid applies (km/s)
    pub vcb_norel: f64,

    /// Ionizing efficiency applied to the local collapsed fraction
    pub ion_eff: f64,
    pub ion_eff_mini: f64,
    /// Ionizing efficiency of the global mean collapsed fraction
    pub ion_eff_gl: f64,
    pub ion_eff_gl_mini: f64,

    /// Mean free path of ionizing photons at mean density (Mpc)
    pub mfp_meandens: f64,
    /// Lower limit of the source mass integrals (Msun)
    pub m_min: f64,
    pub ln_m_min: f64,
    pub ln_m_max: f64,
    /// σ(M_min) at `z = 0`
    pub sigma_minmass: f64,
    /// Mean IGM temperature when the spin temperature is not tracked (K)
    pub tk_nofluct: f64,
    /// Adiabatic index of the IGM temperature-density relation
    pub adia_tk_term: f64,
    /// Cell side length (Mpc)
    pub pixel_length: f64,
    /// Mass of a cell at mean density (Msun)
    pub pixel_mass: f64,
    /// Photoionization rate per unit filtered source field (1e-12 s⁻¹)
    pub gamma_prefactor: f64,
    pub gamma_prefactor_mini: f64,
}

impl StepConstants {
    /// Constants for the step from `prev_redshift` to `redshift`
    ///
    /// # Errors
    ///
    /// Returns [`ReionError::Config`] when an escape-fraction fit is needed
    /// but the photon-conservation model has none.
    pub fn new(ctx: &SimulationContext, redshift: f64, prev_redshift: f64) -> Result<Self> {
        let config = ctx.config();
        let physics = ctx.physics();
        let (astro, flags, global, cosmo) =
            (&config.astro, &config.flags, &config.global, &config.cosmo);
        let cosmology = physics.cosmology.as_ref();

        let dz = if prev_redshift < 1.0 {
            (1.0 + redshift) * (global.zprime_step_factor - 1.0)
        } else {
            prev_redshift - redshift
        };

        let mut alpha_esc = astro.alpha_esc;
        let mut f_esc10 = astro.f_esc10;
        let fit = || {
            physics.photon_cons.escape_fit(redshift).ok_or_else(|| {
                ReionError::config(
                    ErrorContext::at(redshift),
                    "photon-conservation escape fit requested but not calibrated",
                )
            })
        };
        match flags.photon_cons_type {
            PhotonConsType::AlphaEscFit => alpha_esc = fit()?,
            PhotonConsType::FescFit => f_esc10 = fit()?,
            PhotonConsType::None | PhotonConsType::RedshiftShift => {}
        }

        let mut star = EfficiencyLaw::power_law(astro.f_star10, ACG_PIVOT, astro.alpha_star);
        if flags.use_upper_stellar_turnover {
            star.upper = Some((
                astro.upper_stellar_turnover_mass,
                astro.upper_stellar_turnover_index,
            ));
        }
        let esc = EfficiencyLaw::power_law(f_esc10, ACG_PIVOT, alpha_esc);
        let star_mini =
            EfficiencyLaw::power_law(astro.f_star7_mini, MCG_PIVOT, astro.alpha_star_mini);
        let esc_mini = EfficiencyLaw::power_law(astro.f_esc7_mini, MCG_PIVOT, alpha_esc);

        let t_h = cosmology.hubble_time(redshift);

        let vcb_norel = if flags.fix_vcb_avg { global.vavg } else { 0.0 };
        let mut mturn_a_nofb = if flags.use_mini_halos {
            physics.feedback.atomic_cooling_threshold(redshift)
        } else {
            astro.m_turn
        };
        let mut mturn_m_nofb = if flags.use_mini_halos {
            physics.feedback.lyman_werner_threshold(redshift, 0.0, vcb_norel)
        } else {
            0.0
        };
        mturn_a_nofb = mturn_a_nofb.max(astro.m_turn);
        mturn_m_nofb = mturn_m_nofb.max(astro.m_turn);

        let (ion_eff_gl, ion_eff_gl_mini) = if flags.use_mass_dependent_zeta {
            (
                global.pop2_ion * astro.f_star10 * f_esc10,
                global.pop3_ion * astro.f_star7_mini * astro.f_esc7_mini,
            )
        } else {
            (astro.hii_eff_factor, 0.0)
        };
        let (ion_eff, ion_eff_mini) = if flags.use_halo_field {
            (1.0, 1.0)
        } else {
            (ion_eff_gl, ion_eff_gl_mini)
        };

        let mfp_meandens = if redshift > 6.0 {
            25.483241248322766 / cosmo.hlittle
        } else {
            112.0 / cosmo.hlittle * ((1.0 + redshift) / 5.0).powf(-4.4)
        };

        let m_min = physics.feedback.minimum_source_mass(redshift);
        let pixel_length = config.user.pixel_length();
        let rho_crit = units::rho_crit(cosmo);
        let t_star_sec = astro.t_star * t_h;

        let mut gamma_prefactor = (1.0 + redshift).powi(2)
            * CM_PER_MPC
            * SIGMA_HI
            * global.alpha_uvb
            / (global.alpha_uvb + 2.75)
            * units::n_baryon0(cosmo)
            * ion_eff
            / 1e-12;
        if flags.use_halo_field {
            gamma_prefactor /= rho_crit * cosmo.omb;
        } else {
            gamma_prefactor /= t_star_sec;
        }
        let gamma_prefactor_mini = if ion_eff > 0.0 {
            gamma_prefactor * ion_eff_mini / ion_eff
        } else {
            0.0
        };

        let consts = Self {
            redshift,
            stored_redshift: redshift,
            prev_redshift,
            growth: cosmology.growth(redshift),
            prev_growth: cosmology.growth(prev_redshift.max(0.0)),
            photoncons_adjustment: 1.0,
            dz,
            abs_dtdz: cosmology.dt_dz(redshift).abs(),
            fix_mean: !flags.use_halo_field,
            filter_recombinations: flags.inhomo_reco && !flags.cell_recomb,
            star,
            esc,
            star_mini,
            esc_mini,
            sigma_star: astro.sigma_star,
            sigma_sfr_lim: astro.sigma_sfr_lim,
            sigma_sfr_index: astro.sigma_sfr_index,
            sigma_xray: astro.sigma_lx,
            t_h,
            t_star: astro.t_star,
            t_star_sec,
            l_x: astro.l_x / LX_UNIT,
            l_x_mini: astro.l_x_mini / LX_UNIT,
            mturn_a_nofb,
            mturn_m_nofb,
            vcb_norel,
            ion_eff,
            ion_eff_mini,
            ion_eff_gl,
            ion_eff_gl_mini,
            mfp_meandens,
            m_min,
            ln_m_min: m_min.ln(),
            ln_m_max: global.m_max_integral.ln(),
            sigma_minmass: cosmology.sigma(m_min.ln()),
            tk_nofluct: physics.thermal.recfast_temperature(redshift),
            adia_tk_term: physics.thermal.adiabatic_index(redshift),
            pixel_length,
            pixel_mass: cosmo.omm * rho_crit * pixel_length.powi(3),
            gamma_prefactor,
            gamma_prefactor_mini,
        };
        debug!(
            z = redshift,
            prev_z = prev_redshift,
            m_min = consts.m_min,
            mturn_a = consts.mturn_a_nofb,
            ion_eff = consts.ion_eff_gl,
            "Step constants set"
        );
        Ok(consts)
    }

    /// Move the sampled redshift along the photon-conservation curve
    ///
    /// Only the sampled redshift and the density adjustment change; every
    /// other constant stays at the requested redshift.
    ///
    /// # Errors
    ///
    /// Returns [`ReionError::PhotonConservation`] when the curve gives a
    /// non-finite redshift or shift.
    pub fn apply_photon_conservation(&mut self, physics: &Physics) -> Result<()> {
        let requested = self.stored_redshift;
        let (adjusted, delta_z) = physics.photon_cons.adjust_redshift(requested);
        debug!(
            original = requested,
            adjusted, delta_z, "Photon-conservation redshift adjustment"
        );
        if !adjusted.is_finite() || !delta_z.is_finite() {
            return Err(ReionError::PhotonConservation {
                context: ErrorContext::at(requested),
                adjusted,
                delta_z,
            });
        }
        self.redshift = adjusted;
        self.photoncons_adjustment =
            physics.cosmology.growth(adjusted) / physics.cosmology.growth(requested);
        Ok(())
    }

    /// True on the first step of a run, where no previous boxes exist
    pub fn is_first_step(&self) -> bool {
        self.prev_redshift < 1.0
    }

    /// Ionizing-photon weighting of atomic-cooling galaxies with turnover `mturn`
    pub fn acg_source(&self, mturn: f64) -> SourceModel {
        SourceModel::ionizing(self.star, self.esc, mturn)
    }

    /// Ionizing-photon weighting of minihalos, cut off above `mturn_acg`
    pub fn mcg_source(&self, mturn: f64, mturn_acg: f64) -> SourceModel {
        SourceModel::ionizing(self.star_mini, self.esc_mini, mturn).with_upper_cutoff(mturn_acg)
    }

    /// Stellar-mass weighting of atomic-cooling galaxies
    pub fn acg_stars(&self, mturn: f64) -> SourceModel {
        SourceModel::stellar(self.star, mturn)
    }

    /// Stellar-mass weighting of minihalos
    pub fn mcg_stars(&self, mturn: f64, mturn_acg: f64) -> SourceModel {
        SourceModel::stellar(self.star_mini, mturn).with_upper_cutoff(mturn_acg)
    }

    /// Context for errors raised while this step runs
    pub fn error_context(&self) -> ErrorContext {
        ErrorContext::at(self.stored_redshift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::error::ErrorKind;
    use crate::physics::{CalibrationCurve, Physics};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn context(config: SimulationConfig) -> SimulationContext {
        SimulationContext::new(config).unwrap()
    }

    #[test]
    fn test_first_step_interval() {
        let ctx = context(SimulationConfig::small_box(4, 8.0));
        let consts = StepConstants::new(&ctx, 9.0, 0.0).unwrap();
        assert!(consts.is_first_step());
        assert_relative_eq!(consts.dz, 10.0 * 0.02, epsilon = 1e-12);
        let next = StepConstants::new(&ctx, 8.5, 9.0).unwrap();
        assert_relative_eq!(next.dz, 0.5);
        assert!(next.prev_growth < next.growth);
    }

    #[test]
    fn test_efficiencies_follow_flags() {
        let mut config = SimulationConfig::small_box(4, 8.0);
        let ctx = context(config.clone());
        let consts = StepConstants::new(&ctx, 8.0, 0.0).unwrap();
        assert_relative_eq!(consts.ion_eff, consts.ion_eff_gl);
        assert_relative_eq!(
            consts.ion_eff_gl,
            5000.0 * config.astro.f_star10 * config.astro.f_esc10
        );
        assert!(consts.fix_mean);

        config.flags.use_halo_field = true;
        let consts = StepConstants::new(&context(config), 8.0, 0.0).unwrap();
        assert_eq!(consts.ion_eff, 1.0);
        assert!(!consts.fix_mean);
    }

    #[test]
    fn test_turnover_floor() {
        let mut config = SimulationConfig::small_box(4, 8.0);
        config.flags.use_mini_halos = true;
        config.flags.use_ts_fluct = true;
        config.astro.m_turn = 1e5;
        let consts = StepConstants::new(&context(config.clone()), 12.0, 0.0).unwrap();
        assert!(consts.mturn_a_nofb > 1e6);
        assert!(consts.mturn_m_nofb >= 1e5);

        config.astro.m_turn = 1e12;
        let consts = StepConstants::new(&context(config), 12.0, 0.0).unwrap();
        assert_eq!(consts.mturn_a_nofb, 1e12);
        assert_eq!(consts.mturn_m_nofb, 1e12);
    }

    #[test]
    fn test_missing_escape_fit_is_config_error() {
        let mut config = SimulationConfig::small_box(4, 8.0);
        config.flags.photon_cons_type = PhotonConsType::FescFit;
        let err = StepConstants::new(&context(config), 8.0, 0.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_escape_fit_replaces_normalisation() {
        let mut config = SimulationConfig::small_box(4, 8.0);
        config.flags.photon_cons_type = PhotonConsType::FescFit;
        let physics = Physics::analytic(&config).with_photon_conservation(Arc::new(
            CalibrationCurve::new(5.0, 15.0, vec![0.0, 0.0]).with_escape_fit(vec![0.2]),
        ));
        let ctx = SimulationContext::with_physics(config, physics).unwrap();
        let consts = StepConstants::new(&ctx, 8.0, 0.0).unwrap();
        assert_relative_eq!(consts.esc.norm, 0.2);
    }

    #[test]
    fn test_photon_conservation_shift() {
        let config = SimulationConfig::small_box(4, 8.0);
        let physics = Physics::analytic(&config).with_photon_conservation(Arc::new(
            CalibrationCurve::new(5.0, 15.0, vec![0.5, 0.5]),
        ));
        let ctx = SimulationContext::with_physics(config, physics.clone()).unwrap();
        let mut consts = StepConstants::new(&ctx, 8.0, 0.0).unwrap();
        consts.apply_photon_conservation(&physics).unwrap();
        assert_relative_eq!(consts.redshift, 8.5, epsilon = 1e-12);
        assert_eq!(consts.stored_redshift, 8.0);
        assert!(consts.photoncons_adjustment < 1.0);

        let mut late = StepConstants::new(&ctx, 20.0, 0.0).unwrap();
        let err = late.apply_photon_conservation(&physics).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PhotonConservation);
    }
}
