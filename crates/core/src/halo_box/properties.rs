//! Galaxy properties of a single halo
//!
//! Every property is a mass-dependent mean times a lognormal scatter
//! `exp(σ·rng - σ²/2)`, which leaves the mean unchanged. The three draws of a
//! halo are shared by both populations, so a halo moves smoothly from the
//! minihalo parameters to the atomic-cooling ones as it grows.

use super::catalog::Halo;
use crate::config::LxModel;
use crate::constants::StepConstants;
use crate::context::SimulationContext;
use crate::error::{ErrorContext, ReionError, Result};
use crate::physics::units::SEC_PER_YR;
use crate::turnover::CellTurnovers;
use statrs::function::gamma::{checked_gamma_li, checked_gamma_ui};
use std::ops::AddAssign;

/// Quantities carried per halo, and their sums and box averages
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HaloProperties {
    /// Msun (or Msun Mpc⁻³ as a box average)
    pub halo_mass: f64,
    pub stellar_mass: f64,
    pub stellar_mass_mini: f64,
    /// Msun s⁻¹
    pub sfr: f64,
    pub sfr_mini: f64,
    /// Escape-fraction-weighted SFR times ionizing photons per baryon
    pub fescweighted_sfr: f64,
    /// Escaping ionizing photons per baryon, times stellar mass
    pub n_ion: f64,
    /// X-ray luminosity (1e38 erg s⁻¹)
    pub xray: f64,
    /// Gas metallicity (solar units)
    pub metallicity: f64,
    pub m_turn_acg: f64,
    pub m_turn_mcg: f64,
    pub m_turn_reion: f64,
}

impl AddAssign for HaloProperties {
    fn add_assign(&mut self, rhs: Self) {
        self.halo_mass += rhs.halo_mass;
        self.stellar_mass += rhs.stellar_mass;
        self.stellar_mass_mini += rhs.stellar_mass_mini;
        self.sfr += rhs.sfr;
        self.sfr_mini += rhs.sfr_mini;
        self.fescweighted_sfr += rhs.fescweighted_sfr;
        self.n_ion += rhs.n_ion;
        self.xray += rhs.xray;
        self.metallicity += rhs.metallicity;
        self.m_turn_acg += rhs.m_turn_acg;
        self.m_turn_mcg += rhs.m_turn_mcg;
        self.m_turn_reion += rhs.m_turn_reion;
    }
}

impl HaloProperties {
    /// The eight gridded quantities, in [`super::HaloBoxFields::grids`] order
    pub fn densities(&self) -> [f64; 8] {
        [
            self.halo_mass,
            self.stellar_mass,
            self.stellar_mass_mini,
            self.sfr,
            self.sfr_mini,
            self.fescweighted_sfr,
            self.n_ion,
            self.xray,
        ]
    }

    /// Inverse of [`HaloProperties::densities`], other members zero
    pub fn from_densities(v: [f64; 8]) -> Self {
        Self {
            halo_mass: v[0],
            stellar_mass: v[1],
            stellar_mass_mini: v[2],
            sfr: v[3],
            sfr_mini: v[4],
            fescweighted_sfr: v[5],
            n_ion: v[6],
            xray: v[7],
            ..Self::default()
        }
    }
}

/// Draws halo properties for one step
#[derive(Debug, Clone, Copy)]
pub struct HaloSampler<'a> {
    consts: &'a StepConstants,
    baryon_ratio: f64,
    pop2_ion: f64,
    pop3_ion: f64,
    lx_model: LxModel,
    use_mini_halos: bool,
    use_ts_fluct: bool,
}

impl<'a> HaloSampler<'a> {
    pub fn new(ctx: &SimulationContext, consts: &'a StepConstants) -> Self {
        let config = ctx.config();
        Self {
            consts,
            baryon_ratio: config.cosmo.omb / config.cosmo.omm,
            pop2_ion: config.global.pop2_ion,
            pop3_ion: config.global.pop3_ion,
            lx_model: config.astro.lx_model,
            use_mini_halos: config.flags.use_mini_halos,
            use_ts_fluct: config.flags.use_ts_fluct,
        }
    }

    /// Stellar-to-baryon fraction of the atomic-cooling component, uncapped
    ///
    /// # Formula
    /// ```text
    /// f = F_STAR10 s(M) exp(-Mt/M + σ* r - σ*²/2)
    /// ```
    pub fn stellar_fraction(&self, mass: f64, mturn_acg: f64, star_rng: f64) -> f64 {
        let sigma = self.consts.sigma_star;
        self.consts.star.norm
            * self.consts.star.shape(mass)
            * (-mturn_acg / mass + star_rng * sigma - sigma * sigma / 2.0).exp()
    }

    /// Stellar masses `(atomic, minihalo)` in Msun
    pub fn stellar_mass(&self, mass: f64, turnovers: &CellTurnovers, star_rng: f64) -> (f64, f64) {
        let baryons = mass * self.baryon_ratio;
        let stars = self
            .stellar_fraction(mass, turnovers.acg, star_rng)
            .min(1.0)
            * baryons;
        if !self.use_mini_halos {
            return (stars, 0.0);
        }
        let sigma = self.consts.sigma_star;
        let law = &self.consts.star_mini;
        let f_mini = law.norm
            * law.shape(mass)
            * (-turnovers.mcg / mass - mass / turnovers.acg + star_rng * sigma
                - sigma * sigma / 2.0)
                .exp();
        (stars, f_mini.min(1.0) * baryons)
    }

    /// Star formation rates `(atomic, minihalo)` in Msun s⁻¹
    ///
    /// The scatter widens for small total stellar mass and never drops below
    /// `SIGMA_SFR_LIM`.
    pub fn sfr(&self, stars: f64, stars_mini: f64, sfr_rng: f64) -> (f64, f64) {
        let lim = self.consts.sigma_sfr_lim;
        let sigma = if lim > 0.0 {
            (self.consts.sigma_sfr_index * ((stars + stars_mini) / 1e10).log10() + lim).max(lim)
        } else {
            0.0
        };
        let scatter = (sfr_rng * sigma - sigma * sigma / 2.0).exp();
        let timescale = self.consts.t_star_sec;
        let sfr = stars / timescale * scatter;
        let sfr_mini = if self.use_mini_halos {
            stars_mini / timescale * scatter
        } else {
            0.0
        };
        (sfr, sfr_mini)
    }

    /// X-ray luminosity (1e38 erg s⁻¹) of both populations
    ///
    /// # Errors
    ///
    /// See [`lx_on_sfr`].
    pub fn xray(&self, sfr: f64, sfr_mini: f64, metallicity: f64, xray_rng: f64) -> Result<f64> {
        let sigma = self.consts.sigma_xray;
        let scatter = (xray_rng * sigma - sigma * sigma / 2.0).exp();
        let mut xray =
            lx_on_sfr(self.lx_model, sfr, metallicity, self.consts.l_x)? * sfr * SEC_PER_YR * scatter;
        if self.use_mini_halos {
            xray += lx_on_sfr(self.lx_model, sfr_mini, metallicity, self.consts.l_x_mini)?
                * sfr_mini
                * SEC_PER_YR
                * scatter;
        }
        Ok(xray)
    }

    /// All properties of `halo` living in a cell with `turnovers`
    ///
    /// # Errors
    ///
    /// [`ReionError::Numerical`] when the X-ray luminosity cannot be
    /// evaluated at the halo's metallicity.
    pub fn sample(&self, halo: &Halo, turnovers: &CellTurnovers) -> Result<HaloProperties> {
        let mass = halo.mass;
        let (stars, stars_mini) = self.stellar_mass(mass, turnovers, f64::from(halo.star_rng));
        let (sfr, sfr_mini) = self.sfr(stars, stars_mini, f64::from(halo.sfr_rng));

        let (metallicity, xray) = if self.use_ts_fluct && sfr + sfr_mini > 0.0 {
            let z = metallicity(sfr + sfr_mini, stars + stars_mini, self.consts.redshift);
            (z, self.xray(sfr, sfr_mini, z, f64::from(halo.xray_rng))?)
        } else {
            (0.0, 0.0)
        };

        let fesc = (self.consts.esc.norm * self.consts.esc.shape(mass)).min(1.0);
        let fesc_mini = if self.use_mini_halos {
            (self.consts.esc_mini.norm * self.consts.esc_mini.shape(mass)).min(1.0)
        } else {
            0.0
        };

        Ok(HaloProperties {
            halo_mass: mass,
            stellar_mass: stars,
            stellar_mass_mini: stars_mini,
            sfr,
            sfr_mini,
            fescweighted_sfr: sfr * self.pop2_ion * fesc + sfr_mini * self.pop3_ion * fesc_mini,
            n_ion: stars * self.pop2_ion * fesc + stars_mini * self.pop3_ion * fesc_mini,
            xray,
            metallicity,
            m_turn_acg: turnovers.acg,
            m_turn_mcg: turnovers.mcg,
            m_turn_reion: turnovers.reion,
        })
    }
}

/// Gas metallicity from the fundamental metallicity relation
///
/// # Formula
/// ```text
/// Z = 0.296 (1 + (M*/(1.28825e10 SFR_yr^0.56))^-2.1)^-0.148 10^(-0.056 z + 0.064)
/// ```
pub fn metallicity(sfr: f64, stellar_mass: f64, redshift: f64) -> f64 {
    let denom = 1.28825e10 * (sfr * SEC_PER_YR).powf(0.56);
    0.296
        * (1.0 + (stellar_mass / denom).powf(-2.1)).powf(-0.148)
        * 10f64.powf(-0.056 * redshift + 0.064)
}

/// X-ray luminosity per unit SFR (1e38 erg s⁻¹ per Msun yr⁻¹)
///
/// `lx_constant` sets the normalisation of every model except
/// [`LxModel::Lehmer`], whose normalisation is fixed by its fit.
///
/// # Errors
///
/// [`ReionError::Numerical`] when the Lehmer luminosity-function integral
/// is undefined at `metallicity`.
pub fn lx_on_sfr(model: LxModel, sfr: f64, metallicity: f64, lx_constant: f64) -> Result<f64> {
    let ratio = match model {
        LxModel::DoublePowerLaw => {
            // constant at low Z, half the constant at Z = 0.05
            lx_constant / ((metallicity / 0.05).powf(0.64) + 1.0)
        }
        LxModel::Kaur => {
            let l10z = metallicity.log10();
            10f64.powf(0.03 * (sfr * SEC_PER_YR).log10() - 0.64 * l10z) * lx_constant
        }
        LxModel::Schechter => {
            let z_turn = 8e-3 / 0.02;
            10f64.powf(0.3 * (metallicity / z_turn).log10() - metallicity / z_turn) * lx_constant
        }
        LxModel::Lehmer => return lx_on_sfr_lehmer(metallicity),
    };
    Ok(ratio)
}

/// Integral of a double power law with an exponential cut-off over the
/// high-mass X-ray binary luminosity function
fn lx_on_sfr_lehmer(metallicity: f64) -> Result<f64> {
    let l10z = metallicity.log10();
    let slope_low = 1.74;
    let slope_high = 1.16 + 1.34 * l10z;
    let norm = 1.29;
    let l10_break = 38.54 - 38.0;
    let l10_crit = 39.98 - 38.0 + 0.6 * l10z;
    let ratio = 10f64.powf(l10_break - l10_crit);

    let prefactor_low = 10f64.powf(l10_crit * (2.0 - slope_low));
    let prefactor_high =
        10f64.powf(l10_crit * (2.0 - slope_high) + l10_break * (slope_high - slope_low));
    let gamma_low =
        checked_gamma_li(2.0 - slope_low, ratio).map_err(|e| lehmer_undefined(metallicity, e))?;
    let gamma_high =
        checked_gamma_ui(2.0 - slope_high, ratio).map_err(|e| lehmer_undefined(metallicity, e))?;
    Ok(norm * (prefactor_low * gamma_low + prefactor_high * gamma_high))
}

fn lehmer_undefined(metallicity: f64, err: impl std::fmt::Display) -> ReionError {
    ReionError::numerical(
        ErrorContext::default(),
        "Lehmer X-ray luminosity",
        format!("metallicity {metallicity}: {err}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::error::ErrorKind;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn setup(config: SimulationConfig) -> (SimulationContext, StepConstants) {
        let ctx = SimulationContext::new(config).unwrap();
        let consts = StepConstants::new(&ctx, 8.0, 0.0).unwrap();
        (ctx, consts)
    }

    fn turnovers(consts: &StepConstants) -> CellTurnovers {
        CellTurnovers {
            acg: consts.mturn_a_nofb,
            mcg: consts.mturn_m_nofb,
            reion: 0.0,
            lw: consts.mturn_m_nofb,
        }
    }

    #[test]
    fn test_lognormal_scatter_keeps_mean() {
        let (ctx, consts) = setup(SimulationConfig::small_box(4, 8.0));
        let sampler = HaloSampler::new(&ctx, &consts);
        let (mass, mturn) = (1e10, 5e8);
        let expected = sampler.stellar_fraction(mass, mturn, 0.0)
            * (consts.sigma_star * consts.sigma_star / 2.0).exp();
        let mut rng = StdRng::seed_from_u64(42);
        let n = 1_000_000;
        let mean = (0..n)
            .map(|_| {
                let r: f64 = rng.sample(StandardNormal);
                sampler.stellar_fraction(mass, mturn, r)
            })
            .sum::<f64>()
            / f64::from(n);
        let unscattered = consts.star.norm * consts.star.shape(mass) * (-mturn / mass).exp();
        assert_relative_eq!(mean, unscattered, max_relative = 0.01);
        assert!(expected > unscattered);
    }

    #[test]
    fn test_stellar_fraction_is_capped() {
        let (ctx, consts) = setup(SimulationConfig::small_box(4, 8.0));
        let sampler = HaloSampler::new(&ctx, &consts);
        let t = turnovers(&consts);
        let mass = 1e14;
        let (stars, mini) = sampler.stellar_mass(mass, &t, 20.0);
        let baryons = mass * ctx.config().cosmo.omb / ctx.config().cosmo.omm;
        assert_relative_eq!(stars, baryons);
        assert_eq!(mini, 0.0);
    }

    #[test]
    fn test_sfr_scatter_floor() {
        let (ctx, consts) = setup(SimulationConfig::small_box(4, 8.0));
        let sampler = HaloSampler::new(&ctx, &consts);
        let (sfr, _) = sampler.sfr(1e8, 0.0, 0.0);
        let lim = consts.sigma_sfr_lim;
        let sigma = (consts.sigma_sfr_index * (1e8_f64 / 1e10).log10() + lim).max(lim);
        let mean = 1e8 / consts.t_star_sec;
        assert_relative_eq!(sfr, mean * (-sigma * sigma / 2.0).exp(), max_relative = 1e-12);

        // above 1e10 Msun the index would shrink the width below the floor
        let (massive, _) = sampler.sfr(1e12, 0.0, 0.0);
        assert_relative_eq!(
            massive,
            1e12 / consts.t_star_sec * (-lim * lim / 2.0).exp(),
            max_relative = 1e-12
        );
    }

    #[test]
    fn test_sample_combines_populations() {
        let mut config = SimulationConfig::small_box(4, 8.0);
        config.flags.use_mini_halos = true;
        config.flags.use_ts_fluct = true;
        let (ctx, consts) = setup(config);
        let sampler = HaloSampler::new(&ctx, &consts);
        let t = CellTurnovers {
            acg: 1e8,
            mcg: 1e6,
            reion: 0.0,
            lw: 1e6,
        };
        let props = sampler.sample(&Halo::new([0.0; 3], 3e7), &t).unwrap();
        assert!(props.stellar_mass_mini > 0.0);
        assert!(props.n_ion > 0.0);
        assert!(props.xray > 0.0);
        assert!(props.metallicity > 0.0);
        assert_eq!(props.m_turn_acg, 1e8);

        let pop2 = ctx.config().global.pop2_ion;
        let pop3 = ctx.config().global.pop3_ion;
        let fesc = (consts.esc.norm * consts.esc.shape(3e7)).min(1.0);
        let fesc_mini = (consts.esc_mini.norm * consts.esc_mini.shape(3e7)).min(1.0);
        assert_relative_eq!(
            props.n_ion,
            props.stellar_mass * pop2 * fesc + props.stellar_mass_mini * pop3 * fesc_mini,
            max_relative = 1e-12
        );
    }

    #[test]
    fn test_no_xray_without_spin_temperature() {
        let (ctx, consts) = setup(SimulationConfig::small_box(4, 8.0));
        let sampler = HaloSampler::new(&ctx, &consts);
        let props = sampler.sample(&Halo::new([0.0; 3], 1e11), &turnovers(&consts)).unwrap();
        assert_eq!(props.xray, 0.0);
        assert_eq!(props.metallicity, 0.0);
    }

    #[test]
    fn test_double_power_law_halves_at_pivot() {
        assert_relative_eq!(lx_on_sfr(LxModel::DoublePowerLaw, 1.0, 0.05, 2.0).unwrap(), 1.0);
        assert!(lx_on_sfr(LxModel::DoublePowerLaw, 1.0, 1e-4, 2.0).unwrap() > 1.9);
    }

    #[test]
    fn test_kaur_normalised_at_solar() {
        let sfr_one_per_year = 1.0 / SEC_PER_YR;
        assert_relative_eq!(
            lx_on_sfr(LxModel::Kaur, sfr_one_per_year, 1.0, 316.0).unwrap(),
            316.0,
            max_relative = 1e-12
        );
    }

    #[test]
    fn test_lehmer_finite_and_peaked() {
        let low = lx_on_sfr(LxModel::Lehmer, 1.0, 1e-3, 0.0).unwrap();
        let mid = lx_on_sfr(LxModel::Lehmer, 1.0, 0.1, 0.0).unwrap();
        let solar = lx_on_sfr(LxModel::Lehmer, 1.0, 1.0, 0.0).unwrap();
        assert!(low.is_finite() && mid.is_finite() && solar.is_finite());
        assert!(mid > solar);
        assert!(mid > 0.0);
    }

    #[test]
    fn test_starless_halo_emits_no_xrays() {
        let mut config = SimulationConfig::small_box(4, 8.0);
        config.flags.use_ts_fluct = true;
        config.astro.lx_model = LxModel::Lehmer;
        let (ctx, consts) = setup(config);
        let sampler = HaloSampler::new(&ctx, &consts);
        let t = CellTurnovers {
            acg: 1e12,
            ..turnovers(&consts)
        };
        let props = sampler.sample(&Halo::new([0.0; 3], 1e5), &t).unwrap();
        assert_eq!(props.stellar_mass, 0.0);
        assert_eq!(props.xray, 0.0);
        assert_eq!(props.metallicity, 0.0);
    }

    #[test]
    fn test_lehmer_outside_fit_is_numerical_error() {
        // upper-branch slope passes 2 above ~4.2 solar
        let err = lx_on_sfr(LxModel::Lehmer, 1.0, 10.0, 0.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Numerical);
        assert!(err.to_string().contains("Lehmer"));
    }

    #[test]
    fn test_metallicity_falls_with_redshift() {
        let sfr = 1.0 / SEC_PER_YR;
        assert!(metallicity(sfr, 1e9, 10.0) < metallicity(sfr, 1e9, 6.0));
        assert!(metallicity(sfr, 1e10, 8.0) > metallicity(sfr, 1e8, 8.0));
    }
}
