//! Per-cell evolution of the neutral IGM over one redshift step
//!
//! Given the radiation rates accumulated over all shells, each cell advances
//! its free-electron fraction and kinetic temperature by one explicit step
//! in `z'`:
//!
//! ```text
//! dx_e/dz' = dt/dz' (Λ_ion - α_A C x_e² f_H n_b (1+δ))
//! dT_K/dz' = adiabatic + species + Compton + X-ray [+ CMB] [+ Lyα]
//! ```
//!
//! The spin temperature then follows from the Wouthuysen-Field and
//! collisional couplings:
//!
//! ```text
//! T_S⁻¹ = (x_CMB T_γ⁻¹ + x̃_α T_C⁻¹ + x_c T_K⁻¹) / (x_CMB + x̃_α + x_c)
//! ```
//!
//! # References
//! - Mesinger, A., Furlanetto, S., Cen, R. (2011). "21cmFAST: a fast,
//!   seminumerical simulation of the high-redshift 21-cm signal."
//!   MNRAS, 411, 955-972.
//! - Hirata, C.M. (2006). "Wouthuysen-Field coupling strength and
//!   application to high-redshift 21-cm radiation." MNRAS, 367, 259-274.

use crate::config::SimulationConfig;
use crate::physics::units::{
    self, A10_HYPERFINE, C, FRACT_FLOAT_ERR, HPLANK, K_B, LAMBDA_21, LY_ALPHA_HZ, MAX_TK, MSUN,
    M_P, NU_IONIZATION, NU_X_BAND_MAX, NU_OVER_EV, SEC_PER_YR, T21, T_CMB, Y_HE,
};
use crate::physics::{LyaPhotons, Physics};
use std::f64::consts::PI;

/// Lyman-alpha intensity below which only collisions couple the spin temperature
const WF_COUPLING_FLOOR: f64 = 1e-20;

/// Relative change that ends the Wouthuysen-Field iteration
const TS_TOLERANCE: f64 = 1e-3;

const MAX_TS_ITERATIONS: usize = 100;

/// Scalars of the redshift being evolved to
#[derive(Debug, Clone, PartialEq)]
pub struct ZpConstants {
    pub zp: f64,
    /// Step in `z'`, negative
    pub dzp: f64,
    /// `dt/dz'` (s), negative
    pub dt_dzp: f64,
    /// H(z') (s⁻¹)
    pub hubble: f64,
    pub growth: f64,
    /// `dD/dz'`
    pub dgrowth: f64,
    /// CMB temperature at `z'` (K)
    pub trad: f64,
    /// Mean hydrogen and baryon number densities at `z'` (cm⁻³)
    pub n_h: f64,
    pub n_b: f64,
    pub f_h: f64,
    pub f_he: f64,
    pub clumping: f64,
    xc_inverse: f64,
    ts_prefactor: f64,
    xa_tilde_prefactor: f64,
    dcomp_dzp_prefactor: f64,
    /// Converts summed X-ray luminosity × frequency integral to a rate per baryon
    pub xray_prefactor: f64,
    /// Converts summed stellar mass × Lyman-n weight to J_α (cm⁻² s⁻¹ Hz⁻¹ sr⁻¹)
    pub lya_star_prefactor: f64,
    /// Converts summed stellar mass × Lyman-Werner weight to J21
    pub lw_prefactor: f64,
    pub cmb_heating: bool,
    pub lya_heating: bool,
    pub mini_halos: bool,
}

impl ZpConstants {
    /// Constants for the step ending at `zp` after a redshift interval `dz > 0`
    pub fn new(config: &SimulationConfig, physics: &Physics, zp: f64, dz: f64) -> Self {
        let cosmology = physics.cosmology.as_ref();
        let cosmo = &config.cosmo;
        let astro = &config.astro;
        let zp1 = 1.0 + zp;
        let hubble = cosmology.hubble(zp);
        let trad = T_CMB * zp1;
        let n_h0 = units::n_hydrogen0(cosmo);
        let (f_h, f_he) = units::species_fractions(cosmo);

        // erg/s of the whole band to photons per Hz at the threshold
        let alpha = astro.x_ray_spec_index;
        let nu_th = astro.nu_x_thresh * NU_OVER_EV;
        let nu_max = NU_X_BAND_MAX * NU_OVER_EV;
        let band = if (alpha - 1.0).abs() < 1e-6 {
            nu_th * (nu_max / nu_th).ln()
        } else {
            nu_th.powf(alpha) * (nu_max.powf(1.0 - alpha) - nu_th.powf(1.0 - alpha))
                / (1.0 - alpha)
        };
        let xray_prefactor = C * zp1.powf(alpha + 3.0)
            / (band * HPLANK * nu_th * units::CM_PER_MPC.powi(3));

        let stars_per_baryon =
            C / (4.0 * PI) * MSUN / M_P * (1.0 - 0.75 * Y_HE) / units::CM_PER_MPC.powi(3);

        Self {
            zp,
            dzp: -dz,
            dt_dzp: cosmology.dt_dz(zp),
            hubble,
            growth: cosmology.growth(zp),
            dgrowth: cosmology.growth_derivative(zp),
            trad,
            n_h: n_h0 * zp1.powi(3),
            n_b: units::n_baryon0(cosmo) * zp1.powi(3),
            f_h,
            f_he,
            clumping: config.global.clumping_factor,
            xc_inverse: T21 / (trad * A10_HYPERFINE),
            ts_prefactor: (1e-7 * (1.342881e-7 / hubble) * n_h0 * zp1.powi(3)).cbrt(),
            xa_tilde_prefactor: 1.66e11 / zp1,
            dcomp_dzp_prefactor: -1.51e-4 / (hubble / units::hubble_constant(cosmo))
                / cosmo.hlittle
                * trad.powi(4)
                / zp1,
            xray_prefactor,
            lya_star_prefactor: stars_per_baryon / NU_IONIZATION,
            lw_prefactor: stars_per_baryon * HPLANK * 1e21,
            cmb_heating: config.flags.use_cmb_heating,
            lya_heating: config.flags.use_lya_heating,
            mini_halos: config.flags.use_mini_halos,
        }
    }

    /// Collisional coupling coefficient `x_c`
    fn collisional_coupling(&self, physics: &Physics, delta: f64, x_e: f64, t_k: f64) -> f64 {
        let rates = physics.radiation.collisional_rates(t_k);
        (1.0 + delta)
            * self.xc_inverse
            * ((1.0 - x_e) * self.n_h * rates.hh
                + x_e * self.n_b * rates.eh
                + x_e * self.n_h * rates.ph)
    }

    /// Spin temperature of a cell
    ///
    /// `j_alpha` is the total Lyman-alpha intensity and `x_cmb` the CMB
    /// coupling (1 without CMB heating).
    pub fn spin_temperature(
        &self,
        physics: &Physics,
        delta: f64,
        x_e: f64,
        t_k: f64,
        j_alpha: f64,
        x_cmb: f64,
    ) -> f64 {
        let x_c = self.collisional_coupling(physics, delta, x_e, t_k);
        let t_s = if j_alpha > WF_COUPLING_FLOOR {
            let t_inv = 1.0 / t_k;
            let xi = self.ts_prefactor * ((1.0 + delta) * (1.0 - x_e) * t_inv * t_inv).cbrt();
            let xa_arg = self.xa_tilde_prefactor * j_alpha
                / (1.0 + 2.98394 * xi + 1.53583 * xi * xi + 3.85289 * xi * xi * xi);
            let mut t_s = self.trad;
            for _ in 0..MAX_TS_ITERATIONS {
                let previous = t_s;
                let ts_inv = 1.0 / t_s;
                let x_a = (1.0 - 0.0631789 * t_inv + 0.115995 * t_inv * t_inv
                    - 0.401403 * t_inv * ts_inv
                    + 0.336463 * t_inv * t_inv * ts_inv)
                    * xa_arg;
                t_s = (x_cmb + x_a + x_c)
                    / (x_cmb / self.trad
                        + x_a * (t_inv + 0.405535 * t_inv * (ts_inv - t_inv))
                        + x_c * t_inv);
                if ((t_s - previous) / t_s).abs() <= TS_TOLERANCE {
                    break;
                }
            }
            t_s
        } else {
            (x_cmb + x_c) / (x_cmb / self.trad + x_c / t_k)
        };
        t_s.abs()
    }
}

/// Radiation rates of one cell summed over all shells
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RadiationTerms {
    /// X-ray heating (erg s⁻¹ per baryon)
    pub heat: f64,
    /// X-ray ionization (s⁻¹ per baryon)
    pub ionization: f64,
    /// Lyman-alpha photons from X-rays (s⁻¹ per baryon)
    pub lya_xray: f64,
    /// Stellar Lyman-alpha intensity (cm⁻² s⁻¹ Hz⁻¹ sr⁻¹)
    pub lya_star: f64,
    /// Continuum and injected parts of `lya_star`
    pub lya_continuum: f64,
    pub lya_injected: f64,
    /// Lyman-Werner intensity (J21)
    pub lyman_werner: f64,
}

impl std::ops::AddAssign for RadiationTerms {
    fn add_assign(&mut self, rhs: Self) {
        self.heat += rhs.heat;
        self.ionization += rhs.ionization;
        self.lya_xray += rhs.lya_xray;
        self.lya_star += rhs.lya_star;
        self.lya_continuum += rhs.lya_continuum;
        self.lya_injected += rhs.lya_injected;
        self.lyman_werner += rhs.lyman_werner;
    }
}

/// State of one cell before or after the step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellState {
    pub x_e: f64,
    pub temp_kinetic: f64,
    pub spin_temperature: f64,
    pub j21_lw: f64,
}

/// Advance one cell from the previous step to `consts.zp`
///
/// `delta` is the evolved density contrast at `zp`.
pub fn evolve_cell(
    consts: &ZpConstants,
    physics: &Physics,
    delta: f64,
    prev: CellState,
    terms: &RadiationTerms,
) -> CellState {
    let delta = delta.max(-1.0 + FRACT_FLOAT_ERR);
    let x_e = prev.x_e;
    let t_k = prev.temp_kinetic;
    let zp1 = 1.0 + consts.zp;
    let thermal_factor = 2.0 / (3.0 * K_B * (1.0 + x_e));

    let dxion_sink = physics.thermal.alpha_a(t_k)
        * consts.clumping
        * x_e
        * x_e
        * consts.f_h
        * consts.n_b
        * (1.0 + delta);
    let dxe_dzp = consts.dt_dzp * (terms.ionization - dxion_sink);

    let delta0 = delta / consts.growth;
    let mut dadia_dzp = 3.0 / zp1;
    if delta.abs() > FRACT_FLOAT_ERR {
        dadia_dzp += consts.dgrowth / (1.0 / delta0 + consts.growth);
    }
    dadia_dzp *= 2.0 / 3.0 * t_k;
    let dspec_dzp = -dxe_dzp * t_k / (1.0 + x_e);
    let dcomp_dzp =
        consts.dcomp_dzp_prefactor * (x_e / (1.0 + x_e + consts.f_he)) * (consts.trad - t_k);
    let dxheat_dzp = terms.heat * consts.dt_dzp * thermal_factor;

    let rate_to_dzp = thermal_factor / consts.hubble / zp1;
    let mut x_cmb = 1.0;
    let mut dcmb_dzp = 0.0;
    if consts.cmb_heating {
        let tau21 = 3.0 * HPLANK * A10_HYPERFINE * C * LAMBDA_21 * LAMBDA_21 / (32.0 * PI * K_B)
            * (1.0 - x_e)
            * consts.n_h
            / prev.spin_temperature
            / consts.hubble;
        if tau21 > 0.0 {
            x_cmb = (1.0 - (-tau21).exp()) / tau21;
        }
        let eps_cmb = 0.75 * (consts.trad / T21)
            * A10_HYPERFINE
            * consts.f_h
            * (HPLANK * HPLANK / (LAMBDA_21 * LAMBDA_21 * M_P))
            * (1.0 + 2.0 * t_k / T21);
        dcmb_dzp = -eps_cmb * rate_to_dzp;
    }

    let mut dlya_dzp = 0.0;
    if consts.lya_heating {
        let tau_gp = physics.radiation.gunn_peterson_depth(consts.zp, delta, x_e);
        let energy = |photons| {
            let e = physics
                .radiation
                .lya_heating_energy(t_k, prev.spin_temperature, tau_gp, photons);
            if e.is_finite() {
                e
            } else {
                0.0
            }
        };
        // Photons crossing the line per baryon per second, times energy per crossing
        let crossing = 4.0 * PI * LY_ALPHA_HZ * consts.hubble / C / (consts.n_b * (1.0 + delta));
        let eps_lya = crossing
            * (terms.lya_continuum * energy(LyaPhotons::Continuum)
                + terms.lya_injected * energy(LyaPhotons::Injected));
        dlya_dzp = -eps_lya * rate_to_dzp;
    }

    let mut x_e_new = x_e + dxe_dzp * consts.dzp;
    if x_e_new > 1.0 {
        x_e_new = 1.0 - FRACT_FLOAT_ERR;
    } else if x_e_new < 0.0 {
        x_e_new = 0.0;
    }

    let mut t_k_new = t_k;
    if t_k < MAX_TK {
        t_k_new += consts.dzp
            * (dxheat_dzp + dcomp_dzp + dspec_dzp + dadia_dzp + dcmb_dzp + dlya_dzp);
    }
    if t_k_new < 0.0 {
        t_k_new = consts.trad;
    }

    let j_alpha_xray =
        terms.lya_xray * C * consts.n_b * (1.0 + delta) / (4.0 * PI * consts.hubble * LY_ALPHA_HZ);
    let spin_temperature = consts.spin_temperature(
        physics,
        delta,
        x_e_new,
        t_k_new,
        j_alpha_xray + terms.lya_star,
        x_cmb,
    );

    CellState {
        x_e: x_e_new,
        temp_kinetic: t_k_new,
        spin_temperature,
        j21_lw: if consts.mini_halos {
            terms.lyman_werner
        } else {
            0.0
        },
    }
}

/// Luminosity density (erg s⁻¹ Mpc⁻³) of a star formation rate density
/// (Msun s⁻¹ Mpc⁻³) with `l_x` erg s⁻¹ per Msun yr⁻¹
#[inline]
pub fn xray_luminosity(sfr: f64, l_x: f64) -> f64 {
    sfr * SEC_PER_YR * l_x
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn setup(z: f64) -> (SimulationConfig, Physics, ZpConstants) {
        let config = SimulationConfig::small_box(4, 16.0);
        let physics = Physics::analytic(&config);
        let consts = ZpConstants::new(&config, &physics, z, 0.2);
        (config, physics, consts)
    }

    fn cold_gas(physics: &Physics, z: f64) -> CellState {
        CellState {
            x_e: physics.thermal.recfast_xe(z),
            temp_kinetic: physics.thermal.recfast_temperature(z),
            spin_temperature: 30.0,
            j21_lw: 0.0,
        }
    }

    #[test]
    fn test_collisional_spin_temperature_between_limits() {
        let (_, physics, consts) = setup(20.0);
        let t_k = 10.0;
        let t_s = consts.spin_temperature(&physics, 0.0, 2e-4, t_k, 0.0, 1.0);
        assert!(t_s > t_k && t_s < consts.trad);
    }

    #[test]
    fn test_strong_lya_couples_to_kinetic() {
        let (_, physics, consts) = setup(12.0);
        let t_k = 8.0;
        let t_s = consts.spin_temperature(&physics, 0.0, 2e-4, t_k, 1e-6, 1.0);
        assert!((t_s - t_k).abs() / t_k < 0.1);
    }

    #[test]
    fn test_dark_cell_cools_adiabatically() {
        let z = 15.0;
        let (mut config, _, _) = setup(z);
        config.flags.use_cmb_heating = false;
        config.flags.use_lya_heating = false;
        let physics = Physics::analytic(&config);
        let consts = ZpConstants::new(&config, &physics, z, 0.3);
        let prev = cold_gas(&physics, z + 0.3);
        let next = evolve_cell(&consts, &physics, 0.0, prev, &RadiationTerms::default());
        assert!(next.temp_kinetic < prev.temp_kinetic);
        assert!(next.x_e <= prev.x_e);
        assert!(next.x_e >= 0.0);
        assert_eq!(next.j21_lw, 0.0);
    }

    #[test]
    fn test_xray_heating_warms_gas() {
        let z = 12.0;
        let (_, physics, consts) = setup(z);
        let prev = cold_gas(&physics, z + 0.2);
        let dark = evolve_cell(&consts, &physics, 0.0, prev, &RadiationTerms::default());
        let terms = RadiationTerms {
            heat: 1e-30,
            ionization: 1e-18,
            ..RadiationTerms::default()
        };
        let lit = evolve_cell(&consts, &physics, 0.0, prev, &terms);
        assert!(lit.temp_kinetic > dark.temp_kinetic);
        assert!(lit.x_e > dark.x_e);
    }

    #[test]
    fn test_electron_fraction_clamped() {
        let z = 10.0;
        let (_, physics, consts) = setup(z);
        let prev = cold_gas(&physics, z + 0.2);
        let terms = RadiationTerms {
            ionization: 1.0,
            ..RadiationTerms::default()
        };
        let next = evolve_cell(&consts, &physics, 0.0, prev, &terms);
        assert_relative_eq!(next.x_e, 1.0 - FRACT_FLOAT_ERR);
    }

    #[test]
    fn test_hot_gas_not_evolved() {
        let z = 10.0;
        let (_, physics, consts) = setup(z);
        let prev = CellState {
            x_e: 0.1,
            temp_kinetic: 2.0 * MAX_TK,
            spin_temperature: 1e4,
            j21_lw: 0.0,
        };
        let next = evolve_cell(&consts, &physics, 0.0, prev, &RadiationTerms::default());
        assert_eq!(next.temp_kinetic, prev.temp_kinetic);
    }

    #[test]
    fn test_xray_luminosity_units() {
        assert_relative_eq!(xray_luminosity(1.0 / SEC_PER_YR, 1e40), 1e40);
    }
}
