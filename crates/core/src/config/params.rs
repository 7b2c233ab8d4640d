//! Parameter structs
//!
//! All values are stored in linear physical units (solar masses, Mpc, Kelvin,
//! erg/s per SFR) rather than the log10 form used in parameter files. The
//! defaults reproduce the standard reference model.

use serde::{Deserialize, Serialize};

/// Lagrangian-to-Eulerian radius factor for a sphere with the volume of a cube
pub const L_FACTOR: f64 = 0.620350491;

/// Grid and run-control parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserParams {
    /// Cells per side of the low-resolution grid
    pub hii_dim: usize,
    /// Cells per side of the high-resolution initial-conditions grid
    pub dim: usize,
    /// Comoving box side length (Mpc)
    pub box_len: f64,
    /// Ratio of the line-of-sight side to the transverse sides
    pub non_cubic_factor: f64,
    /// Worker threads for the per-cell loops
    pub n_threads: usize,
    /// Disable the cell-scale Poisson draw for partial ionizations
    pub no_rng: bool,
    /// Use the relative baryon/dark-matter velocity grid for LW feedback
    pub use_relative_velocities: bool,
    /// Add integrated fixed grids below the sampler minimum mass in catalog mode
    pub avg_below_sampler: bool,
    /// Minimum halo mass resolved by the halo sampler (Msun)
    pub sampler_min_mass: f64,
    /// Evaluate conditional integrals through per-radius tables
    pub use_interpolation_tables: bool,
    /// Apply second-order displacements when perturbing halos
    pub use_2lpt: bool,
    /// Halo coordinates refer to the high-resolution grid
    pub perturb_on_high_res: bool,
    /// Seed for the partial-ionization Poisson draws
    pub rng_seed: u64,
}

impl Default for UserParams {
    fn default() -> Self {
        Self {
            hii_dim: 200,
            dim: 600,
            box_len: 300.0,
            non_cubic_factor: 1.0,
            n_threads: 1,
            no_rng: false,
            use_relative_velocities: false,
            avg_below_sampler: false,
            sampler_min_mass: 5e7,
            use_interpolation_tables: true,
            use_2lpt: true,
            perturb_on_high_res: false,
            rng_seed: 12345,
        }
    }
}

impl UserParams {
    /// Number of cells along the line of sight
    pub fn d_para(&self) -> usize {
        (self.non_cubic_factor * self.hii_dim as f64).round() as usize
    }

    /// Number of high-resolution cells along the line of sight
    pub fn hires_d_para(&self) -> usize {
        (self.non_cubic_factor * self.dim as f64).round() as usize
    }

    /// Comoving volume of the box (Mpc³)
    pub fn volume(&self) -> f64 {
        self.box_len * self.box_len * self.box_len * self.non_cubic_factor
    }

    /// Total number of low-resolution cells
    pub fn total_cells(&self) -> usize {
        self.hii_dim * self.hii_dim * self.d_para()
    }

    /// Comoving side length of one cell (Mpc)
    pub fn pixel_length(&self) -> f64 {
        self.box_len / self.hii_dim as f64
    }

    /// Comoving volume of one cell (Mpc³)
    pub fn cell_volume(&self) -> f64 {
        self.volume() / self.total_cells() as f64
    }
}

/// Flat ΛCDM cosmology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CosmoParams {
    pub sigma_8: f64,
    pub hlittle: f64,
    pub omm: f64,
    pub omb: f64,
    pub power_index: f64,
}

impl Default for CosmoParams {
    fn default() -> Self {
        Self {
            sigma_8: 0.8102,
            hlittle: 0.6766,
            omm: 0.30964,
            omb: 0.04897,
            power_index: 0.9665,
        }
    }
}

impl CosmoParams {
    /// Dark-energy density for a flat universe
    pub fn oml(&self) -> f64 {
        1.0 - self.omm
    }
}

/// Metallicity dependence of the X-ray luminosity per unit SFR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LxModel {
    /// Double power law in metallicity, constant at low Z
    #[default]
    DoublePowerLaw,
    /// First-order power law in SFR and metallicity
    Kaur,
    /// Schechter function in metallicity
    Schechter,
    /// Integrated luminosity function of Lehmer et al. (fixed normalisation)
    Lehmer,
}

/// Source population parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AstroParams {
    /// Ionizing efficiency for the mass-independent model
    pub hii_eff_factor: f64,
    /// Stellar-to-halo baryon fraction at 1e10 Msun
    pub f_star10: f64,
    pub alpha_star: f64,
    /// Minihalo stellar fraction at 1e7 Msun
    pub f_star7_mini: f64,
    pub alpha_star_mini: f64,
    /// Escape fraction at 1e10 Msun
    pub f_esc10: f64,
    pub alpha_esc: f64,
    /// Minihalo escape fraction at 1e7 Msun
    pub f_esc7_mini: f64,
    /// Turnover mass floor (Msun)
    pub m_turn: f64,
    /// Largest bubble radius (Mpc)
    pub r_bubble_max: f64,
    /// Minimum virial temperature of ionizing sources (K)
    pub ion_tvir_min: f64,
    /// X-ray luminosity per SFR (erg s⁻¹ / (Msun yr⁻¹))
    pub l_x: f64,
    pub l_x_mini: f64,
    /// X-ray energy threshold (eV)
    pub nu_x_thresh: f64,
    pub x_ray_spec_index: f64,
    /// Fraction of LW radiation absorbed by H2 self-shielding
    pub f_h2_shield: f64,
    /// Star formation timescale in units of the Hubble time
    pub t_star: f64,
    pub a_lw: f64,
    pub beta_lw: f64,
    pub a_vcb: f64,
    pub beta_vcb: f64,
    /// Pivot mass of the upper stellar turnover (Msun)
    pub upper_stellar_turnover_mass: f64,
    pub upper_stellar_turnover_index: f64,
    /// Lognormal scatter of the stellar mass
    pub sigma_star: f64,
    /// Lognormal scatter of the X-ray luminosity
    pub sigma_lx: f64,
    /// Floor of the SFR scatter
    pub sigma_sfr_lim: f64,
    /// Slope of the SFR scatter in log10 stellar mass
    pub sigma_sfr_index: f64,
    pub lx_model: LxModel,
}

impl Default for AstroParams {
    fn default() -> Self {
        Self {
            hii_eff_factor: 30.0,
            f_star10: 0.05011872336272722,
            alpha_star: 0.5,
            f_star7_mini: 0.01,
            alpha_star_mini: 0.5,
            f_esc10: 0.1,
            alpha_esc: -0.5,
            f_esc7_mini: 0.01,
            m_turn: 5.011872336272715e8,
            r_bubble_max: 15.0,
            ion_tvir_min: 5e4,
            l_x: 3.1622776601683794e40,
            l_x_mini: 3.1622776601683794e40,
            nu_x_thresh: 500.0,
            x_ray_spec_index: 1.0,
            f_h2_shield: 0.0,
            t_star: 0.5,
            a_lw: 2.0,
            beta_lw: 0.6,
            a_vcb: 1.0,
            beta_vcb: 1.8,
            upper_stellar_turnover_mass: 2.798981e11,
            upper_stellar_turnover_index: -0.6,
            sigma_star: 0.25,
            sigma_lx: 0.5,
            sigma_sfr_lim: 0.19,
            sigma_sfr_index: -0.12,
            lx_model: LxModel::DoublePowerLaw,
        }
    }
}

/// Photon non-conservation correction mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PhotonConsType {
    #[default]
    None,
    /// Shift the sampled redshift along the calibration curve
    RedshiftShift,
    /// Replace ALPHA_ESC with a redshift-dependent fit
    AlphaEscFit,
    /// Replace F_ESC10 with a redshift-dependent fit
    FescFit,
}

/// Feature switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagOptions {
    pub use_halo_field: bool,
    pub use_mini_halos: bool,
    pub use_cmb_heating: bool,
    pub use_lya_heating: bool,
    pub use_mass_dependent_zeta: bool,
    pub inhomo_reco: bool,
    pub use_ts_fluct: bool,
    pub m_min_in_mass: bool,
    pub fix_vcb_avg: bool,
    pub fixed_halo_grids: bool,
    pub cell_recomb: bool,
    pub use_upper_stellar_turnover: bool,
    pub use_exp_filter: bool,
    pub photon_cons_type: PhotonConsType,
}

impl Default for FlagOptions {
    fn default() -> Self {
        Self {
            use_halo_field: false,
            use_mini_halos: false,
            use_cmb_heating: true,
            use_lya_heating: true,
            use_mass_dependent_zeta: true,
            inhomo_reco: false,
            use_ts_fluct: false,
            m_min_in_mass: false,
            fix_vcb_avg: false,
            fixed_halo_grids: false,
            cell_recomb: false,
            use_upper_stellar_turnover: true,
            use_exp_filter: false,
            photon_cons_type: PhotonConsType::None,
        }
    }
}

/// Numerical constants shared by every solver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalParams {
    /// Kernel for the ionization filtering (0 top-hat, 1 sharp-k, 2 Gaussian)
    pub hii_filter: u8,
    /// Kernel for the spin-temperature filtering
    pub heat_filter: u8,
    /// 1 = sphere flagging, 2 = center flagging
    pub find_bubble_algorithm: u8,
    /// Smallest bubble radius (Mpc)
    pub r_bubble_min: f64,
    /// Ratio between successive filter radii
    pub delta_r_hii_factor: f64,
    /// Mean of the Poisson draw for partial ionizations
    pub n_poisson: f64,
    /// Below this global ionized fraction the box is left neutral
    pub hii_round_err: f64,
    /// Redshift where heating starts
    pub z_heat_max: f64,
    /// Ratio (1+z)/(1+z') of successive redshift steps
    pub zprime_step_factor: f64,
    pub m_min_integral: f64,
    pub m_max_integral: f64,
    /// Ionizing photons per stellar baryon, Pop II
    pub pop2_ion: f64,
    /// Ionizing photons per stellar baryon, Pop III
    pub pop3_ion: f64,
    /// Spectral index of the ionizing background
    pub alpha_uvb: f64,
    /// Mean relative baryon velocity (km/s)
    pub vavg: f64,
    pub num_filter_steps_for_ts: usize,
    /// Largest X-ray/Lyman shell radius (Mpc)
    pub r_xly_max: f64,
    pub clumping_factor: f64,
    pub evolve_density_linearly: bool,
    /// Linear collapse threshold
    pub delta_crit: f64,
}

impl Default for GlobalParams {
    fn default() -> Self {
        Self {
            hii_filter: 1,
            heat_filter: 0,
            find_bubble_algorithm: 2,
            r_bubble_min: L_FACTOR,
            delta_r_hii_factor: 1.1,
            n_poisson: 5.0,
            hii_round_err: 1e-5,
            z_heat_max: 35.0,
            zprime_step_factor: 1.02,
            m_min_integral: 1e5,
            m_max_integral: 1e16,
            pop2_ion: 5000.0,
            pop3_ion: 44021.0,
            alpha_uvb: 5.0,
            vavg: 25.86,
            num_filter_steps_for_ts: 40,
            r_xly_max: 500.0,
            clumping_factor: 2.0,
            evolve_density_linearly: false,
            delta_crit: 1.686,
        }
    }
}
