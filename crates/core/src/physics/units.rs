//! Physical constants (cgs unless stated otherwise)

use crate::config::CosmoParams;

// ============================================================================
// FUNDAMENTAL CONSTANTS
// ============================================================================

/// Speed of light (cm/s)
pub const C: f64 = 29979245800.0;
/// Planck constant (erg s)
pub const HPLANK: f64 = 6.62606896e-27;
/// Boltzmann constant (erg/K)
pub const K_B: f64 = 1.380658e-16;
/// Proton mass (g)
pub const M_P: f64 = 1.6726231e-24;
/// Electron mass (g)
pub const M_E: f64 = 9.10938188e-28;
/// Electron charge (esu)
pub const E_CHARGE: f64 = 4.8033e-10;
/// Gravitational constant (cm³ g⁻¹ s⁻²)
pub const G: f64 = 6.67259e-8;
/// Vacuum permittivity (SI)
pub const VAC_PERM: f64 = 8.85419e-12;

// ============================================================================
// ASTRONOMICAL UNITS
// ============================================================================

/// Centimetres per megaparsec
pub const CM_PER_MPC: f64 = 3.086e24;
/// Solar mass (g)
pub const MSUN: f64 = 1.989e33;
/// Seconds per year
pub const SEC_PER_YR: f64 = 3.15576e7;
/// Hubble constant per unit h (s⁻¹)
pub const HO_PER_H: f64 = 3.2407e-18;
/// CMB temperature today (K)
pub const T_CMB: f64 = 2.728;
/// Primordial helium mass fraction
pub const Y_HE: f64 = 0.245;

// ============================================================================
// ATOMIC PHYSICS
// ============================================================================

/// Hydrogen ionization frequency (Hz)
pub const NU_IONIZATION: f64 = 3.28989e15;
/// Neutral helium ionization frequency (Hz)
pub const HEI_NU_IONIZATION: f64 = 5.945e15;
/// Singly ionized helium ionization frequency (Hz)
pub const HEII_NU_IONIZATION: f64 = 1.3158e16;
/// Lyman-alpha frequency (Hz)
pub const LY_ALPHA_HZ: f64 = 2.46606727e15;
/// Lyman-alpha wavelength (Å)
pub const LY_ALPHA_ANG: f64 = 1215.67;
/// Hz per eV
pub const NU_OVER_EV: f64 = 1.60217646e-12 / HPLANK;
/// Lower edge of the Lyman-Werner band (Hz)
pub const NU_LW_THRESH: f64 = 11.18 * NU_OVER_EV;
/// HI photoionization cross-section at threshold (cm²)
pub const SIGMA_HI: f64 = 6.3e-18;
/// Lyman-alpha oscillator strength
pub const F_ALPHA: f64 = 0.4162;
/// Einstein coefficient of the 21cm line (s⁻¹)
pub const A10_HYPERFINE: f64 = 2.85e-15;
/// 21cm transition temperature (K)
pub const T21: f64 = 0.0628;
/// 21cm wavelength (cm)
pub const LAMBDA_21: f64 = 21.106114;
/// Highest Lyman level followed for the Lyman-n cascade
pub const NSPEC_MAX: u32 = 23;
/// Upper edge of the X-ray band used to normalise L_X (eV)
pub const NU_X_BAND_MAX: f64 = 2000.0;
/// Upper limit of the X-ray frequency integrals (eV)
pub const NU_X_MAX: f64 = 10000.0;

// ============================================================================
// MODEL CONSTANTS
// ============================================================================

/// Relative error tolerated for single-precision quantities
pub const FRACT_FLOAT_ERR: f64 = 1e-7;
/// Kinetic temperature above which heating is switched off (K)
pub const MAX_TK: f64 = 5e4;
/// Temperature of freshly reionized gas (K)
pub const T_RE: f64 = 2e4;
/// RMS relative baryon velocity at recombination (km/s)
pub const SIGMA_VCB: f64 = 29.0;
/// Smallest 1+δ admitted by the temperature models
pub const MIN_DENSITY_LOW_LIMIT: f64 = 9e-8;

/// Hubble constant (s⁻¹)
pub fn hubble_constant(cosmo: &CosmoParams) -> f64 {
    cosmo.hlittle * HO_PER_H
}

/// Critical density today (g cm⁻³)
pub fn rho_crit_cgs(cosmo: &CosmoParams) -> f64 {
    let h0 = hubble_constant(cosmo);
    3.0 * h0 * h0 / (8.0 * std::f64::consts::PI * G)
}

/// Critical density today (Msun Mpc⁻³)
pub fn rho_crit(cosmo: &CosmoParams) -> f64 {
    rho_crit_cgs(cosmo) * CM_PER_MPC * CM_PER_MPC * CM_PER_MPC / MSUN
}

/// Hydrogen number density today (cm⁻³)
pub fn n_hydrogen0(cosmo: &CosmoParams) -> f64 {
    rho_crit_cgs(cosmo) * cosmo.omb * (1.0 - Y_HE) / M_P
}

/// Helium number density today (cm⁻³)
pub fn n_helium0(cosmo: &CosmoParams) -> f64 {
    rho_crit_cgs(cosmo) * cosmo.omb * Y_HE / (4.0 * M_P)
}

/// Baryon (H + He nuclei) number density today (cm⁻³)
pub fn n_baryon0(cosmo: &CosmoParams) -> f64 {
    n_hydrogen0(cosmo) + n_helium0(cosmo)
}

/// Hydrogen and helium number fractions of the nuclei
pub fn species_fractions(cosmo: &CosmoParams) -> (f64, f64) {
    let (h, he) = (n_hydrogen0(cosmo), n_helium0(cosmo));
    (h / (h + he), he / (h + he))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_critical_density_scaling() {
        let cosmo = CosmoParams {
            hlittle: 1.0,
            ..CosmoParams::default()
        };
        assert_relative_eq!(rho_crit(&cosmo), 2.775e11, max_relative = 5e-3);
    }

    #[test]
    fn test_species_fractions_sum() {
        let (f_h, f_he) = species_fractions(&CosmoParams::default());
        assert_relative_eq!(f_h + f_he, 1.0, epsilon = 1e-12);
        assert!(f_he > 0.07 && f_he < 0.09);
    }
}
