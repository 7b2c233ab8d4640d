//! Lyman-series, Lyman-Werner and X-ray radiation physics
//!
//! # References
//! - Barkana, R., Loeb, A. (2005). "Detecting the earliest galaxies through
//!   two new sources of 21 centimeter fluctuations." ApJ, 626, 1-11.
//! - Pritchard, J.R., Furlanetto, S.R. (2006). "Descending from on high:
//!   Lyman-series cascades and spin-kinetic temperature coupling in the 21-cm
//!   line." MNRAS, 367, 1057-1066.
//! - Shull, J.M., van Steenberg, M.E. (1985). "X-ray secondary heating and
//!   ionization in quasar emission-line clouds." ApJ, 298, 268-274.
//! - Verner, D.A. et al. (1996). "Atomic data for astrophysics. II."
//!   ApJ, 465, 487-498.
//! - Kuhlen, M., Madau, P., Montgomery, R. (2006). "The spin temperature and
//!   21 cm brightness of the intergalactic medium in the pre-reionization
//!   era." ApJ, 637, L1-L4.
//! - Chuzhoy, L., Shapiro, P.R. (2007). "Heating and cooling of the early
//!   intergalactic medium by resonance photons." ApJ, 655, 843-846.

use super::quadrature::simpson;
use super::units::{
    self, C, HEII_NU_IONIZATION, HEI_NU_IONIZATION, HPLANK, LY_ALPHA_HZ, M_P, NSPEC_MAX,
    NU_IONIZATION, NU_LW_THRESH, NU_OVER_EV, NU_X_MAX, SIGMA_HI,
};
use super::{Cosmology, RadiationPhysics};
use crate::config::AstroParams;
use std::f64::consts::{E, PI};
use std::sync::Arc;

/// Fraction of Lyman-n photons converted into Lyman-alpha, `n = 0..=23`
const RECYCLE_FRACTIONS: [f64; NSPEC_MAX as usize + 1] = [
    0.0, 1.0, 1.0, 0.0, 0.2609, 0.3078, 0.3259, 0.3353, 0.3410, 0.3448, 0.3476, 0.3496, 0.3512,
    0.3524, 0.3535, 0.3543, 0.3550, 0.3556, 0.3561, 0.3565, 0.3569, 0.3572, 0.3575, 0.3578,
];

/// Emission band of a stellar population
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// Lyman-alpha to Lyman limit, photon number
    LymanN,
    /// Lyman-Werner band, energy-weighted in units of hν_LL
    LymanWerner,
}

/// Stellar population
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Population {
    PopII,
    PopIII,
}

/// Channel an absorbed X-ray photon deposits its energy in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositionChannel {
    Heat,
    Ionization,
    LymanAlpha,
}

/// Origin of Lyman-alpha photons for the heating rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LyaPhotons {
    /// Redshifted into the line from the continuum
    Continuum,
    /// Injected at line centre by Lyman-n cascades
    Injected,
}

/// Spin-exchange rate coefficients (cm³ s⁻¹)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollisionRates {
    /// H-H
    pub hh: f64,
    /// e-H
    pub eh: f64,
    /// p-H
    pub ph: f64,
}

/// Frequency `ν/ν_LL` of the Lyman-n line
#[inline]
pub fn nu_n(n: u32) -> f64 {
    1.0 - 1.0 / f64::from(n * n)
}

/// Highest redshift from which a photon emitted just above Lyman-n
/// reaches `z` before redshifting into Lyman-(n+1)
#[inline]
pub fn zmax(z: f64, n: u32) -> f64 {
    let next = f64::from((n + 1) * (n + 1));
    (1.0 + z) * (1.0 - 1.0 / next) / nu_n(n) - 1.0
}

/// Default radiation physics
#[derive(Debug, Clone)]
pub struct StandardRadiation {
    cosmology: Arc<dyn Cosmology>,
    n_h0: f64,
    n_he0: f64,
    f_h: f64,
    f_he: f64,
    spec_index: f64,
    nu_x_thresh: f64,
}

impl StandardRadiation {
    pub fn new(cosmology: Arc<dyn Cosmology>, astro: &AstroParams) -> Self {
        let p = cosmology.params().clone();
        let (f_h, f_he) = units::species_fractions(&p);
        Self {
            n_h0: units::n_hydrogen0(&p),
            n_he0: units::n_helium0(&p),
            f_h,
            f_he,
            spec_index: astro.x_ray_spec_index,
            nu_x_thresh: astro.nu_x_thresh * NU_OVER_EV,
            cosmology,
        }
    }

    /// `(number weight, threshold frequency, species)` of the absorbers
    fn species(&self, x_e: f64) -> [(f64, f64, Species); 3] {
        [
            (self.f_h * (1.0 - x_e), NU_IONIZATION, Species::HI),
            (self.f_he * (1.0 - x_e), HEI_NU_IONIZATION, Species::HeI),
            (self.f_he * x_e, HEII_NU_IONIZATION, Species::HeII),
        ]
    }

    /// X-ray optical depth at observed frequency `nu` between `zp` and `zpp`
    fn optical_depth(&self, nu: f64, zp: f64, zpp: f64, x_e: f64, filling_factor: f64) -> f64 {
        simpson(zp, zpp, 16, |z| {
            let zp1 = 1.0 + z;
            let nu_z = nu * zp1 / (1.0 + zp);
            let density = zp1 * zp1 * zp1 * filling_factor;
            let absorbers = self.n_h0 * (1.0 - x_e) * Species::HI.cross_section(nu_z)
                + self.n_he0 * (1.0 - x_e) * Species::HeI.cross_section(nu_z)
                + self.n_he0 * x_e * Species::HeII.cross_section(nu_z);
            density * absorbers * C / (zp1 * self.cosmology.hubble(z))
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Species {
    HI,
    HeI,
    HeII,
}

impl Species {
    /// Photoionization cross-section (cm²)
    fn cross_section(self, nu: f64) -> f64 {
        match self {
            Self::HI => hydrogenic(nu, NU_IONIZATION, 1.0),
            Self::HeII => hydrogenic(nu, HEII_NU_IONIZATION, 2.0),
            Self::HeI => {
                if nu < HEI_NU_IONIZATION {
                    return 0.0;
                }
                let x = nu / NU_OVER_EV / 13.61 - 0.4434;
                let y = (x * x + 2.136 * 2.136).sqrt();
                9.492e-16
                    * ((x - 1.0) * (x - 1.0) + 2.039 * 2.039)
                    * y.powf(0.5 * 3.188 - 5.5)
                    * (1.0 + (y / 1.469).sqrt()).powf(-3.188)
            }
        }
    }
}

/// Exact hydrogenic cross-section for nuclear charge `z`
fn hydrogenic(nu: f64, nu_th: f64, z: f64) -> f64 {
    if nu < nu_th {
        return 0.0;
    }
    let eps = (nu / nu_th - 1.0).sqrt();
    let shape = if eps < 1e-6 {
        1.0
    } else {
        E.powf(4.0 - 4.0 * eps.atan() / eps) / (1.0 - (-2.0 * PI / eps).exp())
    };
    SIGMA_HI / (z * z) * (nu_th / nu).powi(4) * shape
}

/// Shull & van Steenberg (1985) energy deposition fractions
fn deposition_fraction(channel: DepositionChannel, x_e: f64) -> f64 {
    let x = x_e.clamp(1e-4, 1.0);
    match channel {
        DepositionChannel::Heat => 0.9971 * (1.0 - (1.0 - x.powf(0.2663)).powf(1.3163)),
        DepositionChannel::Ionization => 0.3908 * (1.0 - x.powf(0.4092)).powf(1.7592),
        DepositionChannel::LymanAlpha => 0.4766 * (1.0 - x.powf(0.2735)).powf(1.5221),
    }
}

impl RadiationPhysics for StandardRadiation {
    /// Power law `A ν^(α-1)` normalised to the population's photons per baryon
    /// between Lyman-alpha and the Lyman limit
    fn spectral_emissivity(&self, nu_norm: f64, band: Band, population: Population) -> f64 {
        let (photons, alpha) = match population {
            Population::PopII => (9690.0, 0.14),
            Population::PopIII => (4800.0, 1.29),
        };
        let lower = match band {
            Band::LymanN => nu_n(2),
            Band::LymanWerner => NU_LW_THRESH / NU_IONIZATION,
        };
        if nu_norm < lower || nu_norm > 1.0 {
            return 0.0;
        }
        let norm = photons * alpha / (1.0 - nu_n(2).powf(alpha));
        match band {
            Band::LymanN => norm * nu_norm.powf(alpha - 1.0),
            Band::LymanWerner => norm * nu_norm.powf(alpha),
        }
    }

    fn recycle_fraction(&self, n: u32) -> f64 {
        RECYCLE_FRACTIONS.get(n as usize).copied().unwrap_or(0.0)
    }

    /// # Formula
    /// ```text
    /// I = ∫ (ν/ν_X)^(-α-1) Σ_s w_s σ_s(ν) g_s(ν) dν
    /// heat: g = h(ν-ν_s) f_heat
    /// ion:  g = h(ν-ν_s) f_ion / (hν_HI) + 1
    /// lya:  g = h(ν-ν_s) f_lya / (hν_α)
    /// ```
    fn frequency_integral(&self, _zp: f64, x_e: f64, nu_min: f64, channel: DepositionChannel) -> f64 {
        let nu_max = NU_X_MAX * NU_OVER_EV;
        if nu_min >= nu_max {
            return 0.0;
        }
        let fraction = deposition_fraction(channel, x_e);
        let species = self.species(x_e);
        simpson(nu_min.ln(), nu_max.ln(), 200, |ln_nu| {
            let nu = ln_nu.exp();
            let spectrum = (nu / self.nu_x_thresh).powf(-self.spec_index - 1.0);
            let deposited: f64 = species
                .iter()
                .filter(|(_, nu_th, _)| nu >= *nu_th)
                .map(|&(weight, nu_th, s)| {
                    let excess = HPLANK * (nu - nu_th);
                    let per_absorption = match channel {
                        DepositionChannel::Heat => excess * fraction,
                        DepositionChannel::Ionization => {
                            excess * fraction / (HPLANK * NU_IONIZATION) + 1.0
                        }
                        DepositionChannel::LymanAlpha => excess * fraction / (HPLANK * LY_ALPHA_HZ),
                    };
                    weight * s.cross_section(nu) * per_absorption
                })
                .sum();
            spectrum * deposited * nu
        })
    }

    fn nu_tau_one(&self, zp: f64, zpp: f64, x_e: f64, filling_factor: f64) -> f64 {
        let (mut lo, mut hi) = (NU_IONIZATION.ln(), (NU_X_MAX * NU_OVER_EV).ln());
        if zpp <= zp {
            return lo.exp();
        }
        let tau = |ln_nu: f64| self.optical_depth(ln_nu.exp(), zp, zpp, x_e, filling_factor);
        if tau(hi) > 1.0 {
            return hi.exp();
        }
        if tau(lo) < 1.0 {
            return lo.exp();
        }
        for _ in 0..40 {
            let mid = 0.5 * (lo + hi);
            if tau(mid) > 1.0 {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        (0.5 * (lo + hi)).exp()
    }

    /// # Formula
    /// ```text
    /// κ_HH = 3.1e-11 T^0.357 exp(-32/T)
    /// log10 κ_eH = -9.607 + 0.5 log10(T) exp(-(log10 T)^4.5 / 1800)
    /// κ_pH = 3.2 κ_HH
    /// ```
    fn collisional_rates(&self, t_k: f64) -> CollisionRates {
        let t = t_k.max(1.0);
        let hh = 3.1e-11 * t.powf(0.357) * (-32.0 / t).exp();
        let log_t = t.min(1e4).log10();
        let eh = 10f64.powf(-9.607 + 0.5 * log_t * (-log_t.powf(4.5) / 1800.0).exp());
        CollisionRates {
            hh,
            eh,
            ph: 3.2 * hh,
        }
    }

    fn gunn_peterson_depth(&self, z: f64, delta: f64, x_e: f64) -> f64 {
        let zp1 = 1.0 + z;
        1.342881e-7 / self.cosmology.hubble(z) * self.n_h0 * zp1 * zp1 * zp1 * (1.0 + delta) * (1.0 - x_e)
    }

    /// Recoil energy per scattering scaled by the number of scatterings in
    /// the damping wings. Continuum photons heat cold gas; injected photons
    /// cool it once the kinetic temperature exceeds the spin temperature.
    fn lya_heating_energy(&self, t_k: f64, t_s: f64, tau_gp: f64, photons: LyaPhotons) -> f64 {
        let total = t_k + t_s;
        if total <= 0.0 || tau_gp <= 0.0 {
            return 0.0;
        }
        let recoil = (HPLANK * LY_ALPHA_HZ).powi(2) / (M_P * C * C);
        let scatterings = (tau_gp / 1e6).cbrt();
        match photons {
            LyaPhotons::Continuum => recoil * scatterings * t_s / total,
            LyaPhotons::Injected => -recoil * scatterings * t_k / total,
        }
    }
}
