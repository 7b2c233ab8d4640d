//! Redshift shells around the evolved redshift
//!
//! Radiation reaching a cell at `z'` was emitted at `z'' > z'` by sources in
//! a spherical shell. The shells grow geometrically from the cell scale to
//! `R_XLy_MAX`; each carries its emission redshift, its width and the
//! Lyman-series weights of the sources in it.

use crate::config::L_FACTOR;
use crate::context::SimulationContext;
use crate::physics::radiation::{nu_n, zmax, Band, Population};
use crate::physics::units::{CM_PER_MPC, NSPEC_MAX, NU_IONIZATION, NU_LW_THRESH};
use crate::physics::RadiationPhysics;
use tracing::{debug, trace};

/// Sub-steps used to weight the last shell that still sees Lyman-n lines
const EDGE_SAMPLES: usize = 1000;

/// One emission shell
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RedshiftShell {
    /// Position from the innermost shell outwards
    pub index: usize,
    /// Outer comoving radius (Mpc)
    pub radius: f64,
    /// Inner comoving radius, zero for the innermost shell
    pub inner_radius: f64,
    /// Redshift of the outer edge
    pub zpp_edge: f64,
    /// Mean emission redshift
    pub zpp: f64,
    /// Redshift width
    pub dzpp: f64,
    /// `dt/dz` at `zpp` (s)
    pub dtdz: f64,
    pub growth: f64,
    /// Smallest source mass at `zpp` (Msun)
    pub m_min: f64,
    /// Mass of the shell radius at mean density (Msun)
    pub m_max: f64,
    pub sigma_min: f64,
    pub sigma_max: f64,
}

/// Shells of one step, innermost first
#[derive(Debug, Clone, PartialEq)]
pub struct RedshiftShells {
    zp: f64,
    shells: Vec<RedshiftShell>,
}

impl RedshiftShells {
    /// Shells seen from redshift `zp`
    pub fn new(ctx: &SimulationContext, zp: f64) -> Self {
        let config = ctx.config();
        let physics = ctx.physics();
        let cosmology = physics.cosmology.as_ref();
        let n = config.global.num_filter_steps_for_ts.max(1);
        let r_min = L_FACTOR * config.user.pixel_length();
        let factor = (config.global.r_xly_max / r_min).powf(1.0 / n as f64);

        let mut shells: Vec<RedshiftShell> = Vec::with_capacity(n);
        let mut radius = r_min;
        for index in 0..n {
            let (prev_edge, inner_radius) = shells
                .last()
                .map_or((zp, 0.0), |s| (s.zpp_edge, s.radius));
            let zpp_edge = prev_edge + (radius - inner_radius) * CM_PER_MPC / cosmology.dr_dz(prev_edge);
            let zpp = 0.5 * (zpp_edge + prev_edge);
            let m_min = physics.feedback.minimum_source_mass(zpp);
            let m_max = cosmology.mass_from_radius(radius);
            shells.push(RedshiftShell {
                index,
                radius,
                inner_radius,
                zpp_edge,
                zpp,
                dzpp: zpp_edge - prev_edge,
                dtdz: cosmology.dt_dz(zpp),
                growth: cosmology.growth(zpp),
                m_min,
                m_max,
                sigma_min: cosmology.sigma(m_min.ln()),
                sigma_max: cosmology.sigma(m_max.ln()),
            });
            trace!(index, radius, zpp, "Shell");
            radius *= factor;
        }
        debug!(
            n_shells = n,
            r_min,
            z_outer = shells.last().map_or(zp, |s| s.zpp_edge),
            "Redshift shells set"
        );
        Self { zp, shells }
    }

    /// Redshift the shells are seen from
    pub fn zp(&self) -> f64 {
        self.zp
    }

    pub fn len(&self) -> usize {
        self.shells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shells.is_empty()
    }

    pub fn as_slice(&self) -> &[RedshiftShell] {
        &self.shells
    }

    /// Outermost shell
    pub fn outer(&self) -> Option<&RedshiftShell> {
        self.shells.last()
    }
}

/// Lyman-series weights of one shell for one population
///
/// Each entry is photons per stellar baryon scaled by `(1+z')²(1+z'')`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LymanWeights {
    /// All Lyman-n photons cascading to Lyman-alpha
    pub lya: f64,
    /// Photons redshifting directly into Lyman-alpha
    pub continuum: f64,
    /// Photons injected by higher-n cascades
    pub injected: f64,
    /// Lyman-Werner band energy
    pub lyman_werner: f64,
}

impl LymanWeights {
    fn scaled(self, factor: f64) -> Self {
        Self {
            lya: self.lya * factor,
            continuum: self.continuum * factor,
            injected: self.injected * factor,
            lyman_werner: self.lyman_werner * factor,
        }
    }
}

/// Lyman-series weights of every shell for both populations
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralFactors {
    pub pop2: Vec<LymanWeights>,
    pub pop3: Vec<LymanWeights>,
}

impl SpectralFactors {
    /// Weights of `shells` seen from `shells.zp()`
    ///
    /// `f_h2_shield` removes the self-shielded share of the Lyman-Werner
    /// band. The last shell that still receives Lyman-n photons is weighted
    /// by the fraction of its width inside the horizon of the lowest line.
    pub fn new(radiation: &dyn RadiationPhysics, shells: &RedshiftShells, f_h2_shield: f64) -> Self {
        let zp = shells.zp();
        let lw_floor = NU_LW_THRESH / NU_IONIZATION;
        let shell_weights = |zpp: f64, population: Population| {
            let mut w = LymanWeights::default();
            for n in 2..=NSPEC_MAX {
                if zpp > zmax(zp, n) {
                    continue;
                }
                let nu = nu_n(n) * (1.0 + zpp) / (1.0 + zp);
                let photons = radiation.recycle_fraction(n)
                    * radiation.spectral_emissivity(nu, Band::LymanN, population);
                if n == 2 {
                    w.continuum += photons;
                } else {
                    w.injected += photons;
                }
                let nu_lw = nu.max(lw_floor);
                if nu_lw < nu_n(n + 1) {
                    w.lyman_werner += (1.0 - f_h2_shield)
                        * radiation.spectral_emissivity(nu_lw, Band::LymanWerner, population);
                }
            }
            w.lya = w.continuum + w.injected;
            w
        };

        let mut pop2: Vec<LymanWeights> = Vec::with_capacity(shells.len());
        let mut pop3: Vec<LymanWeights> = Vec::with_capacity(shells.len());
        let mut edge_done = false;
        let mut prev_zpp = zp;
        for shell in shells.as_slice() {
            let mut w2 = shell_weights(shell.zpp, Population::PopII);
            let mut w3 = shell_weights(shell.zpp, Population::PopIII);

            if let (Some(last2), Some(last3)) = (pop2.last(), pop3.last()) {
                if !edge_done && shell.index > 1 && w2.lya == 0.0 && last2.lya > 0.0 {
                    let weight = horizon_fraction(zp, prev_zpp, shell.zpp);
                    w2 = last2.scaled(weight);
                    w3 = last3.scaled(weight);
                    edge_done = true;
                }
            }
            pop2.push(w2);
            pop3.push(w3);
            prev_zpp = shell.zpp;
        }

        let integrand = |shell: &RedshiftShell| (1.0 + zp).powi(2) * (1.0 + shell.zpp);
        for (shell, (w2, w3)) in shells.as_slice().iter().zip(pop2.iter_mut().zip(pop3.iter_mut())) {
            *w2 = w2.scaled(integrand(shell));
            *w3 = w3.scaled(integrand(shell));
        }
        Self { pop2, pop3 }
    }
}

/// Fraction of `[prev_zpp, zpp]` before the first redshift no line reaches
fn horizon_fraction(zp: f64, prev_zpp: f64, zpp: f64) -> f64 {
    let last = EDGE_SAMPLES as f64 - 1.0;
    (0..EDGE_SAMPLES)
        .find(|&i| {
            let trial = prev_zpp + (zpp - prev_zpp) * i as f64 / last;
            (2..=NSPEC_MAX).all(|n| trial > zmax(zp, n))
        })
        .map_or(0.0, |i| i as f64 / EDGE_SAMPLES as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;

    fn context() -> SimulationContext {
        let mut config = SimulationConfig::small_box(8, 64.0);
        config.global.num_filter_steps_for_ts = 20;
        SimulationContext::new(config).unwrap()
    }

    #[test]
    fn test_shells_move_outwards_in_redshift() {
        let ctx = context();
        let shells = RedshiftShells::new(&ctx, 12.0);
        assert_eq!(shells.len(), 20);
        let first = shells.as_slice()[0];
        assert!((first.radius - L_FACTOR * 8.0).abs() < 1e-9);
        assert_eq!(first.inner_radius, 0.0);
        for pair in shells.as_slice().windows(2) {
            assert!(pair[1].radius > pair[0].radius);
            assert!(pair[1].zpp_edge > pair[0].zpp_edge);
            assert!(pair[1].zpp > 12.0);
            assert_eq!(pair[1].inner_radius, pair[0].radius);
            assert!(pair[1].dzpp > 0.0);
        }
        let outer = shells.outer().unwrap();
        assert!(outer.radius < ctx.config().global.r_xly_max);
    }

    #[test]
    fn test_far_shells_see_no_lyman_lines() {
        let ctx = context();
        let shells = RedshiftShells::new(&ctx, 10.0);
        let factors = SpectralFactors::new(ctx.physics().radiation.as_ref(), &shells, 0.0);
        assert!(factors.pop2[0].lya > 0.0);
        assert!(factors.pop2[0].continuum > 0.0);
        let horizon = zmax(10.0, 2);
        for (shell, w) in shells.as_slice().iter().zip(&factors.pop2) {
            if shell.index > 0 && shell.zpp > horizon && shells.as_slice()[shell.index - 1].zpp > horizon {
                assert_eq!(w.lya, 0.0);
            }
        }
    }

    #[test]
    fn test_full_shielding_removes_lyman_werner() {
        let ctx = context();
        let shells = RedshiftShells::new(&ctx, 15.0);
        let rad = ctx.physics().radiation.as_ref();
        let open = SpectralFactors::new(rad, &shells, 0.0);
        let shielded = SpectralFactors::new(rad, &shells, 1.0);
        assert!(open.pop3.iter().any(|w| w.lyman_werner > 0.0));
        assert!(shielded.pop3.iter().all(|w| w.lyman_werner == 0.0));
        assert_eq!(open.pop3[0].lya, shielded.pop3[0].lya);
    }

    #[test]
    fn test_horizon_fraction_bounds() {
        let zp = 10.0;
        let horizon = zmax(zp, 2);
        let f = horizon_fraction(zp, horizon - 0.5, horizon + 0.5);
        assert!((f - 0.5).abs() < 0.01);
        assert_eq!(horizon_fraction(zp, horizon + 0.1, horizon + 1.0), 0.0);
    }
}
