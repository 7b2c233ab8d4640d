//! X-ray frequency integrals per shell, tabulated in the free-electron fraction
//!
//! The energy an X-ray photon deposits depends on the ionization of the gas
//! it is absorbed in, while the softest photons surviving from a shell
//! depend on the mean opacity along the way. Both are fixed for a step, so
//! the integrals are evaluated once per shell on a coarse `x_e` grid and
//! interpolated per cell.

use super::shells::RedshiftShells;
use crate::error::{ErrorContext, ReionError, Result};
use crate::physics::units::NU_OVER_EV;
use crate::physics::{DepositionChannel, RadiationPhysics};
use rayon::prelude::*;
use tracing::debug;

/// Free-electron fractions the integrals are sampled at
pub const X_E_SAMPLES: [f64; 15] = [
    1.0e-4, 2.0e-4, 5.0e-4, 1.0e-3, 2.0e-3, 3.5e-3, 5.0e-3, 1.0e-2, 2.0e-2, 5.0e-2, 0.1, 0.2, 0.5,
    0.9, 0.999,
];

const N_SAMPLES: usize = X_E_SAMPLES.len();

/// Position of a free-electron fraction on [`X_E_SAMPLES`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleIndex {
    /// Lower sample
    pub index: usize,
    /// Linear weight of the upper sample
    pub weight: f64,
}

impl SampleIndex {
    /// Locate `x_e`, clamped just inside the sampled range
    pub fn locate(x_e: f64) -> Self {
        let x = x_e.clamp(X_E_SAMPLES[0] * 1.001, X_E_SAMPLES[N_SAMPLES - 1] * 0.999);
        let index = X_E_SAMPLES
            .partition_point(|&s| s <= x)
            .saturating_sub(1)
            .min(N_SAMPLES - 2);
        let (lo, hi) = (X_E_SAMPLES[index], X_E_SAMPLES[index + 1]);
        Self {
            index,
            weight: (x - lo) / (hi - lo),
        }
    }
}

/// Heating, ionization and Lyman-alpha integrals at one `x_e`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct XrayIntegrals {
    /// Energy deposited as heat (erg cm² Hz)
    pub heat: f64,
    /// Ionizations per absorbed photon (cm² Hz)
    pub ionization: f64,
    /// Lyman-alpha photons per absorbed photon (cm² Hz)
    pub lya: f64,
}

/// [`XrayIntegrals`] of every shell on the `x_e` samples
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyTables {
    values: Vec<[XrayIntegrals; N_SAMPLES]>,
    /// Lowest frequency reaching `zp` from each shell (Hz)
    lower_limits: Vec<f64>,
}

impl FrequencyTables {
    /// Integrate every shell seen from `shells.zp()`
    ///
    /// # Arguments
    ///
    /// * `x_e_mean` - Box-mean free-electron fraction of the previous step
    /// * `filling_factor` - Neutral volume fraction between the shells and `zp`
    /// * `nu_x_thresh` - Softest X-ray energy escaping the sources (eV)
    ///
    /// # Errors
    ///
    /// [`ReionError::Numerical`] when an integral is not finite.
    pub fn build(
        radiation: &dyn RadiationPhysics,
        shells: &RedshiftShells,
        x_e_mean: f64,
        filling_factor: f64,
        nu_x_thresh: f64,
    ) -> Result<Self> {
        let zp = shells.zp();
        let nu_floor = nu_x_thresh * NU_OVER_EV;
        let lower_limits: Vec<f64> = shells
            .as_slice()
            .iter()
            .map(|s| radiation.nu_tau_one(zp, s.zpp, x_e_mean, filling_factor).max(nu_floor))
            .collect();

        let values = lower_limits
            .par_iter()
            .enumerate()
            .map(|(shell, &nu_min)| {
                let mut row = [XrayIntegrals::default(); N_SAMPLES];
                for (entry, &x_e) in row.iter_mut().zip(&X_E_SAMPLES) {
                    let integral =
                        |channel| radiation.frequency_integral(zp, x_e, nu_min, channel);
                    *entry = XrayIntegrals {
                        heat: integral(DepositionChannel::Heat),
                        ionization: integral(DepositionChannel::Ionization),
                        lya: integral(DepositionChannel::LymanAlpha),
                    };
                    if ![entry.heat, entry.ionization, entry.lya]
                        .iter()
                        .all(|v| v.is_finite())
                    {
                        return Err(ReionError::numerical(
                            ErrorContext::at(zp).radius(shell),
                            "X-ray frequency integral",
                            format!("x_e={x_e}, nu_min={nu_min:e}: {entry:?}"),
                        ));
                    }
                }
                Ok(row)
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            zp,
            n_shells = values.len(),
            x_e_mean,
            filling_factor,
            "Frequency integral tables built"
        );
        Ok(Self {
            values,
            lower_limits,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Lowest frequency reaching the evolved redshift from `shell` (Hz)
    pub fn lower_limit(&self, shell: usize) -> f64 {
        self.lower_limits[shell]
    }

    /// Integrals of `shell` interpolated at `at`
    #[inline]
    pub fn at(&self, shell: usize, at: SampleIndex) -> XrayIntegrals {
        let row = &self.values[shell];
        let (lo, hi) = (row[at.index], row[at.index + 1]);
        let lerp = |a: f64, b: f64| a + (b - a) * at.weight;
        XrayIntegrals {
            heat: lerp(lo.heat, hi.heat),
            ionization: lerp(lo.ionization, hi.ionization),
            lya: lerp(lo.lya, hi.lya),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::context::SimulationContext;
    use approx::assert_relative_eq;

    #[test]
    fn test_locate_interior_and_clamped() {
        let at = SampleIndex::locate(1.5e-3);
        assert_eq!(at.index, 3);
        assert_relative_eq!(at.weight, 0.5, epsilon = 1e-12);

        let low = SampleIndex::locate(0.0);
        assert_eq!(low.index, 0);
        assert!(low.weight > 0.0 && low.weight < 0.01);

        let high = SampleIndex::locate(1.0);
        assert_eq!(high.index, N_SAMPLES - 2);
        assert!(high.weight < 1.0);
    }

    #[test]
    fn test_far_shells_lose_soft_photons() {
        let mut config = SimulationConfig::small_box(8, 64.0);
        config.global.num_filter_steps_for_ts = 8;
        let ctx = SimulationContext::new(config).unwrap();
        let shells = RedshiftShells::new(&ctx, 15.0);
        let tables = FrequencyTables::build(
            ctx.physics().radiation.as_ref(),
            &shells,
            2e-4,
            1.0,
            ctx.config().astro.nu_x_thresh,
        )
        .unwrap();
        assert_eq!(tables.len(), shells.len());

        let near = tables.lower_limit(0);
        let far = tables.lower_limit(tables.len() - 1);
        assert!(far >= near);
        assert!(near >= ctx.config().astro.nu_x_thresh * NU_OVER_EV);

        let at = SampleIndex::locate(2e-4);
        let first = tables.at(0, at);
        let last = tables.at(tables.len() - 1, at);
        assert!(first.heat > 0.0 && first.ionization > 0.0 && first.lya > 0.0);
        assert!(last.heat <= first.heat);
    }

    #[test]
    fn test_ionized_gas_deposits_less_ionization() {
        let mut config = SimulationConfig::small_box(8, 64.0);
        config.global.num_filter_steps_for_ts = 4;
        let ctx = SimulationContext::new(config).unwrap();
        let shells = RedshiftShells::new(&ctx, 12.0);
        let tables = FrequencyTables::build(
            ctx.physics().radiation.as_ref(),
            &shells,
            1e-3,
            1.0,
            500.0,
        )
        .unwrap();
        let neutral = tables.at(0, SampleIndex::locate(1e-4));
        let ionized = tables.at(0, SampleIndex::locate(0.9));
        assert!(ionized.ionization < neutral.ionization);
        assert!(ionized.lya < neutral.lya);
    }
}
