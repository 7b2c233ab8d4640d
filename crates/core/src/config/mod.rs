//! Simulation configuration
//!
//! [`SimulationConfig`] bundles the five parameter groups. It is built once,
//! validated, and then only ever borrowed: solvers receive it through
//! [`crate::SimulationContext`] and never mutate it.

mod params;

pub use params::{
    AstroParams, CosmoParams, FlagOptions, GlobalParams, LxModel, PhotonConsType, UserParams,
    L_FACTOR,
};

use crate::error::{ErrorContext, ReionError, Result};
use serde::{Deserialize, Serialize};

/// Complete immutable parameter set for a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub user: UserParams,
    pub cosmo: CosmoParams,
    pub astro: AstroParams,
    pub flags: FlagOptions,
    pub global: GlobalParams,
}

impl SimulationConfig {
    /// Check parameter combinations the solvers cannot handle
    ///
    /// # Errors
    ///
    /// Returns [`ReionError::Config`] naming the first invalid parameter.
    pub fn validate(&self) -> Result<()> {
        let ctx = ErrorContext::default();
        let fail = |reason: String| Err(ReionError::config(ctx, reason));

        if self.user.hii_dim == 0 || self.user.d_para() == 0 {
            return fail(format!(
                "grid must have at least one cell, got HII_DIM={} D_PARA={}",
                self.user.hii_dim,
                self.user.d_para()
            ));
        }
        if self.user.box_len <= 0.0 || self.user.non_cubic_factor <= 0.0 {
            return fail(format!("box length must be positive, got {}", self.user.box_len));
        }
        if self.global.find_bubble_algorithm != 1 && self.global.find_bubble_algorithm != 2 {
            return fail(format!(
                "incorrect choice of find bubble algorithm: {}",
                self.global.find_bubble_algorithm
            ));
        }
        if self.global.hii_filter > 2 {
            return fail(format!("HII_FILTER must be 0, 1 or 2, got {}", self.global.hii_filter));
        }
        if self.global.heat_filter > 2 {
            return fail(format!("HEAT_FILTER must be 0, 1 or 2, got {}", self.global.heat_filter));
        }
        if self.global.delta_r_hii_factor <= 1.0 {
            return fail(format!(
                "DELTA_R_HII_FACTOR must exceed 1, got {}",
                self.global.delta_r_hii_factor
            ));
        }
        if self.astro.r_bubble_max < self.global.r_bubble_min {
            return fail(format!(
                "R_BUBBLE_MAX ({}) is below R_BUBBLE_MIN ({})",
                self.astro.r_bubble_max, self.global.r_bubble_min
            ));
        }
        if self.flags.use_mini_halos && !self.flags.use_mass_dependent_zeta {
            return fail("USE_MINI_HALOS requires USE_MASS_DEPENDENT_ZETA".to_string());
        }
        if self.flags.use_halo_field && !self.flags.use_mass_dependent_zeta {
            return fail("USE_HALO_FIELD requires USE_MASS_DEPENDENT_ZETA".to_string());
        }
        if self.flags.use_mini_halos && !self.flags.use_ts_fluct {
            return fail("USE_MINI_HALOS requires USE_TS_FLUCT for the Lyman-Werner field".to_string());
        }
        if self.user.n_threads == 0 {
            return fail("N_THREADS must be at least 1".to_string());
        }
        Ok(())
    }

    /// Configuration for tests and small runs: a `dim`³ box of side `box_len`
    pub fn small_box(dim: usize, box_len: f64) -> Self {
        let mut config = Self::default();
        config.user.hii_dim = dim;
        config.user.dim = 3 * dim;
        config.user.box_len = box_len;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_default_is_valid() {
        assert!(SimulationConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bad_bubble_algorithm() {
        let mut config = SimulationConfig::default();
        config.global.find_bubble_algorithm = 3;
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("find bubble algorithm"));
    }

    #[test]
    fn test_minihalos_need_mass_dependent_zeta() {
        let mut config = SimulationConfig::default();
        config.flags.use_mini_halos = true;
        config.flags.use_ts_fluct = true;
        config.flags.use_mass_dependent_zeta = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_dimensions() {
        let mut config = SimulationConfig::small_box(16, 32.0);
        config.user.non_cubic_factor = 2.0;
        assert_eq!(config.user.d_para(), 32);
        assert_eq!(config.user.total_cells(), 16 * 16 * 32);
        assert_eq!(config.user.pixel_length(), 2.0);
        assert_eq!(config.user.cell_volume(), 8.0);
    }

    #[test]
    fn test_partial_deserialisation_uses_defaults() {
        let config: SimulationConfig =
            serde_json::from_str(r#"{"user": {"hii_dim": 8, "box_len": 20.0}}"#).unwrap();
        assert_eq!(config.user.hii_dim, 8);
        assert_eq!(config.cosmo, CosmoParams::default());
        assert_eq!(config.global.find_bubble_algorithm, 2);
    }
}
