//! Ionization fields carried from one redshift to the next

use crate::grid::{Field3D, GridLayout};
use serde::{Deserialize, Serialize};

/// Ionization fields of one redshift
///
/// The state of the previous step is read-only input to the next one. The
/// collapsed-fraction grids are only kept when minihalos are evolved with
/// the trapezoidal correction; they hold one grid per filter radius.
#[derive(Debug, Clone, PartialEq)]
pub struct IonizationState {
    pub redshift: f64,
    /// Neutral hydrogen fraction
    pub xh: Field3D,
    /// Redshift of first full ionization, negative where never ionized
    pub z_reion: Field3D,
    /// Cumulative recombinations per baryon
    pub dnrec: Field3D,
    /// Filter radius at first ionization (Mpc)
    pub mfp: Field3D,
    /// Photoionization rate at first ionization (1e-12 s⁻¹)
    pub gamma12: Field3D,
    /// Kinetic temperature of all gas (K)
    pub temp_kinetic: Field3D,
    /// Atomic-cooling collapsed fraction per filter radius
    pub fcoll: Vec<Field3D>,
    /// Minihalo collapsed fraction per filter radius
    pub fcoll_mini: Vec<Field3D>,
    /// Global mean collapsed fractions of the step
    pub means: MeanCollapsedFractions,
    /// Box means of the log10 turnover masses
    pub log10_mturn: f64,
    pub log10_mturn_mini: f64,
}

/// Global collapsed fractions tracked across steps
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MeanCollapsedFractions {
    pub acg: f64,
    pub mcg: f64,
}

impl MeanCollapsedFractions {
    /// Ionizing budget of these fractions
    pub fn budget(&self, ion_eff: f64, ion_eff_mini: f64) -> f64 {
        self.acg * ion_eff + self.mcg * ion_eff_mini
    }
}

impl IonizationState {
    /// State before the first step: neutral, never ionized, no recombinations
    pub fn initial(layout: GridLayout) -> Self {
        let zero = Field3D::new(layout);
        Self {
            redshift: -1.0,
            xh: Field3D::with_value(layout, 1.0),
            z_reion: Field3D::with_value(layout, -1.0),
            dnrec: zero.clone(),
            mfp: zero.clone(),
            gamma12: zero.clone(),
            temp_kinetic: zero,
            fcoll: Vec::new(),
            fcoll_mini: Vec::new(),
            means: MeanCollapsedFractions::default(),
            log10_mturn: 0.0,
            log10_mturn_mini: 0.0,
        }
    }

    pub fn layout(&self) -> GridLayout {
        self.xh.layout
    }

    /// Box-averaged neutral fraction
    pub fn global_xh(&self) -> f64 {
        self.xh.mean()
    }

    /// Atomic-cooling collapsed fraction of radius `index` in cell `cell`
    ///
    /// Radii without a stored grid read as zero.
    pub(super) fn fcoll_at(&self, index: usize, cell: usize) -> f64 {
        self.fcoll
            .get(index)
            .map_or(0.0, |f| f64::from(f.data[cell]))
    }

    /// Minihalo counterpart of [`IonizationState::fcoll_at`]
    pub(super) fn fcoll_mini_at(&self, index: usize, cell: usize) -> f64 {
        self.fcoll_mini
            .get(index)
            .map_or(0.0, |f| f64::from(f.data[cell]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_neutral() {
        let state = IonizationState::initial(GridLayout::cubic(4, 8.0));
        assert_eq!(state.global_xh(), 1.0);
        assert!(state.z_reion.as_slice().iter().all(|&z| z < 0.0));
        assert_eq!(state.fcoll_at(3, 10), 0.0);
        assert_eq!(state.means.budget(10.0, 5.0), 0.0);
    }

    #[test]
    fn test_budget_weights_populations() {
        let means = MeanCollapsedFractions { acg: 0.01, mcg: 0.002 };
        assert!((means.budget(20.0, 50.0) - 0.3).abs() < 1e-12);
    }
}
