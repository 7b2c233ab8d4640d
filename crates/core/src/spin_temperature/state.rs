//! Thermal state of the neutral IGM carried between steps

use crate::grid::{Field3D, GridLayout};

/// Spin-temperature fields of one redshift
#[derive(Debug, Clone, PartialEq)]
pub struct SpinTemperatureState {
    pub redshift: f64,
    /// 21-cm spin temperature (K)
    pub spin_temperature: Field3D,
    /// Kinetic temperature of the neutral IGM (K)
    pub temp_kinetic: Field3D,
    /// Free-electron fraction of the neutral IGM
    pub x_e: Field3D,
    /// Lyman-Werner intensity (1e-21 erg s⁻¹ Hz⁻¹ cm⁻² sr⁻¹), zero without minihalos
    pub j21_lw: Field3D,
}

impl SpinTemperatureState {
    /// Uniform state at `redshift`
    pub fn uniform(layout: GridLayout, redshift: f64, t_s: f32, t_k: f32, x_e: f32) -> Self {
        Self {
            redshift,
            spin_temperature: Field3D::with_value(layout, t_s),
            temp_kinetic: Field3D::with_value(layout, t_k),
            x_e: Field3D::with_value(layout, x_e),
            j21_lw: Field3D::new(layout),
        }
    }

    pub fn layout(&self) -> GridLayout {
        self.x_e.layout
    }

    pub fn mean_x_e(&self) -> f64 {
        self.x_e.mean()
    }

    pub fn mean_temp_kinetic(&self) -> f64 {
        self.temp_kinetic.mean()
    }

    pub fn mean_spin_temperature(&self) -> f64 {
        self.spin_temperature.mean()
    }
}
