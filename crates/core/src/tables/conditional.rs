//! Conditional mass function integrals over a density/turnover domain
//!
//! One [`ConditionalTables`] answers "what fraction of a region's mass is in
//! weighted sources" for every cell of one filtering radius. With
//! interpolation enabled it samples the integral on a grid spanning
//! [`TableBounds`]; otherwise every query integrates directly.

use super::{RGTable1D, RGTable2D};
use crate::error::Result;
use crate::physics::{Condition, MassFunction, SourceModel};

/// Samples along the density axis
const N_DELTA: usize = 100;
/// Samples along the log10 turnover axis
const N_MTURN: usize = 20;
/// Smallest extent of a table axis
const MIN_AXIS_WIDTH: f64 = 1e-3;

/// Integral a table evaluates
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IntegralKind {
    /// erfc collapsed fraction above the mass with variance `sigma_min`
    Erfc { sigma_min: f64 },
    /// EPS integral weighted by a source model; a turnover axis replaces
    /// its lower turnover
    Weighted(SourceModel),
    /// Expected number of halos per unit region mass
    HaloNumber,
}

/// Domain a table must cover
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableBounds {
    /// Linear density range
    pub delta: (f64, f64),
    /// log10 turnover mass range, or `None` for a fixed turnover
    pub log10_mturn: Option<(f64, f64)>,
}

#[derive(Debug)]
enum Backend {
    Direct,
    Line(RGTable1D),
    Plane(RGTable2D),
}

/// Conditional integral for one region size and redshift
#[derive(Debug)]
pub struct ConditionalTables<'a> {
    mass_function: &'a dyn MassFunction,
    condition: Condition,
    ln_m_min: f64,
    ln_m_max: f64,
    kind: IntegralKind,
    fixed_turnover: bool,
    backend: Backend,
}

impl<'a> ConditionalTables<'a> {
    /// Prepare the integral for regions of mass `exp(condition.ln_mass)`
    ///
    /// # Arguments
    ///
    /// * `mass_function` - Integrand provider
    /// * `condition` - Region growth, mass and variance; its `delta` is ignored
    /// * `(ln_m_min, ln_m_max)` - Source mass limits
    /// * `kind` - Integral to evaluate
    /// * `bounds` - Domain of the later queries
    /// * `interpolate` - Tabulate instead of integrating per query
    pub fn build(
        mass_function: &'a dyn MassFunction,
        condition: Condition,
        (ln_m_min, ln_m_max): (f64, f64),
        kind: IntegralKind,
        bounds: TableBounds,
        interpolate: bool,
    ) -> Result<Self> {
        let mut tables = Self {
            mass_function,
            condition,
            ln_m_min,
            ln_m_max,
            kind,
            fixed_turnover: bounds.log10_mturn.is_none(),
            backend: Backend::Direct,
        };
        if !interpolate {
            return Ok(tables);
        }

        let (d_min, d_max) = widen(bounds.delta);
        tables.backend = match (kind, bounds.log10_mturn) {
            (IntegralKind::Weighted(_), Some(mturn)) => {
                let (m_min, m_max) = widen(mturn);
                let this = &tables;
                Backend::Plane(RGTable2D::try_build(
                    "conditional integral",
                    (d_min, d_max, N_DELTA),
                    (m_min, m_max, N_MTURN),
                    |delta, log10_mturn| Ok(this.integrate(delta, log10_mturn)),
                )?)
            }
            _ => {
                let this = &tables;
                Backend::Line(RGTable1D::build(
                    "conditional integral",
                    d_min,
                    d_max,
                    N_DELTA,
                    |delta| this.integrate(delta, 0.0),
                ))
            }
        };
        Ok(tables)
    }

    /// Integral for a region of linear density `delta`
    ///
    /// `log10_mturn` is ignored by tables built without a turnover axis.
    pub fn eval(&self, delta: f64, log10_mturn: f64) -> Result<f64> {
        match &self.backend {
            Backend::Direct => Ok(self.integrate(delta, log10_mturn)),
            Backend::Line(table) => table.eval(delta),
            Backend::Plane(table) => table.eval(delta, log10_mturn),
        }
    }

    fn integrate(&self, delta: f64, log10_mturn: f64) -> f64 {
        match self.kind {
            IntegralKind::Erfc { sigma_min } => self.mass_function.fcoll_delta(
                delta,
                self.condition.growth,
                sigma_min,
                self.condition.sigma,
            ),
            IntegralKind::Weighted(mut source) => {
                if !self.fixed_turnover {
                    source.turnover_low = 10f64.powf(log10_mturn);
                }
                let condition = Condition {
                    delta,
                    ..self.condition
                };
                self.mass_function
                    .conditional(&condition, self.ln_m_min, self.ln_m_max, &source)
            }
            IntegralKind::HaloNumber => {
                let condition = Condition {
                    delta,
                    ..self.condition
                };
                self.mass_function
                    .halo_number_conditional(&condition, self.ln_m_min, self.ln_m_max)
            }
        }
    }
}

/// Grow a degenerate axis so a uniform field still gets a valid table
fn widen((lo, hi): (f64, f64)) -> (f64, f64) {
    if hi - lo < MIN_AXIS_WIDTH {
        let mid = 0.5 * (lo + hi);
        (mid - MIN_AXIS_WIDTH, mid + MIN_AXIS_WIDTH)
    } else {
        (lo, hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CosmoParams;
    use crate::physics::{Cosmology, EfficiencyLaw, FlatLcdm, PressSchechter};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn setup() -> (PressSchechter, Condition) {
        let cosmology = Arc::new(FlatLcdm::new(CosmoParams::default()));
        let ln_mass = cosmology.mass_from_radius(5.0).ln();
        let condition = Condition {
            growth: cosmology.growth(9.0),
            ln_mass,
            sigma: cosmology.sigma(ln_mass),
            delta: 0.0,
        };
        (PressSchechter::new(cosmology, 1.686), condition)
    }

    fn source() -> SourceModel {
        SourceModel::ionizing(
            EfficiencyLaw::power_law(0.05, 1e10, 0.5),
            EfficiencyLaw::power_law(0.1, 1e10, -0.5),
            5e8,
        )
    }

    #[test]
    fn test_plane_matches_direct() {
        let (mf, condition) = setup();
        let bounds = TableBounds {
            delta: (-0.5, 1.0),
            log10_mturn: Some((8.0, 9.5)),
        };
        let range = (1e7_f64.ln(), condition.ln_mass);
        let kind = IntegralKind::Weighted(source());
        let table = ConditionalTables::build(&mf, condition, range, kind, bounds, true).unwrap();
        let direct = ConditionalTables::build(&mf, condition, range, kind, bounds, false).unwrap();
        let exact = direct.eval(0.3, 8.7).unwrap();
        assert_relative_eq!(table.eval(0.3, 8.7).unwrap(), exact, max_relative = 0.02);
    }

    #[test]
    fn test_query_outside_bounds_fails() {
        let (mf, condition) = setup();
        let bounds = TableBounds {
            delta: (-0.5, 1.0),
            log10_mturn: None,
        };
        let kind = IntegralKind::Erfc { sigma_min: 4.0 };
        let range = (1e8_f64.ln(), condition.ln_mass);
        let table = ConditionalTables::build(&mf, condition, range, kind, bounds, true).unwrap();
        assert!(table.eval(0.2, 0.0).is_ok());
        assert!(table.eval(1.2, 0.0).is_err());
    }

    #[test]
    fn test_uniform_field_gets_table() {
        let (mf, condition) = setup();
        let bounds = TableBounds {
            delta: (0.0, 0.0),
            log10_mturn: Some((8.7, 8.7)),
        };
        let range = (1e7_f64.ln(), condition.ln_mass);
        let table =
            ConditionalTables::build(&mf, condition, range, IntegralKind::Weighted(source()), bounds, true)
                .unwrap();
        assert!(table.eval(0.0, 8.7).unwrap() > 0.0);
    }
}
