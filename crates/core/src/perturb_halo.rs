//! Moves halos from their Lagrangian to their Eulerian positions
//!
//! A halo found at position `q` in the initial conditions is displaced with
//! first- and optionally second-order Lagrangian perturbation theory:
//!
//! ```text
//! x = q + D(z) ψ₁(q) + (3/7) D(z)² ψ₂(q)
//! ```
//!
//! where `ψ₁` and `ψ₂` are the displacement fields of the initial
//! conditions (Mpc at `D = 1`) read in the cell containing `q`. Positions
//! are rounded to 1e-4 of the box and wrapped periodically.

use crate::context::SimulationContext;
use crate::error::{ErrorContext, ReionError, Result};
use crate::grid::{Field3D, GridLayout};
use crate::halo_box::HaloCatalog;
use nalgebra::Vector3;
use rayon::prelude::*;
use tracing::debug;

/// Comoving position (Mpc)
pub type Position = Vector3<f64>;

/// Fractional resolution positions are rounded to
const POSITION_RESOLUTION: f64 = 1e4;

/// Displacement fields on one grid
#[derive(Debug, Clone, PartialEq)]
pub struct Displacement {
    /// First-order displacement along x, y, z (Mpc at `D = 1`)
    pub first_order: [Field3D; 3],
    /// Second-order displacement, if computed
    pub second_order: Option<[Field3D; 3]>,
}

impl Displacement {
    pub fn layout(&self) -> GridLayout {
        self.first_order[0].layout
    }

    fn first_at(&self, index: usize) -> Position {
        let [x, y, z] = &self.first_order;
        Position::new(
            f64::from(x.data[index]),
            f64::from(y.data[index]),
            f64::from(z.data[index]),
        )
    }

    fn second_at(&self, index: usize) -> Option<Position> {
        self.second_order.as_ref().map(|[x, y, z]| {
            Position::new(
                f64::from(x.data[index]),
                f64::from(y.data[index]),
                f64::from(z.data[index]),
            )
        })
    }
}

/// Fields of the initial conditions read after the initial step
#[derive(Debug, Clone, PartialEq)]
pub struct InitialConditions {
    /// Displacements on the low-resolution grid
    pub lowres: Displacement,
    /// Displacements on the high-resolution grid
    pub hires: Option<Displacement>,
    /// Relative baryon-dark matter velocity on the low-resolution grid (km/s)
    pub vcb: Option<Field3D>,
}

impl InitialConditions {
    /// Conditions without any displacement
    pub fn at_rest(layout: GridLayout) -> Self {
        let zero = Field3D::new(layout);
        Self {
            lowres: Displacement {
                first_order: [zero.clone(), zero.clone(), zero],
                second_order: None,
            },
            hires: None,
            vcb: None,
        }
    }
}

/// Displaces a halo catalog to a redshift
#[derive(Debug, Clone, Copy)]
pub struct PerturbationMapper<'a> {
    ctx: &'a SimulationContext,
}

impl<'a> PerturbationMapper<'a> {
    pub fn new(ctx: &'a SimulationContext) -> Self {
        Self { ctx }
    }

    /// Catalog of `halos` moved to their positions at `redshift`
    ///
    /// Masses and random draws carry over unchanged.
    ///
    /// # Errors
    ///
    /// [`ReionError::Config`] when high-resolution perturbation is requested
    /// but the initial conditions carry no high-resolution displacement.
    pub fn perturb(
        &self,
        halos: &HaloCatalog,
        ics: &InitialConditions,
        redshift: f64,
    ) -> Result<HaloCatalog> {
        let user = &self.ctx.config().user;
        let displacement = if user.perturb_on_high_res {
            ics.hires.as_ref().ok_or_else(|| {
                ReionError::config(
                    ErrorContext::at(redshift),
                    "high-resolution perturbation needs high-resolution displacement fields",
                )
            })?
        } else {
            &ics.lowres
        };

        let growth = self.ctx.physics().cosmology.growth(redshift);
        let first_factor = growth;
        let second_factor = if user.use_2lpt {
            3.0 / 7.0 * growth * growth
        } else {
            0.0
        };
        let source = displacement.layout();
        let target = self.ctx.layout();
        let box_size = Position::new(target.box_len, target.box_len, target.box_len_para);

        let positions: Vec<[f64; 3]> = self.ctx.install(|| {
            halos
                .as_slice()
                .par_iter()
                .map(|halo| {
                    let q = Position::from(halo.position);
                    let [i, j, k] = source.cell_of_position(halo.position);
                    let index = source.real_index(i, j, k);
                    let mut x = q + displacement.first_at(index) * first_factor;
                    if let Some(second) = displacement.second_at(index) {
                        x += second * second_factor;
                    }
                    wrap(&x, &box_size).into()
                })
                .collect()
        });

        debug!(
            z = redshift,
            n_halos = halos.len(),
            growth,
            second_order = user.use_2lpt && displacement.second_order.is_some(),
            "Perturbed halo catalog"
        );
        Ok(halos.with_positions(redshift, positions))
    }
}

/// Round to the position resolution and wrap into `[0, box_size)`
fn wrap(x: &Position, box_size: &Position) -> Position {
    x.zip_map(box_size, |p, len| {
        let steps = (p / len * POSITION_RESOLUTION)
            .round()
            .rem_euclid(POSITION_RESOLUTION);
        steps.abs() / POSITION_RESOLUTION * len
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::error::ErrorKind;
    use crate::halo_box::Halo;
    use approx::assert_relative_eq;

    fn context(use_2lpt: bool) -> SimulationContext {
        let mut config = SimulationConfig::small_box(4, 20.0);
        config.user.use_2lpt = use_2lpt;
        SimulationContext::new(config).unwrap()
    }

    fn uniform(layout: GridLayout, v: [f32; 3]) -> [Field3D; 3] {
        v.map(|c| Field3D::with_value(layout, c))
    }

    #[test]
    fn test_rest_keeps_positions() {
        let ctx = context(true);
        let mut halo = Halo::new([3.0, 7.5, 12.25], 1e10);
        halo.sfr_rng = -0.4;
        let catalog = HaloCatalog::new(10.0, vec![halo]);
        let moved = PerturbationMapper::new(&ctx)
            .perturb(&catalog, &InitialConditions::at_rest(ctx.layout()), 9.0)
            .unwrap();
        let h = moved.as_slice()[0];
        assert_eq!(moved.redshift, 9.0);
        assert_relative_eq!(h.position[0], 3.0, epsilon = 1e-9);
        assert_relative_eq!(h.position[2], 12.25, epsilon = 1e-9);
        assert_eq!(h.sfr_rng, -0.4);
    }

    #[test]
    fn test_first_order_shift_and_wrap() {
        let ctx = context(false);
        let layout = ctx.layout();
        let mut ics = InitialConditions::at_rest(layout);
        ics.lowres.first_order = uniform(layout, [4.0, -8.0, 0.0]);
        let catalog = HaloCatalog::new(10.0, vec![Halo::new([18.0, 2.0, 5.0], 1e10)]);
        let z = 8.0;
        let growth = ctx.physics().cosmology.growth(z);
        let moved = PerturbationMapper::new(&ctx)
            .perturb(&catalog, &ics, z)
            .unwrap();
        let p = moved.as_slice()[0].position;
        let expect = |x: f64| (x.rem_euclid(20.0) / 20.0 * 1e4).round() / 1e4 * 20.0;
        assert_relative_eq!(p[0], expect(18.0 + 4.0 * growth), epsilon = 1e-9);
        assert_relative_eq!(p[1], expect(2.0 - 8.0 * growth), epsilon = 1e-9);
        assert!(p.iter().all(|&c| (0.0..20.0).contains(&c)));
    }

    #[test]
    fn test_second_order_adds_outwards() {
        let layout = context(true).layout();
        let mut ics = InitialConditions::at_rest(layout);
        ics.lowres.second_order = Some(uniform(layout, [1.0, 0.0, 0.0]));
        let catalog = HaloCatalog::new(10.0, vec![Halo::new([10.0, 10.0, 10.0], 1e10)]);

        let with = PerturbationMapper::new(&context(true))
            .perturb(&catalog, &ics, 6.0)
            .unwrap();
        let without = PerturbationMapper::new(&context(false))
            .perturb(&catalog, &ics, 6.0)
            .unwrap();
        assert!(with.as_slice()[0].position[0] > 10.0);
        assert_relative_eq!(without.as_slice()[0].position[0], 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_high_res_requires_fields() {
        let mut config = SimulationConfig::small_box(4, 20.0);
        config.user.perturb_on_high_res = true;
        let ctx = SimulationContext::new(config).unwrap();
        let catalog = HaloCatalog::new(10.0, vec![Halo::new([1.0; 3], 1e10)]);
        let err = PerturbationMapper::new(&ctx)
            .perturb(&catalog, &InitialConditions::at_rest(ctx.layout()), 9.0)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
