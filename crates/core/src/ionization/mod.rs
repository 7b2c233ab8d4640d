//! Excursion-set ionization field
//!
//! For every filter radius, from the box scale down to the cell, a cell is
//! flagged ionized when the ionizing photons of the smoothed region exceed
//! its hydrogen plus recombinations:
//!
//! ```text
//! ζ f_coll + ζ_mini f_coll_mini > (1 - x_e) (1 + n_rec)
//! ```
//!
//! The local collapsed fractions come from conditional mass function
//! tables (or the filtered halo box) and are rescaled so their box mean
//! matches the global expectation. Cells that never cross the barrier get a
//! partial ionization on the smallest radius.
//!
//! With minihalos the collapsed fractions are integrated trapezoidally in
//! redshift, so a jump in the turnover mass between steps does not jump
//! the source population:
//!
//! ```text
//! F(z, Mt) = F(z', Mt') + F(z, Mt) - F(z', Mt)
//! ```

mod filtered;
mod state;

pub use state::{IonizationState, MeanCollapsedFractions};

use self::filtered::{FilteredGrids, SmoothedField};
use crate::config::PhotonConsType;
use crate::constants::{StepConstants, LOG10_MTURN_MAX};
use crate::context::SimulationContext;
use crate::error::{ErrorContext, ReionError, Result};
use crate::filter::FilterKind;
use crate::grid::Field3D;
use crate::halo_box::HaloBoxFields;
use crate::physics::units::{self, FRACT_FLOAT_ERR};
use crate::physics::{Condition, SourceModel};
use crate::radii::{RadiusScheduler, RadiusSpec};
use crate::spin_temperature::SpinTemperatureState;
use crate::tables::{ConditionalTables, IntegralKind, TableBounds, TableScope};
use crate::turnover::{FeedbackFields, TurnoverModel};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Poisson};
use rayon::prelude::*;
use tracing::{debug, info, trace, warn};

/// Neutral fraction below which a cell counts as fully ionized
const TINY: f64 = 1e-30;

/// Previous-step ionizing budget above which the trapezoid is applied
const TRAPEZOID_THRESHOLD: f64 = 1e-4;

/// Density of a step without a previous density field
const NO_PREVIOUS_DENSITY: f32 = -1.5;

/// Fields the ionization step reads besides the previous state
#[derive(Debug, Clone, Copy)]
pub struct IonizationInputs<'a> {
    /// Evolved density contrast at the requested redshift
    pub density: &'a Field3D,
    /// Density contrast of the previous step, read by the minihalo trapezoid
    pub prev_density: Option<&'a Field3D>,
    /// Spin-temperature state of this step, required with fluctuating Ts
    pub spin: Option<&'a SpinTemperatureState>,
    /// Source grids of this step, required with a halo catalog
    pub halo_box: Option<&'a HaloBoxFields>,
    /// Relative baryon-dark matter velocity (km/s)
    pub vcb: Option<&'a Field3D>,
}

impl<'a> IonizationInputs<'a> {
    /// Inputs with only the density field
    pub fn new(density: &'a Field3D) -> Self {
        Self {
            density,
            prev_density: None,
            spin: None,
            halo_box: None,
            vcb: None,
        }
    }
}

/// Collapsed fractions of one radius
#[derive(Debug)]
struct RadiusFractions {
    fcoll: Field3D,
    fcoll_mini: Option<Field3D>,
    /// Box means, floored
    means: MeanCollapsedFractions,
}

/// Conditional integrals of one radius
#[derive(Debug)]
struct RadiusTables<'a> {
    acg: ConditionalTables<'a>,
    mcg: Option<ConditionalTables<'a>>,
    prev_acg: Option<ConditionalTables<'a>>,
    prev_mcg: Option<ConditionalTables<'a>>,
}

/// Outcome of the barrier test for one cell
#[derive(Debug, Clone, Copy, PartialEq)]
enum CellUpdate {
    Unchanged,
    Ionized {
        z_reion: f32,
        /// Photoionization rate and mean free path on first crossing
        gamma_mfp: Option<(f32, f32)>,
    },
    Partial {
        xh: f32,
        temp_kinetic: f32,
    },
}

/// Computes the ionization field of one redshift step
#[derive(Debug, Clone, Copy)]
pub struct IonizationFieldSolver<'a> {
    ctx: &'a SimulationContext,
}

impl<'a> IonizationFieldSolver<'a> {
    pub fn new(ctx: &'a SimulationContext) -> Self {
        Self { ctx }
    }

    /// Ionization state at `consts.stored_redshift`
    ///
    /// With the redshift-shift photon-conservation mode the sources are
    /// sampled at the adjusted redshift; the returned state keeps the
    /// requested one.
    ///
    /// # Arguments
    ///
    /// * `consts` - Constants of the step, shared with the halo box
    /// * `prev` - State of the previous step, or [`IonizationState::initial`]
    /// * `inputs` - Density and optional source fields of the step
    ///
    /// # Errors
    ///
    /// - [`ReionError::PhotonConservation`] when the calibration curve fails
    /// - [`ReionError::Config`] when an input required by the flags is missing
    /// - [`ReionError::Numerical`] for a non-finite collapsed fraction,
    ///   temperature, neutral fraction or recombination count
    /// - [`ReionError::Table`] when a table query leaves its domain
    pub fn compute(
        &self,
        consts: &StepConstants,
        prev: &IonizationState,
        inputs: &IonizationInputs<'_>,
    ) -> Result<IonizationState> {
        let mut consts = consts.clone();
        if self.ctx.config().flags.photon_cons_type == PhotonConsType::RedshiftShift {
            consts.apply_photon_conservation(self.ctx.physics())?;
        }
        self.check_inputs(&consts, inputs)?;
        let result = self.ctx.install(|| self.run(&consts, prev, inputs));
        if let Err(err) = &result {
            warn!(z = consts.stored_redshift, error = %err, "Ionization step failed");
        }
        result
    }

    fn check_inputs(&self, consts: &StepConstants, inputs: &IonizationInputs<'_>) -> Result<()> {
        let flags = &self.ctx.config().flags;
        if inputs.density.layout != self.ctx.layout() {
            return Err(ReionError::config(
                consts.error_context(),
                "density grid does not match the configured layout",
            ));
        }
        let missing = |what: &str| {
            Err(ReionError::config(
                consts.error_context(),
                format!("{what} is required by the enabled flags"),
            ))
        };
        if flags.use_ts_fluct && inputs.spin.is_none() {
            return missing("a spin-temperature state");
        }
        if flags.use_halo_field && inputs.halo_box.is_none() {
            return missing("a halo box");
        }
        Ok(())
    }

    fn run(
        &self,
        consts: &StepConstants,
        prev: &IonizationState,
        inputs: &IonizationInputs<'_>,
    ) -> Result<IonizationState> {
        self.run_observed(consts, prev, inputs, &mut |_, _| {})
    }

    /// [`Self::run`], handing `observe` the neutral fraction after each radius
    fn run_observed(
        &self,
        consts: &StepConstants,
        prev: &IonizationState,
        inputs: &IonizationInputs<'_>,
        observe: &mut dyn FnMut(&RadiusSpec, &Field3D),
    ) -> Result<IonizationState> {
        let ctx = self.ctx;
        let config = ctx.config();
        let flags = &config.flags;
        let layout = ctx.layout();
        let radii = RadiusScheduler::for_ionization(ctx, consts);

        let mut state = IonizationState::initial(layout);
        state.redshift = consts.stored_redshift;

        let feedback = FeedbackFields {
            j21_lw: inputs.spin.map(|s| &s.j21_lw),
            gamma12: Some(&prev.gamma12),
            z_reion: Some(&prev.z_reion),
            vcb: if config.user.use_relative_velocities && !flags.fix_vcb_avg {
                inputs.vcb
            } else {
                None
            },
        };
        let turnovers = TurnoverModel::new(ctx, consts, feedback);
        let turnover_grid = if flags.use_mass_dependent_zeta && flags.use_mini_halos {
            Some(turnovers.grid()?)
        } else {
            None
        };
        let averages = match &turnover_grid {
            Some(grid) => grid.averages,
            None => turnovers.averages()?,
        };
        state.log10_mturn = averages.log10_acg;
        state.log10_mturn_mini = averages.log10_mcg;
        debug!(
            log10_mturn = averages.log10_acg,
            log10_mturn_mini = averages.log10_mcg,
            "Average turnover masses"
        );

        let (means, limits) = self.mean_collapsed_fractions(
            consts,
            prev,
            10f64.powf(averages.log10_acg),
            10f64.powf(averages.log10_mcg),
        )?;
        state.means = means;
        let budget = means.budget(consts.ion_eff_gl, consts.ion_eff_gl_mini);

        if budget < config.global.hii_round_err {
            debug!(budget, "Mean collapsed fraction too small to ionize, box stays neutral");
            self.set_fully_neutral(consts, &mut state, prev, inputs);
            info!(z = state.redshift, global_xh = state.global_xh(), "Ionization box ready");
            return Ok(state);
        }

        let mut grids = self.prepare_grids(consts, prev, inputs, turnover_grid.as_ref())?;
        let neutral_temperature = self.neutral_temperature(consts, inputs);
        state.temp_kinetic = neutral_temperature.clone();
        let keep_fractions = flags.use_mini_halos && !flags.use_halo_field;
        if keep_fractions {
            state.fcoll = vec![Field3D::new(layout); radii.len()];
            state.fcoll_mini = vec![Field3D::new(layout); radii.len()];
        }
        let need_prev = prev.means.budget(consts.ion_eff_gl, consts.ion_eff_gl_mini)
            > TRAPEZOID_THRESHOLD;
        let poisson = self.poisson()?;

        for radius in radii.descending() {
            if consts.m_min > radius.m_max {
                debug!(
                    radius = radius.radius,
                    m_max = radius.m_max,
                    m_min = consts.m_min,
                    "Filter mass below the minimum source mass, stopping"
                );
                break;
            }
            trace!(radius_index = radius.index, radius = radius.radius, "Filtering");
            grids.refresh(radius);

            let tables = if flags.use_halo_field {
                None
            } else {
                let tables = self
                    .radius_tables(consts, radius, &grids, need_prev)
                    .map_err(|e| e.with_context(consts.error_context().radius(radius.index)))?;
                Some(TableScope::new(tables, radius.index))
            };
            let fractions =
                self.collapsed_fractions(consts, radius, &grids, tables.as_deref(), prev, need_prev, limits)?;
            drop(tables);

            if !consts.fix_mean {
                state.means = fractions.means;
            }
            let mean_fix = if consts.fix_mean {
                MeanCollapsedFractions {
                    acg: means.acg / fractions.means.acg,
                    mcg: if fractions.fcoll_mini.is_some() {
                        means.mcg / fractions.means.mcg
                    } else {
                        0.0
                    },
                }
            } else {
                MeanCollapsedFractions { acg: 1.0, mcg: 1.0 }
            };

            self.find_ionized_regions(
                consts,
                radius,
                &grids,
                &fractions,
                mean_fix,
                limits,
                prev,
                inputs,
                poisson.as_ref(),
                &mut state,
            );
            observe(radius, &state.xh);

            if keep_fractions {
                state.fcoll[radius.index] = fractions.fcoll;
                if let Some(mini) = fractions.fcoll_mini {
                    state.fcoll_mini[radius.index] = mini;
                }
            }
        }

        self.set_ionized_temperatures(consts, &neutral_temperature, inputs, &mut state)?;

        let global_xh = state.global_xh();
        if !global_xh.is_finite() {
            return Err(ReionError::numerical(
                consts.error_context(),
                "neutral fraction",
                format!("box mean {global_xh}"),
            ));
        }
        if flags.inhomo_reco {
            self.accumulate_recombinations(consts, prev, inputs, &mut state)?;
        }

        info!(z = state.redshift, global_xh, "Ionization box ready");
        Ok(state)
    }

    /// Global collapsed fractions and their floors at the start of heating
    fn mean_collapsed_fractions(
        &self,
        consts: &StepConstants,
        prev: &IonizationState,
        mturn_acg: f64,
        mturn_mcg: f64,
    ) -> Result<(MeanCollapsedFractions, MeanCollapsedFractions)> {
        let config = self.ctx.config();
        let mf = self.ctx.physics().mass_function.as_ref();
        let z_heat_max = config.global.z_heat_max;
        let (lo, hi) = (consts.ln_m_min, consts.ln_m_max);

        let mut means = MeanCollapsedFractions::default();
        let mut limits = MeanCollapsedFractions::default();
        if config.flags.use_mass_dependent_zeta {
            let acg = consts.acg_source(mturn_acg);
            let current = mf.unconditional(consts.redshift, lo, hi, &acg);
            limits.acg = mf.unconditional(z_heat_max, lo, hi, &acg);
            means.acg = current;

            if config.flags.use_mini_halos {
                if prev.means.acg * consts.ion_eff_gl >= TRAPEZOID_THRESHOLD {
                    let previous = mf.unconditional(consts.prev_redshift, lo, hi, &acg);
                    means.acg = prev.means.acg + current - previous;
                }

                let mcg = consts.mcg_source(mturn_mcg, mturn_acg);
                let current = mf.unconditional(consts.redshift, lo, hi, &mcg);
                means.mcg = current;
                if prev.means.mcg * consts.ion_eff_gl_mini >= TRAPEZOID_THRESHOLD {
                    let previous = mf.unconditional(consts.prev_redshift, lo, hi, &mcg);
                    means.mcg = prev.means.mcg + current - previous;
                }
                limits.mcg = mf.unconditional(z_heat_max, lo, hi, &mcg);
            }
        } else {
            let collapsed = SourceModel::collapsed();
            means.acg = mf.unconditional(consts.redshift, lo, hi, &collapsed);
            limits.acg = mf.unconditional(z_heat_max, lo, hi, &collapsed);
        }

        for (value, quantity) in [
            (means.acg, "mean collapsed fraction"),
            (means.mcg, "mean minihalo collapsed fraction"),
        ] {
            if !value.is_finite() {
                return Err(ReionError::numerical(
                    consts.error_context(),
                    quantity,
                    format!("value {value}"),
                ));
            }
        }
        debug!(
            mean_f_coll = means.acg,
            mean_f_coll_mini = means.mcg,
            "Excursion-set normalisation"
        );
        Ok((means, limits))
    }

    /// Neutral box: `xH = 1 - x_e`, temperature from the thermal history
    fn set_fully_neutral(
        &self,
        consts: &StepConstants,
        state: &mut IonizationState,
        prev: &IonizationState,
        inputs: &IonizationInputs<'_>,
    ) {
        let thermal = self.ctx.physics().thermal.as_ref();
        match inputs.spin {
            Some(spin) if self.ctx.config().flags.use_ts_fluct => {
                state
                    .xh
                    .data
                    .par_iter_mut()
                    .zip(spin.x_e.data.par_iter())
                    .for_each(|(xh, &x_e)| *xh = 1.0 - x_e);
                state.temp_kinetic = spin.temp_kinetic.clone();
            }
            _ => {
                let xh = 1.0 - thermal.recfast_xe(consts.redshift);
                state.xh.fill(xh as f32);
                state.temp_kinetic = self.neutral_temperature(consts, inputs);
            }
        }
        state.dnrec = prev.dnrec.clone();
    }

    /// Kinetic temperature of neutral gas in every cell
    fn neutral_temperature(&self, consts: &StepConstants, inputs: &IonizationInputs<'_>) -> Field3D {
        match inputs.spin {
            Some(spin) if self.ctx.config().flags.use_ts_fluct => spin.temp_kinetic.clone(),
            _ => {
                let data = inputs
                    .density
                    .data
                    .par_iter()
                    .map(|&d| {
                        (consts.tk_nofluct * (1.0 + consts.adia_tk_term * f64::from(d))) as f32
                    })
                    .collect();
                Field3D::from_vec(inputs.density.layout, data)
            }
        }
    }

    fn prepare_grids(
        &self,
        consts: &StepConstants,
        prev: &IonizationState,
        inputs: &IonizationInputs<'_>,
        turnovers: Option<&crate::turnover::TurnoverGrid>,
    ) -> Result<FilteredGrids<'a>> {
        let config = self.ctx.config();
        let flags = &config.flags;
        let engine = self.ctx.filter();
        let kernel = FilterKind::from_selector(config.global.hii_filter).ok_or_else(|| {
            ReionError::config(
                consts.error_context(),
                format!("unknown filter selector {}", config.global.hii_filter),
            )
        })?;
        let density_clip = (-1.0, 1e6);
        let prepare = |field: &Field3D, factor: f64, input: (f32, f32), kernel, output| {
            SmoothedField::prepare(engine, field, factor, input, kernel, output)
        };

        let mut grids = FilteredGrids::new(
            engine,
            prepare(
                inputs.density,
                consts.photoncons_adjustment,
                density_clip,
                kernel,
                ((-1.0 + FRACT_FLOAT_ERR) as f32, 1e6),
            ),
        );

        if flags.use_halo_field {
            if let Some(halo_box) = inputs.halo_box {
                let source_kernel = if flags.use_exp_filter {
                    FilterKind::ExpMfp {
                        mfp: consts.mfp_meandens,
                    }
                } else {
                    kernel
                };
                let range = (0.0, 1e20);
                grids.stars = Some(prepare(&halo_box.n_ion, 1.0, range, source_kernel, range));
                grids.sfr = Some(prepare(
                    &halo_box.fescweighted_sfr,
                    1.0,
                    range,
                    source_kernel,
                    range,
                ));
            }
        } else if flags.use_mini_halos {
            let placeholder;
            let prev_density = if let Some(d) = inputs.prev_density {
                d
            } else {
                placeholder = Field3D::with_value(self.ctx.layout(), NO_PREVIOUS_DENSITY);
                &placeholder
            };
            grids.prev_density = Some(prepare(prev_density, 1.0, density_clip, kernel, density_clip));
            if let Some(turnovers) = turnovers {
                let unclipped = (f32::MIN, f32::MAX);
                let range = (0.0, LOG10_MTURN_MAX as f32);
                grids.log10_mturn = Some(prepare(&turnovers.log10_acg, 1.0, unclipped, kernel, range));
                grids.log10_mturn_mini =
                    Some(prepare(&turnovers.log10_mcg, 1.0, unclipped, kernel, range));
            }
        }

        if flags.use_ts_fluct {
            if let Some(spin) = inputs.spin {
                grids.x_e = Some(prepare(&spin.x_e, 1.0, (0.0, 1.0), kernel, (0.0, 0.999)));
            }
        }
        if consts.filter_recombinations {
            grids.n_rec = Some(prepare(&prev.dnrec, 1.0, (0.0, 1e20), kernel, (0.0, f32::MAX)));
        }
        Ok(grids)
    }

    /// Conditional tables sized from the smoothed fields of `radius`
    fn radius_tables(
        &self,
        consts: &StepConstants,
        radius: &RadiusSpec,
        grids: &FilteredGrids<'_>,
        need_prev: bool,
    ) -> Result<RadiusTables<'a>> {
        let config = self.ctx.config();
        let flags = &config.flags;
        let mf = self.ctx.physics().mass_function.as_ref();
        let interpolate = config.user.use_interpolation_tables;
        let range = (consts.ln_m_min, radius.ln_m_max);
        let condition = |growth: f64| Condition {
            growth,
            ln_mass: radius.ln_m_max,
            sigma: radius.sigma_maxmass,
            delta: 0.0,
        };
        let density_bounds = |field: &SmoothedField| {
            let (lo, hi) = field.extrema();
            (lo - 0.001, hi + 0.001)
        };
        let turnover_bounds = |field: Option<&SmoothedField>| {
            field.map(|f| {
                let (lo, hi) = f.extrema();
                (lo * 0.99, hi * 1.01)
            })
        };
        let build = |growth: f64, kind: IntegralKind, delta: (f64, f64), mturn: Option<(f64, f64)>| {
            ConditionalTables::build(
                mf,
                condition(growth),
                range,
                kind,
                TableBounds {
                    delta,
                    log10_mturn: mturn,
                },
                interpolate,
            )
        };

        let delta = density_bounds(&grids.density);
        if !flags.use_mass_dependent_zeta {
            let kind = IntegralKind::Erfc {
                sigma_min: consts.sigma_minmass,
            };
            return Ok(RadiusTables {
                acg: build(consts.growth, kind, delta, None)?,
                mcg: None,
                prev_acg: None,
                prev_mcg: None,
            });
        }

        let acg_kind = IntegralKind::Weighted(consts.acg_source(consts.mturn_a_nofb));
        let mcg_kind =
            IntegralKind::Weighted(consts.mcg_source(consts.mturn_m_nofb, consts.mturn_a_nofb));
        let mturn_acg = turnover_bounds(grids.log10_mturn.as_ref());
        let mturn_mcg = turnover_bounds(grids.log10_mturn_mini.as_ref());
        let mini = flags.use_mini_halos;

        let acg = build(consts.growth, acg_kind, delta, mturn_acg)?;
        let mcg = if mini {
            Some(build(consts.growth, mcg_kind, delta, mturn_mcg)?)
        } else {
            None
        };
        let (prev_acg, prev_mcg) = match (&grids.prev_density, mini && need_prev) {
            (Some(prev_density), true) => {
                let delta = density_bounds(prev_density);
                (
                    Some(build(consts.prev_growth, acg_kind, delta, mturn_acg)?),
                    Some(build(consts.prev_growth, mcg_kind, delta, mturn_mcg)?),
                )
            }
            _ => (None, None),
        };
        Ok(RadiusTables {
            acg,
            mcg,
            prev_acg,
            prev_mcg,
        })
    }

    /// Per-cell collapsed fractions of one radius and their box means
    fn collapsed_fractions(
        &self,
        consts: &StepConstants,
        radius: &RadiusSpec,
        grids: &FilteredGrids<'_>,
        tables: Option<&RadiusTables<'_>>,
        prev: &IonizationState,
        need_prev: bool,
        limits: MeanCollapsedFractions,
    ) -> Result<RadiusFractions> {
        let flags = &self.ctx.config().flags;
        let layout = self.ctx.layout();
        let n = layout.real_len();
        let context = consts.error_context().radius(radius.index);
        let trapezoid = flags.use_mini_halos && !flags.use_halo_field;

        let cells: Vec<(f32, f32)> = (0..n)
            .into_par_iter()
            .map(|i| -> Result<(f32, f32)> {
                let at_cell = |e: ReionError| e.with_context(context.cell(layout.real_coords(i)));
                let (f, f_mini, prev_f, prev_f_mini) = match (&grids.stars, tables) {
                    (Some(stars), _) => (stars.at(i), 0.0, 0.0, 0.0),
                    (None, Some(t)) => {
                        let dens = grids.density.at(i);
                        let lt = grids.log10_mturn.as_ref().map_or(0.0, |g| g.at(i));
                        let lt_mini = grids.log10_mturn_mini.as_ref().map_or(0.0, |g| g.at(i));
                        let f = t.acg.eval(dens, lt).map_err(at_cell)?;
                        let f_mini = match &t.mcg {
                            Some(mcg) => mcg.eval(dens, lt_mini).map_err(at_cell)?,
                            None => 0.0,
                        };
                        let (prev_f, prev_f_mini) = match (&t.prev_acg, &t.prev_mcg, &grids.prev_density) {
                            (Some(pa), Some(pm), Some(pd)) if need_prev => {
                                let d = pd.at(i);
                                (
                                    pa.eval(d, lt).map_err(at_cell)?,
                                    pm.eval(d, lt_mini).map_err(at_cell)?,
                                )
                            }
                            _ => (0.0, 0.0),
                        };
                        (f, f_mini, prev_f, prev_f_mini)
                    }
                    (None, None) => (0.0, 0.0, 0.0, 0.0),
                };

                let (fcoll, fcoll_mini) = if trapezoid {
                    let clip = |v: f64| {
                        if v > 1.0 {
                            1.0
                        } else if v < 0.0 {
                            1e-40
                        } else {
                            v
                        }
                    };
                    (
                        (prev.fcoll_at(radius.index, i) + clip(f) - clip(prev_f)).min(1.0),
                        (prev.fcoll_mini_at(radius.index, i) + clip(f_mini) - clip(prev_f_mini))
                            .min(1.0),
                    )
                } else {
                    (f, 0.0)
                };
                if !fcoll.is_finite() || !fcoll_mini.is_finite() {
                    return Err(ReionError::numerical(
                        context.cell(layout.real_coords(i)),
                        "collapsed fraction",
                        format!(
                            "f_coll={fcoll}, f_coll_mini={fcoll_mini}, delta={}",
                            grids.density.at(i)
                        ),
                    ));
                }
                Ok((fcoll as f32, fcoll_mini as f32))
            })
            .collect::<Result<_>>()?;

        let (fcoll, fcoll_mini): (Vec<f32>, Vec<f32>) = cells.into_par_iter().unzip();
        let fcoll = Field3D::from_vec(layout, fcoll);
        let fcoll_mini = trapezoid.then(|| Field3D::from_vec(layout, fcoll_mini));

        let mut means = MeanCollapsedFractions {
            acg: fcoll.mean(),
            mcg: fcoll_mini.as_ref().map_or(0.0, Field3D::mean),
        };
        if flags.use_mass_dependent_zeta {
            means.acg = means.acg.max(limits.acg);
            if flags.use_mini_halos {
                means.mcg = means.mcg.max(limits.mcg);
            }
        } else {
            means.acg = means.acg.max(FRACT_FLOAT_ERR);
        }
        Ok(RadiusFractions {
            fcoll,
            fcoll_mini,
            means,
        })
    }

    /// Flag cells whose smoothed region beats the barrier at `radius`
    fn find_ionized_regions(
        &self,
        consts: &StepConstants,
        radius: &RadiusSpec,
        grids: &FilteredGrids<'_>,
        fractions: &RadiusFractions,
        mean_fix: MeanCollapsedFractions,
        limits: MeanCollapsedFractions,
        prev: &IonizationState,
        inputs: &IonizationInputs<'_>,
        poisson: Option<&Poisson<f64>>,
        state: &mut IonizationState,
    ) {
        let config = self.ctx.config();
        let flags = &config.flags;
        let thermal = self.ctx.physics().thermal.as_ref();
        let rho_baryon = units::rho_crit(&config.cosmo) * config.cosmo.omb;
        let n_poisson = config.global.n_poisson;
        let seed = config.user.rng_seed ^ consts.stored_redshift.to_bits();
        let smallest = radius.index == 0;

        let updates: Vec<CellUpdate> = (0..state.xh.len())
            .into_par_iter()
            .map(|i| {
                let xh = f64::from(state.xh.data[i]);
                let dens = if flags.cell_recomb {
                    f64::from(inputs.density.data[i]) * consts.photoncons_adjustment
                } else {
                    grids.density.at(i)
                };

                let mut fcoll = mean_fix.acg * f64::from(fractions.fcoll.data[i]);
                if flags.use_halo_field {
                    fcoll /= rho_baryon * (1.0 + dens);
                }
                let mut fcoll_mini = fractions
                    .fcoll_mini
                    .as_ref()
                    .map_or(0.0, |f| mean_fix.mcg * f64::from(f.data[i]));
                if flags.use_mass_dependent_zeta {
                    fcoll = fcoll.max(limits.acg);
                    if flags.use_mini_halos {
                        fcoll_mini = fcoll_mini.max(limits.mcg);
                    }
                }

                let rec = if flags.inhomo_reco {
                    let n_rec = match &grids.n_rec {
                        Some(g) if !flags.cell_recomb => g.at(i),
                        _ => f64::from(prev.dnrec.data[i]),
                    };
                    n_rec / (1.0 + dens)
                } else {
                    0.0
                };
                let x_e = grids.x_e.as_ref().map_or(0.0, |g| g.at(i));

                let photons = fcoll * consts.ion_eff + fcoll_mini * consts.ion_eff_mini;
                if photons > (1.0 - x_e) * (1.0 + rec) {
                    let gamma_mfp = (flags.inhomo_reco && xh > FRACT_FLOAT_ERR).then(|| {
                        let gamma = match &grids.sfr {
                            Some(sfr) => {
                                radius.radius * consts.gamma_prefactor / (1.0 + dens) * sfr.at(i)
                            }
                            None => photoionization_rate(radius.radius, consts, fcoll, fcoll_mini),
                        };
                        (gamma as f32, radius.radius as f32)
                    });
                    let z_prev = prev.z_reion.data[i];
                    let z_reion = if z_prev < 0.0 {
                        consts.redshift as f32
                    } else {
                        z_prev
                    };
                    return CellUpdate::Ionized { z_reion, gamma_mfp };
                }

                if !(smallest && xh > TINY) {
                    return CellUpdate::Unchanged;
                }
                if !flags.use_halo_field {
                    let cell_mass = consts.pixel_mass * (1.0 + dens);
                    let collapsed_mass = (fcoll + fcoll_mini) * cell_mass;
                    let expected_halos = collapsed_mass / consts.m_min;
                    let drawn = match poisson {
                        Some(dist) => {
                            let mut rng = StdRng::seed_from_u64(
                                seed ^ (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
                            );
                            dist.sample(&mut rng)
                        }
                        None => 1.0,
                    };
                    fcoll = fcoll.min(1.0);
                    fcoll_mini = fcoll_mini.min(1.0);
                    if expected_halos < n_poisson {
                        let total = drawn * (collapsed_mass / n_poisson) / cell_mass;
                        (fcoll, fcoll_mini) = if flags.use_mini_halos {
                            split_drawn_fraction(total, fcoll_mini, consts.ion_eff, consts.ion_eff_mini)
                        } else {
                            (total, 0.0)
                        };
                    }
                    if collapsed_mass < consts.m_min / 5.0 {
                        fcoll = 0.0;
                        fcoll_mini = 0.0;
                    }
                    fcoll = fcoll.min(1.0);
                    fcoll_mini = fcoll_mini.min(1.0);
                }

                let residual = 1.0 - fcoll * consts.ion_eff - fcoll_mini * consts.ion_eff_mini;
                let t_hi = match inputs.spin {
                    Some(spin) if flags.use_ts_fluct => f64::from(spin.temp_kinetic.data[i]),
                    _ => {
                        consts.tk_nofluct
                            * (1.0 + consts.adia_tk_term * f64::from(inputs.density.data[i]))
                    }
                };
                let temp_kinetic = thermal.partially_ionized_temperature(t_hi, residual);
                CellUpdate::Partial {
                    xh: (residual - x_e).clamp(0.0, 1.0) as f32,
                    temp_kinetic: temp_kinetic as f32,
                }
            })
            .collect();

        let sphere = config.global.find_bubble_algorithm == 1;
        let mut centres = Vec::new();
        for (i, update) in updates.into_iter().enumerate() {
            match update {
                CellUpdate::Unchanged => {}
                CellUpdate::Ionized { z_reion, gamma_mfp } => {
                    if let Some((gamma, mfp)) = gamma_mfp {
                        state.gamma12.data[i] = gamma;
                        state.mfp.data[i] = mfp;
                    }
                    state.z_reion.data[i] = z_reion;
                    if sphere {
                        centres.push(i);
                    } else {
                        state.xh.data[i] = 0.0;
                    }
                }
                CellUpdate::Partial { xh, temp_kinetic } => {
                    state.xh.data[i] = xh;
                    state.temp_kinetic.data[i] = temp_kinetic;
                }
            }
        }
        for centre in centres {
            flag_sphere(&mut state.xh, centre, radius.radius);
        }
    }

    /// Temperatures of fully ionized cells
    fn set_ionized_temperatures(
        &self,
        consts: &StepConstants,
        neutral_temperature: &Field3D,
        inputs: &IonizationInputs<'_>,
        state: &mut IonizationState,
    ) -> Result<()> {
        let thermal = self.ctx.physics().thermal.as_ref();
        let layout = self.ctx.layout();
        let IonizationState {
            xh,
            z_reion,
            temp_kinetic,
            ..
        } = state;
        temp_kinetic
            .data
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, tk)| {
                let z_re = f64::from(z_reion.data[i]);
                if z_re > 0.0 && f64::from(xh.data[i]) < TINY {
                    let heated = thermal.fully_ionized_temperature(
                        z_re,
                        consts.stored_redshift,
                        f64::from(inputs.density.data[i]),
                    );
                    *tk = (heated as f32).max(neutral_temperature.data[i]);
                }
            });

        match temp_kinetic.data.iter().position(|t| !t.is_finite()) {
            Some(i) => Err(ReionError::numerical(
                consts.error_context().cell(layout.real_coords(i)),
                "kinetic temperature",
                format!(
                    "z_re={}, delta={}",
                    z_reion.data[i], inputs.density.data[i]
                ),
            )),
            None => Ok(()),
        }
    }

    /// Add the recombinations of this step to the running count
    fn accumulate_recombinations(
        &self,
        consts: &StepConstants,
        prev: &IonizationState,
        inputs: &IonizationInputs<'_>,
        state: &mut IonizationState,
    ) -> Result<()> {
        let thermal = self.ctx.physics().thermal.as_ref();
        let layout = self.ctx.layout();
        let IonizationState {
            xh, gamma12, dnrec, ..
        } = state;
        dnrec.data = (0..xh.len())
            .into_par_iter()
            .map(|i| {
                let z_eff = (1.0 + f64::from(inputs.density.data[i])).cbrt()
                    * (1.0 + consts.stored_redshift);
                let added = thermal.recombination_rate(z_eff - 1.0, f64::from(gamma12.data[i]))
                    * consts.abs_dtdz
                    * consts.dz
                    * (1.0 - f64::from(xh.data[i]));
                (f64::from(prev.dnrec.data[i]) + added) as f32
            })
            .collect();
        match dnrec.data.iter().position(|v| !v.is_finite()) {
            Some(i) => Err(ReionError::numerical(
                consts.error_context().cell(layout.real_coords(i)),
                "recombinations",
                format!("gamma12={}, xH={}", gamma12.data[i], xh.data[i]),
            )),
            None => Ok(()),
        }
    }

    /// Halo-count distribution of the partial ionizations, if sampled
    fn poisson(&self) -> Result<Option<Poisson<f64>>> {
        let config = self.ctx.config();
        if config.user.no_rng || config.flags.use_halo_field {
            return Ok(None);
        }
        Poisson::new(config.global.n_poisson).map(Some).map_err(|e| {
            ReionError::config(ErrorContext::default(), format!("N_POISSON: {e}"))
        })
    }
}

/// Photoionization rate (1e-12 s⁻¹) of a cell first crossing the barrier at `radius`
///
/// ```text
/// Γ12 = R (Γ_pre f_coll + Γ_pre,mini f_coll_mini)
/// ```
fn photoionization_rate(radius: f64, consts: &StepConstants, fcoll: f64, fcoll_mini: f64) -> f64 {
    radius * (consts.gamma_prefactor * fcoll + consts.gamma_prefactor_mini * fcoll_mini)
}

/// Split a Poisson-drawn collapsed fraction into `(atomic, minihalo)` parts
///
/// ```text
/// f_mini = F F_mini ζ / (F ζ + F_mini ζ_mini),    f = F - f_mini
/// ```
///
/// where `F` is the drawn total and `F_mini` the minihalo fraction before
/// the draw.
fn split_drawn_fraction(total: f64, fcoll_mini: f64, ion_eff: f64, ion_eff_mini: f64) -> (f64, f64) {
    let weight = total * ion_eff + fcoll_mini * ion_eff_mini;
    if weight > 0.0 {
        let mini = total * fcoll_mini * ion_eff / weight;
        (total - mini, mini)
    } else {
        (total, 0.0)
    }
}

/// Set `xH = 0` in every cell within `radius` (Mpc) of `centre`, periodically
fn flag_sphere(xh: &mut Field3D, centre: usize, radius: f64) {
    let layout = xh.layout;
    let [cx, cy, cz] = layout.real_coords(centre);
    let dx = layout.cell_len();
    let dz = layout.box_len_para / layout.nz as f64;
    let reach = |cell: f64, n: usize| ((radius / cell).ceil() as usize).min(n / 2);
    let (rx, rz) = (reach(dx, layout.nx), reach(dz, layout.nz));
    let wrap = |c: usize, offset: isize, n: usize| (c as isize + offset).rem_euclid(n as isize) as usize;

    for ox in -(rx as isize)..=rx as isize {
        for oy in -(rx as isize)..=rx as isize {
            for oz in -(rz as isize)..=rz as isize {
                let (px, py, pz) = (ox as f64 * dx, oy as f64 * dx, oz as f64 * dz);
                if px * px + py * py + pz * pz <= radius * radius {
                    let index = layout.real_index(
                        wrap(cx, ox, layout.nx),
                        wrap(cy, oy, layout.ny),
                        wrap(cz, oz, layout.nz),
                    );
                    xh.data[index] = 0.0;
                }
            }
        }
    }
}
