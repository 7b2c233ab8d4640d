//! Spin and kinetic temperature of the neutral IGM
//!
//! Each step sums, for every cell, the X-ray and Lyman-series radiation
//! emitted by the sources in a sequence of shells around it, each shell at
//! its own emission redshift `z''`. The sums drive one explicit update of
//! the free-electron fraction and kinetic temperature from the previous
//! step, after which the spin temperature follows from the couplings
//! ([`cell`]).
//!
//! Sources come from one of two places:
//!
//! - **Density grid**: the density smoothed on each shell is converted to a
//!   star formation rate with conditional mass function integrals (or the
//!   erfc collapsed fraction) and rescaled so its box mean matches the
//!   global expectation at `z''`.
//! - **Halo box**: the star formation and X-ray grids are averaged over
//!   each shell with an annulus filter and scaled by the growth of the
//!   global star formation rate density between `z'` and `z''`.
//!
//! At or above `Z_HEAT_MAX` no step is taken; the box starts from the
//! RECFAST-like background.

mod cell;
mod freq_tables;
mod shells;
mod state;

pub use cell::{CellState, RadiationTerms, ZpConstants};
pub use freq_tables::{FrequencyTables, SampleIndex, XrayIntegrals, X_E_SAMPLES};
pub use shells::{LymanWeights, RedshiftShell, RedshiftShells, SpectralFactors};
pub use state::SpinTemperatureState;

use crate::constants::{StepConstants, LOG10_MTURN_MAX, LX_UNIT};
use crate::context::SimulationContext;
use crate::error::{ReionError, Result};
use crate::filter::{FilterKind, GridFilterEngine};
use crate::grid::{Field3D, SpectralField};
use crate::halo_box::HaloBoxFields;
use crate::physics::units::{self, FRACT_FLOAT_ERR};
use crate::physics::{Condition, SourceModel};
use crate::tables::{ConditionalTables, IntegralKind, TableBounds, TableScope};
use rayon::prelude::*;
use std::f64::consts::{PI, SQRT_2};
use tracing::{debug, info, trace, warn};

/// Global ionizing output below which the box is treated as dark
const NO_LIGHT_THRESHOLD: f64 = 1e-15;

/// Redshift offset for the numerical derivative of the global collapsed fraction
const FCOLL_DZ: f64 = 1e-3;

/// Fields the spin-temperature step reads besides the previous state
#[derive(Debug, Clone, Copy)]
pub struct SpinTemperatureInputs<'a> {
    /// Evolved density contrast at the step redshift
    pub density: &'a Field3D,
    /// Source grids of this step, required with a halo catalog
    pub halo_box: Option<&'a HaloBoxFields>,
    /// Relative baryon-dark matter velocity (km/s)
    pub vcb: Option<&'a Field3D>,
}

impl<'a> SpinTemperatureInputs<'a> {
    /// Inputs with only the density field
    pub fn new(density: &'a Field3D) -> Self {
        Self {
            density,
            halo_box: None,
            vcb: None,
        }
    }
}

/// Source densities of every cell within one shell
#[derive(Debug)]
struct ShellSources {
    /// X-ray luminosity density (erg s⁻¹ Mpc⁻³)
    xray: Vec<f64>,
    /// Star formation rate density of atomic-cooling galaxies (Msun s⁻¹ Mpc⁻³)
    stars: Vec<f64>,
    /// Star formation rate density of minihalos
    stars_mini: Option<Vec<f64>>,
}

/// Smooths pre-transformed fields onto one shell
struct ShellSmoother<'e> {
    engine: &'e GridFilterEngine,
    scratch: SpectralField,
}

impl<'e> ShellSmoother<'e> {
    fn new(engine: &'e GridFilterEngine) -> Self {
        Self {
            engine,
            scratch: SpectralField::new(engine.layout()),
        }
    }

    /// Smooth `spectrum` with `kernel` on `radius` into `out`; no kernel keeps the cell scale
    fn smooth(
        &mut self,
        spectrum: &SpectralField,
        kernel: Option<FilterKind>,
        radius: f64,
        out: &mut Field3D,
    ) {
        self.scratch.copy_from(spectrum);
        if let Some(kernel) = kernel {
            self.engine.filter(&mut self.scratch, kernel, radius);
        }
        self.engine.inverse(&self.scratch, out);
    }
}

/// Computes the spin-temperature state of one redshift step
#[derive(Debug, Clone, Copy)]
pub struct SpinTemperatureSolver<'a> {
    ctx: &'a SimulationContext,
}

impl<'a> SpinTemperatureSolver<'a> {
    pub fn new(ctx: &'a SimulationContext) -> Self {
        Self { ctx }
    }

    /// Background state at `redshift` before any source has formed
    ///
    /// The kinetic temperature follows the density with the adiabatic index;
    /// the spin temperature is set by collisions alone.
    pub fn initial(&self, redshift: f64, density: &Field3D) -> SpinTemperatureState {
        let config = self.ctx.config();
        let physics = self.ctx.physics();
        let thermal = physics.thermal.as_ref();
        let x_e = thermal.recfast_xe(redshift);
        let t_k0 = thermal.recfast_temperature(redshift);
        let adiabatic = thermal.adiabatic_index(redshift);
        let zp = ZpConstants::new(config, physics, redshift, 0.0);

        let layout = density.layout;
        let mut state = SpinTemperatureState::uniform(layout, redshift, 0.0, 0.0, x_e as f32);
        state
            .temp_kinetic
            .as_mut_slice()
            .par_iter_mut()
            .zip(state.spin_temperature.as_mut_slice().par_iter_mut())
            .zip(density.as_slice().par_iter())
            .for_each(|((t_k, t_s), &delta)| {
                let delta = f64::from(delta).max(-1.0 + FRACT_FLOAT_ERR);
                let temp = t_k0 * (1.0 + adiabatic * delta);
                *t_k = temp as f32;
                *t_s = zp.spin_temperature(physics, delta, x_e, temp, 0.0, 1.0) as f32;
            });
        info!(
            z = redshift,
            x_e,
            mean_tk = state.mean_temp_kinetic(),
            mean_ts = state.mean_spin_temperature(),
            "Spin temperature initialised"
        );
        state
    }

    /// Spin-temperature state at `consts.stored_redshift`
    ///
    /// # Arguments
    ///
    /// * `consts` - Constants of the step; `consts.dz` is the interval evolved over
    /// * `prev` - State of the previous step, unused at or above `Z_HEAT_MAX`
    /// * `inputs` - Density and optional source fields of the step
    ///
    /// # Errors
    ///
    /// - [`ReionError::Config`] when the previous state is missing below
    ///   `Z_HEAT_MAX`, a grid has the wrong layout, or a halo box is required
    ///   but missing
    /// - [`ReionError::Numerical`] for a non-finite frequency integral or
    ///   cell temperature
    /// - [`ReionError::Table`] when a conditional table query leaves its domain
    pub fn compute(
        &self,
        consts: &StepConstants,
        prev: Option<&SpinTemperatureState>,
        inputs: &SpinTemperatureInputs<'_>,
    ) -> Result<SpinTemperatureState> {
        let config = self.ctx.config();
        let layout = self.ctx.layout();
        let zp = consts.stored_redshift;
        if inputs.density.layout != layout {
            return Err(ReionError::config(
                consts.error_context(),
                "density grid does not match the configured layout",
            ));
        }
        if zp >= config.global.z_heat_max {
            return Ok(self.initial(zp, inputs.density));
        }
        let prev = prev.ok_or_else(|| {
            ReionError::config(
                consts.error_context(),
                "spin temperature below Z_HEAT_MAX needs the previous state",
            )
        })?;
        if prev.layout() != layout {
            return Err(ReionError::config(
                consts.error_context(),
                "previous spin-temperature state does not match the configured layout",
            ));
        }
        if config.flags.use_halo_field && inputs.halo_box.is_none() {
            return Err(ReionError::config(
                consts.error_context(),
                "a halo box is required by the enabled flags",
            ));
        }

        let result = self.ctx.install(|| self.run(consts, prev, inputs));
        if let Err(err) = &result {
            warn!(z = zp, error = %err, "Spin temperature step failed");
        }
        result
    }

    fn run(
        &self,
        consts: &StepConstants,
        prev: &SpinTemperatureState,
        inputs: &SpinTemperatureInputs<'_>,
    ) -> Result<SpinTemperatureState> {
        let ctx = self.ctx;
        let config = ctx.config();
        let physics = ctx.physics();
        let flags = &config.flags;
        let zp = consts.stored_redshift;
        let zp_consts = ZpConstants::new(config, physics, zp, consts.dz);
        let x_e_mean = prev.mean_x_e();

        // Global ionizing budget at z'
        let mf = physics.mass_function.as_ref();
        let mturn_mcg = physics
            .feedback
            .lyman_werner_threshold(zp, prev.j21_lw.mean(), consts.vcb_norel)
            .max(consts.mturn_m_nofb);
        let nion = mf.unconditional(
            zp,
            consts.ln_m_min,
            consts.ln_m_max,
            &consts.acg_source(consts.mturn_a_nofb),
        );
        let nion_mini = if flags.use_mini_halos {
            mf.unconditional(
                zp,
                consts.ln_m_min,
                consts.ln_m_max,
                &consts.mcg_source(mturn_mcg, consts.mturn_a_nofb),
            )
        } else {
            0.0
        };
        let no_light = nion < NO_LIGHT_THRESHOLD && nion_mini < NO_LIGHT_THRESHOLD;
        let filling_factor = (1.0
            - (consts.ion_eff_gl * nion + consts.ion_eff_gl_mini * nion_mini) / (1.0 - x_e_mean))
            .clamp(0.0, 1.0);
        debug!(
            zp,
            nion, nion_mini, x_e_mean, filling_factor, no_light, "Global source budget"
        );

        let n = ctx.layout().real_len();
        let mut terms = vec![RadiationTerms::default(); n];
        if !no_light {
            let shells = RedshiftShells::new(ctx, zp);
            let factors = SpectralFactors::new(
                physics.radiation.as_ref(),
                &shells,
                config.astro.f_h2_shield,
            );
            let tables = FrequencyTables::build(
                physics.radiation.as_ref(),
                &shells,
                x_e_mean,
                filling_factor,
                config.astro.nu_x_thresh,
            )
            .map_err(|e| e.with_context(consts.error_context()))?;
            let locations: Vec<SampleIndex> = prev
                .x_e
                .as_slice()
                .par_iter()
                .map(|&x| SampleIndex::locate(f64::from(x)))
                .collect();

            let sums = ShellSums {
                spec_index: config.astro.x_ray_spec_index,
                factors: &factors,
                tables: &tables,
                locations: &locations,
            };
            let visit = |shell: &RedshiftShell, sources: ShellSources| {
                sums.add(shell, &sources, &mut terms);
            };
            if flags.use_halo_field {
                self.halo_shells(consts, &shells, inputs, visit)?;
            } else {
                self.grid_shells(consts, &shells, prev, inputs, visit)?;
            }

            terms.par_iter_mut().for_each(|t| {
                t.heat *= zp_consts.xray_prefactor;
                t.ionization *= zp_consts.xray_prefactor;
                t.lya_xray *= zp_consts.xray_prefactor;
                t.lya_star *= zp_consts.lya_star_prefactor;
                t.lya_continuum *= zp_consts.lya_star_prefactor;
                t.lya_injected *= zp_consts.lya_star_prefactor;
                t.lyman_werner *= zp_consts.lw_prefactor;
            });
        }

        let layout = ctx.layout();
        let cells: Vec<CellState> = (0..n)
            .into_par_iter()
            .map(|i| {
                let before = CellState {
                    x_e: f64::from(prev.x_e.data[i]),
                    temp_kinetic: f64::from(prev.temp_kinetic.data[i]),
                    spin_temperature: f64::from(prev.spin_temperature.data[i]),
                    j21_lw: f64::from(prev.j21_lw.data[i]),
                };
                let delta = f64::from(inputs.density.data[i]);
                let after = cell::evolve_cell(&zp_consts, physics, delta, before, &terms[i]);
                if after.spin_temperature.is_finite()
                    && after.temp_kinetic.is_finite()
                    && after.x_e.is_finite()
                {
                    Ok(after)
                } else {
                    Err(ReionError::numerical(
                        consts.error_context().cell(layout.real_coords(i)),
                        "spin temperature",
                        format!("{before:?} -> {after:?} with delta={delta}, {:?}", terms[i]),
                    ))
                }
            })
            .collect::<Result<_>>()?;

        let field = |f: fn(&CellState) -> f64| {
            Field3D::from_vec(layout, cells.par_iter().map(|c| f(c) as f32).collect())
        };
        let state = SpinTemperatureState {
            redshift: zp,
            spin_temperature: field(|c| c.spin_temperature),
            temp_kinetic: field(|c| c.temp_kinetic),
            x_e: field(|c| c.x_e),
            j21_lw: field(|c| c.j21_lw),
        };
        info!(
            z = zp,
            mean_ts = state.mean_spin_temperature(),
            mean_tk = state.mean_temp_kinetic(),
            mean_x_e = state.mean_x_e(),
            mean_j21 = state.j21_lw.mean(),
            "Spin temperature box ready"
        );
        Ok(state)
    }

    /// Star formation of every shell from the smoothed density field
    fn grid_shells<F>(
        &self,
        consts: &StepConstants,
        shells: &RedshiftShells,
        prev: &SpinTemperatureState,
        inputs: &SpinTemperatureInputs<'_>,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(&RedshiftShell, ShellSources),
    {
        let ctx = self.ctx;
        let config = ctx.config();
        let physics = ctx.physics();
        let (astro, flags, user) = (&config.astro, &config.flags, &config.user);
        let mf = physics.mass_function.as_ref();
        let cosmology = physics.cosmology.as_ref();
        let engine = ctx.filter();
        let layout = ctx.layout();
        let n = layout.real_len();
        let kernel = FilterKind::from_selector(config.global.heat_filter).ok_or_else(|| {
            ReionError::config(consts.error_context(), "unknown HEAT_FILTER selector")
        })?;

        let growth_zp = consts.growth;
        let mut density = inputs.density.clone();
        density.clamp(-1.0 + FRACT_FLOAT_ERR as f32, f32::MAX);
        let density_k = engine.forward(&density);
        let vcb = |i: usize| {
            if user.use_relative_velocities && !flags.fix_vcb_avg {
                inputs.vcb.map_or(consts.vcb_norel, |v| f64::from(v.data[i]))
            } else {
                consts.vcb_norel
            }
        };
        let baryon_density = units::rho_crit(&config.cosmo) * config.cosmo.omb;
        let log10_floor = astro.m_turn.log10();

        let mut smoother = ShellSmoother::new(engine);
        let mut smoothed = Field3D::new(layout);
        let mut smoothed_lw = Field3D::new(layout);
        for shell in shells.as_slice() {
            let shell_kernel = (shell.index > 0).then_some(kernel);
            smoother.smooth(&density_k, shell_kernel, shell.radius, &mut smoothed);
            smoothed.clamp(-1.0 + FRACT_FLOAT_ERR as f32, f32::MAX);
            let delta: Vec<f64> = smoothed
                .as_slice()
                .par_iter()
                .map(|&d| f64::from(d) / growth_zp * shell.growth)
                .collect();
            let zpp = shell.zpp;
            trace!(shell = shell.index, zpp, radius = shell.radius, "Shell sources");

            if shell.m_min >= shell.m_max {
                visit(
                    shell,
                    ShellSources {
                        xray: vec![0.0; n],
                        stars: vec![0.0; n],
                        stars_mini: flags.use_mini_halos.then(|| vec![0.0; n]),
                    },
                );
                continue;
            }

            // Stellar mass formed per unit time per unit stellar fraction
            let rate_unit = baryon_density * cosmology.hubble(zpp) / consts.t_star;
            let context = consts.error_context().radius(shell.index);
            let condition = Condition {
                growth: shell.growth,
                ln_mass: shell.m_max.ln(),
                sigma: shell.sigma_max,
                delta: 0.0,
            };
            let ln_limits = (shell.m_min.ln(), shell.m_max.ln());
            let delta_range = smoothed_range(&delta);

            let mut stars: Vec<f64>;
            let mut stars_mini = None;
            if flags.use_mass_dependent_zeta {
                let mturn_acg = if flags.use_mini_halos {
                    physics.feedback.atomic_cooling_threshold(zpp).max(astro.m_turn)
                } else {
                    astro.m_turn
                };
                let acg = consts.acg_stars(mturn_acg);
                let table = TableScope::new(
                    ConditionalTables::build(
                        mf,
                        condition,
                        ln_limits,
                        IntegralKind::Weighted(acg),
                        TableBounds {
                            delta: delta_range,
                            log10_mturn: None,
                        },
                        user.use_interpolation_tables,
                    )
                    .map_err(|e| e.with_context(context))?,
                    shell.index,
                );
                stars = delta
                    .par_iter()
                    .map(|&d| table.eval(d, 0.0).map(|f| (1.0 + d) * f))
                    .collect::<Result<_>>()
                    .map_err(|e: ReionError| e.with_context(context))?;
                drop(table);
                let target = mf.unconditional(zpp, shell.m_min.ln(), consts.ln_m_max, &acg);
                fix_mean(&mut stars, target, rate_unit);

                if flags.use_mini_halos {
                    let lw = Field3D::from_vec(
                        layout,
                        (0..n)
                            .into_par_iter()
                            .map(|i| {
                                let j21 = f64::from(prev.j21_lw.data[i]);
                                let m = physics.feedback.lyman_werner_threshold(zpp, j21, vcb(i));
                                m.max(astro.m_turn).log10() as f32
                            })
                            .collect(),
                    );
                    let lw_k = engine.forward(&lw);
                    smoother.smooth(&lw_k, shell_kernel, shell.radius, &mut smoothed_lw);
                    smoothed_lw.clamp(log10_floor as f32, LOG10_MTURN_MAX as f32);
                    let log10_mturn: Vec<f64> =
                        smoothed_lw.as_slice().par_iter().map(|&m| f64::from(m)).collect();
                    let mean_log10 = log10_mturn.iter().sum::<f64>() / n as f64;

                    let mcg = consts.mcg_stars(10f64.powf(mean_log10), mturn_acg);
                    let table = TableScope::new(
                        ConditionalTables::build(
                            mf,
                            condition,
                            ln_limits,
                            IntegralKind::Weighted(mcg),
                            TableBounds {
                                delta: delta_range,
                                log10_mturn: Some(smoothed_range(&log10_mturn)),
                            },
                            user.use_interpolation_tables,
                        )
                        .map_err(|e| e.with_context(context))?,
                        shell.index,
                    );
                    let mut mini: Vec<f64> = delta
                        .par_iter()
                        .zip(log10_mturn.par_iter())
                        .map(|(&d, &m)| table.eval(d, m).map(|f| (1.0 + d) * f))
                        .collect::<Result<_>>()
                        .map_err(|e: ReionError| e.with_context(context))?;
                    drop(table);
                    let target = mf.unconditional(zpp, shell.m_min.ln(), consts.ln_m_max, &mcg);
                    fix_mean(&mut mini, target, rate_unit);
                    stars_mini = Some(mini);
                }
            } else {
                // Rate of change of the erfc collapsed fraction
                let width_sq = shell.sigma_min.powi(2) - shell.sigma_max.powi(2);
                let dgrowth = cosmology.growth_derivative(zpp);
                let dc = mf.delta_crit();
                let dtdz = shell.dtdz;
                stars = delta
                    .par_iter()
                    .map(|&d| {
                        if width_sq <= 0.0 || d >= 0.99 * dc {
                            return 0.0;
                        }
                        let width = width_sq.sqrt();
                        let x = (dc - d) / (SQRT_2 * shell.growth * width);
                        let dx_dz = -dc * dgrowth / (SQRT_2 * width * shell.growth * shell.growth);
                        let dfcoll_dz = -2.0 / PI.sqrt() * (-x * x).exp() * dx_dz;
                        (1.0 + d) * dfcoll_dz / dtdz
                    })
                    .collect();
                let fcoll = |z: f64| mf.fcoll_unconditional(z, shell.m_min);
                let target = (fcoll(zpp + FCOLL_DZ) - fcoll(zpp - FCOLL_DZ)) / (2.0 * FCOLL_DZ) / dtdz;
                fix_mean(&mut stars, target, astro.f_star10 * baryon_density);
            }

            let (l_x, l_x_mini) = (astro.l_x, astro.l_x_mini);
            let xray = match &stars_mini {
                Some(mini) => stars
                    .par_iter()
                    .zip(mini.par_iter())
                    .map(|(&s, &m)| cell::xray_luminosity(s, l_x) + cell::xray_luminosity(m, l_x_mini))
                    .collect(),
                None => stars.par_iter().map(|&s| cell::xray_luminosity(s, l_x)).collect(),
            };
            visit(
                shell,
                ShellSources {
                    xray,
                    stars,
                    stars_mini,
                },
            );
        }
        Ok(())
    }

    /// Star formation and X-ray output of every shell from the halo box
    fn halo_shells<F>(
        &self,
        consts: &StepConstants,
        shells: &RedshiftShells,
        inputs: &SpinTemperatureInputs<'_>,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(&RedshiftShell, ShellSources),
    {
        let halo_box = inputs.halo_box.ok_or_else(|| {
            ReionError::config(consts.error_context(), "a halo box is required by the enabled flags")
        })?;
        let ctx = self.ctx;
        let config = ctx.config();
        let physics = ctx.physics();
        let mf = physics.mass_function.as_ref();
        let mini = config.flags.use_mini_halos;
        let engine = ctx.filter();
        let layout = ctx.layout();
        let zp = consts.stored_redshift;

        let xray_k = engine.forward(&halo_box.xray);
        let sfr_k = engine.forward(&halo_box.sfr);
        let sfr_mini_k = mini.then(|| engine.forward(&halo_box.sfr_mini));

        // Growth of the global star formation rate density from z'' to z'
        let acg = consts.acg_stars(consts.mturn_a_nofb);
        let mcg = consts.mcg_stars(consts.mturn_m_nofb, consts.mturn_a_nofb);
        let sfrd = |z: f64, source: &SourceModel| {
            let m_min = physics.feedback.minimum_source_mass(z);
            mf.unconditional(z, m_min.ln(), consts.ln_m_max, source) * physics.cosmology.hubble(z)
        };
        let ratio = |z: f64, source: &SourceModel| {
            let now = sfrd(zp, source);
            if now > 0.0 {
                sfrd(z, source) / now
            } else {
                0.0
            }
        };

        let mut smoother = ShellSmoother::new(engine);
        let mut smoothed = Field3D::new(layout);
        let mut read = |spectrum: &SpectralField, shell: &RedshiftShell, scale: f64| -> Vec<f64> {
            let kernel = FilterKind::Annulus {
                inner: shell.inner_radius,
            };
            smoother.smooth(spectrum, Some(kernel), shell.radius, &mut smoothed);
            smoothed
                .as_slice()
                .par_iter()
                .map(|&v| f64::from(v).max(0.0) * scale)
                .collect()
        };

        for shell in shells.as_slice() {
            let scale = ratio(shell.zpp, &acg);
            let scale_mini = if mini { ratio(shell.zpp, &mcg) } else { 0.0 };
            trace!(shell = shell.index, zpp = shell.zpp, scale, scale_mini, "Shell halo sources");
            let xray = read(&xray_k, shell, scale * LX_UNIT);
            let stars = read(&sfr_k, shell, scale);
            let stars_mini = sfr_mini_k.as_ref().map(|k| read(k, shell, scale_mini));
            visit(
                shell,
                ShellSources {
                    xray,
                    stars,
                    stars_mini,
                },
            );
        }
        Ok(())
    }
}

/// Shell-independent inputs of the per-cell radiation sums
struct ShellSums<'s> {
    spec_index: f64,
    factors: &'s SpectralFactors,
    tables: &'s FrequencyTables,
    locations: &'s [SampleIndex],
}

impl ShellSums<'_> {
    /// Add one shell's sources to every cell's sums
    ///
    /// Sums stay in source units; the caller applies the unit prefactors once.
    fn add(&self, shell: &RedshiftShell, sources: &ShellSources, terms: &mut [RadiationTerms]) {
        let span = (shell.dzpp * shell.dtdz).abs();
        let xray_weight = span * (1.0 + shell.zpp).powf(-self.spec_index);
        let w2 = self.factors.pop2[shell.index];
        let w3 = self.factors.pop3[shell.index];
        let tables = self.tables;
        let locations = self.locations;
        terms.par_iter_mut().enumerate().for_each(|(i, t)| {
            let x = tables.at(shell.index, locations[i]);
            let lx = sources.xray[i] * xray_weight;
            let stars = sources.stars[i] * span;
            let mini = sources.stars_mini.as_ref().map_or(0.0, |m| m[i] * span);
            *t += RadiationTerms {
                heat: lx * x.heat,
                ionization: lx * x.ionization,
                lya_xray: lx * x.lya,
                lya_star: stars * w2.lya + mini * w3.lya,
                lya_continuum: stars * w2.continuum + mini * w3.continuum,
                lya_injected: stars * w2.injected + mini * w3.injected,
                lyman_werner: stars * w2.lyman_werner + mini * w3.lyman_werner,
            };
        });
    }
}

/// Rescale `values` so their mean is `target`, then multiply by `unit`
fn fix_mean(values: &mut [f64], target: f64, unit: f64) {
    let mean = values.par_iter().sum::<f64>() / values.len().max(1) as f64;
    let fix = if mean > 0.0 { target / mean } else { 0.0 };
    values.par_iter_mut().for_each(|v| *v *= fix * unit);
}

/// Smallest and largest value of `values`
fn smoothed_range(values: &[f64]) -> (f64, f64) {
    values
        .par_iter()
        .fold(
            || (f64::INFINITY, f64::NEG_INFINITY),
            |(lo, hi), &v| (lo.min(v), hi.max(v)),
        )
        .reduce(
            || (f64::INFINITY, f64::NEG_INFINITY),
            |a, b| (a.0.min(b.0), a.1.max(b.1)),
        )
}
