//! Sequential redshift driver for coeval boxes
//!
//! [`CoevalSimulation`] walks a descending list of redshifts and, at each
//! one, runs the step pipeline:
//!
//! 1. move the halo catalog to the step redshift ([`PerturbationMapper`]);
//! 2. grid the sources ([`HaloBoxAggregator`]) when a halo field is used;
//! 3. update the spin temperature ([`SpinTemperatureSolver`]) when it fluctuates;
//! 4. find the ionized regions ([`IonizationFieldSolver`]).
//!
//! Each step reads the states of the step before it. With fluctuating spin
//! temperatures the chain starts at `Z_HEAT_MAX` and descends by
//! `ZPRIME_STEP_FACTOR`, with the requested redshifts merged in.

use crate::constants::StepConstants;
use crate::context::SimulationContext;
use crate::error::{ErrorContext, ReionError, Result};
use crate::grid::Field3D;
use crate::halo_box::{HaloBoxAggregator, HaloBoxFields, HaloCatalog};
use crate::ionization::{IonizationFieldSolver, IonizationInputs, IonizationState};
use crate::perturb_halo::{InitialConditions, PerturbationMapper};
use crate::spin_temperature::{SpinTemperatureInputs, SpinTemperatureSolver, SpinTemperatureState};
use crate::turnover::FeedbackFields;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Redshifts closer than this are the same step
const REDSHIFT_TOLERANCE: f64 = 1e-4;

/// Global quantities of one finished step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub redshift: f64,
    /// Volume-averaged neutral hydrogen fraction
    pub global_xh: f64,
    /// Mean kinetic temperature of the gas (K)
    pub mean_temp_kinetic: f64,
    /// Mean free-electron fraction of the neutral IGM, only with fluctuating spin temperature
    pub mean_x_e: Option<f64>,
}

/// Coeval boxes evolved from `Z_HEAT_MAX` (or the first requested redshift) downwards
#[derive(Debug)]
pub struct CoevalSimulation<'a> {
    ctx: &'a SimulationContext,
    ics: InitialConditions,
    /// Linear density contrast extrapolated to z = 0
    linear_density: Field3D,
    /// Halos at their initial positions
    halos: Option<HaloCatalog>,
    ionization: IonizationState,
    spin: Option<SpinTemperatureState>,
    halo_box: Option<HaloBoxFields>,
    prev_density: Option<Field3D>,
    prev_redshift: f64,
    summaries: Vec<StepSummary>,
}

impl<'a> CoevalSimulation<'a> {
    /// Start a run from the initial conditions
    ///
    /// # Errors
    ///
    /// [`ReionError::Config`] when `linear_density` does not match the
    /// configured low-resolution layout.
    pub fn new(
        ctx: &'a SimulationContext,
        ics: InitialConditions,
        linear_density: Field3D,
    ) -> Result<Self> {
        let layout = ctx.layout();
        if linear_density.layout != layout {
            return Err(ReionError::config(
                ErrorContext::default(),
                "linear density grid does not match the configured layout",
            ));
        }
        Ok(Self {
            ctx,
            ics,
            linear_density,
            halos: None,
            ionization: IonizationState::initial(layout),
            spin: None,
            halo_box: None,
            prev_density: None,
            prev_redshift: 0.0,
            summaries: Vec::new(),
        })
    }

    /// Use `halos`, at their initial positions, as the source catalog
    #[must_use]
    pub fn with_halos(mut self, halos: HaloCatalog) -> Self {
        self.halos = Some(halos);
        self
    }

    /// Redshifts a run ending at `requested` steps through, highest first
    pub fn redshift_chain(&self, requested: &[f64]) -> Vec<f64> {
        let global = &self.ctx.config().global;
        let mut chain: Vec<f64> = requested.iter().copied().filter(|z| z.is_finite()).collect();
        let lowest = chain.iter().copied().fold(f64::INFINITY, f64::min);
        if self.ctx.config().flags.use_ts_fluct && lowest.is_finite() {
            let mut z = global.z_heat_max;
            while z > lowest {
                chain.push(z);
                z = (1.0 + z) / global.zprime_step_factor - 1.0;
            }
        }
        chain.sort_by(|a, b| b.total_cmp(a));
        chain.dedup_by(|a, b| (*a - *b).abs() < REDSHIFT_TOLERANCE);
        chain
    }

    /// Run every step of [`Self::redshift_chain`]
    ///
    /// # Errors
    ///
    /// The first failing step aborts the run; its error carries the step
    /// redshift and, where known, the radius and cell.
    pub fn run(&mut self, requested: &[f64]) -> Result<Vec<StepSummary>> {
        let chain = self.redshift_chain(requested);
        info!(
            steps = chain.len(),
            z_start = chain.first().copied().unwrap_or_default(),
            z_end = chain.last().copied().unwrap_or_default(),
            "Starting coeval run"
        );
        let mut summaries = Vec::with_capacity(chain.len());
        for z in chain {
            summaries.push(self.step(z)?);
        }
        Ok(summaries)
    }

    /// Advance to `redshift`, below the last step
    ///
    /// # Errors
    ///
    /// [`ReionError::Config`] when `redshift` does not descend, otherwise
    /// whatever the step's solvers return.
    pub fn step(&mut self, redshift: f64) -> Result<StepSummary> {
        let ctx = self.ctx;
        let flags = &ctx.config().flags;
        let prev_redshift = self.prev_redshift;
        if prev_redshift > 0.0 && redshift >= prev_redshift {
            return Err(ReionError::config(
                ErrorContext::at(redshift),
                format!("redshifts must descend, previous step was z={prev_redshift}"),
            ));
        }

        let result = self.advance(redshift, prev_redshift);
        match &result {
            Ok(summary) => {
                info!(
                    z = summary.redshift,
                    xh = summary.global_xh,
                    tk = summary.mean_temp_kinetic,
                    x_e = ?summary.mean_x_e,
                    ts_fluct = flags.use_ts_fluct,
                    "Step finished"
                );
                self.summaries.push(*summary);
            }
            Err(err) => warn!(z = redshift, kind = ?err.kind(), "{}", err.user_message()),
        }
        result
    }

    fn advance(&mut self, redshift: f64, prev_redshift: f64) -> Result<StepSummary> {
        let ctx = self.ctx;
        let flags = &ctx.config().flags;
        let consts = StepConstants::new(ctx, redshift, prev_redshift)?;

        let mut density = self.linear_density.clone();
        density.scale(consts.growth);
        debug!(z = redshift, growth = consts.growth, "Evolved density");

        let halo_box = if flags.use_halo_field {
            let catalog = self
                .halos
                .as_ref()
                .filter(|_| !flags.fixed_halo_grids)
                .map(|halos| PerturbationMapper::new(ctx).perturb(halos, &self.ics, redshift))
                .transpose()?;
            let feedback = FeedbackFields {
                j21_lw: self.spin.as_ref().map(|s| &s.j21_lw),
                gamma12: Some(&self.ionization.gamma12),
                z_reion: Some(&self.ionization.z_reion),
                vcb: self.ics.vcb.as_ref(),
            };
            Some(HaloBoxAggregator::new(ctx, &consts).compute(&density, catalog.as_ref(), feedback)?)
        } else {
            None
        };

        let spin = if flags.use_ts_fluct {
            let inputs = SpinTemperatureInputs {
                density: &density,
                halo_box: halo_box.as_ref(),
                vcb: self.ics.vcb.as_ref(),
            };
            Some(SpinTemperatureSolver::new(ctx).compute(&consts, self.spin.as_ref(), &inputs)?)
        } else {
            None
        };

        let inputs = IonizationInputs {
            density: &density,
            prev_density: self.prev_density.as_ref(),
            spin: spin.as_ref(),
            halo_box: halo_box.as_ref(),
            vcb: self.ics.vcb.as_ref(),
        };
        let ionization = IonizationFieldSolver::new(ctx).compute(&consts, &self.ionization, &inputs)?;

        let summary = StepSummary {
            redshift,
            global_xh: ionization.global_xh(),
            mean_temp_kinetic: ionization.temp_kinetic.mean(),
            mean_x_e: spin.as_ref().map(SpinTemperatureState::mean_x_e),
        };
        self.ionization = ionization;
        self.spin = spin;
        self.halo_box = halo_box;
        self.prev_density = Some(density);
        self.prev_redshift = redshift;
        Ok(summary)
    }

    pub fn ionization(&self) -> &IonizationState {
        &self.ionization
    }

    pub fn spin_temperature(&self) -> Option<&SpinTemperatureState> {
        self.spin.as_ref()
    }

    /// Source grids of the last step, with a halo field
    pub fn halo_box(&self) -> Option<&HaloBoxFields> {
        self.halo_box.as_ref()
    }

    /// Summaries of every finished step, in order
    pub fn summaries(&self) -> &[StepSummary] {
        &self.summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::error::ErrorKind;

    fn context(ts_fluct: bool) -> SimulationContext {
        let mut config = SimulationConfig::small_box(8, 32.0);
        config.flags.use_ts_fluct = ts_fluct;
        config.global.num_filter_steps_for_ts = 6;
        config.global.z_heat_max = 20.0;
        config.global.zprime_step_factor = 1.2;
        SimulationContext::new(config).unwrap()
    }

    fn simulation(ctx: &SimulationContext) -> CoevalSimulation<'_> {
        let layout = ctx.layout();
        let mut density = Field3D::new(layout);
        density.set(4, 4, 4, 2.0);
        density.set(1, 2, 3, -0.6);
        CoevalSimulation::new(ctx, InitialConditions::at_rest(layout), density).unwrap()
    }

    #[test]
    fn test_chain_without_spin_keeps_requested() {
        let ctx = context(false);
        let sim = simulation(&ctx);
        assert_eq!(sim.redshift_chain(&[8.0, 10.0, 9.0, 10.0]), vec![10.0, 9.0, 8.0]);
    }

    #[test]
    fn test_chain_with_spin_starts_at_heating_redshift() {
        let ctx = context(true);
        let sim = simulation(&ctx);
        let chain = sim.redshift_chain(&[10.0]);
        assert_eq!(chain[0], 20.0);
        assert_eq!(*chain.last().unwrap(), 10.0);
        for pair in chain.windows(2) {
            assert!(pair[0] > pair[1]);
            assert!((1.0 + pair[0]) / (1.0 + pair[1]) <= 1.2 + 1e-9);
        }
    }

    #[test]
    fn test_mismatched_density_rejected() {
        let ctx = context(false);
        let layout = crate::grid::GridLayout::cubic(4, 32.0);
        let err = CoevalSimulation::new(&ctx, InitialConditions::at_rest(ctx.layout()), Field3D::new(layout))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_steps_must_descend() {
        let ctx = context(false);
        let mut sim = simulation(&ctx);
        sim.step(9.0).unwrap();
        let err = sim.step(9.5).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(sim.summaries().len(), 1);
    }

    #[test]
    fn test_run_with_spin_temperature_summaries() {
        let ctx = context(true);
        let mut sim = simulation(&ctx);
        let summaries = sim.run(&[12.0]).unwrap();
        assert_eq!(summaries.len(), sim.redshift_chain(&[12.0]).len());
        assert!(summaries.iter().all(|s| s.mean_x_e.is_some()));
        assert!(summaries
            .iter()
            .all(|s| (0.0..=1.0).contains(&s.global_xh) && s.mean_temp_kinetic > 0.0));
        assert!(sim.spin_temperature().is_some());
        assert_eq!(sim.summaries(), summaries.as_slice());
    }
}
