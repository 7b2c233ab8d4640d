//! Gridded source properties of a halo population
//!
//! The halo box collects, per cell, the halo mass, stellar mass, star
//! formation rate, ionizing photon output and X-ray luminosity that drive
//! both radiation solvers. Two paths produce it:
//!
//! - **Fixed grids**: expectations from conditional mass function
//!   integrals at the cell density ([`fixed`]).
//! - **Catalog**: each halo's properties are drawn with
//!   [`HaloSampler`] and summed into its cell. Shards of the catalog are
//!   summed into private grids and merged afterwards.
//!
//! Every field is a density (per comoving Mpc³). Counts stay per cell.

mod catalog;
mod fixed;
mod properties;

pub use catalog::{Halo, HaloCatalog};
pub use properties::{lx_on_sfr, metallicity, HaloProperties, HaloSampler};

use crate::constants::StepConstants;
use crate::context::SimulationContext;
use crate::error::{ReionError, Result};
use crate::grid::{Field3D, GridLayout};
use crate::turnover::{FeedbackFields, TurnoverAverages, TurnoverModel};
use rayon::prelude::*;
use tracing::{debug, info};

/// Source property grids of one redshift
#[derive(Debug, Clone, PartialEq)]
pub struct HaloBoxFields {
    pub redshift: f64,
    /// Msun Mpc⁻³
    pub halo_mass: Field3D,
    pub stellar_mass: Field3D,
    pub stellar_mass_mini: Field3D,
    /// Msun s⁻¹ Mpc⁻³
    pub sfr: Field3D,
    pub sfr_mini: Field3D,
    /// SFR weighted by escape fraction and photons per baryon
    pub fescweighted_sfr: Field3D,
    /// Escaping ionizing photons per baryon times stellar mass, per Mpc³
    pub n_ion: Field3D,
    /// 1e38 erg s⁻¹ Mpc⁻³
    pub xray: Field3D,
    /// Halos per cell
    pub count: Vec<u32>,
    /// Cell-weighted mean log10 turnovers
    pub turnovers: TurnoverAverages,
    /// Box means of the fields; turnovers are halo means in catalog mode
    pub averages: HaloProperties,
}

impl HaloBoxFields {
    /// All-zero fields
    pub fn empty(layout: GridLayout, redshift: f64) -> Self {
        let zero = Field3D::new(layout);
        Self {
            redshift,
            halo_mass: zero.clone(),
            stellar_mass: zero.clone(),
            stellar_mass_mini: zero.clone(),
            sfr: zero.clone(),
            sfr_mini: zero.clone(),
            fescweighted_sfr: zero.clone(),
            n_ion: zero.clone(),
            xray: zero,
            count: vec![0; layout.real_len()],
            turnovers: TurnoverAverages::default(),
            averages: HaloProperties::default(),
        }
    }

    /// The eight density fields, in [`HaloProperties::densities`] order
    pub fn grids(&self) -> [&Field3D; 8] {
        [
            &self.halo_mass,
            &self.stellar_mass,
            &self.stellar_mass_mini,
            &self.sfr,
            &self.sfr_mini,
            &self.fescweighted_sfr,
            &self.n_ion,
            &self.xray,
        ]
    }

    fn grids_mut(&mut self) -> [&mut Field3D; 8] {
        [
            &mut self.halo_mass,
            &mut self.stellar_mass,
            &mut self.stellar_mass_mini,
            &mut self.sfr,
            &mut self.sfr_mini,
            &mut self.fescweighted_sfr,
            &mut self.n_ion,
            &mut self.xray,
        ]
    }

    fn add_to_cell(&mut self, index: usize, props: &HaloProperties) {
        for (field, v) in self.grids_mut().into_iter().zip(props.densities()) {
            field.data[index] += v as f32;
        }
    }

    /// Add grids and counts of `other`
    fn accumulate(&mut self, other: &Self) {
        for (field, theirs) in self.grids_mut().into_iter().zip(other.grids()) {
            field.accumulate(theirs);
        }
        self.count
            .par_iter_mut()
            .zip(other.count.par_iter())
            .for_each(|(a, b)| *a += b);
    }

    /// Halos on the grid
    pub fn total_count(&self) -> u64 {
        self.count.iter().map(|&c| u64::from(c)).sum()
    }
}

/// Builds [`HaloBoxFields`] for one step
#[derive(Debug, Clone, Copy)]
pub struct HaloBoxAggregator<'a> {
    ctx: &'a SimulationContext,
    consts: &'a StepConstants,
}

impl<'a> HaloBoxAggregator<'a> {
    pub fn new(ctx: &'a SimulationContext, consts: &'a StepConstants) -> Self {
        Self { ctx, consts }
    }

    /// Grid the sources of the step
    ///
    /// # Arguments
    ///
    /// * `density` - Evolved density contrast at the step redshift
    /// * `catalog` - Perturbed halos, required unless fixed grids are used
    /// * `feedback` - Fields of earlier steps setting the turnover masses
    ///
    /// # Errors
    ///
    /// [`ReionError::Config`] when a catalog is needed and missing, or when
    /// the feedback fields give an invalid turnover.
    pub fn compute(
        &self,
        density: &Field3D,
        catalog: Option<&HaloCatalog>,
        feedback: FeedbackFields<'_>,
    ) -> Result<HaloBoxFields> {
        let config = self.ctx.config();
        let model = TurnoverModel::new(self.ctx, self.consts, feedback);
        let m_range = (self.consts.m_min, config.global.m_max_integral);

        let fields = if config.flags.fixed_halo_grids {
            fixed::fixed_grids(self.ctx, self.consts, density, &model, m_range)?
        } else {
            let catalog = catalog.ok_or_else(|| {
                ReionError::config(
                    self.consts.error_context(),
                    "a halo catalog is required unless fixed halo grids are enabled",
                )
            })?;
            self.sum_catalog(density, catalog, &model, m_range)?
        };

        info!(
            z = self.consts.redshift,
            halos = fields.total_count(),
            n_ion = fields.averages.n_ion,
            sfr = fields.averages.sfr,
            "Halo box ready"
        );
        Ok(fields)
    }

    fn sum_catalog(
        &self,
        density: &Field3D,
        catalog: &HaloCatalog,
        model: &TurnoverModel<'_>,
        (m_min, m_max): (f64, f64),
    ) -> Result<HaloBoxFields> {
        let (ctx, consts) = (self.ctx, self.consts);
        let config = ctx.config();
        let user = &config.user;
        let layout = ctx.layout();
        let sampler = HaloSampler::new(ctx, consts);
        let shard = catalog.len().div_ceil(user.n_threads.max(1)).max(1);

        let mut fields = ctx.install(|| {
            catalog
                .as_slice()
                .par_chunks(shard)
                .map(|halos| -> Result<HaloBoxFields> {
                    let mut partial = HaloBoxFields::empty(layout, consts.redshift);
                    for halo in halos.iter().filter(|h| !h.is_excluded()) {
                        let [x, y, z] = layout.cell_of_position(halo.position);
                        let index = layout.real_index(x, y, z);
                        let props = sampler
                            .sample(halo, &model.at(index)?)
                            .map_err(|e| e.with_context(consts.error_context().cell([x, y, z])))?;
                        partial.add_to_cell(index, &props);
                        partial.count[index] += 1;
                        partial.averages += props;
                    }
                    Ok(partial)
                })
                .try_reduce(
                    || HaloBoxFields::empty(layout, consts.redshift),
                    |mut a, b| {
                        a.accumulate(&b);
                        a.averages += b.averages;
                        Ok(a)
                    },
                )
        })?;

        let n_halos = catalog.len() - catalog.n_excluded();
        debug!(
            n_halos,
            n_cut = catalog.n_excluded(),
            "Summed halo catalog"
        );
        let cell_volume = user.cell_volume();
        for field in fields.grids_mut() {
            field.scale(1.0 / cell_volume);
        }
        let sums = fields.averages;
        let volume = user.volume();
        let mut averages = HaloProperties::from_densities(sums.densities().map(|v| v / volume));
        if n_halos > 0 {
            let n = n_halos as f64;
            averages.metallicity = sums.metallicity / n;
            averages.m_turn_acg = sums.m_turn_acg / n;
            averages.m_turn_mcg = sums.m_turn_mcg / n;
            averages.m_turn_reion = sums.m_turn_reion / n;
        } else {
            averages.m_turn_acg = consts.mturn_a_nofb;
            averages.m_turn_mcg = consts.mturn_m_nofb;
        }

        if user.avg_below_sampler && m_min < user.sampler_min_mass {
            let below =
                fixed::fixed_grids(ctx, consts, density, model, (m_min, user.sampler_min_mass))?;
            debug!(
                m_min,
                m_max = user.sampler_min_mass,
                n_ion = below.averages.n_ion,
                "Added sources below the sampler"
            );
            fields.accumulate(&below);
            let sum: [f64; 8] = std::array::from_fn(|k| {
                averages.densities()[k] + below.averages.densities()[k]
            });
            averages = HaloProperties {
                metallicity: averages.metallicity,
                m_turn_acg: averages.m_turn_acg,
                m_turn_mcg: averages.m_turn_mcg,
                m_turn_reion: averages.m_turn_reion,
                ..HaloProperties::from_densities(sum)
            };
            fields.turnovers = below.turnovers;
        } else {
            fields.turnovers = model.averages()?;
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            let expected = fixed::box_averages(
                ctx,
                consts,
                (user.sampler_min_mass.max(m_min), m_max),
                averages.m_turn_acg,
                averages.m_turn_mcg,
            );
            debug!(
                expected_n_ion = expected.n_ion,
                box_n_ion = averages.n_ion,
                expected_sfr = expected.sfr,
                box_sfr = averages.sfr,
                "Catalog against unconditional expectation"
            );
        }
        fields.averages = averages;
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::error::ErrorKind;
    use approx::assert_relative_eq;

    fn catalog_config() -> SimulationConfig {
        let mut config = SimulationConfig::small_box(4, 20.0);
        config.flags.use_halo_field = true;
        config.flags.fixed_halo_grids = false;
        config
    }

    #[test]
    fn test_missing_catalog_is_config_error() {
        let ctx = SimulationContext::new(catalog_config()).unwrap();
        let consts = StepConstants::new(&ctx, 8.0, 0.0).unwrap();
        let density = Field3D::new(ctx.layout());
        let err = HaloBoxAggregator::new(&ctx, &consts)
            .compute(&density, None, FeedbackFields::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_halos_land_in_their_cells() {
        let mut config = catalog_config();
        config.user.n_threads = 2;
        let ctx = SimulationContext::new(config).unwrap();
        let consts = StepConstants::new(&ctx, 8.0, 0.0).unwrap();
        let density = Field3D::new(ctx.layout());
        let catalog = HaloCatalog::new(
            8.0,
            vec![
                Halo::new([1.0, 1.0, 1.0], 1e11),
                Halo::new([2.0, 3.0, 4.0], 2e11),
                Halo::new([16.0, 1.0, 1.0], 1e10),
                // wraps back into the first cell
                Halo::new([21.0, 1.0, 1.0], 1e10),
            ],
        );
        let fields = HaloBoxAggregator::new(&ctx, &consts)
            .compute(&density, Some(&catalog), FeedbackFields::default())
            .unwrap();

        let layout = ctx.layout();
        let origin = layout.real_index(0, 0, 0);
        let far = layout.real_index(3, 0, 0);
        assert_eq!(fields.count[origin], 3);
        assert_eq!(fields.count[far], 1);
        assert_eq!(fields.total_count(), 4);

        let cell_volume = ctx.config().user.cell_volume();
        let mass = f64::from(fields.halo_mass.data[origin]) * cell_volume;
        assert_relative_eq!(mass, 3.1e11, max_relative = 1e-6);
        let volume = ctx.config().user.volume();
        assert_relative_eq!(fields.averages.halo_mass, 3.3e11 / volume, max_relative = 1e-9);
        assert_eq!(fields.averages.m_turn_acg, consts.mturn_a_nofb);
    }

    #[test]
    fn test_sharding_does_not_change_sums() {
        let halos: Vec<Halo> = (0..40)
            .map(|i| {
                let x = f64::from(i % 4) * 5.0 + 0.5;
                let mut h = Halo::new([x, 2.5, 7.5], 1e9 * f64::from(i + 1));
                h.star_rng = (f64::from(i) * 0.37).sin() as f32;
                h
            })
            .collect();
        let catalog = HaloCatalog::new(8.0, halos);
        let run = |threads| {
            let mut config = catalog_config();
            config.user.n_threads = threads;
            let ctx = SimulationContext::new(config).unwrap();
            let consts = StepConstants::new(&ctx, 8.0, 0.0).unwrap();
            let density = Field3D::new(ctx.layout());
            HaloBoxAggregator::new(&ctx, &consts)
                .compute(&density, Some(&catalog), FeedbackFields::default())
                .unwrap()
        };
        let serial = run(1);
        let sharded = run(3);
        assert_eq!(serial.count, sharded.count);
        for (a, b) in serial.grids().into_iter().zip(sharded.grids()) {
            for (x, y) in a.data.iter().zip(&b.data) {
                assert_relative_eq!(*x, *y, max_relative = 1e-5);
            }
        }
    }

    #[test]
    fn test_excluded_halos_are_skipped() {
        let mut config = catalog_config();
        config.flags.use_ts_fluct = true;
        let ctx = SimulationContext::new(config).unwrap();
        let consts = StepConstants::new(&ctx, 8.0, 0.0).unwrap();
        let density = Field3D::new(ctx.layout());

        let kept: Vec<Halo> = (0..12)
            .map(|i| {
                let f = f64::from(i);
                let mut h = Halo::new([(f * 3.7) % 20.0, (f * 1.3) % 20.0, 4.0], 2e9 * (1.0 + f));
                h.star_rng = (f * 0.61).sin() as f32;
                h.sfr_rng = (f * 0.29).cos() as f32;
                h.xray_rng = (f * 0.83).sin() as f32;
                h
            })
            .collect();
        let mut with_cut = Vec::new();
        for (i, halo) in kept.iter().enumerate() {
            if i % 3 == 0 {
                let mut cut = Halo::new(halo.position, 0.0);
                cut.star_rng = 1.5;
                with_cut.push(cut);
            }
            with_cut.push(*halo);
        }
        let with_cut = HaloCatalog::new(8.0, with_cut);
        assert_eq!(with_cut.n_excluded(), 4);

        let aggregator = HaloBoxAggregator::new(&ctx, &consts);
        let full = aggregator
            .compute(&density, Some(&with_cut), FeedbackFields::default())
            .unwrap();
        let clean = aggregator
            .compute(&density, Some(&HaloCatalog::new(8.0, kept)), FeedbackFields::default())
            .unwrap();

        assert_eq!(full.count, clean.count);
        assert_eq!(full.total_count(), 12);
        for (a, b) in full.grids().into_iter().zip(clean.grids()) {
            assert_eq!(a, b);
        }
        assert_eq!(full.averages, clean.averages);
    }

    #[test]
    fn test_empty_catalog_falls_back_to_floors() {
        let ctx = SimulationContext::new(catalog_config()).unwrap();
        let consts = StepConstants::new(&ctx, 8.0, 0.0).unwrap();
        let density = Field3D::new(ctx.layout());
        let fields = HaloBoxAggregator::new(&ctx, &consts)
            .compute(&density, Some(&HaloCatalog::default()), FeedbackFields::default())
            .unwrap();
        assert_eq!(fields.total_count(), 0);
        assert_eq!(fields.averages.m_turn_mcg, consts.mturn_m_nofb);
        assert_eq!(fields.averages.m_turn_reion, 0.0);
        assert_eq!(fields.n_ion.mean(), 0.0);
    }

    #[test]
    fn test_below_sampler_sources_are_added() {
        let mut config = catalog_config();
        config.user.avg_below_sampler = true;
        config.user.sampler_min_mass = 1e10;
        let ctx = SimulationContext::new(config).unwrap();
        let consts = StepConstants::new(&ctx, 8.0, 0.0).unwrap();
        assert!(consts.m_min < 1e10);
        let density = Field3D::new(ctx.layout());
        let fields = HaloBoxAggregator::new(&ctx, &consts)
            .compute(&density, Some(&HaloCatalog::default()), FeedbackFields::default())
            .unwrap();
        assert!(fields.n_ion.mean() > 0.0);
        assert!(fields.total_count() > 0);
    }
}
