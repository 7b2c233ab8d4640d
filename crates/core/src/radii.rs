//! Filter radius sequence of the excursion-set loop
//!
//! Radii are generated upwards from the minimum by a fixed ratio until the
//! maximum is reached; the last step is shortened so the maximum is hit
//! exactly. The solvers then walk the sequence from the largest radius down.

use crate::config::L_FACTOR;
use crate::constants::StepConstants;
use crate::context::SimulationContext;
use crate::physics::units::FRACT_FLOAT_ERR;
use crate::physics::Cosmology;
use tracing::debug;

/// One filtering scale
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadiusSpec {
    /// Position in the ascending sequence; 0 is the smallest radius
    pub index: usize,
    /// Comoving radius (Mpc)
    pub radius: f64,
    /// Mass enclosed at mean density (Msun)
    pub m_max: f64,
    pub ln_m_max: f64,
    /// σ(m_max) at `z = 0`
    pub sigma_maxmass: f64,
}

/// Ascending list of filter radii for one step
#[derive(Debug, Clone, PartialEq)]
pub struct RadiusScheduler {
    specs: Vec<RadiusSpec>,
}

impl RadiusScheduler {
    /// Radii from `r_min` to `r_max` spaced by `factor`
    ///
    /// # Panics
    ///
    /// Panics unless `0 < r_min <= r_max` and `factor > 1`
    pub fn new(cosmology: &dyn Cosmology, r_min: f64, r_max: f64, factor: f64) -> Self {
        assert!(
            r_min > 0.0 && r_max >= r_min && factor > 1.0,
            "Radius range must be positive and increasing"
        );
        let n_max = ((r_max / r_min).ln() / factor.ln()).ceil() as usize + 1;
        let mut specs = Vec::with_capacity(n_max);
        for index in 0..n_max {
            let mut radius = r_min * factor.powi(index as i32);
            let last = radius > r_max - FRACT_FLOAT_ERR;
            if last {
                radius = r_max;
            }
            let m_max = cosmology.mass_from_radius(radius);
            specs.push(RadiusSpec {
                index,
                radius,
                m_max,
                ln_m_max: m_max.ln(),
                sigma_maxmass: cosmology.sigma(m_max.ln()),
            });
            if last {
                break;
            }
        }
        Self { specs }
    }

    /// Radii of the ionization loop
    ///
    /// The largest radius is the bubble limit or the box, the smallest the
    /// bubble minimum or the cell.
    pub fn for_ionization(ctx: &SimulationContext, consts: &StepConstants) -> Self {
        let config = ctx.config();
        let r_max = config.astro.r_bubble_max.min(L_FACTOR * config.user.box_len);
        let cell_factor = if config.flags.use_halo_field
            && config.global.find_bubble_algorithm == 2
            && consts.pixel_length < 1.0
        {
            1.0
        } else {
            L_FACTOR
        };
        let r_min = config
            .global
            .r_bubble_min
            .max(cell_factor * consts.pixel_length)
            .min(r_max);
        let scheduler = Self::new(
            ctx.physics().cosmology.as_ref(),
            r_min,
            r_max,
            config.global.delta_r_hii_factor,
        );
        debug!(
            n_radii = scheduler.len(),
            r_min,
            r_max = scheduler.max_radius(),
            "Radius sequence set"
        );
        scheduler
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Smallest radius (Mpc)
    pub fn min_radius(&self) -> f64 {
        self.specs.first().map_or(0.0, |s| s.radius)
    }

    /// Largest radius (Mpc)
    pub fn max_radius(&self) -> f64 {
        self.specs.last().map_or(0.0, |s| s.radius)
    }

    /// Specs in ascending radius
    pub fn as_slice(&self) -> &[RadiusSpec] {
        &self.specs
    }

    /// Specs from the largest radius to the smallest
    pub fn descending(&self) -> impl Iterator<Item = &RadiusSpec> {
        self.specs.iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CosmoParams;
    use crate::physics::FlatLcdm;

    #[test]
    fn test_sequence_hits_both_ends() {
        let cosmo = FlatLcdm::new(CosmoParams::default());
        for (r_min, r_max, factor) in [
            (0.62, 15.0, 1.1),
            (1.0, 50.0, 1.3),
            (2.0, 2.05, 1.1),
            (0.5, 0.5, 1.1),
            (1.0, 1.1 * 1.1 * 1.1, 1.1),
        ] {
            let radii = RadiusScheduler::new(&cosmo, r_min, r_max, factor);
            let desc: Vec<f64> = radii.descending().map(|s| s.radius).collect();
            assert_eq!(desc[0], r_max);
            assert_eq!(*desc.last().unwrap(), r_min);
            assert!(desc.windows(2).all(|w| w[0] > w[1]), "{desc:?}");
        }
    }

    #[test]
    fn test_interior_ratio_is_fixed() {
        let cosmo = FlatLcdm::new(CosmoParams::default());
        let radii = RadiusScheduler::new(&cosmo, 1.0, 20.0, 1.2);
        let specs = radii.as_slice();
        for pair in specs[..specs.len() - 1].windows(2) {
            approx::assert_relative_eq!(pair[1].radius / pair[0].radius, 1.2, epsilon = 1e-12);
        }
        assert!(specs.iter().enumerate().all(|(i, s)| s.index == i));
        assert!(specs.windows(2).all(|w| w[1].m_max > w[0].m_max));
        assert!(specs.windows(2).all(|w| w[1].sigma_maxmass < w[0].sigma_maxmass));
    }

    #[test]
    #[should_panic(expected = "Radius range must be positive")]
    fn test_inverted_range_panics() {
        let cosmo = FlatLcdm::new(CosmoParams::default());
        let _ = RadiusScheduler::new(&cosmo, 5.0, 1.0, 1.1);
    }
}
