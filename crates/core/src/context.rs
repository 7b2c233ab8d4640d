//! Immutable simulation context
//!
//! A [`SimulationContext`] owns everything a redshift step reads but never
//! writes: the validated configuration, the physics collaborators, the
//! planned transforms for the grid and the worker pool. Solvers borrow it;
//! nothing is kept in process-wide state, so independent contexts can run
//! side by side in one process.

use crate::config::SimulationConfig;
use crate::error::{ErrorContext, ReionError, Result};
use crate::filter::GridFilterEngine;
use crate::grid::GridLayout;
use crate::physics::Physics;
use tracing::{debug, warn};

/// Configuration, collaborators and resources shared by every step
#[derive(Debug)]
pub struct SimulationContext {
    config: SimulationConfig,
    physics: Physics,
    layout: GridLayout,
    filter: GridFilterEngine,
    pool: rayon::ThreadPool,
}

impl SimulationContext {
    /// Validate `config` and build the analytic collaborators
    pub fn new(config: SimulationConfig) -> Result<Self> {
        let physics = Physics::analytic(&config);
        Self::with_physics(config, physics)
    }

    /// Validate `config` and use caller-supplied collaborators
    pub fn with_physics(config: SimulationConfig, physics: Physics) -> Result<Self> {
        config.validate()?;
        let user = &config.user;
        if user.box_len > user.dim as f64 && !config.global.evolve_density_linearly {
            warn!(
                box_len = user.box_len,
                dim = user.dim,
                "Resolution is likely too low for accurate evolved density fields"
            );
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(user.n_threads)
            .build()
            .map_err(|e| {
                ReionError::config(ErrorContext::default(), format!("thread pool: {e}"))
            })?;
        let layout = GridLayout::from_user(user);
        debug!(
            nx = layout.nx,
            nz = layout.nz,
            threads = user.n_threads,
            "Simulation context ready"
        );

        Ok(Self {
            filter: GridFilterEngine::new(layout),
            config,
            physics,
            layout,
            pool,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn physics(&self) -> &Physics {
        &self.physics
    }

    /// Low-resolution grid layout
    pub fn layout(&self) -> GridLayout {
        self.layout
    }

    /// Transform and smoothing engine for the low-resolution grid
    pub fn filter(&self) -> &GridFilterEngine {
        &self.filter
    }

    /// Run `op` on the context's worker pool
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_context_uses_configured_threads() {
        let mut config = SimulationConfig::small_box(4, 8.0);
        config.user.n_threads = 2;
        let ctx = SimulationContext::new(config).unwrap();
        assert_eq!(ctx.install(rayon::current_num_threads), 2);
        assert_eq!(ctx.layout().real_len(), 64);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = SimulationConfig::small_box(4, 8.0);
        config.global.find_bubble_algorithm = 0;
        let err = SimulationContext::new(config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_contexts_are_independent() {
        let a = SimulationContext::new(SimulationConfig::small_box(4, 8.0)).unwrap();
        let mut config = SimulationConfig::small_box(4, 8.0);
        config.astro.f_star10 = 0.2;
        let b = SimulationContext::new(config).unwrap();
        assert_ne!(a.config().astro.f_star10, b.config().astro.f_star10);
    }
}
