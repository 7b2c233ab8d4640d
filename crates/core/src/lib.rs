//! Reionization Simulation Core Library
//!
//! Evolves the 3D ionization, spin-temperature and galaxy-property fields of
//! the early universe, one redshift step at a time, from an evolved density
//! field and (optionally) a halo catalog.
//!
//! ## Step pipeline
//!
//! - [`PerturbationMapper`] moves halos from their initial positions
//! - [`HaloBoxAggregator`] grids star formation, ionizing and X-ray output
//! - [`SpinTemperatureSolver`] sums X-ray and Lyman-series radiation over
//!   redshift shells and updates the IGM temperature and 21cm spin temperature
//! - [`IonizationFieldSolver`] applies the excursion-set barrier over a
//!   sequence of filter radii
//!
//! [`CoevalSimulation`] drives the pipeline over a descending redshift list.
//! Every solver borrows one immutable [`SimulationContext`] and returns a
//! [`ReionError`] tagged with the step, radius and cell it failed at.

// Configuration and shared resources
pub mod config;
pub mod context;
pub mod error;

// Numerical building blocks
pub mod filter;
pub mod grid;
pub mod physics;
pub mod tables;

// Per-step quantities
pub mod constants;
pub mod radii;
pub mod turnover;

// Step solvers
pub mod halo_box;
pub mod ionization;
pub mod perturb_halo;
pub mod spin_temperature;

// Redshift driver
pub mod simulation;

// Re-export the entry points
pub use config::SimulationConfig;
pub use constants::StepConstants;
pub use context::SimulationContext;
pub use error::{ErrorContext, ErrorKind, ReionError, Result};
pub use grid::{Field3D, GridLayout};
pub use physics::Physics;

// Re-export solver types
pub use halo_box::{HaloBoxAggregator, HaloBoxFields, HaloCatalog};
pub use ionization::{IonizationFieldSolver, IonizationInputs, IonizationState};
pub use perturb_halo::{InitialConditions, PerturbationMapper};
pub use spin_temperature::{SpinTemperatureInputs, SpinTemperatureSolver, SpinTemperatureState};
pub use simulation::{CoevalSimulation, StepSummary};
