//! Failure reporting of redshift steps
//!
//! Every fatal path must come back as a tagged [`ReionError`] naming the
//! step it happened in, and the driver must stop at the first one.

use reion_sim_core::config::PhotonConsType;
use reion_sim_core::physics::CalibrationCurve;
use reion_sim_core::spin_temperature::SpinTemperatureInputs;
use reion_sim_core::{
    CoevalSimulation, ErrorKind, Field3D, InitialConditions, Physics, SimulationConfig,
    SimulationContext, SpinTemperatureSolver, StepConstants,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[ctor::ctor]
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn test_uncalibrated_redshift_stalls_reionization() {
    let mut config = SimulationConfig::small_box(8, 32.0);
    config.flags.photon_cons_type = PhotonConsType::RedshiftShift;
    // Calibrated only below z = 8
    let physics = Physics::analytic(&config)
        .with_photon_conservation(Arc::new(CalibrationCurve::new(5.0, 8.0, vec![0.1, 0.2, 0.3])));
    let ctx = SimulationContext::with_physics(config, physics).unwrap();
    let layout = ctx.layout();
    let mut sim =
        CoevalSimulation::new(&ctx, InitialConditions::at_rest(layout), Field3D::new(layout)).unwrap();

    let err = sim.run(&[10.0, 7.0]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PhotonConservation);
    assert_eq!(err.context().redshift, 10.0);
    assert!(err.user_message().contains("reionization stalled"));
    assert!(sim.summaries().is_empty());
}

#[test]
fn test_invalid_parameters_rejected_before_any_step() {
    let mut config = SimulationConfig::small_box(8, 32.0);
    config.flags.use_mini_halos = true;
    config.flags.use_ts_fluct = false;
    let err = SimulationContext::new(config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn test_spin_step_without_history_reports_redshift() {
    let mut config = SimulationConfig::small_box(8, 32.0);
    config.flags.use_ts_fluct = true;
    let ctx = SimulationContext::new(config).unwrap();
    let consts = StepConstants::new(&ctx, 14.0, 14.5).unwrap();
    let density = Field3D::new(ctx.layout());
    let err = SpinTemperatureSolver::new(&ctx)
        .compute(&consts, None, &SpinTemperatureInputs::new(&density))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert_eq!(err.context().redshift, 14.0);
    assert!(err.to_string().contains("previous state"));
}
