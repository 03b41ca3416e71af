use std::path::PathBuf;

use ljmd::{
    catalog::{DeviceKind, Platform},
    config::MdInput,
    lattice::{self, LatticeConfig},
    output::Frame,
    reference::ReferenceSim,
    units::PhysConstants,
    RunOptions, Simulation, SimulationState,
};

/// 100 argon atoms near the liquid density, 1 fs steps.
fn argon_100() -> SimulationState {
    let input = MdInput {
        natoms: 100,
        mass: 39.948,
        epsilon: 0.2379,
        sigma: 3.405,
        rcut: 8.5,
        box_len: 17.158,
        restart_path: PathBuf::from("unused.rest"),
        traj_path: PathBuf::from("unused.xyz"),
        erg_path: PathBuf::from("unused.dat"),
        nsteps: 100,
        dt: 1.,
        nprint: 10,
    };
    let cfg = LatticeConfig {
        natoms: input.natoms,
        box_len: input.box_len,
        mass: input.mass,
        temperature: 100.,
        seed: 2024,
    };
    SimulationState::new(&input, lattice::generate(&cfg, &PhysConstants::default()))
}

fn max_drift(frames: &[Frame]) -> f64 {
    let e0 = frames[0].etot();
    frames
        .iter()
        .map(|f| ((f.etot() - e0) / e0).abs())
        .fold(0., f64::max)
}

#[test]
fn serial_integrator_conserves_energy() {
    let mut sim = ReferenceSim::new(argon_100(), 10, PhysConstants::default()).unwrap();
    let mut frames = Vec::new();
    sim.run(&mut frames).unwrap();

    assert_eq!(frames.len(), 11);
    let drift = max_drift(&frames);
    assert!(drift < 1e-3, "relative energy drift {drift}");
}

#[test]
fn device_pipeline_conserves_energy() {
    let devices = Platform::emulated("Test", DeviceKind::Cpu, 2).devices().to_vec();
    let mut sim = Simulation::new(&devices, argon_100(), 10, &RunOptions::default()).unwrap();
    let mut frames = Vec::new();
    sim.run(&mut frames).unwrap();

    assert_eq!(frames.len(), 11);
    let drift = max_drift(&frames);
    assert!(drift < 1e-3, "relative energy drift {drift}");
}
