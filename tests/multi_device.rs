//! Runs the device pipeline on emulated host devices, and checks that splitting the force
//! calculation across devices gives the same answers as one device and the serial integrator.

use std::path::PathBuf;

use ljmd::{
    catalog::{DeviceHandle, DeviceKind, Platform},
    config::{MdInput, TransferMode},
    context::DeviceOrdinal,
    lattice::{self, LatticeConfig},
    output::Frame,
    program::BuildOptions,
    reference::ReferenceSim,
    units::{PhysConstants, Precision},
    RunOptions, Simulation, SimulationState,
};

fn argon(natoms: usize, nsteps: usize) -> SimulationState {
    let input = MdInput {
        natoms,
        mass: 39.948,
        epsilon: 0.2379,
        sigma: 3.405,
        rcut: 8.5,
        box_len: 17.158,
        restart_path: PathBuf::from("unused.rest"),
        traj_path: PathBuf::from("unused.xyz"),
        erg_path: PathBuf::from("unused.dat"),
        nsteps,
        dt: 5.,
        nprint: 5,
    };

    let cfg = LatticeConfig {
        natoms,
        box_len: input.box_len,
        mass: input.mass,
        temperature: 90.,
        seed: 42,
    };
    SimulationState::new(&input, lattice::generate(&cfg, &PhysConstants::default()))
}

fn devices(count: usize) -> Vec<DeviceHandle> {
    Platform::emulated("Test", DeviceKind::Cpu, count).devices().to_vec()
}

fn opts(transfer: TransferMode) -> RunOptions {
    RunOptions {
        nthreads: 16,
        transfer,
        ..Default::default()
    }
}

fn run(ndevices: usize, state: SimulationState, nprint: usize, opts: &RunOptions) -> (Vec<Frame>, SimulationState) {
    let mut sim = Simulation::new(&devices(ndevices), state, nprint, opts).unwrap();
    let mut frames = Vec::new();
    sim.run(&mut frames).unwrap();
    (frames, sim.into_state())
}

fn assert_close(a: f64, b: f64, rel: f64, what: &str) {
    let scale = a.abs().max(b.abs()).max(1.);
    assert!((a - b).abs() <= rel * scale, "{what}: {a} vs {b}");
}

fn assert_frames_close(a: &[Frame], b: &[Frame], rel: f64) {
    assert_eq!(a.len(), b.len());
    for (fa, fb) in a.iter().zip(b) {
        assert_eq!(fa.nfi, fb.nfi);
        assert_close(fa.temp, fb.temp, rel, "temperature");
        assert_close(fa.ekin, fb.ekin, rel, "kinetic energy");
        assert_close(fa.epot, fb.epot, rel, "potential energy");
        for axis in 0..3 {
            for (x, y) in fa.r[axis].iter().zip(&fb.r[axis]) {
                assert_close(*x, *y, rel, "position");
            }
        }
    }
}

#[test]
fn split_forces_match_single_device() {
    let state = argon(50, 0);

    let mut single = Simulation::new(&devices(1), state.clone(), 1, &opts(TransferMode::Blocking)).unwrap();
    single.zero_forces().unwrap();
    single.compute_forces().unwrap();
    let expected = single.read_forces(DeviceOrdinal(0)).unwrap();

    let mut split = Simulation::new(&devices(3), state, 1, &opts(TransferMode::Blocking)).unwrap();
    split.zero_forces().unwrap();
    split.compute_forces().unwrap();

    // After the merge, every device holds the full vectors.
    for d in 0..3 {
        let got = split.read_forces(DeviceOrdinal(d)).unwrap();
        for axis in 0..3 {
            for (g, e) in got[axis].iter().zip(&expected[axis]) {
                assert_close(*g, *e, 1e-10, "force");
            }
        }
    }
}

#[test]
fn zero_forces_clears_every_device() {
    for ndevices in 1..=3 {
        let mut sim = Simulation::new(
            &devices(ndevices),
            argon(20, 0),
            1,
            &opts(TransferMode::Blocking),
        )
        .unwrap();
        sim.compute_forces().unwrap();
        sim.zero_forces().unwrap();

        for d in 0..ndevices {
            let f = sim.read_forces(DeviceOrdinal(d)).unwrap();
            for axis in &f {
                assert_eq!(axis.len(), 20);
                assert!(axis.iter().all(|&x| x == 0.0));
            }
        }
    }
}

#[test]
fn three_devices_match_one() {
    let (one, end_one) = run(1, argon(40, 20), 5, &opts(TransferMode::Blocking));
    let (three, end_three) = run(3, argon(40, 20), 5, &opts(TransferMode::Blocking));

    assert_eq!(one.iter().map(|f| f.nfi).collect::<Vec<_>>(), vec![0, 5, 10, 15, 20]);
    assert_frames_close(&one, &three, 1e-9);
    assert_eq!(end_one.nfi, 20);
    for (a, b) in end_one.vx.iter().zip(&end_three.vx) {
        assert_close(*a, *b, 1e-9, "velocity");
    }
}

#[test]
fn async_transfers_match_blocking() {
    let (blocking, _) = run(2, argon(30, 12), 3, &opts(TransferMode::Blocking));
    let (lagged, _) = run(2, argon(30, 12), 3, &opts(TransferMode::Async));
    assert_eq!(blocking, lagged);
}

#[test]
fn devices_match_serial_integrator() {
    let state = argon(40, 20);

    let (device, end_device) = run(2, state.clone(), 5, &opts(TransferMode::Async));

    let mut reference = ReferenceSim::new(state, 5, PhysConstants::default()).unwrap();
    let mut expected = Vec::new();
    reference.run(&mut expected).unwrap();

    assert_frames_close(&device, &expected, 1e-8);
    assert_eq!(end_device.nfi, reference.state().nfi);
}

#[test]
fn single_precision_tracks_double() {
    let single = RunOptions {
        build: BuildOptions {
            precision: Precision::Single,
            ..Default::default()
        },
        ..opts(TransferMode::Blocking)
    };

    let (d, _) = run(2, argon(30, 10), 5, &opts(TransferMode::Blocking));
    let (s, _) = run(2, argon(30, 10), 5, &single);

    for (fd, fs) in d.iter().zip(&s) {
        assert_close(fd.etot(), fs.etot(), 1e-3, "total energy");
    }
}

#[test]
fn more_devices_than_atoms() {
    let (few, _) = run(1, argon(2, 4), 2, &opts(TransferMode::Blocking));
    let (many, _) = run(4, argon(2, 4), 2, &opts(TransferMode::Blocking));
    assert_frames_close(&few, &many, 1e-10);
}

#[test]
fn resumed_step_numbering_continues() {
    let mut state = argon(20, 6);
    state.nfi = 30;
    let (frames, end) = run(1, state, 3, &opts(TransferMode::Blocking));

    assert_eq!(frames.iter().map(|f| f.nfi).collect::<Vec<_>>(), vec![30, 33, 36]);
    assert_eq!(end.nfi, 36);
}

#[test]
fn degenerate_box_rejected_before_device_setup() {
    for box_len in [0., -10.] {
        let mut state = argon(10, 2);
        state.box_len = box_len;
        let err = Simulation::new(&devices(1), state, 1, &opts(TransferMode::Blocking)).err().unwrap();
        assert_eq!(err.exit_code(), 1);
    }

    let mut state = argon(10, 2);
    state.dt = f64::INFINITY;
    assert!(Simulation::new(&devices(1), state, 1, &opts(TransferMode::Blocking)).is_err());
}
