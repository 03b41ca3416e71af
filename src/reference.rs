//! A serial, double-precision Lennard-Jones integrator on the host. Runs without any device, and
//! uses the same step numbering and output as the device pipeline, so results can be compared
//! line for line.

use std::time::Instant;

use lin_alg::f64::Vec3;

use crate::{
    error::{LjmdError, LjmdResult},
    kernels::{pbc, ForceParams},
    output::Observer,
    state::SimulationState,
    units::PhysConstants,
};

#[derive(Clone, Copy, Debug)]
pub struct Atom {
    pub posit: Vec3,
    pub vel: Vec3,
    pub force: Vec3,
}

pub struct ReferenceSim {
    state: SimulationState,
    atoms: Vec<Atom>,
    consts: PhysConstants,
    nprint: usize,
}

/// Minimum image separation of two positions.
fn min_image(a: Vec3, b: Vec3, p: &ForceParams<f64>) -> Vec3 {
    Vec3::new(
        pbc(a.x - b.x, p.boxby2, p.box_len),
        pbc(a.y - b.y, p.boxby2, p.box_len),
        pbc(a.z - b.z, p.boxby2, p.box_len),
    )
}

impl ReferenceSim {
    pub fn new(state: SimulationState, nprint: usize, consts: PhysConstants) -> LjmdResult<Self> {
        if nprint == 0 {
            return Err(LjmdError::Input("print interval must be positive".to_owned()));
        }
        state.check()?;

        let atoms = (0..state.natoms)
            .map(|i| Atom {
                posit: Vec3::new(state.rx[i], state.ry[i], state.rz[i]),
                vel: Vec3::new(state.vx[i], state.vy[i], state.vz[i]),
                force: Vec3::new_zero(),
            })
            .collect();

        Ok(Self {
            state,
            atoms,
            consts,
            nprint,
        })
    }

    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    /// Forces on every atom, and the potential energy. Each pair is visited once.
    pub fn compute_forces(&mut self) {
        let p = self.state.force_params();
        for atom in &mut self.atoms {
            atom.force = Vec3::new_zero();
        }

        let mut epot = 0.;
        let n = self.atoms.len();
        for i in 0..n.saturating_sub(1) {
            for j in i + 1..n {
                let d = min_image(self.atoms[i].posit, self.atoms[j].posit, &p);
                let rsq = d.magnitude_squared();
                if rsq >= p.rcsq {
                    continue;
                }

                let r6 = 1. / (rsq * rsq * rsq);
                let rinv = 1. / rsq;
                let ffac = (12. * p.c12 * r6 - 6. * p.c6) * r6 * rinv;
                epot += r6 * (p.c12 * r6 - p.c6);

                self.atoms[i].force += d * ffac;
                self.atoms[j].force -= d * ffac;
            }
        }
        self.state.epot = epot;
    }

    fn update_ekin(&mut self) {
        let sum_v_sq: f64 = self.atoms.iter().map(|a| a.vel.magnitude_squared()).sum();
        let s = &mut self.state;
        s.ekin = self.consts.ekin(sum_v_sq, s.mass);
        s.temp = self.consts.temperature(s.ekin, s.natoms);
    }

    /// Velocity Verlet: half kick, drift, new forces, half kick.
    fn step(&mut self) {
        let dt = self.state.dt;
        let dtmf = self.consts.dtmf(dt, self.state.mass);

        for atom in &mut self.atoms {
            atom.vel += atom.force * dtmf;
            atom.posit += atom.vel * dt;
        }
        self.compute_forces();
        for atom in &mut self.atoms {
            atom.vel += atom.force * dtmf;
        }
        self.update_ekin();
    }

    /// Copy positions and velocities from the atoms into the state arrays.
    fn sync_state(&mut self) {
        let s = &mut self.state;
        for (i, a) in self.atoms.iter().enumerate() {
            s.rx[i] = a.posit.x;
            s.ry[i] = a.posit.y;
            s.rz[i] = a.posit.z;
            s.vx[i] = a.vel.x;
            s.vy[i] = a.vel.y;
            s.vz[i] = a.vel.z;
        }
    }

    pub fn run(&mut self, out: &mut impl Observer) -> LjmdResult<()> {
        let first = self.state.nfi;
        let last = first + self.state.nsteps;

        self.compute_forces();
        self.update_ekin();
        self.sync_state();
        out.observe(&self.state)?;

        let start = Instant::now();
        for nfi in first + 1..=last {
            self.state.nfi = nfi;
            if nfi % self.nprint == 0 {
                self.sync_state();
                out.observe(&self.state)?;
            }
            self.step();
        }
        self.sync_state();

        log::info!(
            "Reference MD loop: {} steps in {:.3} s",
            self.state.nsteps,
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    pub fn forces(&self) -> [Vec<f64>; 3] {
        [
            self.atoms.iter().map(|a| a.force.x).collect(),
            self.atoms.iter().map(|a| a.force.y).collect(),
            self.atoms.iter().map(|a| a.force.z).collect(),
        ]
    }

    pub fn into_state(self) -> SimulationState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Frame;

    fn two_atoms(dist: f64) -> SimulationState {
        SimulationState {
            natoms: 2,
            nfi: 0,
            nsteps: 3,
            dt: 1.,
            mass: 39.948,
            epsilon: 0.2379,
            sigma: 3.405,
            rcut: 8.5,
            box_len: 30.,
            ekin: 0.,
            epot: 0.,
            temp: 0.,
            rx: vec![0., dist],
            ry: vec![0., 0.],
            rz: vec![0., 0.],
            vx: vec![0., 0.],
            vy: vec![0., 0.],
            vz: vec![0., 0.],
        }
    }

    #[test]
    fn pair_force_closed_form() {
        let r = 3.6;
        let mut sim = ReferenceSim::new(two_atoms(r), 1, PhysConstants::default()).unwrap();
        sim.compute_forces();

        let (eps, sig) = (0.2379, 3.405);
        let expected = 24. * eps / r * (2. * (sig / r).powi(12) - (sig / r).powi(6));
        let f = sim.forces();
        // Atom 0 sits at -x relative to atom 1; repulsion pushes it further -x.
        assert!((f[0][0] + expected).abs() < 1e-10 * expected.abs());
        assert!((f[0][0] + f[0][1]).abs() < 1e-12);

        let e_expected = 4. * eps * ((sig / r).powi(12) - (sig / r).powi(6));
        assert!((sim.state().epot - e_expected).abs() < 1e-12);
    }

    #[test]
    fn beyond_cutoff_no_force() {
        let mut sim = ReferenceSim::new(two_atoms(9.), 1, PhysConstants::default()).unwrap();
        sim.compute_forces();
        assert_eq!(sim.forces()[0], vec![0., 0.]);
        assert_eq!(sim.state().epot, 0.);
    }

    #[test]
    fn frames_follow_print_interval() {
        let mut state = two_atoms(3.6);
        state.nsteps = 6;
        let mut sim = ReferenceSim::new(state, 2, PhysConstants::default()).unwrap();
        let mut frames: Vec<Frame> = Vec::new();
        sim.run(&mut frames).unwrap();

        let steps: Vec<_> = frames.iter().map(|f| f.nfi).collect();
        assert_eq!(steps, vec![0, 2, 4, 6]);
        assert_eq!(sim.state().nfi, 6);
    }

    #[test]
    fn degenerate_box_rejected() {
        for box_len in [0., -10., f64::NAN] {
            let mut state = two_atoms(3.6);
            state.box_len = box_len;
            let err = ReferenceSim::new(state, 1, PhysConstants::default()).err().unwrap();
            assert_eq!(err.exit_code(), 1, "box {box_len}");
        }
    }
}
