//! Host-side simulation state.

use bincode::{Decode, Encode};

use crate::{
    config::{require_positive, MdInput},
    error::{LjmdError, LjmdResult},
    kernels::ForceParams,
    restart::PhaseSpace,
};

/// The complete MD system, as the host sees it. Position and velocity arrays are allocated once
/// and never resized.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct SimulationState {
    pub natoms: usize,
    /// Current step index.
    pub nfi: usize,
    pub nsteps: usize,
    /// fs
    pub dt: f64,
    /// amu
    pub mass: f64,
    /// kcal/mol
    pub epsilon: f64,
    /// Å
    pub sigma: f64,
    pub rcut: f64,
    pub box_len: f64,
    pub ekin: f64,
    pub epot: f64,
    pub temp: f64,
    pub rx: Vec<f64>,
    pub ry: Vec<f64>,
    pub rz: Vec<f64>,
    pub vx: Vec<f64>,
    pub vy: Vec<f64>,
    pub vz: Vec<f64>,
}

impl SimulationState {
    pub fn new(input: &MdInput, phase: PhaseSpace) -> Self {
        let PhaseSpace {
            r: [rx, ry, rz],
            v: [vx, vy, vz],
        } = phase;

        Self {
            natoms: input.natoms,
            nfi: 0,
            nsteps: input.nsteps,
            dt: input.dt,
            mass: input.mass,
            epsilon: input.epsilon,
            sigma: input.sigma,
            rcut: input.rcut,
            box_len: input.box_len,
            ekin: 0.,
            epot: 0.,
            temp: 0.,
            rx,
            ry,
            rz,
            vx,
            vy,
            vz,
        }
    }

    pub fn etot(&self) -> f64 {
        self.ekin + self.epot
    }

    /// 4εσ¹²
    pub fn c12(&self) -> f64 {
        4. * self.epsilon * self.sigma.powi(12)
    }

    /// 4εσ⁶
    pub fn c6(&self) -> f64 {
        4. * self.epsilon * self.sigma.powi(6)
    }

    pub fn force_params(&self) -> ForceParams<f64> {
        ForceParams {
            c12: self.c12(),
            c6: self.c6(),
            rcsq: self.rcut * self.rcut,
            boxby2: 0.5 * self.box_len,
            box_len: self.box_len,
        }
    }

    pub fn phase_space(&self) -> PhaseSpace {
        PhaseSpace {
            r: [self.rx.clone(), self.ry.clone(), self.rz.clone()],
            v: [self.vx.clone(), self.vy.clone(), self.vz.clone()],
        }
    }

    /// Array lengths match the atom count, and the box, cutoff, mass and time step are positive.
    pub fn check(&self) -> LjmdResult<()> {
        if !self.is_consistent() {
            return Err(LjmdError::Input("state arrays don't match the atom count".to_owned()));
        }
        require_positive("mass", self.mass)?;
        require_positive("cutoff radius", self.rcut)?;
        require_positive("box length", self.box_len)?;
        require_positive("time step", self.dt)
    }

    /// Whether every per-atom array has `natoms` entries.
    pub fn is_consistent(&self) -> bool {
        [&self.rx, &self.ry, &self.rz, &self.vx, &self.vy, &self.vz]
            .iter()
            .all(|a| a.len() == self.natoms)
    }
}
