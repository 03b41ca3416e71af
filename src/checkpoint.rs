//! Binary checkpoints of the full simulation state, for resuming a run.

use std::path::Path;

use bincode::{Decode, Encode};

use crate::{
    config::MdInput,
    error::{LjmdError, LjmdResult},
    state::SimulationState,
    util,
};

/// Bumped when the layout of `SimulationState` changes.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct Checkpoint {
    pub version: u32,
    pub state: SimulationState,
}

impl Checkpoint {
    pub fn new(state: SimulationState) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            state,
        }
    }

    pub fn save(&self, path: &Path) -> LjmdResult<()> {
        util::save(path, self).map_err(|e| LjmdError::io(path, e))
    }

    pub fn load(path: &Path) -> LjmdResult<Self> {
        let err = |msg: String| LjmdError::Checkpoint {
            path: path.to_owned(),
            msg,
        };

        let result: Self = util::load(path).map_err(|e| err(e.to_string()))?;
        if result.version != CHECKPOINT_VERSION {
            return Err(err(format!(
                "version {}; expected {CHECKPOINT_VERSION}",
                result.version
            )));
        }
        if !result.state.is_consistent() {
            return Err(err("array lengths don't match the atom count".to_owned()));
        }
        Ok(result)
    }

    /// State to continue from. Step numbering continues from the checkpoint; run length, time
    /// step and output settings come from `input`.
    pub fn resume(self, input: &MdInput) -> LjmdResult<SimulationState> {
        if self.state.natoms != input.natoms {
            return Err(LjmdError::Input(format!(
                "checkpoint has {} atoms; input specifies {}",
                self.state.natoms, input.natoms
            )));
        }

        let mut state = self.state;
        state.nsteps = input.nsteps;
        state.dt = input.dt;
        state.mass = input.mass;
        state.epsilon = input.epsilon;
        state.sigma = input.sigma;
        state.rcut = input.rcut;
        state.box_len = input.box_len;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::restart::PhaseSpace;

    fn input(natoms: usize) -> MdInput {
        MdInput {
            natoms,
            mass: 39.948,
            epsilon: 0.2379,
            sigma: 3.405,
            rcut: 8.5,
            box_len: 17.158,
            restart_path: PathBuf::from("a.rest"),
            traj_path: PathBuf::from("a.xyz"),
            erg_path: PathBuf::from("a.dat"),
            nsteps: 50,
            dt: 5.,
            nprint: 10,
        }
    }

    #[test]
    fn save_load_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");

        let phase = PhaseSpace {
            r: [vec![1., 2.], vec![3., 4.], vec![5., 6.]],
            v: [vec![0.1, 0.2], vec![0.3, 0.4], vec![0.5, 0.6]],
        };
        let mut state = SimulationState::new(&input(2), phase);
        state.nfi = 120;
        Checkpoint::new(state.clone()).save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.state, state);

        let resumed = loaded.resume(&input(2)).unwrap();
        assert_eq!(resumed.nfi, 120);
        assert_eq!(resumed.nsteps, 50);
    }

    #[test]
    fn garbage_file_exits_3() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ckpt");
        std::fs::write(&path, b"not a checkpoint").unwrap();

        assert_eq!(Checkpoint::load(&path).unwrap_err().exit_code(), 3);
        assert_eq!(
            Checkpoint::load(&dir.path().join("missing")).unwrap_err().exit_code(),
            3
        );
    }

    #[test]
    fn atom_count_mismatch_rejected() {
        let phase = PhaseSpace {
            r: [vec![0.], vec![0.], vec![0.]],
            v: [vec![0.], vec![0.], vec![0.]],
        };
        let ckpt = Checkpoint::new(SimulationState::new(&input(1), phase));
        assert!(ckpt.resume(&input(3)).is_err());
    }
}
