//! Energy log and trajectory output.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::{
    error::{LjmdError, LjmdResult},
    state::SimulationState,
};

/// Column titles printed to stdout above the energy lines.
pub const ENERGY_HEADER: &str =
    "     NFI            TEMP            EKIN                 EPOT              ETOT";

/// Receives the state at every printed step.
pub trait Observer {
    fn observe(&mut self, state: &SimulationState) -> LjmdResult<()>;
}

/// Format like C's `% w.pf`: a space in place of the sign for non-negative values.
pub fn space_flag(x: f64, width: usize, precision: usize) -> String {
    let body = if x.is_sign_negative() && x != 0. {
        format!("{x:.precision$}")
    } else {
        format!(" {:.precision$}", x.abs())
    };
    format!("{body:>width$}")
}

/// One energy log line: step, temperature, kinetic, potential and total energy.
pub fn energy_line(state: &SimulationState) -> String {
    format!(
        "{} {} {} {} {}",
        space_flag_int(state.nfi, 8),
        space_flag(state.temp, 20, 8),
        space_flag(state.ekin, 20, 8),
        space_flag(state.epot, 20, 8),
        space_flag(state.etot(), 20, 8),
    )
}

fn space_flag_int(n: usize, width: usize) -> String {
    format!("{:>width$}", format!(" {n}"))
}

/// One trajectory frame, in XYZ format.
pub fn write_frame<W: Write>(w: &mut W, state: &SimulationState) -> io::Result<()> {
    writeln!(w, "{}", state.natoms)?;
    writeln!(w, " nfi={} etot={:20.8}", state.nfi, state.etot())?;
    for i in 0..state.natoms {
        writeln!(
            w,
            "Ar  {:20.8} {:20.8} {:20.8}",
            state.rx[i], state.ry[i], state.rz[i]
        )?;
    }
    Ok(())
}

/// Writes the energy log and the trajectory, and echoes energies to stdout.
pub struct OutputFiles {
    erg_path: PathBuf,
    traj_path: PathBuf,
    erg: BufWriter<File>,
    traj: BufWriter<File>,
    echo: bool,
}

impl OutputFiles {
    pub fn create(erg_path: &Path, traj_path: &Path) -> LjmdResult<Self> {
        let erg = File::create(erg_path).map_err(|e| LjmdError::io(erg_path, e))?;
        let traj = File::create(traj_path).map_err(|e| LjmdError::io(traj_path, e))?;

        Ok(Self {
            erg_path: erg_path.to_owned(),
            traj_path: traj_path.to_owned(),
            erg: BufWriter::new(erg),
            traj: BufWriter::new(traj),
            echo: true,
        })
    }

    /// Don't copy energy lines to stdout.
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    /// Print the run banner and the column titles, unless quiet.
    pub fn announce(&self, natoms: usize, nsteps: usize) {
        if self.echo {
            println!("Starting simulation with {natoms} atoms for {nsteps} steps.");
            println!("{ENERGY_HEADER}");
        }
    }

    pub fn done(&self) {
        if self.echo {
            println!("Simulation Done.");
        }
    }

    pub fn flush(&mut self) -> LjmdResult<()> {
        self.erg.flush().map_err(|e| LjmdError::io(&self.erg_path, e))?;
        self.traj.flush().map_err(|e| LjmdError::io(&self.traj_path, e))
    }
}

impl Observer for OutputFiles {
    fn observe(&mut self, state: &SimulationState) -> LjmdResult<()> {
        let line = energy_line(state);
        if self.echo {
            println!("{line}");
        }
        writeln!(self.erg, "{line}").map_err(|e| LjmdError::io(&self.erg_path, e))?;
        write_frame(&mut self.traj, state).map_err(|e| LjmdError::io(&self.traj_path, e))
    }
}

/// A printed step, kept in memory.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub nfi: usize,
    pub temp: f64,
    pub ekin: f64,
    pub epot: f64,
    pub r: [Vec<f64>; 3],
}

impl Frame {
    pub fn etot(&self) -> f64 {
        self.ekin + self.epot
    }
}

impl Observer for Vec<Frame> {
    fn observe(&mut self, state: &SimulationState) -> LjmdResult<()> {
        self.push(Frame {
            nfi: state.nfi,
            temp: state.temp,
            ekin: state.ekin,
            epot: state.epot,
            r: [state.rx.clone(), state.ry.clone(), state.rz.clone()],
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SimulationState {
        SimulationState {
            natoms: 1,
            nfi: 100,
            nsteps: 1000,
            dt: 5.,
            mass: 39.948,
            epsilon: 0.2379,
            sigma: 3.405,
            rcut: 8.5,
            box_len: 17.158,
            ekin: 12.5,
            epot: -40.25,
            temp: 95.123456789,
            rx: vec![1.5],
            ry: vec![-2.25],
            rz: vec![0.],
            vx: vec![0.],
            vy: vec![0.],
            vz: vec![0.],
        }
    }

    #[test]
    fn space_flag_matches_c() {
        assert_eq!(space_flag(1.5, 10, 3), "     1.500");
        assert_eq!(space_flag(-1.5, 10, 3), "    -1.500");
        assert_eq!(space_flag(-0.0, 6, 1), "   0.0");
    }

    #[test]
    fn energy_line_layout() {
        let line = energy_line(&state());
        assert_eq!(
            line,
            "     100          95.12345679          12.50000000         -40.25000000         -27.75000000"
        );
    }

    #[test]
    fn frame_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &state()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "1");
        assert_eq!(lines[1], " nfi=100 etot=        -27.75000000");
        assert_eq!(
            lines[2],
            "Ar            1.50000000          -2.25000000           0.00000000"
        );
    }

    #[test]
    fn files_receive_frames() {
        let dir = tempfile::tempdir().unwrap();
        let erg = dir.path().join("out.dat");
        let traj = dir.path().join("out.xyz");

        let mut out = OutputFiles::create(&erg, &traj).unwrap().quiet();
        out.observe(&state()).unwrap();
        out.observe(&state()).unwrap();
        out.flush().unwrap();

        let erg_text = std::fs::read_to_string(&erg).unwrap();
        assert_eq!(erg_text.lines().count(), 2);
        let traj_text = std::fs::read_to_string(&traj).unwrap();
        assert_eq!(traj_text.lines().count(), 6);
    }
}
