//! Run configuration: the 12-line input deck read from stdin, and the runtime policies.

use std::{io::BufRead, path::PathBuf, str::FromStr};

use crate::error::{LjmdError, LjmdResult};

/// Read a line, cut off any `#` comment, and trim surrounding whitespace.
/// Returns an error at end of input.
pub fn get_me_a_line<R: BufRead>(reader: &mut R) -> LjmdResult<String> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .map_err(|e| LjmdError::Input(e.to_string()))?;

    if n == 0 {
        return Err(LjmdError::Input("unexpected end of input".to_string()));
    }

    if let Some(i) = line.find('#') {
        line.truncate(i);
    }
    Ok(line.trim().to_string())
}

/// Reject zero, negative, and non-finite values. A non-positive box never leaves the
/// minimum-image fold.
pub fn require_positive(name: &str, value: f64) -> LjmdResult<()> {
    if value.is_finite() && value > 0. {
        Ok(())
    } else {
        Err(LjmdError::Input(format!("{name} must be positive and finite; got {value}")))
    }
}

fn parse_value<T: FromStr, R: BufRead>(reader: &mut R, name: &str) -> LjmdResult<T> {
    let line = get_me_a_line(reader)?;
    line.parse()
        .map_err(|_| LjmdError::Input(format!("invalid value for {name}: '{line}'")))
}

/// The simulation input deck. One value or path per line, in this order.
#[derive(Clone, Debug, PartialEq)]
pub struct MdInput {
    pub natoms: usize,
    pub mass: f64,
    pub epsilon: f64,
    pub sigma: f64,
    pub rcut: f64,
    pub box_len: f64,
    pub restart_path: PathBuf,
    pub traj_path: PathBuf,
    pub erg_path: PathBuf,
    pub nsteps: usize,
    pub dt: f64,
    /// Write output every this many steps.
    pub nprint: usize,
}

impl MdInput {
    pub fn parse<R: BufRead>(reader: &mut R) -> LjmdResult<Self> {
        let natoms = parse_value(reader, "atom count")?;
        let mass = parse_value(reader, "mass")?;
        let epsilon = parse_value(reader, "epsilon")?;
        let sigma = parse_value(reader, "sigma")?;
        let rcut = parse_value(reader, "cutoff radius")?;
        let box_len = parse_value(reader, "box length")?;
        let restart_path = PathBuf::from(get_me_a_line(reader)?);
        let traj_path = PathBuf::from(get_me_a_line(reader)?);
        let erg_path = PathBuf::from(get_me_a_line(reader)?);
        let nsteps = parse_value(reader, "step count")?;
        let dt = parse_value(reader, "time step")?;
        let nprint = parse_value(reader, "print interval")?;

        let result = Self {
            natoms,
            mass,
            epsilon,
            sigma,
            rcut,
            box_len,
            restart_path,
            traj_path,
            erg_path,
            nsteps,
            dt,
            nprint,
        };
        result.validate()?;
        Ok(result)
    }

    fn validate(&self) -> LjmdResult<()> {
        if self.natoms == 0 {
            return Err(LjmdError::Input("atom count must be positive".to_string()));
        }
        if self.nprint == 0 {
            return Err(LjmdError::Input("print interval must be positive".to_string()));
        }
        require_positive("mass", self.mass)?;
        require_positive("cutoff radius", self.rcut)?;
        require_positive("box length", self.box_len)?;
        require_positive("time step", self.dt)?;
        for (name, path) in [
            ("restart", &self.restart_path),
            ("trajectory", &self.traj_path),
            ("energy", &self.erg_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(LjmdError::Input(format!("empty {name} file path")));
            }
        }
        Ok(())
    }
}

/// How host/device transfers synchronize.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Every transfer stalls the host until complete.
    #[default]
    Blocking,
    /// Transfers are enqueued with completion signals; the host waits on tagged groups.
    Async,
}

impl FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "blocking" | "sync" => Ok(Self::Blocking),
            "async" | "nonblocking" => Ok(Self::Async),
            _ => Err(format!("invalid transfer mode '{s}'; expected 'blocking' or 'async'")),
        }
    }
}
