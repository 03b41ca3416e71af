//! Restart files: plain text, N position triples followed by N velocity triples.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
};

use crate::error::{LjmdError, LjmdResult};

/// Positions and velocities, per axis.
#[derive(Clone, Debug, PartialEq)]
pub struct PhaseSpace {
    pub r: [Vec<f64>; 3],
    pub v: [Vec<f64>; 3],
}

impl PhaseSpace {
    pub fn natoms(&self) -> usize {
        self.r[0].len()
    }
}

/// Parse restart text for `natoms` atoms. Values beyond `6 * natoms` are ignored.
pub fn parse_restart(text: &str, natoms: usize) -> Result<PhaseSpace, String> {
    let mut values = text.split_whitespace().map(|tok| {
        tok.parse::<f64>()
            .map_err(|_| format!("invalid number '{tok}'"))
    });

    let mut read_block = |what: &str| -> Result<[Vec<f64>; 3], String> {
        let mut block = [
            Vec::with_capacity(natoms),
            Vec::with_capacity(natoms),
            Vec::with_capacity(natoms),
        ];
        for i in 0..natoms {
            for axis in &mut block {
                match values.next() {
                    Some(v) => axis.push(v?),
                    None => return Err(format!("file ends at {what} of atom {i}")),
                }
            }
        }
        Ok(block)
    };

    let r = read_block("position")?;
    let v = read_block("velocity")?;
    Ok(PhaseSpace { r, v })
}

pub fn read_restart(path: &Path, natoms: usize) -> LjmdResult<PhaseSpace> {
    let text = fs::read_to_string(path).map_err(|e| LjmdError::Restart {
        path: path.to_owned(),
        msg: e.to_string(),
    })?;

    parse_restart(&text, natoms).map_err(|msg| LjmdError::Restart {
        path: path.to_owned(),
        msg,
    })
}

/// Write a restart file that `read_restart` reproduces exactly.
pub fn write_restart(path: &Path, phase: &PhaseSpace) -> LjmdResult<()> {
    let io_err = |e| LjmdError::io(path, e);

    let mut w = BufWriter::new(File::create(path).map_err(io_err)?);
    for block in [&phase.r, &phase.v] {
        for i in 0..phase.natoms() {
            writeln!(w, "{:.17e} {:.17e} {:.17e}", block[0][i], block[1][i], block[2][i])
                .map_err(io_err)?;
        }
    }
    w.flush().map_err(io_err)
}
