//! Contains unit conversions, and a definition of the base units used throughout this program.
//!
//! Length: Å. Mass: amu. Energy: kcal/mol. Time: fs. Temperature: K.

use std::{fmt, str::FromStr};

/// Boltzmann constant in kcal/mol/K.
pub const KBOLTZ: f64 = 0.0019872067;
/// Converts m·v² (amu·Å²/fs²) to kcal/mol.
pub const MVSQ2E: f64 = 2390.05736153349;

/// Physical constants used by the integrator. Passed in explicitly, vice reading globals,
/// so tests and alternate unit systems can substitute their own.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhysConstants {
    pub kboltz: f64,
    pub mvsq2e: f64,
}

impl Default for PhysConstants {
    fn default() -> Self {
        Self {
            kboltz: KBOLTZ,
            mvsq2e: MVSQ2E,
        }
    }
}

impl PhysConstants {
    /// Kinetic energy from a sum of squared velocities.
    pub fn ekin(&self, sum_v_sq: f64, mass: f64) -> f64 {
        0.5 * self.mvsq2e * mass * sum_v_sq
    }

    /// Instantaneous temperature. Three degrees of freedom are removed for the fixed center of mass.
    pub fn temperature(&self, ekin: f64, natoms: usize) -> f64 {
        2.0 * ekin / (3.0 * natoms as f64 - 3.0) / self.kboltz
    }

    /// Velocity increment per unit force for a half step: ½·dt / mvsq2e / m.
    pub fn dtmf(&self, dt: f64, mass: f64) -> f64 {
        0.5 * dt / self.mvsq2e / mass
    }
}

/// Floating point precision used on the devices. The host always integrates bookkeeping in f64.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Precision {
    Single,
    #[default]
    Double,
}

impl Precision {
    pub fn size_bytes(self) -> usize {
        match self {
            Self::Single => 4,
            Self::Double => 8,
        }
    }

    /// Tolerance suitable for comparing device results against the f64 reference.
    pub fn tolerance(self) -> f64 {
        match self {
            Self::Single => 1e-4,
            Self::Double => 1e-10,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Double => write!(f, "double"),
        }
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single" | "float" | "f32" => Ok(Self::Single),
            "double" | "f64" => Ok(Self::Double),
            _ => Err(format!("invalid precision '{s}'; expected 'single' or 'double'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_inverts_equipartition() {
        let c = PhysConstants::default();
        let n = 108;
        let t = 120.;
        let ekin = 1.5 * (n as f64 - 1.) * c.kboltz * t;
        assert!((c.temperature(ekin, n) - t).abs() < 1e-9);
    }

    #[test]
    fn parse_precision() {
        assert_eq!("f32".parse::<Precision>().unwrap(), Precision::Single);
        assert_eq!("Double".parse::<Precision>().unwrap(), Precision::Double);
        assert!("half".parse::<Precision>().is_err());
    }
}
