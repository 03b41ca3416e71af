//! Generate starting configurations: atoms on an FCC lattice, with random velocities drawn from a
//! Maxwell-Boltzmann distribution. Seeded, so the same inputs give the same configuration.

use std::f64::consts::TAU;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{restart::PhaseSpace, units::PhysConstants};

/// Basis of the conventional FCC cell, in units of the lattice constant. Offset by a quarter cell,
/// so no atom sits on a box face.
const FCC_BASIS: [[f64; 3]; 4] = [
    [0.25, 0.25, 0.25],
    [0.75, 0.75, 0.25],
    [0.75, 0.25, 0.75],
    [0.25, 0.75, 0.75],
];

#[derive(Clone, Debug)]
pub struct LatticeConfig {
    pub natoms: usize,
    /// Å
    pub box_len: f64,
    /// amu
    pub mass: f64,
    /// K
    pub temperature: f64,
    pub seed: u64,
}

/// Cells per box edge needed to hold `natoms` sites.
fn cells_per_side(natoms: usize) -> usize {
    let mut nc = 1;
    while 4 * nc * nc * nc < natoms {
        nc += 1;
    }
    nc
}

/// Fill the box with FCC cells, and take the first `natoms` sites.
pub fn fcc_positions(natoms: usize, box_len: f64) -> [Vec<f64>; 3] {
    let nc = cells_per_side(natoms);
    let a = box_len / nc as f64;

    let mut result = [
        Vec::with_capacity(natoms),
        Vec::with_capacity(natoms),
        Vec::with_capacity(natoms),
    ];

    'fill: for i in 0..nc {
        for j in 0..nc {
            for k in 0..nc {
                for b in FCC_BASIS {
                    if result[0].len() == natoms {
                        break 'fill;
                    }
                    result[0].push((i as f64 + b[0]) * a);
                    result[1].push((j as f64 + b[1]) * a);
                    result[2].push((k as f64 + b[2]) * a);
                }
            }
        }
    }
    result
}

/// A standard normal sample, using the Box-Muller transform.
fn normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.random_range(f64::EPSILON..1.0);
    let u2: f64 = rng.random_range(0.0..1.0);
    (-2. * u1.ln()).sqrt() * (TAU * u2).cos()
}

/// Velocities at `temperature`, with zero net momentum. Rescaled so the instantaneous
/// temperature matches exactly.
pub fn maxwell_boltzmann(
    natoms: usize,
    mass: f64,
    temperature: f64,
    consts: &PhysConstants,
    seed: u64,
) -> [Vec<f64>; 3] {
    let mut rng = StdRng::seed_from_u64(seed);

    // Å/fs
    let sigma_v = (consts.kboltz * temperature / (consts.mvsq2e * mass)).sqrt();

    let mut v: [Vec<f64>; 3] = [
        (0..natoms).map(|_| normal(&mut rng) * sigma_v).collect(),
        (0..natoms).map(|_| normal(&mut rng) * sigma_v).collect(),
        (0..natoms).map(|_| normal(&mut rng) * sigma_v).collect(),
    ];

    if natoms < 2 {
        for axis in &mut v {
            axis.iter_mut().for_each(|x| *x = 0.);
        }
        return v;
    }

    for axis in &mut v {
        let mean = axis.iter().sum::<f64>() / natoms as f64;
        axis.iter_mut().for_each(|x| *x -= mean);
    }

    let sum_v_sq: f64 = v.iter().flat_map(|axis| axis.iter()).map(|x| x * x).sum();
    let current = consts.temperature(consts.ekin(sum_v_sq, mass), natoms);
    if current > 0. {
        let scale = (temperature / current).sqrt();
        for axis in &mut v {
            axis.iter_mut().for_each(|x| *x *= scale);
        }
    }
    v
}

pub fn generate(cfg: &LatticeConfig, consts: &PhysConstants) -> PhaseSpace {
    PhaseSpace {
        r: fcc_positions(cfg.natoms, cfg.box_len),
        v: maxwell_boltzmann(cfg.natoms, cfg.mass, cfg.temperature, consts, cfg.seed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_cells() {
        assert_eq!(cells_per_side(1), 1);
        assert_eq!(cells_per_side(4), 1);
        assert_eq!(cells_per_side(5), 2);
        assert_eq!(cells_per_side(108), 3);
        assert_eq!(cells_per_side(109), 4);
    }

    #[test]
    fn positions_inside_box() {
        let r = fcc_positions(100, 17.158);
        for axis in &r {
            assert_eq!(axis.len(), 100);
            assert!(axis.iter().all(|&x| x > 0. && x < 17.158));
        }
    }

    #[test]
    fn velocities_at_temperature_no_drift() {
        let consts = PhysConstants::default();
        let v = maxwell_boltzmann(64, 39.948, 120., &consts, 7);

        for axis in &v {
            let p: f64 = axis.iter().sum();
            assert!(p.abs() < 1e-12);
        }

        let sum_v_sq: f64 = v.iter().flat_map(|a| a.iter()).map(|x| x * x).sum();
        let t = consts.temperature(consts.ekin(sum_v_sq, 39.948), 64);
        assert!((t - 120.).abs() < 1e-9);
    }

    #[test]
    fn same_seed_same_configuration() {
        let cfg = LatticeConfig {
            natoms: 32,
            box_len: 12.,
            mass: 39.948,
            temperature: 80.,
            seed: 11,
        };
        let consts = PhysConstants::default();
        assert_eq!(generate(&cfg, &consts), generate(&cfg, &consts));

        let other = LatticeConfig { seed: 12, ..cfg.clone() };
        assert_ne!(generate(&cfg, &consts).v, generate(&other, &consts).v);
    }
}
