//! Native implementations of the five MD kernels, run by the host backend on a device's thread pool.
//!
//! Each kernel mirrors an entry point in `kernels/ljmd.cu`, with the same argument order. Work is
//! split into `global` work items; per-work-item energy partials land in scratch arrays of length
//! `global`, which the host reduces.

use std::ops::Range;

use num_traits::Float;
use rayon::prelude::*;

use crate::{args::ArgValue, error::Status, program::KernelKind, units::Precision};

/// Device-resident array storage for the host backend.
#[derive(Debug)]
pub enum Storage {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Storage {
    /// Fallible, so a device that runs out of memory reports it instead of aborting.
    pub fn zeroed(len: usize, precision: Precision) -> Result<Self, Status> {
        fn alloc<T: Clone + Default>(len: usize) -> Result<Vec<T>, Status> {
            let mut v = Vec::new();
            v.try_reserve_exact(len)
                .map_err(|_| Status::MEM_OBJECT_ALLOCATION_FAILURE)?;
            v.resize(len, T::default());
            Ok(v)
        }

        Ok(match precision {
            Precision::Single => Self::F32(alloc(len)?),
            Precision::Double => Self::F64(alloc(len)?),
        })
    }

    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn precision(&self) -> Precision {
        match self {
            Self::F32(_) => Precision::Single,
            Self::F64(_) => Precision::Double,
        }
    }

    pub fn write(&mut self, offset: usize, data: &[f64]) -> Result<(), Status> {
        let end = offset + data.len();
        if end > self.len() {
            return Err(Status::INVALID_VALUE);
        }
        match self {
            Self::F32(v) => {
                for (dst, src) in v[offset..end].iter_mut().zip(data) {
                    *dst = *src as f32;
                }
            }
            Self::F64(v) => v[offset..end].copy_from_slice(data),
        }
        Ok(())
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<f64>, Status> {
        let end = offset + len;
        if end > self.len() {
            return Err(Status::INVALID_VALUE);
        }
        Ok(match self {
            Self::F32(v) => v[offset..end].iter().map(|x| *x as f64).collect(),
            Self::F64(v) => v[offset..end].to_vec(),
        })
    }
}

/// Device floating point type.
pub trait Real: Float + Send + Sync + 'static {
    fn of(x: f64) -> Self;

    fn view(storage: &mut Storage) -> Option<&mut [Self]>;
}

impl Real for f32 {
    fn of(x: f64) -> Self {
        x as f32
    }

    fn view(storage: &mut Storage) -> Option<&mut [Self]> {
        match storage {
            Storage::F32(v) => Some(v),
            Storage::F64(_) => None,
        }
    }
}

impl Real for f64 {
    fn of(x: f64) -> Self {
        x
    }

    fn view(storage: &mut Storage) -> Option<&mut [Self]> {
        match storage {
            Storage::F64(v) => Some(v),
            Storage::F32(_) => None,
        }
    }
}

/// Argument access for one launch. Memory arguments are handed out once each.
struct LaunchArgs<'a, T> {
    mems: Vec<Option<&'a mut [T]>>,
    values: &'a [ArgValue],
}

impl<'a, T: Real> LaunchArgs<'a, T> {
    fn mem(&mut self, i: usize, min_len: usize) -> Result<&'a mut [T], Status> {
        let m = self
            .mems
            .get_mut(i)
            .and_then(Option::take)
            .ok_or(Status::INVALID_MEM_OBJECT)?;
        if m.len() < min_len {
            return Err(Status::INVALID_ARG_VALUE);
        }
        Ok(m)
    }

    fn int(&self, i: usize) -> Result<usize, Status> {
        match self.values.get(i) {
            Some(ArgValue::Int(v)) => usize::try_from(*v).map_err(|_| Status::INVALID_ARG_VALUE),
            _ => Err(Status::INVALID_ARG_VALUE),
        }
    }

    fn real(&self, i: usize) -> Result<T, Status> {
        match self.values.get(i) {
            Some(ArgValue::Real(v)) => Ok(T::of(*v)),
            _ => Err(Status::INVALID_ARG_VALUE),
        }
    }
}

/// Run one kernel. `storages` holds the checked-out buffer for every memory argument slot, and
/// `None` for scalar slots.
pub(crate) fn launch<T: Real>(
    kind: KernelKind,
    global: usize,
    storages: &mut [Option<Storage>],
    values: &[ArgValue],
) -> Result<(), Status> {
    if global == 0 {
        return Err(Status::INVALID_GLOBAL_WORK_SIZE);
    }

    let mut a = LaunchArgs {
        mems: storages
            .iter_mut()
            .map(|s| s.as_mut().and_then(T::view))
            .collect(),
        values,
    };

    match kind {
        KernelKind::Azzero => {
            let n = a.int(3)?;
            let fx = a.mem(0, n)?;
            let fy = a.mem(1, n)?;
            let fz = a.mem(2, n)?;
            azzero([&mut fx[..n], &mut fy[..n], &mut fz[..n]]);
        }
        KernelKind::Force => {
            let n = a.int(6)?;
            let first = a.int(13)?;
            let count = a.int(14)?;
            if first + count > n {
                return Err(Status::INVALID_ARG_VALUE);
            }
            let params = ForceParams {
                c12: a.real(8)?,
                c6: a.real(9)?,
                rcsq: a.real(10)?,
                boxby2: a.real(11)?,
                box_len: a.real(12)?,
            };
            let fx = a.mem(0, n)?;
            let fy = a.mem(1, n)?;
            let fz = a.mem(2, n)?;
            let rx = a.mem(3, n)?;
            let ry = a.mem(4, n)?;
            let rz = a.mem(5, n)?;
            let epot = a.mem(7, global)?;
            force(
                [&mut fx[..n], &mut fy[..n], &mut fz[..n]],
                [&rx[..n], &ry[..n], &rz[..n]],
                &mut epot[..global],
                &params,
                first..first + count,
            );
        }
        KernelKind::Ekin => {
            let n = a.int(3)?;
            let vx = a.mem(0, n)?;
            let vy = a.mem(1, n)?;
            let vz = a.mem(2, n)?;
            let scratch = a.mem(4, global)?;
            ekin([&vx[..n], &vy[..n], &vz[..n]], &mut scratch[..global]);
        }
        KernelKind::VerletFirst => {
            let n = a.int(9)?;
            let dt = a.real(10)?;
            let dtmf = a.real(11)?;
            let fx = a.mem(0, n)?;
            let fy = a.mem(1, n)?;
            let fz = a.mem(2, n)?;
            let rx = a.mem(3, n)?;
            let ry = a.mem(4, n)?;
            let rz = a.mem(5, n)?;
            let vx = a.mem(6, n)?;
            let vy = a.mem(7, n)?;
            let vz = a.mem(8, n)?;
            for (f, r, v) in [(fx, rx, vx), (fy, ry, vy), (fz, rz, vz)] {
                verlet_first(&f[..n], &mut r[..n], &mut v[..n], dt, dtmf);
            }
        }
        KernelKind::VerletSecond => {
            let n = a.int(6)?;
            let dtmf = a.real(8)?;
            let fx = a.mem(0, n)?;
            let fy = a.mem(1, n)?;
            let fz = a.mem(2, n)?;
            let vx = a.mem(3, n)?;
            let vy = a.mem(4, n)?;
            let vz = a.mem(5, n)?;
            for (f, v) in [(fx, vx), (fy, vy), (fz, vz)] {
                verlet_second(&f[..n], &mut v[..n], dtmf);
            }
        }
    }

    Ok(())
}

pub fn azzero<T: Real>(f: [&mut [T]; 3]) {
    for axis in f {
        axis.par_iter_mut().for_each(|v| *v = T::zero());
    }
}

/// Pair potential coefficients, and the periodic box.
#[derive(Clone, Copy, Debug)]
pub struct ForceParams<T> {
    /// 4εσ¹²
    pub c12: T,
    /// 4εσ⁶
    pub c6: T,
    /// Cutoff radius, squared.
    pub rcsq: T,
    pub boxby2: T,
    pub box_len: T,
}

/// Minimum-image convention: fold a separation into `[-box/2, box/2]`.
#[inline]
pub fn pbc<T: Real>(mut x: T, boxby2: T, box_len: T) -> T {
    while x > boxby2 {
        x = x - box_len;
    }
    while x < -boxby2 {
        x = x + box_len;
    }
    x
}

/// Force on atom `i` from all other atoms, and its half-share of the pair energies.
#[inline]
fn force_on<T: Real>(i: usize, r: &[&[T]; 3], p: &ForceParams<T>) -> ([T; 3], T) {
    let twelve = T::of(12.);
    let six = T::of(6.);
    let half = T::of(0.5);

    let mut f = [T::zero(); 3];
    let mut epot = T::zero();

    let (rx, ry, rz) = (r[0], r[1], r[2]);
    for j in 0..rx.len() {
        if j == i {
            continue;
        }
        let dx = pbc(rx[i] - rx[j], p.boxby2, p.box_len);
        let dy = pbc(ry[i] - ry[j], p.boxby2, p.box_len);
        let dz = pbc(rz[i] - rz[j], p.boxby2, p.box_len);
        let rsq = dx * dx + dy * dy + dz * dz;

        if rsq < p.rcsq {
            let rinv = T::one() / rsq;
            let r6 = rinv * rinv * rinv;
            let ffac = (twelve * p.c12 * r6 - six * p.c6) * r6 * rinv;
            epot = epot + half * r6 * (p.c12 * r6 - p.c6);

            f[0] = f[0] + dx * ffac;
            f[1] = f[1] + dy * ffac;
            f[2] = f[2] + dz * ffac;
        }
    }

    (f, epot)
}

/// Assign forces for the atoms in `owned`, evaluated against every atom. Entries outside `owned`
/// are not touched. Work item `w` handles the `w`th contiguous block of owned atoms and writes its
/// energy partial to `epot[w]`.
pub fn force<T: Real>(
    f: [&mut [T]; 3],
    r: [&[T]; 3],
    epot: &mut [T],
    p: &ForceParams<T>,
    owned: Range<usize>,
) {
    epot.par_iter_mut().for_each(|e| *e = T::zero());

    if owned.is_empty() || epot.is_empty() {
        return;
    }

    let first = owned.start;
    let chunk = owned.len().div_ceil(epot.len());

    let [fx, fy, fz] = f;
    fx[owned.clone()]
        .par_chunks_mut(chunk)
        .zip(fy[owned.clone()].par_chunks_mut(chunk))
        .zip(fz[owned].par_chunks_mut(chunk))
        .zip(epot.par_iter_mut())
        .enumerate()
        .for_each(|(w, (((cx, cy), cz), e))| {
            let base = first + w * chunk;
            for k in 0..cx.len() {
                let (fi, ei) = force_on(base + k, &r, p);
                cx[k] = fi[0];
                cy[k] = fi[1];
                cz[k] = fi[2];
                *e = *e + ei;
            }
        });
}

/// Per-work-item partial sums of v². Multiply the total by ½·mvsq2e·m for kinetic energy.
pub fn ekin<T: Real>(v: [&[T]; 3], scratch: &mut [T]) {
    let natoms = v[0].len();
    if scratch.is_empty() {
        return;
    }
    let chunk = natoms.div_ceil(scratch.len()).max(1);

    scratch.par_iter_mut().enumerate().for_each(|(w, s)| {
        let lo = (w * chunk).min(natoms);
        let hi = (lo + chunk).min(natoms);
        let mut sum = T::zero();
        for i in lo..hi {
            sum = sum + v[0][i] * v[0][i] + v[1][i] * v[1][i] + v[2][i] * v[2][i];
        }
        *s = sum;
    });
}

/// First half-kick and drift, for one axis.
pub fn verlet_first<T: Real>(f: &[T], r: &mut [T], v: &mut [T], dt: T, dtmf: T) {
    v.par_iter_mut()
        .zip(r.par_iter_mut())
        .zip(f.par_iter())
        .for_each(|((v, r), f)| {
            *v = *v + dtmf * *f;
            *r = *r + dt * *v;
        });
}

/// Second half-kick, for one axis.
pub fn verlet_second<T: Real>(f: &[T], v: &mut [T], dtmf: T) {
    v.par_iter_mut().zip(f.par_iter()).for_each(|(v, f)| {
        *v = *v + dtmf * *f;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(epsilon: f64, sigma: f64, rcut: f64, box_len: f64) -> ForceParams<f64> {
        ForceParams {
            c12: 4. * epsilon * sigma.powi(12),
            c6: 4. * epsilon * sigma.powi(6),
            rcsq: rcut * rcut,
            boxby2: 0.5 * box_len,
            box_len,
        }
    }

    #[test]
    fn pbc_folds_into_box() {
        assert_eq!(pbc(7., 5., 10.), -3.);
        assert_eq!(pbc(-26., 5., 10.), 4.);
        assert_eq!(pbc(2.5, 5., 10.), 2.5);
    }

    #[test]
    fn two_atoms_match_closed_form() {
        let (eps, sigma) = (0.2379, 3.405);
        let r = 3.8;
        let p = params(eps, sigma, 8.5, 100.);

        let rx = [0., r];
        let zeros = [0., 0.];
        let (mut fx, mut fy, mut fz) = ([9.; 2], [9.; 2], [9.; 2]);
        let mut epot = [0.; 4];

        force([&mut fx, &mut fy, &mut fz], [&rx, &zeros, &zeros], &mut epot, &p, 0..2);

        let sr = sigma / r;
        let expected = 24. * eps / r * (2. * sr.powi(12) - sr.powi(6));
        assert!((fx[1] - expected).abs() < 1e-10 * expected.abs().max(1.));
        assert!((fx[0] + expected).abs() < 1e-10 * expected.abs().max(1.));
        assert_eq!(fy, [0., 0.]);

        let e_pair = 4. * eps * (sr.powi(12) - sr.powi(6));
        let e_total: f64 = epot.iter().sum();
        assert!((e_total - e_pair).abs() < 1e-12);
    }

    #[test]
    fn force_only_writes_owned_range() {
        let p = params(0.2379, 3.405, 8.5, 20.);
        let rx = [0., 3.7, 7.5, 11.];
        let z = [0.; 4];
        let mut fx = [42.; 4];
        let (mut fy, mut fz) = ([42.; 4], [42.; 4]);
        let mut epot = [0.; 3];

        force([&mut fx, &mut fy, &mut fz], [&rx, &z, &z], &mut epot, &p, 1..3);

        assert_eq!(fx[0], 42.);
        assert_eq!(fx[3], 42.);
        assert_ne!(fx[1], 42.);
        assert_ne!(fx[2], 42.);
    }

    #[test]
    fn ekin_partials_sum_to_total() {
        let vx: Vec<f64> = (0..10).map(|i| i as f64 * 0.1).collect();
        let vy = vec![0.5; 10];
        let vz = vec![-0.2; 10];
        let mut scratch = [0.; 4];

        ekin([&vx, &vy, &vz], &mut scratch);

        let total: f64 = (0..10).map(|i| vx[i] * vx[i] + 0.25 + 0.04).sum();
        assert!((scratch.iter().sum::<f64>() - total).abs() < 1e-12);
    }

    #[test]
    fn storage_respects_bounds() {
        let mut s = Storage::zeroed(4, Precision::Single).unwrap();
        s.write(1, &[1.5, 2.5]).unwrap();
        assert_eq!(s.read(0, 4).unwrap(), vec![0., 1.5, 2.5, 0.]);
        assert_eq!(s.write(3, &[1., 1.]), Err(Status::INVALID_VALUE));
        assert!(s.read(2, 3).is_err());
    }
}
