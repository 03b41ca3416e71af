//! Force fragment merge. Each device computes forces for its own atom range only; this reads every
//! device's fragment back, assembles the full vectors on the host, and writes them to every device.

use std::{sync::Arc, time::Instant};

use crate::{
    error::LjmdResult,
    events::{Tag, WaitGroup},
    partition::Partition,
    pipeline::DeviceArena,
};

/// Host-side assembly buffers for the full force vectors.
#[derive(Clone, Debug, PartialEq)]
pub struct ForceScratch {
    pub f: [Vec<f64>; 3],
}

impl ForceScratch {
    pub fn new(natoms: usize) -> Self {
        Self {
            f: [vec![0.; natoms], vec![0.; natoms], vec![0.; natoms]],
        }
    }

    fn shared(&self) -> [Arc<[f64]>; 3] {
        [
            Arc::from(self.f[0].as_slice()),
            Arc::from(self.f[1].as_slice()),
            Arc::from(self.f[2].as_slice()),
        ]
    }
}

/// Gather fragments, then broadcast. One wait covers all fragment reads and one covers all
/// broadcast writes; no kernel may be launched on any device before this returns. A no-op with a
/// single device.
pub fn merge_forces(
    arena: &DeviceArena,
    partition: &Partition,
    scratch: &mut ForceScratch,
    blocking: bool,
    waits: &mut WaitGroup,
) -> LjmdResult<()> {
    if arena.len() == 1 {
        return Ok(());
    }
    let start = Instant::now();

    let mut fragments = Vec::with_capacity(3 * arena.len());
    for bundle in arena.iter() {
        let range = partition.range(bundle.ctx.ordinal().0);
        for (axis, buf) in bundle.buffers.forces().into_iter().enumerate() {
            let read = bundle.ctx.enqueue_read(buf, range.first, range.count, blocking)?;
            waits.tag(Tag::Fragments, read.event());
            fragments.push((axis, range, read));
        }
    }
    waits.wait(&[Tag::Fragments]).check("read force fragments")?;

    // Ranges are disjoint, so each fragment lands in its own part of the scratch.
    for (axis, range, read) in fragments {
        let data = read.wait()?;
        scratch.f[axis][range.as_range()].copy_from_slice(&data);
    }

    let full = scratch.shared();
    for bundle in arena.iter() {
        for (buf, data) in bundle.buffers.forces().into_iter().zip(&full) {
            let ev = bundle.ctx.enqueue_write(buf, 0, Arc::clone(data), blocking)?;
            waits.tag(Tag::Broadcast, ev);
        }
    }
    waits.wait(&[Tag::Broadcast]).check("broadcast forces")?;

    log::trace!("Force merge over {} devices: {:?}", arena.len(), start.elapsed());
    Ok(())
}
