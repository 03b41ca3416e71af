//! Per-device buffers. Every device holds full-length copies of all nine state arrays, plus energy
//! scratch sized to the global work size.

use std::sync::Arc;

use crate::{
    context::{DeviceBuffer, ExecutionContext},
    error::{DeviceError, LjmdError, LjmdResult},
    events::{Tag, WaitGroup},
    units::Precision,
};

pub struct MdBuffers {
    pub rx: DeviceBuffer,
    pub ry: DeviceBuffer,
    pub rz: DeviceBuffer,
    pub vx: DeviceBuffer,
    pub vy: DeviceBuffer,
    pub vz: DeviceBuffer,
    pub fx: DeviceBuffer,
    pub fy: DeviceBuffer,
    pub fz: DeviceBuffer,
    /// Per-work-item potential energy partials.
    pub epot: DeviceBuffer,
    /// Per-work-item Σv² partials.
    pub ekin: DeviceBuffer,
}

impl MdBuffers {
    /// Allocate everything on `ctx`. Any failure is an allocation error.
    pub fn allocate(
        ctx: &ExecutionContext,
        natoms: usize,
        nthreads: usize,
        precision: Precision,
    ) -> LjmdResult<Self> {
        let alloc = |len: usize| ctx.alloc(len, precision).map_err(LjmdError::Alloc);

        Ok(Self {
            rx: alloc(natoms)?,
            ry: alloc(natoms)?,
            rz: alloc(natoms)?,
            vx: alloc(natoms)?,
            vy: alloc(natoms)?,
            vz: alloc(natoms)?,
            fx: alloc(natoms)?,
            fy: alloc(natoms)?,
            fz: alloc(natoms)?,
            epot: alloc(nthreads)?,
            ekin: alloc(nthreads)?,
        })
    }

    pub fn natoms(&self) -> usize {
        self.rx.len()
    }

    pub fn nthreads(&self) -> usize {
        self.epot.len()
    }

    pub fn positions(&self) -> [&DeviceBuffer; 3] {
        [&self.rx, &self.ry, &self.rz]
    }

    pub fn velocities(&self) -> [&DeviceBuffer; 3] {
        [&self.vx, &self.vy, &self.vz]
    }

    pub fn forces(&self) -> [&DeviceBuffer; 3] {
        [&self.fx, &self.fy, &self.fz]
    }

    /// Write full position and velocity arrays. Completion signals are tagged `Upload`; with
    /// `blocking` each write has finished on return.
    pub fn upload(
        &self,
        ctx: &ExecutionContext,
        r: &[Arc<[f64]>; 3],
        v: &[Arc<[f64]>; 3],
        blocking: bool,
        waits: &mut WaitGroup,
    ) -> Result<(), DeviceError> {
        for (buf, data) in self
            .positions()
            .into_iter()
            .zip(r)
            .chain(self.velocities().into_iter().zip(v))
        {
            let ev = ctx.enqueue_write(buf, 0, Arc::clone(data), blocking)?;
            waits.tag(Tag::Upload, ev);
        }
        Ok(())
    }
}
