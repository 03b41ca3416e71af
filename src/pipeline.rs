//! The per-timestep pipeline across all devices.
//!
//! Priming (once): zero forces → force → merge → kinetic energy → reduce → output.
//! Each step: [output] → verlet first half → force → merge → verlet second half →
//! [kinetic energy → snapshot reads, when the next step prints or the run ends].

use std::{num::NonZeroUsize, sync::Arc, time::Instant};

use crate::{
    args::{bind_args, int_arg, KernelArg},
    buffers::MdBuffers,
    catalog::DeviceHandle,
    config::TransferMode,
    context::{ContextPool, DeviceOrdinal, ExecutionContext, PendingRead},
    error::{DeviceError, LjmdError, LjmdResult, Status},
    events::{Tag, WaitGroup},
    merge::{merge_forces, ForceScratch},
    output::Observer,
    partition::Partition,
    program::{BuildOptions, Kernel, KernelSet, KERNEL_SOURCE},
    state::SimulationState,
    units::PhysConstants,
    util::reduce,
};

/// When values read for output are consumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputPolicy {
    /// Snapshot reads block; values are reduced as soon as they're read.
    Immediate,
    /// Snapshot reads are enqueued at the end of a step and waited on only when the next step
    /// prints, overlapping the transfer with the host's work in between.
    LagByOne,
}

impl From<TransferMode> for OutputPolicy {
    fn from(mode: TransferMode) -> Self {
        match mode {
            TransferMode::Blocking => Self::Immediate,
            TransferMode::Async => Self::LagByOne,
        }
    }
}

/// Everything one device needs for the run.
pub struct DeviceBundle {
    pub ctx: ExecutionContext,
    pub kernels: KernelSet,
    pub buffers: MdBuffers,
}

/// Per-device bundles, indexed by device ordinal.
pub struct DeviceArena {
    bundles: Vec<DeviceBundle>,
}

impl DeviceArena {
    /// Zip the per-device pieces together. Lengths must agree, and each device's kernels and
    /// buffers must belong to its own context.
    pub fn assemble(
        contexts: Vec<ExecutionContext>,
        kernels: Vec<KernelSet>,
        buffers: Vec<MdBuffers>,
    ) -> LjmdResult<Self> {
        if contexts.is_empty() || contexts.len() != kernels.len() || contexts.len() != buffers.len() {
            return Err(LjmdError::DeviceInit(DeviceError::new(
                Status::INVALID_VALUE,
                format!(
                    "device arena: {} contexts, {} kernel sets, {} buffer sets",
                    contexts.len(),
                    kernels.len(),
                    buffers.len()
                ),
            )));
        }

        let mut bundles = Vec::with_capacity(contexts.len());
        for (i, ((ctx, kernels), buffers)) in contexts.into_iter().zip(kernels).zip(buffers).enumerate() {
            if ctx.ordinal() != DeviceOrdinal(i)
                || kernels.force.context() != ctx.id()
                || buffers.rx.context() != ctx.id()
            {
                return Err(LjmdError::DeviceInit(DeviceError::new(
                    Status::INVALID_CONTEXT,
                    format!("device arena: bundle {i} mixes contexts"),
                )));
            }
            bundles.push(DeviceBundle { ctx, kernels, buffers });
        }

        Ok(Self { bundles })
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    pub fn get(&self, ordinal: DeviceOrdinal) -> Option<&DeviceBundle> {
        self.bundles.get(ordinal.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceBundle> {
        self.bundles.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceBundle> {
        self.bundles.iter_mut()
    }

    /// Device 0. Kinetic energy and positions are read from here; every device holds the same
    /// copy.
    pub fn primary(&self) -> &DeviceBundle {
        &self.bundles[0]
    }

    fn primary_mut(&mut self) -> &mut DeviceBundle {
        &mut self.bundles[0]
    }
}

/// Settings for a device run.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Global work size per device.
    pub nthreads: usize,
    pub transfer: TransferMode,
    pub build: BuildOptions,
    pub source: String,
    pub consts: PhysConstants,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            nthreads: 16,
            transfer: TransferMode::default(),
            build: BuildOptions::default(),
            source: KERNEL_SOURCE.to_owned(),
            consts: PhysConstants::default(),
        }
    }
}

/// Reads enqueued for the next printed frame.
struct Snapshot {
    epot: Vec<PendingRead>,
    ekin: PendingRead,
    r: [PendingRead; 3],
}

/// Bind every argument of `kernel`, check the combined status, and launch.
fn launch(ctx: &ExecutionContext, kernel: &mut Kernel, args: &[KernelArg], nthreads: usize) -> LjmdResult<()> {
    let name = kernel.kind().name();
    bind_args(kernel, 0, args).check(format!("bind {name} args"))?;
    ctx.enqueue_kernel(kernel, nthreads)?;
    Ok(())
}

pub struct Simulation {
    state: SimulationState,
    arena: DeviceArena,
    partition: Partition,
    scratch: ForceScratch,
    waits: WaitGroup,
    consts: PhysConstants,
    nthreads: usize,
    nprint: usize,
    transfer: TransferMode,
    policy: OutputPolicy,
    pending: Option<Snapshot>,
}

impl Simulation {
    /// Create contexts on every device, build kernels, allocate buffers, and upload the initial
    /// positions and velocities to every device.
    pub fn new(
        devices: &[DeviceHandle],
        state: SimulationState,
        nprint: usize,
        opts: &RunOptions,
    ) -> LjmdResult<Self> {
        let Some(ndevices) = NonZeroUsize::new(devices.len()) else {
            return Err(LjmdError::NoDevices("selected".to_owned()));
        };
        if opts.nthreads == 0 {
            return Err(LjmdError::Usage("thread count must be positive".to_owned()));
        }
        if nprint == 0 {
            return Err(LjmdError::Input("print interval must be positive".to_owned()));
        }
        state.check()?;

        let pool = ContextPool::create(devices)?;

        let mut kernels = Vec::with_capacity(pool.len());
        let mut buffers = Vec::with_capacity(pool.len());
        for ctx in pool.iter() {
            kernels.push(KernelSet::load(ctx, &opts.source, &opts.build)?);
            buffers.push(MdBuffers::allocate(
                ctx,
                state.natoms,
                opts.nthreads,
                opts.build.precision,
            )?);
        }
        let arena = DeviceArena::assemble(pool.into_contexts(), kernels, buffers)?;

        let partition = Partition::new(state.natoms, ndevices);
        for (i, r) in partition.ranges().iter().enumerate() {
            log::debug!("Device {i} owns atoms {:?}", r.as_range());
        }

        let mut result = Self {
            scratch: ForceScratch::new(state.natoms),
            state,
            arena,
            partition,
            waits: WaitGroup::new(),
            consts: opts.consts,
            nthreads: opts.nthreads,
            nprint,
            transfer: opts.transfer,
            policy: opts.transfer.into(),
            pending: None,
        };
        result.upload()?;
        Ok(result)
    }

    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    pub fn into_state(self) -> SimulationState {
        self.state
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn arena(&self) -> &DeviceArena {
        &self.arena
    }

    pub fn policy(&self) -> OutputPolicy {
        self.policy
    }

    fn blocking(&self) -> bool {
        self.transfer == TransferMode::Blocking
    }

    fn upload(&mut self) -> LjmdResult<()> {
        let r: [Arc<[f64]>; 3] = [
            Arc::from(self.state.rx.as_slice()),
            Arc::from(self.state.ry.as_slice()),
            Arc::from(self.state.rz.as_slice()),
        ];
        let v: [Arc<[f64]>; 3] = [
            Arc::from(self.state.vx.as_slice()),
            Arc::from(self.state.vy.as_slice()),
            Arc::from(self.state.vz.as_slice()),
        ];

        let blocking = self.blocking();
        for bundle in self.arena.iter() {
            bundle.buffers.upload(&bundle.ctx, &r, &v, blocking, &mut self.waits)?;
        }
        self.waits.wait(&[Tag::Upload]).check("upload state")?;
        Ok(())
    }

    /// Zero the force arrays on every device, over all N atoms.
    pub fn zero_forces(&mut self) -> LjmdResult<()> {
        let natoms = int_arg(self.state.natoms).map_err(|s| DeviceError::new(s, "atom count"))?;

        for DeviceBundle { ctx, kernels, buffers } in self.arena.iter_mut() {
            let args = [
                KernelArg::Mem(&buffers.fx),
                KernelArg::Mem(&buffers.fy),
                KernelArg::Mem(&buffers.fz),
                KernelArg::Int(natoms),
            ];
            launch(ctx, &mut kernels.azzero, &args, self.nthreads)?;
        }
        Ok(())
    }

    /// Each device computes forces for its own atom range; then the fragments are merged.
    pub fn compute_forces(&mut self) -> LjmdResult<()> {
        let s = &self.state;
        let to_int = |v: usize| int_arg(v).map_err(|st| DeviceError::new(st, "atom index"));
        let natoms = to_int(s.natoms)?;

        for DeviceBundle { ctx, kernels, buffers } in self.arena.iter_mut() {
            let range = self.partition.range(ctx.ordinal().0);
            let args = [
                KernelArg::Mem(&buffers.fx),
                KernelArg::Mem(&buffers.fy),
                KernelArg::Mem(&buffers.fz),
                KernelArg::Mem(&buffers.rx),
                KernelArg::Mem(&buffers.ry),
                KernelArg::Mem(&buffers.rz),
                KernelArg::Int(natoms),
                KernelArg::Mem(&buffers.epot),
                KernelArg::Real(s.c12()),
                KernelArg::Real(s.c6()),
                KernelArg::Real(s.rcut * s.rcut),
                KernelArg::Real(0.5 * s.box_len),
                KernelArg::Real(s.box_len),
                KernelArg::Int(to_int(range.first)?),
                KernelArg::Int(to_int(range.count)?),
            ];
            launch(ctx, &mut kernels.force, &args, self.nthreads)?;
        }

        merge_forces(
            &self.arena,
            &self.partition,
            &mut self.scratch,
            self.transfer == TransferMode::Blocking,
            &mut self.waits,
        )
    }

    fn verlet_first(&mut self) -> LjmdResult<()> {
        let s = &self.state;
        let natoms = int_arg(s.natoms).map_err(|st| DeviceError::new(st, "atom count"))?;
        let dtmf = self.consts.dtmf(s.dt, s.mass);

        for DeviceBundle { ctx, kernels, buffers } in self.arena.iter_mut() {
            let args = [
                KernelArg::Mem(&buffers.fx),
                KernelArg::Mem(&buffers.fy),
                KernelArg::Mem(&buffers.fz),
                KernelArg::Mem(&buffers.rx),
                KernelArg::Mem(&buffers.ry),
                KernelArg::Mem(&buffers.rz),
                KernelArg::Mem(&buffers.vx),
                KernelArg::Mem(&buffers.vy),
                KernelArg::Mem(&buffers.vz),
                KernelArg::Int(natoms),
                KernelArg::Real(s.dt),
                KernelArg::Real(dtmf),
            ];
            launch(ctx, &mut kernels.verlet_first, &args, self.nthreads)?;
        }
        Ok(())
    }

    fn verlet_second(&mut self) -> LjmdResult<()> {
        let s = &self.state;
        let natoms = int_arg(s.natoms).map_err(|st| DeviceError::new(st, "atom count"))?;
        let dtmf = self.consts.dtmf(s.dt, s.mass);

        for DeviceBundle { ctx, kernels, buffers } in self.arena.iter_mut() {
            let args = [
                KernelArg::Mem(&buffers.fx),
                KernelArg::Mem(&buffers.fy),
                KernelArg::Mem(&buffers.fz),
                KernelArg::Mem(&buffers.vx),
                KernelArg::Mem(&buffers.vy),
                KernelArg::Mem(&buffers.vz),
                KernelArg::Int(natoms),
                KernelArg::Real(s.dt),
                KernelArg::Real(dtmf),
            ];
            launch(ctx, &mut kernels.verlet_second, &args, self.nthreads)?;
        }
        Ok(())
    }

    /// Launch the kinetic energy kernel on device 0, and read back everything a printed frame
    /// needs. Under `Immediate`, the values are reduced before returning.
    fn enqueue_snapshot(&mut self) -> LjmdResult<()> {
        let natoms = int_arg(self.state.natoms).map_err(|st| DeviceError::new(st, "atom count"))?;
        let nthreads = self.nthreads;
        let blocking = self.blocking();

        let DeviceBundle { ctx, kernels, buffers } = self.arena.primary_mut();
        let args = [
            KernelArg::Mem(&buffers.vx),
            KernelArg::Mem(&buffers.vy),
            KernelArg::Mem(&buffers.vz),
            KernelArg::Int(natoms),
            KernelArg::Mem(&buffers.ekin),
        ];
        launch(ctx, &mut kernels.ekin, &args, nthreads)?;

        let primary = self.arena.primary();
        let ekin = primary.ctx.enqueue_read(&primary.buffers.ekin, 0, nthreads, blocking)?;
        let r = [
            primary.ctx.enqueue_read(&primary.buffers.rx, 0, self.state.natoms, blocking)?,
            primary.ctx.enqueue_read(&primary.buffers.ry, 0, self.state.natoms, blocking)?,
            primary.ctx.enqueue_read(&primary.buffers.rz, 0, self.state.natoms, blocking)?,
        ];
        let mut epot = Vec::with_capacity(self.arena.len());
        for bundle in self.arena.iter() {
            epot.push(bundle.ctx.enqueue_read(&bundle.buffers.epot, 0, nthreads, blocking)?);
        }

        for read in epot.iter().chain([&ekin]).chain(r.iter()) {
            self.waits.tag(Tag::Output, read.event());
        }
        self.pending = Some(Snapshot { epot, ekin, r });

        if self.policy == OutputPolicy::Immediate {
            self.collect_snapshot()?;
        }
        Ok(())
    }

    /// Wait for the outstanding snapshot, if any, and reduce it into the host state.
    fn collect_snapshot(&mut self) -> LjmdResult<()> {
        let Some(snapshot) = self.pending.take() else {
            return Ok(());
        };
        self.waits.wait(&[Tag::Output]).check("read output snapshot")?;

        let mut epot = 0.;
        for read in snapshot.epot {
            epot += reduce(&read.wait()?);
        }
        let sum_v_sq = reduce(&snapshot.ekin.wait()?);
        let [rx, ry, rz] = snapshot.r;

        let s = &mut self.state;
        s.epot = epot;
        s.ekin = self.consts.ekin(sum_v_sq, s.mass);
        s.temp = self.consts.temperature(s.ekin, s.natoms);
        s.rx = rx.wait()?;
        s.ry = ry.wait()?;
        s.rz = rz.wait()?;
        Ok(())
    }

    /// Step 0: compute initial forces and energies, and emit the first frame.
    pub fn prime(&mut self, out: &mut impl Observer) -> LjmdResult<()> {
        self.zero_forces()?;
        self.compute_forces()?;
        self.enqueue_snapshot()?;
        self.collect_snapshot()?;
        out.observe(&self.state)
    }

    /// Advance one step, to step index `nfi`. Frames for step `nfi` report the state at the end of
    /// the previous step.
    fn step(&mut self, nfi: usize, last: usize, out: &mut impl Observer) -> LjmdResult<()> {
        self.state.nfi = nfi;

        if nfi % self.nprint == 0 {
            self.collect_snapshot()?;
            out.observe(&self.state)?;
        }

        self.verlet_first()?;
        self.compute_forces()?;
        self.verlet_second()?;

        let next_prints = nfi < last && (nfi + 1) % self.nprint == 0;
        if next_prints || nfi == last {
            self.enqueue_snapshot()?;
        }
        Ok(())
    }

    /// Prime, then run `nsteps` steps from the current step index.
    pub fn run(&mut self, out: &mut impl Observer) -> LjmdResult<()> {
        let first = self.state.nfi;
        let last = first + self.state.nsteps;

        self.prime(out)?;

        let start = Instant::now();
        for nfi in first + 1..=last {
            self.step(nfi, last, out)?;
        }
        self.finish()?;

        let elapsed = start.elapsed();
        log::info!(
            "MD loop: {} steps on {} device(s) in {:.3} s ({:.3} ms/step)",
            self.state.nsteps,
            self.arena.len(),
            elapsed.as_secs_f64(),
            elapsed.as_secs_f64() * 1e3 / self.state.nsteps.max(1) as f64
        );
        Ok(())
    }

    /// Bring the final state to the host: the last snapshot, and velocities.
    fn finish(&mut self) -> LjmdResult<()> {
        self.collect_snapshot()?;

        let primary = self.arena.primary();
        let n = self.state.natoms;
        let [vx, vy, vz] = primary
            .buffers
            .velocities()
            .map(|buf| primary.ctx.enqueue_read(buf, 0, n, true));
        self.state.vx = vx?.wait()?;
        self.state.vy = vy?.wait()?;
        self.state.vz = vz?.wait()?;

        for bundle in self.arena.iter() {
            bundle.ctx.finish()?;
        }
        Ok(())
    }

    /// Read the full force vectors held by one device.
    pub fn read_forces(&self, ordinal: DeviceOrdinal) -> LjmdResult<[Vec<f64>; 3]> {
        let bundle = self.arena.get(ordinal).ok_or_else(|| {
            DeviceError::new(Status::DEVICE_NOT_FOUND, format!("device {ordinal}"))
        })?;
        let n = self.state.natoms;

        let [fx, fy, fz] = bundle
            .buffers
            .forces()
            .map(|buf| bundle.ctx.enqueue_read(buf, 0, n, true));
        Ok([fx?.wait()?, fy?.wait()?, fz?.wait()?])
    }
}
