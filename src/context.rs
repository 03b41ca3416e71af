//! Execution contexts: one context and one in-order command queue per selected device.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

#[cfg(feature = "cuda")]
use crate::gpu::{GpuContext, GpuQueue};
use crate::{
    catalog::{Backend, DeviceHandle, DeviceInfo},
    error::{DeviceError, LjmdError, LjmdResult, Status},
    events::Event,
    host::{Command, HostContext, HostQueue},
    program::Kernel,
    units::Precision,
};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a context. Buffers and kernels remember the context that created them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(pub(crate) u64);

impl ContextId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Stable index of a device within the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceOrdinal(pub usize);

impl fmt::Display for DeviceOrdinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A handle to a device array. The data lives with the owning context.
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceBuffer {
    context: ContextId,
    slot: usize,
    len: usize,
    precision: Precision,
}

impl DeviceBuffer {
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }
}

/// A read that may still be in flight. The data is available once its event completes.
#[derive(Debug)]
pub struct PendingRead {
    event: Event,
    data: Arc<Mutex<Option<Vec<f64>>>>,
}

impl PendingRead {
    #[cfg(feature = "cuda")]
    pub(crate) fn ready(data: Vec<f64>) -> Self {
        Self {
            event: Event::complete(),
            data: Arc::new(Mutex::new(Some(data))),
        }
    }

    pub fn event(&self) -> Event {
        self.event.clone()
    }

    /// Wait for completion, and take the data.
    pub fn wait(self) -> Result<Vec<f64>, DeviceError> {
        self.event.wait().check("read buffer")?;
        self.data
            .lock()
            .take()
            .ok_or_else(|| DeviceError::new(Status::INVALID_VALUE, "read buffer: no data"))
    }
}

pub enum Context {
    Host(HostContext),
    #[cfg(feature = "cuda")]
    Gpu(GpuContext),
}

pub enum CommandQueue {
    Host(HostQueue),
    #[cfg(feature = "cuda")]
    Gpu(GpuQueue),
}

/// A device's context and its command queue.
pub struct ExecutionContext {
    ordinal: DeviceOrdinal,
    info: DeviceInfo,
    id: ContextId,
    // Declared before the context, so the queue drains before the context goes away.
    queue: CommandQueue,
    context: Context,
}

impl ExecutionContext {
    pub fn create(ordinal: DeviceOrdinal, device: &DeviceHandle) -> Result<Self, DeviceError> {
        let id = ContextId::next();

        let (context, queue) = match device.backend() {
            Backend::Host {
                threads,
                mem_limit,
            } => {
                let ctx = HostContext::new(id, *threads, *mem_limit)?;
                let queue = HostQueue::new(&ctx)?;
                (Context::Host(ctx), CommandQueue::Host(queue))
            }
            #[cfg(feature = "cuda")]
            Backend::Cuda { index } => {
                let ctx = GpuContext::new(id, *index)?;
                let queue = GpuQueue::new(&ctx);
                (Context::Gpu(ctx), CommandQueue::Gpu(queue))
            }
        };

        Ok(Self {
            ordinal,
            info: device.info().clone(),
            id,
            queue,
            context,
        })
    }

    pub fn ordinal(&self) -> DeviceOrdinal {
        self.ordinal
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn alloc(&self, len: usize, precision: Precision) -> Result<DeviceBuffer, DeviceError> {
        let slot = match &self.context {
            Context::Host(ctx) => ctx.alloc(len, precision),
            #[cfg(feature = "cuda")]
            Context::Gpu(ctx) => ctx.alloc(len, precision),
        }
        .map_err(|status| DeviceError::new(status, format!("allocate {len} elements")))?;

        Ok(DeviceBuffer {
            context: self.id,
            slot,
            len,
            precision,
        })
    }

    fn check_buffer(&self, buf: &DeviceBuffer, offset: usize, len: usize, what: &str) -> Result<(), DeviceError> {
        if buf.context != self.id {
            return Err(DeviceError::new(Status::INVALID_MEM_OBJECT, what));
        }
        if offset + len > buf.len {
            return Err(DeviceError::new(Status::INVALID_VALUE, what));
        }
        Ok(())
    }

    /// Write `data` into `buf` starting at `offset`. When `blocking`, returns after the write
    /// completed.
    pub fn enqueue_write(
        &self,
        buf: &DeviceBuffer,
        offset: usize,
        data: Arc<[f64]>,
        blocking: bool,
    ) -> Result<Event, DeviceError> {
        self.check_buffer(buf, offset, data.len(), "write buffer")?;

        let event = match &self.queue {
            CommandQueue::Host(q) => {
                let event = Event::queued();
                q.submit(Command::Write {
                    slot: buf.slot,
                    offset,
                    data,
                    event: event.clone(),
                })
                .map_err(|s| DeviceError::new(s, "write buffer"))?;
                event
            }
            #[cfg(feature = "cuda")]
            CommandQueue::Gpu(q) => q
                .write(buf.slot, offset, &data)
                .map_err(|s| DeviceError::new(s, "write buffer"))?,
        };

        if blocking {
            event.wait().check("write buffer")?;
        }
        Ok(event)
    }

    /// Read `len` elements of `buf` starting at `offset`.
    pub fn enqueue_read(
        &self,
        buf: &DeviceBuffer,
        offset: usize,
        len: usize,
        blocking: bool,
    ) -> Result<PendingRead, DeviceError> {
        self.check_buffer(buf, offset, len, "read buffer")?;

        let pending = match &self.queue {
            CommandQueue::Host(q) => {
                let pending = PendingRead {
                    event: Event::queued(),
                    data: Arc::new(Mutex::new(None)),
                };
                q.submit(Command::Read {
                    slot: buf.slot,
                    offset,
                    len,
                    dest: Arc::clone(&pending.data),
                    event: pending.event(),
                })
                .map_err(|s| DeviceError::new(s, "read buffer"))?;
                pending
            }
            #[cfg(feature = "cuda")]
            CommandQueue::Gpu(q) => q
                .read(buf.slot, offset, len)
                .map(PendingRead::ready)
                .map_err(|s| DeviceError::new(s, "read buffer"))?,
        };

        if blocking {
            pending.event.wait().check("read buffer")?;
        }
        Ok(pending)
    }

    /// Launch `kernel` over `global` work items. Consumes the kernel's bound arguments.
    pub fn enqueue_kernel(&self, kernel: &mut Kernel, global: usize) -> Result<Event, DeviceError> {
        let name = kernel.kind().name();
        let what = || format!("launch {name}");

        if kernel.context() != self.id {
            return Err(DeviceError::new(Status::INVALID_CONTEXT, what()));
        }
        if global == 0 {
            return Err(DeviceError::new(Status::INVALID_GLOBAL_WORK_SIZE, what()));
        }
        let args = kernel.take_args().map_err(|s| DeviceError::new(s, what()))?;

        match &self.queue {
            CommandQueue::Host(q) => {
                let event = Event::queued();
                q.submit(Command::Launch {
                    kind: kernel.kind(),
                    precision: kernel.precision(),
                    global,
                    args,
                    event: event.clone(),
                })
                .map_err(|s| DeviceError::new(s, what()))?;
                Ok(event)
            }
            #[cfg(feature = "cuda")]
            CommandQueue::Gpu(q) => q
                .launch(kernel, global, &args)
                .map_err(|s| DeviceError::new(s, what())),
        }
    }

    /// Block until every command queued so far has completed.
    pub fn finish(&self) -> Result<(), DeviceError> {
        match &self.queue {
            CommandQueue::Host(q) => {
                let event = Event::queued();
                q.submit(Command::Marker {
                    event: event.clone(),
                })
                .map_err(|s| DeviceError::new(s, "finish"))?;
                event.wait().check("finish")
            }
            #[cfg(feature = "cuda")]
            CommandQueue::Gpu(q) => q.finish().map_err(|s| DeviceError::new(s, "finish")),
        }
    }
}

/// Contexts for every selected device, created together. Creation stops at the first failure.
pub struct ContextPool {
    contexts: Vec<ExecutionContext>,
}

impl ContextPool {
    pub fn create(devices: &[DeviceHandle]) -> LjmdResult<Self> {
        let mut contexts = Vec::with_capacity(devices.len());
        for (i, device) in devices.iter().enumerate() {
            let ctx = ExecutionContext::create(DeviceOrdinal(i), device).map_err(LjmdError::DeviceInit)?;
            log::info!(
                "Device {i}: {} ({}, {} compute units)",
                ctx.info().name,
                ctx.info().kind,
                ctx.info().compute_units
            );
            contexts.push(ctx);
        }
        Ok(Self { contexts })
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecutionContext> {
        self.contexts.iter()
    }

    pub fn into_contexts(self) -> Vec<ExecutionContext> {
        self.contexts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DeviceKind, Platform};

    fn host_ctx() -> ExecutionContext {
        let platform = Platform::emulated("Test", DeviceKind::Cpu, 1);
        ExecutionContext::create(DeviceOrdinal(0), &platform.devices()[0]).unwrap()
    }

    #[test]
    fn write_then_partial_read() {
        let ctx = host_ctx();
        let buf = ctx.alloc(6, Precision::Double).unwrap();

        ctx.enqueue_write(&buf, 0, Arc::from(vec![0., 1., 2., 3., 4., 5.]), false)
            .unwrap();
        let read = ctx.enqueue_read(&buf, 2, 3, false).unwrap();
        assert_eq!(read.wait().unwrap(), vec![2., 3., 4.]);
    }

    #[test]
    fn single_precision_rounds() {
        let ctx = host_ctx();
        let buf = ctx.alloc(1, Precision::Single).unwrap();
        ctx.enqueue_write(&buf, 0, Arc::from(vec![0.1]), true).unwrap();
        let got = ctx.enqueue_read(&buf, 0, 1, true).unwrap().wait().unwrap();
        assert_eq!(got[0], 0.1_f32 as f64);
    }

    #[test]
    fn out_of_bounds_transfer_rejected() {
        let ctx = host_ctx();
        let buf = ctx.alloc(4, Precision::Double).unwrap();
        let err = ctx.enqueue_read(&buf, 3, 2, true).unwrap_err();
        assert_eq!(err.status, Status::INVALID_VALUE);
    }

    #[test]
    fn buffer_from_other_context_rejected() {
        let a = host_ctx();
        let b = host_ctx();
        let buf = a.alloc(4, Precision::Double).unwrap();

        let err = b
            .enqueue_write(&buf, 0, Arc::from(vec![1.; 4]), true)
            .unwrap_err();
        assert_eq!(err.status, Status::INVALID_MEM_OBJECT);
    }

    #[test]
    fn finish_drains_queue() {
        let ctx = host_ctx();
        let buf = ctx.alloc(1000, Precision::Double).unwrap();
        let ev = ctx
            .enqueue_write(&buf, 0, Arc::from(vec![2.; 1000]), false)
            .unwrap();
        ctx.finish().unwrap();
        assert_eq!(ev.status(), Some(Status::SUCCESS));
    }
}
