//! The host backend: devices emulated on the machine's own cores.
//!
//! Each context owns a memory arena and a rayon pool. Each queue owns a worker thread that drains
//! commands strictly in submission order and signals one event per command.

use std::{
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::{
    args::ArgValue,
    context::ContextId,
    error::{DeviceError, Status},
    events::Event,
    kernels::{self, Storage},
    program::KernelKind,
    units::Precision,
};

#[derive(Debug)]
struct HostMemory {
    slots: Vec<Option<Storage>>,
    used_bytes: usize,
    limit_bytes: usize,
}

impl HostMemory {
    fn alloc(&mut self, len: usize, precision: Precision) -> Result<usize, Status> {
        let bytes = len
            .checked_mul(precision.size_bytes())
            .ok_or(Status::INVALID_VALUE)?;
        if self.used_bytes.saturating_add(bytes) > self.limit_bytes {
            return Err(Status::MEM_OBJECT_ALLOCATION_FAILURE);
        }

        let storage = Storage::zeroed(len, precision)?;
        self.used_bytes += bytes;
        self.slots.push(Some(storage));
        Ok(self.slots.len() - 1)
    }

    fn get_mut(&mut self, slot: usize) -> Result<&mut Storage, Status> {
        self.slots
            .get_mut(slot)
            .and_then(Option::as_mut)
            .ok_or(Status::INVALID_MEM_OBJECT)
    }

    /// Move the storage for each memory argument out of the arena for the duration of a launch.
    /// A buffer bound to two slots of one launch is rejected.
    fn checkout(&mut self, slots: &[Option<usize>]) -> Result<Vec<Option<Storage>>, Status> {
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            let taken = match slot {
                Some(s) => match self.slots.get_mut(*s).and_then(Option::take) {
                    Some(storage) => Some(storage),
                    None => {
                        self.checkin(&slots[..out.len()], out);
                        return Err(Status::INVALID_MEM_OBJECT);
                    }
                },
                None => None,
            };
            out.push(taken);
        }
        Ok(out)
    }

    fn checkin(&mut self, slots: &[Option<usize>], storages: Vec<Option<Storage>>) {
        for (slot, storage) in slots.iter().zip(storages) {
            if let (Some(s), Some(storage)) = (slot, storage) {
                self.slots[*s] = Some(storage);
            }
        }
    }
}

/// A host device's context: its memory and its compute pool.
#[derive(Clone)]
pub struct HostContext {
    pub(crate) id: ContextId,
    memory: Arc<Mutex<HostMemory>>,
    pool: Arc<ThreadPool>,
}

impl HostContext {
    pub fn new(id: ContextId, threads: usize, limit_bytes: usize) -> Result<Self, DeviceError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(move |i| format!("ljmd-host-{}-{i}", id.0))
            .build()
            .map_err(|e| DeviceError::new(Status::OUT_OF_RESOURCES, format!("thread pool: {e}")))?;

        Ok(Self {
            id,
            memory: Arc::new(Mutex::new(HostMemory {
                slots: Vec::new(),
                used_bytes: 0,
                limit_bytes,
            })),
            pool: Arc::new(pool),
        })
    }

    /// Returns the slot index of the new buffer.
    pub fn alloc(&self, len: usize, precision: Precision) -> Result<usize, Status> {
        self.memory.lock().alloc(len, precision)
    }

    pub fn used_bytes(&self) -> usize {
        self.memory.lock().used_bytes
    }
}

pub(crate) enum Command {
    Write {
        slot: usize,
        offset: usize,
        data: Arc<[f64]>,
        event: Event,
    },
    Read {
        slot: usize,
        offset: usize,
        len: usize,
        dest: Arc<Mutex<Option<Vec<f64>>>>,
        event: Event,
    },
    Launch {
        kind: KernelKind,
        precision: Precision,
        global: usize,
        args: Vec<ArgValue>,
        event: Event,
    },
    Marker {
        event: Event,
    },
}

/// An in-order command queue bound to one host context.
pub struct HostQueue {
    tx: Option<mpsc::Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl HostQueue {
    pub fn new(ctx: &HostContext) -> Result<Self, DeviceError> {
        let (tx, rx) = mpsc::channel();
        let memory = Arc::clone(&ctx.memory);
        let pool = Arc::clone(&ctx.pool);

        let worker = thread::Builder::new()
            .name(format!("ljmd-queue-{}", ctx.id.0))
            .spawn(move || run_worker(rx, memory, pool))
            .map_err(|e| {
                DeviceError::new(Status::OUT_OF_RESOURCES, format!("queue worker: {e}"))
            })?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    pub(crate) fn submit(&self, cmd: Command) -> Result<(), Status> {
        match &self.tx {
            Some(tx) => tx.send(cmd).map_err(|_| Status::INVALID_COMMAND_QUEUE),
            None => Err(Status::INVALID_COMMAND_QUEUE),
        }
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued, then exit.
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(rx: mpsc::Receiver<Command>, memory: Arc<Mutex<HostMemory>>, pool: Arc<ThreadPool>) {
    for cmd in rx {
        match cmd {
            Command::Write {
                slot,
                offset,
                data,
                event,
            } => {
                let result = memory
                    .lock()
                    .get_mut(slot)
                    .and_then(|s| s.write(offset, &data));
                event.signal(result.err().unwrap_or(Status::SUCCESS));
            }
            Command::Read {
                slot,
                offset,
                len,
                dest,
                event,
            } => {
                let result = memory.lock().get_mut(slot).and_then(|s| s.read(offset, len));
                match result {
                    Ok(data) => {
                        *dest.lock() = Some(data);
                        event.signal(Status::SUCCESS);
                    }
                    Err(status) => event.signal(status),
                }
            }
            Command::Launch {
                kind,
                precision,
                global,
                args,
                event,
            } => {
                let slots: Vec<Option<usize>> = args
                    .iter()
                    .map(|a| match a {
                        ArgValue::Mem(s) => Some(*s),
                        _ => None,
                    })
                    .collect();

                let checked_out = memory.lock().checkout(&slots);
                let status = match checked_out {
                    Ok(mut storages) => {
                        let result = pool.install(|| match precision {
                            Precision::Single => {
                                kernels::launch::<f32>(kind, global, &mut storages, &args)
                            }
                            Precision::Double => {
                                kernels::launch::<f64>(kind, global, &mut storages, &args)
                            }
                        });
                        memory.lock().checkin(&slots, storages);
                        result.err().unwrap_or(Status::SUCCESS)
                    }
                    Err(status) => status,
                };
                event.signal(status);
            }
            Command::Marker { event } => event.signal(Status::SUCCESS),
        }
    }
}
