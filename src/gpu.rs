//! GPU computation, via CUDA. Each device gets its own context and stream; kernels are compiled
//! from source at runtime with NVRTC.

use std::sync::Arc;

use cudarc::{
    driver::{
        sys::CUdevice_attribute, CudaContext, CudaSlice, CudaStream, LaunchConfig, PushKernelArg,
    },
    nvrtc::{compile_ptx_with_opts, CompileOptions},
};
use parking_lot::Mutex;

use crate::{
    args::ArgValue,
    catalog::{DeviceInfo, DeviceKind},
    context::ContextId,
    error::{DeviceError, Status},
    events::Event,
    program::{BuildError, BuildOptions, Kernel, ProgramImpl, FLOAT_DEFINE},
    units::Precision,
};

/// Largest block size we launch with. The block size must divide the global work size.
const MAX_BLOCK: usize = 256;

enum GpuSlice {
    F32(CudaSlice<f32>),
    F64(CudaSlice<f64>),
}

/// CUDA devices visible to the driver, with their properties.
pub fn discover() -> Vec<(usize, DeviceInfo)> {
    let count = match CudaContext::device_count() {
        Ok(c) => c.max(0) as usize,
        Err(e) => {
            log::warn!("CUDA driver unavailable: {e:?}");
            return Vec::new();
        }
    };

    let mut result = Vec::with_capacity(count);
    for index in 0..count {
        let ctx = match CudaContext::new(index) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("Skipping CUDA device {index}: {e:?}");
                continue;
            }
        };

        let name = ctx.name().unwrap_or_else(|_| format!("CUDA device {index}"));
        let compute_units = ctx
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)
            .map(|n| n.max(1) as usize)
            .unwrap_or(1);

        result.push((
            index,
            DeviceInfo {
                name,
                vendor: "NVIDIA".to_owned(),
                platform: "CUDA".to_owned(),
                kind: DeviceKind::Gpu,
                compute_units,
                global_mem_bytes: None,
            },
        ));
    }
    result
}

pub struct GpuContext {
    id: ContextId,
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    memory: Arc<Mutex<Vec<GpuSlice>>>,
}

impl GpuContext {
    pub fn new(id: ContextId, index: usize) -> Result<Self, DeviceError> {
        let ctx = CudaContext::new(index)
            .map_err(|e| DeviceError::new(Status::DEVICE_NOT_AVAILABLE, format!("CUDA device {index}: {e:?}")))?;
        let stream = ctx.default_stream();

        Ok(Self {
            id,
            ctx,
            stream,
            memory: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn alloc(&self, len: usize, precision: Precision) -> Result<usize, Status> {
        let slice = match precision {
            Precision::Single => self.stream.alloc_zeros::<f32>(len).map(GpuSlice::F32),
            Precision::Double => self.stream.alloc_zeros::<f64>(len).map(GpuSlice::F64),
        }
        .map_err(|_| Status::MEM_OBJECT_ALLOCATION_FAILURE)?;

        let mut memory = self.memory.lock();
        memory.push(slice);
        Ok(memory.len() - 1)
    }

    /// Compile the kernel source to PTX, and load it as a module.
    pub(crate) fn build(&self, source: &str, options: &BuildOptions) -> Result<(ProgramImpl, String), BuildError> {
        let mut opts = CompileOptions {
            use_fast_math: Some(options.fast_math),
            ..Default::default()
        };
        if options.precision == Precision::Single {
            opts.options.push(FLOAT_DEFINE.to_owned());
            opts.ftz = Some(true);
        }

        let ptx = compile_ptx_with_opts(source, opts).map_err(|e| BuildError {
            status: Status::BUILD_PROGRAM_FAILURE,
            log: format!("{e:?}"),
        })?;
        let module = self.ctx.load_module(ptx).map_err(|e| BuildError {
            status: Status::BUILD_PROGRAM_FAILURE,
            log: format!("load module on context {:?}: {e:?}", self.id),
        })?;

        Ok((ProgramImpl::Gpu(module), String::new()))
    }
}

/// Commands go to the context's stream, which executes them in order.
pub struct GpuQueue {
    stream: Arc<CudaStream>,
    memory: Arc<Mutex<Vec<GpuSlice>>>,
}

/// Block and grid sizes whose product is exactly `global`.
fn launch_config(global: usize) -> Result<LaunchConfig, Status> {
    let block = (1..=MAX_BLOCK.min(global))
        .rev()
        .find(|b| global % b == 0)
        .ok_or(Status::INVALID_GLOBAL_WORK_SIZE)?;
    let grid = u32::try_from(global / block).map_err(|_| Status::INVALID_GLOBAL_WORK_SIZE)?;

    Ok(LaunchConfig {
        grid_dim: (grid, 1, 1),
        block_dim: (block as u32, 1, 1),
        shared_mem_bytes: 0,
    })
}

impl GpuQueue {
    pub fn new(ctx: &GpuContext) -> Self {
        Self {
            stream: Arc::clone(&ctx.stream),
            memory: Arc::clone(&ctx.memory),
        }
    }

    pub fn write(&self, slot: usize, offset: usize, data: &[f64]) -> Result<Event, Status> {
        let mut memory = self.memory.lock();
        let end = offset + data.len();

        match memory.get_mut(slot).ok_or(Status::INVALID_MEM_OBJECT)? {
            GpuSlice::F32(s) => {
                if end > s.len() {
                    return Err(Status::INVALID_VALUE);
                }
                let converted: Vec<f32> = data.iter().map(|x| *x as f32).collect();
                let mut view = s.slice_mut(offset..end);
                self.stream.memcpy_htod(converted.as_slice(), &mut view)
            }
            GpuSlice::F64(s) => {
                if end > s.len() {
                    return Err(Status::INVALID_VALUE);
                }
                let mut view = s.slice_mut(offset..end);
                self.stream.memcpy_htod(data, &mut view)
            }
        }
        .map_err(|_| Status::OUT_OF_RESOURCES)?;

        Ok(Event::complete())
    }

    /// Device to host reads synchronize with the stream, so the data is ready on return.
    pub fn read(&self, slot: usize, offset: usize, len: usize) -> Result<Vec<f64>, Status> {
        let memory = self.memory.lock();
        let end = offset + len;

        match memory.get(slot).ok_or(Status::INVALID_MEM_OBJECT)? {
            GpuSlice::F32(s) => {
                if end > s.len() {
                    return Err(Status::INVALID_VALUE);
                }
                let mut host = vec![0_f32; len];
                self.stream
                    .memcpy_dtoh(&s.slice(offset..end), host.as_mut_slice())
                    .map_err(|_| Status::OUT_OF_RESOURCES)?;
                Ok(host.into_iter().map(|x| x as f64).collect())
            }
            GpuSlice::F64(s) => {
                if end > s.len() {
                    return Err(Status::INVALID_VALUE);
                }
                let mut host = vec![0_f64; len];
                self.stream
                    .memcpy_dtoh(&s.slice(offset..end), host.as_mut_slice())
                    .map_err(|_| Status::OUT_OF_RESOURCES)?;
                Ok(host)
            }
        }
    }

    pub fn launch(&self, kernel: &Kernel, global: usize, args: &[ArgValue]) -> Result<Event, Status> {
        let func = kernel.function.as_ref().ok_or(Status::INVALID_KERNEL)?;
        let cfg = launch_config(global)?;
        let memory = self.memory.lock();

        // Scalars must outlive the builder, which holds references to them.
        let ints: Vec<i32> = args
            .iter()
            .map(|a| match a {
                ArgValue::Int(v) => *v,
                _ => 0,
            })
            .collect();
        let reals_32: Vec<f32> = args
            .iter()
            .map(|a| match a {
                ArgValue::Real(v) => *v as f32,
                _ => 0.,
            })
            .collect();
        let reals_64: Vec<f64> = args
            .iter()
            .map(|a| match a {
                ArgValue::Real(v) => *v,
                _ => 0.,
            })
            .collect();

        let mut builder = self.stream.launch_builder(func);
        for (i, arg) in args.iter().enumerate() {
            match arg {
                ArgValue::Mem(slot) => match memory.get(*slot).ok_or(Status::INVALID_MEM_OBJECT)? {
                    GpuSlice::F32(s) => builder.arg(s),
                    GpuSlice::F64(s) => builder.arg(s),
                },
                ArgValue::Int(_) => builder.arg(&ints[i]),
                ArgValue::Real(_) => match kernel.precision() {
                    Precision::Single => builder.arg(&reals_32[i]),
                    Precision::Double => builder.arg(&reals_64[i]),
                },
            };
        }

        unsafe { builder.launch(cfg) }.map_err(|_| Status::OUT_OF_RESOURCES)?;
        Ok(Event::complete())
    }

    pub fn finish(&self) -> Result<(), Status> {
        self.stream.synchronize().map_err(|_| Status::OUT_OF_RESOURCES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_covers_global_exactly() {
        for global in [1, 7, 16, 250, 1024, 1000] {
            let cfg = launch_config(global).unwrap();
            assert_eq!(cfg.grid_dim.0 as usize * cfg.block_dim.0 as usize, global);
            assert!(cfg.block_dim.0 as usize <= MAX_BLOCK);
        }
    }
}
