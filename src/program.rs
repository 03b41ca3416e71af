//! Kernel program loading: one source, built once per context, five named kernels per build.
//!
//! Only CUDA contexts compile the source. Host contexts check that it declares the five entry
//! points with the right parameter counts, and always run the host implementations in
//! `kernels.rs`, so a replaced source changes nothing a host device computes.

#[cfg(feature = "cuda")]
use std::sync::Arc;

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaFunction, CudaModule};

use crate::{
    args::{ArgKind, ArgValue, KernelArg},
    context::{Context, ContextId, ExecutionContext},
    error::{LjmdError, LjmdResult, Status},
    units::Precision,
};

/// The kernel source compiled into the binary. `--kernel-source` can replace it at runtime.
pub const KERNEL_SOURCE: &str = include_str!("../kernels/ljmd.cu");

/// Defined when building for 32-bit floats.
pub const FLOAT_DEFINE: &str = "-DLJMD_USE_FLOAT";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KernelKind {
    Azzero,
    Force,
    Ekin,
    VerletFirst,
    VerletSecond,
}

impl KernelKind {
    pub const ALL: [Self; 5] = [
        Self::Azzero,
        Self::Force,
        Self::Ekin,
        Self::VerletFirst,
        Self::VerletSecond,
    ];

    /// Entry point name in the kernel source.
    pub fn name(self) -> &'static str {
        match self {
            Self::Azzero => "lj_azzero",
            Self::Force => "lj_force",
            Self::Ekin => "lj_ekin",
            Self::VerletFirst => "lj_verlet_first",
            Self::VerletSecond => "lj_verlet_second",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn signature(self) -> &'static [ArgKind] {
        use ArgKind::*;
        match self {
            // fx, fy, fz, natoms
            Self::Azzero => &[Mem, Mem, Mem, Int],
            // fx, fy, fz, rx, ry, rz, natoms, epot, c12, c6, rcsq, boxby2, box, first, count
            Self::Force => &[
                Mem, Mem, Mem, Mem, Mem, Mem, Int, Mem, Real, Real, Real, Real, Real, Int, Int,
            ],
            // vx, vy, vz, natoms, ekin
            Self::Ekin => &[Mem, Mem, Mem, Int, Mem],
            // fx, fy, fz, rx, ry, rz, vx, vy, vz, natoms, dt, dtmf
            Self::VerletFirst => &[Mem, Mem, Mem, Mem, Mem, Mem, Mem, Mem, Mem, Int, Real, Real],
            // fx, fy, fz, vx, vy, vz, natoms, dt, dtmf
            Self::VerletSecond => &[Mem, Mem, Mem, Mem, Mem, Mem, Int, Real, Real],
        }
    }
}

/// Compiler settings. Precision selects the float type; fast math relaxes IEEE semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuildOptions {
    pub precision: Precision,
    pub fast_math: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            precision: Precision::Double,
            fast_math: true,
        }
    }
}

impl BuildOptions {
    pub fn flags(&self) -> Vec<String> {
        let mut result = Vec::new();
        if self.precision == Precision::Single {
            result.push(FLOAT_DEFINE.to_owned());
            // Denormals flushed to zero in single precision.
            result.push("--ftz=true".to_owned());
        }
        if self.fast_math {
            result.push("--use_fast_math".to_owned());
        }
        result
    }
}

/// A failed build, with the compiler log.
#[derive(Clone, Debug)]
pub struct BuildError {
    pub status: Status,
    pub log: String,
}

/// An entry point found in kernel source: name and parameter count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryPoint {
    pub name: String,
    pub num_params: usize,
}

/// Find `__global__` functions in the source.
pub fn scan_entry_points(source: &str) -> Vec<EntryPoint> {
    let mut result = Vec::new();

    for (i, _) in source.match_indices("__global__") {
        let rest = &source[i + "__global__".len()..];
        let Some(open) = rest.find('(') else {
            continue;
        };
        let Some(name) = rest[..open].split_whitespace().last() else {
            continue;
        };
        let name = name.trim_start_matches('*').to_owned();

        let Some(close) = rest[open..].find(')') else {
            continue;
        };
        let params = &rest[open + 1..open + close];
        let num_params = if params.trim().is_empty() {
            0
        } else {
            params.split(',').count()
        };

        result.push(EntryPoint { name, num_params });
    }

    result
}

/// Host compilation: check that every kernel the host library implements is declared in the
/// source, with a matching parameter list. Kernel bodies are not read.
fn build_host(source: &str, options: &BuildOptions) -> Result<String, BuildError> {
    let mut log = format!("options: {}\n", options.flags().join(" "));
    let mut status = Status::SUCCESS;

    let found = scan_entry_points(source);

    for kind in KernelKind::ALL {
        match found.iter().find(|e| e.name == kind.name()) {
            Some(e) if e.num_params == kind.signature().len() => {
                log.push_str(&format!("{}: {} params\n", e.name, e.num_params));
            }
            Some(e) => {
                log.push_str(&format!(
                    "error: {} declares {} params; expected {}\n",
                    e.name,
                    e.num_params,
                    kind.signature().len()
                ));
                status |= Status::BUILD_PROGRAM_FAILURE;
            }
            None => {
                log.push_str(&format!("error: entry point {} not found\n", kind.name()));
                status |= Status::BUILD_PROGRAM_FAILURE;
            }
        }
    }

    if status.is_success() {
        Ok(log)
    } else {
        Err(BuildError { status, log })
    }
}

#[derive(Clone)]
pub(crate) enum ProgramImpl {
    Host,
    #[cfg(feature = "cuda")]
    Gpu(Arc<CudaModule>),
}

/// A kernel program built for one context.
#[derive(Clone)]
pub struct Program {
    context: ContextId,
    precision: Precision,
    log: String,
    #[cfg_attr(not(feature = "cuda"), allow(dead_code))]
    imp: ProgramImpl,
}

impl Program {
    pub fn build(ctx: &ExecutionContext, source: &str, options: &BuildOptions) -> Result<Self, BuildError> {
        let (imp, log) = match ctx.context() {
            Context::Host(_) => (ProgramImpl::Host, build_host(source, options)?),
            #[cfg(feature = "cuda")]
            Context::Gpu(gpu) => gpu.build(source, options)?,
        };

        Ok(Self {
            context: ctx.id(),
            precision: options.precision,
            log,
            imp,
        })
    }

    pub fn log(&self) -> &str {
        &self.log
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn create_kernel(&self, kind: KernelKind) -> Result<Kernel, Status> {
        let nargs = kind.signature().len();

        #[cfg(feature = "cuda")]
        let function = match &self.imp {
            ProgramImpl::Gpu(module) => Some(
                module
                    .load_function(kind.name())
                    .map_err(|_| Status::INVALID_KERNEL_NAME)?,
            ),
            ProgramImpl::Host => None,
        };

        Ok(Kernel {
            kind,
            context: self.context,
            precision: self.precision,
            args: vec![None; nargs],
            #[cfg(feature = "cuda")]
            function,
        })
    }
}

/// A kernel handle. Only valid with buffers and queues of the context that built it.
#[derive(Clone, Debug)]
pub struct Kernel {
    kind: KernelKind,
    context: ContextId,
    precision: Precision,
    args: Vec<Option<ArgValue>>,
    #[cfg(feature = "cuda")]
    pub(crate) function: Option<CudaFunction>,
}

impl Kernel {
    pub fn kind(&self) -> KernelKind {
        self.kind
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Bind one argument slot.
    pub fn set_arg(&mut self, index: usize, size: usize, arg: &KernelArg) -> Status {
        let Some(expected) = self.kind.signature().get(index).copied() else {
            return Status::INVALID_ARG_INDEX;
        };

        let value = match (expected, arg) {
            (ArgKind::Mem, KernelArg::Mem(buf)) => {
                if buf.context() != self.context {
                    return Status::INVALID_MEM_OBJECT;
                }
                if buf.precision() != self.precision {
                    return Status::INVALID_ARG_VALUE;
                }
                ArgValue::Mem(buf.slot())
            }
            (ArgKind::Int, KernelArg::Int(v)) => ArgValue::Int(*v),
            (ArgKind::Real, KernelArg::Real(v)) => ArgValue::Real(*v),
            _ => return Status::INVALID_ARG_VALUE,
        };

        if size != arg.size(self.precision) {
            return Status::INVALID_ARG_SIZE;
        }

        self.args[index] = Some(value);
        Status::SUCCESS
    }

    /// Hand the bound arguments to a launch, leaving every slot unbound.
    pub(crate) fn take_args(&mut self) -> Result<Vec<ArgValue>, Status> {
        let args: Option<Vec<_>> = self.args.iter_mut().map(Option::take).collect();
        args.ok_or(Status::INVALID_KERNEL_ARGS)
    }
}

/// The five kernels for one device.
#[derive(Clone, Debug)]
pub struct KernelSet {
    pub azzero: Kernel,
    pub force: Kernel,
    pub ekin: Kernel,
    pub verlet_first: Kernel,
    pub verlet_second: Kernel,
}

impl KernelSet {
    /// Build the program for `ctx` and extract its kernels. A build failure is fatal; the compiler
    /// log is printed in debug builds.
    pub fn load(ctx: &ExecutionContext, source: &str, options: &BuildOptions) -> LjmdResult<Self> {
        let ordinal = ctx.ordinal().0;

        let program = Program::build(ctx, source, options).map_err(|e| {
            if cfg!(debug_assertions) {
                log::error!("Build log for device {ordinal}:\n{}", e.log);
            }
            LjmdError::Build {
                ordinal,
                msg: e.status.describe(),
            }
        })?;
        log::debug!("Built kernels for device {ordinal}:\n{}", program.log());

        let kernel = |kind: KernelKind| {
            program.create_kernel(kind).map_err(|status| LjmdError::Build {
                ordinal,
                msg: format!("{}: {}", kind.name(), status.describe()),
            })
        };

        Ok(Self {
            azzero: kernel(KernelKind::Azzero)?,
            force: kernel(KernelKind::Force)?,
            ekin: kernel(KernelKind::Ekin)?,
            verlet_first: kernel(KernelKind::VerletFirst)?,
            verlet_second: kernel(KernelKind::VerletSecond)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_source_declares_all_kernels() {
        let found = scan_entry_points(KERNEL_SOURCE);
        for kind in KernelKind::ALL {
            let e = found.iter().find(|e| e.name == kind.name()).unwrap();
            assert_eq!(e.num_params, kind.signature().len(), "{}", kind.name());
        }
    }

    #[test]
    fn missing_kernel_fails_build_with_log() {
        let source = KERNEL_SOURCE.replace("lj_ekin", "lj_kinetic");
        let err = build_host(&source, &BuildOptions::default()).unwrap_err();
        assert_eq!(err.status, Status::BUILD_PROGRAM_FAILURE);
        assert!(err.log.contains("lj_ekin not found"));
    }

    #[test]
    fn flags_follow_precision() {
        let single = BuildOptions {
            precision: Precision::Single,
            fast_math: true,
        };
        assert!(single.flags().contains(&FLOAT_DEFINE.to_owned()));
        assert!(!BuildOptions::default().flags().contains(&FLOAT_DEFINE.to_owned()));
    }

    #[test]
    fn scan_counts_params() {
        let src = r#"extern "C" __global__ void foo(double *a, int n) {}
            __global__ void bar() {}"#;
        assert_eq!(
            scan_entry_points(src),
            vec![
                EntryPoint {
                    name: "foo".into(),
                    num_params: 2
                },
                EntryPoint {
                    name: "bar".into(),
                    num_params: 0
                },
            ]
        );
    }

    #[test]
    fn host_build_ignores_kernel_bodies() {
        let source: String = KernelKind::ALL
            .iter()
            .map(|kind| {
                let params: Vec<_> = (0..kind.signature().len()).map(|i| format!("int a{i}")).collect();
                format!("__global__ void {}({}) {{}}\n", kind.name(), params.join(", "))
            })
            .collect();

        let log = build_host(&source, &BuildOptions::default()).unwrap();
        assert!(log.contains("lj_force"));
    }
}
