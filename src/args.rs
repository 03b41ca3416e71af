//! Kernel argument binding: an ordered list of typed descriptors bound to consecutive slots.

use std::mem;

use crate::{context::DeviceBuffer, error::Status, program::Kernel, units::Precision};

/// One kernel argument, as supplied by the caller.
#[derive(Clone, Copy, Debug)]
pub enum KernelArg<'a> {
    Mem(&'a DeviceBuffer),
    Int(i32),
    /// Converted to the kernel's precision when bound.
    Real(f64),
}

impl KernelArg<'_> {
    /// Size in bytes of the value as the kernel sees it.
    pub fn size(&self, precision: Precision) -> usize {
        match self {
            Self::Mem(_) => mem::size_of::<usize>(),
            Self::Int(_) => mem::size_of::<i32>(),
            Self::Real(_) => precision.size_bytes(),
        }
    }
}

/// The expected kind of a kernel parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    Mem,
    Int,
    Real,
}

/// A bound argument, stored in a kernel until its next launch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ArgValue {
    /// Buffer slot within the kernel's context.
    Mem(usize),
    Int(i32),
    Real(f64),
}

/// Bind `args` to the slots `first, first + 1, ...` of `kernel`. Every argument is attempted; the
/// returned status is the first failure, or success. Check it once before launching.
pub fn bind_args(kernel: &mut Kernel, first: usize, args: &[KernelArg]) -> Status {
    let mut status = Status::SUCCESS;
    for (i, arg) in args.iter().enumerate() {
        status |= kernel.set_arg(first + i, arg.size(kernel.precision()), arg);
    }
    status
}

/// Atom counts and indices are passed to kernels as 32-bit ints.
pub fn int_arg(v: usize) -> Result<i32, Status> {
    i32::try_from(v).map_err(|_| Status::INVALID_ARG_VALUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::{DeviceKind, Platform},
        context::{DeviceOrdinal, ExecutionContext},
        program::{BuildOptions, KernelSet, KERNEL_SOURCE},
    };

    fn setup() -> (ExecutionContext, KernelSet) {
        let platform = Platform::emulated("Test", DeviceKind::Cpu, 1);
        let ctx = ExecutionContext::create(DeviceOrdinal(0), &platform.devices()[0]).unwrap();
        let kernels = KernelSet::load(&ctx, KERNEL_SOURCE, &BuildOptions::default()).unwrap();
        (ctx, kernels)
    }

    #[test]
    fn bind_and_launch_azzero() {
        let (ctx, mut k) = setup();
        let f: Vec<_> = (0..3).map(|_| ctx.alloc(5, Precision::Double).unwrap()).collect();
        for buf in &f {
            ctx.enqueue_write(buf, 0, std::sync::Arc::from(vec![3.5; 5]), true)
                .unwrap();
        }

        let status = bind_args(
            &mut k.azzero,
            0,
            &[
                KernelArg::Mem(&f[0]),
                KernelArg::Mem(&f[1]),
                KernelArg::Mem(&f[2]),
                KernelArg::Int(5),
            ],
        );
        assert!(status.is_success());
        ctx.enqueue_kernel(&mut k.azzero, 16).unwrap().wait().check("azzero").unwrap();

        for buf in &f {
            let got = ctx.enqueue_read(buf, 0, 5, true).unwrap().wait().unwrap();
            assert_eq!(got, vec![0.; 5]);
        }
    }

    #[test]
    fn arguments_are_not_sticky() {
        let (ctx, mut k) = setup();
        let f: Vec<_> = (0..3).map(|_| ctx.alloc(2, Precision::Double).unwrap()).collect();
        let args = [
            KernelArg::Mem(&f[0]),
            KernelArg::Mem(&f[1]),
            KernelArg::Mem(&f[2]),
            KernelArg::Int(2),
        ];

        assert!(bind_args(&mut k.azzero, 0, &args).is_success());
        ctx.enqueue_kernel(&mut k.azzero, 4).unwrap();

        let err = ctx.enqueue_kernel(&mut k.azzero, 4).unwrap_err();
        assert_eq!(err.status, Status::INVALID_KERNEL_ARGS);
    }

    #[test]
    fn binding_errors_accumulate() {
        let (ctx, mut k) = setup();
        let buf = ctx.alloc(2, Precision::Double).unwrap();

        // Slot 3 of azzero is an int; slot 4 doesn't exist.
        let status = bind_args(
            &mut k.azzero,
            2,
            &[
                KernelArg::Mem(&buf),
                KernelArg::Real(1.0),
                KernelArg::Int(2),
            ],
        );
        assert_eq!(status, Status::INVALID_ARG_VALUE);

        let status = bind_args(&mut k.azzero, 4, &[KernelArg::Int(2)]);
        assert_eq!(status, Status::INVALID_ARG_INDEX);
    }

    #[test]
    fn wrong_size_rejected() {
        let (_ctx, mut k) = setup();
        let status = k.azzero.set_arg(3, 8, &KernelArg::Int(2));
        assert_eq!(status, Status::INVALID_ARG_SIZE);
    }

    #[test]
    fn cross_context_use_rejected() {
        let (ctx_a, mut k_a) = setup();
        let (ctx_b, _k_b) = setup();
        let foreign = ctx_b.alloc(2, Precision::Double).unwrap();

        let status = bind_args(&mut k_a.azzero, 0, &[KernelArg::Mem(&foreign)]);
        assert_eq!(status, Status::INVALID_MEM_OBJECT);

        let own: Vec<_> = (0..3).map(|_| ctx_a.alloc(2, Precision::Double).unwrap()).collect();
        let args = [
            KernelArg::Mem(&own[0]),
            KernelArg::Mem(&own[1]),
            KernelArg::Mem(&own[2]),
            KernelArg::Int(2),
        ];
        assert!(bind_args(&mut k_a.azzero, 0, &args).is_success());
        let err = ctx_b.enqueue_kernel(&mut k_a.azzero, 4).unwrap_err();
        assert_eq!(err.status, Status::INVALID_CONTEXT);
        drop(ctx_a);
    }

    #[test]
    fn int_args_fit_in_i32() {
        assert_eq!(int_arg(108), Ok(108));
        assert_eq!(int_arg(usize::MAX), Err(Status::INVALID_ARG_VALUE));
    }
}
