//! Error types, and the status codes compute backends report.
//!
//! Every failure in this program is fatal. Library code returns `LjmdError`; `main` maps
//! the variant to a process exit code.

use std::{fmt, io, ops::BitOrAssign, path::PathBuf};

use thiserror::Error;

/// A compute backend status code. Zero is success; failures are negative, following the
/// OpenCL convention so codes read the same regardless of which backend produced them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    pub const SUCCESS: Self = Self(0);
    pub const DEVICE_NOT_FOUND: Self = Self(-1);
    pub const DEVICE_NOT_AVAILABLE: Self = Self(-2);
    pub const COMPILER_NOT_AVAILABLE: Self = Self(-3);
    pub const MEM_OBJECT_ALLOCATION_FAILURE: Self = Self(-4);
    pub const OUT_OF_RESOURCES: Self = Self(-5);
    pub const OUT_OF_HOST_MEMORY: Self = Self(-6);
    pub const BUILD_PROGRAM_FAILURE: Self = Self(-11);
    pub const EXEC_STATUS_ERROR: Self = Self(-14);
    pub const INVALID_VALUE: Self = Self(-30);
    pub const INVALID_DEVICE_TYPE: Self = Self(-31);
    pub const INVALID_CONTEXT: Self = Self(-34);
    pub const INVALID_COMMAND_QUEUE: Self = Self(-36);
    pub const INVALID_MEM_OBJECT: Self = Self(-38);
    pub const INVALID_KERNEL_NAME: Self = Self(-46);
    pub const INVALID_KERNEL: Self = Self(-48);
    pub const INVALID_ARG_INDEX: Self = Self(-49);
    pub const INVALID_ARG_VALUE: Self = Self(-50);
    pub const INVALID_ARG_SIZE: Self = Self(-51);
    pub const INVALID_KERNEL_ARGS: Self = Self(-52);
    pub const INVALID_WORK_GROUP_SIZE: Self = Self(-54);
    pub const INVALID_GLOBAL_WORK_SIZE: Self = Self(-63);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Human-readable translation of the code.
    pub fn describe(self) -> String {
        let msg = match self {
            Self::SUCCESS => "success",
            Self::DEVICE_NOT_FOUND => "device not found",
            Self::DEVICE_NOT_AVAILABLE => "device not available",
            Self::COMPILER_NOT_AVAILABLE => "compiler not available",
            Self::MEM_OBJECT_ALLOCATION_FAILURE => "mem object allocation failure",
            Self::OUT_OF_RESOURCES => "out of resources",
            Self::OUT_OF_HOST_MEMORY => "out of host memory",
            Self::BUILD_PROGRAM_FAILURE => "build program failed",
            Self::EXEC_STATUS_ERROR => "execution status error for events in wait list",
            Self::INVALID_VALUE => "invalid value",
            Self::INVALID_DEVICE_TYPE => "invalid device type",
            Self::INVALID_CONTEXT => "invalid context",
            Self::INVALID_COMMAND_QUEUE => "invalid command queue",
            Self::INVALID_MEM_OBJECT => "invalid mem object",
            Self::INVALID_KERNEL_NAME => "invalid kernel name",
            Self::INVALID_KERNEL => "invalid kernel",
            Self::INVALID_ARG_INDEX => "invalid kernel argument index",
            Self::INVALID_ARG_VALUE => "invalid kernel argument value",
            Self::INVALID_ARG_SIZE => "invalid kernel argument size",
            Self::INVALID_KERNEL_ARGS => "kernel arguments not set",
            Self::INVALID_WORK_GROUP_SIZE => "invalid work group size",
            Self::INVALID_GLOBAL_WORK_SIZE => "invalid global work size",
            Self(code) => return format!("unknown error {code}"),
        };
        msg.to_string()
    }

    /// Turn an accumulated status into a `Result`. `what` names the operation, for the message.
    pub fn check(self, what: impl Into<String>) -> Result<(), DeviceError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(DeviceError::new(self, what))
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::SUCCESS
    }
}

/// Accumulate statuses from a chain of operations, so one check covers all of them. The first
/// failure is kept; OR-ing the raw negative codes together would garble the translation.
impl BitOrAssign for Status {
    fn bitor_assign(&mut self, rhs: Self) {
        if self.is_success() {
            *self = rhs;
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.describe(), self.0)
    }
}

/// A failed backend operation.
#[derive(Debug, Clone, Error)]
#[error("{what}: {status}")]
pub struct DeviceError {
    pub status: Status,
    pub what: String,
}

impl DeviceError {
    pub fn new(status: Status, what: impl Into<String>) -> Self {
        Self {
            status,
            what: what.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LjmdError {
    #[error("{0}")]
    Usage(String),

    #[error("problem reading input: {0}")]
    Input(String),

    #[error("cannot read restart file {path}: {msg}")]
    Restart { path: PathBuf, msg: String },

    #[error("no {0} devices found on any platform")]
    NoDevices(String),

    /// Platform enumeration, context, queue, or program creation.
    #[error("device initialization failed: {0}")]
    DeviceInit(DeviceError),

    #[error("kernel program build failed on device {ordinal}: {msg}")]
    Build { ordinal: usize, msg: String },

    #[error("device allocation failed: {0}")]
    Alloc(DeviceError),

    /// A kernel launch, transfer, or wait failed mid-run.
    #[error("device error: {0}")]
    Device(DeviceError),

    #[error("{path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("checkpoint {path}: {msg}")]
    Checkpoint { path: PathBuf, msg: String },
}

impl LjmdError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) | Self::Input(_) | Self::Device(_) | Self::Io { .. } => 1,
            Self::Restart { .. } | Self::Checkpoint { .. } => 3,
            Self::NoDevices(_) | Self::DeviceInit(_) | Self::Build { .. } => 4,
            Self::Alloc(_) => 5,
        }
    }
}

/// Mid-run device failures. Initialization and allocation paths map explicitly.
impl From<DeviceError> for LjmdError {
    fn from(e: DeviceError) -> Self {
        Self::Device(e)
    }
}

pub type LjmdResult<T> = Result<T, LjmdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_keeps_first_failure() {
        let mut status = Status::SUCCESS;
        status |= Status::SUCCESS;
        status |= Status::INVALID_ARG_INDEX;
        status |= Status::SUCCESS;
        status |= Status::INVALID_MEM_OBJECT;
        assert_eq!(status, Status::INVALID_ARG_INDEX);
        assert!(status.check("bind").is_err());
    }

    #[test]
    fn describe_known_and_unknown() {
        assert_eq!(Status::OUT_OF_RESOURCES.describe(), "out of resources");
        assert_eq!(Status(-9999).describe(), "unknown error -9999");
    }

    #[test]
    fn exit_codes() {
        let dev = DeviceError::new(Status::MEM_OBJECT_ALLOCATION_FAILURE, "alloc rx");
        assert_eq!(LjmdError::Alloc(dev.clone()).exit_code(), 5);
        assert_eq!(LjmdError::DeviceInit(dev.clone()).exit_code(), 4);
        assert_eq!(LjmdError::Device(dev).exit_code(), 1);
        assert_eq!(LjmdError::NoDevices("gpu".into()).exit_code(), 4);
        assert_eq!(
            LjmdError::Restart {
                path: "x".into(),
                msg: "missing".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(LjmdError::Usage("bad".into()).exit_code(), 1);
    }
}
