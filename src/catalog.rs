//! Device discovery, and selection by device kind.

use std::{env, fmt, num::NonZeroUsize, str::FromStr, thread};

use crate::error::{LjmdError, LjmdResult};

/// Number of devices the host platform advertises.
pub const HOST_DEVICES_ENV: &str = "LJMD_HOST_DEVICES";

/// Memory available to each host device.
pub const DEFAULT_HOST_MEM: usize = 4 * 1024 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Latency-oriented.
    Cpu,
    /// Throughput-oriented.
    Gpu,
}

impl DeviceKind {
    /// Global work size used when none is given.
    pub fn default_threads(self) -> usize {
        match self {
            Self::Cpu => 16,
            Self::Gpu => 1024,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu => write!(f, "gpu"),
        }
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            _ => Err(format!("invalid device kind '{s}'; expected 'cpu' or 'gpu'")),
        }
    }
}

/// Which devices to run on: a kind, and optionally how many. E.g. `gpu`, `cpu:2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceRequest {
    pub kind: DeviceKind,
    /// `None` selects every matching device.
    pub count: Option<NonZeroUsize>,
}

impl FromStr for DeviceRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, count) = match s.split_once(':') {
            Some((kind, count)) => {
                let count: usize = count
                    .parse()
                    .map_err(|_| format!("invalid device count '{count}'"))?;
                let count = NonZeroUsize::new(count).ok_or("device count must be at least 1")?;
                (kind, Some(count))
            }
            None => (s, None),
        };

        Ok(Self {
            kind: kind.parse()?,
            count,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub platform: String,
    pub kind: DeviceKind,
    pub compute_units: usize,
    /// `None` when the backend doesn't report it.
    pub global_mem_bytes: Option<u64>,
}

#[derive(Clone, Debug)]
pub(crate) enum Backend {
    Host { threads: usize, mem_limit: usize },
    #[cfg(feature = "cuda")]
    Cuda { index: usize },
}

/// A device found during discovery. Contexts are created from these.
#[derive(Clone, Debug)]
pub struct DeviceHandle {
    info: DeviceInfo,
    backend: Backend,
}

impl DeviceHandle {
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub(crate) fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Cap the memory of a host device. No effect on other backends.
    pub fn with_mem_limit(mut self, bytes: usize) -> Self {
        match &mut self.backend {
            Backend::Host { mem_limit, .. } => {
                *mem_limit = bytes;
                self.info.global_mem_bytes = Some(bytes as u64);
            }
            #[cfg(feature = "cuda")]
            Backend::Cuda { .. } => (),
        }
        self
    }
}

#[derive(Clone, Debug)]
pub struct Platform {
    pub name: String,
    pub vendor: String,
    devices: Vec<DeviceHandle>,
}

impl Platform {
    /// `count` devices of the given kind, backed by host threads. The machine's cores are split
    /// evenly among them.
    pub fn emulated(name: &str, kind: DeviceKind, count: usize) -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let threads = (cores / count.max(1)).max(1);

        let devices = (0..count)
            .map(|i| DeviceHandle {
                info: DeviceInfo {
                    name: format!("{name} device {i}"),
                    vendor: "ljmd".to_owned(),
                    platform: name.to_owned(),
                    kind,
                    compute_units: threads,
                    global_mem_bytes: Some(DEFAULT_HOST_MEM as u64),
                },
                backend: Backend::Host {
                    threads,
                    mem_limit: DEFAULT_HOST_MEM,
                },
            })
            .collect();

        Self {
            name: name.to_owned(),
            vendor: "ljmd".to_owned(),
            devices,
        }
    }

    /// The host platform: CPU devices running on this machine.
    pub fn host(count: usize) -> Self {
        Self::emulated("Host", DeviceKind::Cpu, count)
    }

    #[cfg(feature = "cuda")]
    pub fn cuda() -> Option<Self> {
        let devices = crate::gpu::discover()
            .into_iter()
            .map(|(index, info)| DeviceHandle {
                info,
                backend: Backend::Cuda { index },
            })
            .collect::<Vec<_>>();

        if devices.is_empty() {
            return None;
        }

        Some(Self {
            name: "CUDA".to_owned(),
            vendor: "NVIDIA".to_owned(),
            devices,
        })
    }

    pub fn devices(&self) -> &[DeviceHandle] {
        &self.devices
    }
}

/// Every platform found on this machine, in discovery order.
#[derive(Clone, Debug)]
pub struct Catalog {
    platforms: Vec<Platform>,
}

impl Catalog {
    pub fn discover() -> Self {
        let host_devices = match env::var(HOST_DEVICES_ENV) {
            Ok(v) => match v.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    log::warn!("Ignoring invalid {HOST_DEVICES_ENV}={v}; using 1");
                    1
                }
            },
            Err(_) => 1,
        };

        #[allow(unused_mut)]
        let mut platforms = vec![Platform::host(host_devices)];

        #[cfg(feature = "cuda")]
        if let Some(p) = Platform::cuda() {
            platforms.push(p);
        }

        Self { platforms }
    }

    pub fn from_platforms(platforms: Vec<Platform>) -> Self {
        Self { platforms }
    }

    pub fn platforms(&self) -> &[Platform] {
        &self.platforms
    }

    /// Collect devices of the requested kind across all platforms, in order, up to the requested
    /// count. Fewer available than requested is not an error.
    pub fn select(&self, request: &DeviceRequest) -> LjmdResult<Vec<DeviceHandle>> {
        let matching: Vec<_> = self
            .platforms
            .iter()
            .flat_map(|p| p.devices.iter())
            .filter(|d| d.info.kind == request.kind)
            .cloned()
            .collect();

        if matching.is_empty() {
            return Err(LjmdError::NoDevices(request.kind.to_string()));
        }

        let result = match request.count {
            Some(n) if n.get() < matching.len() => matching.into_iter().take(n.get()).collect(),
            Some(n) => {
                if n.get() > matching.len() {
                    log::warn!(
                        "Requested {n} {} devices; only {} available",
                        request.kind,
                        matching.len()
                    );
                }
                matching
            }
            None => matching,
        };

        Ok(result)
    }

    /// Human-readable listing of platforms and devices.
    pub fn report(&self) -> String {
        let mut result = String::new();

        for (i, p) in self.platforms.iter().enumerate() {
            result.push_str(&format!("Platform {i}: {} ({})\n", p.name, p.vendor));
            for (j, d) in p.devices.iter().enumerate() {
                let mem = match d.info.global_mem_bytes {
                    Some(b) => format!("{} MiB", b / (1024 * 1024)),
                    None => "unknown".to_owned(),
                };
                result.push_str(&format!(
                    "  Device {j}: {}\n    kind: {}\n    compute units: {}\n    global memory: {mem}\n",
                    d.info.name, d.info.kind, d.info.compute_units
                ));
            }
        }

        result
    }
}
