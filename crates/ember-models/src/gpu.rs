//! GPU memory probes.
//!
//! The cache never decides to evict on guesswork: every eviction decision is backed by a fresh
//! reading from a [`GpuMemoryProbe`]. Hosts without an NVIDIA GPU use [`UnboundedProbe`], which
//! reports unlimited free memory so that eviction is never triggered.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

const MIB: u64 = 1024 * 1024;

/// Errors returned by a GPU memory query.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GpuQueryError {
    /// No GPU driver or management library is present.
    #[error("GPU memory query not available (no driver or management library)")]
    NotAvailable,

    /// The management library was found but could not be initialized.
    #[error("GPU management library initialization failed: {0}")]
    InitFailed(String),

    /// The configured device index could not be opened.
    #[error("Failed to access GPU device {index}: {message}")]
    DeviceAccessFailed {
        /// Device index.
        index: u32,
        /// Underlying error message.
        message: String,
    },

    /// The memory query itself failed.
    #[error("GPU memory query failed: {0}")]
    QueryFailed(String),
}

/// A snapshot of device memory, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GpuMemoryInfo {
    /// Total device memory.
    pub total: u64,
    /// Memory currently in use.
    pub used: u64,
    /// Memory currently free.
    pub free: u64,
}

impl GpuMemoryInfo {
    /// Total memory in MiB.
    #[must_use]
    pub fn total_mb(&self) -> f64 {
        bytes_to_mb(self.total)
    }

    /// Used memory in MiB.
    #[must_use]
    pub fn used_mb(&self) -> f64 {
        bytes_to_mb(self.used)
    }

    /// Free memory in MiB.
    #[must_use]
    pub fn free_mb(&self) -> f64 {
        bytes_to_mb(self.free)
    }
}

/// Converts a byte count to MiB for logging.
#[must_use]
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / MIB as f64
}

/// Source of GPU memory readings.
pub trait GpuMemoryProbe: Send + Sync {
    /// Reads the current memory state of the device.
    ///
    /// # Errors
    /// Returns `GpuQueryError` if the device cannot be queried.
    fn memory_info(&self) -> Result<GpuMemoryInfo, GpuQueryError>;

    /// Human-readable probe name for logs.
    fn name(&self) -> &str;

    /// Free device memory in bytes.
    ///
    /// # Errors
    /// Returns `GpuQueryError` if the device cannot be queried.
    fn free_bytes(&self) -> Result<u64, GpuQueryError> {
        self.memory_info().map(|info| info.free)
    }

    /// Used device memory in bytes.
    ///
    /// # Errors
    /// Returns `GpuQueryError` if the device cannot be queried.
    fn used_bytes(&self) -> Result<u64, GpuQueryError> {
        self.memory_info().map(|info| info.used)
    }
}

impl fmt::Debug for dyn GpuMemoryProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuMemoryProbe")
            .field("name", &self.name())
            .finish()
    }
}

/// Always-fits probe for hosts without a GPU.
///
/// Reports unlimited free memory and zero usage, so the cache never evicts and records a zero
/// VRAM footprint for every entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnboundedProbe;

impl GpuMemoryProbe for UnboundedProbe {
    fn memory_info(&self) -> Result<GpuMemoryInfo, GpuQueryError> {
        Ok(GpuMemoryInfo {
            total: u64::MAX,
            used: 0,
            free: u64::MAX,
        })
    }

    fn name(&self) -> &str {
        "unbounded"
    }
}

/// NVIDIA GPU memory probe backed by NVML.
#[cfg(feature = "nvml")]
pub struct NvmlProbe {
    nvml: nvml_wrapper::Nvml,
    index: u32,
    name: String,
}

#[cfg(feature = "nvml")]
impl NvmlProbe {
    /// Initializes NVML and binds to the device at `index`.
    ///
    /// # Errors
    /// Returns `GpuQueryError` if NVML is unavailable, fails to initialize, or the device
    /// cannot be opened. There is no silent fallback; callers wanting GPU-less operation must
    /// construct an [`UnboundedProbe`] explicitly.
    pub fn new(index: u32) -> Result<Self, GpuQueryError> {
        use nvml_wrapper::Nvml;
        use nvml_wrapper::error::NvmlError;

        let nvml = Nvml::init().map_err(|e| match e {
            NvmlError::DriverNotLoaded | NvmlError::LibraryNotFound => GpuQueryError::NotAvailable,
            NvmlError::NoPermission => GpuQueryError::InitFailed(
                "No permission to access NVML. Run with root or add user to nvidia group."
                    .to_string(),
            ),
            other => GpuQueryError::InitFailed(format!("NVML init error: {:?}", other)),
        })?;

        let device_count = nvml.device_count().map_err(|e| {
            GpuQueryError::InitFailed(format!("Failed to get device count: {:?}", e))
        })?;
        if index >= device_count {
            return Err(GpuQueryError::DeviceAccessFailed {
                index,
                message: format!("only {} device(s) present", device_count),
            });
        }

        let name = nvml
            .device_by_index(index)
            .and_then(|device| device.name())
            .map_err(|e| GpuQueryError::DeviceAccessFailed {
                index,
                message: format!("{:?}", e),
            })?;

        tracing::info!(device = %name, index, "NVML probe initialized");

        Ok(Self { nvml, index, name })
    }
}

#[cfg(feature = "nvml")]
impl NvmlProbe {
    /// Binds to the device selected by `gpu_index`.
    ///
    /// # Errors
    /// See [`NvmlProbe::new`].
    pub fn from_config(config: &crate::cache::CacheConfig) -> Result<Self, GpuQueryError> {
        Self::new(config.gpu_index)
    }
}

#[cfg(feature = "nvml")]
impl GpuMemoryProbe for NvmlProbe {
    fn memory_info(&self) -> Result<GpuMemoryInfo, GpuQueryError> {
        let device = self.nvml.device_by_index(self.index).map_err(|e| {
            GpuQueryError::DeviceAccessFailed {
                index: self.index,
                message: format!("{:?}", e),
            }
        })?;
        let info = device.memory_info().map_err(|e| {
            GpuQueryError::QueryFailed(format!("Device {}: {:?}", self.index, e))
        })?;
        Ok(GpuMemoryInfo {
            total: info.total,
            used: info.used,
            free: info.free,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
