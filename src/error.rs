//! Error types for the compute core.
//!
//! Every fallible operation in the crate returns [`Result`]. Device-level
//! failures carry a [`DeviceErrorKind`] translated from the wgpu error so the
//! caller sees a readable name rather than an opaque handle.

use std::fmt;
use thiserror::Error;

/// Readable classification of a device-reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    OutOfMemory,
    Validation,
    Internal,
    /// Reported through the device-lost callback.
    DeviceLost,
}

impl DeviceErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceErrorKind::OutOfMemory => "OUT_OF_MEMORY",
            DeviceErrorKind::Validation => "VALIDATION_ERROR",
            DeviceErrorKind::Internal => "INTERNAL_ERROR",
            DeviceErrorKind::DeviceLost => "DEVICE_LOST",
        }
    }
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&wgpu::Error> for DeviceErrorKind {
    fn from(err: &wgpu::Error) -> Self {
        #[allow(unreachable_patterns)]
        match err {
            wgpu::Error::OutOfMemory { .. } => DeviceErrorKind::OutOfMemory,
            wgpu::Error::Validation { .. } => DeviceErrorKind::Validation,
            wgpu::Error::Internal { .. } => DeviceErrorKind::Internal,
            _ => DeviceErrorKind::Internal,
        }
    }
}

/// All failures the compute core can report.
#[derive(Error, Debug)]
pub enum SimError {
    /// Discovery failed: no platform, no capable device, or the device
    /// refused to create a context.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A buffer in the allocation batch could not be created. Everything
    /// allocated earlier in the batch has already been released.
    #[error("failed to allocate buffer '{buffer}': {kind} ({detail})")]
    Allocation {
        buffer: String,
        kind: DeviceErrorKind,
        detail: String,
    },

    /// Program build failed. `log` holds the full compiler output.
    #[error("program build failed:\n{log}")]
    Compilation { log: String },

    #[error("failed to create kernel '{kernel}': {kind} ({detail})")]
    KernelCreation {
        kernel: String,
        kind: DeviceErrorKind,
        detail: String,
    },

    #[error("{operation} failed: {kind} ({detail})")]
    Dispatch {
        operation: String,
        kind: DeviceErrorKind,
        detail: String,
    },

    #[error("buffer read-back failed: {0}")]
    Readback(String),

    /// The display buffer is held by the other side.
    #[error("display buffer is owned by {0}")]
    DisplayBusy(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SimError {
    pub(crate) fn dispatch(operation: impl Into<String>, err: &wgpu::Error) -> Self {
        SimError::Dispatch {
            operation: operation.into(),
            kind: DeviceErrorKind::from(err),
            detail: err.to_string(),
        }
    }

    pub(crate) fn allocation(buffer: impl Into<String>, err: &wgpu::Error) -> Self {
        SimError::Allocation {
            buffer: buffer.into(),
            kind: DeviceErrorKind::from(err),
            detail: err.to_string(),
        }
    }

    /// True for failures that happen while a step is running.
    pub fn is_dispatch_failure(&self) -> bool {
        matches!(self, SimError::Dispatch { .. } | SimError::Readback(_))
    }
}

pub type Result<T> = std::result::Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SimError::DeviceNotFound("no platforms".to_string());
        assert_eq!(err.to_string(), "device not found: no platforms");
    }

    #[test]
    fn test_allocation_error_names_buffer_and_kind() {
        let err = SimError::Allocation {
            buffer: "velHistory".to_string(),
            kind: DeviceErrorKind::OutOfMemory,
            detail: "injected".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("velHistory"));
        assert!(text.contains("OUT_OF_MEMORY"));
    }

    #[test]
    fn test_compilation_error_carries_log() {
        let err = SimError::Compilation {
            log: "error: unknown identifier `real4`".to_string(),
        };
        assert!(err.to_string().contains("unknown identifier"));
    }

    #[test]
    fn test_dispatch_classification() {
        let err = SimError::Dispatch {
            operation: "acceleration".to_string(),
            kind: DeviceErrorKind::DeviceLost,
            detail: String::new(),
        };
        assert!(err.is_dispatch_failure());
        assert!(!SimError::InvalidConfig("x".into()).is_dispatch_failure());
    }
}
