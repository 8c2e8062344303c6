//! Unified error handling for intel-undervolt
//!
//! This crate provides the single error type shared by the register access
//! layer, the codecs, the telemetry samplers and the orchestrator.
//! It uses thiserror for ergonomic error definitions with proper Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using UndervoltError
pub type Result<T> = std::result::Result<T, UndervoltError>;

/// Unified error type for all intel-undervolt operations
#[derive(thiserror::Error, Debug)]
pub enum UndervoltError {
    // ============================================================================
    // Register Access Errors
    // ============================================================================
    /// A privileged device handle could not be opened, even after the
    /// best-effort kernel module load.
    #[error("{device} is unavailable: {source}")]
    PermissionOrUnavailable {
        device: PathBuf,
        source: io::Error,
    },

    /// Short transfer or failed syscall on an already open handle.
    #[error("I/O error on {target}: {source}")]
    Io {
        target: String,
        source: io::Error,
    },

    /// A hardware fault was caught by the guarded memory access primitive.
    #[error("fault while accessing {target} at {address:#x}")]
    FaultDuringAccess {
        target: String,
        address: u64,
    },

    /// The guarded memory access slot is held by another caller.
    #[error("guarded memory access already in progress")]
    AccessBusy,

    /// A register write went through but the read-back differs.
    #[error("{entity}: value not persisted (wrote {written:#010x}, read {read:#010x})")]
    VerificationMismatch {
        entity: String,
        written: u64,
        read: u64,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    ConfigurationInvalid(String),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("Hardware not found: {0}")]
    HardwareNotFound(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl UndervoltError {
    /// Create a configuration error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigurationInvalid(msg.into())
    }

    /// Wrap an I/O error with the entity it happened on
    pub fn io(target: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            target: target.into(),
            source,
        }
    }

    /// Create a fault error for a guarded access
    pub fn fault(target: impl Into<String>, address: u64) -> Self {
        Self::FaultDuringAccess {
            target: target.into(),
            address,
        }
    }

    /// Whether the failure is a read-back disagreement rather than an I/O problem
    pub fn is_verification_mismatch(&self) -> bool {
        matches!(self, Self::VerificationMismatch { .. })
    }
}
