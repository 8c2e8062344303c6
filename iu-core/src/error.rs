//! Error types for iu-core
//!
//! Re-exports the unified error type from iu-error.

pub use iu_error::{Result, UndervoltError};
