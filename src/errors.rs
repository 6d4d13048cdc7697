//! Error Types
//!
//! This module defines the error types used throughout the crate.
//!
//! # Overview
//!
//! The main error type [`KilnError`] covers all failure modes including:
//! - Threading contract violations (render-domain calls from the wrong thread)
//! - Task scheduling and join failures
//! - Shader source and bytecode cache I/O errors
//! - Lifecycle errors on a disposed manager
//!
//! Note that a *build* failing (a shader that does not compile, a texture
//! file that does not decode) is not a [`KilnError`]: it is reported through
//! the resource's own `LoadedFailed` state and failure diagnostic. Errors
//! here are programming or environment errors, not content errors.
//!
//! # Usage
//!
//! All public APIs return [`Result<T>`] which is an alias for `std::result::Result<T, KilnError>`.
//!
//! ```rust,ignore
//! use kiln::errors::{KilnError, Result};
//!
//! fn drive(manager: &kiln::ResourceManager) -> Result<()> {
//!     manager.update_for_loading()?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// The main error type for the resource lifecycle core.
///
/// This enum covers all possible error conditions that can occur
/// during manager operation. Each variant provides specific context
/// about what went wrong.
#[derive(Error, Debug)]
pub enum KilnError {
    // ========================================================================
    // Threading Contract Errors
    // ========================================================================
    /// A render-domain operation was invoked from a thread other than the
    /// one the render service is bound to.
    #[error("Render service is bound to another thread: {0}")]
    WrongThread(String),

    /// The render service queue was closed while a job was waiting on it.
    #[error("Render service stopped: {0}")]
    ServiceStopped(String),

    // ========================================================================
    // Async & Threading Errors
    // ========================================================================
    /// Task join error (when offloaded tasks fail to complete).
    #[error("Task join error: {0}")]
    TaskJoinError(String),

    // ========================================================================
    // I/O Errors
    // ========================================================================
    /// File I/O error (shader sources, bytecode cache, texture files).
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// Operation on a manager that has already been disposed.
    #[error("Resource manager disposed: {0}")]
    Disposed(String),
}

// ============================================================================
// Convenient conversion implementations
// ============================================================================

impl From<tokio::task::JoinError> for KilnError {
    fn from(err: tokio::task::JoinError) -> Self {
        KilnError::TaskJoinError(err.to_string())
    }
}

/// Alias for `Result<T, KilnError>`.
pub type Result<T> = std::result::Result<T, KilnError>;
