// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the session engine.
//!
//! Transient per-session I/O errors are not surfaced here: they close the
//! session and reach the application through
//! [`SessionListener::on_connection_closed`](crate::session::SessionListener::on_connection_closed).
//! Registration and configuration problems surface synchronously, both as a
//! returned [`EngineError`] and through the emitter's `on_exception` hook.
//!
//! Allocation failure is not an error value: chunk allocation goes through
//! `std::alloc::handle_alloc_error`, which aborts the process.

use std::io;

/// Result type used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors reported by engine and emitter operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A socket operation failed.
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    /// The emitter is already registered with this engine.
    #[error("emitter is already registered")]
    AlreadyRegistered,

    /// The engine has been stopped; no new emitters are accepted.
    #[error("engine is stopped")]
    Stopped,

    /// A shutdown wait was interrupted (a worker thread panicked while
    /// the engine was quiescing).
    #[error("interrupted while waiting for shutdown")]
    Interrupted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = EngineError::AlreadyRegistered;
        assert_eq!(e.to_string(), "emitter is already registered");

        let e = EngineError::Stopped;
        assert_eq!(e.to_string(), "engine is stopped");
    }

    #[test]
    fn test_from_io() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let e: EngineError = io_err.into();
        assert!(matches!(e, EngineError::Io(_)));
        assert!(e.to_string().contains("refused"));
    }
}
