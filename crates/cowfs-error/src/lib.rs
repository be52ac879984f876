#![forbid(unsafe_code)]
//! Error types for CowFS.
//!
//! # Error Taxonomy
//!
//! CowFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `cowfs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `EngineError` | `cowfs-error` (this crate) | User-facing errors for API consumers |
//!
//! `cowfs-error` is intentionally independent of `cowfs-types` to avoid
//! cyclic dependencies. The conversion from `ParseError` to `EngineError`
//! happens at the crate boundary that knows the block address involved:
//!
//! | Situation | EngineError variant |
//! |-----------|---------------------|
//! | Parse failure while decoding a live block | `CorruptBlock { address, detail }` |
//! | Parse failure during open/format validation | `Format(detail)` |
//!
//! Integrity failures are never masked: a checksum or authentication-tag
//! mismatch on any block surfaces as `CorruptBlock` / `AuthenticationFailed`
//! with the offending address, so a higher-level repair tool can act.

use thiserror::Error;

/// Unified error type for all CowFS operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Checksum mismatch on a block read. Fatal for that read; the engine
    /// may continue serving unaffected reads.
    #[error("corrupt block at address {address}: {detail}")]
    CorruptBlock { address: u64, detail: String },

    /// AEAD tag verification failed while unsealing a block. Treated
    /// identically to corruption, with the address preserved for triage.
    #[error("authentication failed for block at address {address}")]
    AuthenticationFailed { address: u64 },

    /// The allocator has no free extent of the requested size. Recoverable
    /// by freeing space; never retried automatically.
    #[error("no space left on device")]
    OutOfSpace,

    /// Another write transaction is active and the configured writer policy
    /// does not wait. Callers may retry.
    #[error("write transaction already active")]
    Busy,

    /// Neither superblock slot holds a valid record. Fatal at open time;
    /// no automatic repair is attempted.
    #[error("unrecoverable filesystem: {0}")]
    UnrecoverableFilesystem(String),

    /// Invalid on-disk or in-memory format (bad magic, geometry, config).
    #[error("invalid format: {0}")]
    Format(String),

    /// Named object (file, key, chunk) not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Target name already exists (create, rename).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Snapshot id is unknown or already released.
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(u64),

    /// The engine refused a write because a prior commit left the device in
    /// an unknown state. Reopen to recover.
    #[error("engine is read-only after an uncertain commit")]
    ReadOnly,
}

/// Result alias using `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let corrupt = EngineError::CorruptBlock {
            address: 42,
            detail: "bad checksum".into(),
        };
        assert_eq!(
            corrupt.to_string(),
            "corrupt block at address 42: bad checksum"
        );

        let auth = EngineError::AuthenticationFailed { address: 9 };
        assert_eq!(auth.to_string(), "authentication failed for block at address 9");

        assert_eq!(EngineError::OutOfSpace.to_string(), "no space left on device");
        assert_eq!(
            EngineError::Busy.to_string(),
            "write transaction already active"
        );
        assert_eq!(
            EngineError::UnrecoverableFilesystem("both slots invalid".into()).to_string(),
            "unrecoverable filesystem: both slots invalid"
        );
        assert_eq!(
            EngineError::SnapshotNotFound(3).to_string(),
            "snapshot not found: 3"
        );
    }

    #[test]
    fn io_error_converts() {
        fn returns_io() -> Result<()> {
            Err(std::io::Error::other("boom"))?;
            Ok(())
        }
        let err = returns_io().unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
