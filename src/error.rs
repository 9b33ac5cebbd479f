// Licensed under the Apache-2.0 license

//! Error taxonomy shared by every engine component.
//!
//! Successful completion is `Result::Ok` and "still in flight" is
//! `nb::Error::WouldBlock`; everything else is an [`Error`] variant.

use core::fmt;

/// Result alias used across the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors reported by the engine core.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// Generic hardware or protocol failure.
    Failed,
    /// Job handle is out of range or not open.
    InvalidHandle,
    /// Context index is out of range or not allocated.
    InvalidContext,
    /// Length or count outside the supported range.
    InvalidSize,
    /// Backing storage could not be allocated.
    NoMemory,
    /// Algorithm is not supported by this engine.
    InvalidAlgorithm,
    /// Key length not valid for the selected algorithm.
    InvalidKeySize,
    /// Argument rejected by validation.
    InvalidArgument,
    /// Required hardware block is not present.
    ModuleDisabled,
    /// Operation not implemented for this configuration.
    NotImplemented,
    /// Data length is not a multiple of the cipher block size.
    InvalidBlockAlignment,
    /// Cipher/hash mode not supported.
    InvalidMode,
    /// Key material rejected.
    InvalidKey,
    /// Integrity check value did not match.
    AuthenticationFailed,
    /// IV length not valid for the selected mode.
    InvalidIvSize,
    /// Hardware reported a bus or memory error.
    MemoryError,
    /// Priority class has no command FIFO configured.
    FifoInactive,
    /// Command FIFO is full.
    FifoFull,
    /// Shared-hardware handshake did not complete in time.
    Timeout,
    /// Scatter/gather table is at capacity.
    DdtFull,
    /// No run of free contexts of the requested length.
    NoFreeContext,
    /// Existing run length at a context does not match the request.
    RunLengthMismatch,
    /// Deferred job buffer is exhausted.
    DeferredBufferFull,
    /// Completion carried a software ID that maps to no live job.
    UnknownSoftwareId,
    /// Every chain is in use.
    NoFreeChains,
    /// PDU pool is exhausted.
    NoFreePdu,
    /// Key slot pool is exhausted.
    NoFreeKey,
}

impl Error {
    /// Whether the caller can retry the same request later.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::FifoFull
                | Error::Timeout
                | Error::NoFreeContext
                | Error::DeferredBufferFull
                | Error::NoFreeChains
                | Error::NoFreePdu
                | Error::NoFreeKey
                | Error::NoMemory
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::Failed => "operation failed",
            Error::InvalidHandle => "invalid job handle",
            Error::InvalidContext => "invalid context",
            Error::InvalidSize => "invalid size",
            Error::NoMemory => "out of memory",
            Error::InvalidAlgorithm => "invalid algorithm",
            Error::InvalidKeySize => "invalid key size",
            Error::InvalidArgument => "invalid argument",
            Error::ModuleDisabled => "module disabled",
            Error::NotImplemented => "not implemented",
            Error::InvalidBlockAlignment => "invalid block alignment",
            Error::InvalidMode => "invalid mode",
            Error::InvalidKey => "invalid key",
            Error::AuthenticationFailed => "authentication failed",
            Error::InvalidIvSize => "invalid IV size",
            Error::MemoryError => "memory error",
            Error::FifoInactive => "FIFO inactive",
            Error::FifoFull => "FIFO full",
            Error::Timeout => "timeout",
            Error::DdtFull => "DDT full",
            Error::NoFreeContext => "no free context",
            Error::RunLengthMismatch => "context run length mismatch",
            Error::DeferredBufferFull => "deferred job buffer full",
            Error::UnknownSoftwareId => "unknown software job ID",
            Error::NoFreeChains => "no free chains",
            Error::NoFreePdu => "no free PDU",
            Error::NoFreeKey => "no free key slot",
        };
        f.write_str(msg)
    }
}
