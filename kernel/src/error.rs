//! Kernel-internal error taxonomy. Allocators keep a raw
//! null/`Option`-returning surface on their hot paths and additionally
//! expose a `KError`-returning wrapper for callers that want the taxonomy.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KError {
    // Resource exhaustion
    NoMemory,
    NoPages,
    NoFd,
    NoPid,
    // Invalid argument
    InvalidArgument,
    Unaligned,
    BadFlags,
    TooLarge,
    NameTooLong,
    // Not present
    NotFound,
    NoSuchFs,
    NotMapped,
    // Already exists
    AlreadyExists,
    // Wrong kind
    WrongKind,
    // Permission denied
    PermissionDenied,
}

impl fmt::Display for KError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KError::NoMemory => "out of memory",
            KError::NoPages => "out of pages",
            KError::NoFd => "no free file descriptor",
            KError::NoPid => "no free pid",
            KError::InvalidArgument => "invalid argument",
            KError::Unaligned => "unaligned address",
            KError::BadFlags => "bad flag combination",
            KError::TooLarge => "object too large",
            KError::NameTooLong => "pathname too long",
            KError::NotFound => "not found",
            KError::NoSuchFs => "no such filesystem driver",
            KError::NotMapped => "address not mapped",
            KError::AlreadyExists => "already exists",
            KError::WrongKind => "wrong kind",
            KError::PermissionDenied => "permission denied",
        };
        f.write_str(msg)
    }
}

pub type KResult<T> = Result<T, KError>;
