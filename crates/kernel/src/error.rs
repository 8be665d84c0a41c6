//! Kernel error codes.
//!
//! System calls report failure to user code as small negative integers. The
//! kernel itself works with [`Error`] and only converts at the syscall
//! boundary.

use core::fmt;

use pmm::{AllocError, MapError};

/// An error returned by a system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Unspecified or unknown problem.
    Unspecified,
    /// The environment does not exist or the caller may not touch it.
    BadEnv,
    /// Invalid parameter.
    Inval,
    /// Out of physical memory.
    NoMem,
    /// No free environment slot.
    NoFreeEnv,
    /// The caller passed memory it may not access.
    Fault,
    /// The target is not blocked receiving an IPC message.
    IpcNotRecv,
}

impl Error {
    /// Returns the negative status code seen by user code.
    pub const fn code(self) -> i32 {
        match self {
            Error::Unspecified => -1,
            Error::BadEnv => -2,
            Error::Inval => -3,
            Error::NoMem => -4,
            Error::NoFreeEnv => -5,
            Error::Fault => -6,
            Error::IpcNotRecv => -7,
        }
    }

    /// Decodes a negative status code.
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => Error::Unspecified,
            -2 => Error::BadEnv,
            -3 => Error::Inval,
            -4 => Error::NoMem,
            -5 => Error::NoFreeEnv,
            -6 => Error::Fault,
            -7 => Error::IpcNotRecv,
            _ => return None,
        })
    }

    /// Splits a raw syscall return value into a value or an error.
    ///
    /// Unknown negative codes decode as [`Error::Unspecified`].
    pub fn check(ret: i32) -> Result<u32, Error> {
        if ret < 0 {
            Err(Error::from_code(ret).unwrap_or(Error::Unspecified))
        } else {
            Ok(ret as u32)
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::Unspecified => "unspecified error",
            Error::BadEnv => "bad environment",
            Error::Inval => "invalid parameter",
            Error::NoMem => "out of memory",
            Error::NoFreeEnv => "out of environments",
            Error::Fault => "segmentation fault",
            Error::IpcNotRecv => "env is not recving",
        };
        f.write_str(msg)
    }
}

impl From<AllocError> for Error {
    fn from(_: AllocError) -> Self {
        Error::NoMem
    }
}

impl From<MapError> for Error {
    fn from(err: MapError) -> Self {
        match err {
            MapError::OutOfMemory => Error::NoMem,
            MapError::NotMapped => Error::Inval,
        }
    }
}
