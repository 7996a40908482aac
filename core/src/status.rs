use std::error;
use std::fmt;

/// Host-level abort status, returned from the outermost entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lib86Status {
    Success,
    OpNotImplemented,
    InvalidParameter,
    NoMemory,
    InternalError,
    AlreadyExist,
    NotFound,
    PageFault,
}

impl fmt::Display for Lib86Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::OpNotImplemented => write!(f, "operation not implemented"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NoMemory => write!(f, "out of memory"),
            Self::InternalError => write!(f, "internal error"),
            Self::AlreadyExist => write!(f, "already exists"),
            Self::NotFound => write!(f, "not found"),
            Self::PageFault => write!(f, "unhandled page fault"),
        }
    }
}

/// A host-level abort carrying a status and a human-readable reason.
///
/// Raised on unimplemented instructions, impossible invariants, triple
/// faults, and debugger-close. Propagates out of the dispatch loop's
/// entry point as an ordinary `Result`, never as a panic.
#[derive(Debug, Clone)]
pub struct CpuError {
    pub status: Lib86Status,
    pub message: String,
}

impl CpuError {
    pub fn new(status: Lib86Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn triple_fault() -> Self {
        Self::new(
            Lib86Status::Success,
            "the guest has triple faulted, cannot continue",
        )
    }

    pub fn unimplemented(what: impl fmt::Display) -> Self {
        Self::new(
            Lib86Status::OpNotImplemented,
            format!("encountered unimplemented instruction {what}"),
        )
    }
}

impl fmt::Display for CpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl error::Error for CpuError {}

pub type CpuResult<T> = Result<T, CpuError>;
