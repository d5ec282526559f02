use thiserror::Error;

#[derive(Error, Debug)]
pub enum KfdError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("Resource busy")]
    Busy,

    #[error("No buffer object covers the requested range")]
    NotFound,

    #[error("Range 0x{start:x}-0x{last:x} spans more than a single BO")]
    AmbiguousRange { start: u64, last: u64 },

    #[error("Operation timed out")]
    Timeout,

    /// Opaque failure reported by a collaborator (queue manager, GPU-VM backend, IOMMU).
    #[error("Backend error {code}: {message}")]
    Backend { code: i32, message: String },
}

impl KfdError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn backend(code: i32, msg: impl Into<String>) -> Self {
        Self::Backend {
            code,
            message: msg.into(),
        }
    }

    /// Negative errno equivalent handed back to user mode by ioctl-style callers.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidArgument(_) | Self::AmbiguousRange { .. } => -libc::EINVAL,
            Self::ResourceExhausted(_) => -libc::ENOMEM,
            Self::Busy => -libc::EBUSY,
            Self::NotFound => -libc::ENOENT,
            Self::Timeout => -libc::ETIME,
            Self::Backend { code, .. } if *code < 0 => *code,
            Self::Backend { .. } => -libc::EIO,
        }
    }
}

// A convenient alias
pub type KfdResult<T> = Result<T, KfdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(KfdError::invalid("x").errno(), -libc::EINVAL);
        assert_eq!(KfdError::ResourceExhausted("pasid").errno(), -libc::ENOMEM);
        assert_eq!(KfdError::Busy.errno(), -libc::EBUSY);
        assert_eq!(KfdError::NotFound.errno(), -libc::ENOENT);
        assert_eq!(
            KfdError::AmbiguousRange { start: 0, last: 1 }.errno(),
            -libc::EINVAL
        );
        assert_eq!(KfdError::backend(-libc::EAGAIN, "busy bo").errno(), -libc::EAGAIN);
        assert_eq!(KfdError::backend(7, "weird").errno(), -libc::EIO);
    }
}
