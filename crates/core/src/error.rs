use thiserror::Error;

/// Boundary error of the service API.
///
/// Every public operation resolves to one of these variants. `code()` gives
/// the stable signed integer used on the IPC and FFI boundaries (negated
/// POSIX error numbers, 0 for success).
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("streams pipe error: {0}")]
    StreamsPipe(String),

    #[error("try again: {0}")]
    TryAgain(String),

    #[error("timed out")]
    TimedOut,
}

pub type Result<T> = std::result::Result<T, ServiceError>;

impl ServiceError {
    /// Stable integer code carried across the IPC boundary.
    pub fn code(&self) -> i32 {
        match self {
            ServiceError::InvalidParameter(_) => -22,  // -EINVAL
            ServiceError::OutOfMemory => -12,          // -ENOMEM
            ServiceError::NotSupported(_) => -95,      // -ENOTSUP
            ServiceError::PermissionDenied(_) => -1,   // -EPERM
            ServiceError::Io(_) => -5,                 // -EIO
            ServiceError::StreamsPipe(_) => -86,       // -ESTRPIPE
            ServiceError::TryAgain(_) => -11,          // -EAGAIN
            ServiceError::TimedOut => -110,            // -ETIMEDOUT
        }
    }

    /// Rebuild an error from a boundary code, e.g. when a daemon reply
    /// carries a negative status.
    pub fn from_code(code: i32, context: &str) -> ServiceError {
        match code {
            -12 => ServiceError::OutOfMemory,
            -95 => ServiceError::NotSupported(context.to_string()),
            -1 => ServiceError::PermissionDenied(context.to_string()),
            -5 => ServiceError::Io(context.to_string()),
            -86 => ServiceError::StreamsPipe(context.to_string()),
            -11 => ServiceError::TryAgain(context.to_string()),
            -110 => ServiceError::TimedOut,
            _ => ServiceError::InvalidParameter(context.to_string()),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> ServiceError {
        ServiceError::InvalidParameter(msg.into())
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => {
                ServiceError::PermissionDenied(err.to_string())
            }
            std::io::ErrorKind::TimedOut => ServiceError::TimedOut,
            _ => ServiceError::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        let errors = [
            ServiceError::InvalidParameter("x".into()),
            ServiceError::OutOfMemory,
            ServiceError::NotSupported("x".into()),
            ServiceError::PermissionDenied("x".into()),
            ServiceError::Io("x".into()),
            ServiceError::StreamsPipe("x".into()),
            ServiceError::TryAgain("x".into()),
            ServiceError::TimedOut,
        ];
        for err in errors {
            let rebuilt = ServiceError::from_code(err.code(), "x");
            assert_eq!(err.code(), rebuilt.code());
        }
    }
}
