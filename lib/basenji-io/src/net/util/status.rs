use std::fmt;

use tonic::{Code, Status};

/// A `tonic::Status` that renders compactly, as `Code(message)`.
///
/// The `Display` output of `Status` itself includes metadata and details that are mostly noise in log lines.
pub struct StatusError(Status);

impl StatusError {
    /// Returns the status code.
    pub fn code(&self) -> Code {
        self.0.code()
    }

    /// Returns `true` if the caller may retry the request later.
    ///
    /// Refusals from the memory limiter are reported as `ResourceExhausted`, and so are retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.0.code(),
            Code::ResourceExhausted | Code::Unavailable | Code::DeadlineExceeded | Code::Aborted
        )
    }

    /// Consumes the error, returning the underlying status.
    pub fn into_inner(self) -> Status {
        self.0
    }
}

impl From<Status> for StatusError {
    fn from(status: Status) -> Self {
        Self(status)
    }
}

impl fmt::Debug for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self.0.message() {
            "" => self.0.code().description(),
            message => message,
        };

        write!(f, "{:?}({})", self.0.code(), message)
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}
