//! Generic error handling for application-level plumbing.
//!
//! Library crates define their own error types. Once those errors reach code that only needs to report them, such as
//! bootstrap logic, they are converted into [`GenericError`] and decorated with context along the way.

use std::fmt::Display;

/// A type-erased error.
pub type GenericError = anyhow::Error;

/// Constructs a [`GenericError`].
///
/// Accepts a string literal, a format string with arguments (in the same order as `std::format!`), or a value that
/// implements `Debug` and `Display`. When that value is itself an error, its source chain is preserved.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
    impl<T> Sealed for Option<T> {}
}

/// Attaches context to fallible values, converting them into [`GenericError`].
///
/// This mirrors `anyhow::Context`, under different method names so that it can be imported alongside
/// `snafu::ResultExt` without the two colliding.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wraps the error with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error with additional context, which is only built if an error actually occurred.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        anyhow::Context::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        anyhow::Context::with_context(self, f)
    }
}

impl<T> ErrorContext<T, std::convert::Infallible> for Option<T> {
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        anyhow::Context::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        anyhow::Context::with_context(self, f)
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn context_wraps_source() {
        let result: Result<(), io::Error> = Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
        let error = result.error_context("Failed to load configuration.").unwrap_err();

        assert_eq!(error.to_string(), "Failed to load configuration.");
        let source = error.chain().nth(1).expect("source should be preserved");
        assert_eq!(source.to_string(), "no such file");
    }

    #[test]
    fn lazy_context_only_runs_on_error() {
        let result: Result<u32, io::Error> = Ok(42);
        let value = result
            .with_error_context(|| -> String { panic!("context should not be built") })
            .expect("should be ok");
        assert_eq!(value, 42);
    }

    #[test]
    fn missing_option_becomes_error() {
        let error = None::<u32>.error_context("Limit was not set.").unwrap_err();
        assert_eq!(error.to_string(), "Limit was not set.");

        assert_eq!(Some(7).error_context("unused").expect("should be some"), 7);
    }

    #[test]
    fn macro_forms() {
        let limit = 64;
        assert_eq!(generic_error!("plain").to_string(), "plain");
        assert_eq!(generic_error!("limit {} exceeded", limit).to_string(), "limit 64 exceeded");

        let io_error = io::Error::other("boom");
        assert_eq!(generic_error!(io_error).to_string(), "boom");
    }
}
