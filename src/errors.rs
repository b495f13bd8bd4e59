//! Errors returned by the interceptors.

use derive_more::Display;

/// Status category of an [`Error`], mapped by embedders onto whatever
/// status vocabulary their transport uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[non_exhaustive]
pub enum Code {
    /// Local or remote overload: the outgoing queue is full, the wait for
    /// a credit expired, or the server had no credits issued for this
    /// client.
    #[display("resource exhausted")]
    ResourceExhausted,
    /// Missing or malformed request metadata.
    #[display("invalid argument")]
    InvalidArgument,
    /// The transport failed to deliver the request.
    #[display("unavailable")]
    Unavailable,
    /// Any other failure, opaque to the admission layer.
    #[display("internal")]
    Internal,
}

/// An error surfaced by [`client_intercept`] or [`server_intercept`].
///
/// The admission layer never retries: every error is returned verbatim to
/// the caller, with local credit accounting already restored.
///
/// [`client_intercept`]: crate::Breakwater::client_intercept
/// [`server_intercept`]: crate::Breakwater::server_intercept
#[derive(Debug, Display, derive_more::Error)]
#[display("{code}: {message}")]
pub struct Error {
    code: Code,
    #[error(not(source))]
    message: String,
}

impl Error {
    /// Creates an error with the given code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub(crate) fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    /// Returns the status category.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Returns the human-readable detail message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns whether the error is an overload rejection.
    pub fn is_resource_exhausted(&self) -> bool {
        self.code == Code::ResourceExhausted
    }
}
