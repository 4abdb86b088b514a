//! Error types for asynchronous iterators.

use std::sync::Arc;

/// The main error type for asynchronous iterators.
///
/// Runtime errors travel through the error channel of an iterator and are
/// shared between every observer, so the error is cheap to clone.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A source failed to produce an item
    #[error("Source error: {0}")]
    Source(Arc<dyn std::error::Error + Send + Sync>),

    /// A transformation step failed
    #[error("Transform error: {0}")]
    Transform(Arc<dyn std::error::Error + Send + Sync>),

    /// A deferred source could not be resolved
    #[error("Source resolution failed: {0}")]
    Resolution(Arc<dyn std::error::Error + Send + Sync>),

    /// The source of a transforming iterator was set twice
    #[error("The source cannot be changed after it has been set")]
    SourceAlreadySet,

    /// The source is already consumed by another iterator
    #[error("The source already has a destination")]
    AlreadyConnected,

    /// A custom error with a message
    #[error("{0}")]
    Custom(String),
}

// Convenience constructors
impl Error {
    /// Create a source error from any error type
    pub fn source<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Source(Arc::new(error))
    }

    /// Create a transform error from any error type
    pub fn transform<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Transform(Arc::new(error))
    }

    /// Create a resolution error from any error type
    pub fn resolution<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Resolution(Arc::new(error))
    }

    /// Create a custom error with a message
    pub fn custom<S: Into<String>>(message: S) -> Self {
        Error::Custom(message.into())
    }

    /// Whether this error reports misuse of the API rather than a runtime failure
    pub fn is_usage(&self) -> bool {
        matches!(self, Error::SourceAlreadySet | Error::AlreadyConnected)
    }
}

impl From<futures::channel::oneshot::Canceled> for Error {
    fn from(e: futures::channel::oneshot::Canceled) -> Self {
        Error::resolution(e)
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for Error {
    fn from(e: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Error::Custom(e.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Custom(s.to_string())
    }
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Helper trait for converting errors into our Error type
pub trait IntoError<T> {
    fn into_source_error(self) -> Result<T>;
    fn into_transform_error(self) -> Result<T>;
}

impl<T, E> IntoError<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_source_error(self) -> Result<T> {
        self.map_err(Error::source)
    }

    fn into_transform_error(self) -> Result<T> {
        self.map_err(Error::transform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_errors() {
        assert!(Error::AlreadyConnected.is_usage());
        assert!(Error::SourceAlreadySet.is_usage());
        assert!(!Error::custom("boom").is_usage());
    }

    #[test]
    fn test_display() {
        let err = Error::source(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(err.to_string(), "Source error: disk");
        assert_eq!(Error::from("plain").to_string(), "plain");
        assert_eq!(
            Error::AlreadyConnected.to_string(),
            "The source already has a destination"
        );
    }

    #[test]
    fn test_into_error() {
        let res: std::result::Result<(), std::fmt::Error> = Err(std::fmt::Error);
        assert!(matches!(res.into_transform_error(), Err(Error::Transform(_))));
    }
}
