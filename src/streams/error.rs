use std::{error::Error, fmt, sync::Arc};

/// Error vocabulary shared by every stream surface.
///
/// `TypeError` covers misuse of the API (wrong lock state, released
/// handles), `RangeError` covers invalid configuration, `Closing`/`Closed`
/// cover operations the stream state forbids, and `Other` carries any error
/// raised by user callbacks. Errors are cheaply clonable so a single stored
/// error can settle many outstanding requests.
#[derive(Debug, Clone)]
pub enum StreamError {
    /// Misuse of the surface: operating on a locked stream, a released
    /// reader/writer, or an already-consumed endpoint.
    TypeError(String),
    /// Invalid configuration value.
    RangeError(String),
    /// The operation was refused because a close is already in progress.
    Closing,
    /// The stream is closed.
    Closed,
    /// The stream was canceled by its consumer.
    Canceled,
    /// The stream was aborted by its producer.
    Aborted(Option<String>),
    /// Two tee branches canceled; carries both branch reasons in order.
    Composite(Vec<StreamError>),
    /// The stream's driver future was dropped before completing the request.
    TaskDropped,
    /// An error propagated from a user callback.
    Other(Arc<dyn Error + Send + Sync>),
}

impl StreamError {
    pub fn type_error(msg: impl Into<String>) -> Self {
        StreamError::TypeError(msg.into())
    }

    pub fn range_error(msg: impl Into<String>) -> Self {
        StreamError::RangeError(msg.into())
    }

    /// Wrap any error type into `StreamError`
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }

    /// Wrap a boxed error
    pub fn other_boxed(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        #[derive(Debug)]
        struct SimpleError(String);
        impl fmt::Display for SimpleError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl Error for SimpleError {}
        StreamError::Other(Arc::new(SimpleError(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::from(s.as_str())
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Other(Arc::new(e))
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

/// Macro for users to add direct `From` implementations for their error
/// types, so `?` works without `.map_err(StreamError::other)`.
///
/// # Example
/// ```ignore
/// use rivulet::{StreamError, impl_stream_error_from};
///
/// impl_stream_error_from!(serde_json::Error, my_crate::Error);
/// ```
#[macro_export]
macro_rules! impl_stream_error_from {
    ($($error_type:ty),* $(,)?) => {
        $(
            impl From<$error_type> for $crate::streams::error::StreamError {
                fn from(e: $error_type) -> Self {
                    $crate::streams::error::StreamError::Other(std::sync::Arc::new(e))
                }
            }
        )*
    };
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::TypeError(msg) => write!(f, "{}", msg),
            StreamError::RangeError(msg) => write!(f, "{}", msg),
            StreamError::Closing => write!(f, "Stream is closing"),
            StreamError::Closed => write!(f, "Stream is closed"),
            StreamError::Canceled => write!(f, "Stream operation was canceled"),
            StreamError::Aborted(Some(reason)) => write!(f, "Stream was aborted: {}", reason),
            StreamError::Aborted(None) => write!(f, "Stream was aborted"),
            StreamError::Composite(reasons) => {
                write!(f, "[")?;
                for (i, reason) in reasons.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", reason)?;
                }
                write!(f, "]")
            }
            StreamError::TaskDropped => write!(f, "Stream task was dropped"),
            StreamError::Other(err) => write!(f, "{}", err),
        }
    }
}

impl Error for StreamError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StreamError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
