use std::io;

use thiserror::Error;

/// Error produced by a wrapped resource or by the opener, passed through unmodified.
pub type ResourceError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// An operation was enqueued while the manager does not accept operations.
    #[error("operations queued past service stop")]
    AdmissionClosed,

    #[error("calling a resource operation `{operation}` with no bound target")]
    UnboundTarget { operation: String },

    #[error("the object of type `{type_name}` has no member `{member}`")]
    NoSuchMember {
        member: String,
        type_name: &'static str,
    },

    #[error("member `{member}` of type `{type_name}` is an attribute, not a method")]
    NotCallable {
        member: String,
        type_name: &'static str,
    },

    #[error(transparent)]
    Resource(ResourceError),

    #[error("resource operation panicked: {0}")]
    Panicked(String),

    /// The completion was dropped before it resolved, the runner or the event loop is gone.
    #[error("operation completion dropped without a result")]
    Disconnected,

    #[error("manager already started")]
    AlreadyStarted,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("spawn runner thread failed: {0}")]
    Spawn(#[source] io::Error),
}

impl Error {
    pub(crate) fn resource(err: impl Into<ResourceError>) -> Self {
        Error::Resource(err.into())
    }

    /// Returns the resource error if this failure came from the wrapped resource.
    pub fn as_resource_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Error::Resource(err) => Some(err.as_ref()),
            _ => None,
        }
    }

    /// Downcasts a resource failure to an [`io::Error`] when the resource raised one.
    pub fn as_io_error(&self) -> Option<&io::Error> {
        self.as_resource_error()
            .and_then(|err| err.downcast_ref::<io::Error>())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::resource(err)
    }
}
