use crate::registry::Implementation;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("Implementation not available")]
    ImplementationNotAvailable,
    #[error("Implementation {0} is not available on this host")]
    ImplementationDisabled(Implementation),
    #[error("Host does not expose a manual GC trigger")]
    GcUnavailable,
    #[error("Object belongs to a different heap")]
    ForeignObject,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Runtime error: {0}")]
    Runtime(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
