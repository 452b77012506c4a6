//! Status codes and error types for taglink.

use std::fmt;

use crate::provider::Features;

/// Completion status of an operation or connection.
///
/// `Ok` and `InProgress` are not errors; everything else is terminal.
/// A connection's status never leaves a terminal error once it enters one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation completed successfully.
    Ok,
    /// Operation is still in flight.
    InProgress,
    /// Handshake or accept did not complete within the connect timeout.
    TimedOut,
    /// Operation was cancelled before completion.
    Cancelled,
    /// The remote side closed or reset the connection.
    PeerClosed,
    /// The endpoint failed or is no longer usable.
    EndpointFailed,
    /// The socket address was invalid or unusable.
    BadAddress,
    /// The provider ran out of resources for the operation.
    OutOfResources,
    /// The operation is not supported by the provider.
    Unsupported,
}

impl Status {
    /// Whether this status is a terminal error.
    #[inline]
    pub fn is_err(self) -> bool {
        !matches!(self, Status::Ok | Status::InProgress)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::InProgress => "in progress",
            Status::TimedOut => "timed out",
            Status::Cancelled => "cancelled",
            Status::PeerClosed => "peer closed",
            Status::EndpointFailed => "endpoint failed",
            Status::BadAddress => "bad address",
            Status::OutOfResources => "out of resources",
            Status::Unsupported => "unsupported",
        };
        f.write_str(s)
    }
}

/// Worker-level setup errors.
#[derive(Debug)]
pub enum Error {
    /// The provider does not implement the required feature set.
    MissingFeatures(Features),
    /// Listener creation failed.
    Listen(Status),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MissingFeatures(missing) => {
                write!(f, "provider is missing required features: {:?}", missing)
            }
            Error::Listen(status) => write!(f, "failed to create listener: {}", status),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for taglink operations.
pub type Result<T> = std::result::Result<T, Error>;
