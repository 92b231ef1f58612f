use std::fmt;

use crate::ConnectionId;

/// Possible steps causing the timeout in an error returned by
/// [`Pool::acquire()`] method.
///
/// [`Pool::acquire()`]: super::Pool::acquire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutType {
    /// Timeout happened while waiting for a slot to become available.
    Wait,

    /// Timeout happened while creating a new connection.
    Create,
}

/// Possible errors returned by [`Pool`] operations.
///
/// [`Pool`]: super::Pool
#[derive(Debug)]
pub enum PoolError<E> {
    /// Timeout happened.
    Timeout(TimeoutType),

    /// The [`Manager`] failed to create a new connection.
    ///
    /// [`Manager`]: super::Manager
    CreateFailed(E),

    /// [`Pool`] has been disposed.
    ///
    /// [`Pool`]: super::Pool
    Disposed,

    /// The released connection isn't checked out from this [`Pool`].
    ///
    /// [`Pool`]: super::Pool
    InvalidRelease(ConnectionId),
}

impl<E> PoolError<E> {
    /// Indicates whether the pool had no capacity left before the deadline,
    /// as opposed to the backend failing to produce a connection.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Timeout(TimeoutType::Wait))
    }
}

impl<E> From<E> for PoolError<E> {
    fn from(e: E) -> Self {
        Self::CreateFailed(e)
    }
}

impl<E: fmt::Display> fmt::Display for PoolError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(tt) => match tt {
                TimeoutType::Wait => write!(
                    f,
                    "Timeout occurred while waiting for a slot to become available"
                ),
                TimeoutType::Create => {
                    write!(f, "Timeout occurred while creating a new connection")
                }
            },
            Self::CreateFailed(e) => {
                write!(f, "Error occurred while creating a new connection: {}", e)
            }
            Self::Disposed => write!(f, "Pool has been disposed"),
            Self::InvalidRelease(id) => {
                write!(f, "Connection {} is not checked out from this pool", id)
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for PoolError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Timeout(_) | Self::Disposed | Self::InvalidRelease(_) => None,
            Self::CreateFailed(e) => Some(e),
        }
    }
}

/// Possible errors returned by [`PoolBuilder::build()`].
///
/// [`PoolBuilder::build()`]: super::PoolBuilder::build
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum BuildError {
    /// The base capacity must be at least one connection.
    #[error("base_size must be greater than zero")]
    ZeroBaseSize,

    /// `base_size + max_overflow` doesn't fit into `usize`.
    #[error("base_size ({base_size}) + max_overflow ({max_overflow}) overflows usize")]
    CapacityOverflow {
        /// Configured base capacity.
        base_size: usize,
        /// Configured overflow cap.
        max_overflow: usize,
    },
}
