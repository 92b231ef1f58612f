use std::time::Duration;

use tokio::time::Instant;

use crate::{ConnectionId, Holder, Manager, Pool};

/// A connection that is currently checked out, together with its holder.
///
/// Returned by [`Pool::checked_out()`] and [`Pool::leaked()`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckoutInfo {
    /// Id of the connection.
    pub id: ConnectionId,
    /// Caller holding the connection.
    pub holder: Holder,
    /// Time the connection was handed to its holder.
    pub checked_out_at: Instant,
    /// Time the connection was created.
    pub created_at: Instant,
    /// Whether the connection counts against the overflow cap.
    pub overflow: bool,
}

impl CheckoutInfo {
    /// How long the connection has been checked out for.
    #[must_use]
    pub fn held_for(&self) -> Duration {
        self.checked_out_at.elapsed()
    }
}

impl<M: Manager> Pool<M> {
    /// Returns every connection that is currently checked out, the longest
    /// held first.
    #[must_use]
    pub fn checked_out(&self) -> Vec<CheckoutInfo> {
        self.inner.state.lock().checked_out()
    }

    /// Returns the connections that have been checked out for longer than
    /// `threshold`.
    ///
    /// This is purely diagnostic. The pool never takes a connection away
    /// from its holder, so a leaked connection keeps its slot until it is
    /// released, discarded or the process exits.
    #[must_use]
    pub fn leaked(&self, threshold: Duration) -> Vec<CheckoutInfo> {
        let now = Instant::now();
        self.checked_out()
            .into_iter()
            .filter(|info| now.saturating_duration_since(info.checked_out_at) > threshold)
            .collect()
    }
}
