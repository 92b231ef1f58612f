//! Lifecycle notifications published by a [`Pool`].
//!
//! Every state transition of the pool publishes exactly one [`PoolEvent`]
//! per affected connection. Events are dispatched after the pool's internal
//! lock has been released, so listeners may call back into the pool. They
//! must not block though: a slow subscriber should use a [`ChannelListener`]
//! and process the events on its own task.
//!
//! [`Pool`]: crate::Pool

use std::{fmt, sync::Arc, time::Duration};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::{ConnectionId, Holder};

/// A pool lifecycle event.
///
/// Events collected in one transition are delivered in order, e.g. a
/// [`PoolEvent::Connect`] always precedes the [`PoolEvent::Checkout`] of the
/// same connection. Events of different transitions are published by the
/// tasks that caused them without further coordination, so listeners may see
/// them out of order. A `Checkin` can arrive after the `Checkout` that
/// followed it on another task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolEvent {
    /// A new connection was created.
    Connect {
        /// Id of the new connection.
        id: ConnectionId,
        /// Number of live overflow connections after this one was created.
        overflow: usize,
    },

    /// A connection was destroyed.
    Close {
        /// Id of the destroyed connection.
        id: ConnectionId,
    },

    /// A connection was handed to a caller.
    Checkout {
        /// Id of the connection.
        id: ConnectionId,
        /// Caller that received the connection.
        holder: Holder,
        /// Time the caller spent waiting for it.
        waited: Duration,
    },

    /// A connection was released by its holder.
    Checkin {
        /// Id of the connection.
        id: ConnectionId,
        /// Time the connection was checked out for.
        held: Duration,
    },

    /// An acquisition failed.
    AcquireFailed {
        /// Caller whose acquisition failed.
        holder: Holder,
        /// Why it failed.
        reason: FailureReason,
    },

    /// A caller reported how long a query on a connection took.
    QueryTimed {
        /// Duration of the query.
        duration: Duration,
    },
}

/// Cause of a [`PoolEvent::AcquireFailed`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// The caller's deadline expired.
    Timeout,
    /// The [`Manager`] failed to create a connection.
    ///
    /// [`Manager`]: crate::Manager
    CreateFailed,
    /// The pool was disposed.
    Disposed,
}

/// Receiver of [`PoolEvent`]s.
///
/// Listeners are called synchronously from whichever task triggered the
/// transition, so implementations must return quickly.
pub trait EventListener: Send + Sync {
    /// Handles a single event.
    fn on_event(&self, event: &PoolEvent);
}

/// [`EventListener`] forwarding every event into an unbounded channel.
///
/// Sending never blocks. Once the receiving half is dropped, events are
/// silently discarded.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<PoolEvent>,
}

impl ChannelListener {
    /// Creates a new listener together with the receiving half of its
    /// channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for ChannelListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelListener")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl EventListener for ChannelListener {
    fn on_event(&self, event: &PoolEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Registered listeners of a pool.
#[derive(Default)]
pub(crate) struct Listeners {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
    channels: RwLock<Vec<ChannelListener>>,
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("listeners", &self.listeners.read().len())
            .field("channels", &self.channels.read().len())
            .finish()
    }
}

impl Listeners {
    pub(crate) fn new(listeners: Vec<Arc<dyn EventListener>>) -> Self {
        Self {
            listeners: RwLock::new(listeners),
            channels: RwLock::default(),
        }
    }

    pub(crate) fn add(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<PoolEvent> {
        let (listener, rx) = ChannelListener::new();
        let mut channels = self.channels.write();
        channels.retain(|c| !c.is_closed());
        channels.push(listener);
        rx
    }

    pub(crate) fn emit(&self, event: &PoolEvent) {
        for listener in self.listeners.read().iter() {
            listener.on_event(event);
        }
        for channel in self.channels.read().iter() {
            channel.on_event(event);
        }
    }
}

/// Events collected while the pool lock is held and published once it has
/// been released.
#[derive(Debug, Default)]
#[must_use = "collected events have to be published"]
pub(crate) struct Events(Vec<PoolEvent>);

impl Events {
    pub(crate) fn push(&mut self, event: PoolEvent) {
        self.0.push(event);
    }

    pub(crate) fn into_vec(self) -> Vec<PoolEvent> {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn as_slice(&self) -> &[PoolEvent] {
        &self.0
    }
}
