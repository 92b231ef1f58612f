use std::{fmt, future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::oneshot, time::Instant};

use crate::{
    events::{Events, Listeners},
    object::Entry,
    state::{Grant, PoolState, SlotKind, WaitResult, WaiterId},
    ConnectionId, ConnectionState, EventListener, FailureReason, Holder, Manager, Object,
    PoolBuilder, PoolConfig, PoolError, PoolEvent, Status, TimeoutType,
};

/// Bounded connection pool with overflow capacity.
///
/// This struct can be cloned and transferred across thread boundaries and uses
/// reference counting for its internal state.
pub struct Pool<M: Manager> {
    pub(crate) inner: Arc<PoolInner<M>>,
}

// Implemented manually to avoid unnecessary trait bounds on `M`.
impl<M: Manager> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("state", &*self.inner.state.lock())
            .field("listeners", &self.inner.listeners)
            .finish()
    }
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

enum Step<M: Manager> {
    Ready(Object<M>),
    Create(SlotKind),
    Wait(WaiterId, oneshot::Receiver<WaitResult<M>>),
}

impl<M: Manager> Pool<M> {
    /// Instantiates a builder for a new [`Pool`].
    ///
    /// This is the only way to create a [`Pool`] instance.
    pub fn builder(manager: M) -> PoolBuilder<M> {
        PoolBuilder::new(manager)
    }

    pub(crate) fn from_builder(builder: PoolBuilder<M>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                manager: builder.manager,
                state: Mutex::new(PoolState::new(builder.config)),
                listeners: Listeners::new(builder.listeners),
                config: builder.config,
            }),
        }
    }

    /// Retrieves an [`Object`] for an anonymous caller using the configured
    /// timeout.
    ///
    /// # Errors
    ///
    /// See [`PoolError`] for details.
    pub async fn get(&self) -> Result<Object<M>, PoolError<M::Error>> {
        self.acquire(Holder::anonymous(), None).await
    }

    /// Retrieves an [`Object`] from this [`Pool`] or waits for one to
    /// become available.
    ///
    /// An idle connection is reused if there is one. Otherwise a new one is
    /// created as long as the base capacity or the overflow cap allows it.
    /// If neither is possible the caller is queued behind everybody else
    /// already waiting. `timeout` overrides [`PoolConfig::timeout`] when set.
    ///
    /// Dropping the returned future abandons the request without losing the
    /// caller's place to anybody but the next waiter.
    ///
    /// # Errors
    ///
    /// See [`PoolError`] for details.
    pub async fn acquire(
        &self,
        holder: impl Into<Holder>,
        timeout: Option<Duration>,
    ) -> Result<Object<M>, PoolError<M::Error>> {
        let holder = holder.into();
        let result = self.try_acquire(&holder, timeout).await;
        let reason = match &result {
            Ok(_) | Err(PoolError::InvalidRelease(_)) => return result,
            Err(PoolError::Timeout(_)) => FailureReason::Timeout,
            Err(PoolError::CreateFailed(_)) => FailureReason::CreateFailed,
            Err(PoolError::Disposed) => FailureReason::Disposed,
        };
        self.inner
            .publish_one(&PoolEvent::AcquireFailed { holder, reason });
        result
    }

    async fn try_acquire(
        &self,
        holder: &Holder,
        timeout: Option<Duration>,
    ) -> Result<Object<M>, PoolError<M::Error>> {
        let timeout = timeout.or(self.inner.config.timeout);
        let non_blocking = timeout.map_or(false, |t| t.is_zero());
        let start = Instant::now();
        let deadline = timeout.and_then(|d| start.checked_add(d));

        let mut events = Events::default();
        let step: Step<M> = {
            let mut state = self.inner.state.lock();
            if state.is_disposed() {
                return Err(PoolError::Disposed);
            }
            if let Some(entry) = state.checkout_idle(holder, start, Duration::ZERO, &mut events) {
                Step::Ready(Object::new(entry, &self.inner, holder.clone(), start))
            } else if let Some(kind) = state.reserve() {
                Step::Create(kind)
            } else if non_blocking {
                return Err(PoolError::Timeout(TimeoutType::Wait));
            } else {
                let (id, rx) = state.enqueue(holder.clone(), start);
                Step::Wait(id, rx)
            }
        };

        let kind = match step {
            Step::Ready(obj) => {
                self.inner.publish(events);
                return Ok(obj);
            }
            // Only a checkout from the idle set collects events.
            Step::Create(kind) => kind,
            Step::Wait(id, rx) => {
                let mut waiter = WaiterGuard {
                    pool: &self.inner,
                    id,
                    rx,
                    resolved: false,
                };
                match waiter.wait(deadline).await? {
                    Grant::Connection {
                        entry,
                        checked_out_at,
                    } => {
                        return Ok(Object::new(
                            entry,
                            &self.inner,
                            holder.clone(),
                            checked_out_at,
                        ));
                    }
                    Grant::Slot(kind) => kind,
                }
            }
        };
        self.create(holder, kind, start, deadline).await
    }

    async fn create(
        &self,
        holder: &Holder,
        kind: SlotKind,
        start: Instant,
        deadline: Option<Instant>,
    ) -> Result<Object<M>, PoolError<M::Error>> {
        let mut reservation = Reservation {
            pool: &self.inner,
            kind: Some(kind),
        };
        let created: Result<M::Type, PoolError<M::Error>> =
            apply_timeout(TimeoutType::Create, deadline, self.inner.manager.create()).await;
        let obj = created?;

        let now = Instant::now();
        let mut events = Events::default();
        let registered = {
            let mut state = self.inner.state.lock();
            reservation.disarm();
            state.register(
                kind,
                obj,
                holder,
                now,
                now.saturating_duration_since(start),
                &mut events,
            )
        };
        let result = match registered {
            Ok(entry) => Ok(Object::new(entry, &self.inner, holder.clone(), now)),
            Err(entry) => {
                self.inner.manager.destroy(entry.obj);
                Err(PoolError::Disposed)
            }
        };
        self.inner.publish(events);
        result
    }

    /// Returns a connection to this [`Pool`].
    ///
    /// This is what dropping an [`Object`] does as well. The connection is
    /// handed straight to the oldest waiter if there is one.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidRelease`] if the [`Object`] was checked out
    /// from a different [`Pool`]. It is returned to its own [`Pool`] then.
    pub fn release(&self, obj: Object<M>) -> Result<(), PoolError<M::Error>> {
        if !Object::belongs_to(&obj, &self.inner) {
            let id = Object::id(&obj);
            tracing::error!(connection = %id, "released connection belongs to another pool");
            return Err(PoolError::InvalidRelease(id));
        }
        self.inner
            .release_entry(Object::detach(obj))
            .map_err(PoolError::InvalidRelease)
    }

    /// Destroys a broken connection instead of returning it to this [`Pool`].
    ///
    /// The freed capacity is passed on to the oldest waiter, which then
    /// creates a replacement connection.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidRelease`] if the [`Object`] was checked out
    /// from a different [`Pool`]. It is returned to its own [`Pool`] then.
    pub fn discard(&self, obj: Object<M>) -> Result<(), PoolError<M::Error>> {
        if !Object::belongs_to(&obj, &self.inner) {
            let id = Object::id(&obj);
            tracing::error!(connection = %id, "discarded connection belongs to another pool");
            return Err(PoolError::InvalidRelease(id));
        }
        let entry = Object::detach(obj);
        let id = entry.id;
        let mut events = Events::default();
        let result = self.inner.state.lock().discard(entry, &mut events);
        match result {
            Ok(entry) => {
                self.inner.manager.destroy(entry.obj);
                self.inner.publish(events);
                Ok(())
            }
            Err(entry) => {
                self.inner.manager.destroy(entry.obj);
                tracing::error!(connection = %id, "discarded connection was not checked out");
                Err(PoolError::InvalidRelease(id))
            }
        }
    }

    /// Disposes this [`Pool`].
    ///
    /// All current and future tasks waiting for [`Object`]s will return
    /// [`PoolError::Disposed`] immediately and all idle connections are
    /// destroyed. Checked out connections are destroyed once their holders
    /// release them.
    pub fn dispose(&self) {
        let mut events = Events::default();
        let idle = self.inner.state.lock().dispose(&mut events);
        tracing::info!(closed = idle.len(), "pool disposed");
        for entry in idle {
            self.inner.manager.destroy(entry.obj);
        }
        self.inner.publish(events);
    }

    /// Indicates whether this [`Pool`] has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().is_disposed()
    }

    /// Retrieves [`Status`] of this [`Pool`].
    #[must_use]
    pub fn status(&self) -> Status {
        self.inner.state.lock().status()
    }

    /// Returns the [`PoolConfig`] this [`Pool`] was built with.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Returns the lifecycle state of the connection with the given id, or
    /// [`None`] if this [`Pool`] never created it.
    #[must_use]
    pub fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.inner.state.lock().connection_state(id)
    }

    /// Returns [`Manager`] of this [`Pool`].
    #[must_use]
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Registers an [`EventListener`].
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.inner.listeners.add(listener);
    }

    /// Subscribes to the events of this [`Pool`].
    ///
    /// Events are buffered without bound until the receiver consumes them.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<PoolEvent> {
        self.inner.listeners.subscribe()
    }

    /// Publishes a [`PoolEvent::QueryTimed`] event.
    pub fn record_query(&self, duration: Duration) {
        self.inner.publish_one(&PoolEvent::QueryTimed { duration });
    }

    /// Runs `future` and publishes how long it took as a
    /// [`PoolEvent::QueryTimed`] event.
    pub async fn timed<F: Future>(&self, future: F) -> F::Output {
        let start = Instant::now();
        let output = future.await;
        self.record_query(start.elapsed());
        output
    }
}

pub(crate) struct PoolInner<M: Manager> {
    pub(crate) state: Mutex<PoolState<M>>,
    config: PoolConfig,
    listeners: Listeners,
    manager: M,
}

impl<M: Manager> PoolInner<M> {
    /// Takes back a connection from its holder.
    ///
    /// Returns the id as `Err` if the connection isn't checked out from this
    /// pool. Counters are left untouched then.
    pub(crate) fn release_entry(&self, entry: Entry<M::Type>) -> Result<(), ConnectionId> {
        let id = entry.id;
        let mut events = Events::default();
        let result = self
            .state
            .lock()
            .checkin(entry, Instant::now(), &mut events);
        match result {
            Ok(None) => {}
            Ok(Some(entry)) => self.manager.destroy(entry.obj),
            Err(entry) => {
                self.manager.destroy(entry.obj);
                return Err(id);
            }
        }
        self.publish(events);
        Ok(())
    }

    fn publish(&self, events: Events) {
        for event in events.into_vec() {
            self.publish_one(&event);
        }
    }

    fn publish_one(&self, event: &PoolEvent) {
        log_event(event);
        self.listeners.emit(event);
    }
}

fn log_event(event: &PoolEvent) {
    match event {
        PoolEvent::Connect { id, overflow } => {
            tracing::debug!(connection = %id, overflow, "connection created");
        }
        PoolEvent::Close { id } => tracing::debug!(connection = %id, "connection closed"),
        PoolEvent::Checkout { id, holder, waited } => {
            tracing::trace!(connection = %id, %holder, ?waited, "checkout");
        }
        PoolEvent::Checkin { id, held } => tracing::trace!(connection = %id, ?held, "checkin"),
        PoolEvent::AcquireFailed { holder, reason } => match reason {
            FailureReason::Disposed => {
                tracing::debug!(%holder, "acquire rejected, pool disposed");
            }
            reason => tracing::warn!(%holder, ?reason, "acquire failed"),
        },
        PoolEvent::QueryTimed { duration } => tracing::trace!(?duration, "query timed"),
    }
}

/// A queued acquisition request.
///
/// Giving up on the request, because of the deadline or because the owning
/// future was dropped, goes through the pool lock: either the waiter is
/// still queued and gets removed, or it was already resolved and the result
/// sitting in its channel is taken over. A grant can therefore never be lost.
struct WaiterGuard<'a, M: Manager> {
    pool: &'a PoolInner<M>,
    id: WaiterId,
    rx: oneshot::Receiver<WaitResult<M>>,
    resolved: bool,
}

impl<M: Manager> WaiterGuard<'_, M> {
    async fn wait(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<Grant<M::Type>, PoolError<M::Error>> {
        let received = match deadline {
            None => (&mut self.rx).await.ok(),
            Some(deadline) => match tokio::time::timeout_at(deadline, &mut self.rx).await {
                Ok(received) => received.ok(),
                Err(_) => {
                    let mut state = self.pool.state.lock();
                    if state.remove_waiter(self.id) {
                        self.resolved = true;
                        return Err(PoolError::Timeout(TimeoutType::Wait));
                    }
                    // Resolved while the timer fired, the grant wins.
                    self.rx.try_recv().ok()
                }
            },
        };
        self.resolved = true;
        received.unwrap_or(Err(PoolError::Disposed))
    }
}

impl<M: Manager> Drop for WaiterGuard<'_, M> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let mut state = self.pool.state.lock();
        if state.remove_waiter(self.id) {
            return;
        }
        match self.rx.try_recv() {
            Ok(Ok(Grant::Connection { entry, .. })) => {
                drop(state);
                let _ = self.pool.release_entry(entry);
            }
            Ok(Ok(Grant::Slot(kind))) => state.unreserve(kind),
            Ok(Err(_)) | Err(_) => {}
        }
    }
}

/// Capacity reserved for a connection that is being created.
///
/// Dropping it without [`Reservation::disarm()`], because creation failed,
/// timed out or was cancelled, gives the capacity back.
struct Reservation<'a, M: Manager> {
    pool: &'a PoolInner<M>,
    kind: Option<SlotKind>,
}

impl<M: Manager> Reservation<'_, M> {
    fn disarm(&mut self) {
        self.kind = None;
    }
}

impl<M: Manager> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        if let Some(kind) = self.kind.take() {
            self.pool.state.lock().unreserve(kind);
        }
    }
}

async fn apply_timeout<O, E>(
    timeout_type: TimeoutType,
    instant: Option<Instant>,
    future: impl Future<Output = Result<O, impl Into<PoolError<E>>>>,
) -> Result<O, PoolError<E>> {
    match instant {
        None => future.await.map_err(Into::into),
        Some(instant) => tokio::time::timeout_at(instant, future)
            .await
            .map_err(|_| PoolError::Timeout(timeout_type))?
            .map_err(Into::into),
    }
}
