//! Pool internals synchronized with a mutex.
//!
//! The idle set, the checkout map, the capacity counters and the waiter queue
//! are mutated together under one lock, so every transition is atomic with
//! respect to all others. Nothing in here awaits or talks to the [`Manager`].

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    time::Duration,
};

use tokio::{sync::oneshot, time::Instant};

use crate::{
    events::Events, object::Entry, CheckoutInfo, ConnectionId, ConnectionState, Holder, Manager,
    OverflowPolicy, PoolConfig, PoolError, PoolEvent, Status,
};

/// Which capacity counter a connection, or a reservation for one, is
/// accounted against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotKind {
    Base,
    Overflow,
}

/// What a parked waiter gets handed.
#[derive(Debug)]
pub(crate) enum Grant<T> {
    /// A connection that has already been checked out on the waiter's behalf.
    Connection {
        entry: Entry<T>,
        checked_out_at: Instant,
    },
    /// A reserved slot. The waiter creates the connection itself.
    Slot(SlotKind),
}

pub(crate) type WaitResult<M> =
    Result<Grant<<M as Manager>::Type>, PoolError<<M as Manager>::Error>>;

pub(crate) type WaiterId = u64;

struct Waiter<M: Manager> {
    id: WaiterId,
    holder: Holder,
    enqueued_at: Instant,
    tx: oneshot::Sender<WaitResult<M>>,
}

/// Pool internals protected by a mutex.
pub(crate) struct PoolState<M: Manager> {
    config: PoolConfig,
    /// Idle connections, reused oldest first.
    idle: VecDeque<Entry<M::Type>>,
    /// Connections currently checked out.
    checked_out: HashMap<ConnectionId, CheckoutInfo>,
    /// Callers waiting for a connection, oldest first.
    waiters: VecDeque<Waiter<M>>,
    /// Live base connections, including reservations.
    base_live: usize,
    /// Live overflow connections, including reservations.
    overflow_live: usize,
    /// Reserved slots whose connection is still being created.
    creating: usize,
    /// The part of `creating` accounted against the overflow cap.
    creating_overflow: usize,
    next_connection: u64,
    next_waiter: WaiterId,
    disposed: bool,
}

impl<M: Manager> fmt::Debug for PoolState<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolState")
            .field("idle", &self.idle.len())
            .field("checked_out", &self.checked_out.len())
            .field("waiters", &self.waiters.len())
            .field("base_live", &self.base_live)
            .field("overflow_live", &self.overflow_live)
            .field("creating", &self.creating)
            .field("creating_overflow", &self.creating_overflow)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl<M: Manager> PoolState<M> {
    pub(crate) fn new(config: PoolConfig) -> Self {
        Self {
            config,
            idle: VecDeque::with_capacity(config.base_size),
            checked_out: HashMap::new(),
            waiters: VecDeque::new(),
            base_live: 0,
            overflow_live: 0,
            creating: 0,
            creating_overflow: 0,
            next_connection: 0,
            next_waiter: 0,
            disposed: false,
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Checks out the oldest idle connection.
    ///
    /// Never hands anything out while callers are queued, so fresh arrivals
    /// can't overtake them.
    pub(crate) fn checkout_idle(
        &mut self,
        holder: &Holder,
        now: Instant,
        waited: Duration,
        events: &mut Events,
    ) -> Option<Entry<M::Type>> {
        if !self.waiters.is_empty() {
            return None;
        }
        let entry = self.idle.pop_front()?;
        self.track(&entry, holder.clone(), now);
        events.push(PoolEvent::Checkout {
            id: entry.id,
            holder: holder.clone(),
            waited,
        });
        Some(entry)
    }

    /// Reserves capacity for a new connection.
    ///
    /// Base capacity is used up before overflow capacity.
    pub(crate) fn reserve(&mut self) -> Option<SlotKind> {
        if self.disposed || !self.waiters.is_empty() {
            return None;
        }
        self.reserve_slot()
    }

    fn reserve_slot(&mut self) -> Option<SlotKind> {
        let kind = if self.base_live < self.config.base_size {
            self.base_live += 1;
            SlotKind::Base
        } else if self.overflow_live < self.config.max_overflow {
            self.overflow_live += 1;
            self.creating_overflow += 1;
            SlotKind::Overflow
        } else {
            return None;
        };
        self.creating += 1;
        Some(kind)
    }

    /// Gives back a reservation whose connection was never created and
    /// passes the freed slot on to the oldest waiter, if any.
    pub(crate) fn unreserve(&mut self, kind: SlotKind) {
        self.settle(kind);
        self.free(kind);
        self.wake_for_capacity();
    }

    /// Ends the creation phase of a reservation.
    fn settle(&mut self, kind: SlotKind) {
        self.creating -= 1;
        if kind == SlotKind::Overflow {
            self.creating_overflow -= 1;
        }
    }

    /// Overflow connections that actually exist, without reservations.
    fn overflow_established(&self) -> usize {
        self.overflow_live - self.creating_overflow
    }

    fn free(&mut self, kind: SlotKind) {
        match kind {
            SlotKind::Base => self.base_live -= 1,
            SlotKind::Overflow => self.overflow_live -= 1,
        }
    }

    /// Turns a reservation into a checked out connection.
    ///
    /// Returns the entry as `Err` when the pool was disposed while the
    /// connection was being created. It must be destroyed by the caller.
    pub(crate) fn register(
        &mut self,
        kind: SlotKind,
        obj: M::Type,
        holder: &Holder,
        now: Instant,
        waited: Duration,
        events: &mut Events,
    ) -> Result<Entry<M::Type>, Entry<M::Type>> {
        self.settle(kind);
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        let entry = Entry {
            id,
            obj,
            created_at: now,
            kind,
        };
        events.push(PoolEvent::Connect {
            id,
            overflow: self.overflow_established(),
        });
        if self.disposed {
            self.free(kind);
            events.push(PoolEvent::Close { id });
            return Err(entry);
        }
        self.track(&entry, holder.clone(), now);
        events.push(PoolEvent::Checkout {
            id,
            holder: holder.clone(),
            waited,
        });
        Ok(entry)
    }

    /// Parks a caller at the back of the waiter queue.
    pub(crate) fn enqueue(
        &mut self,
        holder: Holder,
        now: Instant,
    ) -> (WaiterId, oneshot::Receiver<WaitResult<M>>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_waiter;
        self.next_waiter += 1;
        self.waiters.push_back(Waiter {
            id,
            holder,
            enqueued_at: now,
            tx,
        });
        (id, rx)
    }

    /// Removes a waiter that gave up, either because its deadline expired or
    /// because it was cancelled.
    ///
    /// Returns `false` if the waiter was already resolved. Its result is in
    /// its channel then.
    pub(crate) fn remove_waiter(&mut self, id: WaiterId) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(i) => {
                let _ = self.waiters.remove(i);
                true
            }
            None => false,
        }
    }

    /// Takes back a checked out connection.
    ///
    /// The connection goes to the oldest waiter if there is one, otherwise
    /// it becomes idle. `Ok(Some(_))` means the connection has to be
    /// destroyed by the caller. `Err` means it wasn't checked out from here.
    pub(crate) fn checkin(
        &mut self,
        entry: Entry<M::Type>,
        now: Instant,
        events: &mut Events,
    ) -> Result<Option<Entry<M::Type>>, Entry<M::Type>> {
        let info = match self.checked_out.remove(&entry.id) {
            Some(info) => info,
            None => return Err(entry),
        };
        events.push(PoolEvent::Checkin {
            id: entry.id,
            held: now.saturating_duration_since(info.checked_out_at),
        });
        if self.disposed {
            return Ok(Some(self.close(entry, events)));
        }
        let entry = match self.hand_off(entry, now, events) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        if entry.kind == SlotKind::Overflow && self.config.overflow_policy == OverflowPolicy::Close
        {
            return Ok(Some(self.close(entry, events)));
        }
        self.idle.push_back(entry);
        Ok(None)
    }

    /// Removes a broken connection from the pool. The freed slot is passed
    /// on to the oldest waiter.
    pub(crate) fn discard(
        &mut self,
        entry: Entry<M::Type>,
        events: &mut Events,
    ) -> Result<Entry<M::Type>, Entry<M::Type>> {
        if self.checked_out.remove(&entry.id).is_none() {
            return Err(entry);
        }
        let entry = self.close(entry, events);
        self.wake_for_capacity();
        Ok(entry)
    }

    /// Marks the pool as disposed, fails all waiters and returns the idle
    /// connections for destruction.
    pub(crate) fn dispose(&mut self, events: &mut Events) -> Vec<Entry<M::Type>> {
        self.disposed = true;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.tx.send(Err(PoolError::Disposed));
        }
        let idle = std::mem::take(&mut self.idle);
        idle.into_iter()
            .map(|entry| self.close(entry, events))
            .collect()
    }

    fn close(&mut self, entry: Entry<M::Type>, events: &mut Events) -> Entry<M::Type> {
        self.free(entry.kind);
        events.push(PoolEvent::Close { id: entry.id });
        entry
    }

    fn track(&mut self, entry: &Entry<M::Type>, holder: Holder, now: Instant) {
        let _ = self.checked_out.insert(
            entry.id,
            CheckoutInfo {
                id: entry.id,
                holder,
                checked_out_at: now,
                created_at: entry.created_at,
                overflow: entry.kind == SlotKind::Overflow,
            },
        );
    }

    /// Gives a connection to the oldest waiter that is still listening.
    ///
    /// Returns the connection if nobody took it.
    fn hand_off(
        &mut self,
        mut entry: Entry<M::Type>,
        now: Instant,
        events: &mut Events,
    ) -> Option<Entry<M::Type>> {
        while let Some(waiter) = self.waiters.pop_front() {
            let id = entry.id;
            self.track(&entry, waiter.holder.clone(), now);
            let grant = Grant::Connection {
                entry,
                checked_out_at: now,
            };
            match waiter.tx.send(Ok(grant)) {
                Ok(()) => {
                    events.push(PoolEvent::Checkout {
                        id,
                        holder: waiter.holder,
                        waited: now.saturating_duration_since(waiter.enqueued_at),
                    });
                    return None;
                }
                Err(returned) => {
                    let _ = self.checked_out.remove(&id);
                    match returned {
                        Ok(Grant::Connection { entry: back, .. }) => entry = back,
                        // Only connection grants are sent above.
                        Ok(Grant::Slot(_)) | Err(_) => return None,
                    }
                }
            }
        }
        Some(entry)
    }

    /// Hands reserved slots to waiters for as long as there is free
    /// capacity.
    fn wake_for_capacity(&mut self) {
        if self.disposed {
            return;
        }
        while let Some(waiter) = self.waiters.pop_front() {
            let kind = match self.reserve_slot() {
                Some(kind) => kind,
                None => {
                    self.waiters.push_front(waiter);
                    break;
                }
            };
            if waiter.tx.send(Ok(Grant::Slot(kind))).is_err() {
                self.settle(kind);
                self.free(kind);
            }
        }
    }

    pub(crate) fn status(&self) -> Status {
        let size = self.base_live + self.overflow_live;
        let max_size = self.config.max_size();
        Status {
            max_size,
            base_size: self.config.base_size,
            max_overflow: self.config.max_overflow,
            size,
            idle: self.idle.len(),
            in_use: self.checked_out.len(),
            overflow: self.overflow_live,
            available: self.idle.len() + (max_size - size),
            waiting: self.waiters.len(),
        }
    }

    pub(crate) fn checked_out(&self) -> Vec<CheckoutInfo> {
        let mut checked_out: Vec<_> = self.checked_out.values().cloned().collect();
        checked_out.sort_by_key(|info| (info.checked_out_at, info.id));
        checked_out
    }

    pub(crate) fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        if id.0 >= self.next_connection {
            None
        } else if self.checked_out.contains_key(&id) {
            Some(ConnectionState::InUse)
        } else if self.idle.iter().any(|entry| entry.id == id) {
            Some(ConnectionState::Idle)
        } else {
            Some(ConnectionState::Closed)
        }
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        let live = self.idle.len() + self.checked_out.len() + self.creating;
        assert_eq!(live, self.base_live + self.overflow_live);
        assert!(self.creating_overflow <= self.creating);
        assert!(self.creating_overflow <= self.overflow_live);
        assert!(self.base_live <= self.config.base_size);
        assert!(self.overflow_live <= self.config.max_overflow);
        assert!(
            self.checked_out.len() + self.idle.len() <= self.config.base_size + self.overflow_live
        );
        if !self.waiters.is_empty() {
            assert!(self.idle.is_empty());
        }
    }
}
