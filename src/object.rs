use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Weak},
};

use tokio::time::Instant;

use crate::{pool::PoolInner, state::SlotKind, Manager, Pool};

/// Identity of a connection created by a [`Pool`].
///
/// Ids are unique per [`Pool`] and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    /// Returns the raw numeric id.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a connection.
///
/// `Idle` and `InUse` alternate until the connection is closed. `Closed` is
/// terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Sitting in the pool, ready to be checked out.
    Idle,
    /// Checked out by a caller.
    InUse,
    /// Destroyed through the [`Manager`].
    Closed,
}

/// Opaque token identifying the caller that holds a connection.
///
/// It is only used to attribute checked out connections, e.g. when looking
/// for leaks.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Holder(Arc<str>);

impl Holder {
    /// Creates a new [`Holder`] from the given name.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    /// The holder used by [`Pool::get()`].
    #[must_use]
    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }

    /// Returns the name of this holder.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Holder {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Holder {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<&Holder> for Holder {
    fn from(holder: &Holder) -> Self {
        holder.clone()
    }
}

#[derive(Debug)]
pub(crate) struct Entry<T> {
    pub(crate) id: ConnectionId,
    pub(crate) obj: T,
    pub(crate) created_at: Instant,
    pub(crate) kind: SlotKind,
}

/// Wrapper around the actual pooled connection which implements [`Deref`],
/// [`DerefMut`] and [`Drop`] traits.
///
/// Use this object just as if it was of type `T` and upon leaving a scope the
/// [`Drop::drop()`] will take care of returning it to the pool. An [`Object`]
/// that is never dropped stays checked out forever and shows up in
/// [`Pool::leaked()`].
#[must_use]
pub struct Object<M: Manager> {
    /// The actual connection
    inner: Option<Entry<M::Type>>,

    /// Pool to return the connection to.
    pool: Weak<PoolInner<M>>,

    /// Caller holding the connection
    holder: Holder,

    /// Time this connection was checked out
    checked_out_at: Instant,
}

impl<M> fmt::Debug for Object<M>
where
    M: Manager,
    M::Type: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("inner", &self.inner)
            .field("holder", &self.holder)
            .finish()
    }
}

impl<M: Manager> Object<M> {
    pub(crate) fn new(
        inner: Entry<M::Type>,
        pool: &Arc<PoolInner<M>>,
        holder: Holder,
        checked_out_at: Instant,
    ) -> Self {
        Self {
            inner: Some(inner),
            pool: Arc::downgrade(pool),
            holder,
            checked_out_at,
        }
    }

    /// Returns the id of the connection.
    #[must_use]
    pub fn id(this: &Self) -> ConnectionId {
        this.entry().id
    }

    /// Returns the caller holding this connection.
    #[must_use]
    pub fn holder(this: &Self) -> &Holder {
        &this.holder
    }

    /// Returns the time this connection was checked out.
    #[must_use]
    pub fn checked_out_at(this: &Self) -> Instant {
        this.checked_out_at
    }

    /// Indicates whether this connection counts against the overflow cap.
    #[must_use]
    pub fn is_overflow(this: &Self) -> bool {
        this.entry().kind == SlotKind::Overflow
    }

    /// Returns the [`Pool`] this [`Object`] belongs to.
    ///
    /// Since [`Object`]s only hold a [`Weak`] reference to the [`Pool`] they
    /// come from, this can fail and return [`None`] instead.
    pub fn pool(this: &Self) -> Option<Pool<M>> {
        this.pool.upgrade().map(|inner| Pool { inner })
    }

    pub(crate) fn belongs_to(this: &Self, pool: &Arc<PoolInner<M>>) -> bool {
        std::ptr::eq(this.pool.as_ptr(), Arc::as_ptr(pool))
    }

    /// Takes the connection out of the guard so that dropping it doesn't
    /// return anything to the pool.
    pub(crate) fn detach(mut this: Self) -> Entry<M::Type> {
        this.inner.take().unwrap()
    }

    fn entry(&self) -> &Entry<M::Type> {
        self.inner.as_ref().unwrap()
    }
}

impl<M: Manager> Drop for Object<M> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            if let Some(pool) = self.pool.upgrade() {
                if let Err(id) = pool.release_entry(inner) {
                    tracing::error!(connection = %id, "dropped connection was not checked out");
                }
            }
        }
    }
}

impl<M: Manager> Deref for Object<M> {
    type Target = M::Type;
    fn deref(&self) -> &M::Type {
        &self.entry().obj
    }
}

impl<M: Manager> DerefMut for Object<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner.as_mut().unwrap().obj
    }
}

impl<M: Manager> AsRef<M::Type> for Object<M> {
    fn as_ref(&self) -> &M::Type {
        self
    }
}

impl<M: Manager> AsMut<M::Type> for Object<M> {
    fn as_mut(&mut self) -> &mut M::Type {
        self
    }
}
