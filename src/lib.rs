#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(
    nonstandard_style,
    rust_2018_idioms,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links
)]
#![warn(clippy::pedantic)]
#![warn(
    deprecated_in_future,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub,
    unused_import_braces,
    unused_labels,
    unused_lifetimes,
    unused_qualifications,
    unused_results
)]
#![allow(
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::match_same_arms
)]

mod builder;
mod config;
mod errors;
mod events;
mod leak;
mod metrics;
mod object;
mod pool;
mod state;

pub use self::{
    builder::PoolBuilder,
    config::{OverflowPolicy, PoolConfig},
    errors::{BuildError, PoolError, TimeoutType},
    events::{ChannelListener, EventListener, FailureReason, PoolEvent},
    leak::CheckoutInfo,
    metrics::{StatsCollector, StatsSnapshot, StatsSummary},
    object::{ConnectionId, ConnectionState, Holder, Object},
    pool::Pool,
};

use async_trait::async_trait;

/// The current pool status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status {
    /// The maximum number of live connections (`base_size + max_overflow`).
    pub max_size: usize,

    /// The configured base capacity.
    pub base_size: usize,

    /// The configured overflow cap.
    pub max_overflow: usize,

    /// The live connections, including ones that are still being created.
    pub size: usize,

    /// The connections currently idle in the pool.
    pub idle: usize,

    /// The connections currently checked out.
    pub in_use: usize,

    /// The live connections counted against the overflow cap.
    pub overflow: usize,

    /// The connections that could be handed out right now without waiting,
    /// either idle or not yet created.
    pub available: usize,

    /// The callers queued for a connection.
    pub waiting: usize,
}

/// Manager responsible for creating new connections and destroying broken or
/// surplus ones.
///
/// The pool treats [`Manager::Type`] as opaque and never inspects it.
#[async_trait]
pub trait Manager: Sync + Send {
    /// Type of the connections that this [`Manager`] creates.
    type Type: Send;
    /// Error that this [`Manager`] can return when creating connections.
    type Error: Send;

    /// Creates a new instance of [`Manager::Type`].
    ///
    /// This is never called while the pool's internal lock is held, so it may
    /// take as long as a physical connect takes.
    async fn create(&self) -> Result<Self::Type, Self::Error>;

    /// Destroys an instance of [`Manager::Type`] that leaves the pool.
    ///
    /// This runs from [`Drop`] implementations and therefore can't block on
    /// async work. The default implementation just drops the object.
    fn destroy(&self, obj: Self::Type) {
        drop(obj);
    }
}
