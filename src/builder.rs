use std::{fmt, sync::Arc, time::Duration};

use super::{BuildError, EventListener, Manager, OverflowPolicy, Pool, PoolConfig};

/// Builder for [`Pool`]s.
///
/// Instances of this are created by calling the [`Pool::builder()`] method.
#[must_use = "builder does nothing itself, use `.build()` to build it"]
pub struct PoolBuilder<M: Manager> {
    pub(crate) manager: M,
    pub(crate) config: PoolConfig,
    pub(crate) listeners: Vec<Arc<dyn EventListener>>,
}

// Implemented manually since listeners are trait objects.
impl<M> fmt::Debug for PoolBuilder<M>
where
    M: fmt::Debug + Manager,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("manager", &self.manager)
            .field("config", &self.config)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<M: Manager> PoolBuilder<M> {
    pub(crate) fn new(manager: M) -> Self {
        Self {
            manager,
            config: PoolConfig::default(),
            listeners: Vec::new(),
        }
    }

    /// Builds the [`Pool`].
    ///
    /// # Errors
    ///
    /// See [`BuildError`] for details.
    pub fn build(self) -> Result<Pool<M>, BuildError> {
        self.config.validate()?;
        Ok(Pool::from_builder(self))
    }

    /// Sets a [`PoolConfig`] to build the [`Pool`] with.
    pub fn config(mut self, value: PoolConfig) -> Self {
        self.config = value;
        self
    }

    /// Sets the [`PoolConfig::base_size`].
    pub fn base_size(mut self, value: usize) -> Self {
        self.config.base_size = value;
        self
    }

    /// Sets the [`PoolConfig::max_overflow`].
    pub fn max_overflow(mut self, value: usize) -> Self {
        self.config.max_overflow = value;
        self
    }

    /// Sets the [`PoolConfig::timeout`].
    pub fn timeout(mut self, value: Option<Duration>) -> Self {
        self.config.timeout = value;
        self
    }

    /// Sets the [`PoolConfig::overflow_policy`].
    pub fn overflow_policy(mut self, value: OverflowPolicy) -> Self {
        self.config.overflow_policy = value;
        self
    }

    /// Registers an [`EventListener`] receiving every event of the [`Pool`]
    /// from its very first connection on.
    pub fn listener(mut self, value: Arc<dyn EventListener>) -> Self {
        self.listeners.push(value);
        self
    }
}
