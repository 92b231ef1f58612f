use std::time::Duration;

use crate::BuildError;

/// [`Pool`] configuration.
///
/// [`Pool`]: super::Pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Number of connections the [`Pool`] may keep alive without being over
    /// capacity.
    ///
    /// [`Pool`]: super::Pool
    pub base_size: usize,

    /// Additional connections allowed beyond [`PoolConfig::base_size`].
    pub max_overflow: usize,

    /// Default acquisition timeout. [`None`] waits forever and a zero
    /// duration never waits at all.
    pub timeout: Option<Duration>,

    /// What happens to overflow connections once they are released.
    pub overflow_policy: OverflowPolicy,
}

impl PoolConfig {
    /// Creates a new [`PoolConfig`] without any overflow and timeout and with
    /// the provided `base_size`.
    #[must_use]
    pub fn new(base_size: usize) -> Self {
        Self {
            base_size,
            max_overflow: 0,
            timeout: None,
            overflow_policy: OverflowPolicy::default(),
        }
    }

    /// Total number of connections a [`Pool`] with this configuration may
    /// keep alive at once.
    ///
    /// [`Pool`]: super::Pool
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.base_size.saturating_add(self.max_overflow)
    }

    pub(crate) fn validate(&self) -> Result<(), BuildError> {
        if self.base_size == 0 {
            return Err(BuildError::ZeroBaseSize);
        }
        if self.base_size.checked_add(self.max_overflow).is_none() {
            return Err(BuildError::CapacityOverflow {
                base_size: self.base_size,
                max_overflow: self.max_overflow,
            });
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    /// Creates a new [`PoolConfig`] with the `base_size` being set to
    /// `cpu_count * 4` ignoring any logical CPUs (Hyper-Threading).
    fn default() -> Self {
        Self::new(num_cpus::get_physical() * 4)
    }
}

/// Policy applied to an overflow connection when it is released and no
/// caller is waiting for it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum OverflowPolicy {
    /// Keep the connection idle until the pool is disposed.
    #[default]
    Retain,

    /// Destroy the connection so the pool shrinks back towards
    /// [`PoolConfig::base_size`].
    Close,
}
