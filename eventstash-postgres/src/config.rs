//! Connection pool and locking configuration.

use std::num::NonZeroU32;
use std::time::Duration;

use nutype::nutype;

use crate::PostgresRepositoryError;

/// Environment variable overriding [`PostgresConfig::max_connections`].
pub const MAX_CONNECTIONS_ENV: &str = "EVENTSTASH_MAX_CONNECTIONS";

/// Maximum number of database connections in the pool.
///
/// Zero connections cannot be expressed: the underlying type is `NonZeroU32`.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(NonZeroU32);

/// Configuration for [`PostgresRepository`](crate::PostgresRepository).
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
    /// Serialize appends so that the global order equals commit order (default: on)
    ///
    /// Without it, concurrent appends to different streams may become visible
    /// out of global order.
    pub global_order_lock: bool,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: NonZeroU32 = match NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            global_order_lock: true,
        }
    }
}

impl PostgresConfig {
    /// Defaults, with overrides read from the process environment.
    ///
    /// # Errors
    /// `InvalidConfiguration` when [`MAX_CONNECTIONS_ENV`] is set but is not a
    /// positive integer.
    pub fn from_env() -> Result<Self, PostgresRepositoryError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, PostgresRepositoryError> {
        let mut config = Self::default();
        if let Some(raw) = lookup(MAX_CONNECTIONS_ENV) {
            let value = raw.trim().parse::<NonZeroU32>().map_err(|error| {
                PostgresRepositoryError::InvalidConfiguration(format!(
                    "{MAX_CONNECTIONS_ENV}={raw}: {error}"
                ))
            })?;
            config.max_connections = MaxConnections::new(value);
        }
        Ok(config)
    }

    /// Replaces the pool size.
    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: MaxConnections) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Turns the global order lock on or off.
    #[must_use]
    pub const fn with_global_order_lock(mut self, enabled: bool) -> Self {
        self.global_order_lock = enabled;
        self
    }
}
