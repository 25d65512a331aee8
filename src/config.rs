use crate::error::AkvError;

/// How reads interact with pending coalesced writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Consistency {
    /// Every read first drains pending coalesced writes for the context, so
    /// readers observe all writes submitted before the call.
    #[default]
    Strong,
    /// Reads may observe a state older than recently submitted writes.
    Eventual,
}

/// What happens when a plugin hook fails with a generic (non-domain) error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum HookErrorPolicy {
    /// Re-throw any hook error.
    #[default]
    Strict,
    /// Report via the plugin's `on_error` (or a warning log) and continue
    /// with the pre-hook value. Domain errors and abort signals still
    /// propagate.
    Lenient,
}

/// What happens when a plugin's `on_init` fails during pipeline startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum InitFailurePolicy {
    /// Propagate the init error and abort startup.
    #[default]
    Fail,
    /// Mark the plugin permanently disabled and proceed.
    DisableAndContinue,
}

/// Runtime configuration for a store handle.
#[derive(Debug, Clone)]
pub struct AkvConfig {
    /// Database identity. Handles with the same name share one physical
    /// connection.
    pub name: String,
    /// Sub-bucket inside the database.
    pub store_name: String,
    /// Requested schema version. A request lower than the on-disk version is
    /// pinned to the on-disk value with a warning.
    pub version: u64,
    /// Driver preference order; the first registered driver providing the
    /// core capability wins at `ready()`.
    pub driver_order: Vec<String>,
    /// Bound on concurrently open transactions per connection. `None` means
    /// unbounded.
    pub max_concurrent_transactions: Option<usize>,
    /// Idle interval after which a connection with no active or pending
    /// transactions is closed.
    pub idle_close_ms: u64,
    /// Coalescing flush window.
    pub coalesce_window_ms: u64,
    /// Maximum ops per underlying transaction; reaching it flushes
    /// immediately instead of waiting for the window.
    pub coalesce_max_batch: usize,
    pub consistency: Consistency,
    /// Under `Eventual`, writes resolve before the underlying commit
    /// completes; commit errors go to the warning side channel.
    pub fire_and_forget: bool,
    pub hook_error_policy: HookErrorPolicy,
    pub init_failure_policy: InitFailurePolicy,
}

impl Default for AkvConfig {
    fn default() -> Self {
        Self {
            name: "akv".into(),
            store_name: "keyvaluepairs".into(),
            version: 1,
            driver_order: vec!["memory".into()],
            max_concurrent_transactions: None,
            idle_close_ms: 1_000,
            coalesce_window_ms: 4,
            coalesce_max_batch: 128,
            consistency: Consistency::Strong,
            fire_and_forget: false,
            hook_error_policy: HookErrorPolicy::Strict,
            init_failure_policy: InitFailurePolicy::Fail,
        }
    }
}

impl AkvConfig {
    /// Default profile: strong consistency, writes acknowledged at commit.
    pub fn strong() -> Self {
        Self::default()
    }

    /// Throughput profile: reads may lag writes, writes return at enqueue,
    /// and bursts coalesce over a wider window.
    pub fn eventual() -> Self {
        Self {
            consistency: Consistency::Eventual,
            fire_and_forget: true,
            coalesce_window_ms: 10,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_store_name(mut self, store_name: impl Into<String>) -> Self {
        self.store_name = store_name.into();
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_driver_order(mut self, drivers: Vec<String>) -> Self {
        self.driver_order = drivers;
        self
    }

    pub fn with_max_concurrent_transactions(mut self, max: usize) -> Self {
        self.max_concurrent_transactions = Some(max);
        self
    }

    pub fn with_coalesce_window_ms(mut self, ms: u64) -> Self {
        self.coalesce_window_ms = ms;
        self
    }

    pub fn with_coalesce_max_batch(mut self, max: usize) -> Self {
        self.coalesce_max_batch = max;
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_hook_error_policy(mut self, policy: HookErrorPolicy) -> Self {
        self.hook_error_policy = policy;
        self
    }

    pub fn with_init_failure_policy(mut self, policy: InitFailurePolicy) -> Self {
        self.init_failure_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<(), AkvError> {
        if self.name.is_empty() {
            return Err(AkvError::InvalidConfig {
                message: "database name must not be empty".into(),
            });
        }
        if self.store_name.is_empty() {
            return Err(AkvError::InvalidConfig {
                message: "store name must not be empty".into(),
            });
        }
        if self.version == 0 {
            return Err(AkvError::InvalidConfig {
                message: "version must be at least 1".into(),
            });
        }
        if self.coalesce_max_batch == 0 {
            return Err(AkvError::InvalidConfig {
                message: "coalesce_max_batch must be at least 1".into(),
            });
        }
        if self.max_concurrent_transactions == Some(0) {
            return Err(AkvError::InvalidConfig {
                message: "max_concurrent_transactions must be at least 1 when set".into(),
            });
        }
        if self.driver_order.is_empty() {
            return Err(AkvError::InvalidConfig {
                message: "driver_order must name at least one driver".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AkvErrorCode;

    #[test]
    fn default_config_is_valid() {
        assert!(AkvConfig::default().validate().is_ok());
        assert!(AkvConfig::eventual().validate().is_ok());
    }

    #[test]
    fn zero_batch_rejected() {
        let err = AkvConfig::default()
            .with_coalesce_max_batch(0)
            .validate()
            .unwrap_err();
        assert_eq!(err.code(), AkvErrorCode::InvalidConfig);
    }

    #[test]
    fn eventual_profile_enables_fire_and_forget() {
        let config = AkvConfig::eventual();
        assert_eq!(config.consistency, Consistency::Eventual);
        assert!(config.fire_and_forget);
    }
}
