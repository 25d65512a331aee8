//! Process-scoped registries.
//!
//! Two registries are shared across every store handle in the process: the
//! driver registry (name -> backend driver) and the connection registry
//! (database name -> connection context). Both are explicit objects with
//! register/unregister rather than ad-hoc module globals; the `Lazy`
//! singletons only provide the process scope.

use crate::backend::memory::MemoryDriver;
use crate::backend::BackendDriver;
use crate::connection::ConnectionContext;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub struct DriverRegistry {
    drivers: Mutex<HashMap<String, Arc<dyn BackendDriver>>>,
}

impl DriverRegistry {
    fn new() -> Self {
        let registry = Self {
            drivers: Mutex::new(HashMap::new()),
        };
        registry.register(Arc::new(MemoryDriver::new()));
        registry
    }

    /// Registers (or replaces) a driver under its own name.
    pub fn register(&self, driver: Arc<dyn BackendDriver>) {
        self.drivers
            .lock()
            .insert(driver.name().to_owned(), driver);
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn BackendDriver>> {
        self.drivers.lock().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BackendDriver>> {
        self.drivers.lock().get(name).cloned()
    }
}

pub struct ConnectionRegistry {
    contexts: Mutex<HashMap<ContextKey, Arc<ConnectionContext>>>,
}

/// Contexts are shared per (driver, database name): every handle pointing at
/// the same physical database goes through one context regardless of its
/// store name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ContextKey {
    driver: String,
    name: String,
}

impl ConnectionRegistry {
    fn new() -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the existing context for this database identity or creates
    /// one. Never fails.
    pub fn acquire(
        &self,
        driver: Arc<dyn BackendDriver>,
        name: &str,
    ) -> Arc<ConnectionContext> {
        let key = ContextKey {
            driver: driver.name().to_owned(),
            name: name.to_owned(),
        };
        let mut contexts = self.contexts.lock();
        Arc::clone(
            contexts
                .entry(key)
                .or_insert_with(|| Arc::new(ConnectionContext::new(driver, name.to_owned()))),
        )
    }

    /// Drops the context for a fully removed database; the next `acquire`
    /// starts fresh.
    pub fn remove(&self, driver_name: &str, name: &str) {
        self.contexts.lock().remove(&ContextKey {
            driver: driver_name.to_owned(),
            name: name.to_owned(),
        });
    }
}

static DRIVERS: Lazy<DriverRegistry> = Lazy::new(DriverRegistry::new);
static CONNECTIONS: Lazy<ConnectionRegistry> = Lazy::new(ConnectionRegistry::new);

pub fn drivers() -> &'static DriverRegistry {
    &DRIVERS
}

pub fn connections() -> &'static ConnectionRegistry {
    &CONNECTIONS
}

/// Registers a driver in the process registry.
pub fn register_driver(driver: Arc<dyn BackendDriver>) {
    DRIVERS.register(driver);
}

/// Removes a driver from the process registry. Contexts already bound to it
/// keep their reference.
pub fn unregister_driver(name: &str) -> Option<Arc<dyn BackendDriver>> {
    DRIVERS.unregister(name)
}
