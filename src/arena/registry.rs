//! Process-wide directory of named arenas.
//!
//! Several subsystems in one process (the transport adapter, caches,
//! tests) want to share a single mapping per arena name instead of
//! mapping the same region repeatedly. The registry hands out
//! `Arc<ShmArena>` handles keyed by a caller-chosen name, creating or
//! attaching on first use.
//!
//! The mutex guards only the name → handle map; the handles themselves
//! are independently thread-safe.

use crate::arena::config::ArenaConfig;
use crate::arena::pool::ShmArena;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// Directory mapping names to shared arena handles.
///
/// Most callers want the lazily-created process-global instance from
/// [`ArenaRegistry::global`]; separate instances exist for tests and for
/// embedders that want isolated namespaces.
pub struct ArenaRegistry {
    arenas: Mutex<HashMap<String, Arc<ShmArena>>>,
}

impl ArenaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            arenas: Mutex::new(HashMap::new()),
        }
    }

    /// The process-global registry.
    pub fn global() -> &'static ArenaRegistry {
        static GLOBAL: OnceLock<ArenaRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ArenaRegistry::new)
    }

    /// Return the handle registered under `name`, creating a new owner
    /// arena from `config` if none exists.
    ///
    /// The lock is held across creation so exactly one handle per name
    /// ever exists, even under concurrent calls.
    pub fn get_or_create(&self, name: &str, config: &ArenaConfig) -> Result<Arc<ShmArena>> {
        let mut arenas = self.lock();
        if let Some(arena) = arenas.get(name) {
            return Ok(Arc::clone(arena));
        }

        let arena = Arc::new(ShmArena::new());
        arena.initialize(config)?;
        arenas.insert(name.to_string(), Arc::clone(&arena));
        Ok(arena)
    }

    /// Return the handle registered under `name`, attaching to the
    /// existing region of that name if none exists.
    ///
    /// `name` is the SHM object name the owner published.
    pub fn attach(&self, name: &str, expected_size: usize) -> Result<Arc<ShmArena>> {
        let mut arenas = self.lock();
        if let Some(arena) = arenas.get(name) {
            return Ok(Arc::clone(arena));
        }

        let arena = Arc::new(ShmArena::new());
        arena.attach(name, expected_size)?;
        arenas.insert(name.to_string(), Arc::clone(&arena));
        Ok(arena)
    }

    /// Look up a handle without creating anything.
    pub fn get(&self, name: &str) -> Option<Arc<ShmArena>> {
        self.lock().get(name).map(Arc::clone)
    }

    /// Drop the registry's reference to `name`.
    ///
    /// The arena itself survives until every outstanding handle is
    /// released.
    pub fn remove(&self, name: &str) -> Result<()> {
        match self.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(name.to_string())),
        }
    }

    /// Snapshot of the currently-registered names.
    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ShmArena>>> {
        self.arenas
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Default for ArenaRegistry {
    fn default() -> Self {
        Self::new()
    }
}
