//! Process-wide bridge runtime
//!
//! Holds what must be resolved once per process before the host starts
//! calling in: the host runtime's capabilities, the active configuration and
//! the handle of the default memory pool. `init` sets them up, `shutdown`
//! tears them down again and invalidates the default pool handle.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use once_cell::sync::Lazy;

use crate::config::BridgeConfig;
use crate::error::{DatasetError, Result};
use crate::handle::{registry, NativeHandle};
use crate::host::HostRuntime;
use crate::memory::{default_memory_pool, MemoryPool};

/// Default pool id while the runtime is not initialized
pub const INVALID_POOL_ID: NativeHandle = -1;

/// Memory pool as stored in the handle registry
pub struct NativeMemoryPool {
    pool: Arc<dyn MemoryPool>,
}

impl NativeMemoryPool {
    pub fn new(pool: Arc<dyn MemoryPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<dyn MemoryPool> {
        &self.pool
    }
}

struct State {
    host: Option<Arc<dyn HostRuntime>>,
    config: BridgeConfig,
    default_pool_id: NativeHandle,
}

impl Default for State {
    fn default() -> Self {
        Self {
            host: None,
            config: BridgeConfig::default(),
            default_pool_id: INVALID_POOL_ID,
        }
    }
}

pub struct BridgeRuntime {
    state: RwLock<State>,
}

impl Default for BridgeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeRuntime {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install the host runtime and register the default pool
    pub fn init(&self, host: Arc<dyn HostRuntime>, config: BridgeConfig) -> Result<()> {
        let mut state = self.write();
        if state.default_pool_id != INVALID_POOL_ID {
            return Err(DatasetError::InvalidArgument(
                "bridge runtime is already initialized".to_string(),
            ));
        }
        state.default_pool_id =
            registry().create(Arc::new(NativeMemoryPool::new(default_memory_pool())));
        state.host = Some(host);
        state.config = config;
        log::info!(
            "bridge runtime initialized, default memory pool {}",
            state.default_pool_id
        );
        Ok(())
    }

    /// Drop the host runtime and invalidate the default pool id
    ///
    /// Calling this on a runtime that is not initialized does nothing.
    pub fn shutdown(&self) {
        let mut state = self.write();
        if state.default_pool_id == INVALID_POOL_ID {
            return;
        }
        if let Err(err) = registry().release(state.default_pool_id) {
            log::warn!("default memory pool was already released: {}", err);
        }
        let host = state.host.take();
        *state = State::default();
        drop(state);
        drop(host);
        log::info!("bridge runtime shut down");
    }

    pub fn is_initialized(&self) -> bool {
        self.read().default_pool_id != INVALID_POOL_ID
    }

    pub fn host(&self) -> Result<Arc<dyn HostRuntime>> {
        self.read().host.clone().ok_or_else(|| {
            DatasetError::RuntimeDetachment("host runtime is not initialized".to_string())
        })
    }

    pub fn config(&self) -> BridgeConfig {
        self.read().config.clone()
    }

    /// Handle of the default pool, or [`INVALID_POOL_ID`]
    pub fn default_memory_pool_id(&self) -> NativeHandle {
        self.read().default_pool_id
    }
}

static RUNTIME: Lazy<BridgeRuntime> = Lazy::new(BridgeRuntime::new);

/// The process-wide runtime backing the bridge API
pub fn global() -> &'static BridgeRuntime {
    &RUNTIME
}

pub fn init(host: Arc<dyn HostRuntime>, config: BridgeConfig) -> Result<()> {
    global().init(host, config)
}

pub fn shutdown() {
    global().shutdown()
}

pub fn host() -> Result<Arc<dyn HostRuntime>> {
    global().host()
}

pub fn config() -> BridgeConfig {
    global().config()
}

pub fn default_memory_pool_id() -> NativeHandle {
    global().default_memory_pool_id()
}
