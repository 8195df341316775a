//! Calls from native code back into the host runtime
//!
//! The host hands native code bare object references. A reference that must
//! outlive the call it arrived on is promoted to a global one ([`HostRef`])
//! and deleted again exactly once when its owner goes away, provided the
//! owner goes away on a thread that can reach the host. Every call into
//! the host first checks that the executing thread can reach the host, since
//! allocation callbacks and batch pulls may run on any thread.

use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use crate::error::{DatasetError, Result};
use crate::foreign::ForeignIterator;
use crate::memory::ReservationListener;

/// Opaque reference to an object owned by the host runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostObject(usize);

impl HostObject {
    pub fn from_raw(ptr: *mut c_void) -> Self {
        HostObject(ptr as usize)
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// Capabilities the embedding runtime exposes to native code
///
/// Resolved once per process and installed with [`crate::runtime::init`].
pub trait HostRuntime: Send + Sync {
    /// Fails with `RuntimeDetachment` if the current thread cannot call into
    /// the host
    fn ensure_attached(&self) -> Result<()>;

    /// Promote `object` to a reference that stays valid across calls
    fn new_global_ref(&self, object: HostObject) -> Result<HostObject>;

    fn delete_global_ref(&self, object: HostObject);

    fn reserve_memory(&self, listener: HostObject, size: i64) -> Result<()>;

    fn unreserve_memory(&self, listener: HostObject, size: i64) -> Result<()>;

    fn iterator_has_next(&self, iterator: HostObject) -> Result<bool>;

    /// Returns the 8-byte address of an exported `FFI_ArrowArray`
    fn iterator_next(&self, iterator: HostObject) -> Result<Vec<u8>>;
}

/// Global host reference, deleted on drop
pub struct HostRef {
    runtime: Arc<dyn HostRuntime>,
    object: HostObject,
}

impl HostRef {
    pub fn new(runtime: Arc<dyn HostRuntime>, local: HostObject) -> Result<Self> {
        if local.is_null() {
            return Err(DatasetError::InvalidArgument(
                "host object reference is null".to_string(),
            ));
        }
        runtime.ensure_attached()?;
        let object = runtime.new_global_ref(local)?;
        Ok(Self { runtime, object })
    }

    pub fn object(&self) -> HostObject {
        self.object
    }

    pub fn runtime(&self) -> &Arc<dyn HostRuntime> {
        &self.runtime
    }
}

impl fmt::Debug for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostRef").field(&self.object).finish()
    }
}

impl Drop for HostRef {
    /// A reference dropped on a detached thread cannot be deleted from there
    /// and is leaked instead.
    fn drop(&mut self) {
        match self.runtime.ensure_attached() {
            Ok(()) => self.runtime.delete_global_ref(self.object),
            Err(err) => log::warn!(
                "leaking host reference {:?}, dropped on a detached thread: {}",
                self.object,
                err
            ),
        }
    }
}

/// Reservation listener implemented by a host object
///
/// Owned by exactly one listenable pool; the host reference is released
/// when that pool is destroyed.
#[derive(Debug)]
pub struct HostReservationListener {
    listener: HostRef,
}

impl HostReservationListener {
    pub fn new(runtime: Arc<dyn HostRuntime>, listener: HostObject) -> Result<Self> {
        Ok(Self {
            listener: HostRef::new(runtime, listener)?,
        })
    }
}

impl ReservationListener for HostReservationListener {
    fn on_reservation(&self, size: i64) -> Result<()> {
        let runtime = self.listener.runtime();
        runtime.ensure_attached()?;
        runtime.reserve_memory(self.listener.object(), size)
    }

    fn on_release(&self, size: i64) -> Result<()> {
        let runtime = self.listener.runtime();
        runtime.ensure_attached()?;
        runtime.unreserve_memory(self.listener.object(), size)
    }
}

/// Pull iterator implemented by a host object
#[derive(Debug)]
pub struct HostBatchIterator {
    iterator: HostRef,
}

impl HostBatchIterator {
    pub fn new(runtime: Arc<dyn HostRuntime>, iterator: HostObject) -> Result<Self> {
        Ok(Self {
            iterator: HostRef::new(runtime, iterator)?,
        })
    }
}

impl ForeignIterator for HostBatchIterator {
    fn has_next(&mut self) -> Result<bool> {
        let runtime = self.iterator.runtime();
        runtime.ensure_attached()?;
        runtime.iterator_has_next(self.iterator.object())
    }

    fn next(&mut self) -> Result<Vec<u8>> {
        let runtime = self.iterator.runtime();
        runtime.ensure_attached()?;
        runtime.iterator_next(self.iterator.object())
    }
}
