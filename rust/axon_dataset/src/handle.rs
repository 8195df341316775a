//! Handle registry
//!
//! Native objects are never handed to the host by address. Instead they are
//! parked in a slab and the host receives an opaque positive `i64`. The low
//! 32 bits carry `slot + 1`, the high bits carry the slot's generation, which
//! is bumped on every release so a stale handle can never resolve to the
//! slot's next occupant.

use std::any::{type_name, Any};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{DatasetError, Result};

/// Opaque identifier of a native object, as seen by the host
pub type NativeHandle = i64;

type Entry = Arc<dyn Any + Send + Sync>;

const INDEX_MASK: i64 = 0xFFFF_FFFF;
const MAX_GENERATION: u32 = 0x7FFF_FFFF;

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Slab {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

fn encode(index: u32, generation: u32) -> NativeHandle {
    ((generation as i64) << 32) | (index as i64 + 1)
}

fn decode(handle: NativeHandle) -> Option<(usize, u32)> {
    if handle <= 0 {
        return None;
    }
    let low = handle & INDEX_MASK;
    if low == 0 {
        return None;
    }
    Some(((low - 1) as usize, (handle >> 32) as u32))
}

fn not_found(handle: NativeHandle) -> DatasetError {
    DatasetError::NotFound(format!(
        "handle {} does not exist or has been released",
        handle
    ))
}

/// Thread-safe table of shared native objects keyed by [`NativeHandle`]
///
/// The registry shares ownership with every other holder of the object: a
/// retrieved `Arc` stays valid even if the handle is released meanwhile.
/// Only slab bookkeeping happens under the lock; objects are dropped after
/// the lock is released.
pub struct HandleRegistry {
    inner: Mutex<Slab>,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Slab::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slab> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `object` and return a fresh handle for it
    pub fn create<T: Any + Send + Sync>(&self, object: Arc<T>) -> NativeHandle {
        let entry: Entry = object;
        let mut slab = self.lock();
        slab.live += 1;
        let handle = match slab.free.pop() {
            Some(index) => {
                let slot = &mut slab.slots[index as usize];
                slot.entry = Some(entry);
                encode(index, slot.generation)
            }
            None => {
                let index = slab.slots.len() as u32;
                slab.slots.push(Slot {
                    generation: 1,
                    entry: Some(entry),
                });
                encode(index, 1)
            }
        };
        log::debug!("registered {} as handle {}", type_name::<T>(), handle);
        handle
    }

    fn lookup(&self, handle: NativeHandle) -> Result<Entry> {
        let (index, generation) = decode(handle).ok_or_else(|| not_found(handle))?;
        let slab = self.lock();
        match slab.slots.get(index) {
            Some(Slot {
                generation: live,
                entry: Some(entry),
            }) if *live == generation => Ok(Arc::clone(entry)),
            _ => Err(not_found(handle)),
        }
    }

    /// Look up the object behind `handle`
    ///
    /// Fails with `NotFound` when the handle is not live or refers to an
    /// object of a different type.
    pub fn retrieve<T: Any + Send + Sync>(&self, handle: NativeHandle) -> Result<Arc<T>> {
        self.lookup(handle)?.downcast::<T>().map_err(|_| {
            DatasetError::NotFound(format!(
                "handle {} does not refer to a {}",
                handle,
                type_name::<T>()
            ))
        })
    }

    /// Drop the registry's share of the object behind `handle`
    ///
    /// Releasing twice yields `NotFound` the second time.
    pub fn release(&self, handle: NativeHandle) -> Result<()> {
        let entry = self.take(handle, |_| true)?;
        drop(entry);
        Ok(())
    }

    /// Like [`release`](Self::release) but only if the handle refers to a `T`
    pub fn release_as<T: Any + Send + Sync>(&self, handle: NativeHandle) -> Result<()> {
        let entry = self.take(handle, |entry| entry.is::<T>())?;
        drop(entry);
        Ok(())
    }

    fn take(&self, handle: NativeHandle, accept: impl Fn(&(dyn Any + Send + Sync)) -> bool) -> Result<Entry> {
        let (index, generation) = decode(handle).ok_or_else(|| not_found(handle))?;
        let mut slab = self.lock();
        let slot = match slab.slots.get_mut(index) {
            Some(slot) if slot.generation == generation => slot,
            _ => return Err(not_found(handle)),
        };
        match slot.entry.as_deref() {
            Some(object) if accept(object) => {}
            Some(_) => {
                return Err(DatasetError::NotFound(format!(
                    "handle {} refers to an object of another type",
                    handle
                )))
            }
            None => return Err(not_found(handle)),
        }
        let entry = slot.entry.take().ok_or_else(|| not_found(handle))?;
        slot.generation = if slot.generation >= MAX_GENERATION {
            1
        } else {
            slot.generation + 1
        };
        slab.free.push(index as u32);
        slab.live -= 1;
        log::debug!("released handle {}", handle);
        Ok(entry)
    }

    /// Check if a handle is live
    pub fn contains(&self, handle: NativeHandle) -> bool {
        self.lookup(handle).is_ok()
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

lazy_static::lazy_static! {
    /// Global handle registry backing the bridge API
    static ref REGISTRY: HandleRegistry = HandleRegistry::new();
}

/// The process-wide registry
pub fn registry() -> &'static HandleRegistry {
    &REGISTRY
}
