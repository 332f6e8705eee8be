//! Shared device buffers keyed by identifier.
//!
//! Arrays that hold the same data across repeated driver calls share one
//! allocation through a pool slot. Acquiring a slot reports whether memory was
//! freshly allocated (the caller must upload) or an existing buffer was reused
//! (the data is already resident).
//!
//! A slot normally lives as long as some [`Buffer`] handle references it; the
//! last handle to drop returns the memory to the allocator. A pool built with
//! retention keeps its slots alive between handles until [`SharedPool::release`]
//! or [`SharedPool::clear`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use gpuarr_dtype::ScalarDType;

use crate::allocator::{Allocator, BufferOptions};
use crate::buffer::{Buffer, BufferData};
use crate::error::{PoolSlotMismatchSnafu, Result};

/// Identifier of a shared pool slot. Zero is reserved for uniquely owned arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey(NonZeroU64);

impl PoolKey {
    pub const fn new(id: u64) -> Option<Self> {
        match NonZeroU64::new(id) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    pub const fn get(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of acquiring a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// Memory was allocated; its contents are not meaningful yet.
    Fresh,
    /// An existing buffer was handed out; its contents are resident.
    Reused,
}

impl Acquisition {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

#[derive(Debug)]
enum Slot {
    Held(Weak<BufferData>),
    Retained(Rc<BufferData>),
}

impl Slot {
    fn upgrade(&self) -> Option<Rc<BufferData>> {
        match self {
            Slot::Held(weak) => weak.upgrade(),
            Slot::Retained(data) => Some(Rc::clone(data)),
        }
    }

    fn is_dead(&self) -> bool {
        matches!(self, Slot::Held(weak) if weak.strong_count() == 0)
    }
}

#[derive(Debug)]
struct PoolInner {
    allocator: Arc<dyn Allocator>,
    retain: bool,
    slots: RefCell<HashMap<PoolKey, Slot>>,
}

/// Pool of shared device buffers. Cloning yields another handle to the same pool.
#[derive(Debug, Clone)]
pub struct SharedPool {
    inner: Rc<PoolInner>,
}

impl SharedPool {
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        Self::with_retention(allocator, false)
    }

    pub fn with_retention(allocator: Arc<dyn Allocator>, retain: bool) -> Self {
        Self { inner: Rc::new(PoolInner { allocator, retain, slots: RefCell::new(HashMap::new()) }) }
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.inner.allocator
    }

    pub fn retains(&self) -> bool {
        self.inner.retain
    }

    /// Acquire the buffer for `key`, allocating it if no live buffer exists.
    ///
    /// Reacquiring a live slot with a different byte size fails with
    /// [`Error::PoolSlotMismatch`](crate::Error::PoolSlotMismatch).
    pub fn acquire(&self, key: PoolKey, dtype: ScalarDType, shape: Vec<usize>) -> Result<(Buffer, Acquisition)> {
        let size = dtype.bytes() * shape.iter().product::<usize>();

        if let Some(data) = self.lookup(key) {
            let expected = data.total_size();
            snafu::ensure!(expected == size, PoolSlotMismatchSnafu { key: key.get(), expected, actual: size });
            tracing::debug!(%key, size, "pool slot reused");
            return Ok((Buffer::from_shared(data, dtype, shape), Acquisition::Reused));
        }

        let buffer = Buffer::allocate(Arc::clone(&self.inner.allocator), dtype, shape, BufferOptions::default())?;
        let slot = if self.inner.retain {
            Slot::Retained(Rc::clone(buffer.shared_data()))
        } else {
            Slot::Held(buffer.downgrade())
        };
        let mut slots = self.inner.slots.borrow_mut();
        slots.retain(|_, slot| !slot.is_dead());
        slots.insert(key, slot);
        tracing::debug!(%key, size, slots = slots.len(), "pool slot acquired");
        drop(slots);

        Ok((buffer, Acquisition::Fresh))
    }

    fn lookup(&self, key: PoolKey) -> Option<Rc<BufferData>> {
        let mut slots = self.inner.slots.borrow_mut();
        let data = slots.get(&key)?.upgrade();
        if data.is_none() {
            slots.remove(&key);
        }
        data
    }

    /// Whether `key` currently names a live buffer.
    pub fn contains(&self, key: PoolKey) -> bool {
        self.inner.slots.borrow().get(&key).is_some_and(|slot| slot.upgrade().is_some())
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.inner.slots.borrow().values().filter(|slot| slot.upgrade().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries in the slot map, dead ones included.
    #[cfg(test)]
    pub(crate) fn slot_entries(&self) -> usize {
        self.inner.slots.borrow().len()
    }

    /// Forget `key`. Memory is freed once no handle references it.
    pub fn release(&self, key: PoolKey) -> bool {
        let removed = self.inner.slots.borrow_mut().remove(&key);
        removed.is_some_and(|slot| slot.upgrade().is_some())
    }

    /// Forget every slot.
    pub fn clear(&self) {
        let drained: Vec<Slot> = self.inner.slots.borrow_mut().drain().map(|(_, slot)| slot).collect();
        tracing::debug!(slots = drained.len(), "pool cleared");
        drop(drained);
    }
}
