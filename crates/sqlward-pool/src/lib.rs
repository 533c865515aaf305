//! Bounded blocking resource pool.
//!
//! A [`ResourcePool`] holds a fixed number of entries built once at
//! construction. [`ResourcePool::borrow`] blocks the calling thread until an
//! entry is free and hands back a [`Borrowed`] handle with exclusive access;
//! dropping the handle returns the entry, so release is guaranteed on every
//! exit path including unwinding. Because the handle owns the entry for the
//! duration of the borrow, releasing twice or releasing an entry into a pool
//! that never issued it cannot be expressed.
//!
//! There is no borrow timeout: a caller that never releases deadlocks the
//! pool permanently. That is caller responsibility, not a recoverable fault.

use sqlward_core::{Error, PoolError, PoolErrorKind, Result};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};

struct PoolState<T> {
    /// `Some` while the entry is free, `None` while it is borrowed.
    slots: Vec<Option<T>>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<PoolState<T>>,
    available: Condvar,
}

/// Fixed-capacity pool of reusable entries with blocking borrow.
pub struct ResourcePool<T> {
    shared: Arc<Shared<T>>,
    capacity: usize,
}

impl<T: Send> ResourcePool<T> {
    /// Build a pool of `capacity` entries, constructing each with `factory`.
    ///
    /// Entries already built are dropped if a later construction fails.
    pub fn new(capacity: usize, mut factory: impl FnMut() -> Result<T>) -> Result<Self> {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Some(factory()?));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    slots,
                    closed: false,
                }),
                available: Condvar::new(),
            }),
            capacity,
        })
    }

    /// Number of entries the pool was built with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries currently free.
    pub fn free_count(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Block until an entry is free, then borrow it exclusively.
    ///
    /// Wakeups are not strict-FIFO; contending threads race for the freed
    /// entry, which is fair enough to avoid starvation under finite hold
    /// times. Fails only if the pool is (or becomes) closed.
    pub fn borrow(&self) -> Result<Borrowed<T>> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(Error::Pool(PoolError {
                    kind: PoolErrorKind::Closed,
                    message: "pool is closed".to_string(),
                }));
            }
            if let Some(slot) = state.slots.iter().position(|s| s.is_some()) {
                let value = state.slots[slot].take();
                return Ok(Borrowed {
                    value,
                    slot,
                    shared: Arc::clone(&self.shared),
                });
            }
            state = self.shared.available.wait(state).unwrap();
        }
    }

    /// Borrow an entry, run `f` against it, release on every exit path.
    pub fn access<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let mut entry = self.borrow()?;
        f(&mut entry)
    }

    /// Close the pool: reject new borrows, wait for every outstanding entry
    /// to come back, then drop all entries.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        // Outstanding handles return their entries through Drop and notify.
        while state.slots.iter().any(|s| s.is_none()) {
            state = self.shared.available.wait(state).unwrap();
        }
        let entries: Vec<_> = state.slots.drain(..).collect();
        drop(state);
        tracing::debug!(capacity = self.capacity, "resource pool closed");
        drop(entries);
    }

    /// Has `close` completed?
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }
}

/// Exclusive handle to a pooled entry.
///
/// Dereferences to the entry; dropping it returns the entry to the pool and
/// wakes one waiting borrower.
pub struct Borrowed<T> {
    value: Option<T>,
    slot: usize,
    shared: Arc<Shared<T>>,
}

impl<T> Borrowed<T> {
    /// Return the entry to the pool explicitly. Equivalent to dropping.
    pub fn release(self) {}
}

impl<T> Deref for Borrowed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("entry present until drop")
    }
}

impl<T> DerefMut for Borrowed<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("entry present until drop")
    }
}

impl<T> Drop for Borrowed<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            let mut state = self.shared.state.lock().unwrap();
            debug_assert!(state.slots[self.slot].is_none());
            state.slots[self.slot] = Some(value);
            drop(state);
            // notify_all: close() may be waiting alongside borrowers.
            self.shared.available.notify_all();
        }
    }
}
