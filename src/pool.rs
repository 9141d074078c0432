//! Driver Object Pool (C6): a fixed-capacity arena of [`CardHandle`] slots
//! with a free list threaded through an intrusive next-pointer, presenting a
//! stable opaque handle per device unit.
//!
//! A stable numeric handle resolved through a fixed array eliminates any
//! back-pointer and lets [`HandleId`] carry a generation counter rather than
//! a raw index: a freed-and-reused slot can never be mistaken for the handle
//! that used to own it.
//!
//! Two lock scopes: `state` is the process-wide lock guarding pool/free-list
//! mutation; each `handles[i]` is the per-unit bus lock, acquired by the
//! Facade (C7) and held across an entire request.

use spin::{Mutex, MutexGuard};

use crate::card::CardHandle;
use crate::constants::{MAX_UNIT_NUMBER, POOL_CAPACITY};
use crate::error::{PoolError, PoolStatus};

/// Opaque, stable handle to an in-service pool slot. Never dereferenced
/// directly; every access goes through [`DriverPool::with_handle`], which
/// checks the slot's generation still matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleId {
    index: usize,
    generation: u32,
}

struct PoolState {
    free_head: Option<usize>,
    next_free: [Option<usize>; POOL_CAPACITY],
    unit_of_slot: [Option<u8>; POOL_CAPACITY],
}

impl PoolState {
    fn new() -> Self {
        let mut next_free = [None; POOL_CAPACITY];
        for i in 0..POOL_CAPACITY {
            next_free[i] = if i + 1 < POOL_CAPACITY { Some(i + 1) } else { None };
        }
        Self {
            free_head: if POOL_CAPACITY > 0 { Some(0) } else { None },
            next_free,
            unit_of_slot: [None; POOL_CAPACITY],
        }
    }
}

/// Fixed-capacity arena of [`CardHandle`]s.
pub struct DriverPool {
    handles: [Mutex<CardHandle>; POOL_CAPACITY],
    state: Mutex<PoolState>,
}

impl DriverPool {
    pub fn new() -> Self {
        Self {
            handles: core::array::from_fn(|_| Mutex::new(CardHandle::default())),
            state: Mutex::new(PoolState::new()),
        }
    }

    /// Allocate a handle for `unit` from the free list. Fails `AlreadyOpen`
    /// if `unit` already has a live handle, `Exhausted` if the arena is
    /// full, `InvalidUnit` outside the path grammar's `0..=24` range.
    pub fn open(&self, unit: u8) -> PoolStatus<HandleId> {
        if unit > MAX_UNIT_NUMBER {
            return Err(PoolError::InvalidUnit);
        }
        let mut state = self.state.lock();
        if state.unit_of_slot.iter().any(|u| *u == Some(unit)) {
            return Err(PoolError::AlreadyOpen);
        }
        let index = state.free_head.ok_or(PoolError::Exhausted)?;
        state.free_head = state.next_free[index];
        state.unit_of_slot[index] = Some(unit);
        drop(state);

        let generation = {
            let mut handle = self.handles[index].lock();
            handle.reset(unit);
            handle.generation
        };
        Ok(HandleId { index, generation })
    }

    /// Zero the handle and return it to the free list. The `HandleId` is
    /// invalidated immediately — any later [`with_handle`] call with it
    /// fails `InvalidHandle`.
    ///
    /// [`with_handle`]: DriverPool::with_handle
    pub fn close(&self, id: HandleId) -> PoolStatus<()> {
        {
            let mut handle = self.handles[id.index].lock();
            if handle.generation != id.generation {
                return Err(PoolError::InvalidHandle);
            }
            handle.reset(0);
            handle.initialized = false;
        }
        let mut state = self.state.lock();
        state.unit_of_slot[id.index] = None;
        state.next_free[id.index] = state.free_head;
        state.free_head = Some(id.index);
        Ok(())
    }

    /// Acquire the per-unit lock and run `f` against the live handle.
    /// `InvalidHandle` if `id` no longer refers to an in-service slot —
    /// handles are never dereferenced after being returned to the free
    /// list.
    pub fn with_handle<R>(
        &self,
        id: HandleId,
        f: impl FnOnce(&mut CardHandle) -> R,
    ) -> PoolStatus<R> {
        let mut handle = self.handles[id.index].lock();
        if handle.generation != id.generation {
            return Err(PoolError::InvalidHandle);
        }
        Ok(f(&mut handle))
    }

    /// Lock the handle for the duration of a whole request: must be held
    /// across an entire read/write request, partial requests may not
    /// interleave. Callers drop the guard to release.
    pub fn lock_handle(&self, id: HandleId) -> PoolStatus<MutexGuard<'_, CardHandle>> {
        let guard = self.handles[id.index].lock();
        if guard.generation != id.generation {
            return Err(PoolError::InvalidHandle);
        }
        Ok(guard)
    }
}

impl Default for DriverPool {
    fn default() -> Self {
        Self::new()
    }
}
