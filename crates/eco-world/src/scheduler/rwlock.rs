//! Writer-preferring reader-writer lock guarding the terrain arrays.
//!
//! Readers block while a writer holds the lock or is waiting for it; a writer
//! registers its request first, which stops new readers, then waits for the
//! in-flight readers to drain.

use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
    write_requests: usize,
}

pub struct TerrainLock<T> {
    state: Mutex<LockState>,
    readable: Condvar,
    writable: Condvar,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is mediated by `state`; shared references are only
// handed out while `writer` is false and the exclusive reference only while
// `readers == 0`.
unsafe impl<T: Send> Send for TerrainLock<T> {}
unsafe impl<T: Send + Sync> Sync for TerrainLock<T> {}

impl<T> TerrainLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            readable: Condvar::new(),
            writable: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn read(&self) -> TerrainReadGuard<'_, T> {
        let mut state = self.state.lock();
        while state.writer || state.write_requests > 0 {
            self.readable.wait(&mut state);
        }
        state.readers += 1;
        TerrainReadGuard { lock: self }
    }

    pub fn write(&self) -> TerrainWriteGuard<'_, T> {
        let mut state = self.state.lock();
        state.write_requests += 1;
        while state.writer || state.readers > 0 {
            self.writable.wait(&mut state);
        }
        state.write_requests -= 1;
        state.writer = true;
        TerrainWriteGuard { lock: self }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn release_read(&self) {
        let mut state = self.state.lock();
        state.readers -= 1;
        if state.readers == 0 && state.write_requests > 0 {
            self.writable.notify_one();
        }
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        state.writer = false;
        if state.write_requests > 0 {
            self.writable.notify_one();
        } else {
            self.readable.notify_all();
        }
    }
}

pub struct TerrainReadGuard<'a, T> {
    lock: &'a TerrainLock<T>,
}

impl<T> Deref for TerrainReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a live read guard implies no writer.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for TerrainReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

pub struct TerrainWriteGuard<'a, T> {
    lock: &'a TerrainLock<T>,
}

impl<T> Deref for TerrainWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a live write guard implies exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for TerrainWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: a live write guard implies exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for TerrainWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}
