#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! A reader/writer lock for the second readers-writers problem: many readers
//! may share the lock, a writer holds it exclusively, and a waiting writer
//! takes priority over newly arriving readers so it is never starved.
//!
//! The implementation uses two "light switch" counters guarding a
//! `no_readers` and a `no_writers` semaphore: the first reader to arrive
//! claims `no_writers` and the last reader out releases it, symmetrically
//! for writers and `no_readers`. An additional serialization semaphore in
//! front of the reader path makes a waiting writer observable to readers
//! that arrive after it (Courtois/Heymans/Parnas, via Downey's "The little
//! book of semaphores", sections 4.2.2 and 4.2.6-4.2.7).
//!
//! Acquisition is scoped: [`RwLock::read`] and [`RwLock::write`] return RAII
//! guards that release on every exit path. The lock carries no data; callers
//! pair it with the state it protects.
//!
//! Re-entrant acquisition is not supported. A thread that re-acquires the
//! lock it already holds deadlocks; that is a caller bug.

use std::sync::{Condvar, Mutex};

/// A binary semaphore that, unlike [`std::sync::Mutex`], may be released by
/// a different thread than the one that acquired it. The light-switch
/// algorithm needs this: the last reader out releases the `no_writers` hold
/// that the first reader in claimed.
#[derive(Debug, Default)]
struct Semaphore {
    held: Mutex<bool>,
    released: Condvar,
}

impl Semaphore {
    fn acquire(&self) {
        let mut held = self.held.lock().expect("rwlock semaphore poisoned");
        while *held {
            held = self
                .released
                .wait(held)
                .expect("rwlock semaphore poisoned");
        }
        *held = true;
    }

    /// Non-blocking probe used by the `blocked_for_*` accessors: acquire and
    /// immediately release if the semaphore was free.
    fn is_held(&self) -> bool {
        *self.held.lock().expect("rwlock semaphore poisoned")
    }

    fn release(&self) {
        let mut held = self.held.lock().expect("rwlock semaphore poisoned");
        *held = false;
        self.released.notify_one();
    }
}

/// The first one in switches the light on (acquires the given semaphore),
/// the last one out switches it off again.
#[derive(Debug, Default)]
struct LightSwitch {
    counter: Mutex<usize>,
}

impl LightSwitch {
    fn acquire(&self, semaphore: &Semaphore) {
        let mut counter = self.counter.lock().expect("rwlock counter poisoned");
        *counter += 1;
        if *counter == 1 {
            semaphore.acquire();
        }
    }

    fn release(&self, semaphore: &Semaphore) {
        let mut counter = self.counter.lock().expect("rwlock counter poisoned");
        *counter -= 1;
        if *counter == 0 {
            semaphore.release();
        }
    }

    fn counter(&self) -> usize {
        *self.counter.lock().expect("rwlock counter poisoned")
    }
}

/// A writer-preferring reader/writer lock.
///
/// Multiple readers hold the lock concurrently; a writer holds it
/// exclusively. When a writer is waiting, readers arriving after it queue
/// behind it instead of overtaking.
///
/// # Examples
///
/// ```
/// use rwlock::RwLock;
///
/// let lock = RwLock::new();
/// {
///     let _read = lock.read();
///     assert_eq!(lock.readers(), 1);
///     assert!(lock.blocked_for_writers());
/// }
/// assert_eq!(lock.readers(), 0);
/// assert!(!lock.blocked_for_writers());
/// ```
#[derive(Debug, Default)]
pub struct RwLock {
    read_switch: LightSwitch,
    write_switch: LightSwitch,
    no_readers: Semaphore,
    no_writers: Semaphore,
    /// Serializes arriving readers so that a writer waiting on `no_readers`
    /// blocks the *next* reader here instead of racing it.
    readers_queue: Semaphore,
}

impl RwLock {
    /// Creates a new, unheld lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of readers currently holding the lock.
    #[must_use]
    pub fn readers(&self) -> usize {
        self.read_switch.counter()
    }

    /// The number of writers holding or queueing for the lock. May be more
    /// than one when writers are waiting on each other.
    #[must_use]
    pub fn writers(&self) -> usize {
        self.write_switch.counter()
    }

    /// Whether a reader would block when trying to acquire the lock right
    /// now. Non-destructive: the lock state is not modified.
    #[must_use]
    pub fn blocked_for_readers(&self) -> bool {
        self.no_readers.is_held()
    }

    /// Whether a writer would block when trying to acquire the lock right
    /// now. Non-destructive: the lock state is not modified.
    #[must_use]
    pub fn blocked_for_writers(&self) -> bool {
        self.no_writers.is_held()
    }

    /// Acquires the lock for reading, blocking while a writer holds or
    /// waits for it. The lock is released when the returned guard drops.
    pub fn read(&self) -> ReadGuard<'_> {
        self.readers_queue.acquire();
        self.no_readers.acquire();
        self.read_switch.acquire(&self.no_writers);
        self.no_readers.release();
        self.readers_queue.release();

        ReadGuard { lock: self }
    }

    /// Acquires the lock for writing, blocking until all readers have left.
    /// The lock is released when the returned guard drops.
    pub fn write(&self) -> WriteGuard<'_> {
        self.write_switch.acquire(&self.no_readers);
        self.no_writers.acquire();

        WriteGuard { lock: self }
    }
}

/// RAII guard for a read acquisition; releases the lock on drop.
#[derive(Debug)]
pub struct ReadGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.read_switch.release(&self.lock.no_writers);
    }
}

/// RAII guard for a write acquisition; releases the lock on drop.
#[derive(Debug)]
pub struct WriteGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.no_writers.release();
        self.lock.write_switch.release(&self.lock.no_readers);
    }
}
