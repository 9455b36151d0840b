// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-handle reader/writer lock with thread reentrancy and FIFO queuing.
//!
//! Any number of threads may hold the shared lock at once; the exclusive lock
//! admits a single owner. The owner of the exclusive lock may re-enter both
//! the exclusive and the shared lock. A thread that already holds a shared
//! lock ("busy") may take more shared locks without queuing, even while an
//! exclusive request waits, so nested reads never deadlock against a queued
//! writer.
//!
//! Blocked requests wait in a FIFO queue. When the last holder releases, the
//! head of the queue is granted; a shared head also pulls in every shared
//! request directly behind it, stopping at the next exclusive request. Grants
//! are applied by the releasing thread while it holds the state mutex, so a
//! woken thread never has to re-check the lock counters.

use std::collections::{HashMap, HashSet, VecDeque};
use std::marker::PhantomData;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy)]
struct Waiter {
    shared: bool,
    thread: ThreadId,
    ticket: u64,
}

#[derive(Debug, Default)]
struct LockState {
    exclusive_count: usize,
    exclusive_owner: Option<ThreadId>,
    shared_count: usize,
    /// Shared-lock depth per thread, excluding reads nested under the
    /// exclusive lock.
    busy: HashMap<ThreadId, usize>,
    waiters: VecDeque<Waiter>,
    granted: HashSet<u64>,
    next_ticket: u64,
}

impl LockState {
    fn enqueue(&mut self, shared: bool, thread: ThreadId) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.waiters.push_back(Waiter {
            shared,
            thread,
            ticket,
        });
        ticket
    }

    fn grant_shared(&mut self, waiter: Waiter) {
        self.shared_count += 1;
        *self.busy.entry(waiter.thread).or_insert(0) += 1;
        self.granted.insert(waiter.ticket);
    }

    /// Grant the head of the queue (plus trailing shared waiters).
    /// Returns `true` if anyone needs waking.
    fn grant_waiters(&mut self) -> bool {
        let Some(head) = self.waiters.pop_front() else {
            return false;
        };

        if head.shared {
            self.grant_shared(head);
            while let Some(next) = self.waiters.front().copied() {
                if !next.shared {
                    break;
                }
                self.waiters.pop_front();
                self.grant_shared(next);
            }
        } else {
            self.exclusive_count = 1;
            self.exclusive_owner = Some(head.thread);
            self.granted.insert(head.ticket);
        }
        true
    }
}

/// Reader/writer lock guarding one database handle.
///
/// Taking the exclusive lock while holding a plain shared lock on the same
/// thread deadlocks; callers upgrade by releasing first.
#[derive(Debug, Default)]
pub struct LockManager {
    state: Mutex<LockState>,
    wakeup: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive lock, blocking until it is granted.
    ///
    /// Returns `true` when the calling thread already owned the lock.
    pub fn lock_exclusive(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.exclusive_owner == Some(me) {
            state.exclusive_count += 1;
            return true;
        }

        let idle = state.exclusive_count == 0 && state.shared_count == 0;
        if idle && state.waiters.is_empty() {
            state.exclusive_count = 1;
            state.exclusive_owner = Some(me);
            return false;
        }

        let ticket = state.enqueue(false, me);
        while !state.granted.remove(&ticket) {
            self.wakeup.wait(&mut state);
        }
        false
    }

    pub fn unlock_exclusive(&self) {
        let mut state = self.state.lock();
        debug_assert!(
            state.exclusive_count > 0 && state.exclusive_owner == Some(thread::current().id()),
            "unlock_exclusive without holding the exclusive lock"
        );
        state.exclusive_count = state.exclusive_count.saturating_sub(1);
        if state.exclusive_count > 0 {
            return;
        }
        state.exclusive_owner = None;
        if state.shared_count == 0 && state.grant_waiters() {
            self.wakeup.notify_all();
        }
    }

    /// Acquire a shared lock, blocking while another thread writes or while
    /// an earlier request is queued (unless this thread is already reading).
    pub fn lock_shared(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.exclusive_owner == Some(me) {
            state.shared_count += 1;
            return;
        }

        let busy = state.busy.contains_key(&me);
        if state.exclusive_count > 0 || (!state.waiters.is_empty() && !busy) {
            let ticket = state.enqueue(true, me);
            while !state.granted.remove(&ticket) {
                self.wakeup.wait(&mut state);
            }
            return;
        }

        state.shared_count += 1;
        *state.busy.entry(me).or_insert(0) += 1;
    }

    pub fn unlock_shared(&self) {
        let me = thread::current().id();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        debug_assert!(state.shared_count > 0, "unlock_shared without a shared lock");
        state.shared_count = state.shared_count.saturating_sub(1);

        if let Some(depth) = state.busy.get_mut(&me) {
            *depth -= 1;
            if *depth == 0 {
                state.busy.remove(&me);
            }
        }

        if state.shared_count == 0 && state.exclusive_count == 0 && state.grant_waiters() {
            self.wakeup.notify_all();
        }
    }

    /// Acquire the exclusive lock for the lifetime of the returned guard.
    pub fn exclusive(&self) -> ExclusiveGuard<'_> {
        let nested = self.lock_exclusive();
        ExclusiveGuard {
            lock: self,
            nested,
            _not_send: PhantomData,
        }
    }

    /// Acquire a shared lock for the lifetime of the returned guard.
    pub fn shared(&self) -> SharedGuard<'_> {
        self.lock_shared();
        SharedGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Number of threads currently blocked.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Number of shared locks currently held, across all threads.
    pub fn shared_count(&self) -> usize {
        self.state.lock().shared_count
    }

    /// Whether the calling thread owns the exclusive lock.
    pub fn holds_exclusive(&self) -> bool {
        self.state.lock().exclusive_owner == Some(thread::current().id())
    }
}

/// Releases the exclusive lock on drop. Must stay on the acquiring thread.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ExclusiveGuard<'a> {
    lock: &'a LockManager,
    nested: bool,
    _not_send: PhantomData<*const ()>,
}

impl ExclusiveGuard<'_> {
    /// `true` if the thread already owned the lock when this guard was taken.
    pub fn is_nested(&self) -> bool {
        self.nested
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_exclusive();
    }
}

/// Releases a shared lock on drop. Must stay on the acquiring thread.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SharedGuard<'a> {
    lock: &'a LockManager,
    _not_send: PhantomData<*const ()>,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_shared();
    }
}
