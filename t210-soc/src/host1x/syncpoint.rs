// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host1x syncpoints.
//!
//! The Tegra X1 uses syncpoints for GPU -> CPU synchronisation. Each syncpoint
//! is a monotonically increasing 32-bit counter. Command streams increment
//! syncpoints as work completes, and other components either register a
//! callback for a threshold or block until the threshold is reached.
//!
//! Waiters are kept sorted by threshold, so an increment fires them from the
//! front of the list and they always fire in non-decreasing threshold order.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use t210_common::{SyncpointId, SYNCPOINT_COUNT};

type WaiterCallback = Box<dyn FnOnce() + Send>;

struct Waiter {
    id: u64,
    threshold: u32,
    /// `None` for a thread blocked in [`Syncpoint::wait`].
    callback: Option<WaiterCallback>,
}

/// Opaque handle to a registered waiter.
///
/// A handle returned for a threshold that had already been reached refers to
/// no waiter; see [`WaiterHandle::is_pending`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[must_use]
pub struct WaiterHandle(Option<u64>);

impl WaiterHandle {
    /// Whether the waiter was queued rather than fired on registration.
    pub fn is_pending(&self) -> bool {
        self.0.is_some()
    }
}

/// A single hardware syncpoint.
pub struct Syncpoint {
    value: AtomicU32,
    /// Sorted in ascending order by threshold.
    waiters: Mutex<Vec<Waiter>>,
    /// Signalled when a blocking waiter's threshold is reached.
    increment_condition: Condvar,
    next_waiter_id: AtomicU64,
}

impl Syncpoint {
    pub fn new() -> Self {
        Self {
            value: AtomicU32::new(0),
            waiters: Mutex::new(Vec::new()),
            increment_condition: Condvar::new(),
            next_waiter_id: AtomicU64::new(1),
        }
    }

    /// Current value of the syncpoint.
    #[inline]
    pub fn load(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    /// Register `callback` to run once the syncpoint reaches `threshold`.
    ///
    /// The callback runs before this returns if the threshold has already
    /// been reached. Otherwise it runs on the thread that performs the
    /// reaching increment, while the waiter list is locked, so it must not
    /// register or deregister waiters on this same syncpoint.
    pub fn register_waiter<F>(&self, threshold: u32, callback: F) -> WaiterHandle
    where
        F: FnOnce() + Send + 'static,
    {
        if self.load() >= threshold {
            callback();
            return WaiterHandle::default();
        }

        let mut waiters = self.waiters.lock();
        // Re-check under the lock, the value may have advanced meanwhile.
        if self.load() >= threshold {
            drop(waiters);
            callback();
            return WaiterHandle::default();
        }

        let id = self.insert_waiter(&mut waiters, threshold, Some(Box::new(callback)));
        WaiterHandle(Some(id))
    }

    /// Remove a waiter. Does nothing if it already fired or was removed.
    pub fn deregister_waiter(&self, handle: WaiterHandle) {
        let Some(id) = handle.0 else {
            return;
        };
        let mut waiters = self.waiters.lock();
        if let Some(pos) = waiters.iter().position(|w| w.id == id) {
            waiters.remove(pos);
        }
    }

    /// Increment the syncpoint and fire every waiter whose threshold is met.
    /// Returns the new value.
    pub fn increment(&self) -> u32 {
        let value = self.value.fetch_add(1, Ordering::AcqRel).wrapping_add(1);

        let mut signal_condition = false;
        {
            let mut waiters = self.waiters.lock();
            let fired = waiters.partition_point(|w| w.threshold <= value);
            for waiter in waiters.drain(..fired) {
                match waiter.callback {
                    Some(callback) => callback(),
                    None => signal_condition = true,
                }
            }
        }

        if signal_condition {
            self.increment_condition.notify_all();
        }
        value
    }

    /// Block until the syncpoint reaches `threshold`.
    ///
    /// Returns `false` if `timeout` expired first. `None` waits forever and
    /// always returns `true`. A timed-out wait removes its waiter entry.
    pub fn wait(&self, threshold: u32, timeout: Option<Duration>) -> bool {
        if self.load() >= threshold {
            return true;
        }

        let mut waiters = self.waiters.lock();
        if self.load() >= threshold {
            return true;
        }
        let id = self.insert_waiter(&mut waiters, threshold, None);

        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        while self.load() < threshold {
            match deadline {
                None => self.increment_condition.wait(&mut waiters),
                Some(deadline) => {
                    let result = self.increment_condition.wait_until(&mut waiters, deadline);
                    if result.timed_out() && self.load() < threshold {
                        waiters.retain(|w| w.id != id);
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Number of waiters that have not fired yet.
    pub fn pending_waiters(&self) -> usize {
        self.waiters.lock().len()
    }

    fn insert_waiter(
        &self,
        waiters: &mut Vec<Waiter>,
        threshold: u32,
        callback: Option<WaiterCallback>,
    ) -> u64 {
        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        // After any existing waiter with the same threshold.
        let pos = waiters.partition_point(|w| w.threshold <= threshold);
        waiters.insert(
            pos,
            Waiter {
                id,
                threshold,
                callback,
            },
        );
        id
    }
}

impl Default for Syncpoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Guest and host copies of one syncpoint.
#[derive(Default)]
pub struct SyncpointPair {
    /// Incremented when the command stream requests the increment.
    pub guest: Syncpoint,
    /// Incremented once the work is complete on the host.
    pub host: Syncpoint,
}

impl SyncpointPair {
    /// Increment both halves. Work completes synchronously with decoding, so
    /// the guest and host copies always move together.
    pub fn increment(&self) {
        self.guest.increment();
        self.host.increment();
    }
}

/// The fixed array of hardware syncpoints, allocated once for the lifetime of
/// the emulated SoC.
pub struct SyncpointSet {
    syncpoints: Box<[SyncpointPair]>,
}

impl SyncpointSet {
    pub fn new() -> Self {
        Self {
            syncpoints: (0..SYNCPOINT_COUNT).map(|_| SyncpointPair::default()).collect(),
        }
    }

    pub fn get(&self, id: SyncpointId) -> Option<&SyncpointPair> {
        self.syncpoints.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.syncpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syncpoints.is_empty()
    }
}

impl Default for SyncpointSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `value` is at or past `threshold` for counters that may wrap.
///
/// Values within 2^31 behind the threshold count as not yet reached. Used for
/// syncpoints whose maximum is not tracked, where no min/max window exists.
pub fn syncpoint_reached(value: u32, threshold: u32) -> bool {
    (value.wrapping_sub(threshold) as i32) >= 0
}
