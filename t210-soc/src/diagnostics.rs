// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Fault reporting and guest teardown.
//!
//! Fatal guest-visible faults (unmapped GPU accesses, undecodable command
//! streams) terminate only the emulated guest process. Components receive a
//! [`Diagnostics`] implementation at construction instead of reaching for a
//! global logger or process handle.

use std::backtrace::Backtrace;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Sink for unrecoverable guest faults.
pub trait Diagnostics: Send + Sync {
    /// Report a fatal fault raised by `source`. Implementations are expected
    /// to tear down the guest; the host keeps running.
    fn guest_fault(&self, source: &str, error: &dyn Error);

    /// Whether the guest is still running.
    fn is_guest_alive(&self) -> bool;
}

/// Default [`Diagnostics`]: logs the fault with a host backtrace, flushes the
/// logger and marks the guest as terminated.
#[derive(Default)]
pub struct GuestProcess {
    terminated: AtomicBool,
    last_fault: Mutex<Option<String>>,
}

impl GuestProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Description of the first fault that killed the guest, if any.
    pub fn last_fault(&self) -> Option<String> {
        self.last_fault.lock().clone()
    }
}

impl Diagnostics for GuestProcess {
    fn guest_fault(&self, source: &str, error: &dyn Error) {
        let backtrace = Backtrace::capture();
        log::error!("{}: {}\nStack Trace:\n{}", source, error, backtrace);
        log::logger().flush();

        let mut last = self.last_fault.lock();
        if last.is_none() {
            *last = Some(format!("{}: {}", source, error));
        }
        if !self.terminated.swap(true, Ordering::AcqRel) {
            log::error!("Guest process terminated");
        }
    }

    fn is_guest_alive(&self) -> bool {
        !self.terminated.load(Ordering::Acquire)
    }
}
