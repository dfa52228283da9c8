// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tegra Host Interface (THI): the register window every accelerator class
//! is reached through.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::classes::{Condition, DeviceClass, IncrementSyncpointMethod, INCREMENT_SYNCPOINT_METHOD_ID};
use super::syncpoint::SyncpointSet;
use super::{FifoError, FifoResult};

/// Syncpoint increments waiting for the device class to finish its operation.
struct PendingIncrements {
    syncpoints: Arc<SyncpointSet>,
    queue: Mutex<VecDeque<u32>>,
}

impl PendingIncrements {
    fn push(&self, id: u32) {
        self.queue.lock().push_back(id);
    }

    /// Apply every queued increment in order. Ids are validated on entry.
    fn submit(&self) {
        let mut queue = self.queue.lock();
        while let Some(id) = queue.pop_front() {
            if let Some(syncpoint) = self.syncpoints.get(id) {
                log::debug!("Increment queued syncpoint: {}", id);
                syncpoint.increment();
            }
        }
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Wraps a device class `C` behind the THI method window.
///
/// `METHOD0` latches a method ID, `METHOD1` forwards its argument to the
/// latched method on the device class. `INCR_SYNCPT` is handled here, with
/// `OpDone` increments held until the class reports completion.
pub struct TegraHostInterface<C: DeviceClass> {
    pending: Arc<PendingIncrements>,
    device_class: C,
    stored_method: u32,
}

impl<C: DeviceClass> TegraHostInterface<C> {
    pub const METHOD0_ID: u32 = 0x10;
    pub const METHOD1_ID: u32 = 0x11;

    pub fn new(syncpoints: Arc<SyncpointSet>) -> Self {
        let pending = Arc::new(PendingIncrements {
            syncpoints,
            queue: Mutex::new(VecDeque::new()),
        });
        let on_done = pending.clone();
        Self {
            device_class: C::new(Box::new(move || on_done.submit())),
            pending,
            stored_method: 0,
        }
    }

    pub fn device_class(&self) -> &C {
        &self.device_class
    }

    /// Method most recently latched by `METHOD0`.
    pub fn stored_method(&self) -> u32 {
        self.stored_method
    }

    /// Increments still waiting for an operation to complete.
    pub fn pending_increments(&self) -> usize {
        self.pending.len()
    }

    pub fn call_method(&mut self, method: u32, argument: u32) -> FifoResult<()> {
        match method {
            INCREMENT_SYNCPOINT_METHOD_ID => {
                let incr = IncrementSyncpointMethod(argument);
                let syncpoint = self
                    .pending
                    .syncpoints
                    .get(incr.index())
                    .ok_or(FifoError::InvalidSyncpoint(incr.index()))?;

                match incr.condition() {
                    Some(Condition::Immediate) => {
                        log::debug!("{}: increment syncpoint {} immediately", C::NAME, incr.index());
                        syncpoint.increment();
                    }
                    Some(Condition::OpDone) => {
                        log::debug!("{}: queue syncpoint {} for op done", C::NAME, incr.index());
                        self.pending.push(incr.index());
                        // Device classes complete synchronously, so nothing is
                        // ever in flight here.
                        self.pending.submit();
                    }
                    _ => {
                        log::warn!(
                            "{}: unimplemented syncpoint condition: {}",
                            C::NAME,
                            incr.raw_condition()
                        );
                    }
                }
            }
            Self::METHOD0_ID => self.stored_method = argument,
            Self::METHOD1_ID => self.device_class.call_method(self.stored_method, argument),
            _ => {
                log::warn!(
                    "{}: unknown THI method called: 0x{:X}, argument: 0x{:X}",
                    C::NAME,
                    method,
                    argument
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host1x::classes::{NvDecClass, OpDoneCallback, VicClass};

    /// Device class that holds its operation open until told to finish.
    struct DeferredClass {
        op_done: OpDoneCallback,
        calls: Vec<(u32, u32)>,
    }

    impl DeferredClass {
        fn finish(&self) {
            (self.op_done)();
        }
    }

    impl DeviceClass for DeferredClass {
        const NAME: &'static str = "Deferred";

        fn new(op_done: OpDoneCallback) -> Self {
            Self {
                op_done,
                calls: Vec::new(),
            }
        }

        fn call_method(&mut self, method: u32, argument: u32) {
            self.calls.push((method, argument));
        }
    }

    #[test]
    fn test_method_window() {
        let syncpoints = Arc::new(SyncpointSet::new());
        let mut thi = TegraHostInterface::<DeferredClass>::new(syncpoints);

        thi.call_method(TegraHostInterface::<DeferredClass>::METHOD0_ID, 0x200).unwrap();
        thi.call_method(TegraHostInterface::<DeferredClass>::METHOD1_ID, 0xAA).unwrap();
        thi.call_method(TegraHostInterface::<DeferredClass>::METHOD1_ID, 0xBB).unwrap();

        assert_eq!(thi.stored_method(), 0x200);
        assert_eq!(thi.device_class().calls, vec![(0x200, 0xAA), (0x200, 0xBB)]);
    }

    #[test]
    fn test_immediate_increment() {
        let syncpoints = Arc::new(SyncpointSet::new());
        let mut thi = TegraHostInterface::<NvDecClass>::new(syncpoints.clone());
        thi.call_method(INCREMENT_SYNCPOINT_METHOD_ID, 0x0036).unwrap();
        assert_eq!(syncpoints.get(0x36).unwrap().host.load(), 1);
    }

    #[test]
    fn test_op_done_increment_applies() {
        let syncpoints = Arc::new(SyncpointSet::new());
        let mut thi = TegraHostInterface::<VicClass>::new(syncpoints.clone());
        thi.call_method(INCREMENT_SYNCPOINT_METHOD_ID, 0x010C).unwrap();
        assert_eq!(syncpoints.get(0xC).unwrap().host.load(), 1);
        assert_eq!(thi.pending_increments(), 0);
    }

    #[test]
    fn test_op_done_callback_drains_in_order() {
        let syncpoints = Arc::new(SyncpointSet::new());
        let thi = TegraHostInterface::<DeferredClass>::new(syncpoints.clone());

        thi.pending.push(4);
        thi.pending.push(5);
        thi.pending.push(4);
        assert_eq!(thi.pending_increments(), 3);
        assert_eq!(syncpoints.get(4).unwrap().host.load(), 0);

        thi.device_class().finish();
        assert_eq!(thi.pending_increments(), 0);
        assert_eq!(syncpoints.get(4).unwrap().host.load(), 2);
        assert_eq!(syncpoints.get(5).unwrap().host.load(), 1);
    }

    #[test]
    fn test_unhandled_condition_is_ignored() {
        let syncpoints = Arc::new(SyncpointSet::new());
        let mut thi = TegraHostInterface::<VicClass>::new(syncpoints.clone());
        thi.call_method(INCREMENT_SYNCPOINT_METHOD_ID, 0x0302).unwrap();
        assert_eq!(syncpoints.get(2).unwrap().host.load(), 0);
    }

    #[test]
    fn test_invalid_syncpoint_is_an_error() {
        let syncpoints = Arc::new(SyncpointSet::new());
        let mut thi = TegraHostInterface::<VicClass>::new(syncpoints);
        assert!(matches!(
            thi.call_method(INCREMENT_SYNCPOINT_METHOD_ID, 0x00FF),
            Err(FifoError::InvalidSyncpoint(0xFF))
        ));
    }

    #[test]
    fn test_unknown_method_is_ignored() {
        let syncpoints = Arc::new(SyncpointSet::new());
        let mut thi = TegraHostInterface::<VicClass>::new(syncpoints);
        assert!(thi.call_method(0x40, 1).is_ok());
    }
}
