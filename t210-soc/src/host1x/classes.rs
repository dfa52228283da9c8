// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host1x device classes.
//!
//! A command stream addresses hardware blocks by class ID. The Host1x class
//! itself is always present and handles syncpoint increments and waits; the
//! accelerator classes sit behind a [`TegraHostInterface`] and are stubs that
//! complete every operation immediately.
//!
//! [`TegraHostInterface`]: super::tegra_host_interface::TegraHostInterface

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::syncpoint::SyncpointSet;
use super::{FifoError, FifoResult};

/// Host1x class IDs, as encoded in `SetClass` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ClassId {
    Host1x = 0x1,
    Vic = 0x5D,
    NvJpg = 0xC0,
    NvDec = 0xF0,
}

impl ClassId {
    pub fn from_raw(v: u16) -> Option<Self> {
        match v {
            0x1 => Some(Self::Host1x),
            0x5D => Some(Self::Vic),
            0xC0 => Some(Self::NvJpg),
            0xF0 => Some(Self::NvDec),
            _ => None,
        }
    }
}

/// Method ID of `INCR_SYNCPT`, shared by Host1x and every THI.
pub const INCREMENT_SYNCPOINT_METHOD_ID: u32 = 0x0;

/// When a syncpoint increment requested through `INCR_SYNCPT` takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Condition {
    Immediate = 0,
    OpDone = 1,
    RdDone = 2,
    RegWrSafe = 3,
}

impl Condition {
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Immediate),
            1 => Some(Self::OpDone),
            2 => Some(Self::RdDone),
            3 => Some(Self::RegWrSafe),
            _ => None,
        }
    }
}

/// Argument of `INCR_SYNCPT`.
///
/// | Bits  | Field           |
/// |-------|-----------------|
/// | 7:0   | Syncpoint index |
/// | 15:8  | Condition       |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementSyncpointMethod(pub u32);

impl IncrementSyncpointMethod {
    pub fn index(&self) -> u32 {
        self.0 & 0xFF
    }

    pub fn raw_condition(&self) -> u8 {
        ((self.0 >> 8) & 0xFF) as u8
    }

    pub fn condition(&self) -> Option<Condition> {
        Condition::from_raw(self.raw_condition())
    }
}

/// How often a blocked `WAIT_SYNCPT_32` checks for channel shutdown.
const WAIT_CANCEL_POLL: Duration = Duration::from_millis(50);

/// The Host1x control class.
pub struct Host1xClass {
    syncpoints: Arc<SyncpointSet>,
    /// Value compared against by `WAIT_SYNCPT_32`, set by `LOAD_SYNCPT_PAYLOAD_32`.
    syncpoint_payload: u32,
    cancelled: Arc<AtomicBool>,
}

impl Host1xClass {
    pub const LOAD_SYNCPOINT_PAYLOAD32_METHOD_ID: u32 = 0x4E;
    pub const WAIT_SYNCPOINT32_METHOD_ID: u32 = 0x50;

    /// `cancelled` is raised when the owning channel shuts down and releases
    /// a blocked `WAIT_SYNCPT_32`.
    pub fn new(syncpoints: Arc<SyncpointSet>, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            syncpoints,
            syncpoint_payload: 0,
            cancelled,
        }
    }

    pub fn call_method(&mut self, method: u32, argument: u32) -> FifoResult<()> {
        match method {
            INCREMENT_SYNCPOINT_METHOD_ID => {
                // The condition doesn't matter for Host1x class increments.
                let incr = IncrementSyncpointMethod(argument);
                let syncpoint = self
                    .syncpoints
                    .get(incr.index())
                    .ok_or(FifoError::InvalidSyncpoint(incr.index()))?;
                log::debug!("Host1x: increment syncpoint {}", incr.index());
                syncpoint.increment();
            }
            Self::LOAD_SYNCPOINT_PAYLOAD32_METHOD_ID => {
                self.syncpoint_payload = argument;
                log::trace!("Host1x: syncpoint payload = 0x{:X}", argument);
            }
            Self::WAIT_SYNCPOINT32_METHOD_ID => {
                let id = argument & 0xFF;
                let syncpoint = self
                    .syncpoints
                    .get(id)
                    .ok_or(FifoError::InvalidSyncpoint(id))?;
                log::debug!(
                    "Host1x: wait for syncpoint {} to reach {}",
                    id,
                    self.syncpoint_payload
                );
                // Unbounded, but wakes periodically so a channel shutdown can
                // interrupt it.
                while !syncpoint
                    .host
                    .wait(self.syncpoint_payload, Some(WAIT_CANCEL_POLL))
                {
                    if self.cancelled.load(Ordering::Acquire) {
                        return Err(FifoError::Cancelled);
                    }
                }
            }
            _ => {
                log::warn!(
                    "Unknown Host1x class method called: 0x{:X}, argument: 0x{:X}",
                    method,
                    argument
                );
            }
        }
        Ok(())
    }
}

/// Called by a device class when an operation finishes.
pub type OpDoneCallback = Box<dyn Fn() + Send>;

/// A hardware block behind a Tegra Host Interface.
pub trait DeviceClass: Send {
    /// Name used in log messages.
    const NAME: &'static str;

    fn new(op_done: OpDoneCallback) -> Self;

    /// Handle a method forwarded through THI `METHOD1`.
    fn call_method(&mut self, method: u32, argument: u32);
}

/// Number of method registers kept per device class stub.
pub const CLASS_REG_COUNT: usize = 0x400;

/// Method that starts an operation on NVDEC and VIC (byte offset 0x300).
const EXECUTE_METHOD_ID: u32 = 0xC0;

/// Register file shared by the device class stubs.
struct StubRegs {
    regs: Box<[u32; CLASS_REG_COUNT]>,
    executed: u32,
}

impl StubRegs {
    fn new() -> Self {
        Self {
            regs: Box::new([0u32; CLASS_REG_COUNT]),
            executed: 0,
        }
    }

    /// Record a method write, returning whether it started an operation.
    fn write(&mut self, name: &str, method: u32, argument: u32) -> bool {
        if let Some(reg) = self.regs.get_mut(method as usize) {
            *reg = argument;
        }
        log::trace!("{}: reg[0x{:X}] = 0x{:X}", name, method, argument);

        if method == EXECUTE_METHOD_ID {
            self.executed += 1;
            log::debug!("{}: execute (stub, completes immediately)", name);
            true
        } else {
            false
        }
    }

    fn reg(&self, method: u32) -> Option<u32> {
        self.regs.get(method as usize).copied()
    }
}

/// NVDEC video decoder stub (class 0xF0).
pub struct NvDecClass {
    regs: StubRegs,
    op_done: OpDoneCallback,
}

impl NvDecClass {
    pub fn reg(&self, method: u32) -> Option<u32> {
        self.regs.reg(method)
    }

    /// Number of operations started so far.
    pub fn executed(&self) -> u32 {
        self.regs.executed
    }
}

impl DeviceClass for NvDecClass {
    const NAME: &'static str = "NVDEC";

    fn new(op_done: OpDoneCallback) -> Self {
        Self {
            regs: StubRegs::new(),
            op_done,
        }
    }

    fn call_method(&mut self, method: u32, argument: u32) {
        if self.regs.write(Self::NAME, method, argument) {
            (self.op_done)();
        }
    }
}

/// VIC video image compositor stub (class 0x5D).
pub struct VicClass {
    regs: StubRegs,
    op_done: OpDoneCallback,
}

impl VicClass {
    pub fn reg(&self, method: u32) -> Option<u32> {
        self.regs.reg(method)
    }

    pub fn executed(&self) -> u32 {
        self.regs.executed
    }
}

impl DeviceClass for VicClass {
    const NAME: &'static str = "VIC";

    fn new(op_done: OpDoneCallback) -> Self {
        Self {
            regs: StubRegs::new(),
            op_done,
        }
    }

    fn call_method(&mut self, method: u32, argument: u32) {
        if self.regs.write(Self::NAME, method, argument) {
            (self.op_done)();
        }
    }
}
