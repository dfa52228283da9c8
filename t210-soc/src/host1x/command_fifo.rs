// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host1x channel command FIFO.
//!
//! Each channel owns a worker thread that pulls gathers off a bounded queue,
//! decodes their method headers, and dispatches `(class, method, argument)`
//! triples to the Host1x class or to a device class behind its THI.
//!
//! ## Method Header (32 bits)
//!
//! | Bits    | Field                               |
//! |---------|-------------------------------------|
//! | 5:0     | Class method mask (SetClass)        |
//! | 15:6    | Class ID (SetClass)                 |
//! | 11:0    | Immediate data (Imm)                |
//! | 15:0    | Method count / offset mask          |
//! | 27:16   | Method address                      |
//! | 31:28   | Opcode                              |

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use t210_common::Settings;

use super::classes::{ClassId, Host1xClass, NvDecClass, VicClass};
use super::gather_queue::{Gather, GatherQueue};
use super::syncpoint::SyncpointSet;
use super::tegra_host_interface::TegraHostInterface;
use super::{FifoError, FifoResult};
use crate::diagnostics::Diagnostics;

/// Command FIFO opcode from method header bits [31:28].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Host1xOpcode {
    SetClass = 0x0,
    Incr = 0x1,
    NonIncr = 0x2,
    Mask = 0x3,
    Imm = 0x4,
    Restart = 0x5,
    Gather = 0x6,
    SetStrmId = 0x7,
    SetAppId = 0x8,
    SetPyld = 0x9,
    IncrW = 0xA,
    NonIncrW = 0xB,
    GatherW = 0xC,
    RestartW = 0xD,
    Extend = 0xE,
}

impl Host1xOpcode {
    pub fn from_raw(v: u8) -> Option<Self> {
        Some(match v {
            0x0 => Self::SetClass,
            0x1 => Self::Incr,
            0x2 => Self::NonIncr,
            0x3 => Self::Mask,
            0x4 => Self::Imm,
            0x5 => Self::Restart,
            0x6 => Self::Gather,
            0x7 => Self::SetStrmId,
            0x8 => Self::SetAppId,
            0x9 => Self::SetPyld,
            0xA => Self::IncrW,
            0xB => Self::NonIncrW,
            0xC => Self::GatherW,
            0xD => Self::RestartW,
            0xE => Self::Extend,
            _ => return None,
        })
    }
}

/// A decoded method header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodHeader(pub u32);

impl MethodHeader {
    pub fn class_method_mask(&self) -> u32 {
        self.0 & 0x3F
    }

    pub fn class_id(&self) -> u16 {
        ((self.0 >> 6) & 0x3FF) as u16
    }

    pub fn imm_data(&self) -> u32 {
        self.0 & 0xFFF
    }

    pub fn method_count(&self) -> u32 {
        self.0 & 0xFFFF
    }

    pub fn offset_mask(&self) -> u32 {
        self.0 & 0xFFFF
    }

    pub fn method_address(&self) -> u32 {
        (self.0 >> 16) & 0xFFF
    }

    pub fn raw_opcode(&self) -> u8 {
        (self.0 >> 28) as u8
    }

    pub fn opcode(&self) -> Option<Host1xOpcode> {
        Host1xOpcode::from_raw(self.raw_opcode())
    }
}

/// Decode one gather, calling `send(class, method, argument)` for every
/// method write in stream order.
///
/// The target class starts as Host1x for every gather.
pub fn decode_gather<F>(gather: &[u32], mut send: F) -> FifoResult<()>
where
    F: FnMut(u16, u32, u32) -> FifoResult<()>,
{
    let mut target_class = ClassId::Host1x as u16;
    let mut pos = 0;

    let next_word = |pos: &mut usize| -> FifoResult<u32> {
        let word = *gather
            .get(*pos)
            .ok_or(FifoError::TruncatedGather { offset: *pos })?;
        *pos += 1;
        Ok(word)
    };

    while pos < gather.len() {
        let offset = pos;
        let header = MethodHeader(next_word(&mut pos)?);
        let address = header.method_address();

        match header.opcode() {
            Some(Host1xOpcode::SetClass) => {
                target_class = header.class_id();
                let mask = header.class_method_mask();
                for i in 0..6 {
                    if mask & (1 << i) != 0 {
                        let argument = next_word(&mut pos)?;
                        send(target_class, address + i, argument)?;
                    }
                }
            }
            Some(Host1xOpcode::Incr) => {
                for i in 0..header.method_count() {
                    let argument = next_word(&mut pos)?;
                    send(target_class, address + i, argument)?;
                }
            }
            Some(Host1xOpcode::NonIncr) => {
                for _ in 0..header.method_count() {
                    let argument = next_word(&mut pos)?;
                    send(target_class, address, argument)?;
                }
            }
            Some(Host1xOpcode::Mask) => {
                let mask = header.offset_mask();
                for i in 0..16 {
                    if mask & (1 << i) != 0 {
                        let argument = next_word(&mut pos)?;
                        send(target_class, address + i, argument)?;
                    }
                }
            }
            Some(Host1xOpcode::Imm) => {
                send(target_class, address, header.imm_data())?;
            }
            _ => {
                return Err(FifoError::UnknownOpcode {
                    opcode: header.raw_opcode(),
                    offset,
                });
            }
        }
    }

    Ok(())
}

/// Per-channel class state, owned by the worker thread once started.
pub struct ChannelProcessor {
    host1x_class: Host1xClass,
    nvdec_class: TegraHostInterface<NvDecClass>,
    vic_class: TegraHostInterface<VicClass>,
}

impl ChannelProcessor {
    pub fn new(syncpoints: Arc<SyncpointSet>, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            host1x_class: Host1xClass::new(syncpoints.clone(), cancelled),
            nvdec_class: TegraHostInterface::new(syncpoints.clone()),
            vic_class: TegraHostInterface::new(syncpoints),
        }
    }

    pub fn process(&mut self, gather: &[u32]) -> FifoResult<()> {
        decode_gather(gather, |class, method, argument| {
            self.send(class, method, argument)
        })
    }

    /// Route one method write to its class. Unknown classes are logged and
    /// skipped.
    pub fn send(&mut self, class: u16, method: u32, argument: u32) -> FifoResult<()> {
        log::trace!(
            "Calling method in class: 0x{:X}, method: 0x{:X}, argument: 0x{:X}",
            class,
            method,
            argument
        );

        match ClassId::from_raw(class) {
            Some(ClassId::Host1x) => self.host1x_class.call_method(method, argument),
            Some(ClassId::NvDec) => self.nvdec_class.call_method(method, argument),
            Some(ClassId::Vic) => self.vic_class.call_method(method, argument),
            _ => {
                log::warn!("Unimplemented class ID: 0x{:X}", class);
                Ok(())
            }
        }
    }

    pub fn nvdec(&self) -> &TegraHostInterface<NvDecClass> {
        &self.nvdec_class
    }

    pub fn vic(&self) -> &TegraHostInterface<VicClass> {
        &self.vic_class
    }
}

enum WorkerState {
    NotStarted(Box<ChannelProcessor>),
    Running(JoinHandle<()>),
    Stopped,
}

/// A Host1x channel: a gather queue drained by a dedicated worker thread.
pub struct ChannelCommandFifo {
    channel_id: usize,
    queue: Arc<GatherQueue>,
    cancelled: Arc<AtomicBool>,
    worker: Mutex<WorkerState>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl ChannelCommandFifo {
    pub fn new(
        channel_id: usize,
        syncpoints: Arc<SyncpointSet>,
        settings: &Settings,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        let processor = ChannelProcessor::new(syncpoints, cancelled.clone());
        Self {
            channel_id,
            queue: Arc::new(GatherQueue::new(settings.gather_queue_size)),
            cancelled,
            worker: Mutex::new(WorkerState::NotStarted(Box::new(processor))),
            diagnostics,
        }
    }

    pub fn channel_id(&self) -> usize {
        self.channel_id
    }

    /// Spawn the worker thread. Later calls do nothing.
    pub fn start(&self) -> FifoResult<()> {
        let mut worker = self.worker.lock();
        let processor = match std::mem::replace(&mut *worker, WorkerState::Stopped) {
            WorkerState::NotStarted(processor) => processor,
            other => {
                *worker = other;
                return Ok(());
            }
        };

        let queue = self.queue.clone();
        let diagnostics = self.diagnostics.clone();
        let channel_id = self.channel_id;
        let spawned = thread::Builder::new()
            .name(format!("ChannelCmdFifo-{}", channel_id))
            .spawn(move || run_worker(channel_id, *processor, &queue, diagnostics.as_ref()));

        match spawned {
            Ok(handle) => {
                log::debug!("Channel {}: command FIFO started", channel_id);
                *worker = WorkerState::Running(handle);
                Ok(())
            }
            // The processor moved into the failed closure; the channel can't
            // be restarted.
            Err(e) => Err(FifoError::Spawn(e)),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.worker.lock(), WorkerState::Running(ref handle) if !handle.is_finished())
    }

    /// Queue a gather for processing, blocking while the queue is full.
    ///
    /// Returns `false` if the channel has shut down and the gather was dropped.
    pub fn push(&self, gather: impl Into<Gather>) -> bool {
        let gather = gather.into();
        log::trace!("Channel {}: push {:?}", self.channel_id, gather);
        let accepted = self.queue.push(gather);
        if !accepted {
            log::warn!("Channel {}: gather dropped, channel is shut down", self.channel_id);
        }
        accepted
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for ChannelCommandFifo {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        self.queue.close();
        let state = std::mem::replace(&mut *self.worker.lock(), WorkerState::Stopped);
        if let WorkerState::Running(handle) = state {
            if handle.join().is_err() {
                log::error!("Channel {}: worker thread panicked", self.channel_id);
            }
        }
    }
}

fn run_worker(
    channel_id: usize,
    mut processor: ChannelProcessor,
    queue: &GatherQueue,
    diagnostics: &dyn Diagnostics,
) {
    let source = format!("ChannelCmdFifo-{}", channel_id);

    while let Some(gather) = queue.pop() {
        log::debug!(
            "Processing pushbuffer: {:p}, size: 0x{:X}",
            gather.as_ptr(),
            gather.len()
        );

        let result = panic::catch_unwind(AssertUnwindSafe(|| processor.process(&gather)));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(FifoError::Cancelled)) => break,
            Ok(Err(e)) => {
                diagnostics.guest_fault(&source, &e);
                break;
            }
            Err(payload) => {
                diagnostics.guest_fault(&source, &FifoError::Panic(panic_message(payload.as_ref())));
                break;
            }
        }
    }

    // Nothing will drain the queue again; release blocked submitters.
    queue.close();
    log::debug!("Channel {}: command FIFO stopped", channel_id);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
