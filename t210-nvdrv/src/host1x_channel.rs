// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host1x channel device (`/dev/nvhost-vic`, `/dev/nvhost-nvdec`, ...).
//!
//! Resolves guest command buffers through the GMMU and pushes them to the
//! channel's command FIFO, tracking the syncpoint maxima the submitted work
//! will reach.

use std::sync::Arc;

use parking_lot::Mutex;
use t210_common::{GpuVAddr, SyncpointId};
use t210_soc::{GraphicsMemoryManager, Host1x};

use crate::error::{NvdrvError, NvdrvResult};
use crate::syncpoint_manager::{ChannelType, SyncpointManager};

/// Largest command buffer a single submission may reference, in words.
pub const MAX_COMMAND_BUFFER_WORDS: u32 = 1 << 22;

/// A command buffer in GPU virtual memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBuffer {
    pub gpu_va: GpuVAddr,
    /// Length in 32-bit words.
    pub words: u32,
}

/// Syncpoint increments a submission will perform.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncpointIncrement {
    pub syncpoint_id: SyncpointId,
    pub num_incrs: u32,
}

pub struct Host1xChannelDevice {
    channel_type: ChannelType,
    host1x: Arc<Host1x>,
    syncpoint_manager: Arc<SyncpointManager>,
    gmmu: Arc<GraphicsMemoryManager>,
    channel_lock: Mutex<()>,
}

impl Host1xChannelDevice {
    /// Open the device, starting its channel's worker.
    pub fn new(
        channel_type: ChannelType,
        host1x: Arc<Host1x>,
        syncpoint_manager: Arc<SyncpointManager>,
        gmmu: Arc<GraphicsMemoryManager>,
    ) -> NvdrvResult<Self> {
        host1x
            .channel(channel_type.channel_index())
            .ok_or(NvdrvError::InvalidChannel(channel_type))?
            .start()?;

        Ok(Self {
            channel_type,
            host1x,
            syncpoint_manager,
            gmmu,
            channel_lock: Mutex::new(()),
        })
    }

    pub fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    /// Submit command buffers to the channel.
    ///
    /// Every increment raises its syncpoint's expected maximum; the new
    /// maximum is written to the matching slot of `fence_thresholds`. The
    /// command streams themselves perform the increments.
    pub fn submit(
        &self,
        cmd_bufs: &[CommandBuffer],
        syncpoint_incrs: &[SyncpointIncrement],
        fence_thresholds: &mut [u32],
    ) -> NvdrvResult<()> {
        log::debug!(
            "numCmdBufs: {}, numSyncpointIncrs: {}, numFenceThresholds: {}",
            cmd_bufs.len(),
            syncpoint_incrs.len(),
            fence_thresholds.len()
        );

        if fence_thresholds.len() > syncpoint_incrs.len() {
            return Err(NvdrvError::InvalidArgument(
                "more fence thresholds than syncpoint increments",
            ));
        }

        let channel = self
            .host1x
            .channel(self.channel_type.channel_index())
            .ok_or(NvdrvError::InvalidChannel(self.channel_type))?;

        let _guard = self.channel_lock.lock();

        // Resolve everything first so a bad address leaves no trace.
        let mut gathers = Vec::with_capacity(cmd_bufs.len());
        for cmd_buf in cmd_bufs {
            log::debug!(
                "Submit gather, GPU address: 0x{:X}, words: 0x{:X}",
                cmd_buf.gpu_va,
                cmd_buf.words
            );
            if cmd_buf.words > MAX_COMMAND_BUFFER_WORDS {
                return Err(NvdrvError::InvalidArgument("command buffer too large"));
            }
            let words = cmd_buf.words as usize;
            gathers.push(self.gmmu.read_words_to_vec(cmd_buf.gpu_va, words)?);
        }

        for (i, incr) in syncpoint_incrs.iter().enumerate() {
            let max = self
                .syncpoint_manager
                .increment_syncpoint_max_ext(incr.syncpoint_id, incr.num_incrs)?;
            if let Some(threshold) = fence_thresholds.get_mut(i) {
                *threshold = max;
            }
        }

        for gather in gathers {
            if !channel.push(gather) {
                return Err(NvdrvError::ChannelClosed(channel.channel_id()));
            }
        }

        Ok(())
    }

    /// Constant syncpoint of this channel. Only index 0 exists.
    pub fn get_syncpoint(&self, index: u32) -> NvdrvResult<SyncpointId> {
        if index > 0 {
            return Err(NvdrvError::InvalidArgument(
                "multiple channel syncpoints are unimplemented",
            ));
        }
        let id = self.channel_type.syncpoint().ok_or(NvdrvError::InvalidArgument(
            "channel has no syncpoint assigned",
        ))?;
        log::debug!("{:?}: syncpointId: {}", self.channel_type, id);
        Ok(id)
    }

    /// Wait bases aren't emulated; always 0.
    pub fn get_wait_base(&self, channel_type: ChannelType) -> u32 {
        log::debug!("channelType: {:?}", channel_type);
        0
    }
}
