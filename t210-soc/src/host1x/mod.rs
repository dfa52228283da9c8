// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host1x: syncpoints plus the per-channel command FIFOs that feed the
//! multimedia engines.

pub mod classes;
pub mod command_fifo;
pub mod gather_queue;
pub mod syncpoint;
pub mod tegra_host_interface;

use std::sync::Arc;

use t210_common::Settings;
use thiserror::Error;

use crate::diagnostics::Diagnostics;
pub use command_fifo::ChannelCommandFifo;
pub use gather_queue::Gather;
pub use syncpoint::{Syncpoint, SyncpointPair, SyncpointSet};

/// Errors raised while decoding or executing a channel's command stream.
#[derive(Debug, Error)]
pub enum FifoError {
    #[error("unimplemented Host1x command FIFO opcode 0x{opcode:X} at word {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },
    #[error("gather ended at word {offset} while more data words were expected")]
    TruncatedGather { offset: usize },
    #[error("syncpoint {0} does not exist")]
    InvalidSyncpoint(u32),
    #[error("channel processing cancelled")]
    Cancelled,
    #[error("channel worker panicked: {0}")]
    Panic(String),
    #[error("failed to spawn channel worker: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type FifoResult<T> = Result<T, FifoError>;

/// The Host1x block: one syncpoint set shared by every channel.
pub struct Host1x {
    syncpoints: Arc<SyncpointSet>,
    channels: Vec<ChannelCommandFifo>,
}

impl Host1x {
    /// Create `settings.channel_count` channels. Workers start on first use.
    pub fn new(settings: &Settings, diagnostics: Arc<dyn Diagnostics>) -> Self {
        let syncpoints = Arc::new(SyncpointSet::new());
        let channels = (0..settings.channel_count)
            .map(|id| {
                ChannelCommandFifo::new(id, syncpoints.clone(), settings, diagnostics.clone())
            })
            .collect();

        log::info!(
            "Host1x: {} channels, {} syncpoints",
            settings.channel_count,
            syncpoints.len()
        );
        Self {
            syncpoints,
            channels,
        }
    }

    pub fn syncpoints(&self) -> &Arc<SyncpointSet> {
        &self.syncpoints
    }

    pub fn channel(&self, index: usize) -> Option<&ChannelCommandFifo> {
        self.channels.get(index)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
