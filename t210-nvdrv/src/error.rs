// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use t210_soc::{FifoError, GmmuError};
use thiserror::Error;

use crate::syncpoint_manager::ChannelType;

#[derive(Debug, Error)]
pub enum NvdrvError {
    #[error("syncpoint {0} is already reserved")]
    SyncpointInUse(u32),
    #[error("no free syncpoint left to allocate")]
    NoFreeSyncpoint,
    #[error("syncpoint {0} is not reserved")]
    UnreservedSyncpoint(u32),
    #[error("syncpoint {0} does not exist")]
    InvalidSyncpoint(u32),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("no Host1x channel for {0:?}")]
    InvalidChannel(ChannelType),
    #[error("Host1x channel {0} has shut down")]
    ChannelClosed(usize),
    #[error(transparent)]
    Gmmu(#[from] GmmuError),
    #[error(transparent)]
    Fifo(#[from] FifoError),
}

pub type NvdrvResult<T> = Result<T, NvdrvError>;
