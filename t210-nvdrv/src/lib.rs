// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Guest driver side of Host1x: syncpoint bookkeeping and channel submission.

pub mod error;
pub mod fence;
pub mod host1x_channel;
pub mod syncpoint_manager;

pub use error::{NvdrvError, NvdrvResult};
pub use fence::Fence;
pub use host1x_channel::{CommandBuffer, Host1xChannelDevice, SyncpointIncrement};
pub use syncpoint_manager::{ChannelType, SyncpointManager};
