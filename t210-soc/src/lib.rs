// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tegra X1 Host1x front-end.
//!
//! The GPU MMU's chunk allocator, the syncpoint primitives, and the channel
//! command FIFOs that decode Host1x command streams and dispatch them to the
//! device classes.

pub mod diagnostics;
pub mod gmmu;
pub mod host1x;

pub use diagnostics::{Diagnostics, GuestProcess};
pub use gmmu::{GmmuError, GmmuResult, GraphicsMemoryManager, HostSlice};
pub use host1x::{ChannelCommandFifo, FifoError, FifoResult, Gather, Host1x};
