// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod config;
mod pushbuffer;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use t210_common::GPU_PAGE_SIZE;
use t210_nvdrv::{ChannelType, Fence, Host1xChannelDevice, SyncpointIncrement, SyncpointManager};
use t210_soc::{Diagnostics, GraphicsMemoryManager, GuestProcess, Host1x};

use pushbuffer::GuestBuffer;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Channel {
    Vic,
    Nvdec,
    Nvjpg,
}

impl From<Channel> for ChannelType {
    fn from(channel: Channel) -> Self {
        match channel {
            Channel::Vic => ChannelType::Vic,
            Channel::Nvdec => ChannelType::NvDec,
            Channel::Nvjpg => ChannelType::NvJpg,
        }
    }
}

/// t210 - Tegra X1 Host1x pushbuffer replayer
#[derive(Parser, Debug)]
#[command(name = "t210", version, about = "Replays Host1x pushbuffers through the Tegra X1 emulation core")]
struct Args {
    /// Pushbuffer files of little-endian command words, submitted in order
    #[arg(short, long = "pushbuffer", required = true, num_args = 1..)]
    pushbuffers: Vec<PathBuf>,

    /// Host1x channel to submit to
    #[arg(long, value_enum, default_value_t = Channel::Vic)]
    channel: Channel,

    /// Syncpoint the pushbuffers increment (default: the channel's syncpoint)
    #[arg(long)]
    syncpoint: Option<u32>,

    /// Number of increments the pushbuffers perform on the syncpoint
    #[arg(long, default_value_t = 0)]
    increments: u32,

    /// Path to config file (default: auto-detect)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // The config chooses the log filter, so it's read before logging starts.
    let loaded = config::load_config(args.config.as_deref());

    // Initialize logging
    let log_level = if args.verbose {
        "debug"
    } else {
        loaded.settings.log_filter.as_str()
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("t210 - Tegra X1 Host1x");
    info!("======================");

    loaded.report();
    let mut settings = loaded.settings;
    settings.sanitize();

    let diagnostics = Arc::new(GuestProcess::new());
    let gmmu = Arc::new(GraphicsMemoryManager::new(
        settings.gmmu_base,
        settings.gmmu_size,
        GPU_PAGE_SIZE,
        diagnostics.clone(),
    ));
    let host1x = Arc::new(Host1x::new(&settings, diagnostics.clone()));
    let syncpoint_manager = Arc::new(SyncpointManager::new(host1x.syncpoints().clone())?);

    let channel_type = ChannelType::from(args.channel);
    let device = Host1xChannelDevice::new(
        channel_type,
        host1x.clone(),
        syncpoint_manager.clone(),
        gmmu.clone(),
    )
    .with_context(|| format!("Failed to open {:?} channel", channel_type))?;

    let mut buffers = Vec::with_capacity(args.pushbuffers.len());
    for path in &args.pushbuffers {
        let words = pushbuffer::load_pushbuffer(path)?;
        let buffer = GuestBuffer::upload(&gmmu, &words)?;
        let cmd_buf = buffer.command_buffer();
        info!(
            "Mapped {} ({} words) at GPU VA 0x{:X}",
            path.display(),
            cmd_buf.words,
            cmd_buf.gpu_va
        );
        buffers.push(buffer);
    }

    let syncpoint_id = match args.syncpoint {
        Some(id) => id,
        None => device.get_syncpoint(0)?,
    };
    let cmd_bufs: Vec<_> = buffers.iter().map(GuestBuffer::command_buffer).collect();
    let incrs = [SyncpointIncrement {
        syncpoint_id,
        num_incrs: args.increments,
    }];
    let mut thresholds = [0u32; 1];
    device
        .submit(&cmd_bufs, &incrs, &mut thresholds)
        .context("Submit failed")?;

    let fence = Fence::new(syncpoint_id, thresholds[0]);
    info!(
        "Submitted {} pushbuffer(s), waiting on syncpoint {} for {}",
        cmd_bufs.len(),
        fence.id,
        fence.threshold
    );

    let signalled = wait_for_fence(
        &syncpoint_manager,
        &diagnostics,
        fence,
        settings.fence_timeout(),
    )?;
    let value = syncpoint_manager.read_syncpoint_min_value(fence.id)?;

    for buffer in buffers {
        buffer.unmap(&gmmu);
    }

    if !diagnostics.is_guest_alive() {
        bail!(
            "Guest terminated: {}",
            diagnostics.last_fault().unwrap_or_default()
        );
    }
    if !signalled {
        bail!(
            "Timed out waiting for syncpoint {} to reach {} (at {})",
            fence.id,
            fence.threshold,
            value
        );
    }

    info!("Fence signalled: syncpoint {} = {}", fence.id, value);
    Ok(())
}

/// How often a fence wait checks whether the guest is still alive.
const FENCE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wait for `fence`, giving up early if a channel fault kills the guest.
fn wait_for_fence(
    syncpoint_manager: &SyncpointManager,
    diagnostics: &GuestProcess,
    fence: Fence,
    timeout: Option<Duration>,
) -> Result<bool> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let slice = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(syncpoint_manager.is_fence_signalled(fence)?);
                }
                remaining.min(FENCE_POLL_INTERVAL)
            }
            None => FENCE_POLL_INTERVAL,
        };

        if syncpoint_manager.wait_fence(fence, Some(slice))? {
            return Ok(true);
        }
        if !diagnostics.is_guest_alive() {
            return Ok(false);
        }
    }
}
