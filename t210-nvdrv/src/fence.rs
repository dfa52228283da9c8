// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// A syncpoint threshold handed to the guest: signalled once syncpoint `id`
/// reaches `threshold`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fence {
    pub id: u32,
    pub threshold: u32,
}

impl Fence {
    pub const fn new(id: u32, threshold: u32) -> Self {
        Self { id, threshold }
    }
}
