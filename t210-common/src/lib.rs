// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod settings;
pub mod types;

pub use settings::Settings;
pub use types::*;
