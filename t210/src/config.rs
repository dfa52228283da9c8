// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use ini::Ini;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use t210_common::Settings;

/// Settings read from disk, plus what happened while reading them.
///
/// Loading runs before the logger exists, so messages are collected and
/// reported afterwards.
#[derive(Debug)]
pub struct LoadedConfig {
    pub settings: Settings,
    pub path: Option<PathBuf>,
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    pub fn report(&self) {
        match &self.path {
            Some(path) => info!("Loaded config from: {}", path.display()),
            None => info!("No config file loaded, using defaults"),
        }
        for warning in &self.warnings {
            warn!("{}", warning);
        }
        debug!("Settings: {:?}", self.settings);
    }
}

/// Locate `t210/config.ini` in the user's config directory.
pub fn find_config_path() -> Option<PathBuf> {
    // XDG_CONFIG_HOME
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(&xdg).join("t210").join("config.ini");
        if path.exists() {
            return Some(path);
        }
    }

    // Linux: ~/.config/t210/config.ini
    if let Ok(home) = std::env::var("HOME") {
        let path = PathBuf::from(&home)
            .join(".config")
            .join("t210")
            .join("config.ini");
        if path.exists() {
            return Some(path);
        }
    }

    // Windows: %APPDATA%\t210\config.ini
    if let Ok(appdata) = std::env::var("APPDATA") {
        let path = PathBuf::from(&appdata).join("t210").join("config.ini");
        if path.exists() {
            return Some(path);
        }
    }

    None
}

/// Parse an integer, accepting a `0x` prefix for hex.
fn parse_number<T>(value: &str) -> Option<T>
where
    T: FromStr + TryFrom<u64>,
{
    let value = value.trim();
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16)
            .ok()
            .and_then(|v| T::try_from(v).ok()),
        None => value.parse().ok(),
    }
}

/// Overwrite `target` with `key` from `section` if present and well-formed.
fn read_key<T>(
    section: &ini::Properties,
    name: &str,
    key: &str,
    target: &mut T,
    warnings: &mut Vec<String>,
) where
    T: FromStr + TryFrom<u64>,
{
    if let Some(value) = section.get(key) {
        match parse_number(value) {
            Some(v) => *target = v,
            None => warnings.push(format!("[{}] {}: invalid value '{}', keeping default", name, key, value)),
        }
    }
}

/// Load settings from `path`, or from the default location when `None`.
pub fn load_config(path: Option<&Path>) -> LoadedConfig {
    let mut loaded = LoadedConfig {
        settings: Settings::default(),
        path: None,
        warnings: Vec::new(),
    };

    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                loaded
                    .warnings
                    .push(format!("Config file not found: {}", p.display()));
                return loaded;
            }
            p.to_path_buf()
        }
        None => match find_config_path() {
            Some(p) => p,
            None => return loaded,
        },
    };

    let conf = match Ini::load_from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            loaded
                .warnings
                .push(format!("Failed to parse config {}: {}", config_path.display(), e));
            return loaded;
        }
    };

    let settings = &mut loaded.settings;
    let warnings = &mut loaded.warnings;

    // [Host1x]
    if let Some(section) = conf.section(Some("Host1x")) {
        read_key(section, "Host1x", "channel_count", &mut settings.channel_count, warnings);
        read_key(section, "Host1x", "gather_queue_size", &mut settings.gather_queue_size, warnings);
    }

    // [Gmmu]
    if let Some(section) = conf.section(Some("Gmmu")) {
        read_key(section, "Gmmu", "base", &mut settings.gmmu_base, warnings);
        read_key(section, "Gmmu", "size", &mut settings.gmmu_size, warnings);
    }

    // [Debugging]
    if let Some(section) = conf.section(Some("Debugging")) {
        if let Some(filter) = section.get("log_filter") {
            settings.log_filter = filter.trim().to_string();
        }
        if let Some(timeout) = section.get("fence_timeout_ms") {
            match timeout.trim().parse() {
                Ok(ms) => settings.fence_timeout_ms = ms,
                Err(_) => warnings.push(format!(
                    "[Debugging] fence_timeout_ms: invalid value '{}', keeping default",
                    timeout
                )),
            }
        }
    }

    loaded.path = Some(config_path);
    loaded
}
