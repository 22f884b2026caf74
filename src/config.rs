//! Core configuration.
//!
//! Stored as JSON next to whatever the host calls home; everything has
//! a sensible default so an empty or missing file just works.

use std::fs;
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::drive::EmulationLevel;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Drive emulation level: "full" runs the drive CPU, "iec" speaks
    /// the serial protocol directly.
    pub drive_level: DriveLevel,
    /// Audio output sample rate in Hz.
    pub sample_rate: u32,
    /// Initial VIC frame skip (1 = every frame), clamped to 1..=4.
    pub frame_skip: u32,
    /// Cap emulation speed at the original clock.
    pub throttle: bool,
    /// Treat unknown opcodes as fatal instead of skip-and-warn.
    pub fatal_decode: bool,
    /// Override the ROM search path.
    pub rom_dir: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveLevel {
    Full,
    Iec,
}

impl From<DriveLevel> for EmulationLevel {
    fn from(level: DriveLevel) -> Self {
        match level {
            DriveLevel::Full => EmulationLevel::Full,
            DriveLevel::Iec => EmulationLevel::IecOnly,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            drive_level: DriveLevel::Iec,
            sample_rate: 44_100,
            frame_skip: 1,
            throttle: true,
            fatal_decode: false,
            rom_dir: None,
        }
    }
}

impl Config {
    /// Load from disk; any problem falls back to defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(path.as_ref()) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    warn!("config: parse error in {}: {e}", path.as_ref().display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let text = serde_json::to_string_pretty(self).expect("config serializes");
        fs::write(path, text)
    }
}
