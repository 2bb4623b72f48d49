// src/settings.rs

use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

pub const DEFAULT_RPC_PORT: u16 = 8193;
pub const DEFAULT_BPM: u32 = 120;
pub const DEFAULT_PPB: u32 = 96;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AppSettings {
    pub host_name: Option<String>,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub sample_rate: Option<u32>,
    pub buffer_size: Option<u32>,
    pub rpc_port: u16,
    pub midi_input_port: Option<String>,
    /// Output port for the soft synth sink ("synth" dispatcher).
    pub synth_port: Option<String>,
    /// Output port for a hardware instrument ("midi" dispatcher).
    pub hardware_port: Option<String>,
    pub pedal_device: Option<String>,
    pub bpm: u32,
    pub ppb: u32,
    pub session_dir: Option<PathBuf>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            host_name: None,
            input_device: None,
            output_device: None,
            sample_rate: None,
            buffer_size: None,
            rpc_port: DEFAULT_RPC_PORT,
            midi_input_port: None,
            synth_port: None,
            hardware_port: None,
            pedal_device: None,
            bpm: DEFAULT_BPM,
            ppb: DEFAULT_PPB,
            session_dir: None,
        }
    }
}

pub fn get_config_dir() -> Option<PathBuf> {
    if let Ok(exe_path) = env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let settings_dir = exe_dir.join("AppSettings");
            for dir in [&settings_dir, &settings_dir.join("Sessions")] {
                if !dir.exists() {
                    if let Err(err) = fs::create_dir_all(dir) {
                        error!("Failed to create directory at {}: {}", dir.display(), err);
                        return None;
                    }
                }
            }
            return Some(settings_dir);
        }
    }
    error!("Could not determine application directory.");
    None
}

/// The directory save prompts default into.
pub fn session_dir(settings: &AppSettings) -> PathBuf {
    settings
        .session_dir
        .clone()
        .or_else(|| get_config_dir().map(|d| d.join("Sessions")))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn save_settings(settings: &AppSettings) {
    if let Some(dir) = get_config_dir() {
        let path = dir.join("settings.json");
        match serde_json::to_string_pretty(settings) {
            Ok(json_string) => {
                if let Err(err) = fs::write(&path, json_string) {
                    error!("Failed to write settings to {}: {}", path.display(), err);
                }
            }
            Err(err) => error!("Failed to serialize settings: {}", err),
        }
    }
}

pub fn load_settings() -> AppSettings {
    if let Some(dir) = get_config_dir() {
        let path = dir.join("settings.json");
        if path.exists() {
            return match fs::read_to_string(&path) {
                Ok(json_string) => match serde_json::from_str::<AppSettings>(&json_string) {
                    Ok(settings) => settings,
                    Err(err) => {
                        warn!("Failed to parse settings file, using defaults: {}", err);
                        AppSettings::default()
                    }
                },
                Err(err) => {
                    warn!("Failed to read settings file, using defaults: {}", err);
                    AppSettings::default()
                }
            };
        }
    }
    AppSettings::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: AppSettings = serde_json::from_str(r#"{"bpm": 90}"#).unwrap();
        assert_eq!(settings.bpm, 90);
        assert_eq!(settings.ppb, DEFAULT_PPB);
        assert_eq!(settings.rpc_port, DEFAULT_RPC_PORT);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"rpc_port": 9000, "some_future_knob": true}"#).unwrap();
        assert_eq!(settings.rpc_port, 9000);
    }
}
