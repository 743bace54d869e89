//! Persistent host settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use wander_core::{
    meter::DEFAULT_DISPLAY_SCALE,
    transport::gemini::{
        DEFAULT_LIVE_ENDPOINT, DEFAULT_LIVE_MODEL, DEFAULT_SYSTEM_INSTRUCTION, DEFAULT_VOICE_NAME,
    },
    GeminiLiveConfig, VoiceConfig,
};

/// Environment variables checked for the API key, in priority order.
const API_KEY_ENV_VARS: &[&str] = &["GEMINI_API_KEY", "API_KEY"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub api_key: Option<String>,
    pub live_endpoint: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub volume_scale: f32,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            preferred_output_device: None,
            api_key: None,
            live_endpoint: DEFAULT_LIVE_ENDPOINT.into(),
            model: DEFAULT_LIVE_MODEL.into(),
            voice_name: DEFAULT_VOICE_NAME.into(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.into(),
            volume_scale: DEFAULT_DISPLAY_SCALE,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.preferred_input_device = normalize_optional(&self.preferred_input_device);
        self.preferred_output_device = normalize_optional(&self.preferred_output_device);
        self.api_key = normalize_optional(&self.api_key);
        self.live_endpoint = normalize_or(&self.live_endpoint, DEFAULT_LIVE_ENDPOINT);
        self.model = normalize_or(&self.model, DEFAULT_LIVE_MODEL);
        self.voice_name = normalize_or(&self.voice_name, DEFAULT_VOICE_NAME);
        self.system_instruction = self.system_instruction.trim().to_string();
        if !self.volume_scale.is_finite() {
            self.volume_scale = DEFAULT_DISPLAY_SCALE;
        }
        self.volume_scale = self.volume_scale.clamp(1.0, 1_000.0);
    }

    /// Engine configuration with `api_key` already resolved.
    pub fn voice_config(&self, api_key: String) -> VoiceConfig {
        VoiceConfig {
            preferred_input_device: self.preferred_input_device.clone(),
            preferred_output_device: self.preferred_output_device.clone(),
            volume_scale: self.volume_scale,
            live: GeminiLiveConfig {
                endpoint: self.live_endpoint.clone(),
                api_key,
                model: self.model.clone(),
                voice_name: self.voice_name.clone(),
                system_instruction: Some(self.system_instruction.clone())
                    .filter(|s| !s.is_empty()),
            },
        }
    }
}

fn normalize_optional(raw: &Option<String>) -> Option<String> {
    raw.as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn normalize_or(raw: &str, fallback: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        fallback.into()
    } else {
        trimmed.into()
    }
}

/// API key from the environment, falling back to the settings file.
pub fn resolve_api_key(settings: &AppSettings) -> Option<String> {
    resolve_api_key_with(settings, |name| std::env::var(name).ok())
}

fn resolve_api_key_with(
    settings: &AppSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<String> {
    API_KEY_ENV_VARS
        .iter()
        .filter_map(|name| lookup(name))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .or_else(|| settings.api_key.clone())
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("WanderAI")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("WanderAI")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_and_restores_defaults() {
        let mut settings = AppSettings {
            preferred_input_device: Some("  ".into()),
            preferred_output_device: Some(" Speakers ".into()),
            api_key: Some(" key ".into()),
            model: "".into(),
            voice_name: " Puck ".into(),
            volume_scale: f32::NAN,
            ..AppSettings::default()
        };
        settings.normalize();
        assert!(settings.preferred_input_device.is_none());
        assert_eq!(settings.preferred_output_device.as_deref(), Some("Speakers"));
        assert_eq!(settings.api_key.as_deref(), Some("key"));
        assert_eq!(settings.model, DEFAULT_LIVE_MODEL);
        assert_eq!(settings.voice_name, "Puck");
        assert_eq!(settings.volume_scale, DEFAULT_DISPLAY_SCALE);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"voiceName":"Puck","volumeScale":50}"#).unwrap();
        assert_eq!(settings.voice_name, "Puck");
        assert_eq!(settings.volume_scale, 50.0);
        assert_eq!(settings.live_endpoint, DEFAULT_LIVE_ENDPOINT);
    }

    #[test]
    fn environment_key_wins_over_settings() {
        let settings = AppSettings {
            api_key: Some("from-file".into()),
            ..AppSettings::default()
        };
        let key = resolve_api_key_with(&settings, |name| {
            (name == "API_KEY").then(|| "from-env".to_string())
        });
        assert_eq!(key.as_deref(), Some("from-env"));

        let key = resolve_api_key_with(&settings, |_| Some("   ".into()));
        assert_eq!(key.as_deref(), Some("from-file"));
    }

    #[test]
    fn blank_instruction_is_not_sent() {
        let settings = AppSettings {
            system_instruction: String::new(),
            ..AppSettings::default()
        };
        let config = settings.voice_config("k".into());
        assert!(config.live.system_instruction.is_none());
        assert_eq!(config.live.api_key, "k");
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("wander-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        let settings = AppSettings {
            preferred_input_device: Some("USB Mic".into()),
            ..AppSettings::default()
        };
        save_settings(&path, &settings).unwrap();
        let loaded = load_settings(&path);
        assert_eq!(loaded.preferred_input_device.as_deref(), Some("USB Mic"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let loaded = load_settings(Path::new("/nonexistent/wander/settings.json"));
        assert_eq!(loaded.voice_name, DEFAULT_VOICE_NAME);
    }
}
