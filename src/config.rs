use crate::error::{ForgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

pub const VALID_VIDEO_ENCODERS: &[&str] = &[
    "nvenc_h265",
    "nvenc_h264",
    "hevc_nvenc",
    "h264_nvenc",
    "qsv_h265",
    "qsv_h264",
    "vaapi_h265",
    "vaapi_h264",
    "amf_h265",
    "amf_h264",
    "x265",
    "x264",
];

pub const VALID_AUDIO_ENCODERS: &[&str] = &["copy", "aac", "ac3", "eac3", "flac", "mp3"];

pub const VALID_SUBTITLE_MODES: &[&str] = &["all", "none", "first"];

pub const VALID_LOG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];

static PRESET_NAME_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9 \-_.]+$").unwrap());

/// Runtime configuration. Defaults are overlaid with `config.toml` (when
/// present), then environment variables, then the Catalog's override table,
/// then hardware auto-resolution for keys nobody set explicitly.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    // Paths
    pub raw_path: String,
    pub completed_path: String,
    pub work_path: String,
    pub db_path: String,
    pub preset_path: String,

    // Transcoding
    pub video_encoder: String,
    pub video_quality: i64,
    pub audio_encoder: String,
    pub subtitle_mode: String,
    pub handbrake_preset: String,
    pub handbrake_preset_4k: String,
    pub handbrake_preset_dvd: String,
    pub handbrake_preset_file: String,

    // File handling
    pub delete_source: bool,
    pub output_extension: String,
    pub movies_subdir: String,
    pub tv_subdir: String,
    pub audio_subdir: String,

    // Concurrency / timing
    pub max_concurrent: i64,
    pub stabilize_seconds: i64,
    pub minimum_free_space_gb: f64,
    pub max_retry_count: i64,

    // Logging
    pub log_level: String,

    // Authentication
    pub require_api_auth: bool,
    pub api_keys: String,
    pub webhook_secret: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            raw_path: "/data/raw".into(),
            completed_path: "/data/completed".into(),
            work_path: "/data/work".into(),
            db_path: "/data/db/ripforge.db".into(),
            preset_path: "/config/presets".into(),
            video_encoder: "nvenc_h265".into(),
            video_quality: 22,
            audio_encoder: "copy".into(),
            subtitle_mode: "all".into(),
            handbrake_preset: "NVENC H.265 1080p".into(),
            handbrake_preset_4k: "H.265 NVENC 2160p 4K".into(),
            handbrake_preset_dvd: String::new(),
            handbrake_preset_file: String::new(),
            delete_source: true,
            output_extension: "mkv".into(),
            movies_subdir: "movies".into(),
            tv_subdir: "tv".into(),
            audio_subdir: "audio".into(),
            max_concurrent: 1,
            stabilize_seconds: 60,
            minimum_free_space_gb: 10.0,
            max_retry_count: 3,
            log_level: "INFO".into(),
            require_api_auth: false,
            api_keys: String::new(),
            webhook_secret: String::new(),
        }
    }
}

/// Value shape for a tunable key, used both for override coercion and
/// PATCH /config validation.
#[derive(Debug, Clone, Copy)]
pub enum KeyKind {
    Bool,
    Int { min: i64, max: i64 },
    Float { min: f64 },
    Text,
    /// Enum membership against a fixed list.
    Enum(&'static [&'static str]),
    /// HandBrake preset name; empty permitted (falls back to standard).
    Preset,
}

/// Keys the Catalog override table (and PATCH /config) may carry.
/// `db_path` is deliberately absent: the override store lives inside it.
pub const OVERRIDABLE_KEYS: &[(&str, KeyKind)] = &[
    ("raw_path", KeyKind::Text),
    ("completed_path", KeyKind::Text),
    ("work_path", KeyKind::Text),
    ("preset_path", KeyKind::Text),
    ("video_encoder", KeyKind::Enum(VALID_VIDEO_ENCODERS)),
    ("video_quality", KeyKind::Int { min: 0, max: 51 }),
    ("audio_encoder", KeyKind::Enum(VALID_AUDIO_ENCODERS)),
    ("subtitle_mode", KeyKind::Enum(VALID_SUBTITLE_MODES)),
    ("handbrake_preset", KeyKind::Preset),
    ("handbrake_preset_4k", KeyKind::Preset),
    ("handbrake_preset_dvd", KeyKind::Preset),
    ("handbrake_preset_file", KeyKind::Text),
    ("delete_source", KeyKind::Bool),
    ("output_extension", KeyKind::Text),
    ("movies_subdir", KeyKind::Text),
    ("tv_subdir", KeyKind::Text),
    ("audio_subdir", KeyKind::Text),
    ("max_concurrent", KeyKind::Int { min: 1, max: 10 }),
    ("stabilize_seconds", KeyKind::Int { min: 10, max: 600 }),
    ("minimum_free_space_gb", KeyKind::Float { min: 1.0 }),
    ("max_retry_count", KeyKind::Int { min: 0, max: 10 }),
    ("log_level", KeyKind::Enum(VALID_LOG_LEVELS)),
    ("require_api_auth", KeyKind::Bool),
    ("api_keys", KeyKind::Text),
    ("webhook_secret", KeyKind::Text),
];

pub fn key_kind(key: &str) -> Option<KeyKind> {
    OVERRIDABLE_KEYS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, kind)| *kind)
}

/// Validate a raw string value for `key` and return its normalized text
/// form (log levels uppercased, booleans canonicalized).
pub fn validate_value(key: &str, value: &str) -> Result<String> {
    let kind = key_kind(key)
        .ok_or_else(|| ForgeError::Validation(format!("Unknown configuration key: {key}")))?;

    match kind {
        KeyKind::Bool => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok("true".into()),
            "false" | "0" | "no" | "off" => Ok("false".into()),
            other => Err(ForgeError::Validation(format!(
                "{key} must be a boolean, got '{other}'"
            ))),
        },
        KeyKind::Int { min, max } => {
            let parsed: i64 = value
                .trim()
                .parse()
                .map_err(|_| ForgeError::Validation(format!("{key} must be an integer")))?;
            if parsed < min || parsed > max {
                return Err(ForgeError::Validation(format!(
                    "{key} must be between {min} and {max}, got {parsed}"
                )));
            }
            Ok(parsed.to_string())
        }
        KeyKind::Float { min } => {
            let parsed: f64 = value
                .trim()
                .parse()
                .map_err(|_| ForgeError::Validation(format!("{key} must be a number")))?;
            if parsed < min {
                return Err(ForgeError::Validation(format!(
                    "{key} must be >= {min}, got {parsed}"
                )));
            }
            Ok(parsed.to_string())
        }
        KeyKind::Text => Ok(value.to_string()),
        KeyKind::Enum(options) => {
            let normalized = if key == "log_level" {
                value.to_ascii_uppercase()
            } else {
                value.to_string()
            };
            if !options.contains(&normalized.as_str()) {
                return Err(ForgeError::Validation(format!(
                    "Invalid {key}: {value}. Valid options: {}",
                    options.join(", ")
                )));
            }
            Ok(normalized)
        }
        KeyKind::Preset => {
            if value.is_empty() {
                return Ok(String::new());
            }
            if value.len() > 100 {
                return Err(ForgeError::Validation(format!(
                    "{key} too long (max 100 characters)"
                )));
            }
            if !PRESET_NAME_RE.is_match(value) {
                return Err(ForgeError::Validation(format!(
                    "Invalid {key}: only alphanumerics, spaces, hyphens, underscores and periods allowed"
                )));
            }
            Ok(value.to_string())
        }
    }
}

impl Config {
    /// Load from a toml file (missing file means defaults), then overlay
    /// any environment variables named after upper-cased keys.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        for (key, _) in OVERRIDABLE_KEYS {
            if let Ok(value) = std::env::var(key.to_ascii_uppercase()) {
                if let Err(e) = self.set_key(key, &value) {
                    tracing::warn!("Ignoring environment override {key}: {e}");
                }
            }
        }
        if let Ok(value) = std::env::var("DB_PATH") {
            self.db_path = value;
        }
    }

    /// Assign a validated value to a key. Used by the env overlay, the
    /// Catalog override application, and PATCH /config.
    pub fn set_key(&mut self, key: &str, value: &str) -> Result<()> {
        let normalized = validate_value(key, value)?;
        match key {
            "raw_path" => self.raw_path = normalized,
            "completed_path" => self.completed_path = normalized,
            "work_path" => self.work_path = normalized,
            "preset_path" => self.preset_path = normalized,
            "video_encoder" => self.video_encoder = normalized,
            "video_quality" => self.video_quality = normalized.parse().unwrap_or(self.video_quality),
            "audio_encoder" => self.audio_encoder = normalized,
            "subtitle_mode" => self.subtitle_mode = normalized,
            "handbrake_preset" => self.handbrake_preset = normalized,
            "handbrake_preset_4k" => self.handbrake_preset_4k = normalized,
            "handbrake_preset_dvd" => self.handbrake_preset_dvd = normalized,
            "handbrake_preset_file" => self.handbrake_preset_file = normalized,
            "delete_source" => self.delete_source = normalized == "true",
            "output_extension" => self.output_extension = normalized,
            "movies_subdir" => self.movies_subdir = normalized,
            "tv_subdir" => self.tv_subdir = normalized,
            "audio_subdir" => self.audio_subdir = normalized,
            "max_concurrent" => self.max_concurrent = normalized.parse().unwrap_or(self.max_concurrent),
            "stabilize_seconds" => {
                self.stabilize_seconds = normalized.parse().unwrap_or(self.stabilize_seconds)
            }
            "minimum_free_space_gb" => {
                self.minimum_free_space_gb = normalized.parse().unwrap_or(self.minimum_free_space_gb)
            }
            "max_retry_count" => {
                self.max_retry_count = normalized.parse().unwrap_or(self.max_retry_count)
            }
            "log_level" => self.log_level = normalized,
            "require_api_auth" => self.require_api_auth = normalized == "true",
            "api_keys" => self.api_keys = normalized,
            "webhook_secret" => self.webhook_secret = normalized,
            _ => return Err(ForgeError::Validation(format!("Unknown configuration key: {key}"))),
        }
        Ok(())
    }

    /// Apply stored overrides on top of the loaded config, returning the
    /// set of keys that were overridden (hardware auto-resolution must not
    /// touch those).
    pub fn apply_overrides<'a, I>(&mut self, overrides: I) -> HashSet<String>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut touched = HashSet::new();
        for (key, value) in overrides {
            match self.set_key(key, value) {
                Ok(()) => {
                    touched.insert(key.to_string());
                }
                Err(e) => tracing::warn!("Ignoring stored override {key}: {e}"),
            }
        }
        touched
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !VALID_VIDEO_ENCODERS.contains(&self.video_encoder.as_str()) {
            anyhow::bail!(
                "Invalid video encoder: {}. Valid options: {}",
                self.video_encoder,
                VALID_VIDEO_ENCODERS.join(", ")
            );
        }
        if !VALID_AUDIO_ENCODERS.contains(&self.audio_encoder.as_str()) {
            anyhow::bail!("Invalid audio encoder: {}", self.audio_encoder);
        }
        if !VALID_SUBTITLE_MODES.contains(&self.subtitle_mode.as_str()) {
            anyhow::bail!("Invalid subtitle mode: {}", self.subtitle_mode);
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            anyhow::bail!("Invalid log level: {}", self.log_level);
        }
        if !(0..=51).contains(&self.video_quality) {
            anyhow::bail!("video_quality must be within 0-51, got {}", self.video_quality);
        }
        if !(1..=10).contains(&self.max_concurrent) {
            anyhow::bail!("max_concurrent must be within 1-10, got {}", self.max_concurrent);
        }
        if !(10..=600).contains(&self.stabilize_seconds) {
            anyhow::bail!(
                "stabilize_seconds must be within 10-600, got {}",
                self.stabilize_seconds
            );
        }
        if !(0..=10).contains(&self.max_retry_count) {
            anyhow::bail!(
                "max_retry_count must be within 0-10, got {}",
                self.max_retry_count
            );
        }
        if self.minimum_free_space_gb < 1.0 {
            anyhow::bail!(
                "minimum_free_space_gb must be >= 1.0, got {}",
                self.minimum_free_space_gb
            );
        }
        Ok(())
    }

    /// The non-sensitive subset surfaced on /health and GET /config.
    pub fn public_view(&self) -> serde_json::Value {
        serde_json::json!({
            "raw_path": self.raw_path,
            "completed_path": self.completed_path,
            "work_path": self.work_path,
            "preset_path": self.preset_path,
            "video_encoder": self.video_encoder,
            "video_quality": self.video_quality,
            "audio_encoder": self.audio_encoder,
            "subtitle_mode": self.subtitle_mode,
            "handbrake_preset": self.handbrake_preset,
            "handbrake_preset_4k": self.handbrake_preset_4k,
            "handbrake_preset_dvd": self.handbrake_preset_dvd,
            "handbrake_preset_file": self.handbrake_preset_file,
            "delete_source": self.delete_source,
            "output_extension": self.output_extension,
            "movies_subdir": self.movies_subdir,
            "tv_subdir": self.tv_subdir,
            "audio_subdir": self.audio_subdir,
            "max_concurrent": self.max_concurrent,
            "stabilize_seconds": self.stabilize_seconds,
            "minimum_free_space_gb": self.minimum_free_space_gb,
            "max_retry_count": self.max_retry_count,
            "log_level": self.log_level,
            "require_api_auth": self.require_api_auth,
            "api_keys_configured": !self.api_keys.is_empty(),
            "webhook_secret_configured": !self.webhook_secret.is_empty(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn video_quality_bounds() {
        assert!(validate_value("video_quality", "0").is_ok());
        assert!(validate_value("video_quality", "51").is_ok());
        assert!(validate_value("video_quality", "-1").is_err());
        assert!(validate_value("video_quality", "52").is_err());
    }

    #[test]
    fn max_concurrent_bounds() {
        assert!(validate_value("max_concurrent", "1").is_ok());
        assert!(validate_value("max_concurrent", "10").is_ok());
        assert!(validate_value("max_concurrent", "0").is_err());
        assert!(validate_value("max_concurrent", "11").is_err());
    }

    #[test]
    fn stabilize_seconds_bounds() {
        assert!(validate_value("stabilize_seconds", "10").is_ok());
        assert!(validate_value("stabilize_seconds", "600").is_ok());
        assert!(validate_value("stabilize_seconds", "9").is_err());
        assert!(validate_value("stabilize_seconds", "601").is_err());
    }

    #[test]
    fn retry_count_bounds() {
        assert!(validate_value("max_retry_count", "0").is_ok());
        assert!(validate_value("max_retry_count", "10").is_ok());
        assert!(validate_value("max_retry_count", "11").is_err());
    }

    #[test]
    fn unknown_key_rejected() {
        assert!(validate_value("no_such_key", "x").is_err());
        assert!(key_kind("db_path").is_none());
    }

    #[test]
    fn encoder_enum_membership() {
        assert!(validate_value("video_encoder", "nvenc_h265").is_ok());
        assert!(validate_value("video_encoder", "vaapi_h265").is_ok());
        assert!(validate_value("video_encoder", "rm -rf /").is_err());
    }

    #[test]
    fn log_level_normalizes_case() {
        assert_eq!(validate_value("log_level", "debug").unwrap(), "DEBUG");
        assert!(validate_value("log_level", "verbose").is_err());
    }

    #[test]
    fn preset_names_are_constrained() {
        assert!(validate_value("handbrake_preset", "NVENC H.265 1080p").is_ok());
        assert!(validate_value("handbrake_preset", "bad;name").is_err());
        assert!(validate_value("handbrake_preset", &"x".repeat(101)).is_err());
        // empty DVD preset means "fall back to the standard preset"
        assert!(validate_value("handbrake_preset_dvd", "").is_ok());
    }

    #[test]
    fn bool_coercion() {
        assert_eq!(validate_value("delete_source", "1").unwrap(), "true");
        assert_eq!(validate_value("delete_source", "off").unwrap(), "false");
        assert!(validate_value("delete_source", "maybe").is_err());
    }

    #[test]
    fn overrides_report_touched_keys() {
        let mut config = Config::default();
        let touched = config.apply_overrides(vec![
            ("video_quality", "30"),
            ("bogus_key", "1"),
            ("subtitle_mode", "none"),
        ]);
        assert_eq!(config.video_quality, 30);
        assert_eq!(config.subtitle_mode, "none");
        assert!(touched.contains("video_quality"));
        assert!(touched.contains("subtitle_mode"));
        assert!(!touched.contains("bogus_key"));
    }
}
