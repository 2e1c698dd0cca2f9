//! HandBrakeCLI command synthesis and progress parsing for the integrated
//! encoder backend.

use crate::config::{validate_value, Config};
use crate::error::Result;
use crate::media::Resolution;
use std::path::Path;
use std::sync::LazyLock;

static PERCENT_TOKEN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(\d+\.?\d*)\s*%").unwrap());

/// Pick the preset for the source's resolution band. Returns the preset
/// name and whether the sub-720p upscale applies.
pub fn select_preset(config: &Config, resolution: Option<Resolution>) -> (String, bool) {
    match resolution {
        Some(r) if r.is_4k() => (config.handbrake_preset_4k.clone(), false),
        Some(r) if r.needs_upscale() => {
            let preset = if config.handbrake_preset_dvd.is_empty() {
                config.handbrake_preset.clone()
            } else {
                config.handbrake_preset_dvd.clone()
            };
            (preset, true)
        }
        _ => (config.handbrake_preset.clone(), false),
    }
}

/// Assemble the argv tail for HandBrakeCLI. Every externally influenced
/// string re-passes its allow-list validator before it can reach a spawn.
pub fn build_args(
    source: &Path,
    output: &Path,
    config: &Config,
    resolution: Option<Resolution>,
) -> Result<Vec<String>> {
    let encoder = validate_value("video_encoder", &config.video_encoder)?;
    let audio = validate_value("audio_encoder", &config.audio_encoder)?;
    let subtitle_mode = validate_value("subtitle_mode", &config.subtitle_mode)?;

    let (preset, upscale) = select_preset(config, resolution);
    let preset = validate_value("handbrake_preset", &preset)?;

    let mut args: Vec<String> = vec![
        "-i".into(),
        source.to_string_lossy().into_owned(),
        "-o".into(),
        output.to_string_lossy().into_owned(),
        "--encoder".into(),
        encoder,
        "-q".into(),
        config.video_quality.to_string(),
    ];

    if !config.handbrake_preset_file.is_empty() {
        args.push("--preset-import-file".into());
        args.push(config.handbrake_preset_file.clone());
    }

    if !preset.is_empty() {
        args.push("--preset".into());
        args.push(preset);
    }

    if upscale {
        args.push("--width".into());
        args.push("1280".into());
    }

    args.push("--aencoder".into());
    args.push(audio);

    match subtitle_mode.as_str() {
        "all" => args.push("--all-subtitles".into()),
        "first" => {
            args.push("--subtitle".into());
            args.push("1".into());
        }
        _ => {}
    }

    Ok(args)
}

/// Parse HandBrake's `Encoding: task 1 of 1, 45.23 %` progress dialect.
pub fn parse_progress(line: &str) -> Option<f64> {
    let caps = PERCENT_TOKEN.captures(line)?;
    caps[1].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn standard_command_shape() {
        let config = Config::default();
        let args = build_args(
            Path::new("/in/a.mkv"),
            Path::new("/out/a.mkv"),
            &config,
            Some(Resolution { width: 1920, height: 1080 }),
        )
        .unwrap();
        assert!(has_pair(&args, "-i", "/in/a.mkv"));
        assert!(has_pair(&args, "-o", "/out/a.mkv"));
        assert!(has_pair(&args, "--encoder", "nvenc_h265"));
        assert!(has_pair(&args, "-q", "22"));
        assert!(has_pair(&args, "--preset", "NVENC H.265 1080p"));
        assert!(has_pair(&args, "--aencoder", "copy"));
        assert!(args.iter().any(|a| a == "--all-subtitles"));
        assert!(!args.iter().any(|a| a == "--width"));
    }

    #[test]
    fn four_k_band_uses_4k_preset() {
        let config = Config::default();
        let args = build_args(
            Path::new("/in/a.mkv"),
            Path::new("/out/a.mkv"),
            &config,
            Some(Resolution { width: 3840, height: 2160 }),
        )
        .unwrap();
        assert!(has_pair(&args, "--preset", "H.265 NVENC 2160p 4K"));
    }

    #[test]
    fn dvd_band_upscales() {
        let mut config = Config::default();
        config
            .set_key("handbrake_preset_dvd", "NVENC H.265 720p")
            .unwrap();
        let args = build_args(
            Path::new("/in/a.mkv"),
            Path::new("/out/a.mkv"),
            &config,
            Some(Resolution { width: 720, height: 480 }),
        )
        .unwrap();
        assert!(has_pair(&args, "--preset", "NVENC H.265 720p"));
        assert!(has_pair(&args, "--width", "1280"));
    }

    #[test]
    fn empty_dvd_preset_falls_back_to_standard() {
        let config = Config::default();
        let (preset, upscale) =
            select_preset(&config, Some(Resolution { width: 720, height: 576 }));
        assert_eq!(preset, config.handbrake_preset);
        assert!(upscale);
    }

    #[test]
    fn unknown_resolution_uses_standard_preset() {
        let config = Config::default();
        let (preset, upscale) = select_preset(&config, None);
        assert_eq!(preset, config.handbrake_preset);
        assert!(!upscale);
    }

    #[test]
    fn preset_import_file_precedes_preset() {
        let mut config = Config::default();
        config
            .set_key("handbrake_preset_file", "/config/presets/custom.json")
            .unwrap();
        let args = build_args(Path::new("/in/a.mkv"), Path::new("/out/a.mkv"), &config, None)
            .unwrap();
        let import = args
            .iter()
            .position(|a| a == "--preset-import-file")
            .unwrap();
        let preset = args.iter().position(|a| a == "--preset").unwrap();
        assert!(import < preset);
    }

    #[test]
    fn subtitle_first_and_none() {
        let mut config = Config::default();
        config.set_key("subtitle_mode", "first").unwrap();
        let args = build_args(Path::new("/in/a.mkv"), Path::new("/out/a.mkv"), &config, None)
            .unwrap();
        assert!(has_pair(&args, "--subtitle", "1"));

        config.set_key("subtitle_mode", "none").unwrap();
        let args = build_args(Path::new("/in/a.mkv"), Path::new("/out/a.mkv"), &config, None)
            .unwrap();
        assert!(!args.iter().any(|a| a == "--all-subtitles" || a == "--subtitle"));
    }

    #[test]
    fn tampered_preset_is_refused() {
        let mut config = Config::default();
        config.handbrake_preset = "preset; rm -rf /".into();
        assert!(
            build_args(Path::new("/in/a.mkv"), Path::new("/out/a.mkv"), &config, None).is_err()
        );
    }

    #[test]
    fn progress_dialect() {
        assert_eq!(
            parse_progress("Encoding: task 1 of 1, 45.23 %"),
            Some(45.23)
        );
        assert_eq!(parse_progress("Encoding: task 1 of 1, 5 %"), Some(5.0));
        assert_eq!(parse_progress("muxing..."), None);
    }
}
