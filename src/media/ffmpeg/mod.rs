//! FFmpeg command synthesis and progress parsing for the general encoder
//! backend. Each hardware family contributes its own flag set.

mod amf;
mod nvenc;
mod qsv;
mod software;
mod vaapi;

use crate::config::{validate_value, Config};
use crate::error::{ForgeError, Result};
use crate::hardware::EncoderFamily;
use crate::media::Resolution;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

static TIME_TOKEN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"time=(\d+):(\d+):(\d+\.?\d*)").unwrap());

pub struct FfmpegCommandBuilder<'a> {
    source: &'a Path,
    output: &'a Path,
    family: EncoderFamily,
    resolution: Option<Resolution>,
    render_node: &'a str,
}

impl<'a> FfmpegCommandBuilder<'a> {
    pub fn new(source: &'a Path, output: &'a Path, family: EncoderFamily) -> Self {
        Self {
            source,
            output,
            family,
            resolution: None,
            render_node: crate::hardware::DEFAULT_RENDER_NODE,
        }
    }

    pub fn with_resolution(mut self, resolution: Option<Resolution>) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_render_node(mut self, render_node: &'a str) -> Self {
        self.render_node = render_node;
        self
    }

    /// Assemble the argv tail (everything after the program name). Every
    /// externally influenced string re-passes its allow-list validator
    /// before it can reach a process spawn.
    pub fn build(self, config: &Config) -> Result<Vec<String>> {
        let encoder = validate_value("video_encoder", &config.video_encoder)?;
        let audio = validate_value("audio_encoder", &config.audio_encoder)?;
        let subtitle_mode = validate_value("subtitle_mode", &config.subtitle_mode)?;
        let quality = config.video_quality;
        // "nvenc_h265", "qsv_h265", "x265", "hevc_nvenc" all mean HEVC.
        let hevc = encoder.contains("265") || encoder.contains("hevc");

        let mut args: Vec<String> = vec!["-y".into(), "-hide_banner".into()];

        // Input-side hardware acceleration.
        match self.family {
            EncoderFamily::Nvenc => nvenc::input_args(&mut args),
            EncoderFamily::Qsv => qsv::input_args(&mut args),
            EncoderFamily::Vaapi => vaapi::input_args(&mut args, self.render_node),
            EncoderFamily::Amf | EncoderFamily::Software => {}
            EncoderFamily::Unknown => {
                return Err(ForgeError::Validation(format!(
                    "No ffmpeg mapping for encoder family of '{encoder}'"
                )))
            }
        }

        args.push("-i".into());
        args.push(self.source.to_string_lossy().into_owned());

        match self.family {
            EncoderFamily::Nvenc => nvenc::video_args(&mut args, hevc, quality),
            EncoderFamily::Qsv => qsv::video_args(&mut args, hevc, quality),
            EncoderFamily::Vaapi => vaapi::video_args(&mut args, hevc, quality),
            EncoderFamily::Amf => amf::video_args(&mut args, hevc, quality),
            EncoderFamily::Software => software::video_args(&mut args, hevc, quality),
            EncoderFamily::Unknown => unreachable!(),
        }

        // Sub-720p sources are upscaled with the filter matching the
        // family's frame memory space.
        if self.resolution.map(|r| r.needs_upscale()).unwrap_or(false) {
            let filter = match self.family {
                EncoderFamily::Nvenc => nvenc::scale_filter(),
                EncoderFamily::Qsv => qsv::scale_filter(),
                EncoderFamily::Vaapi => vaapi::scale_filter(),
                EncoderFamily::Amf => amf::scale_filter(),
                EncoderFamily::Software => software::scale_filter(),
                EncoderFamily::Unknown => unreachable!(),
            };
            args.push("-vf".into());
            args.push(filter.into());
        }

        args.push("-c:a".into());
        args.push(audio);

        match subtitle_mode.as_str() {
            "all" => {
                args.push("-c:s".into());
                args.push("copy".into());
            }
            "none" => args.push("-sn".into()),
            _ => {
                // "first": map the first subtitle stream if one exists.
                args.push("-map".into());
                args.push("0:s:0?".into());
                args.push("-c:s".into());
                args.push("copy".into());
            }
        }

        args.push(self.output.to_string_lossy().into_owned());
        Ok(args)
    }
}

/// A progress sample parsed from ffmpeg's status lines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FfmpegProgress {
    pub time_seconds: f64,
}

impl FfmpegProgress {
    /// Parse the `time=HH:MM:SS.xx` token from an ffmpeg status line.
    pub fn parse_line(line: &str) -> Option<Self> {
        let caps = TIME_TOKEN.captures(line)?;
        let hours: f64 = caps[1].parse().ok()?;
        let minutes: f64 = caps[2].parse().ok()?;
        let seconds: f64 = caps[3].parse().ok()?;
        Some(Self {
            time_seconds: hours * 3600.0 + minutes * 60.0 + seconds,
        })
    }

    pub fn percentage(&self, total_duration: f64) -> Option<f64> {
        if total_duration <= 0.0 {
            return None;
        }
        Some((self.time_seconds / total_duration * 100.0).min(100.0))
    }
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Source duration in seconds via ffprobe; None means the encode runs with
/// progress pinned at its pre-file floor.
pub async fn probe_duration(path: &Path) -> Option<f64> {
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .output(),
    )
    .await;

    match output {
        Ok(Ok(out)) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .trim()
            .parse::<f64>()
            .ok(),
        _ => {
            debug!("ffprobe duration failed for {}", path.display());
            None
        }
    }
}

/// Source resolution via ffprobe; None disables resolution-dependent
/// scaling and preset banding for the file.
pub async fn probe_resolution(path: &Path) -> Option<Resolution> {
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height",
                "-of",
                "csv=s=x:p=0",
            ])
            .arg(path)
            .output(),
    )
    .await;

    match output {
        Ok(Ok(out)) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout);
            let mut parts = text.trim().split('x');
            let width: u32 = parts.next()?.parse().ok()?;
            let height: u32 = parts.next()?.parse().ok()?;
            Some(Resolution { width, height })
        }
        _ => {
            debug!("ffprobe resolution failed for {}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(encoder: &str) -> Config {
        let mut config = Config::default();
        config.set_key("video_encoder", encoder).unwrap();
        config
    }

    fn build(family: EncoderFamily, config: &Config, res: Option<Resolution>) -> Vec<String> {
        FfmpegCommandBuilder::new(Path::new("/in/a.mkv"), Path::new("/out/a.mkv"), family)
            .with_resolution(res)
            .build(config)
            .unwrap()
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn nvenc_command_shape() {
        let args = build(EncoderFamily::Nvenc, &config_with("nvenc_h265"), None);
        assert!(has_pair(&args, "-hwaccel", "cuda"));
        assert!(has_pair(&args, "-c:v", "hevc_nvenc"));
        assert!(has_pair(&args, "-preset", "p4"));
        assert!(has_pair(&args, "-cq", "22"));
        assert!(has_pair(&args, "-b:v", "0"));
        assert!(has_pair(&args, "-c:a", "copy"));
        assert!(has_pair(&args, "-c:s", "copy"));
        assert_eq!(args.last().unwrap(), "/out/a.mkv");
    }

    #[test]
    fn nvenc_h264_variant() {
        let args = build(EncoderFamily::Nvenc, &config_with("nvenc_h264"), None);
        assert!(has_pair(&args, "-c:v", "h264_nvenc"));
    }

    #[test]
    fn vaapi_names_the_render_node() {
        let args = build(EncoderFamily::Vaapi, &config_with("vaapi_h265"), None);
        assert!(has_pair(&args, "-hwaccel", "vaapi"));
        assert!(has_pair(&args, "-vaapi_device", "/dev/dri/renderD128"));
        assert!(has_pair(&args, "-c:v", "hevc_vaapi"));
        assert!(has_pair(&args, "-rc_mode", "CQP"));
        assert!(has_pair(&args, "-qp", "22"));
    }

    #[test]
    fn qsv_and_amf_rate_control() {
        let args = build(EncoderFamily::Qsv, &config_with("qsv_h265"), None);
        assert!(has_pair(&args, "-global_quality", "22"));

        let args = build(EncoderFamily::Amf, &config_with("amf_h265"), None);
        assert!(has_pair(&args, "-rc", "cqp"));
        assert!(has_pair(&args, "-qp_i", "22"));
        assert!(has_pair(&args, "-qp_p", "22"));
    }

    #[test]
    fn software_uses_crf() {
        let args = build(EncoderFamily::Software, &config_with("x265"), None);
        assert!(has_pair(&args, "-c:v", "libx265"));
        assert!(has_pair(&args, "-crf", "22"));
        assert!(has_pair(&args, "-preset", "medium"));

        let args = build(EncoderFamily::Software, &config_with("x264"), None);
        assert!(has_pair(&args, "-c:v", "libx264"));
    }

    #[test]
    fn dvd_sources_get_family_matched_scaling() {
        let dvd = Some(Resolution { width: 720, height: 480 });
        let args = build(EncoderFamily::Software, &config_with("x265"), dvd);
        assert!(has_pair(&args, "-vf", "scale=1280:-2"));

        let args = build(EncoderFamily::Nvenc, &config_with("nvenc_h265"), dvd);
        assert!(has_pair(&args, "-vf", "scale_cuda=1280:-2"));

        let args = build(EncoderFamily::Vaapi, &config_with("vaapi_h265"), dvd);
        assert!(has_pair(&args, "-vf", "scale_vaapi=w=1280:h=-2"));

        let args = build(EncoderFamily::Qsv, &config_with("qsv_h265"), dvd);
        assert!(has_pair(&args, "-vf", "vpp_qsv=w=1280:h=-2"));

        let args = build(EncoderFamily::Amf, &config_with("amf_h265"), dvd);
        assert!(has_pair(&args, "-vf", "scale=1280:-2"));
    }

    #[test]
    fn hd_sources_are_not_scaled() {
        let hd = Some(Resolution { width: 1920, height: 1080 });
        let args = build(EncoderFamily::Nvenc, &config_with("nvenc_h265"), hd);
        assert!(!args.iter().any(|a| a == "-vf"));

        let args = build(EncoderFamily::Nvenc, &config_with("nvenc_h265"), None);
        assert!(!args.iter().any(|a| a == "-vf"));
    }

    #[test]
    fn subtitle_modes() {
        let mut config = config_with("nvenc_h265");
        config.set_key("subtitle_mode", "none").unwrap();
        let args = build(EncoderFamily::Nvenc, &config, None);
        assert!(args.iter().any(|a| a == "-sn"));

        config.set_key("subtitle_mode", "first").unwrap();
        let args = build(EncoderFamily::Nvenc, &config, None);
        assert!(has_pair(&args, "-map", "0:s:0?"));
        assert!(has_pair(&args, "-c:s", "copy"));
    }

    #[test]
    fn audio_encoder_passthrough_and_reencode() {
        let mut config = config_with("nvenc_h265");
        config.set_key("audio_encoder", "aac").unwrap();
        let args = build(EncoderFamily::Nvenc, &config, None);
        assert!(has_pair(&args, "-c:a", "aac"));
    }

    #[test]
    fn tampered_config_is_refused() {
        let mut config = config_with("nvenc_h265");
        // Simulate a value that bypassed set_key validation.
        config.audio_encoder = "aac; rm -rf /".into();
        let result = FfmpegCommandBuilder::new(
            Path::new("/in/a.mkv"),
            Path::new("/out/a.mkv"),
            EncoderFamily::Nvenc,
        )
        .build(&config);
        assert!(result.is_err());
    }

    #[test]
    fn time_token_parsing() {
        let p = FfmpegProgress::parse_line(
            "frame=  100 fps=25 q=28.0 size=2048kB time=00:01:23.45 bitrate=1500kbits/s",
        )
        .unwrap();
        assert!((p.time_seconds - 83.45).abs() < 0.01);
        assert_eq!(FfmpegProgress::parse_line("no progress here"), None);
    }

    #[test]
    fn percentage_needs_duration() {
        let p = FfmpegProgress { time_seconds: 30.0 };
        assert_eq!(p.percentage(120.0), Some(25.0));
        assert_eq!(p.percentage(0.0), None);
        // Never exceeds 100 even when time overshoots the probed duration.
        let p = FfmpegProgress { time_seconds: 500.0 };
        assert_eq!(p.percentage(120.0), Some(100.0));
    }
}
