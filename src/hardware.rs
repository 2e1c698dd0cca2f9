use crate::config::Config;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const DEFAULT_RENDER_NODE: &str = "/dev/dri/renderD128";

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hardware path a backend drives. Derived from the requested encoder name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderFamily {
    Nvenc,
    Qsv,
    Vaapi,
    Amf,
    Software,
    Unknown,
}

impl EncoderFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderFamily::Nvenc => "nvenc",
            EncoderFamily::Qsv => "qsv",
            EncoderFamily::Vaapi => "vaapi",
            EncoderFamily::Amf => "amf",
            EncoderFamily::Software => "software",
            EncoderFamily::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EncoderFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which external tool runs the encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Handbrake,
    Ffmpeg,
}

/// Immutable capability map, probed once at startup.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub handbrake_present: bool,
    pub handbrake_nvenc: bool,
    pub ffmpeg_encoders: HashSet<String>,
    pub hw_device_present: bool,
    pub render_node: String,
}

impl Capabilities {
    pub fn has_ffmpeg_encoder(&self, name: &str) -> bool {
        self.ffmpeg_encoders.contains(name)
    }

    pub fn ffmpeg_nvenc(&self) -> bool {
        self.has_ffmpeg_encoder("hevc_nvenc") || self.has_ffmpeg_encoder("h264_nvenc")
    }

    pub fn ffmpeg_qsv(&self) -> bool {
        self.has_ffmpeg_encoder("hevc_qsv") || self.has_ffmpeg_encoder("h264_qsv")
    }

    pub fn ffmpeg_vaapi(&self) -> bool {
        self.has_ffmpeg_encoder("hevc_vaapi") || self.has_ffmpeg_encoder("h264_vaapi")
    }

    pub fn ffmpeg_amf(&self) -> bool {
        self.has_ffmpeg_encoder("hevc_amf") || self.has_ffmpeg_encoder("h264_amf")
    }

    pub fn ffmpeg_software(&self) -> bool {
        self.has_ffmpeg_encoder("libx265") || self.has_ffmpeg_encoder("libx264")
    }

    /// Summary for /health.
    pub fn gpu_support(&self) -> serde_json::Value {
        serde_json::json!({
            "handbrake_present": self.handbrake_present,
            "handbrake_nvenc": self.handbrake_nvenc,
            "ffmpeg_hevc_nvenc": self.has_ffmpeg_encoder("hevc_nvenc"),
            "ffmpeg_h264_nvenc": self.has_ffmpeg_encoder("h264_nvenc"),
            "ffmpeg_hevc_qsv": self.has_ffmpeg_encoder("hevc_qsv"),
            "ffmpeg_hevc_vaapi": self.has_ffmpeg_encoder("hevc_vaapi"),
            "ffmpeg_hevc_amf": self.has_ffmpeg_encoder("hevc_amf"),
            "ffmpeg_hevc_software": self.has_ffmpeg_encoder("libx265"),
            "hw_device_present": self.hw_device_present,
            "preferred_family": preferred_family(self).as_str(),
        })
    }
}

/// Probe installed encoder binaries and the render node. Any probe error
/// means "absent"; the result never changes for the process lifetime.
pub async fn probe(render_node: &str) -> Capabilities {
    let (handbrake_present, handbrake_nvenc) = probe_handbrake().await;
    let ffmpeg_encoders = probe_ffmpeg_encoders().await;
    let hw_device_present = Path::new(render_node).exists();

    let caps = Capabilities {
        handbrake_present,
        handbrake_nvenc,
        ffmpeg_encoders,
        hw_device_present,
        render_node: render_node.to_string(),
    };

    info!(
        "Encoder capabilities: handbrake_nvenc={}, ffmpeg encoders={}, render node {} {}",
        caps.handbrake_nvenc,
        caps.ffmpeg_encoders.len(),
        render_node,
        if hw_device_present { "present" } else { "absent" },
    );

    caps
}

async fn probe_handbrake() -> (bool, bool) {
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new("HandBrakeCLI").arg("--help").output(),
    )
    .await;

    match output {
        Ok(Ok(out)) => {
            let stdout = String::from_utf8_lossy(&out.stdout).to_lowercase();
            let stderr = String::from_utf8_lossy(&out.stderr).to_lowercase();
            (true, stdout.contains("nvenc") || stderr.contains("nvenc"))
        }
        _ => {
            debug!("HandBrakeCLI not available");
            (false, false)
        }
    }
}

async fn probe_ffmpeg_encoders() -> HashSet<String> {
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new("ffmpeg")
            .args(["-hide_banner", "-encoders"])
            .output(),
    )
    .await;

    let out = match output {
        Ok(Ok(out)) => out,
        _ => {
            debug!("ffmpeg not available");
            return HashSet::new();
        }
    };

    parse_encoder_list(&String::from_utf8_lossy(&out.stdout))
}

/// Parse `ffmpeg -encoders` output: a six-character flag column followed by
/// the encoder name. Only video encoders matter here.
fn parse_encoder_list(stdout: &str) -> HashSet<String> {
    let mut encoders = HashSet::new();
    for line in stdout.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('-') || trimmed.starts_with("Encoders:") {
            continue;
        }
        let mut parts = trimmed.split_whitespace();
        let flags = match parts.next() {
            Some(flags) if flags.len() == 6 => flags,
            _ => continue,
        };
        let name = match parts.next() {
            Some(name) => name,
            None => continue,
        };
        if flags.starts_with('V') {
            encoders.insert(name.to_string());
        }
    }
    encoders
}

/// Derive the hardware family from the requested encoder name.
pub fn family_for_encoder(encoder: &str) -> EncoderFamily {
    let lower = encoder.to_ascii_lowercase();
    if lower.contains("nvenc") {
        EncoderFamily::Nvenc
    } else if lower.contains("qsv") {
        EncoderFamily::Qsv
    } else if lower.contains("vaapi") {
        EncoderFamily::Vaapi
    } else if lower.contains("amf") {
        EncoderFamily::Amf
    } else if lower.contains("x264") || lower.contains("x265") {
        EncoderFamily::Software
    } else {
        EncoderFamily::Unknown
    }
}

/// Map (requested encoder, capabilities) to a concrete backend and family.
pub fn select_backend(encoder: &str, caps: &Capabilities) -> (Backend, EncoderFamily) {
    let family = family_for_encoder(encoder);

    match family {
        EncoderFamily::Nvenc => {
            if caps.handbrake_nvenc {
                info!("Using HandBrake with NVENC");
                (Backend::Handbrake, family)
            } else if caps.ffmpeg_nvenc() {
                info!("Using FFmpeg with NVENC (HandBrake NVENC not available)");
                (Backend::Ffmpeg, family)
            } else {
                warn!("NVENC not detected - will attempt FFmpeg anyway");
                (Backend::Ffmpeg, family)
            }
        }
        EncoderFamily::Qsv | EncoderFamily::Vaapi => {
            if !caps.hw_device_present {
                warn!(
                    "{} requested but render node {} is absent",
                    family, caps.render_node
                );
            }
            (Backend::Ffmpeg, family)
        }
        EncoderFamily::Amf | EncoderFamily::Software => (Backend::Ffmpeg, family),
        EncoderFamily::Unknown => {
            if !caps.handbrake_present {
                warn!("Unrecognized encoder '{encoder}' and HandBrakeCLI is absent");
            }
            (Backend::Handbrake, family)
        }
    }
}

/// Best available family in priority order; feeds the auto-resolved config
/// defaults for keys with no user override.
pub fn preferred_family(caps: &Capabilities) -> EncoderFamily {
    if caps.handbrake_nvenc || caps.ffmpeg_nvenc() {
        EncoderFamily::Nvenc
    } else if caps.ffmpeg_qsv() && caps.hw_device_present {
        EncoderFamily::Qsv
    } else if caps.ffmpeg_vaapi() && caps.hw_device_present {
        EncoderFamily::Vaapi
    } else if caps.ffmpeg_amf() {
        EncoderFamily::Amf
    } else {
        EncoderFamily::Software
    }
}

/// Family-appropriate defaults for the encoder name and the banded preset
/// names. Only keys the user never overrode are touched.
pub fn apply_family_defaults(
    config: &mut Config,
    caps: &Capabilities,
    overridden: &HashSet<String>,
) {
    let family = preferred_family(caps);
    let (encoder, preset, preset_4k, preset_dvd) = match family {
        EncoderFamily::Nvenc => (
            "nvenc_h265",
            "NVENC H.265 1080p",
            "H.265 NVENC 2160p 4K",
            "NVENC H.265 720p",
        ),
        EncoderFamily::Qsv => (
            "qsv_h265",
            "H.265 QSV 1080p",
            "H.265 QSV 2160p 4K",
            "H.265 QSV 720p",
        ),
        EncoderFamily::Vaapi => (
            "vaapi_h265",
            "H.265 VAAPI 1080p",
            "H.265 VAAPI 2160p 4K",
            "H.265 VAAPI 720p",
        ),
        EncoderFamily::Amf => (
            "amf_h265",
            "H.265 AMF 1080p",
            "H.265 AMF 2160p 4K",
            "H.265 AMF 720p",
        ),
        EncoderFamily::Software | EncoderFamily::Unknown => (
            "x265",
            "H.265 MKV 1080p30",
            "H.265 MKV 2160p60 4K",
            "H.265 MKV 720p30",
        ),
    };

    let defaults = [
        ("video_encoder", encoder),
        ("handbrake_preset", preset),
        ("handbrake_preset_4k", preset_4k),
        ("handbrake_preset_dvd", preset_dvd),
    ];

    for (key, value) in defaults {
        if overridden.contains(key) {
            continue;
        }
        if let Err(e) = config.set_key(key, value) {
            warn!("Failed to apply {family} default for {key}: {e}");
        } else {
            debug!("Auto-resolved {key} = {value} for {family}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps_with(encoders: &[&str]) -> Capabilities {
        Capabilities {
            handbrake_present: true,
            handbrake_nvenc: false,
            ffmpeg_encoders: encoders.iter().map(|s| s.to_string()).collect(),
            hw_device_present: true,
            render_node: DEFAULT_RENDER_NODE.to_string(),
        }
    }

    #[test]
    fn family_derivation() {
        assert_eq!(family_for_encoder("nvenc_h265"), EncoderFamily::Nvenc);
        assert_eq!(family_for_encoder("hevc_nvenc"), EncoderFamily::Nvenc);
        assert_eq!(family_for_encoder("qsv_h264"), EncoderFamily::Qsv);
        assert_eq!(family_for_encoder("vaapi_h265"), EncoderFamily::Vaapi);
        assert_eq!(family_for_encoder("amf_h264"), EncoderFamily::Amf);
        assert_eq!(family_for_encoder("x265"), EncoderFamily::Software);
        assert_eq!(family_for_encoder("x264"), EncoderFamily::Software);
        assert_eq!(family_for_encoder("mpeg2"), EncoderFamily::Unknown);
    }

    #[test]
    fn nvenc_prefers_handbrake_when_flagged() {
        let mut caps = caps_with(&["hevc_nvenc"]);
        caps.handbrake_nvenc = true;
        assert_eq!(
            select_backend("nvenc_h265", &caps),
            (Backend::Handbrake, EncoderFamily::Nvenc)
        );
    }

    #[test]
    fn nvenc_falls_back_to_ffmpeg() {
        let caps = caps_with(&["hevc_nvenc"]);
        assert_eq!(
            select_backend("nvenc_h265", &caps),
            (Backend::Ffmpeg, EncoderFamily::Nvenc)
        );
        // Neither flag set: still attempt ffmpeg.
        let caps = caps_with(&[]);
        assert_eq!(
            select_backend("nvenc_h265", &caps),
            (Backend::Ffmpeg, EncoderFamily::Nvenc)
        );
    }

    #[test]
    fn non_nvenc_families_use_ffmpeg() {
        let caps = caps_with(&["hevc_qsv", "hevc_vaapi", "hevc_amf", "libx265"]);
        assert_eq!(select_backend("qsv_h265", &caps).0, Backend::Ffmpeg);
        assert_eq!(select_backend("vaapi_h265", &caps).0, Backend::Ffmpeg);
        assert_eq!(select_backend("amf_h265", &caps).0, Backend::Ffmpeg);
        assert_eq!(select_backend("x265", &caps).0, Backend::Ffmpeg);
    }

    #[test]
    fn unknown_encoder_defaults_to_handbrake() {
        let caps = caps_with(&[]);
        assert_eq!(
            select_backend("mystery", &caps),
            (Backend::Handbrake, EncoderFamily::Unknown)
        );
    }

    #[test]
    fn family_priority_order() {
        let mut caps = caps_with(&["hevc_nvenc", "hevc_qsv", "hevc_vaapi", "hevc_amf", "libx265"]);
        assert_eq!(preferred_family(&caps), EncoderFamily::Nvenc);
        caps.ffmpeg_encoders.remove("hevc_nvenc");
        assert_eq!(preferred_family(&caps), EncoderFamily::Qsv);
        caps.ffmpeg_encoders.remove("hevc_qsv");
        assert_eq!(preferred_family(&caps), EncoderFamily::Vaapi);
        caps.ffmpeg_encoders.remove("hevc_vaapi");
        assert_eq!(preferred_family(&caps), EncoderFamily::Amf);
        caps.ffmpeg_encoders.remove("hevc_amf");
        assert_eq!(preferred_family(&caps), EncoderFamily::Software);
    }

    #[test]
    fn qsv_requires_render_node_for_priority() {
        let mut caps = caps_with(&["hevc_qsv"]);
        caps.hw_device_present = false;
        assert_eq!(preferred_family(&caps), EncoderFamily::Software);
    }

    #[test]
    fn defaults_respect_overrides() {
        let mut config = Config::default();
        config.set_key("video_encoder", "x264").unwrap();
        let caps = {
            let mut c = caps_with(&["hevc_nvenc"]);
            c.handbrake_nvenc = true;
            c
        };
        let overridden: HashSet<String> = ["video_encoder".to_string()].into();
        apply_family_defaults(&mut config, &caps, &overridden);
        // Overridden key untouched; preset keys auto-resolved.
        assert_eq!(config.video_encoder, "x264");
        assert_eq!(config.handbrake_preset, "NVENC H.265 1080p");
        assert_eq!(config.handbrake_preset_dvd, "NVENC H.265 720p");
    }

    #[test]
    fn encoder_list_parsing() {
        let listing = "Encoders:\n V..... = Video\n ------\n V....D libx264  H.264\n V....D hevc_nvenc  NVIDIA NVENC hevc encoder\n A....D aac  AAC audio\n";
        let encoders = parse_encoder_list(listing);
        assert!(encoders.contains("libx264"));
        assert!(encoders.contains("hevc_nvenc"));
        assert!(!encoders.contains("aac"));
    }
}
