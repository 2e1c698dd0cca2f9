pub mod ffmpeg;
pub mod handbrake;
pub mod pipeline;
pub mod resolver;
pub mod stabilizer;

use std::path::{Path, PathBuf};

pub const VIDEO_EXTENSIONS: &[&str] = &["mkv"];
pub const AUDIO_EXTENSIONS: &[&str] = &["flac", "mp3", "ogg", "wav", "m4a"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Sub-720p sources get upscaled to 1280 wide.
    pub fn needs_upscale(&self) -> bool {
        self.height > 0 && self.height < 720
    }

    pub fn is_4k(&self) -> bool {
        self.height > 1080
    }
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn is_video_file(path: &Path) -> bool {
    has_extension(path, VIDEO_EXTENSIONS)
}

pub fn is_audio_file(path: &Path) -> bool {
    has_extension(path, AUDIO_EXTENSIONS)
}

/// Whether a directory directly contains at least one recognized media file.
pub fn contains_media_files(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        let path = entry.path();
        path.is_file() && (is_video_file(&path) || is_audio_file(&path))
    })
}

/// Video files directly under `source`, largest first. A single video file
/// passed directly is returned as-is.
pub fn list_video_files(source: &Path) -> std::io::Result<Vec<PathBuf>> {
    if source.is_file() {
        return Ok(if is_video_file(source) {
            vec![source.to_path_buf()]
        } else {
            Vec::new()
        });
    }

    let mut files: Vec<(PathBuf, u64)> = Vec::new();
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && is_video_file(&path) {
            let size = entry.metadata()?.len();
            files.push((path, size));
        }
    }
    files.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(files.into_iter().map(|(path, _)| path).collect())
}

/// Audio files directly under `source`, lexicographic order.
pub fn list_audio_files(source: &Path) -> std::io::Result<Vec<PathBuf>> {
    if source.is_file() {
        return Ok(if is_audio_file(source) {
            vec![source.to_path_buf()]
        } else {
            Vec::new()
        });
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(source)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_audio_file(path))
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_checks_are_case_insensitive() {
        assert!(is_video_file(Path::new("a.mkv")));
        assert!(is_video_file(Path::new("a.MKV")));
        assert!(!is_video_file(Path::new("a.mp4")));
        assert!(is_audio_file(Path::new("a.FLAC")));
        assert!(!is_audio_file(Path::new("a")));
    }

    #[test]
    fn video_listing_sorts_by_size_descending() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("small.mkv"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("large.mkv"), vec![0u8; 1000]).unwrap();
        std::fs::write(dir.path().join("mid.mkv"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("ignored.txt"), b"x").unwrap();

        let files = list_video_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["large.mkv", "mid.mkv", "small.mkv"]);
    }

    #[test]
    fn audio_listing_sorts_lexicographically() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("track02.flac"), b"b").unwrap();
        std::fs::write(dir.path().join("track01.flac"), b"a").unwrap();
        std::fs::write(dir.path().join("track03.mp3"), b"c").unwrap();

        let files = list_audio_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["track01.flac", "track02.flac", "track03.mp3"]);
    }

    #[test]
    fn single_file_sources() {
        let dir = tempfile::tempdir().unwrap();
        let mkv = dir.path().join("movie.mkv");
        std::fs::write(&mkv, b"x").unwrap();
        assert_eq!(list_video_files(&mkv).unwrap(), vec![mkv.clone()]);
        assert!(list_audio_files(&mkv).unwrap().is_empty());
    }

    #[test]
    fn resolution_bands() {
        assert!(Resolution { width: 720, height: 480 }.needs_upscale());
        assert!(!Resolution { width: 1280, height: 720 }.needs_upscale());
        assert!(!Resolution { width: 1920, height: 1080 }.needs_upscale());
        assert!(Resolution { width: 3840, height: 2160 }.is_4k());
        assert!(!Resolution { width: 1920, height: 1080 }.is_4k());
    }
}
