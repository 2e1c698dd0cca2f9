//! Maps a webhook title to the directory the ripper actually wrote.
//! Rippers file their output under layout-specific subfolders and may
//! append disc labels, so the literal `raw_root/title` path is a guess.

use crate::media::contains_media_files;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

/// Subordinate folders common ripper layouts use under the raw root.
const RIPPER_SUBDIRS: &[&str] = &["unidentified", "movies", "tv"];

/// Locate the real source directory for a title. Falls back to the guessed
/// path unchanged so the stabilizer can report a precise error.
pub fn resolve_source_dir(raw_root: &Path, guessed: &Path) -> PathBuf {
    if guessed.is_dir() && contains_media_files(guessed) {
        return guessed.to_path_buf();
    }
    if guessed.is_file() {
        return guessed.to_path_buf();
    }

    let title = match guessed.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return guessed.to_path_buf(),
    };

    let mut best: Option<(PathBuf, SystemTime)> = None;
    for subdir in RIPPER_SUBDIRS {
        let dir = raw_root.join(subdir);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(title) || !contains_media_files(&path) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            debug!("Resolver candidate: {}", path.display());
            match &best {
                Some((_, best_time)) if *best_time >= modified => {}
                _ => best = Some((path, modified)),
            }
        }
    }

    match best {
        Some((path, _)) => {
            info!(
                "Resolved source '{}' to {}",
                guessed.display(),
                path.display()
            );
            path
        }
        None => guessed.to_path_buf(),
    }
}
