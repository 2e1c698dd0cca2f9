//! Waits for a rip directory to stop growing before any file is touched.
//! Total byte size across the tree is the quiescence proxy: the ripper has
//! no completion marker beyond "it stopped writing".

use crate::error::{ForgeError, Result};
use crate::shutdown::Shutdown;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy)]
pub struct StabilizeOptions {
    /// Consecutive unchanged-size time required to declare the source stable.
    pub window: Duration,
    pub poll_interval: Duration,
    pub hard_timeout: Duration,
}

impl Default for StabilizeOptions {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            hard_timeout: Duration::from_secs(3600),
        }
    }
}

impl StabilizeOptions {
    pub fn with_window_secs(window_secs: u64) -> Self {
        Self {
            window: Duration::from_secs(window_secs),
            ..Self::default()
        }
    }
}

/// Recursive byte total of all regular files under `path`.
pub fn total_size(path: &Path) -> u64 {
    if path.is_file() {
        return std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    }
    WalkDir::new(path)
        .into_iter()
        .flatten()
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Block until the source size has been unchanged for the whole window.
/// Returns the settled byte total.
pub async fn wait_for_stable(
    path: &Path,
    options: &StabilizeOptions,
    shutdown: &Shutdown,
) -> Result<u64> {
    if !path.exists() {
        return Err(ForgeError::SourceMissing(format!(
            "Source path does not exist: {}",
            path.display()
        )));
    }

    info!("Waiting for source to stabilize: {}", path.display());

    let start = Instant::now();
    let mut last_size: Option<u64> = None;
    let mut stable_for = Duration::ZERO;

    loop {
        let current = total_size(path);
        if last_size == Some(current) {
            stable_for += options.poll_interval;
        } else {
            debug!("Source size now {current} bytes");
            stable_for = Duration::ZERO;
            last_size = Some(current);
        }

        if stable_for >= options.window {
            info!("Source stabilized at {current} bytes");
            return Ok(current);
        }

        if start.elapsed() > options.hard_timeout {
            return Err(ForgeError::StabilizeTimeout(options.hard_timeout.as_secs()));
        }

        tokio::select! {
            _ = tokio::time::sleep(options.poll_interval) => {}
            _ = shutdown.triggered() => return Err(ForgeError::Shutdown),
        }
    }
}
