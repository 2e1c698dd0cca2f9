use crate::error::{ForgeError, Result};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static FORBIDDEN_FS_CHARS: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).unwrap());
static WHITESPACE_RUNS: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\s+").unwrap());

const DANGEROUS_PATTERNS: &[&str] = &["../", "..\\", "~", "${", "$ENV"];

/// Validates externally supplied path fragments against a set of allowed
/// base directories. Anything that smells like traversal is rejected before
/// the filesystem is consulted.
pub struct PathValidator {
    allowed_bases: Vec<PathBuf>,
}

impl PathValidator {
    pub fn new<I, P>(allowed_base_paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let allowed_bases = allowed_base_paths
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                p.canonicalize().unwrap_or_else(|_| p.to_path_buf())
            })
            .collect();
        Self { allowed_bases }
    }

    /// Resolve a relative fragment against the allowed bases. The result is
    /// canonicalized and must still live under the base it was joined to,
    /// so symlinks cannot escape.
    pub fn validate(&self, path_str: &str) -> Result<PathBuf> {
        if path_str.is_empty() {
            return Err(ForgeError::Validation("Path cannot be empty".into()));
        }

        let cleaned: String = path_str.chars().filter(|c| *c >= ' ').collect();

        for pattern in DANGEROUS_PATTERNS {
            if cleaned.contains(pattern) {
                return Err(ForgeError::Validation(format!(
                    "Path contains dangerous pattern: {pattern}"
                )));
            }
        }

        let candidate = Path::new(&cleaned);
        if candidate.is_absolute() {
            return Err(ForgeError::Validation(
                "Absolute paths are not allowed".into(),
            ));
        }

        for base in &self.allowed_bases {
            let joined = base.join(candidate);
            // A not-yet-existing target cannot be canonicalized; fall back
            // to the lexical join, which is safe because the fragment has
            // already been screened for traversal.
            let resolved = joined.canonicalize().unwrap_or(joined);
            if resolved.starts_with(base) {
                return Ok(resolved);
            }
        }

        Err(ForgeError::Validation(format!(
            "Path '{path_str}' is not within allowed directories"
        )))
    }

    /// `validate`, and the target must exist.
    pub fn validate_existing(&self, path_str: &str) -> Result<PathBuf> {
        let path = self.validate(path_str)?;
        if !path.exists() {
            return Err(ForgeError::SourceMissing(format!(
                "Path does not exist: {}",
                path.display()
            )));
        }
        Ok(path)
    }
}

/// Webhook titles are held to a stricter rule than general fragments: they
/// must be a single directory name, with no separators or parent refs.
pub fn validate_webhook_component(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ForgeError::Validation("invalid path".into()));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(ForgeError::Validation("invalid path".into()));
    }
    Ok(())
}

/// Clean a title for use as a filesystem path component: strip characters
/// forbidden on common filesystems, collapse whitespace, cap the length.
pub fn clean_title_for_filesystem(title: &str) -> String {
    let cleaned = FORBIDDEN_FS_CHARS.replace_all(title, "");
    let cleaned = WHITESPACE_RUNS.replace_all(&cleaned, " ");
    let mut cleaned = cleaned.trim().to_string();

    if cleaned.len() > 200 {
        let mut cut = 200;
        while !cleaned.is_char_boundary(cut) {
            cut -= 1;
        }
        cleaned.truncate(cut);
        cleaned = cleaned.trim().to_string();
    }

    if cleaned.is_empty() {
        cleaned = "untitled".to_string();
    }

    cleaned
}

#[derive(Debug, Clone, Copy)]
pub struct DiskSpace {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl DiskSpace {
    pub fn free_gb(&self) -> f64 {
        self.free_bytes as f64 / (1024u64.pow(3) as f64)
    }
}

/// Free/total bytes for the filesystem containing `path`. The disk whose
/// mount point is the longest prefix of the (canonicalized) path wins.
pub fn disk_space(path: &Path) -> Result<DiskSpace> {
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = sysinfo::Disks::new_with_refreshed_list();

    let best = disks
        .iter()
        .filter(|d| resolved.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len());

    match best {
        Some(disk) => Ok(DiskSpace {
            total_bytes: disk.total_space(),
            free_bytes: disk.available_space(),
        }),
        None => Err(ForgeError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("No mounted filesystem found for {}", resolved.display()),
        ))),
    }
}

/// Conservative output-size estimate used by the disk preflight.
pub fn estimate_transcode_size(source_bytes: u64) -> u64 {
    (source_bytes as f64 * 0.6) as u64
}

/// Verify the target filesystem has room for `required_bytes` while keeping
/// `minimum_free_gb` spare.
pub fn check_sufficient_disk_space(
    target: &Path,
    required_bytes: u64,
    minimum_free_gb: f64,
) -> Result<()> {
    let space = disk_space(target)?;
    let free_gb = space.free_gb();

    if free_gb < minimum_free_gb {
        return Err(ForgeError::ResourceExhausted(format!(
            "Insufficient disk space: {free_gb:.1}GB free, {minimum_free_gb}GB minimum required"
        )));
    }
    if required_bytes > space.free_bytes {
        return Err(ForgeError::ResourceExhausted(format!(
            "Insufficient disk space: {free_gb:.1}GB free, {:.1}GB required for transcode",
            required_bytes as f64 / (1024u64.pow(3) as f64)
        )));
    }
    Ok(())
}
