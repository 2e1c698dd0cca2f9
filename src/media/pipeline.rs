//! Per-job pipeline: claim, resolve, stabilize, discover, stage, encode,
//! move out, finalize. The scratch directory is removed on every exit path;
//! the raw source is removed only on success.

use crate::config::Config;
use crate::db::Db;
use crate::error::{ForgeError, Result};
use crate::hardware::{select_backend, Backend, Capabilities};
use crate::media::{self, ffmpeg, handbrake, resolver, stabilizer};
use crate::paths;
use crate::shutdown::Shutdown;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

static TV_EPISODE_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?i)(s\d+e\d+|_s\d+\b)").unwrap());

/// Hard ceiling for any single encoder invocation (10 hours).
const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(36_000);
const STDERR_TAIL_LINES: usize = 10;

/// Which progress dialect the spawned encoder speaks.
#[derive(Debug, Clone, Copy)]
enum ProgressDialect {
    /// HandBrake: `Encoding: task 1 of 1, 45.23 %` on stdout.
    HandbrakePercent,
    /// ffmpeg: `time=HH:MM:SS.xx` on stderr, scaled by the probed duration.
    FfmpegTime { duration: Option<f64> },
}

/// Rate limit for Catalog progress writes: the integer floor must advance
/// by at least 5 points AND at least 10 s must have passed since the last
/// write. File-boundary and terminal writes bypass this.
pub struct ProgressThrottle {
    last_value: f64,
    last_write: Option<Instant>,
    min_step: f64,
    min_interval: Duration,
}

impl ProgressThrottle {
    pub fn new(initial: f64) -> Self {
        Self {
            last_value: initial,
            last_write: None,
            min_step: 5.0,
            min_interval: Duration::from_secs(10),
        }
    }

    pub fn should_write(&mut self, value: f64) -> bool {
        let advanced = value.floor() - self.last_value.floor() >= self.min_step;
        let waited = self
            .last_write
            .map(|at| at.elapsed() >= self.min_interval)
            .unwrap_or(true);
        if advanced && waited {
            self.last_value = value;
            self.last_write = Some(Instant::now());
            true
        } else {
            false
        }
    }
}

pub struct JobPipeline {
    db: Arc<Db>,
    config: Config,
    caps: Arc<Capabilities>,
    shutdown: Shutdown,
}

impl JobPipeline {
    /// `config` is a snapshot taken at dequeue time so a PATCH mid-encode
    /// cannot change a running job's behavior.
    pub fn new(db: Arc<Db>, config: Config, caps: Arc<Capabilities>, shutdown: Shutdown) -> Self {
        Self {
            db,
            config,
            caps,
            shutdown,
        }
    }

    /// Drive one job to a terminal state. Ok covers both COMPLETED and
    /// recorded FAILED; only shutdown and store errors propagate.
    pub async fn process(&self, job_id: i64) -> Result<()> {
        if !self.db.claim_job(job_id).await? {
            info!("[job {job_id}] not claimable (gone or not pending), skipping");
            return Ok(());
        }
        let job = self
            .db
            .get_job(job_id)
            .await?
            .ok_or_else(|| ForgeError::NotFound(format!("Job {job_id} not found")))?;

        let work_dir = PathBuf::from(&self.config.work_path).join(format!("job-{job_id}"));

        let result = self.run(&job, &work_dir).await;

        if work_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
                warn!("[job {job_id}] failed to remove work dir: {e}");
            }
        }

        match result {
            Ok(()) => Ok(()),
            Err(ForgeError::Shutdown) => {
                // Leave the row PROCESSING; next-start recovery demotes it
                // to PENDING and the attempt restarts from the beginning.
                info!("[job {job_id}] interrupted by shutdown");
                Err(ForgeError::Shutdown)
            }
            Err(e) => {
                error!("[job {job_id}] failed: {e}");
                self.db.mark_failed(job_id, &e.to_string()).await?;
                Ok(())
            }
        }
    }

    async fn run(&self, job: &crate::db::Job, work_dir: &Path) -> Result<()> {
        let job_id = job.id;
        info!("[job {job_id}] processing '{}'", job.title);

        // The resolved path is used for this attempt only and never written
        // back, so a retry re-resolves against the current filesystem.
        let raw_root = Path::new(&self.config.raw_path);
        let source = resolver::resolve_source_dir(raw_root, Path::new(&job.source_path));

        let stabilize =
            stabilizer::StabilizeOptions::with_window_secs(self.config.stabilize_seconds as u64);
        stabilizer::wait_for_stable(&source, &stabilize, &self.shutdown).await?;

        let video_files = media::list_video_files(&source)?;
        if video_files.is_empty() {
            let audio_files = media::list_audio_files(&source)?;
            if audio_files.is_empty() {
                return Err(ForgeError::SourceMissing(format!(
                    "No media files found in {}",
                    source.display()
                )));
            }
            return self.passthrough_audio(job_id, &job.title, &source, &audio_files).await;
        }

        self.db
            .set_total_tracks(job_id, video_files.len() as i64)
            .await?;
        info!("[job {job_id}] found {} video files", video_files.len());

        let video_type = classify_video_type(&job.title, &source);
        self.db.set_video_type(job_id, video_type).await?;

        let source_bytes: u64 = video_files
            .iter()
            .filter_map(|f| std::fs::metadata(f).ok())
            .map(|m| m.len())
            .sum();
        let estimated_output = paths::estimate_transcode_size(source_bytes);
        self.preflight_disk(Path::new(&self.config.work_path), source_bytes + estimated_output)?;
        self.preflight_disk(Path::new(&self.config.completed_path), estimated_output)?;

        // Stage into local scratch; the raw root may be network-mounted.
        let local_source = work_dir.join("source");
        let local_output = work_dir.join("output");
        tokio::fs::create_dir_all(&local_source).await?;
        tokio::fs::create_dir_all(&local_output).await?;
        for file in &video_files {
            let name = file
                .file_name()
                .ok_or_else(|| ForgeError::SourceMissing(format!("Bad file name: {}", file.display())))?;
            tokio::fs::copy(file, local_source.join(name)).await?;
            if self.shutdown.is_triggered() {
                return Err(ForgeError::Shutdown);
            }
        }

        let subdir = if video_type == "tv" {
            &self.config.tv_subdir
        } else {
            &self.config.movies_subdir
        };
        let final_dir = Path::new(&self.config.completed_path)
            .join(subdir)
            .join(paths::clean_title_for_filesystem(&job.title));

        // Rediscover under the local copy; the largest staged file is the
        // main feature.
        let staged = media::list_video_files(&local_source)?;
        if let Some(main_feature) = staged.first() {
            if let Some(name) = main_feature.file_name().and_then(|n| n.to_str()) {
                self.db.set_main_feature_file(job_id, name).await?;
            }
        }

        let (backend, family) = select_backend(&self.config.video_encoder, &self.caps);
        debug!("[job {job_id}] backend {backend:?}, family {family}");

        let total = staged.len();
        for (index, file) in staged.iter().enumerate() {
            let floor = ((index as f64 / total as f64) * 100.0).floor();
            self.db.update_progress(job_id, floor).await?;

            let name = file.file_name().and_then(|n| n.to_str()).unwrap_or("?");
            info!(
                "[job {job_id}] transcoding [{}/{total}]: {name}{}",
                index + 1,
                if index == 0 { " (main feature)" } else { "" }
            );

            // Resolution probe failure means "unknown": no scaling, no
            // preset banding for this file.
            let resolution = ffmpeg::probe_resolution(file).await;

            let stem = file
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("track");
            let output = local_output.join(format!("{stem}.{}", self.config.output_extension));

            match backend {
                Backend::Handbrake => {
                    let args = handbrake::build_args(file, &output, &self.config, resolution)?;
                    self.run_encoder(
                        job_id,
                        "HandBrakeCLI",
                        args,
                        ProgressDialect::HandbrakePercent,
                        floor,
                    )
                    .await?;
                }
                Backend::Ffmpeg => {
                    let duration = ffmpeg::probe_duration(file).await;
                    let args = ffmpeg::FfmpegCommandBuilder::new(file, &output, family)
                        .with_resolution(resolution)
                        .with_render_node(&self.caps.render_node)
                        .build(&self.config)?;
                    self.run_encoder(
                        job_id,
                        "ffmpeg",
                        args,
                        ProgressDialect::FfmpegTime { duration },
                        floor,
                    )
                    .await?;
                }
            }

            if !output.exists() {
                return Err(ForgeError::EncoderFailed(format!(
                    "Output file was not created: {}",
                    output.display()
                )));
            }
        }

        // Move out of scratch into the library.
        tokio::fs::create_dir_all(&final_dir).await?;
        let mut outputs: Vec<PathBuf> = std::fs::read_dir(&local_output)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        outputs.sort();
        for file in outputs {
            let name = file
                .file_name()
                .ok_or_else(|| ForgeError::Unknown(format!("Bad output name: {}", file.display())))?;
            move_file(&file, &final_dir.join(name)).await?;
        }
        self.db
            .set_output_path(job_id, &final_dir.to_string_lossy())
            .await?;

        self.db.mark_completed(job_id).await?;
        info!("[job {job_id}] completed: {}", final_dir.display());

        if self.config.delete_source {
            cleanup_source(&source);
        }

        Ok(())
    }

    /// Audio-only rips are copied verbatim into the audio library.
    async fn passthrough_audio(
        &self,
        job_id: i64,
        title: &str,
        source: &Path,
        audio_files: &[PathBuf],
    ) -> Result<()> {
        info!(
            "[job {job_id}] audio-only source, copying {} tracks",
            audio_files.len()
        );

        let dest = Path::new(&self.config.completed_path)
            .join(&self.config.audio_subdir)
            .join(paths::clean_title_for_filesystem(title));
        tokio::fs::create_dir_all(&dest).await?;

        for file in audio_files {
            let name = file
                .file_name()
                .ok_or_else(|| ForgeError::SourceMissing(format!("Bad file name: {}", file.display())))?;
            tokio::fs::copy(file, dest.join(name)).await?;
        }

        self.db
            .set_total_tracks(job_id, audio_files.len() as i64)
            .await?;
        self.db.set_output_path(job_id, &dest.to_string_lossy()).await?;
        self.db.mark_completed(job_id).await?;
        info!("[job {job_id}] completed: {}", dest.display());

        if self.config.delete_source {
            cleanup_source(source);
        }
        Ok(())
    }

    fn preflight_disk(&self, root: &Path, required_bytes: u64) -> Result<()> {
        if let Err(e) = std::fs::create_dir_all(root) {
            return Err(ForgeError::Io(e));
        }
        match paths::check_sufficient_disk_space(root, required_bytes, self.config.minimum_free_space_gb)
        {
            Ok(()) => Ok(()),
            Err(e @ ForgeError::ResourceExhausted(_)) => Err(e),
            Err(e) => {
                // An unreadable mount table is not proof of a full disk.
                warn!("Disk space check skipped for {}: {e}", root.display());
                Ok(())
            }
        }
    }

    /// Spawn the encoder and stream its progress into the Catalog. The
    /// select loop watches the output stream, the shutdown signal, and the
    /// hard deadline.
    async fn run_encoder(
        &self,
        job_id: i64,
        program: &str,
        args: Vec<String>,
        dialect: ProgressDialect,
        floor: f64,
    ) -> Result<()> {
        debug!("[job {job_id}] {program} {}", args.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(&args).stdin(Stdio::null()).kill_on_drop(true);
        match dialect {
            ProgressDialect::HandbrakePercent => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::null());
            }
            ProgressDialect::FfmpegTime { .. } => {
                cmd.stdout(Stdio::null()).stderr(Stdio::piped());
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ForgeError::EncoderFailed(format!("Failed to spawn {program}: {e}")))?;

        let stream: Box<dyn tokio::io::AsyncRead + Unpin + Send> = match dialect {
            ProgressDialect::HandbrakePercent => Box::new(
                child
                    .stdout
                    .take()
                    .ok_or_else(|| ForgeError::EncoderFailed("Failed to capture stdout".into()))?,
            ),
            ProgressDialect::FfmpegTime { .. } => Box::new(
                child
                    .stderr
                    .take()
                    .ok_or_else(|| ForgeError::EncoderFailed("Failed to capture stderr".into()))?,
            ),
        };

        let deadline = Instant::now() + SUBPROCESS_TIMEOUT;
        let mut reader = BufReader::new(stream).lines();
        let mut throttle = ProgressThrottle::new(floor);
        let mut last_lines: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

        loop {
            tokio::select! {
                line = reader.next_line() => match line {
                    Ok(Some(line)) => {
                        if last_lines.len() == STDERR_TAIL_LINES {
                            last_lines.pop_front();
                        }
                        last_lines.push_back(line.clone());

                        let progress = match dialect {
                            ProgressDialect::HandbrakePercent => handbrake::parse_progress(&line),
                            ProgressDialect::FfmpegTime { duration } => {
                                ffmpeg::FfmpegProgress::parse_line(&line)
                                    .and_then(|p| duration.and_then(|d| p.percentage(d)))
                            }
                        };
                        if let Some(value) = progress {
                            if throttle.should_write(value) {
                                if let Err(e) = self.db.update_progress(job_id, value).await {
                                    warn!("[job {job_id}] progress write failed: {e}");
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("[job {job_id}] error reading {program} output: {e}");
                        break;
                    }
                },
                _ = self.shutdown.triggered() => {
                    warn!("[job {job_id}] shutdown requested, killing {program}");
                    let _ = child.kill().await;
                    return Err(ForgeError::Shutdown);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = child.kill().await;
                    return Err(ForgeError::EncoderFailed(format!(
                        "{program} exceeded the {}s limit",
                        SUBPROCESS_TIMEOUT.as_secs()
                    )));
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            let detail = last_lines.make_contiguous().join("\n");
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".into());
            return Err(ForgeError::EncoderFailed(format!(
                "{program} failed with exit code {code}\n{detail}"
            )));
        }
        Ok(())
    }
}

/// TV episodes carry `SxxEyy` (or a `_Sxx` disc suffix) in the title or the
/// rip directory name; everything else files as a movie.
pub fn classify_video_type(title: &str, source: &Path) -> &'static str {
    if TV_EPISODE_RE.is_match(title) || TV_EPISODE_RE.is_match(&source.to_string_lossy()) {
        "tv"
    } else {
        "movie"
    }
}

async fn move_file(source: &Path, dest: &Path) -> Result<()> {
    match tokio::fs::rename(source, dest).await {
        Ok(()) => Ok(()),
        Err(_) => {
            // Rename fails across filesystems; fall back to copy + remove.
            tokio::fs::copy(source, dest).await?;
            tokio::fs::remove_file(source).await?;
            Ok(())
        }
    }
}

/// Best effort: a source that cannot be deleted is logged, not fatal.
fn cleanup_source(source: &Path) {
    let result = if source.is_file() {
        std::fs::remove_file(source)
    } else {
        std::fs::remove_dir_all(source)
    };
    match result {
        Ok(()) => info!("Cleaned up source: {}", source.display()),
        Err(e) => warn!("Failed to delete source {}: {e}", source.display()),
    }
}
