//! Single-consumer worker loop. The in-process queue is plumbing only; the
//! Catalog is the durability mechanism, and startup recovery rebuilds the
//! queue from it before the HTTP surface starts serving.

use crate::config::Config;
use crate::db::{Db, JobStatus};
use crate::error::{ForgeError, Result};
use crate::hardware::Capabilities;
use crate::media::pipeline::JobPipeline;
use crate::shutdown::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

const QUEUE_CAPACITY: usize = 1024;
const POLL_TIMEOUT: Duration = Duration::from_secs(5);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct QueuedJob {
    id: i64,
    title: String,
}

/// Shared view of the worker for the HTTP surface: enqueue, queue depth,
/// running flag, current-job label.
pub struct WorkerHandle {
    db: Arc<Db>,
    tx: mpsc::Sender<QueuedJob>,
    queue_size: AtomicUsize,
    running: AtomicBool,
    current_job: RwLock<Option<String>>,
}

impl WorkerHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size.load(Ordering::SeqCst)
    }

    pub async fn current_job(&self) -> Option<String> {
        self.current_job.read().await.clone()
    }

    /// Insert a new PENDING row (or requeue an existing one after a retry
    /// reset) and push it onto the worker's queue.
    pub async fn queue_job(
        &self,
        source_path: &str,
        title: &str,
        arm_job_id: Option<&str>,
        existing_job_id: Option<i64>,
    ) -> Result<i64> {
        let id = match existing_job_id {
            Some(id) => id,
            None => self.db.insert_job(title, source_path, arm_job_id).await?.id,
        };
        self.push(QueuedJob {
            id,
            title: title.to_string(),
        })?;
        info!("Queued job {id}: {title}");
        Ok(id)
    }

    fn push(&self, job: QueuedJob) -> Result<()> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ForgeError::ResourceExhausted("Transcode queue is full".into())
            }
            mpsc::error::TrySendError::Closed(_) => ForgeError::NotReady,
        })?;
        self.queue_size.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Worker {
    db: Arc<Db>,
    config: Arc<RwLock<Config>>,
    caps: Arc<Capabilities>,
    shutdown: Shutdown,
    rx: mpsc::Receiver<QueuedJob>,
    handle: Arc<WorkerHandle>,
}

impl Worker {
    pub fn new(
        db: Arc<Db>,
        config: Arc<RwLock<Config>>,
        caps: Arc<Capabilities>,
        shutdown: Shutdown,
    ) -> (Self, Arc<WorkerHandle>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let handle = Arc::new(WorkerHandle {
            db: db.clone(),
            tx,
            queue_size: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            current_job: RwLock::new(None),
        });
        let worker = Self {
            db,
            config,
            caps,
            shutdown,
            rx,
            handle: handle.clone(),
        };
        (worker, handle)
    }

    /// Startup recovery: demote crashed PROCESSING rows to PENDING and
    /// requeue everything non-terminal, oldest first. Must complete before
    /// the HTTP surface accepts webhooks.
    pub async fn recover(&self) -> Result<usize> {
        let jobs = self.db.select_non_terminal_jobs_ordered_by_created_at().await?;
        let mut restored = 0;
        for job in jobs {
            if job.status == JobStatus::Processing {
                warn!("Recovering interrupted job {}: {}", job.id, job.title);
                self.db.demote_processing(job.id).await?;
            }
            self.handle.push(QueuedJob {
                id: job.id,
                title: job.title.clone(),
            })?;
            info!("Restored pending job {}: {}", job.id, job.title);
            restored += 1;
        }
        Ok(restored)
    }

    /// Main loop. Dequeues with a timeout so the shutdown flag is observed
    /// even when the queue is idle; a job failure never exits the loop.
    pub async fn run(mut self) {
        self.handle.running.store(true, Ordering::SeqCst);
        info!("Transcode worker started");

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            let job = match tokio::time::timeout(POLL_TIMEOUT, self.rx.recv()).await {
                Err(_) => continue, // timeout: re-check shutdown
                Ok(None) => break,  // queue closed
                Ok(Some(job)) => job,
            };
            self.handle.queue_size.fetch_sub(1, Ordering::SeqCst);

            *self.handle.current_job.write().await = Some(job.title.clone());

            let snapshot = self.config.read().await.clone();
            let pipeline = JobPipeline::new(
                self.db.clone(),
                snapshot,
                self.caps.clone(),
                self.shutdown.clone(),
            );

            match pipeline.process(job.id).await {
                Ok(()) => {}
                Err(ForgeError::Shutdown) => {
                    *self.handle.current_job.write().await = None;
                    break;
                }
                Err(e) => {
                    error!("Worker error on job {}: {e}", job.id);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }

            *self.handle.current_job.write().await = None;
        }

        self.handle.running.store(false, Ordering::SeqCst);
        info!("Transcode worker stopped");
    }
}
