use anyhow::Context;
use clap::Parser;
use ripforge::config::Config;
use ripforge::db::Db;
use ripforge::server::{self, App};
use ripforge::worker::Worker;
use ripforge::{hardware, shutdown};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Webhook-driven transcode orchestrator for disc rips")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Address for the HTTP surface
    #[arg(short, long, default_value = "0.0.0.0:8000")]
    bind: String,

    /// Render node checked for VAAPI/QSV support
    #[arg(long, default_value = hardware::DEFAULT_RENDER_NODE)]
    render_node: String,

    /// Probe encoder capabilities, print them, and exit
    #[arg(long)]
    probe_only: bool,
}

/// How long a running pipeline step may finish after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(300);

fn tracing_level(log_level: &str) -> &'static str {
    match log_level {
        "DEBUG" => "debug",
        "WARNING" => "warn",
        "ERROR" | "CRITICAL" => "error",
        _ => "info",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config).context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(tracing_level(&config.log_level))),
        )
        .init();

    info!("ripforge {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "  OS: {} ({}), CPUs: {}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        num_cpus::get()
    );

    if args.probe_only {
        let caps = hardware::probe(&args.render_node).await;
        println!("{}", serde_json::to_string_pretty(&caps.gpu_support())?);
        return Ok(());
    }

    let db = Arc::new(Db::open(&config.db_path).await.context("opening catalog")?);

    // Layering: defaults < config.toml < env < stored overrides < hardware
    // auto-resolution (which only touches keys nobody set).
    let stored = db.get_all_overrides().await?;
    let mut overridden =
        config.apply_overrides(stored.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    // A toml- or env-set value that moved off the built-in default counts
    // as a user choice the auto-resolution must not clobber.
    let baseline = Config::default();
    let auto_resolved: [(&str, &String, &String); 4] = [
        ("video_encoder", &baseline.video_encoder, &config.video_encoder),
        ("handbrake_preset", &baseline.handbrake_preset, &config.handbrake_preset),
        (
            "handbrake_preset_4k",
            &baseline.handbrake_preset_4k,
            &config.handbrake_preset_4k,
        ),
        (
            "handbrake_preset_dvd",
            &baseline.handbrake_preset_dvd,
            &config.handbrake_preset_dvd,
        ),
    ];
    for (key, default_value, current) in auto_resolved {
        if default_value != current {
            overridden.insert(key.to_string());
        }
    }

    let caps = Arc::new(hardware::probe(&args.render_node).await);
    hardware::apply_family_defaults(&mut config, &caps, &overridden);
    config.validate().context("validating configuration")?;

    info!("Configuration:");
    info!("  raw_path:       {}", config.raw_path);
    info!("  completed_path: {}", config.completed_path);
    info!("  work_path:      {}", config.work_path);
    info!("  video_encoder:  {} (q={})", config.video_encoder, config.video_quality);
    info!("  audio_encoder:  {}", config.audio_encoder);
    info!("  subtitle_mode:  {}", config.subtitle_mode);
    info!("  delete_source:  {}", config.delete_source);
    info!("  max_retries:    {}", config.max_retry_count);

    let config = Arc::new(RwLock::new(config));
    let (shutdown_handle, shutdown) = shutdown::channel();
    let (worker, worker_handle) = Worker::new(db.clone(), config.clone(), caps.clone(), shutdown);

    // Recovery must finish before the HTTP surface starts serving, so
    // previously interrupted jobs are queued ahead of any new webhook.
    let restored = worker.recover().await?;
    if restored > 0 {
        info!("Restored {restored} unfinished jobs from the catalog");
    }
    let mut worker_task = tokio::spawn(worker.run());

    let app = Arc::new(App {
        db,
        config,
        caps,
        worker: worker_handle,
    });
    let router = server::router(app);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!("Listening on http://{}", args.bind);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            shutdown_handle.trigger();
        })
        .await
        .context("serving HTTP")?;

    info!(
        "Waiting up to {}s for the worker to finish",
        SHUTDOWN_GRACE.as_secs()
    );
    if tokio::time::timeout(SHUTDOWN_GRACE, &mut worker_task)
        .await
        .is_err()
    {
        warn!("Worker did not stop within the grace period; aborting");
        worker_task.abort();
    }

    Ok(())
}
