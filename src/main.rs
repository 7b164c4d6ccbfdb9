//! multicam: interactive multi-camera software-trigger console

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use multicam::capture::worker::{AcquisitionStyle, TriggerMode, WorkerEvent};
use multicam::pipeline::sink::BmpSink;
use multicam::{CameraManager, Command, Config, SdkContext};

/// Command-line arguments. Anything given here overrides the config file
/// and `MULTICAM_*` environment.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of cameras to open
    #[arg(short = 'n', long, env = "MULTICAM_CAMERAS")]
    cameras: Option<usize>,

    /// TOML configuration file
    #[arg(short, long, env = "MULTICAM_CONFIG")]
    config: Option<PathBuf>,

    /// Operate cameras in mono (Mono8 output)
    #[arg(long)]
    mono: bool,

    /// Free-run instead of software triggering
    #[arg(long)]
    continuous: bool,

    /// Use stream callbacks instead of polling threads
    #[arg(long)]
    callback: bool,

    /// Save every frame as BMP into this directory
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Buffer retrieve timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        let acquisition = &mut config.acquisition;
        if let Some(count) = self.cameras {
            acquisition.camera_count = count;
        }
        if self.mono {
            acquisition.color = false;
        }
        if self.continuous {
            acquisition.trigger_mode = TriggerMode::Continuous;
        }
        if self.callback {
            acquisition.style = AcquisitionStyle::Callback;
        }
        if let Some(timeout) = self.timeout_ms {
            acquisition.retrieve_timeout_ms = timeout;
        }
        if let Some(dir) = &self.save_dir {
            config.output.save_images = true;
            config.output.directory = dir.clone();
        }
    }
}

fn report(event: WorkerEvent) {
    match event {
        WorkerEvent::Faulted {
            index,
            camera,
            error,
        } => {
            error!(index, %camera, "Camera failed: {}", error);
            println!("Camera {index} ({camera}) stopped: {error}");
        }
        other => debug!(?other, "Worker event"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if args.verbose {
            "multicam=debug"
        } else {
            "multicam=info"
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("multicam launching...");

    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    debug!(?config, "Configuration loaded");

    let acquisition = config.acquisition.clone();
    let system = config.simulator.build(acquisition.camera_count, acquisition.color);
    let ctx = Arc::new(SdkContext::initialize(Arc::new(system))?);

    let mut manager = CameraManager::new(Arc::clone(&ctx));
    if config.output.save_images {
        let sink = BmpSink::new(&config.output.directory)?;
        info!(directory = %sink.directory().display(), "Saving frames");
        manager = manager.with_sink(Arc::new(sink));
    }

    let available = ctx.device_count();
    if acquisition.camera_count > available {
        warn!(
            requested = acquisition.camera_count,
            available, "Fewer cameras than requested"
        );
    }
    for index in 0..acquisition.camera_count.min(available) {
        if let Err(e) = manager.add_worker(acquisition.camera(index)) {
            error!(index, "Camera not configured: {}", e);
            println!("Camera {index} skipped: {e}");
        }
    }
    if manager.is_empty() {
        return Err(eyre!("no camera could be configured"));
    }

    for (index, e) in manager.start_all() {
        println!("Camera {index} failed to start: {e}");
    }

    println!(
        "{} camera(s) running. Enter camera indices to trigger (e.g. \"0 1\"), 's' for status, 'q' to quit.",
        manager.len()
    );

    let events = manager.events();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match Command::parse(&line) {
                    Command::Quit => break,
                    Command::Status => {
                        for summary in manager.summary() {
                            println!("{summary}");
                        }
                    }
                    Command::Trigger { indices, rejected } => {
                        for token in rejected {
                            println!("Ignoring '{token}': not a camera index");
                        }
                        for (index, result) in manager.trigger_many(&indices) {
                            if let Err(e) = result {
                                println!("Camera {index}: {e}");
                            }
                        }
                    }
                    Command::Empty => {}
                    Command::Unknown(input) => {
                        println!("Unknown input '{input}'. Enter camera indices, 's' or 'q'.");
                    }
                }
            }
            Ok(event) = events.recv_async() => report(event),
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    let manager = tokio::task::spawn_blocking(move || {
        let mut manager = manager;
        manager.stop_all();
        manager
    })
    .await?;
    for event in manager.drain_events() {
        report(event);
    }
    for summary in manager.summary() {
        info!("{}", summary);
    }

    drop(manager);
    drop(ctx);
    info!("multicam shutting down");
    Ok(())
}
