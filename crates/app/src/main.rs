mod cli;
mod server;
mod sse;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use posture::{
    CameraStateCell, ClientSessionRegistry, Collaborators, LatestSlot, PipelineConfig,
    PipelineSupervisor, SystemClock, pipeline::heartbeat, telemetry,
};
use tracing::{info, warn};

use crate::cli::Cli;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let (bind, backend, ffmpeg) = (cli.bind, cli.backend, cli.ffmpeg);
    let config = PipelineConfig::try_from(cli.pipeline).context("Invalid pipeline configuration")?;

    let _telemetry_guard = telemetry::init(&config.telemetry);
    if telemetry::init_metrics_recorder().is_none() {
        warn!("Prometheus recorder unavailable; /metrics will return 503");
    }
    info!(
        source = %config.camera.uri,
        width = config.camera.width,
        height = config.camera.height,
        backend = ?backend,
        target_fps = config.target_fps,
        heartbeat = ?config.heartbeat.interval,
        long_delay = ?config.recovery.long_delay,
        "starting posture monitor"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        if let Err(err) = ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst)) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    }

    let registry = ClientSessionRegistry::new(
        LatestSlot::new(),
        Arc::new(CameraStateCell::default()),
        config.stream_poll,
    );
    let collaborators = Collaborators {
        camera: cli::build_camera(backend, &ffmpeg, &config.camera)?,
        processor: cli::build_processor(
            config.processor_command.as_deref(),
            config.processor_timeout,
        )?,
        heartbeat: heartbeat::sink_from_env(),
        clock: Arc::new(SystemClock),
    };
    let supervisor = PipelineSupervisor::new(&config, collaborators, &registry);

    let server = server::spawn_server(bind, registry.clone(), config.shutdown_timeout)?;
    info!("viewer feed at http://{}/events", server.local_addr());
    let mut pipeline = supervisor
        .spawn()
        .context("Failed to spawn producer thread")?;

    while !shutdown.load(Ordering::SeqCst) && !pipeline.is_finished() {
        thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down");
    if !pipeline.stop(config.shutdown_timeout) {
        warn!("producer did not stop in time; exiting anyway");
    }
    let stragglers = registry.shutdown(config.shutdown_timeout);
    if stragglers > 0 {
        warn!(stragglers, "stream workers still running at exit");
    }
    server.stop();
    Ok(())
}
