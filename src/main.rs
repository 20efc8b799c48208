//! edgeinfer: camera frames in, detections out

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use edgeinfer::capture::{self, StopHandle};
use edgeinfer::infer::{InferenceScheduler, SimAccelerator};
use edgeinfer::pipeline::{ChannelSink, DetectionSink, LogSink, Pipeline, PipelineExit};
use edgeinfer::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("edgeinfer=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("edgeinfer launching...");

    // Load configuration
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    edgeinfer::CONFIG.store(Arc::new(config.clone()));

    let shutdown = Arc::new(AtomicBool::new(false));
    let stop_slot: Arc<ArcSwapOption<StopHandle>> = Arc::new(ArcSwapOption::empty());

    // Ctrl-C ends the loop and wakes a consumer blocked on the next frame
    {
        let shutdown = Arc::clone(&shutdown);
        let stop_slot = Arc::clone(&stop_slot);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received interrupt, stopping");
                    shutdown.store(true, Ordering::Release);
                    if let Some(handle) = stop_slot.load_full() {
                        handle.stop();
                    }
                }
                Err(e) => error!("Failed to listen for interrupt: {}", e),
            }
        });
    }

    // Detections are consumed off the inference thread
    let (sink, rx) = ChannelSink::bounded(config.pipeline.sink_capacity);
    let consumer = tokio::task::spawn_blocking(move || {
        let mut log = LogSink;
        for frame in rx.iter() {
            if let Err(e) = log.submit(frame) {
                warn!("Failed to log detections: {}", e);
            }
        }
    });

    let result = tokio::task::spawn_blocking(move || run(config, sink, shutdown, stop_slot))
        .await
        .map_err(|e| eyre!("inference thread panicked: {e}"))?;

    consumer
        .await
        .map_err(|e| eyre!("detection consumer panicked: {e}"))?;

    match result {
        Ok(()) => {
            info!("Exiting");
            Ok(())
        }
        Err(e) => {
            error!(kind = ?e.kind(), "Pipeline failed: {}", e);
            Err(e.into())
        }
    }
}

fn run(
    config: Config,
    mut sink: ChannelSink,
    shutdown: Arc<AtomicBool>,
    stop_slot: Arc<ArcSwapOption<StopHandle>>,
) -> edgeinfer::Result<()> {
    let accel = SimAccelerator::connect(config.inference.sim.clone())?;
    let mut scheduler = InferenceScheduler::new(accel, &config.inference, config.capture.image_fit)?;

    let result = loop {
        if shutdown.load(Ordering::Acquire) {
            break Ok(());
        }

        let channel = capture::open_channel(&config.capture)?;
        let mut pipeline = Pipeline::open(channel, &config, &mut scheduler)?;
        stop_slot.store(Some(Arc::new(pipeline.stop_handle())));

        let exit = pipeline.run(&mut scheduler, &mut sink, &shutdown);
        stop_slot.store(None);
        pipeline.close();

        match exit {
            Ok(PipelineExit::Shutdown) => break Ok(()),
            Ok(PipelineExit::Rebuild(reason)) => {
                info!("Rebuilding pipeline: {}", reason);
            }
            Err(e) => break Err(e),
        }
    };

    // Dropping the sink ends the detection consumer
    drop(sink);
    scheduler.shutdown();
    result
}
