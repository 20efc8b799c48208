use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;

use edgeinfer::capture::{
    Acquired, FrameBuffer, PixelFormat, Rotation, StreamInfo, StreamRequest, SyntheticChannel,
    SyntheticConfig, VideoChannel,
};
use edgeinfer::infer::accelerator::ModelSource;
use edgeinfer::infer::scheduler::load_with_retry;
use edgeinfer::infer::{GraphState, InferenceScheduler, RetryState, RunOutcome, SimAccelerator};
use edgeinfer::pipeline::detections::decode_ssd;
use edgeinfer::pipeline::{ChannelSink, Pipeline, PipelineExit};
use edgeinfer::{Config, Error, ImageFit, InferenceConfig, SimConfig};

fn model_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"TFL3 not really a model").unwrap();
    file
}

fn inference_config(model: &NamedTempFile, sim: SimConfig) -> InferenceConfig {
    InferenceConfig {
        model_path: model.path().to_path_buf(),
        max_power_attempts: 3,
        power_backoff_ms: 1,
        sim,
        ..InferenceConfig::default()
    }
}

fn fast_sim() -> SimConfig {
    SimConfig {
        latency_ms: 1,
        ..SimConfig::default()
    }
}

fn scheduler(model: &NamedTempFile, sim: SimConfig, fit: ImageFit) -> InferenceScheduler<SimAccelerator> {
    let config = inference_config(model, sim);
    let accel = SimAccelerator::connect(config.sim.clone()).unwrap();
    match InferenceScheduler::new(accel, &config, fit) {
        Ok(scheduler) => scheduler,
        Err(e) => panic!("scheduler failed to start: {e}"),
    }
}

fn open_stream(
    width: u32,
    height: u32,
    format: PixelFormat,
    buffers: u32,
) -> (SyntheticChannel, StreamInfo) {
    let channel = SyntheticChannel::new(
        "stub://inference",
        SyntheticConfig {
            paced: false,
            ..SyntheticConfig::default()
        },
    );
    let info = channel
        .open(&StreamRequest {
            width,
            height,
            format,
            framerate: 30.0,
            buffer_count: buffers,
            rotation: Rotation::R0,
        })
        .unwrap();
    channel.start().unwrap();
    (channel, info)
}

fn next(channel: &SyntheticChannel) -> FrameBuffer {
    match channel.acquire().unwrap() {
        Acquired::Frame(buffer) => buffer,
        other => panic!("expected a frame, got {other:?}"),
    }
}

#[test]
fn mismatched_stream_gets_a_preprocessing_stage() {
    let model = model_file();
    let mut scheduler = scheduler(&model, fast_sim(), ImageFit::Scale);
    assert_eq!(scheduler.state(), GraphState::Unbuilt);

    let (_yuv, yuv_info) = open_stream(640, 480, PixelFormat::Nv12, 4);
    scheduler.build_job_graph(&yuv_info).unwrap();
    assert!(scheduler.has_preprocessing());
    assert_eq!(scheduler.state(), GraphState::Built);
    assert_eq!(scheduler.accelerator().live_models(), 2);

    let (_rgb, rgb_info) = open_stream(300, 300, PixelFormat::Rgb24, 4);
    scheduler.build_job_graph(&rgb_info).unwrap();
    assert!(!scheduler.has_preprocessing());
    // The preprocessing model went away with the old graph
    assert_eq!(scheduler.accelerator().live_models(), 1);
}

#[test]
fn crop_fit_attaches_a_centered_crop() {
    let model = model_file();
    let mut scheduler = scheduler(&model, fast_sim(), ImageFit::Crop);
    let (channel, info) = open_stream(640, 480, PixelFormat::Nv12, 4);
    scheduler.build_job_graph(&info).unwrap();

    let plan = scheduler.plan().unwrap();
    let crop = plan.crop.unwrap();
    assert_eq!((crop.x, crop.y, crop.width, crop.height), (80, 0, 480, 480));

    let frame = next(&channel);
    assert_eq!(scheduler.run_inference(&frame).unwrap(), RunOutcome::Completed);
    assert_eq!(scheduler.accelerator().counters().cropped_jobs, 1);
    channel.release(frame).unwrap();
}

#[test]
fn unpadded_stream_must_match_model_pitch() {
    let model = model_file();
    let mut scheduler = scheduler(&model, fast_sim(), ImageFit::Scale);
    let (_channel, mut info) = open_stream(300, 300, PixelFormat::Rgb24, 4);
    info.pitch = 960;
    assert!(matches!(
        scheduler.build_job_graph(&info),
        Err(Error::FormatUnsupported(_))
    ));
}

#[test]
fn inference_before_graph_build_is_rejected() {
    let model = model_file();
    let mut scheduler = scheduler(&model, fast_sim(), ImageFit::Scale);
    let (channel, _info) = open_stream(300, 300, PixelFormat::Rgb24, 2);
    let frame = next(&channel);
    assert!(matches!(
        scheduler.run_inference(&frame),
        Err(Error::GraphNotBuilt)
    ));
    channel.release(frame).unwrap();
}

#[test]
fn bindings_hit_after_buffer_pool_rotates_once() {
    let model = model_file();
    let mut scheduler = scheduler(&model, fast_sim(), ImageFit::Scale);
    let (channel, info) = open_stream(640, 480, PixelFormat::Nv12, 3);
    scheduler.build_job_graph(&info).unwrap();

    for _ in 0..12 {
        let frame = next(&channel);
        assert_eq!(scheduler.run_inference(&frame).unwrap(), RunOutcome::Completed);
        channel.release(frame).unwrap();
    }

    let stats = scheduler.binding_stats();
    assert_eq!(stats.misses, 3);
    assert_eq!(stats.hits, 9);
    assert_eq!(scheduler.accelerator().counters().registrations, 3);
}

#[test]
fn outputs_carry_frame_identity_and_detections() {
    let model = model_file();
    let mut scheduler = scheduler(&model, fast_sim(), ImageFit::Scale);
    let (channel, info) = open_stream(300, 300, PixelFormat::Rgb24, 2);
    scheduler.build_job_graph(&info).unwrap();

    let frame = next(&channel);
    scheduler.run_inference(&frame).unwrap();
    assert_eq!(scheduler.state(), GraphState::Succeeded);
    assert!(scheduler
        .outputs()
        .iter()
        .all(|o| o.sequence == frame.sequence() && o.timestamp == frame.timestamp()));

    let labels = vec!["person".to_string()];
    let detections = decode_ssd(scheduler.outputs(), 0.5, &labels);
    assert_eq!(detections.len(), 1);
    let person = &detections[0];
    assert_eq!(person.label, "person");
    assert!((person.x1 - 0.20).abs() < 1e-6);
    assert!((person.y1 - 0.10).abs() < 1e-6);
    assert!((person.x2 - 0.45).abs() < 1e-6);
    assert!((person.y2 - 0.60).abs() < 1e-6);

    // A lower threshold lets the second, unnamed class through
    let all = decode_ssd(scheduler.outputs(), 0.3, &labels);
    assert_eq!(all.len(), 2);
    assert_eq!(all[1].label, "class 2");
    channel.release(frame).unwrap();
}

#[test]
fn power_shortage_backs_off_then_recovers() {
    let model = model_file();
    let mut scheduler = scheduler(&model, fast_sim(), ImageFit::Scale);
    let (channel, info) = open_stream(300, 300, PixelFormat::Rgb24, 2);
    scheduler.build_job_graph(&info).unwrap();
    scheduler.accelerator_mut().fail_next_runs(2);

    let frame = next(&channel);
    assert_eq!(
        scheduler.run_inference(&frame).unwrap(),
        RunOutcome::Retry {
            backoff: Duration::from_millis(1)
        }
    );
    assert_eq!(scheduler.state(), GraphState::RetryableFailure);
    assert_eq!(
        scheduler.run_inference(&frame).unwrap(),
        RunOutcome::Retry {
            backoff: Duration::from_millis(2)
        }
    );
    assert_eq!(scheduler.run_inference(&frame).unwrap(), RunOutcome::Completed);

    // The success reset the count, so two more failures are tolerated
    scheduler.accelerator_mut().fail_next_runs(2);
    assert!(matches!(
        scheduler.run_inference(&frame).unwrap(),
        RunOutcome::Retry { .. }
    ));
    channel.release(frame).unwrap();
}

#[test]
fn persistent_power_shortage_is_fatal() {
    let model = model_file();
    let mut scheduler = scheduler(&model, fast_sim(), ImageFit::Scale);
    let (channel, info) = open_stream(300, 300, PixelFormat::Rgb24, 2);
    scheduler.build_job_graph(&info).unwrap();
    scheduler.accelerator_mut().fail_next_runs(10);

    let frame = next(&channel);
    assert!(scheduler.run_inference(&frame).is_ok());
    assert!(scheduler.run_inference(&frame).is_ok());
    match scheduler.run_inference(&frame) {
        Err(Error::PowerExhausted { attempts }) => assert_eq!(attempts, 3),
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(scheduler.state(), GraphState::FatalFailure);
    channel.release(frame).unwrap();
}

#[test]
fn model_load_gives_up_after_max_attempts() {
    let model = model_file();
    let file = std::fs::File::open(model.path()).unwrap();
    let mut accel = SimAccelerator::connect(SimConfig {
        power_unavailable_loads: u32::MAX,
        ..SimConfig::default()
    })
    .unwrap();

    let result = load_with_retry(
        &mut accel,
        ModelSource::File(&file),
        "cpu-tflite",
        "model",
        RetryState::new(4, Duration::from_millis(1)),
    );
    assert!(matches!(result, Err(Error::PowerExhausted { attempts: 4 })));
    assert_eq!(accel.counters().load_attempts, 4);
}

#[test]
fn model_load_succeeds_on_last_allowed_attempt() {
    let model = model_file();
    let file = std::fs::File::open(model.path()).unwrap();
    let mut accel = SimAccelerator::connect(SimConfig {
        power_unavailable_loads: 3,
        ..SimConfig::default()
    })
    .unwrap();

    let result = load_with_retry(
        &mut accel,
        ModelSource::File(&file),
        "cpu-tflite",
        "model",
        RetryState::new(4, Duration::from_millis(1)),
    );
    assert!(result.is_ok());
    assert_eq!(accel.counters().load_attempts, 4);
}

#[test]
fn unknown_device_is_reported() {
    let model = model_file();
    let config = InferenceConfig {
        device: "npu-that-is-not-there".into(),
        ..inference_config(&model, fast_sim())
    };
    let accel = SimAccelerator::connect(config.sim.clone()).unwrap();
    assert!(matches!(
        InferenceScheduler::new(accel, &config, ImageFit::Scale),
        Err(Error::DeviceNotFound(_))
    ));
}

#[test]
fn shutdown_releases_everything() {
    let model = model_file();
    let mut scheduler = scheduler(&model, fast_sim(), ImageFit::Scale);
    let (channel, info) = open_stream(640, 480, PixelFormat::Nv12, 3);
    scheduler.build_job_graph(&info).unwrap();
    for _ in 0..3 {
        let frame = next(&channel);
        scheduler.run_inference(&frame).unwrap();
        channel.release(frame).unwrap();
    }
    assert_eq!(scheduler.accelerator().live_inputs(), 3);

    scheduler.shutdown();
    scheduler.shutdown();
    let accel = scheduler.accelerator();
    assert_eq!(accel.live_inputs(), 0);
    assert_eq!(accel.live_models(), 0);
    assert_eq!(accel.counters().releases, 3);
}

fn pipeline_config(model: &NamedTempFile, sim: SimConfig) -> Config {
    let mut config = Config::default();
    config.inference = inference_config(model, sim);
    config.capture.poll_interval_ms = 10;
    config.pipeline.stats_interval = 5;
    config
}

#[test]
fn pipeline_runs_until_structural_change() {
    let model = model_file();
    let config = pipeline_config(&model, fast_sim());
    let mut scheduler = scheduler(&model, fast_sim(), ImageFit::Scale);

    let channel: Arc<dyn VideoChannel> = Arc::new(SyntheticChannel::new(
        "stub://rotating",
        SyntheticConfig {
            paced: false,
            structural_change_after: Some(20),
            ..SyntheticConfig::default()
        },
    ));
    let mut pipeline = Pipeline::open(channel, &config, &mut scheduler).unwrap();
    assert!(scheduler.has_preprocessing());

    let (mut sink, rx) = ChannelSink::bounded(64);
    let shutdown = AtomicBool::new(false);
    let exit = pipeline.run(&mut scheduler, &mut sink, &shutdown).unwrap();
    assert!(matches!(exit, PipelineExit::Rebuild(_)));

    let stats = pipeline.stats(&scheduler);
    assert!(stats.frames_processed >= 1);
    assert_eq!(stats.frames_skipped, 0);
    assert!(stats.avg_latency_ms >= 1.0);

    let results: Vec<_> = rx.try_iter().collect();
    assert_eq!(results.len() as u64, stats.frames_processed);
    assert!(results.iter().all(|r| r.detections.len() == 1));
    assert!(results.windows(2).all(|w| w[0].sequence < w[1].sequence));
    pipeline.close();
}

#[test]
fn pipeline_skips_frames_while_power_is_short() {
    let model = model_file();
    let sim = SimConfig {
        power_unavailable_runs: 2,
        ..fast_sim()
    };
    let config = pipeline_config(&model, sim.clone());
    let mut scheduler = scheduler(&model, sim, ImageFit::Scale);

    let channel: Arc<dyn VideoChannel> = Arc::new(SyntheticChannel::new(
        "stub://short",
        SyntheticConfig {
            paced: false,
            structural_change_after: Some(30),
            ..SyntheticConfig::default()
        },
    ));
    let mut pipeline = Pipeline::open(channel, &config, &mut scheduler).unwrap();
    let (mut sink, _rx) = ChannelSink::bounded(64);
    let shutdown = AtomicBool::new(false);
    pipeline.run(&mut scheduler, &mut sink, &shutdown).unwrap();

    let stats = pipeline.stats(&scheduler);
    assert_eq!(stats.frames_skipped, 2);
    assert!(stats.frames_processed >= 1);
    pipeline.close();
}

#[test]
fn requested_shutdown_stops_the_pipeline() {
    let model = model_file();
    let config = pipeline_config(&model, fast_sim());
    let mut scheduler = scheduler(&model, fast_sim(), ImageFit::Scale);
    let channel: Arc<dyn VideoChannel> = Arc::new(SyntheticChannel::new(
        "stub://forever",
        SyntheticConfig::default(),
    ));
    let mut pipeline = Pipeline::open(channel, &config, &mut scheduler).unwrap();
    let (mut sink, _rx) = ChannelSink::bounded(1);

    let shutdown = AtomicBool::new(true);
    let exit = pipeline.run(&mut scheduler, &mut sink, &shutdown).unwrap();
    assert_eq!(exit, PipelineExit::Shutdown);
    pipeline.close();
}

fn rotating_channel(name: &str) -> Arc<dyn VideoChannel> {
    Arc::new(SyntheticChannel::new(
        name,
        SyntheticConfig {
            paced: false,
            structural_change_after: Some(20),
            ..SyntheticConfig::default()
        },
    ))
}

#[test]
fn rebuilt_pipeline_registers_the_new_channel_buffers() {
    let model = model_file();
    let config = pipeline_config(&model, fast_sim());
    let mut scheduler = scheduler(&model, fast_sim(), ImageFit::Scale);
    let (mut sink, _rx) = ChannelSink::bounded(64);
    let shutdown = AtomicBool::new(false);

    let mut first = Pipeline::open(rotating_channel("stub://before"), &config, &mut scheduler).unwrap();
    let exit = first.run(&mut scheduler, &mut sink, &shutdown).unwrap();
    assert!(matches!(exit, PipelineExit::Rebuild(_)));
    first.close();

    let registered = scheduler.accelerator().counters().registrations;
    assert!(registered >= 1);
    assert_eq!(registered, scheduler.binding_stats().misses);

    // Shift the descriptor numbers the next buffer pool gets
    let _spare = std::fs::File::open("/dev/null").unwrap();

    let mut second = Pipeline::open(rotating_channel("stub://after"), &config, &mut scheduler).unwrap();
    // Same negotiated stream, so the graph is reused but the bindings are not
    assert_eq!(scheduler.accelerator().live_models(), 2);
    assert_eq!(scheduler.binding_stats().len, 0);
    assert_eq!(scheduler.accelerator().live_inputs(), 0);
    assert_eq!(scheduler.accelerator().counters().releases, registered);

    let exit = second.run(&mut scheduler, &mut sink, &shutdown).unwrap();
    assert!(matches!(exit, PipelineExit::Rebuild(_)));
    assert!(second.stats(&scheduler).frames_processed >= 1);

    let bindings = scheduler.binding_stats();
    assert!(bindings.misses >= 1);
    assert_eq!(
        scheduler.accelerator().counters().registrations,
        registered + bindings.misses
    );
    second.close();
}

#[test]
fn reused_graph_starts_with_fresh_bindings() {
    let model = model_file();
    let mut scheduler = scheduler(&model, fast_sim(), ImageFit::Scale);

    let (old, info) = open_stream(640, 480, PixelFormat::Nv12, 4);
    scheduler.build_job_graph(&info).unwrap();
    for _ in 0..4 {
        let frame = next(&old);
        assert_eq!(scheduler.run_inference(&frame).unwrap(), RunOutcome::Completed);
        old.release(frame).unwrap();
    }
    assert_eq!(scheduler.binding_stats().len, 4);
    drop(old);

    let (new, same_info) = open_stream(640, 480, PixelFormat::Nv12, 4);
    scheduler.build_job_graph(&same_info).unwrap();
    assert_eq!(scheduler.state(), GraphState::Built);
    assert_eq!(scheduler.binding_stats().len, 0);
    assert_eq!(scheduler.accelerator().counters().releases, 4);

    let frame = next(&new);
    assert_eq!(scheduler.run_inference(&frame).unwrap(), RunOutcome::Completed);
    assert_eq!(scheduler.binding_stats().misses, 1);
    assert_eq!(scheduler.accelerator().counters().registrations, 5);
    new.release(frame).unwrap();
}

#[test]
fn preprocessing_with_extra_outputs_is_rejected_cleanly() {
    let model = model_file();
    let sim = SimConfig {
        preprocess_outputs: 2,
        ..fast_sim()
    };
    let mut scheduler = scheduler(&model, sim, ImageFit::Scale);
    let outputs_before = scheduler.accelerator().live_outputs();

    let (_channel, info) = open_stream(640, 480, PixelFormat::Nv12, 4);
    assert!(matches!(
        scheduler.build_job_graph(&info),
        Err(Error::LoadFailed(_))
    ));
    assert_eq!(scheduler.accelerator().live_outputs(), outputs_before);
    assert_eq!(scheduler.accelerator().live_models(), 1);
}
