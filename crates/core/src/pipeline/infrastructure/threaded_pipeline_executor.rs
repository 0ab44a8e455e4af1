use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::capture::domain::frame_source::FrameSource;
use crate::control::domain::command_dispatcher::CommandSender;
use crate::control::domain::decision_policy::DecisionPolicy;
use crate::detection::domain::detection_stage::DetectionStage;
use crate::identity::domain::embedding_store::EmbeddingStore;
use crate::pipeline::freshness_queue::{freshness_queue, FreshnessSender};
use crate::pipeline::pipeline_executor::{
    PipelineConfig, PipelineExecutor, PipelineReport, PipelineStages,
};
use crate::pipeline::pipeline_logger::{PipelineLogger, SharedLogger};
use crate::recognition::domain::match_result::MatchResult;
use crate::recognition::domain::recognition_stage::RecognitionStage;
use crate::shared::face_box::FaceBox;
use crate::shared::frame::Frame;

/// Upper bound on how long the decision thread waits before checking the
/// persistence tick.
const MAX_DECISION_WAIT: Duration = Duration::from_millis(500);

#[derive(Default)]
struct StageCounters {
    captured: AtomicU64,
    failed: AtomicU64,
    detected: AtomicU64,
    recognized: AtomicU64,
    unknown: AtomicU64,
    issued: AtomicU64,
    dropped: AtomicU64,
}

/// Executes the recognition pipeline on dedicated threads.
///
/// Layout: `capture → [fresh] → detect ×N → recognize ×M → decide (caller)`
///
/// Only the capture thread observes cancellation. Every other stage runs
/// until its input disconnects, so frames already captured are always
/// carried through to a decision.
pub struct ThreadedPipelineExecutor;

impl ThreadedPipelineExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ThreadedPipelineExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineExecutor for ThreadedPipelineExecutor {
    fn execute(
        &self,
        stages: PipelineStages,
        config: PipelineConfig,
        logger: Box<dyn PipelineLogger>,
    ) -> Result<PipelineReport, Box<dyn std::error::Error>> {
        let PipelineStages {
            mut source,
            detector_factory,
            filter,
            recognition,
            mut policy,
            commands,
            store,
        } = stages;

        // Models load before the camera opens so a bad model fails fast.
        let detectors = (0..config.detection_workers.max(1))
            .map(|_| detector_factory().map(|d| DetectionStage::new(d, filter)))
            .collect::<Result<Vec<_>, _>>()?;

        let info = source.open()?;
        let logger = SharedLogger::new(logger);
        logger.with(|l| {
            l.info(&format!(
                "Capturing from {} ({}x{} @ {:.0} fps), {} detection / {} recognition workers",
                info.description,
                info.width,
                info.height,
                info.fps,
                detectors.len(),
                config.recognition_workers.max(1)
            ))
        });

        let counters = Arc::new(StageCounters::default());
        let (frame_tx, frame_rx) = freshness_queue::<Frame>(config.frame_queue_capacity);
        let evicted = frame_tx.eviction_counter();
        let (face_tx, face_rx) =
            crossbeam_channel::bounded::<FaceBox>(config.face_queue_capacity.max(1));
        let (result_tx, result_rx) =
            crossbeam_channel::bounded::<MatchResult>(config.result_queue_capacity.max(1));

        let capture_handle = spawn_capture(
            source,
            frame_tx,
            Arc::clone(&config.cancelled),
            Arc::clone(&counters),
            logger.clone(),
        );
        let detect_handles: Vec<_> = detectors
            .into_iter()
            .map(|stage| {
                spawn_detection_worker(
                    stage,
                    frame_rx.clone(),
                    face_tx.clone(),
                    Arc::clone(&counters),
                    logger.clone(),
                )
            })
            .collect();
        let recognize_handles: Vec<_> = (0..config.recognition_workers.max(1))
            .map(|_| {
                spawn_recognition_worker(
                    recognition.clone(),
                    face_rx.clone(),
                    result_tx.clone(),
                    Arc::clone(&counters),
                    logger.clone(),
                )
            })
            .collect();
        // Workers hold the only remaining ends; disconnection now tracks them.
        drop((frame_rx, face_tx, face_rx, result_tx));

        let decision_error = run_decision_loop(
            result_rx,
            &mut policy,
            commands.as_ref(),
            &store,
            &config,
            &counters,
            &logger,
        );
        drop(commands);

        let embed_failures = recognition.embed_failures();
        drop(recognition);

        join_threads(
            capture_handle,
            detect_handles,
            recognize_handles,
            decision_error,
        )?;

        let report = PipelineReport {
            frames_captured: counters.captured.load(Ordering::Relaxed),
            frames_evicted: evicted.load(Ordering::Relaxed),
            frames_failed: counters.failed.load(Ordering::Relaxed),
            faces_detected: counters.detected.load(Ordering::Relaxed),
            faces_recognized: counters.recognized.load(Ordering::Relaxed),
            faces_unknown: counters.unknown.load(Ordering::Relaxed),
            commands_issued: counters.issued.load(Ordering::Relaxed),
            commands_dropped: counters.dropped.load(Ordering::Relaxed),
        };
        logger.with(|l| {
            l.metric("embed_failures", embed_failures as f64);
            l.info(&format!(
                "Pipeline stopped: {} frames ({} evicted, {} failed), {} faces ({} known, {} unknown), {} commands",
                report.frames_captured,
                report.frames_evicted,
                report.frames_failed,
                report.faces_detected,
                report.faces_recognized,
                report.faces_unknown,
                report.commands_issued
            ));
            l.summary();
        });
        Ok(report)
    }
}

fn spawn_capture(
    mut source: Box<dyn FrameSource>,
    frame_tx: FreshnessSender<Frame>,
    cancelled: Arc<AtomicBool>,
    counters: Arc<StageCounters>,
    logger: SharedLogger,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for frame_result in source.frames() {
            if cancelled.load(Ordering::Relaxed) {
                log::info!("Capture cancelled; draining in-flight frames");
                break;
            }
            match frame_result {
                Ok(frame) => {
                    let captured = counters.captured.fetch_add(1, Ordering::Relaxed) + 1;
                    let evicted = frame_tx.push(frame);
                    if evicted > 0 {
                        log::debug!("Detection behind; evicted {evicted} stale frame(s)");
                    }
                    let depth = frame_tx.depth() as f64;
                    logger.with(|l| {
                        l.progress(captured);
                        l.metric("frame_queue_depth", depth);
                    });
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Frame capture failed: {e}");
                }
            }
        }
        drop(frame_tx);
        source.close();
    })
}

fn spawn_detection_worker(
    mut stage: DetectionStage,
    frame_rx: Receiver<Frame>,
    face_tx: Sender<FaceBox>,
    counters: Arc<StageCounters>,
    logger: SharedLogger,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for frame in frame_rx {
            let index = frame.index();
            let started = Instant::now();
            let faces = match stage.detect(Arc::new(frame)) {
                Ok(faces) => faces,
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Detection failed on frame {index}: {e}");
                    continue;
                }
            };
            for face in faces {
                counters.detected.fetch_add(1, Ordering::Relaxed);
                // Blocking: faces are never dropped between detection and recognition
                if face_tx.send(face).is_err() {
                    return;
                }
            }
            logger.timing("detect", started);
        }
    })
}

fn spawn_recognition_worker(
    stage: RecognitionStage,
    face_rx: Receiver<FaceBox>,
    result_tx: Sender<MatchResult>,
    counters: Arc<StageCounters>,
    logger: SharedLogger,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for face in &face_rx {
            let started = Instant::now();
            let result = stage.recognize(face);
            logger.timing("recognize", started);
            logger.metric("face_queue_depth", face_rx.len() as f64);

            let counter = if result.subject.is_known() {
                &counters.recognized
            } else {
                &counters.unknown
            };
            counter.fetch_add(1, Ordering::Relaxed);

            if result_tx.send(result).is_err() {
                break;
            }
        }
    })
}

/// Consumes match results on the calling thread until every recognition
/// worker is done, then flushes the store one last time.
fn run_decision_loop(
    result_rx: Receiver<MatchResult>,
    policy: &mut DecisionPolicy,
    commands: Option<&CommandSender>,
    store: &EmbeddingStore,
    config: &PipelineConfig,
    counters: &StageCounters,
    logger: &SharedLogger,
) -> Option<Box<dyn std::error::Error>> {
    let wait = config
        .persist_interval
        .clamp(Duration::from_millis(1), MAX_DECISION_WAIT);
    let mut last_persist = Instant::now();

    loop {
        match result_rx.recv_timeout(wait) {
            Ok(result) => {
                let started = Instant::now();
                decide(&result, policy, commands, counters);
                logger.timing("decide", started);
                logger.metric("result_queue_depth", result_rx.len() as f64);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if last_persist.elapsed() >= config.persist_interval {
            if let Err(e) = store.persist_if_dirty() {
                log::warn!("Periodic store save failed: {e}");
            }
            last_persist = Instant::now();
        }
    }

    match store.persist_if_dirty() {
        Ok(saved) => {
            if saved {
                log::debug!("Saved identity metadata");
            }
            None
        }
        Err(e) => Some(format!("Final store save failed: {e}").into()),
    }
}

fn decide(
    result: &MatchResult,
    policy: &mut DecisionPolicy,
    commands: Option<&CommandSender>,
    counters: &StageCounters,
) {
    log::debug!(
        "Frame {}: {} ({:.3})",
        result.face.frame_index(),
        result.subject,
        result.similarity
    );
    let Some(command) = policy.decide(&result.subject, result.completed_at) else {
        return;
    };
    counters.issued.fetch_add(1, Ordering::Relaxed);
    log::info!("{} -> {command}", result.subject);
    if let Some(sender) = commands {
        if !sender.try_send(command) {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Joins all pipeline threads and coalesces the first error encountered.
fn join_threads(
    capture_handle: JoinHandle<()>,
    detect_handles: Vec<JoinHandle<()>>,
    recognize_handles: Vec<JoinHandle<()>>,
    mut first_error: Option<Box<dyn std::error::Error>>,
) -> Result<(), Box<dyn std::error::Error>> {
    fn set_if_none(slot: &mut Option<Box<dyn std::error::Error>>, err: Box<dyn std::error::Error>) {
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    if capture_handle.join().is_err() {
        set_if_none(&mut first_error, "Capture thread panicked".into());
    }
    for handle in detect_handles {
        if handle.join().is_err() {
            set_if_none(&mut first_error, "Detection worker panicked".into());
        }
    }
    for handle in recognize_handles {
        if handle.join().is_err() {
            set_if_none(&mut first_error, "Recognition worker panicked".into());
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
