use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::capture::domain::frame_source::FrameSource;
use crate::control::domain::command_dispatcher::CommandSender;
use crate::control::domain::decision_policy::DecisionPolicy;
use crate::detection::domain::detection_stage::DetectionFilter;
use crate::detection::domain::face_detector::FaceDetector;
use crate::identity::domain::embedding_store::EmbeddingStore;
use crate::pipeline::pipeline_logger::PipelineLogger;
use crate::recognition::domain::recognition_stage::RecognitionStage;

/// Builds one detector per detection worker.
pub type DetectorFactory =
    Box<dyn Fn() -> Result<Box<dyn FaceDetector>, Box<dyn std::error::Error>> + Send + Sync>;

/// Queue sizes, worker counts and the cancellation flag for one run.
pub struct PipelineConfig {
    pub detection_workers: usize,
    pub recognition_workers: usize,
    pub frame_queue_capacity: usize,
    pub face_queue_capacity: usize,
    pub result_queue_capacity: usize,
    /// How often the decision thread flushes store metadata.
    pub persist_interval: Duration,
    /// Observed by the capture thread only; downstream stages drain.
    pub cancelled: Arc<AtomicBool>,
}

/// The stages wired together by an executor.
pub struct PipelineStages {
    pub source: Box<dyn FrameSource>,
    pub detector_factory: DetectorFactory,
    pub filter: DetectionFilter,
    /// Prototype cloned into every recognition worker.
    pub recognition: RecognitionStage,
    pub policy: DecisionPolicy,
    /// `None` runs without a vehicle: decisions are only logged.
    pub commands: Option<CommandSender>,
    pub store: Arc<EmbeddingStore>,
}

/// Totals for one pipeline run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub frames_captured: u64,
    /// Frames discarded by the freshness queue before detection.
    pub frames_evicted: u64,
    /// Frames lost to capture or detector errors.
    pub frames_failed: u64,
    pub faces_detected: u64,
    pub faces_recognized: u64,
    pub faces_unknown: u64,
    pub commands_issued: u64,
    /// Issued commands the dispatch queue had no room for.
    pub commands_dropped: u64,
}

/// Runs capture → detect → recognize → decide until the source ends or the
/// run is cancelled, then drains every in-flight frame.
///
/// Port implemented by infrastructure (e.g. threaded).
pub trait PipelineExecutor: Send {
    fn execute(
        &self,
        stages: PipelineStages,
        config: PipelineConfig,
        logger: Box<dyn PipelineLogger>,
    ) -> Result<PipelineReport, Box<dyn std::error::Error>>;
}
