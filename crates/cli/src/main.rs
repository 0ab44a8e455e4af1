use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};

use facewatch_core::capture::domain::frame_source::FrameSource;
use facewatch_core::capture::infrastructure::ffmpeg_camera_source::{
    CameraOptions, FfmpegCameraSource,
};
use facewatch_core::capture::infrastructure::image_directory_source::{
    load_frame, ImageDirectorySource,
};
use facewatch_core::control::domain::command_dispatcher::CommandDispatcher;
use facewatch_core::control::domain::decision_policy::{CommandMapping, DecisionPolicy};
use facewatch_core::control::infrastructure::tcp_command_channel::TcpCommandChannel;
use facewatch_core::detection::domain::detection_stage::{DetectionFilter, DetectionStage};
use facewatch_core::detection::domain::face_detector::FaceDetector;
use facewatch_core::detection::infrastructure::onnx_yolo_face_detector::{
    OnnxYoloFaceDetector, DEFAULT_CANDIDATE_CONFIDENCE,
};
use facewatch_core::identity::domain::embedding_store::EmbeddingStore;
use facewatch_core::identity::domain::identity_record::IdentityMetadata;
use facewatch_core::identity::infrastructure::json_identity_repository::JsonIdentityRepository;
use facewatch_core::pipeline::infrastructure::threaded_pipeline_executor::ThreadedPipelineExecutor;
use facewatch_core::pipeline::pipeline_executor::{
    DetectorFactory, PipelineConfig, PipelineExecutor, PipelineStages,
};
use facewatch_core::pipeline::pipeline_logger::StdoutPipelineLogger;
use facewatch_core::recognition::domain::face_embedder::FaceEmbedder;
use facewatch_core::recognition::domain::recognition_stage::RecognitionStage;
use facewatch_core::recognition::infrastructure::onnx_arcface_embedder::OnnxArcFaceEmbedder;
use facewatch_core::shared::model_resolver::{
    self, ModelSpec, FACE_DETECTION_MODEL, FACE_EMBEDDING_MODEL,
};
use facewatch_core::shared::settings::{ConfigError, Settings};
use facewatch_core::unknown::domain::encounter_gate::EncounterGate;
use facewatch_core::unknown::domain::unknown_face_logger::{
    spawn_unknown_face_logger, UnknownFaceLogger,
};
use facewatch_core::unknown::infrastructure::jpeg_crop_writer::JpegCropWriter;

/// Real-time face recognition that steers a vehicle.
#[derive(Parser)]
#[command(name = "facewatch", version)]
struct Cli {
    /// Settings file (default: the platform config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Identity database, overriding the settings file.
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recognize faces from the camera and dispatch vehicle commands.
    Run(RunArgs),

    /// Add reference images for a person.
    Register {
        name: String,

        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Embed each whole image instead of its largest detected face.
        #[arg(long)]
        no_detect: bool,
    },

    /// Print registered identities.
    List,

    /// Write a settings file with every default filled in.
    InitConfig {
        /// Replace an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Replay a directory of images instead of opening the camera.
    #[arg(long)]
    images: Option<PathBuf>,

    /// Recognize and log only; never connect to the vehicle.
    #[arg(long)]
    no_vehicle: bool,

    /// Vehicle control address (host:port).
    #[arg(long)]
    vehicle: Option<String>,

    /// Camera device, e.g. /dev/video1.
    #[arg(long)]
    device: Option<String>,

    /// Face detection confidence threshold (0.0-1.0).
    #[arg(long)]
    confidence: Option<f64>,

    /// Minimum face size in pixels.
    #[arg(long)]
    min_face_size: Option<u32>,

    /// Cosine similarity needed to accept a match (0.0-1.0).
    #[arg(long)]
    similarity: Option<f64>,

    /// Directory for unknown-face crops.
    #[arg(long)]
    unknown_dir: Option<PathBuf>,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    if let Command::InitConfig { force } = cli.command {
        return init_config(cli.config.as_deref(), cli.database, force);
    }

    let mut settings = load_settings(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        settings.store.database_path = database;
    }

    match cli.command {
        Command::Run(args) => {
            apply_run_overrides(&mut settings, &args);
            settings.validate()?;
            run_pipeline(&settings, &args)
        }
        Command::Register {
            name,
            images,
            no_detect,
        } => {
            settings.validate()?;
            register(&settings, &name, &images, no_detect)
        }
        Command::List => list(&settings),
        Command::InitConfig { .. } => Ok(()),
    }
}

/// An explicit `--config` must exist; only the default location may be absent.
fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    match path {
        Some(path) => {
            log::debug!("Loading settings from {}", path.display());
            Settings::load(path)
        }
        None => match Settings::default_path() {
            Some(path) => Settings::load_or_default(&path),
            None => Ok(Settings::default()),
        },
    }
}

fn init_config(
    path: Option<&Path>,
    database: Option<PathBuf>,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Settings::default_path()
            .ok_or("no config directory on this platform; pass --config")?,
    };
    let mut settings = Settings::default();
    if let Some(database) = database {
        settings.store.database_path = database;
    }
    settings.save(&path, force)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn apply_run_overrides(settings: &mut Settings, args: &RunArgs) {
    if let Some(address) = &args.vehicle {
        settings.control.vehicle_address = address.clone();
    }
    if let Some(device) = &args.device {
        settings.camera.device = device.clone();
    }
    if let Some(confidence) = args.confidence {
        settings.detection.confidence_threshold = confidence;
    }
    if let Some(size) = args.min_face_size {
        settings.detection.min_face_size = size;
    }
    if let Some(similarity) = args.similarity {
        settings.recognition.similarity_threshold = similarity;
    }
    if let Some(dir) = &args.unknown_dir {
        settings.unknown_faces.directory = dir.clone();
    }
}

fn run_pipeline(settings: &Settings, args: &RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(open_store(settings, false)?);
    let identities = store.lookup_all().len();
    if identities == 0 {
        log::warn!("No identities registered; every face will be treated as unknown");
    } else {
        log::info!("Loaded {identities} identities");
    }

    let detection_model = resolve_model(FACE_DETECTION_MODEL, settings.detection.model_path.as_deref())?;
    let embedding_model = resolve_model(FACE_EMBEDDING_MODEL, settings.recognition.model_path.as_deref())?;
    let embedder: Arc<dyn FaceEmbedder> = Arc::new(OnnxArcFaceEmbedder::new(
        &embedding_model,
        intra_threads(settings.recognition.workers),
    )?);

    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);
    ctrlc::set_handler(move || {
        log::info!("Interrupt received, shutting down");
        flag.store(true, Ordering::Relaxed);
    })?;

    let unknown_logger = UnknownFaceLogger::new(
        &settings.unknown_faces.directory,
        Box::new(JpegCropWriter::default()),
        EncounterGate::new(
            settings.unknown_cooldown(),
            settings.unknown_faces.same_face_threshold,
        ),
        settings.unknown_faces.max_images,
    );
    let (unknown_sink, unknown_handle) =
        spawn_unknown_face_logger(unknown_logger, settings.queues.unknown_capacity);
    let recognition = RecognitionStage::new(
        embedder,
        Arc::clone(&store),
        settings.recognition.similarity_threshold,
    )
    .with_unknown_sink(unknown_sink.clone());

    let dispatcher = if args.no_vehicle {
        log::info!("Vehicle disabled; decisions are logged only");
        None
    } else {
        let channel = TcpCommandChannel::new(
            settings.control.vehicle_address.clone(),
            Duration::from_millis(settings.control.connect_timeout_ms),
        );
        Some(CommandDispatcher::spawn(
            Box::new(channel),
            settings.queues.command_capacity,
            Duration::from_millis(settings.control.retry_delay_ms),
        ))
    };

    let detector_threads = intra_threads(settings.detection.workers);
    let detector_factory: DetectorFactory = Box::new(
        move || -> Result<Box<dyn FaceDetector>, Box<dyn std::error::Error>> {
            let detector = OnnxYoloFaceDetector::new(
                &detection_model,
                DEFAULT_CANDIDATE_CONFIDENCE,
                detector_threads,
            )?;
            Ok(Box::new(detector))
        },
    );

    let stages = PipelineStages {
        source: build_source(settings, args.images.as_deref()),
        detector_factory,
        filter: detection_filter(settings),
        recognition,
        policy: DecisionPolicy::new(command_mapping(settings), settings.debounce_window()),
        commands: dispatcher.as_ref().map(|d| d.sender()),
        store,
    };
    let config = PipelineConfig {
        detection_workers: settings.detection.workers,
        recognition_workers: settings.recognition.workers,
        frame_queue_capacity: settings.queues.frame_capacity,
        face_queue_capacity: settings.queues.face_capacity,
        result_queue_capacity: settings.queues.result_capacity,
        persist_interval: settings.persist_interval(),
        cancelled,
    };

    let outcome = ThreadedPipelineExecutor::new().execute(
        stages,
        config,
        Box::new(StdoutPipelineLogger::default()),
    );

    // The pipeline has released its stages; wind down the helper threads
    // whether or not it succeeded, so the vehicle always gets its final stop.
    let unknown_dropped = unknown_sink.dropped();
    drop(unknown_sink);
    let unknown_written = unknown_handle
        .join()
        .map_err(|_| "Unknown-face logger thread panicked")?;
    log::info!("Logged {unknown_written} unknown faces ({unknown_dropped} dropped)");

    if let Some(dispatcher) = dispatcher {
        let report = dispatcher.shutdown();
        log::info!(
            "Vehicle commands: {} sent, {} failed, {} dropped",
            report.sent,
            report.failed,
            report.dropped
        );
    }

    outcome?;
    Ok(())
}

fn register(
    settings: &Settings,
    name: &str,
    images: &[PathBuf],
    no_detect: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(open_store(settings, true)?);
    let embedding_model = resolve_model(FACE_EMBEDDING_MODEL, settings.recognition.model_path.as_deref())?;
    let embedder = Arc::new(OnnxArcFaceEmbedder::new(&embedding_model, intra_threads(1))?);
    let recognition = RecognitionStage::new(
        embedder,
        Arc::clone(&store),
        settings.recognition.similarity_threshold,
    );

    let mut detection = if no_detect {
        None
    } else {
        let detection_model =
            resolve_model(FACE_DETECTION_MODEL, settings.detection.model_path.as_deref())?;
        let detector = OnnxYoloFaceDetector::new(
            &detection_model,
            DEFAULT_CANDIDATE_CONFIDENCE,
            intra_threads(1),
        )?;
        Some(DetectionStage::new(Box::new(detector), detection_filter(settings)))
    };

    // Embed everything first so a bad image leaves the store untouched.
    let mut embeddings = Vec::with_capacity(images.len());
    for (index, path) in images.iter().enumerate() {
        let frame = Arc::new(load_frame(path, index)?);
        let crop = match detection.as_mut() {
            Some(stage) => stage
                .detect(Arc::clone(&frame))?
                .max_by_key(|face| face.rect.area())
                .ok_or_else(|| format!("No face found in {}", path.display()))?
                .crop(),
            None => frame.crop(0, 0, frame.width(), frame.height()),
        }
        .ok_or_else(|| format!("Empty face crop in {}", path.display()))?;
        embeddings.push(recognition.embed(&crop)?);
        log::info!("Embedded {}", path.display());
    }

    let registered_at = Utc::now();
    for embedding in embeddings {
        store.upsert(name, embedding, IdentityMetadata::registered_at(registered_at))?;
    }
    store.persist()?;

    let snapshot = store.lookup_all();
    let references = snapshot.get(name.trim()).map_or(0, |r| r.embeddings.len());
    log::info!(
        "Registered '{}' ({references} reference embeddings) in {}",
        name.trim(),
        settings.store.database_path.display()
    );
    Ok(())
}

fn list(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(settings, true)?;
    let snapshot = store.lookup_all();
    if snapshot.is_empty() {
        println!("No identities registered");
        return Ok(());
    }
    for record in snapshot.records() {
        let meta = &record.metadata;
        let last_seen = meta
            .last_seen
            .map_or_else(|| "never".to_string(), |t| t.to_rfc3339());
        println!(
            "{:20} refs {:2}  added {}  last seen {}  confidence {:.3}  matches {}",
            record.name,
            record.embeddings.len(),
            meta.added_at.to_rfc3339(),
            last_seen,
            meta.confidence,
            meta.match_count
        );
    }
    Ok(())
}

fn open_store(settings: &Settings, create: bool) -> Result<EmbeddingStore, Box<dyn std::error::Error>> {
    let path = settings.store.database_path.clone();
    let repository = if create {
        JsonIdentityRepository::open_or_create(path)
    } else {
        JsonIdentityRepository::open(path)
    };
    Ok(EmbeddingStore::open(
        Box::new(repository),
        settings.recognition.embedding_dimension,
        settings.recognition.confidence_ema_alpha,
    )?)
}

fn build_source(settings: &Settings, images: Option<&Path>) -> Box<dyn FrameSource> {
    match images {
        Some(dir) => Box::new(ImageDirectorySource::new(dir).with_fps(settings.camera.fps)),
        None => Box::new(FfmpegCameraSource::new(CameraOptions {
            device: settings.camera.device.clone(),
            input_format: settings.camera.input_format.clone(),
            width: settings.camera.width,
            height: settings.camera.height,
            fps: settings.camera.fps,
        })),
    }
}

fn detection_filter(settings: &Settings) -> DetectionFilter {
    DetectionFilter {
        confidence_threshold: settings.detection.confidence_threshold,
        min_face_size: settings.detection.min_face_size,
        crop_padding: settings.detection.crop_padding,
    }
}

fn command_mapping(settings: &Settings) -> CommandMapping {
    CommandMapping {
        known: settings.control.known_command,
        unknown: settings.control.unknown_command,
        per_identity: settings.control.identity_commands.clone(),
    }
}

/// ONNX intra-op threads per model instance when `workers` instances share
/// the machine.
fn intra_threads(workers: usize) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    (cores / workers.max(1)).max(1)
}

fn resolve_model(
    spec: ModelSpec,
    override_path: Option<&Path>,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    log::info!("Resolving model: {}", spec.name);
    let name = spec.name;
    let path = model_resolver::resolve(
        spec,
        override_path,
        Some(Box::new(move |downloaded: u64, total: u64| {
            download_progress(name, downloaded, total)
        })),
    )?;
    Ok(path)
}

fn download_progress(name: &str, downloaded: u64, total: u64) {
    if total > 0 {
        let pct = (downloaded as f64 / total as f64 * 100.0) as u32;
        eprint!("\rDownloading {name}... {pct}%");
        if downloaded >= total {
            eprintln!();
        }
    } else {
        eprint!("\rDownloading {name}... {downloaded} bytes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::control::domain::command::Command as VehicleCommand;
    use facewatch_core::recognition::domain::match_result::Subject;

    fn run_args(argv: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Command::Run(args) => args,
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_flags_override_settings() {
        let args = run_args(&[
            "facewatch",
            "run",
            "--vehicle",
            "10.0.0.2:9000",
            "--similarity",
            "0.5",
            "--min-face-size",
            "60",
        ]);
        let mut settings = Settings::default();
        apply_run_overrides(&mut settings, &args);
        assert_eq!(settings.control.vehicle_address, "10.0.0.2:9000");
        assert_eq!(settings.recognition.similarity_threshold, 0.5);
        assert_eq!(settings.detection.min_face_size, 60);
        assert_eq!(settings.camera.device, "/dev/video0");
    }

    #[test]
    fn test_register_requires_an_image() {
        assert!(Cli::try_parse_from(["facewatch", "register", "alice"]).is_err());
        assert!(Cli::try_parse_from(["facewatch", "register", "alice", "a.jpg"]).is_ok());
    }

    #[test]
    fn test_global_database_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["facewatch", "list", "--database", "/tmp/db.json"]).unwrap();
        assert_eq!(cli.database, Some(PathBuf::from("/tmp/db.json")));
    }

    #[test]
    fn test_command_mapping_from_settings() {
        let mut settings = Settings::default();
        settings
            .control
            .identity_commands
            .insert("carol".into(), VehicleCommand::RotateLeft);
        let mapping = command_mapping(&settings);
        assert_eq!(
            mapping.command_for(&Subject::Known("carol".into())),
            Some(VehicleCommand::RotateLeft)
        );
        assert_eq!(mapping.command_for(&Subject::Unknown), Some(VehicleCommand::Stop));
    }

    #[test]
    fn test_explicit_missing_config_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("typo.json");
        assert!(matches!(
            load_settings(Some(&path)),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_init_config_writes_loadable_defaults_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.json");
        let database = tmp.path().join("faces.json");

        init_config(Some(&path), Some(database.clone()), false).unwrap();
        let written = load_settings(Some(&path)).unwrap();
        assert_eq!(written.store.database_path, database);
        assert_eq!(written.detection, Settings::default().detection);

        assert!(init_config(Some(&path), None, false).is_err());
        init_config(Some(&path), None, true).unwrap();
    }

    #[test]
    fn test_intra_threads_is_at_least_one() {
        assert!(intra_threads(0) >= 1);
        assert_eq!(intra_threads(usize::MAX), 1);
    }
}
