use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::bounded;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use emberwatch_lib::archive::FaceArchive;
use emberwatch_lib::audio::{self, recorder::MicRecorder};
use emberwatch_lib::config::AppConfig;
use emberwatch_lib::enrollment::EnrollmentFlow;
use emberwatch_lib::gallery::record::GalleryRecord;
use emberwatch_lib::gallery::{Gallery, RECORD_FILE};
use emberwatch_lib::paths::AppPaths;
use emberwatch_lib::pipeline::overlay::LogOverlaySink;
use emberwatch_lib::pipeline::{EnrollmentSettings, MainLoop, StopSignal};
use emberwatch_lib::speech::CommandTranscriber;
use emberwatch_lib::vision::source::ImageDirSource;
use emberwatch_lib::vision::{self, FaceDetector, FaceEmbedder, Frame};

#[derive(Parser)]
#[command(name = "emberwatch")]
#[command(about = "Recognize faces in a frame stream and enroll new ones by voice")]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Keep config, data, and cache under this directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the recognition loop over a directory of frames
    Run {
        /// Directory of PNG/JPEG frames, replayed in file-name order
        #[arg(long)]
        frames: PathBuf,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove { label: String },
    /// Enroll the largest face in an image under a label
    Enroll { label: String, image: PathBuf },
    /// Archive an image and every face detected in it
    Crop { id: String, image: PathBuf },
    /// List archived images for an identifier
    Archived {
        id: String,
        /// List cropped faces instead of originals
        #[arg(long)]
        cropped: bool,
    },
    /// List audio input devices
    Devices,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let paths = match &cli.data_dir {
        Some(root) => AppPaths::with_root(root),
        None => AppPaths::new()?,
    };
    paths.ensure_directories()?;

    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());
    let config = AppConfig::load_or_create(&config_path)?;

    match cli.command {
        Command::Run { frames } => run_loop(paths, config, frames).await,
        Command::List => list(&paths),
        Command::Remove { label } => {
            let (gallery, _, _) = open_gallery(&paths, &config)?;
            gallery.remove(&label)?;
            println!("Removed {}", label);
            Ok(())
        }
        Command::Enroll { label, image } => enroll(&paths, &config, &label, &image),
        Command::Crop { id, image } => crop(&paths, &config, &id, &image),
        Command::Archived { id, cropped } => {
            let archive = FaceArchive::new(paths.archive_dir());
            let files = if cropped {
                archive.list_cropped(&id)?
            } else {
                archive.list_images(&id)?
            };
            for file in files {
                println!("{}", file.display());
            }
            Ok(())
        }
        Command::Devices => {
            for device in audio::list_input_devices()? {
                println!(
                    "{}{} ({}, {} ch)",
                    device.name,
                    if device.is_default { " [default]" } else { "" },
                    device.host,
                    device.max_channels
                );
            }
            Ok(())
        }
    }
}

type Collaborators = (Arc<Gallery>, Arc<dyn FaceDetector>, Arc<dyn FaceEmbedder>);

fn open_gallery(paths: &AppPaths, config: &AppConfig) -> Result<Collaborators> {
    let detector = vision::build_detector(&config.detector);
    let embedder = vision::build_embedder(&config.embedder, paths)?;
    let (gallery, _) = Gallery::load(
        &paths.gallery_dir(),
        config.recognition.match_threshold,
        config.gallery.cache_descriptors,
        detector.as_ref(),
        embedder.as_ref(),
    )?;
    Ok((Arc::new(gallery), detector, embedder))
}

fn build_enrollment(
    paths: &AppPaths,
    config: &AppConfig,
    gallery: &Arc<Gallery>,
) -> Option<EnrollmentSettings> {
    if !config.enrollment.enabled {
        log::info!("Enrollment disabled by config");
        return None;
    }
    let Some(program) = config.speech.program.clone() else {
        log::warn!("Enrollment disabled: no speech.program configured");
        return None;
    };

    let transcriber = CommandTranscriber::new(program, config.speech.args.clone(), paths.tmp_audio_dir());
    let mut flow = EnrollmentFlow::new(
        Arc::clone(gallery),
        Arc::new(MicRecorder::new(config.audio.clone())),
        Arc::new(transcriber),
        config.enrollment.record_duration(),
        paths.capture_dir(),
    );
    if config.archive.enabled {
        flow = flow.with_archive(Arc::new(FaceArchive::new(paths.archive_dir())));
    }

    Some(EnrollmentSettings {
        flow: Arc::new(flow),
        workers: config.enrollment.workers,
        queue_depth: config.enrollment.queue_depth,
    })
}

async fn run_loop(paths: AppPaths, config: AppConfig, frames: PathBuf) -> Result<()> {
    let (gallery, detector, embedder) = open_gallery(&paths, &config)?;

    let mut main_loop = MainLoop::new(
        Arc::clone(&gallery),
        detector,
        embedder,
        config.recognition.interval(),
    )
    .with_frame_interval(config.source.frame_interval())
    .with_label_ttl(config.recognition.label_ttl());
    if let Some(settings) = build_enrollment(&paths, &config, &gallery) {
        main_loop = main_loop.with_enrollment(settings);
    }

    let (stop_tx, stop_rx) = bounded::<StopSignal>(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupt received, stopping...");
            let _ = stop_tx.send(StopSignal);
        }
    });

    // Frame acquisition and rendering stay on one dedicated thread
    let summary = tokio::task::spawn_blocking(move || {
        let source = ImageDirSource::open(&frames)?;
        let mut sink = LogOverlaySink::new();
        main_loop.run(Box::new(source), &mut sink, &stop_rx)
    })
    .await
    .context("Main loop thread failed")??;

    println!("exit:         {:?}", summary.exit);
    println!("frames:       {}", summary.frames);
    println!("detections:   {}", summary.detections);
    println!("dispatched:   {}", summary.dispatched);
    println!("rate limited: {}", summary.rate_limited);
    println!("recognized:   {}", summary.recognized);
    println!("unknown:      {}", summary.unknown);
    println!("failed:       {}", summary.failed);
    println!("enrolled:     {}", summary.enrolled);
    println!("abandoned:    {}", summary.abandoned);
    Ok(())
}

fn list(paths: &AppPaths) -> Result<()> {
    let record_path = paths.gallery_dir().join(RECORD_FILE);
    let record = GalleryRecord::load(&record_path)?.unwrap_or_default();

    if record.is_empty() {
        println!("No identities enrolled");
    }
    for entry in record.entries() {
        println!("{}\t{}", entry.label, paths.gallery_dir().join(&entry.image).display());
    }
    Ok(())
}

fn load_frame(image: &Path) -> Result<Frame> {
    let decoded = image::open(image)
        .with_context(|| format!("Failed to read image: {}", image.display()))?
        .to_rgb8();
    Ok(Frame::new(0, decoded))
}

fn enroll(paths: &AppPaths, config: &AppConfig, label: &str, image: &Path) -> Result<()> {
    let (gallery, detector, embedder) = open_gallery(paths, config)?;
    let frame = load_frame(image)?;

    let boxes = detector.detect(&frame)?;
    let bbox = vision::largest(&boxes).context("No face found in image")?;
    let descriptor = embedder.embed(&frame, &bbox)?;
    let stored = gallery.add(label, descriptor, &frame.crop(&bbox)?)?;

    println!("Enrolled {} ({})", label, stored.display());
    Ok(())
}

fn crop(paths: &AppPaths, config: &AppConfig, id: &str, image: &Path) -> Result<()> {
    let detector = vision::build_detector(&config.detector);
    let frame = load_frame(image)?;

    let faces = detector
        .detect(&frame)?
        .iter()
        .map(|bbox| frame.crop(bbox))
        .collect::<Result<Vec<_>>>()?;

    let archive = FaceArchive::new(paths.archive_dir());
    let receipt = archive.store(id, Some(frame.image()), &faces)?;

    if let Some(original) = &receipt.original {
        println!("original: {}", original.display());
    }
    for face in &receipt.cropped {
        println!("cropped:  {}", face.display());
    }
    Ok(())
}
