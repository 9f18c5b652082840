use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use image::RgbImage;
use rollcall_attendance::{Config, RecordStore, RedisStore, Registry, SystemClock};
use rollcall_core::{Embedding, FaceBox, FaceModel, ModelError, OnnxFaceModel};
use rollcall_hw::Camera;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance administration CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a student from a face photo
    Register {
        /// Full name
        #[arg(short, long)]
        name: String,
        /// Registration number (unique student ID)
        #[arg(short, long)]
        reg_number: String,
        /// Academic major
        #[arg(short, long)]
        major: String,
        /// Photo containing the student's face; moved into the image archive
        image: PathBuf,
    },
    /// Register every student listed in a JSON file
    BulkRegister {
        /// JSON array of {name, reg_number, major, image_path}
        file: PathBuf,
    },
    /// Show a student's record
    Info {
        reg_number: String,
    },
    /// List registered students
    List,
    /// Run camera diagnostics
    Test,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Register {
            name,
            reg_number,
            major,
            image,
        } => {
            let registry = registry(&config, true)?;
            if !registry.register(&name, &reg_number, &major, &image) {
                bail!("registration of {reg_number} failed (see log for details)");
            }
            println!("Student {name} ({reg_number}) registered.");
        }
        Commands::BulkRegister { file } => {
            let registry = registry(&config, true)?;
            let outcome = registry.bulk_register(&file)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.failed.is_empty() {
                bail!("{} of {} registrations failed", outcome.failed.len(), outcome.failed.len() + outcome.success.len());
            }
        }
        Commands::Info { reg_number } => {
            let registry = registry(&config, false)?;
            match registry.info(&reg_number) {
                Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                None => bail!("no student with registration number {reg_number}"),
            }
        }
        Commands::List => {
            let registry = registry(&config, false)?;
            let students = registry.list_all();
            if students.is_empty() {
                println!("No students registered");
            }
            for student in students {
                println!(
                    "{:<16} {:<32} last seen {}",
                    student.reg_number,
                    student.name.as_deref().unwrap_or("-"),
                    student.last_attendance
                );
            }
        }
        Commands::Test => camera_diagnostics(&config)?,
    }

    Ok(())
}

/// Stand-in for read-only commands, which never touch the face model.
struct NoModel;

impl FaceModel for NoModel {
    fn detect_face_locations(&self, _image: &RgbImage) -> Result<Vec<FaceBox>, ModelError> {
        Ok(Vec::new())
    }

    fn compute_embeddings(&self, _image: &RgbImage, _boxes: &[FaceBox]) -> Result<Vec<Embedding>, ModelError> {
        Ok(Vec::new())
    }
}

fn registry(config: &Config, with_model: bool) -> Result<Registry> {
    let store = RedisStore::new(&config.redis_url(), config.store_timeout())?;
    store
        .ping()
        .with_context(|| format!("redis unreachable at {}", config.redis_url()))?;
    let store: Arc<dyn RecordStore> = Arc::new(store);

    let model: Arc<dyn FaceModel> = if with_model {
        let model = OnnxFaceModel::load(&config.model_dir)
            .with_context(|| format!("failed to load face models from {}", config.model_dir.display()))?;
        Arc::new(model)
    } else {
        Arc::new(NoModel)
    };

    Ok(Registry::new(store, model, Arc::new(SystemClock), &config.images_dir))
}

fn camera_diagnostics(config: &Config) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for device in &devices {
        println!("  {}  {} ({}, {})", device.path, device.name, device.driver, device.bus);
    }

    let (index, camera) = Camera::open_first(&config.camera_indices)?;
    println!(
        "Opened /dev/video{index}: {}x{} {:?}",
        camera.width, camera.height, camera.fourcc
    );

    let frame = camera.capture_frame()?;
    println!(
        "Captured frame #{}: {}x{}, average brightness {:.1}",
        frame.sequence,
        frame.width(),
        frame.height(),
        frame.avg_brightness()
    );

    match OnnxFaceModel::load(&config.model_dir) {
        Ok(model) => {
            let faces = model.detect_face_locations(&frame.image)?;
            println!("Faces detected: {}", faces.len());
        }
        Err(err) => println!("Face models unavailable ({err}); skipping detection"),
    }
    Ok(())
}
