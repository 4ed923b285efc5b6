use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use exemplar::{
    BuiltinModel, ClassSet, ClassifierController, ControllerConfig, DatasetDocument, DirectoryCamera,
    FeatureExtractor, LabeledFeatureStore, LocalModelRepository, ModelManager, ModelRepository, NullSink,
    OnnxExtractor, PredictionResult, SampleImage, SavedModel, SessionState,
};
use log::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ModelArgs {
    /// Force a fresh download of the model files
    #[arg(short, long)]
    fresh: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Train on one directory of images per class and write the dataset
    Train {
        /// Class directories; each directory name becomes a label
        #[arg(required = true)]
        classes: Vec<PathBuf>,
        #[arg(short, long, default_value = "dataset.json")]
        output: PathBuf,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Classify image files against a trained dataset
    Classify {
        #[arg(short, long)]
        dataset: PathBuf,
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Replay a directory of images as a camera feed and print live predictions
    Watch {
        #[arg(short, long)]
        dataset: PathBuf,
        /// Directory of frames to replay
        feed: PathBuf,
        /// Stop after this many predictions
        #[arg(short, long, default_value_t = 10)]
        ticks: usize,
        /// Milliseconds between predictions (defaults to EXEMPLAR_TICK_MS or 1000)
        #[arg(short, long)]
        interval_ms: Option<u64>,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Store a trained dataset in the local model repository
    Save {
        #[arg(short, long)]
        dataset: PathBuf,
        #[arg(short, long)]
        name: String,
        #[arg(long, default_value = "local")]
        owner: String,
        #[arg(long)]
        public: bool,
    },
    /// List saved models visible to a user
    List {
        #[arg(long)]
        viewer: Option<String>,
    },
}

async fn load_extractor(fresh: bool) -> Result<OnnxExtractor> {
    let manager = ModelManager::new_default()?;
    let model = BuiltinModel::MobileNetV2;

    if fresh {
        info!("Fresh download requested - removing any existing model files...");
        manager.remove_download(&model.get_model_info())?;
    }

    let extractor = OnnxExtractor::with_manager(model, manager);
    extractor.load().await.context("Failed to load the embedding model")?;
    Ok(extractor)
}

fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Cannot read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            let ext = path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase());
            matches!(ext.as_deref(), Some("png" | "jpg" | "jpeg"))
        })
        .collect();
    files.sort();
    Ok(files)
}

fn read_dataset(path: &Path) -> Result<DatasetDocument> {
    let json = fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?;
    Ok(DatasetDocument::from_json(&json)?)
}

fn print_result(source: &str, result: &PredictionResult) {
    println!("{}:", source);
    for prediction in result.iter() {
        println!("  {:<20} {:>3}%", prediction.label, prediction.confidence);
    }
}

async fn train(dirs: Vec<PathBuf>, output: PathBuf, fresh: bool) -> Result<()> {
    let mut classes = ClassSet::new();
    for dir in &dirs {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Cannot derive a class name from {}", dir.display()))?;
        classes.add_class(name)?;
        for file in image_files(dir)? {
            classes.add_image(name, SampleImage::from_path(&file)?)?;
        }
        info!("Class '{}': {} images", name, classes.get(name).map_or(0, |c| c.count()));
    }

    let extractor = load_extractor(fresh).await?;
    let config = ControllerConfig::from_env().with_feature_dim(extractor.dim());
    let mut controller = ClassifierController::new(extractor, DirectoryCamera::new("."), config)?.with_classes(classes);

    let start = Instant::now();
    controller.train().await?;
    info!("Trained on {} images in {:.2?}", controller.classes().image_count(), start.elapsed());

    fs::write(&output, controller.export_dataset().to_json()?)
        .with_context(|| format!("Cannot write {}", output.display()))?;
    println!("Dataset written to {}", output.display());
    Ok(())
}

async fn classify(dataset: PathBuf, images: Vec<PathBuf>, fresh: bool) -> Result<()> {
    let doc = read_dataset(&dataset)?;
    let extractor = load_extractor(fresh).await?;
    let config = ControllerConfig::from_env();
    let mut store = LabeledFeatureStore::new(extractor.dim()).with_k(config.k);
    store.import_dataset(&doc)?;

    for path in &images {
        let frame = SampleImage::from_path(path)?.decode()?;
        match extractor.extract(&frame).and_then(|features| store.query(&features)) {
            Ok(result) => print_result(&path.display().to_string(), &result),
            Err(e) => eprintln!("{}: {}", path.display(), e),
        }
    }
    Ok(())
}

async fn watch(dataset: PathBuf, feed: PathBuf, ticks: usize, interval_ms: Option<u64>, fresh: bool) -> Result<()> {
    let doc = read_dataset(&dataset)?;
    let extractor = load_extractor(fresh).await?;
    let mut config = ControllerConfig::from_env().with_feature_dim(extractor.dim());
    if let Some(ms) = interval_ms {
        config = config.with_tick_interval(Duration::from_millis(ms));
    }

    let mut controller = ClassifierController::new(extractor, DirectoryCamera::new(feed), config)?;
    controller.import_dataset(&doc)?;
    if !controller.is_queryable() {
        bail!("Dataset {} has no examples", dataset.display());
    }

    let patience = controller.config().tick_interval * 5;
    let mut predictions = controller.subscribe();
    controller.predict(NullSink).await?;

    let mut seen = 0;
    while seen < ticks {
        match tokio::time::timeout(patience, predictions.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break,
            Err(_) if controller.state() == SessionState::Predicting => continue,
            Err(_) => bail!("Prediction stopped: the camera feed failed"),
        }
        let latest = predictions.borrow_and_update().clone();
        if let Some(result) = latest {
            seen += 1;
            print_result(&format!("tick {}", seen), &result);
        }
    }

    controller.stop_predict();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Train { classes, output, model } => train(classes, output, model.fresh).await,
        Command::Classify { dataset, images, model } => classify(dataset, images, model.fresh).await,
        Command::Watch { dataset, feed, ticks, interval_ms, model } => {
            watch(dataset, feed, ticks, interval_ms, model.fresh).await
        }
        Command::Save { dataset, name, owner, public } => {
            let repo = LocalModelRepository::new_default()?;
            repo.save(&SavedModel::new(name.as_str(), owner, public, read_dataset(&dataset)?))?;
            println!("Saved '{}' to {}", name, repo.dir().display());
            Ok(())
        }
        Command::List { viewer } => {
            let repo = LocalModelRepository::new_default()?;
            for summary in repo.list(viewer.as_deref())? {
                println!(
                    "{:<24} {:<8} {:<12} {} [{}]",
                    summary.name,
                    if summary.is_public { "public" } else { "private" },
                    summary.owner_id,
                    summary.created_at.format("%Y-%m-%d %H:%M"),
                    summary.labels.join(", ")
                );
            }
            Ok(())
        }
    }
}
