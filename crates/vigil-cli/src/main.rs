use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vigil_core::uploads::ANNOTATED_PREFIX;
use vigil_core::pipeline::DEFAULT_MATCH_THRESHOLD;
use vigil_core::{
    Annotator, FaceDetector, FaceRecognizer, Gallery, MatchPolicy, MatchSettings,
    MissingFacePolicy, ObjectDetector, Pipeline, YoloParams,
};

#[derive(Parser)]
#[command(
    name = "vigil",
    version,
    about = "Screen images against a watchlist and scan X-rays for objects"
)]
struct Cli {
    #[command(flatten)]
    opts: Options,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Options {
    /// Directory containing the ONNX models
    #[arg(long, global = true, env = "VIGIL_MODEL_DIR")]
    model_dir: Option<PathBuf>,
    /// Reference images of persons of interest
    #[arg(
        long,
        global = true,
        env = "VIGIL_GALLERY_DIR",
        default_value = "static/criminals"
    )]
    gallery_dir: PathBuf,
    /// Where annotated images are written
    #[arg(long, global = true, env = "VIGIL_UPLOAD_DIR", default_value = "static/uploads")]
    output_dir: PathBuf,
    /// Euclidean distance below which a face matches
    #[arg(
        long,
        global = true,
        env = "VIGIL_MATCH_THRESHOLD",
        default_value_t = DEFAULT_MATCH_THRESHOLD,
        value_parser = parse_threshold
    )]
    threshold: f32,
    /// Which qualifying entry wins: "first" or "nearest"
    #[arg(long, global = true, env = "VIGIL_MATCH_POLICY", default_value = "first")]
    policy: MatchPolicy,
    /// Reference images without a usable face: "skip" or "abort"
    #[arg(
        long,
        global = true,
        env = "VIGIL_GALLERY_MISSING_FACE",
        default_value = "skip"
    )]
    missing_face: MissingFacePolicy,
    /// Caption font (TrueType/OpenType)
    #[arg(long, global = true, env = "VIGIL_FONT_PATH")]
    font: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces and match them against the gallery
    Face {
        image: PathBuf,
        /// Output path (default: <output-dir>/annotated_<name>)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Detect objects in an X-ray scan
    Xray {
        image: PathBuf,
        /// Output path (default: <output-dir>/annotated_<name>)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Object model, relative to the model directory unless absolute
        #[arg(long, env = "VIGIL_OBJECT_MODEL", default_value = "xray.onnx")]
        model: PathBuf,
        /// Class labels file, relative to the model directory unless absolute
        #[arg(long, env = "VIGIL_OBJECT_LABELS", default_value = "xray.labels")]
        labels: PathBuf,
        /// Minimum class score
        #[arg(long, env = "VIGIL_OBJECT_CONFIDENCE", default_value_t = 0.25)]
        confidence: f32,
    },
    /// Load the gallery and list its entries
    Gallery,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let opts = &cli.opts;
    let model_dir = opts.model_dir.clone().unwrap_or_else(vigil_core::default_model_dir);

    match &cli.command {
        Commands::Face { image, output } => {
            let (mut detector, mut recognizer) = face_models(&model_dir)?;
            let gallery = load_gallery(opts, &mut detector, &mut recognizer)?;

            let pipeline = build_pipeline(opts, gallery)?;
            let output = output_path(opts, image, output.as_deref())?;
            let report = pipeline.run_face(image, &output, &mut detector, &mut recognizer)?;
            tracing::info!(
                output = %report.output.path.display(),
                matches = report.matches().count(),
                "face scan written"
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Xray {
            image,
            output,
            model,
            labels,
            confidence,
        } => {
            let labels = model_dir.join(labels);
            let params = YoloParams {
                conf_threshold: *confidence,
                ..YoloParams::default()
            };
            let mut detector = ObjectDetector::load(
                &model_dir.join(model),
                labels.exists().then_some(labels.as_path()),
                params,
            )?;

            let pipeline = build_pipeline(opts, Gallery::default())?;
            let output = output_path(opts, image, output.as_deref())?;
            let report = pipeline.run_xray(image, &output, &mut detector)?;
            tracing::info!(
                output = %report.output.path.display(),
                objects = report.regions.len(),
                "xray scan written"
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Gallery => {
            let (mut detector, mut recognizer) = face_models(&model_dir)?;
            let gallery = load_gallery(opts, &mut detector, &mut recognizer)?;

            println!("{}", serde_json::to_string_pretty(gallery.entries())?);
        }
    }

    Ok(())
}

/// Threshold argument: a finite number above zero.
fn parse_threshold(raw: &str) -> Result<f32, String> {
    let value: f32 = raw.trim().parse().map_err(|e| format!("{e}"))?;
    vigil_core::check_threshold(value).map_err(|e| e.to_string())
}

fn face_models(model_dir: &Path) -> Result<(FaceDetector, FaceRecognizer)> {
    let detector = FaceDetector::load(&model_dir.join(vigil_core::FACE_DETECTOR_MODEL))?;
    let recognizer = FaceRecognizer::load(&model_dir.join(vigil_core::FACE_RECOGNIZER_MODEL))?;
    Ok((detector, recognizer))
}

fn load_gallery(
    opts: &Options,
    detector: &mut FaceDetector,
    recognizer: &mut FaceRecognizer,
) -> Result<Gallery> {
    let gallery = Pipeline::load_gallery(&opts.gallery_dir, detector, recognizer, opts.missing_face)
        .with_context(|| format!("loading gallery from {}", opts.gallery_dir.display()))?;
    tracing::info!(
        dir = %opts.gallery_dir.display(),
        entries = gallery.len(),
        "gallery loaded"
    );
    Ok(gallery)
}

fn build_pipeline(opts: &Options, gallery: Gallery) -> Result<Pipeline> {
    let annotator = match &opts.font {
        Some(path) => Annotator::with_font_file(path)?,
        None => Annotator::new(None),
    };
    let settings = MatchSettings {
        threshold: opts.threshold,
        policy: opts.policy,
    };
    Ok(Pipeline::new(Arc::new(gallery), settings, annotator)?)
}

/// Explicit `--output`, or `annotated_<name>` inside the output directory.
fn output_path(opts: &Options, image: &Path, explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let name = image
        .file_name()
        .with_context(|| format!("{} has no file name", image.display()))?
        .to_string_lossy();
    std::fs::create_dir_all(&opts.output_dir)
        .with_context(|| format!("creating {}", opts.output_dir.display()))?;
    Ok(opts.output_dir.join(format!("{ANNOTATED_PREFIX}{name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_face_with_overrides() {
        let cli = Cli::try_parse_from([
            "vigil",
            "face",
            "in.jpg",
            "--threshold",
            "0.8",
            "--policy",
            "nearest",
            "--gallery-dir",
            "/g",
        ])
        .unwrap();
        assert_eq!(cli.opts.threshold, 0.8);
        assert_eq!(cli.opts.policy, MatchPolicy::Nearest);
        assert_eq!(cli.opts.gallery_dir, PathBuf::from("/g"));
        assert!(matches!(
            cli.command,
            Commands::Face { ref image, output: None } if image == Path::new("in.jpg")
        ));
    }

    #[test]
    fn test_rejects_unknown_policy() {
        assert!(Cli::try_parse_from(["vigil", "--policy", "random", "gallery"]).is_err());
    }

    #[test]
    fn test_rejects_unusable_threshold() {
        for raw in ["nan", "inf", "0", "-1", "loose"] {
            let parsed = Cli::try_parse_from(["vigil", "--threshold", raw, "gallery"]);
            assert!(parsed.is_err(), "{raw}");
        }
        let cli = Cli::try_parse_from(["vigil", "gallery"]).unwrap();
        assert_eq!(cli.opts.threshold, DEFAULT_MATCH_THRESHOLD);
    }

    #[test]
    fn test_default_output_path() {
        let dir = std::env::temp_dir().join(format!("vigil-cli-test-{}", std::process::id()));
        let cli = Cli::try_parse_from(["vigil", "--output-dir", dir.to_str().unwrap(), "gallery"])
            .unwrap();
        let path = output_path(&cli.opts, Path::new("/tmp/scan.png"), None).unwrap();
        assert_eq!(path, dir.join("annotated_scan.png"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
