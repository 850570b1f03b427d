//! Command-line interface: one-shot augmentation and document inspection.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::augment::{self, AugmentConfig};
use crate::config::LogLevel;
use crate::error::CliError;
use crate::model::{ClassId, ClassList, ImageRecord, IntegrityIssue, LoadedAnnotations, load_annotations};

/// The annocanvas CLI application.
#[derive(Parser, Debug)]
#[command(name = "annocanvas")]
#[command(version, about)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Engine configuration file (default: platform config directory).
    #[arg(long, global = true)]
    pub engine_config: Option<PathBuf>,

    /// Override the configured log level (error, warn, info, debug, trace).
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Augment one image together with its annotations.
    Augment(AugmentArgs),
    /// Summarise an annotation document and report integrity issues.
    Inspect(InspectArgs),
}

#[derive(clap::Args, Debug)]
pub struct AugmentArgs {
    /// Source image (any format the image crate decodes).
    #[arg(long)]
    pub image: PathBuf,

    /// Annotation document for the source image.
    #[arg(long)]
    pub annotations: Option<PathBuf>,

    /// Class list JSON, used to report dangling class references.
    #[arg(long)]
    pub classes: Option<PathBuf>,

    /// Augmentation recipe JSON. Flags below override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub flip_horizontal: bool,

    #[arg(long)]
    pub flip_vertical: bool,

    /// Clockwise rotation in degrees.
    #[arg(long, allow_hyphen_values = true)]
    pub rotate: Option<f32>,

    #[arg(long, allow_hyphen_values = true)]
    pub brightness: Option<f32>,

    #[arg(long, allow_hyphen_values = true)]
    pub contrast: Option<f32>,

    #[arg(long, allow_hyphen_values = true)]
    pub saturation: Option<f32>,

    /// Where to write the augmented PNG.
    #[arg(long)]
    pub out_image: PathBuf,

    /// Where to write the transformed annotation document.
    #[arg(long)]
    pub out_annotations: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct InspectArgs {
    /// Annotation document to inspect.
    #[arg(long)]
    pub annotations: PathBuf,

    /// Class list JSON for names and dangling-reference checks.
    #[arg(long)]
    pub classes: Option<PathBuf>,
}

/// Run a parsed command and return the report to print.
pub fn execute(cli: &Cli) -> Result<String, CliError> {
    match &cli.command {
        Commands::Augment(args) => run_augment(args),
        Commands::Inspect(args) => run_inspect(args),
    }
}

fn read_string(path: &Path) -> Result<String, CliError> {
    std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<(), CliError> {
    std::fs::write(path, bytes).map_err(|source| CliError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn read_classes(path: Option<&Path>) -> Result<Option<ClassList>, CliError> {
    let Some(path) = path else {
        return Ok(None);
    };
    let json = read_string(path)?;
    serde_json::from_str(&json)
        .map(Some)
        .map_err(|source| CliError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Load a document leniently. Without a class list, dangling-class checks
/// are meaningless and dropped.
fn read_annotations(path: &Path, classes: Option<&ClassList>) -> Result<LoadedAnnotations, CliError> {
    let json = read_string(path)?;
    let empty = ClassList::new();
    let mut loaded =
        load_annotations(&json, classes.unwrap_or(&empty)).map_err(|source| CliError::Schema {
            path: path.to_path_buf(),
            source,
        })?;
    if classes.is_none() {
        loaded
            .issues
            .retain(|issue| !matches!(issue, IntegrityIssue::DanglingClass { .. }));
    }
    Ok(loaded)
}

fn augment_config(args: &AugmentArgs) -> Result<AugmentConfig, CliError> {
    let mut config = match &args.config {
        Some(path) => {
            let json = read_string(path)?;
            serde_json::from_str::<AugmentConfig>(&json).map_err(|source| CliError::Parse {
                path: path.clone(),
                source,
            })?
        }
        None => AugmentConfig::default(),
    };
    config.flip_horizontal |= args.flip_horizontal;
    config.flip_vertical |= args.flip_vertical;
    if let Some(rotate) = args.rotate {
        config.rotation_degrees = rotate;
    }
    if let Some(brightness) = args.brightness {
        config.brightness = brightness;
    }
    if let Some(contrast) = args.contrast {
        config.contrast = contrast;
    }
    if let Some(saturation) = args.saturation {
        config.saturation = saturation;
    }
    Ok(config)
}

fn run_augment(args: &AugmentArgs) -> Result<String, CliError> {
    let config = augment_config(args)?;
    let blob = std::fs::read(&args.image).map_err(|source| CliError::Read {
        path: args.image.clone(),
        source,
    })?;
    let classes = read_classes(args.classes.as_deref())?;
    let loaded = match &args.annotations {
        Some(path) => read_annotations(path, classes.as_ref())?,
        None => LoadedAnnotations::default(),
    };
    for issue in &loaded.issues {
        log::warn!("{}", issue);
    }

    let output = augment::apply(&blob, &config, &loaded.annotations)?;
    write_bytes(&args.out_image, &output.blob)?;
    log::info!("Wrote {:?}", args.out_image);

    if let Some(path) = &args.out_annotations {
        let mut record = ImageRecord::new(0, Vec::new(), output.width, output.height);
        record.annotations = output.annotations.clone();
        write_bytes(path, record.annotations_to_json()?.as_bytes())?;
        log::info!("Wrote {:?}", path);
    }

    let mut report = format!(
        "Augmented to {}x{}: {} annotation(s) kept, {} dropped\n",
        output.width,
        output.height,
        output.annotations.len(),
        output.dropped.len()
    );
    if !output.dropped.is_empty() {
        let ids: Vec<String> = output.dropped.iter().map(ToString::to_string).collect();
        let _ = writeln!(report, "Dropped ids: {}", ids.join(", "));
    }
    Ok(report)
}

fn run_inspect(args: &InspectArgs) -> Result<String, CliError> {
    let classes = read_classes(args.classes.as_deref())?;
    let loaded = read_annotations(&args.annotations, classes.as_ref())?;

    let mut per_class: BTreeMap<ClassId, usize> = BTreeMap::new();
    let mut per_kind: BTreeMap<&'static str, usize> = BTreeMap::new();
    for annotation in &loaded.annotations {
        *per_class.entry(annotation.class_id).or_default() += 1;
        *per_kind.entry(annotation.shape.kind_name()).or_default() += 1;
    }

    let mut report = format!("{} annotation(s)\n", loaded.annotations.len());
    let _ = writeln!(report, "By class:");
    for (class_id, count) in &per_class {
        let name = match &classes {
            Some(classes) => classes.resolve(*class_id).name().to_string(),
            None => "-".to_string(),
        };
        let _ = writeln!(report, "  {:>4} {:<20} {}", class_id, name, count);
    }
    let _ = writeln!(report, "By kind:");
    for (kind, count) in &per_kind {
        let _ = writeln!(report, "  {:<20} {}", kind, count);
    }
    if loaded.issues.is_empty() {
        let _ = writeln!(report, "No integrity issues");
    } else {
        let _ = writeln!(report, "{} integrity issue(s):", loaded.issues.len());
        for issue in &loaded.issues {
            let _ = writeln!(report, "  - {}", issue);
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_augment_flags() {
        let cli = Cli::try_parse_from([
            "annocanvas",
            "--log-level",
            "debug",
            "augment",
            "--image",
            "in.png",
            "--out-image",
            "out.png",
            "--flip-horizontal",
            "--rotate",
            "-90",
        ])
        .unwrap();
        assert_eq!(cli.log_level, Some(LogLevel::Debug));
        let Commands::Augment(args) = &cli.command else {
            panic!("Expected augment");
        };
        let config = augment_config(args).unwrap();
        assert!(config.flip_horizontal);
        assert_eq!(config.rotation_degrees, -90.0);
    }

    #[test]
    fn test_missing_required_args_rejected() {
        assert!(Cli::try_parse_from(["annocanvas", "augment", "--image", "in.png"]).is_err());
        assert!(Cli::try_parse_from(["annocanvas", "inspect"]).is_err());
    }

    #[test]
    fn test_inspect_reports_counts_and_issues() {
        let dir = tempfile::tempdir().unwrap();
        let annotations = dir.path().join("a.json");
        std::fs::write(
            &annotations,
            r#"[
                {"id": 1, "classId": 1, "type": "box", "x": 0, "y": 0, "width": 5, "height": 5},
                {"id": 2, "classId": 9, "type": "box", "x": 0, "y": 0, "width": 5, "height": 5},
                {"id": 3, "classId": 1, "type": "nonsense"}
            ]"#,
        )
        .unwrap();
        let classes = dir.path().join("classes.json");
        std::fs::write(&classes, r#"[{"id": 1, "name": "car", "color": [255, 0, 0]}]"#).unwrap();

        let report = run_inspect(&InspectArgs {
            annotations,
            classes: Some(classes),
        })
        .unwrap();
        assert!(report.starts_with("2 annotation(s)"));
        assert!(report.contains("car"));
        assert!(report.contains("unknown"));
        assert!(report.contains("2 integrity issue(s)"));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let result = run_inspect(&InspectArgs {
            annotations: PathBuf::from("/definitely/not/here.json"),
            classes: None,
        });
        assert!(matches!(result, Err(CliError::Read { .. })));
    }
}
