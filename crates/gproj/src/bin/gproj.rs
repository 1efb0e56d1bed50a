//! gproj CLI: calibrate a location and apply its G Projection.

use std::{
    error::Error,
    fs,
    path::{Path, PathBuf},
};

use clap::{Args, Parser, Subcommand};
use gproj::calib::{run_batch, CalibrationInput, SolverParams};
use gproj::core::Point2;
use gproj::projection::{
    load_path, peek_version, write_atomic, Detection, GProjection, ProjectedBox, ProjectionStore,
    SCHEMA_VERSION,
};
use serde::Serialize;

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Parser)]
#[command(name = "gproj")]
#[command(about = "Calibrate CCTV cameras against satellite imagery and project detections")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log through `tracing` as JSON lines (filter with RUST_LOG).
    #[cfg(feature = "tracing")]
    #[arg(long, global = true)]
    trace_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a calibration batch and save the artifact.
    Calibrate {
        /// JSON calibration batch.
        #[arg(long)]
        input: PathBuf,

        /// Optional JSON solver parameters; replaces the batch's `params`.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Artifact store root. Without it the artifact is not saved.
        #[arg(long)]
        store: Option<PathBuf>,

        /// Write the report here instead of stdout.
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Project a JSON list of detections onto the SAT image.
    Project {
        #[command(flatten)]
        artifact: ArtifactArgs,

        /// JSON array of detections.
        #[arg(long)]
        detections: PathBuf,

        /// Write the projections here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Map a SAT point back to a raw CCTV pixel.
    Inverse {
        #[command(flatten)]
        artifact: ArtifactArgs,

        #[arg(long, allow_negative_numbers = true)]
        x: f64,

        #[arg(long, allow_negative_numbers = true)]
        y: f64,

        /// Height of the point above the ground, meters.
        #[arg(long, default_value_t = 0.0)]
        height: f64,
    },

    /// Summarize an artifact; optionally rewrite it at the current schema version.
    Inspect {
        #[command(flatten)]
        artifact: ArtifactArgs,

        /// Rewrite the artifact in place at the current schema version.
        #[arg(long)]
        upgrade: bool,
    },

    /// Derive the artifact for a stream whose resolution changed.
    Rescale {
        #[command(flatten)]
        artifact: ArtifactArgs,

        /// New resolution over calibrated resolution.
        #[arg(long)]
        factor: f64,

        /// Where to write the rescaled artifact.
        #[arg(long)]
        out: PathBuf,
    },
}

/// An artifact file, or a location inside a store.
#[derive(Debug, Clone, Args)]
struct ArtifactArgs {
    /// Path to a G Projection JSON file.
    #[arg(long, conflicts_with_all = ["store", "location"])]
    artifact: Option<PathBuf>,

    /// Artifact store root (with --location).
    #[arg(long, requires = "location")]
    store: Option<PathBuf>,

    /// Location code inside the store.
    #[arg(long, requires = "store")]
    location: Option<String>,
}

impl ArtifactArgs {
    fn path(&self) -> CliResult<PathBuf> {
        match (&self.artifact, &self.store, &self.location) {
            (Some(path), _, _) => Ok(path.clone()),
            (None, Some(root), Some(code)) => Ok(ProjectionStore::new(root).artifact_path(code)?),
            _ => Err("give --artifact or --store with --location".into()),
        }
    }

    fn load(&self) -> CliResult<(PathBuf, GProjection)> {
        let path = self.path()?;
        let g = load_path(&path)?;
        Ok((path, g))
    }
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ProjectionOutput {
    Projected {
        index: usize,
        #[serde(rename = "box")]
        projected: ProjectedBox,
    },
    Filtered {
        index: usize,
        track_id: Option<u64>,
    },
    Failed {
        index: usize,
        track_id: Option<u64>,
        error: String,
    },
}

#[derive(Serialize)]
struct InverseOutput {
    sat: Point2<f64>,
    height_m: f64,
    cctv: Point2<f64>,
}

#[derive(Serialize)]
struct InspectOutput<'a> {
    path: &'a Path,
    stored_schema_version: u32,
    current_schema_version: u32,
    upgraded: bool,
    location_code: &'a str,
    created_unix_s: Option<u64>,
    resolution: Option<[u32; 2]>,
    camera_position_sat: Point2<f64>,
    camera_height_m: f64,
    px_per_meter: f64,
    anchors: usize,
    fov_vertices: usize,
    has_layout: bool,
    has_roi: bool,
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) -> CliResult<()> {
    #[cfg(feature = "tracing")]
    if cli.trace_json {
        tracing_log::LogTracer::init()?;
        gproj::core::init_tracing(true)?;
        return Ok(());
    }
    gproj::core::init_with_level(gproj::core::level_from_verbosity(cli.verbose))?;
    Ok(())
}

fn try_main() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    match &cli.command {
        Commands::Calibrate {
            input,
            config,
            store,
            report,
        } => calibrate(input, config.as_deref(), store.as_deref(), report.as_deref()),
        Commands::Project {
            artifact,
            detections,
            out,
        } => project(artifact, detections, out.as_deref()),
        Commands::Inverse {
            artifact,
            x,
            y,
            height,
        } => inverse(artifact, Point2::new(*x, *y), *height),
        Commands::Inspect { artifact, upgrade } => inspect(artifact, *upgrade),
        Commands::Rescale {
            artifact,
            factor,
            out,
        } => rescale(artifact, *factor, out),
    }
}

fn emit(json: &str, out: Option<&Path>) -> CliResult<()> {
    match out {
        Some(path) => fs::write(path, json)?,
        None => println!("{json}"),
    }
    Ok(())
}

fn calibrate(
    input_path: &Path,
    config: Option<&Path>,
    store: Option<&Path>,
    report_path: Option<&Path>,
) -> CliResult<()> {
    let mut input = CalibrationInput::load_json(input_path)?;
    if let Some(path) = config {
        let raw = fs::read_to_string(path)?;
        input.params = serde_json::from_str::<SolverParams>(&raw)?;
    }
    let store = store.map(ProjectionStore::new);
    let report = run_batch(&input, store.as_ref());
    for warning in &report.warnings {
        log::warn!("{}: {warning}", report.location_code);
    }
    emit(&serde_json::to_string_pretty(&report)?, report_path)?;
    match report.failure() {
        Some(failure) => Err(format!(
            "{} stage failed ({}): {}",
            failure.stage,
            failure
                .error_class
                .map_or_else(|| "unknown".to_string(), |c| c.to_string()),
            failure.error.as_deref().unwrap_or("no detail")
        )
        .into()),
        None => Ok(()),
    }
}

fn project(artifact: &ArtifactArgs, detections: &Path, out: Option<&Path>) -> CliResult<()> {
    let (_, g) = artifact.load()?;
    let raw = fs::read_to_string(detections)?;
    let detections: Vec<Detection> = serde_json::from_str(&raw)?;
    let results = g.forward_batch(&detections);

    let outputs: Vec<ProjectionOutput> = detections
        .iter()
        .zip(results)
        .enumerate()
        .map(|(index, (d, result))| match result {
            Ok(Some(projected)) => ProjectionOutput::Projected { index, projected },
            Ok(None) => ProjectionOutput::Filtered {
                index,
                track_id: d.track_id,
            },
            Err(e) => {
                log::warn!("detection {index}: {e}");
                ProjectionOutput::Failed {
                    index,
                    track_id: d.track_id,
                    error: e.to_string(),
                }
            }
        })
        .collect();
    log::info!(
        "{}: projected {} detections",
        g.location_code(),
        outputs.len()
    );
    emit(&serde_json::to_string_pretty(&outputs)?, out)
}

fn inverse(artifact: &ArtifactArgs, sat: Point2<f64>, height_m: f64) -> CliResult<()> {
    let (_, g) = artifact.load()?;
    let cctv = g.sat_to_cctv(sat, height_m)?;
    let out = InverseOutput {
        sat,
        height_m,
        cctv,
    };
    emit(&serde_json::to_string_pretty(&out)?, None)
}

fn inspect(artifact: &ArtifactArgs, upgrade: bool) -> CliResult<()> {
    let path = artifact.path()?;
    let bytes = fs::read(&path)?;
    let stored_schema_version = peek_version(&bytes)?;
    let g = load_path(&path)?;

    let upgraded = upgrade && stored_schema_version != SCHEMA_VERSION;
    if upgraded {
        write_atomic(&path, g.to_json()?.as_bytes())?;
        log::info!(
            "upgraded {} from schema {stored_schema_version} to {SCHEMA_VERSION}",
            path.display()
        );
    }

    let pose = g.pose();
    let out = InspectOutput {
        path: &path,
        stored_schema_version,
        current_schema_version: SCHEMA_VERSION,
        upgraded,
        location_code: g.location_code(),
        created_unix_s: g.created_unix_s(),
        resolution: g.resolution(),
        camera_position_sat: pose.position_sat,
        camera_height_m: pose.height_m,
        px_per_meter: pose.px_per_meter,
        anchors: g.anchors().len(),
        fov_vertices: g.fov_polygon().len(),
        has_layout: g.layout().is_some(),
        has_roi: g.roi().is_some(),
    };
    emit(&serde_json::to_string_pretty(&out)?, None)
}

fn rescale(artifact: &ArtifactArgs, factor: f64, out: &Path) -> CliResult<()> {
    let (_, g) = artifact.load()?;
    let rescaled = g.rescaled(factor)?;
    write_atomic(out, rescaled.to_json()?.as_bytes())?;
    log::info!(
        "{}: rescaled by {factor} to {}",
        g.location_code(),
        out.display()
    );
    Ok(())
}
