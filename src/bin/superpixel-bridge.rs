use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use superpixel_bridge::adapter::Adapter;
use superpixel_bridge::common::{DistanceMetric, SegmentationParams};
use superpixel_bridge::label_map::Labels;
use superpixel_bridge::raster;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Segment an image into superpixels
    Segment(SegmentArgs),
    /// Score a label map against ground truth
    Benchmark(BenchmarkArgs),
    /// Draw label boundaries over an image
    Contours(ContoursArgs),
}

#[derive(Args, Debug)]
struct SegmentArgs {
    /// Input image
    image: PathBuf,

    /// Output label map (.csv, otherwise 16-bit PNG)
    #[arg(short, long)]
    output: PathBuf,

    /// JSON parameter file; flags below override it
    #[arg(long)]
    params: Option<PathBuf>,

    /// Requested number of superpixels
    #[arg(short = 'n', long)]
    superpixels: Option<u32>,

    #[arg(long)]
    compactness: Option<f32>,

    #[arg(long)]
    iterations: Option<u32>,

    #[arg(long)]
    manhattan: bool,

    /// Also write a contour overlay
    #[arg(long)]
    contours: Option<PathBuf>,

    /// Print per-superpixel statistics as JSON
    #[arg(long)]
    stats: bool,
}

#[derive(Args, Debug)]
struct BenchmarkArgs {
    image: PathBuf,

    /// Superpixel labels (.csv or PNG)
    labels: PathBuf,

    /// Ground truth labels (.csv or PNG)
    ground_truth: PathBuf,
}

#[derive(Args, Debug)]
struct ContoursArgs {
    image: PathBuf,

    labels: PathBuf,

    #[arg(short, long)]
    output: PathBuf,

    /// Contour color as `r,g,b`
    #[arg(long, default_value = "255,0,0")]
    color: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Segment(args) => segment(args),
        Command::Benchmark(args) => benchmark(args),
        Command::Contours(args) => contours(args),
    }
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("csv"))
        .unwrap_or(false)
}

fn load_labels(path: &Path) -> Result<Labels> {
    let labels = if is_csv(path) {
        raster::read_labels_csv(path)
    } else {
        raster::load_labels_png(path)
    };
    labels.with_context(|| format!("Failed to read labels from {}", path.display()))
}

fn load_params(args: &SegmentArgs) -> Result<SegmentationParams> {
    let mut params = match &args.params {
        Some(path) => {
            let blob = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            SegmentationParams::from_json(&blob)
                .with_context(|| format!("Invalid parameter file {}", path.display()))?
        }
        None => SegmentationParams::default(),
    };
    if let Some(n) = args.superpixels {
        params.num_superpixels = n;
    }
    if let Some(compactness) = args.compactness {
        params.compactness = compactness;
    }
    if let Some(iterations) = args.iterations {
        params.iterations = iterations;
    }
    if args.manhattan {
        params.distance_metric = DistanceMetric::Manhattan;
    }
    params.statistics |= args.stats;
    Ok(params)
}

fn segment(args: SegmentArgs) -> Result<()> {
    let params = load_params(&args)?;
    let image = raster::load_image(&args.image)
        .with_context(|| format!("Failed to load {}", args.image.display()))?;
    tracing::info!(
        "Segmenting {}x{} image into {} superpixels",
        image.width(),
        image.height(),
        params.num_superpixels
    );

    let result = Adapter::default()
        .segment(&image.as_handle(), &params)
        .context("Segmentation failed")?;
    let labels = result.labels.as_map();
    tracing::info!("Produced {} superpixels", result.superpixels);

    if is_csv(&args.output) {
        raster::write_labels_csv(&labels, &args.output)
    } else {
        raster::save_labels_png(&labels, &args.output)
    }
    .with_context(|| format!("Failed to write {}", args.output.display()))?;

    if let Some(path) = &args.contours {
        let overlay = raster::draw_contours(&image.as_handle(), &labels, [255, 0, 0])?;
        raster::save_image(&overlay.as_handle(), path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    if let Some(stats) = &result.statistics {
        println!("{}", serde_json::to_string_pretty(stats)?);
    }
    Ok(())
}

fn benchmark(args: BenchmarkArgs) -> Result<()> {
    let image = raster::load_image(&args.image)
        .with_context(|| format!("Failed to load {}", args.image.display()))?;
    let labels = load_labels(&args.labels)?;
    let ground_truth = load_labels(&args.ground_truth)?;
    let report = Adapter::default()
        .benchmark(&image.as_handle(), &labels.as_map(), &ground_truth.as_map())
        .context("Benchmark failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn parse_color(text: &str) -> Result<[u8; 3]> {
    let parts: Vec<&str> = text.split(',').map(str::trim).collect();
    let [r, g, b] = parts.as_slice() else {
        bail!("Color must be `r,g,b`, got `{text}`");
    };
    Ok([r.parse()?, g.parse()?, b.parse()?])
}

fn contours(args: ContoursArgs) -> Result<()> {
    let color = parse_color(&args.color)?;
    let image = raster::load_image(&args.image)
        .with_context(|| format!("Failed to load {}", args.image.display()))?;
    let labels = load_labels(&args.labels)?;
    let overlay = raster::draw_contours(&image.as_handle(), &labels.as_map(), color)?;
    raster::save_image(&overlay.as_handle(), &args.output)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;
    Ok(())
}
