//! Command-line interface for the demographer engine.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use demographer::model_loader::{CheckpointSpec, ModelResolver};
use demographer::record::load_jsonl;
use demographer::{verify_checksum, ConfigFile, Label, ModelVariant, Predictor};

#[derive(Parser)]
#[command(
    name = "demographer",
    version,
    about = "Gender, age and organization inference for social media profiles"
)]
struct Cli {
    /// TOML configuration file; missing file means defaults
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Predict attributes for every record of a JSON Lines file
    ///
    /// Each line holds `id`, `name`, `screen_name`, `description`, `lang`
    /// and, for the full model, `img_path`.
    Infer(InferArgs),

    /// Resolve a checkpoint into the model directory, downloading it if needed
    Fetch(FetchArgs),

    /// Check a checkpoint file against the published MD5 digest
    Verify(VerifyArgs),
}

#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum OutputFormat {
    /// Id-keyed nested JSON
    #[default]
    Json,
    /// One row per id
    Csv,
}

#[derive(Args)]
struct InferArgs {
    /// Input JSON Lines file
    input: PathBuf,

    /// Model variant (full_model or text_model)
    #[arg(long)]
    variant: Option<ModelVariant>,

    #[arg(long)]
    model_dir: Option<PathBuf>,

    #[arg(long)]
    vocab: Option<PathBuf>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Only predict one attribute (gender, age or org)
    #[arg(long)]
    label: Option<Label>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// Write here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Never use CUDA
    #[arg(long)]
    cpu: bool,

    /// Split batches across replicas
    #[arg(long)]
    parallel: bool,

    #[arg(long)]
    replicas: Option<usize>,

    /// Run with randomly initialised weights
    #[arg(long)]
    random_weights: bool,
}

#[derive(Args)]
struct FetchArgs {
    #[arg(default_value = "full_model")]
    variant: ModelVariant,

    #[arg(long)]
    model_dir: Option<PathBuf>,
}

#[derive(Args)]
struct VerifyArgs {
    /// Checkpoint file
    path: PathBuf,

    /// Variant whose digest to check against
    #[arg(long, default_value = "full_model")]
    variant: ModelVariant,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let file = ConfigFile::load_or_default(&cli.config)
        .with_context(|| format!("reading {}", cli.config.display()))?;

    match cli.command {
        Command::Infer(args) => infer(file, args),
        Command::Fetch(args) => fetch(file, args),
        Command::Verify(args) => verify(args),
    }
}

fn infer(file: ConfigFile, args: InferArgs) -> anyhow::Result<()> {
    let mut config = file.into_predictor_config();
    if let Some(variant) = args.variant {
        config = config.with_variant(variant);
    }
    if let Some(dir) = args.model_dir {
        config = config.with_model_dir(dir);
    }
    if let Some(vocab) = args.vocab {
        config = config.with_vocab_path(vocab);
    }
    if let Some(batch_size) = args.batch_size {
        config = config.with_batch_size(batch_size);
    }
    if let Some(replicas) = args.replicas {
        config = config.with_replicas(replicas);
    }
    let use_cuda = config.use_cuda && !args.cpu;
    let parallel = config.parallel || args.parallel;
    let pretrained = config.pretrained && !args.random_weights;
    config = config
        .with_cuda(use_cuda)
        .with_parallel(parallel)
        .with_pretrained(pretrained);

    let records = load_jsonl(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let batch_size = config.batch_size;
    let use_image = config.variant.uses_image();

    let mut predictor = Predictor::with_config(config).context("building predictor")?;
    info!("{}", predictor.model_info());

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    };

    match (args.label, args.format) {
        (Some(label), OutputFormat::Json) => {
            let result = predictor.infer_label(&records, batch_size, label)?;
            writeln!(out, "{}", result.to_json()?)?;
        }
        (Some(_), OutputFormat::Csv) => bail!("--label only supports JSON output"),
        (None, OutputFormat::Json) => {
            let result = predictor.infer(&records, batch_size, use_image)?;
            writeln!(out, "{}", result.to_json()?)?;
        }
        (None, OutputFormat::Csv) => {
            let result = predictor.infer(&records, batch_size, use_image)?;
            result.write_csv(&mut out)?;
        }
    }
    out.flush()?;
    Ok(())
}

fn fetch(file: ConfigFile, args: FetchArgs) -> anyhow::Result<()> {
    let model_dir = args.model_dir.unwrap_or(file.model.model_dir);
    let resolver = ModelResolver::new(model_dir).with_auto_download(file.model.auto_download);

    let (report, result) = resolver.resolve_with_report(args.variant.name());
    let path = result.with_context(|| {
        format!(
            "resolving {} (tried: {})",
            args.variant,
            report.mirrors_tried().join(", ")
        )
    })?;
    println!("{}", path.display());
    Ok(())
}

fn verify(args: VerifyArgs) -> anyhow::Result<()> {
    let spec = CheckpointSpec::lookup(args.variant.name())?;
    verify_checksum(&args.path, &spec.md5)
        .with_context(|| format!("verifying {} as {}", args.path.display(), args.variant))?;
    println!("{}  {}  OK", spec.md5, args.path.display());
    Ok(())
}
