// chargen binary
//
// Commands:
//   chargen make-dataset   Pick the alphabet and filter a raw corpus
//   chargen train          Train from a JSON config, snapshot into an output dir
//   chargen generate       Generate text for held-out samples from a trained model
//
// Logging goes through `tracing`; set RUST_LOG (default: info).

use anyhow::{bail, Context, Result};
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use chargen::codec::CharCodec;
use chargen::config::Config;
use chargen::dataset::{
    load_alphabet, load_texts, make_dataset, save_alphabet, save_texts, SplitDataset,
};
use chargen::embed::HashingEmbedder;
use chargen::generator::{Bot, SamplingPolicy};
use chargen::training::{checkpoint_path, latest_checkpoint, run_training};

#[derive(Parser)]
#[command(name = "chargen", about = "Character-level LSTM text generator")]
struct Cli {
    /// Use CUDA device 0 when built with the `cuda` feature
    #[arg(long, global = true)]
    cuda: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    MakeDataset(MakeDatasetArgs),
    Train(TrainArgs),
    Generate(GenerateArgs),
}

#[derive(Args, Serialize)]
struct MakeDatasetArgs {
    /// Whitespace-separated raw texts
    #[arg(long, default_value = "texts.txt")]
    texts_path: PathBuf,

    #[arg(long, default_value_t = 2048)]
    num_chars: usize,

    /// Drop every text containing one of these substrings
    #[arg(long, num_args = 0..)]
    eliminate_words: Vec<String>,

    #[arg(long, default_value = "dataset_text.ndjson")]
    output_text: PathBuf,

    #[arg(long, default_value = "dataset_char.json")]
    output_char: PathBuf,
}

#[derive(Args, Serialize)]
struct TrainArgs {
    config: PathBuf,
    output: PathBuf,
}

#[derive(Args, Serialize)]
struct GenerateArgs {
    #[arg(long)]
    model_dir: PathBuf,

    /// Snapshot iteration; the latest one when omitted
    #[arg(long)]
    iteration: Option<usize>,

    /// Defaults to <model_dir>/config.json
    #[arg(long)]
    model_config: Option<PathBuf>,

    #[arg(long)]
    char_path: Option<PathBuf>,

    #[arg(long)]
    text_path: Option<PathBuf>,

    #[arg(long, default_value_t = 32)]
    max_length: usize,

    #[arg(long, default_value_t = 50)]
    num_test: usize,

    /// Greedy decoding instead of sampling
    #[arg(long)]
    sampling_maximum: bool,

    /// Seed for stochastic sampling
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, default_value = "./output/")]
    output_dir: PathBuf,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let device = select_device(cli.cuda);

    let result = match cli.command {
        Command::MakeDataset(args) => cmd_make_dataset(args),
        Command::Train(args) => cmd_train(args, &device),
        Command::Generate(args) => cmd_generate(args, &device),
    };

    if let Err(e) = result {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

/// CUDA if requested and available, else CPU.
fn select_device(cuda: bool) -> Device {
    if !cuda {
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        if candle_core::utils::cuda_is_available() {
            match Device::new_cuda(0) {
                Ok(dev) => {
                    tracing::info!("using CUDA device 0");
                    return dev;
                }
                Err(e) => tracing::warn!("CUDA init failed, falling back to CPU: {e}"),
            }
        } else {
            tracing::warn!("CUDA not available, using CPU");
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        tracing::warn!("built without the cuda feature, using CPU (rebuild with --features cuda)");
    }

    Device::Cpu
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_make_dataset(args: MakeDatasetArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.texts_path)
        .with_context(|| format!("reading {}", args.texts_path.display()))?;
    let corpus = make_dataset(&raw, args.num_chars, &args.eliminate_words);
    save_texts(&args.output_text, &corpus.texts)?;
    save_alphabet(&args.output_char, &corpus.chars)?;
    tracing::info!(
        texts = corpus.texts.len(),
        chars = corpus.chars.len(),
        "dataset written"
    );

    for c in 'a'..='z' {
        match corpus.chars.iter().position(|&x| x == c) {
            Some(i) => println!("{c} {i}"),
            None => println!("{c} not exist"),
        }
    }
    Ok(())
}

fn cmd_train(args: TrainArgs, device: &Device) -> Result<()> {
    let config = Config::load_json(&args.config)?;
    let embedder = HashingEmbedder::new(config.dataset.embedding_dim);
    let summary = run_training(&config, &args.output, &embedder, device)?;
    tracing::info!(
        iterations = summary.iterations,
        snapshots = summary.snapshots.len(),
        final_loss = summary.losses.last().copied(),
        "training finished"
    );
    Ok(())
}

fn cmd_generate(args: GenerateArgs, device: &Device) -> Result<()> {
    let name = args
        .model_dir
        .file_name()
        .context("model_dir has no final path component")?;
    let output = args.output_dir.join(name);
    fs::create_dir_all(&output)?;
    fs::write(output.join("arguments.json"), serde_json::to_string_pretty(&args)?)?;

    let config_path = args
        .model_config
        .clone()
        .unwrap_or_else(|| args.model_dir.join("config.json"));
    let config = Config::load_json(&config_path)?;

    let char_path = args
        .char_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.dataset.char_path));
    let codec = CharCodec::new(&load_alphabet(&char_path)?)?;

    let weights = model_path(&args.model_dir, args.iteration)?;
    let policy = if args.sampling_maximum {
        SamplingPolicy::Greedy
    } else {
        match args.seed {
            Some(seed) => SamplingPolicy::seeded(seed),
            None => SamplingPolicy::from_entropy(),
        }
    };
    let mut bot = Bot::load(
        config.network.clone(),
        &weights,
        codec,
        Box::new(HashingEmbedder::new(config.dataset.embedding_dim)),
        args.max_length,
        policy,
        device,
    )?;

    let text_path = args
        .text_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.dataset.text_path));
    let texts = load_texts(&text_path)?;
    let held_out = SplitDataset::new(texts, config.dataset.seed, args.num_test).test;

    for (i, text) in held_out.iter().enumerate() {
        let out_text = bot.reply(text)?;
        println!("correct: {text}");
        println!("predict: {out_text}");
        println!("------------------------------------------------");
        fs::write(output.join(format!("{i}.txt")), &out_text)?;
    }
    Ok(())
}

fn model_path(model_dir: &Path, iteration: Option<usize>) -> Result<PathBuf> {
    match iteration {
        Some(it) => Ok(checkpoint_path(model_dir, it)),
        None => match latest_checkpoint(model_dir)? {
            Some(p) => Ok(p),
            None => bail!(
                "no snapshot found in {}. Run 'chargen train' first.",
                model_dir.display()
            ),
        },
    }
}
