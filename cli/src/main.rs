use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use clap::Parser;
use lamda::{Lamda, LamdaConfig, LayerSharing};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "LaMDA-style decoder smoke run", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Model config (.json or .toml); built-in defaults when omitted"
    )]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 1, help = "Number of sequences in the batch")]
    batch: usize,

    #[arg(long, value_name = "N", help = "Tokens per sequence [default: model dim]")]
    seq_len: Option<usize>,

    #[arg(long, help = "Seed for the random token ids")]
    seed: Option<u64>,

    #[arg(long, help = "Quantize every projection inside the decoder blocks")]
    quantize_transformer: bool,

    #[arg(long, help = "Quantize the output projection")]
    quantize_logits: bool,

    #[arg(long, help = "Reuse one attention and feed-forward instance at every depth")]
    shared_layers: bool,

    #[arg(long, help = "Run on CUDA device 0 when available")]
    cuda: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("lamda failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => LamdaConfig::from_path(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => LamdaConfig::default(),
    };
    config.quantize_transformer |= args.quantize_transformer;
    config.quantize_logits |= args.quantize_logits;
    if args.shared_layers {
        config.layer_sharing = LayerSharing::Shared;
    }

    let device = if args.cuda {
        Device::cuda_if_available(0).context("initialising CUDA device")?
    } else {
        Device::Cpu
    };
    log::info!("device selected: is_cuda={}", device.is_cuda());

    let seq_len = args.seq_len.unwrap_or(config.dim);
    anyhow::ensure!(args.batch > 0 && seq_len > 0, "batch and seq-len must be positive");

    let model = Lamda::new(config, &device).context("building model")?;

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let num_tokens = model.config().num_tokens as u32;
    let ids: Vec<u32> = (0..args.batch * seq_len)
        .map(|_| rng.gen_range(0..num_tokens))
        .collect();
    let token_ids = Tensor::from_vec(ids, (args.batch, seq_len), &device)?;

    let logits = model.forward(&token_ids).context("forward pass")?;
    println!("logits shape: {:?}", logits.dims());
    println!("trainable parameters: {}", model.num_trainable_parameters());
    Ok(())
}
