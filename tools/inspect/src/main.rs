//! Inspection CLI Tool
//!
//! Builds a transfer-learning classifier from a TOML configuration, applies
//! freezing and optimizer construction and reports the resulting partition.
//! Also runs greedy denoising pretraining on synthetic data.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use burn::{
    nn::loss::CrossEntropyLossConfig,
    tensor::{Distribution, ElementConversion, Int, Tensor},
};
use tracing::info;

use pretrain_core::{
    backend_name, default_device, load_toml_config, seed, setup_cli_logging, FineTuneConfig,
    OptimizerKind, TrainingBackend,
};
use pretrain_models::{
    net_frozen, save_classifier, DenoisingLayerConfig, StackedDenoisingConfig,
    TransferClassifierConfig,
};

/// Denoising pretraining and transfer-learning inspection tool
#[derive(Parser, Debug)]
#[command(name = "pretrain-inspect")]
#[command(version)]
#[command(about = "Inspect frozen classifiers and denoising pretraining with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    /// Random seed for initialization and corruption noise
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a classifier, freeze it and report the trainable partition
    Classifier {
        /// Path to the configuration file (TOML)
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Override the freezing threshold
        #[arg(long, value_name = "INDEX")]
        frozen_until: Option<usize>,

        /// Override the optimizer kind (adam or sgd)
        #[arg(long, value_name = "KIND")]
        optim: Option<OptimizerKind>,

        /// Override the learning rate
        #[arg(long, value_name = "LR")]
        lr: Option<f64>,

        /// Run one optimizer step on a random batch of this size
        #[arg(long, value_name = "SIZE")]
        smoke_step: Option<usize>,

        /// Save the frozen classifier to this directory
        #[arg(short, long, value_name = "DIR")]
        save: Option<PathBuf>,
    },

    /// Pretrain a stack of denoising layers on random images
    Denoise {
        /// Channels of the input images
        #[arg(long, default_value = "3")]
        in_channels: usize,

        /// Output channels of each layer, comma separated
        #[arg(long, value_delimiter = ',', default_value = "16")]
        out_channels: Vec<usize>,

        /// Encoder stride
        #[arg(long, default_value = "2")]
        stride: usize,

        /// Learning rate of every layer
        #[arg(long, default_value = "0.1")]
        learning_rate: f64,

        /// Height and width of the random images
        #[arg(long, default_value = "32")]
        size: usize,

        /// Number of images per batch
        #[arg(long, default_value = "8")]
        batch: usize,

        /// Number of pretraining passes
        #[arg(long, default_value = "10")]
        steps: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_cli_logging(cli.verbose)?;
    info!("Backend: {}", backend_name());

    if let Some(value) = cli.seed {
        seed(value);
    }

    match cli.command {
        Commands::Classifier {
            config,
            frozen_until,
            optim,
            lr,
            smoke_step,
            save,
        } => {
            let mut config: FineTuneConfig = load_toml_config(&config)
                .with_context(|| format!("Failed to load {}", config.display()))?;

            if let Some(frozen_until) = frozen_until {
                config.training.frozen_until = frozen_until;
            }
            if let Some(optim) = optim {
                config.training.optim = optim;
            }
            if let Some(lr) = lr {
                config.training.lr = lr;
            }

            run_classifier(&config, smoke_step, save)
        }
        Commands::Denoise {
            in_channels,
            out_channels,
            stride,
            learning_rate,
            size,
            batch,
            steps,
        } => run_denoise(
            in_channels,
            &out_channels,
            stride,
            learning_rate,
            size,
            batch,
            steps,
        ),
    }
}

fn run_classifier(
    config: &FineTuneConfig,
    smoke_step: Option<usize>,
    save: Option<PathBuf>,
) -> Result<()> {
    config.validate()?;
    let device = default_device();

    info!("Building resnet{} with {} classes", config.model.depth, config.model.num_classes);
    let model = TransferClassifierConfig::from_settings(&config.model)
        .init::<TrainingBackend>(&device)
        .context("Failed to build classifier")?;

    let (model, mut optimizer) = net_frozen(&config.training, model)?;

    info!("");
    info!("{:<4} {:<8} {:>12} {:>10} {:>8}", "idx", "child", "params", "trainable", "frozen");
    for summary in model.child_summaries() {
        info!(
            "{:<4} {:<8} {:>12} {:>10} {:>8}",
            summary.child.index(),
            summary.child.name(),
            summary.num_params,
            summary.trainable,
            summary.frozen
        );
    }
    let [features, classes] = model.head_dims();
    info!("head     Linear({} -> {})", features, classes);
    info!("");
    info!("Optimizer: {:?}", optimizer);

    let model = match smoke_step {
        Some(batch) if batch > 0 => {
            let input = Tensor::<TrainingBackend, 4>::random(
                [batch, 3, 64, 64],
                Distribution::Uniform(0.0, 1.0),
                &device,
            );
            let targets = Tensor::<TrainingBackend, 1, Int>::zeros([batch], &device);

            let output = model.forward(input);
            let loss = CrossEntropyLossConfig::new()
                .init(&output.device())
                .forward(output, targets);
            let loss_value: f64 = loss.clone().into_scalar().elem();

            let model = optimizer.step(model, loss.backward());
            info!("Smoke step loss: {:.4}", loss_value);
            model
        }
        _ => model,
    };

    if let Some(dir) = save {
        save_classifier(&model, &dir, Some(config.training.frozen_until))
            .with_context(|| format!("Failed to save classifier to {}", dir.display()))?;
    }

    Ok(())
}

fn run_denoise(
    in_channels: usize,
    out_channels: &[usize],
    stride: usize,
    learning_rate: f64,
    size: usize,
    batch: usize,
    steps: usize,
) -> Result<()> {
    let device = default_device();

    let layers = std::iter::once(in_channels)
        .chain(out_channels.iter().copied())
        .collect::<Vec<_>>()
        .windows(2)
        .map(|pair| {
            DenoisingLayerConfig::new(pair[0], pair[1])
                .with_stride(stride)
                .with_learning_rate(learning_rate)
        })
        .collect();

    let mut stack = StackedDenoisingConfig::new(layers)
        .init::<TrainingBackend>(&device)
        .context("Failed to build denoising stack")?;

    let input_dims = [batch, in_channels, size, size];
    info!(
        "Pretraining {} denoising layers on {:?} -> {:?}",
        stack.len(),
        input_dims,
        stack.output_dims(input_dims)?
    );

    let input = Tensor::<TrainingBackend, 4>::random(
        input_dims,
        Distribution::Uniform(0.0, 1.0),
        &device,
    );
    let losses = stack.pretrain(input.clone(), steps)?;
    info!("Final reconstruction losses: {:?}", losses);

    stack.eval();
    let encoded = stack.forward(input)?;
    info!("Encoded output: {:?}", encoded.dims());

    Ok(())
}
