use anyhow::Context;
use clap::Parser;
use imagenetpostprocessor::{IndexLabels, LabelSource, LabelTable, DEFAULT_TOP_K};
use indicatif::{ProgressBar, ProgressStyle};
use inference::data_loader::PresignedDownloader;
use inference::engine::TractEngine;
use inference::logging::init_tracing;
use inference::progress::ProgressAnimator;
use inference::{ClassifierConfig, InferenceResult, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

/// Classify images into ImageNet-1k classes with a downloaded ONNX model.
#[derive(Parser, Debug)]
#[command(name = "classify", version, about)]
struct Cli {
    /// Handshake endpoint minting the presigned model URL
    #[arg(long, env = "CLASSIFY_ENDPOINT")]
    endpoint: Option<String>,

    /// Label file, one class per line
    #[arg(long, value_name = "FILE", env = "CLASSIFY_LABELS")]
    labels: Option<PathBuf>,

    /// Number of ranked classes to print per image
    #[arg(long, default_value_t = DEFAULT_TOP_K)]
    top: usize,

    #[arg(required = true, value_name = "IMAGE")]
    images: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing()?;

    let mut config = ClassifierConfig::from_env();
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(labels) = cli.labels {
        config.labels_path = Some(labels);
    }

    let labels: Arc<dyn LabelSource> = match &config.labels_path {
        Some(path) => Arc::new(
            LabelTable::from_path(path)
                .with_context(|| format!("reading labels from {}", path.display()))?,
        ),
        None => {
            warn!("no label file configured, printing class indices only");
            Arc::new(IndexLabels)
        }
    };

    let source = Arc::new(PresignedDownloader::new(&config)?);
    let orchestrator = Orchestrator::new(
        config.clone(),
        source,
        Arc::new(TractEngine::default()),
        labels,
    )
    .with_top_k(cli.top);

    info!(endpoint = %config.endpoint, "starting classifier");

    let animator = ProgressAnimator::spawn(orchestrator.progress(), config.frame_interval);
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg:12} [{bar:40.cyan/blue}] {pos:>3}%")?
            .progress_chars("=>-"),
    );
    bar.set_message("Downloading");

    let render = {
        let bar = bar.clone();
        let mut displayed = animator.displayed();
        tokio::spawn(async move {
            while displayed.changed().await.is_ok() {
                let value = *displayed.borrow_and_update();
                bar.set_position(value as u64);
            }
        })
    };

    let started = orchestrator.start().await;
    animator.shutdown().await;
    render.abort();

    if let Err(error) = started {
        bar.abandon_with_message("Failed");
        eprintln!("{}", error.user_message());
        return Ok(ExitCode::FAILURE);
    }
    bar.set_position(100);
    bar.finish_with_message("Model ready");

    for path in &cli.images {
        let image = match tokio::fs::read(path).await {
            Ok(image) => image,
            Err(error) => {
                eprintln!("{}: {}", path.display(), error);
                continue;
            }
        };

        let outcome = match orchestrator.upload(image).await {
            Ok(_) => orchestrator.run().await,
            Err(error) => Err(error),
        };

        match outcome {
            Ok(result) => print_result(path, &result),
            Err(error) if error.is_terminal() => {
                eprintln!("{}", error.user_message());
                orchestrator.shutdown().await;
                return Ok(ExitCode::FAILURE);
            }
            Err(error) => eprintln!("{}: {}", path.display(), error.user_message()),
        }
    }

    orchestrator.shutdown().await;
    Ok(ExitCode::SUCCESS)
}

fn print_result(path: &std::path::Path, result: &InferenceResult) {
    println!(
        "{}: {} (class {})",
        path.display(),
        result.label,
        result.class_index
    );
    for (rank, class) in result.classifications.iter().enumerate() {
        println!(
            "  {:>2}. {:>6.2}%  {} (class {})",
            rank + 1,
            class.probability * 100.0,
            class.label,
            class.index
        );
    }
}
