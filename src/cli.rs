use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use flowsight::config::Config;
use flowsight::engine::{CaptureMethod, CaptureService, FileSource, PacketSource};
use flowsight::engine::pipeline::{AddressFilter, FlowWorker};
use flowsight::error::CaptureError;
use flowsight::inference::{self, HttpClassifier, InferenceStage, Predictor};
use flowsight::supervisor::{http, PipelineSupervisor, SelfLauncher};

#[derive(Parser)]
#[command(name = "flowsight")]
#[command(author, version, about = "Per-flow feature extraction and streaming pipeline")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the operator HTTP surface and supervise the stages (default)
    Supervise {
        /// Address for the operator HTTP surface
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Run the capture stage
    Capture {
        /// Inference hub address
        #[arg(long)]
        hub: Option<String>,

        /// Capture interface (overrides auto-selection)
        #[arg(short, long)]
        interface: Option<String>,

        /// Replay a pcap file instead of capturing live
        #[arg(long)]
        pcap: Option<PathBuf>,
    },

    /// Run the inference stage
    Inference {
        /// Address the hub binds to
        #[arg(long)]
        hub: Option<String>,
    },

    /// Run a pcap file through the flow engine and print feature frames as
    /// JSON lines
    Replay {
        /// Capture file
        file: PathBuf,

        /// Stop after this many frames
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Print the default configuration
    GenConfig {
        /// Write to file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    // Stage processes reload from the same file
    let config_path = cli.config.clone().or_else(Config::locate);

    match cli.command.unwrap_or(Commands::Supervise { listen: None }) {
        Commands::Supervise { listen } => cmd_supervise(config, config_path, listen).await,
        Commands::Capture { hub, interface, pcap } => cmd_capture(config, hub, interface, pcap).await,
        Commands::Inference { hub } => cmd_inference(config, hub).await,
        Commands::Replay { file, limit } => cmd_replay(config, file, limit),
        Commands::GenConfig { output } => cmd_gen_config(output),
    }
}

/// Resolves on the first SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// A watch flag flipped by the first shutdown signal
fn shutdown_flag() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = tx.send(true);
    });
    rx
}

async fn wait_for(mut flag: watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

async fn cmd_supervise(mut config: Config, config_path: Option<PathBuf>, listen: Option<String>) -> Result<()> {
    if let Some(addr) = listen {
        config.supervisor.listen_addr = addr;
    }

    let launcher = SelfLauncher {
        config_path,
        hub_addr: Some(config.link.hub_addr.clone()),
    };
    let supervisor = Arc::new(PipelineSupervisor::new(config, Box::new(launcher)));
    let flag = shutdown_flag();

    let server = http::serve(supervisor.clone(), wait_for(flag.clone()));
    let result = server.await.context("operator HTTP surface failed");

    // Both the signal path and a server failure end up here
    supervisor.shutdown().await;
    info!("Cleanup complete");
    result
}

async fn cmd_capture(
    mut config: Config,
    hub: Option<String>,
    interface: Option<String>,
    pcap: Option<PathBuf>,
) -> Result<()> {
    if let Some(addr) = hub {
        config.link.hub_addr = addr;
    }
    if let Some(name) = interface {
        config.capture.interface = Some(name);
    }
    if let Some(path) = pcap {
        config.capture.method = CaptureMethod::File;
        config.capture.pcap_file = Some(path);
    }

    info!("Capture stage connecting to {}", config.link.hub_addr);
    let service = CaptureService::new(config.capture, config.flow, config.profiles, config.link);
    service.run(wait_for(shutdown_flag())).await
}

async fn cmd_inference(mut config: Config, hub: Option<String>) -> Result<()> {
    if let Some(addr) = hub {
        config.link.hub_addr = addr;
    }

    let classifier = HttpClassifier::new(config.inference.classifier.clone())
        .context("failed to build classifier client")?;
    let predictor = Predictor::new(
        Arc::new(classifier),
        config.profiles.clone(),
        config.inference.request_timeout(),
    );
    if !predictor.is_ready().await {
        warn!(
            "Classifier at {} is not ready; subscribers will be turned away until it is",
            config.inference.classifier.url
        );
    }

    let stage = InferenceStage::bind(&config.link, predictor, config.inference.max_in_flight)
        .await
        .with_context(|| format!("failed to bind hub on {}", config.link.hub_addr))?;
    let flag = shutdown_flag();

    let api = if config.inference.http_addr.is_empty() {
        None
    } else {
        let addr = config.inference.http_addr.clone();
        let predictor = stage.predictor();
        let stop = wait_for(flag.clone());
        Some(tokio::spawn(async move { inference::http::serve(&addr, predictor, stop).await }))
    };

    stage.run(wait_for(flag)).await;

    if let Some(api) = api {
        match api.await {
            Ok(result) => result.context("prediction API failed")?,
            Err(e) => warn!("Prediction API task ended abnormally: {}", e),
        }
    }
    Ok(())
}

fn cmd_replay(config: Config, file: PathBuf, limit: Option<usize>) -> Result<()> {
    let mut source = FileSource::open(file.clone())
        .with_context(|| format!("failed to open {}", file.display()))?;
    let filter = AddressFilter::new(config.capture.allowed_sources);
    let mut worker = FlowWorker::new(config.flow, config.profiles);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut emitted = 0usize;

    loop {
        if limit.is_some_and(|max| emitted >= max) {
            break;
        }
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(CaptureError::Exhausted) => break,
            Err(e) => return Err(e).context("replay failed"),
        };
        let Some(pkt) = filter.admit(&frame) else {
            continue;
        };
        let features = worker.process(&pkt);
        serde_json::to_writer(&mut out, &features)?;
        writeln!(out)?;
        emitted += 1;
    }

    out.flush()?;
    info!(
        "Replayed {}: {} feature frames, {} active flows",
        source.describe(),
        emitted,
        worker.active_flows()
    );
    Ok(())
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();

    match output {
        Some(path) => {
            config.save(&path)?;
            println!("Configuration written to {}", path.display());
        }
        None => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
