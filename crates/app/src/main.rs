use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cpal::traits::{DeviceTrait, HostTrait};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use talkback_core::config::{CancellerConfig, NeuralConfig};
use talkback_core::{ModelVariant, StreamingAecProcessor};

mod audio;
mod config;
mod offline;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "talkback")]
#[command(about = "Talkback: echo cancellation for full-duplex voice", long_about = None)]
struct Cli {
    /// JSON config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Override the canceller from the config
    #[arg(long, global = true)]
    canceller: Option<CancellerKind>,
    /// DTLN-aec model directory (neural canceller)
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum CancellerKind {
    Rls,
    NeuralSmall,
    NeuralMedium,
    NeuralLarge,
}

#[derive(Subcommand)]
enum Commands {
    /// List available audio devices
    List,
    /// Play a far-end file and record the echo-cancelled microphone (press Ctrl+C to stop)
    Run {
        #[arg(short, long)]
        input: Option<String>,
        #[arg(short, long)]
        output: Option<String>,
        /// Far-end audio, raw s16le mono at the playback rate
        #[arg(short, long)]
        far_end: PathBuf,
        /// Where to write the cleaned microphone, raw s16le mono at the capture rate
        #[arg(short, long)]
        record: PathBuf,
        /// Record the raw microphone (echo cancellation switched off) for comparison
        #[arg(long)]
        bypass: bool,
    },
    /// Cancel the echo of a far-end recording in a microphone recording
    Process {
        /// Microphone recording, raw s16le mono at the capture rate
        #[arg(short, long)]
        mic: PathBuf,
        /// Far-end recording, raw s16le mono at the playback rate
        #[arg(short, long)]
        far_end: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Write the effective configuration to the user config directory
    SaveConfig,
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut app_config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load(),
    };
    apply_overrides(&mut app_config, cli.canceller, cli.model_dir);

    match cli.command {
        Commands::List => {
            list_devices()?;
        }
        Commands::Run {
            input,
            output,
            far_end,
            record,
            bypass,
        } => {
            let input = input.unwrap_or_else(|| app_config.last_input.clone());
            let output = output.unwrap_or_else(|| app_config.last_output.clone());
            let far_end = offline::read_pcm(&far_end)?;
            let processor = StreamingAecProcessor::new(app_config.aec.clone())?;
            processor.bypass_enabled.store(bypass, Ordering::Relaxed);

            let (stats_tx, stats_rx) = crossbeam_channel::bounded(32);
            let engine = audio::DuplexEngine::start(
                &input,
                &output,
                far_end,
                processor,
                app_config.chunk_samples(),
                app_config.report_stats.then_some(stats_tx),
            )?;
            println!("Talkback active. Press Ctrl+C to stop.");

            // Graceful shutdown handling
            let running = Arc::new(AtomicBool::new(true));
            let r = running.clone();
            ctrlc::set_handler(move || {
                println!("\nShutting down gracefully...");
                r.store(false, Ordering::Relaxed);
            })?;

            let mut cleaned = Vec::new();
            let mut announced_done = false;
            while running.load(Ordering::Relaxed) {
                if !announced_done && engine.playback_done.load(Ordering::Relaxed) {
                    announced_done = true;
                    println!("Far-end playback finished; still recording until Ctrl+C.");
                }
                while let Ok(chunk) = engine.cleaned.try_recv() {
                    cleaned.extend_from_slice(&chunk);
                }
                while let Ok(stats) = stats_rx.try_recv() {
                    log::info!(
                        "AEC: {:.1} dB (ref={:.0}, mic={:.0}, out={:.0}{})",
                        stats.suppression_db,
                        stats.reference_level,
                        stats.mic_level,
                        stats.output_level,
                        if stats.above_speech_threshold { ", speech" } else { "" }
                    );
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            drop(engine);

            offline::write_pcm(&record, &cleaned)?;
            println!("Wrote {} samples to {}", cleaned.len(), record.display());
        }
        Commands::Process { mic, far_end, out } => {
            let mic = offline::read_pcm(&mic)?;
            let far_end = offline::read_pcm(&far_end)?;
            let mut processor = StreamingAecProcessor::new(app_config.aec.clone())?;
            let cleaned =
                offline::process_recording(&mut processor, &mic, &far_end, app_config.chunk_samples());
            offline::write_pcm(&out, &cleaned)?;
            println!(
                "Processed {} samples with the {} canceller",
                cleaned.len(),
                processor.canceller_name()
            );
        }
        Commands::SaveConfig => {
            if let Err(e) = app_config.validate() {
                bail!("Refusing to save an invalid configuration: {:#}", e);
            }
            let path = app_config.save()?;
            println!("Saved configuration to {}", path.display());
        }
    }

    Ok(())
}

fn apply_overrides(config: &mut AppConfig, canceller: Option<CancellerKind>, model_dir: Option<PathBuf>) {
    let variant = match canceller {
        Some(CancellerKind::Rls) => {
            if !matches!(config.aec.canceller, CancellerConfig::Rls(_)) {
                config.aec.canceller = CancellerConfig::default();
            }
            None
        }
        Some(CancellerKind::NeuralSmall) => Some(ModelVariant::Small),
        Some(CancellerKind::NeuralMedium) => Some(ModelVariant::Medium),
        Some(CancellerKind::NeuralLarge) => Some(ModelVariant::Large),
        None => None,
    };

    if let Some(variant) = variant {
        let model_dir = match &config.aec.canceller {
            CancellerConfig::Neural(neural) => neural.model_dir.clone(),
            CancellerConfig::Rls(_) => None,
        };
        config.aec.canceller = CancellerConfig::Neural(NeuralConfig { variant, model_dir });
    }
    if let (Some(dir), CancellerConfig::Neural(neural)) = (model_dir, &mut config.aec.canceller) {
        neural.model_dir = Some(dir);
    }
}

fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    println!("Audio Host: {}", host.id().name());
    println!("\nInput Devices:");
    for device in host.input_devices()? {
        println!("  - {}", device.name().unwrap_or("Unknown".to_string()));
    }
    println!("\nOutput Devices:");
    for device in host.output_devices()? {
        println!("  - {}", device.name().unwrap_or("Unknown".to_string()));
    }
    Ok(())
}
