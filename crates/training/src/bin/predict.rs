use std::path::PathBuf;

use asr_training::{
    config::ConfigOverride, logging, DistributedContext, Trainer, TrainingConfig, TrainingError,
};
use clap::Parser;

fn main() {
    if let Err(err) = run() {
        eprintln!("prediction failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Decode utterances with a trained model", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<ConfigOverride>,

    #[arg(long, value_name = "PATH", help = "Checkpoint holding the trained model")]
    continue_from: PathBuf,

    #[arg(
        long,
        value_name = "PATH",
        help = "Manifest to decode (defaults to data.test_manifest)"
    )]
    manifest: Option<PathBuf>,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();
    logging::init_tracing();

    let mut config = TrainingConfig::load(&args.config)?.with_overrides(&args.overrides)?;
    config.runtime.continue_from = Some(args.continue_from);
    config.runtime.logging.tensorboard = false;
    if config.decoder.is_none() {
        return Err(TrainingError::initialization(
            "prediction requires a [decoder] section",
        ));
    }
    let manifest = args
        .manifest
        .or_else(|| config.data.test_manifest.clone())
        .ok_or_else(|| TrainingError::initialization("no manifest to decode"))?;

    let mut trainer = Trainer::from_config(&config, DistributedContext::single_process())?;
    let mut source = trainer.manifest_loader(&config, &manifest, false)?;
    for transcript in trainer.transcribe(&mut source)? {
        println!("{}\t{}", transcript.id, transcript.words.join(" "));
    }
    Ok(())
}
