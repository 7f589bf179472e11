use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use asr_training::{
    config::ConfigOverride, logging, DistributedContext, Trainer, TrainingConfig, TrainingError,
};
use clap::Parser;
use tracing::{info, warn};

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "CTC acoustic model training", long_about = None)]
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

    #[arg(
        long,
        value_name = "PATH",
        help = "Checkpoint to continue training from"
    )]
    continue_from: Option<PathBuf>,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?.with_overrides(&args.overrides)?;
    if let Some(path) = args.continue_from {
        config.runtime.continue_from = Some(path);
    }

    let log_file = logging::init_tracing();
    let context = DistributedContext::from_env(&config.runtime.distributed);
    if config.runtime.logging.log_file {
        log_file.attach(&context, &config.runtime.log_dir.join("train.log"))?;
    }
    let mut trainer = Trainer::from_config(&config, context)?;

    let mut train = trainer.manifest_loader(&config, &config.data.train_manifest, config.data.shuffle)?;
    let mut validation = config
        .data
        .validation_manifest
        .as_ref()
        .map(|path| trainer.manifest_loader(&config, path, false))
        .transpose()?;
    let mut test = config
        .data
        .test_manifest
        .as_ref()
        .map(|path| trainer.manifest_loader(&config, path, false))
        .transpose()?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    while trainer.epoch() < config.runtime.num_epochs {
        if shutdown_flag.load(Ordering::Relaxed) {
            info!(epoch = trainer.epoch(), "interrupted; stopping between epochs");
            break;
        }
        trainer.train_epoch(&mut train)?;
        if let Some(source) = validation.as_mut() {
            trainer.validate(source)?;
        }
    }

    if let Some(source) = test.as_mut() {
        if config.decoder.is_some() {
            trainer.test(source)?;
        } else {
            warn!("test manifest given without a decoder; skipping test pass");
        }
    }

    Ok(())
}
