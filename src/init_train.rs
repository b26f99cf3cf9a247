//! Entrypoint to train the digit model offline

use anyhow::Result;
use digits::config::Settings;
use digits::train;
use digits::util::init_tracing;
use std::path::PathBuf;
use std::{env, process};
use tracing::info;

const USAGE: &str = "usage: ./train [--force] [config file]";

fn get_args() -> (bool, Option<PathBuf>) {
    let mut force = false;
    let mut config_file = None;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--force" | "-f" => force = true,
            "-h" | "--help" => {
                println!("{USAGE}");
                process::exit(0);
            }
            _ if config_file.is_none() => config_file = Some(PathBuf::from(&arg)),
            _ => {
                println!("{USAGE}");
                process::exit(1);
            }
        }
    }
    (force, config_file)
}

fn main() -> Result<()> {
    let (force, config_file) = get_args();
    let settings = Settings::load(config_file.as_deref())?;
    init_tracing(&settings.log_level);

    if settings.model_path.exists() && !force {
        println!(
            "Model already exists. Delete '{}' or pass --force to train a new model.",
            settings.model_path.display()
        );
        return Ok(());
    }

    let history = train::train_and_save(&settings)?;
    info!(
        "kept epoch {} of {}, test accuracy {:.2}%",
        history.best_epoch,
        history.epochs.len(),
        history.test_accuracy * 100.0
    );
    Ok(())
}
