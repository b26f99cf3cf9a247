use actix_web::{web, HttpServer};
use anyhow::Result;
use digits::classifier;
use digits::config::Settings;
use digits::server::{self, AppState};
use digits::util::init_tracing;
use std::path::PathBuf;
use std::{env, process};
use tracing::info;

const USAGE: &str = "usage: ./digits [config file]";

fn get_args() -> Option<PathBuf> {
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => None,
        2 if args[1] != "-h" && args[1] != "--help" => Some(PathBuf::from(&args[1])),
        _ => {
            println!("{USAGE}");
            process::exit(1);
        }
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    let config_file = get_args();
    let settings = Settings::load(config_file.as_deref())?;
    init_tracing(&settings.log_level);

    // Loaded once, shared read-only by every worker
    let classifier = classifier::load_or_train(&settings)?;
    let state = web::Data::new(AppState::new(classifier, &settings));
    let max_payload_bytes = settings.max_payload_bytes;

    info!(
        "serving {} on {}",
        settings.static_dir.display(),
        settings.bind_addr()
    );

    HttpServer::new(move || server::app(state.clone(), max_payload_bytes))
    .bind(settings.bind_addr())?
    .run()
    .await?;

    Ok(())
}
