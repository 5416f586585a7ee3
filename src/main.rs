use rust_garlic::{app, config};
use std::path::Path;

#[tokio::main]
async fn main() {
    let config = match config::Config::load_or_create(Path::new("config.toml")) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("failed to load config.toml: {err:#}");
            std::process::exit(1);
        }
    };
    config::init_tracing(&config);
    tracing::info!("rust-garlic booted");

    if let Err(err) = app::run(config).await {
        tracing::error!(error = %format!("{err:#}"), "router core failed");
        std::process::exit(1);
    }
}
