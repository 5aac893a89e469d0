//! vidheatd - HTTP service for the video detection pipeline
//!
//! This daemon:
//! 1. Loads configuration (VIDHEAT_CONFIG plus env overrides)
//! 2. Opens the record store and syncs it with artifacts already on disk
//! 3. Serves trigger/status and metadata queries over HTTP
//!
//! Pipeline runs happen on background threads started by `/process/{video}`.

use anyhow::{anyhow, Result};
use std::sync::mpsc;
use std::sync::Arc;

use vidheat::{
    api::{ApiConfig, ApiServer},
    build_pipeline, Catalog, PipelineConfig,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = PipelineConfig::load()?;
    log::info!(
        "vidheatd {} starting: videos={} metadata={} output={} db={}",
        env!("CARGO_PKG_VERSION"),
        config.videos_dir.display(),
        config.metadata_dir.display(),
        config.output_dir.display(),
        config.db_path.display()
    );

    let pipeline = build_pipeline(&config)?;
    let catalog = Arc::new(Catalog::new(config.layout(), &config.list_file));

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, pipeline, catalog).spawn()?;
    log::info!("vidheatd serving on http://{}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("vidheatd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
