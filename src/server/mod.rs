//! Code supporting the `serve` sub command: process-wide state bootstrap
//! and the actix-web HTTP shell.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use crate::blobstore::{BlobStore, S3BlobStore};
use crate::config::{Config, NoopSecretsBootstrap};
use crate::continuation::ContinuationRegistry;
use crate::restrictions::{NoopTokenValidator, TokenValidator};

pub mod rest;

/// Process-wide state shared across every request.
pub struct AppState {
    pub pool: sqlx::MySqlPool,
    pub portal_pool: Option<sqlx::MySqlPool>,
    pub store: Arc<dyn BlobStore>,
    pub continuations: ContinuationRegistry,
    pub validator: Arc<dyn TokenValidator>,
    pub config: Config,
}

/// Command line arguments for the `serve` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run the BioIndex HTTP API", long_about = None)]
pub struct Args {
    /// IP to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_host: String,
    /// Port to listen on.
    #[arg(long, default_value_t = 5000)]
    pub listen_port: u16,
    /// Number of actix worker threads.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,
}

/// Main entry point for the `serve` sub command.
pub async fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    info!("args_common = {:?}", args_common);
    info!("args = {:?}", args);

    let config = Config::load(&NoopSecretsBootstrap).await?;
    let pool = crate::catalog::connect(&config.catalog_url()).await?;
    let portal_pool = match config.portal_url() {
        Some(url) => Some(crate::catalog::connect(&url).await?),
        None => None,
    };
    let store: Arc<dyn BlobStore> = Arc::new(S3BlobStore::from_env().await?);
    let continuations = ContinuationRegistry::new();
    let _sweeper = continuations.spawn_sweeper();

    let state = Arc::new(AppState {
        pool,
        portal_pool,
        store,
        continuations,
        validator: Arc::new(NoopTokenValidator),
        config,
    });

    info!("launching server on {}:{}", args.listen_host, args.listen_port);
    rest::serve(args, state).await?;

    info!("all done");
    Ok(())
}
