//! BioIndex command-line entry point.

pub mod blobstore;
pub mod catalog;
pub mod common;
pub mod config;
pub mod continuation;
pub mod err;
pub mod indexer;
pub mod locus;
pub mod planner;
pub mod reader;
pub mod restrictions;
pub mod schema;
pub mod server;

use clap::{Args, Parser, Subcommand};
use console::{Emoji, Term};

/// CLI parser based on clap.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "BioIndex secondary-index service",
    long_about = "Builds and serves a secondary index over NDJSON records in a blob store"
)]
struct Cli {
    /// Commonly used arguments
    #[command(flatten)]
    common: common::Args,

    /// The sub command to run
    #[command(subcommand)]
    command: Commands,
}

/// Enum supporting the parsing of top-level commands.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server.
    Serve(server::Args),
    /// Register a new index definition.
    Create(CreateArgs),
    /// List registered indexes.
    List(ListArgs),
    /// Build or rebuild an index.
    Index(IndexArgs),
    /// Fetch records matching a query tuple.
    Query(QueryArgs),
    /// Approximate the number of records matching a query tuple.
    Count(QueryArgs),
    /// Enumerate distinct key values matching a partial query tuple.
    Match(QueryArgs),
    /// Dump every record in an index.
    All(AllArgs),
}

#[derive(Debug, Args)]
struct CreateArgs {
    /// Index name.
    name: String,
    /// Per-index row table name.
    table: String,
    /// Blob store prefix this index covers.
    prefix: String,
    /// Schema string (see `schema` module).
    schema: String,
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Only list indexes whose build has completed.
    #[arg(long)]
    built_only: bool,
}

#[derive(Debug, Args)]
struct IndexArgs {
    /// Index name.
    name: String,
    /// Delete and fully re-ingest all keys instead of an incremental rebuild.
    #[arg(long)]
    rebuild: bool,
    /// Delegate per-blob ingestion to an AWS Lambda-style dispatcher.
    #[arg(long, conflicts_with = "use_batch")]
    use_lambda: bool,
    /// Delegate per-blob ingestion to a batch-job dispatcher.
    #[arg(long, conflicts_with = "use_lambda")]
    use_batch: bool,
    /// Bounded local ingestion concurrency.
    #[arg(long, default_value_t = 5)]
    workers: usize,
}

#[derive(Debug, Args)]
struct QueryArgs {
    /// Index name.
    name: String,
    /// Positional query arguments (keys, then locus if the schema has one).
    q: Vec<String>,
    /// Page size.
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct AllArgs {
    /// Index name.
    name: String,
    /// Disambiguates when multiple indexes share a name.
    arity: Option<usize>,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let collector = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(match cli.common.verbose.log_level() {
            Some(level) => match level {
                log::Level::Error => tracing::Level::ERROR,
                log::Level::Warn => tracing::Level::WARN,
                log::Level::Info => tracing::Level::INFO,
                log::Level::Debug => tracing::Level::DEBUG,
                log::Level::Trace => tracing::Level::TRACE,
            },
            None => tracing::Level::INFO,
        })
        .compact()
        .finish();

    let term = Term::stderr();
    tracing::subscriber::with_default(collector, || {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(async {
            match &cli.command {
                Commands::Serve(args) => server::run(&cli.common, args).await?,
                Commands::Create(args) => {
                    cli::create(&args.name, &args.table, &args.prefix, &args.schema).await?
                }
                Commands::List(args) => cli::list(args.built_only).await?,
                Commands::Index(args) => {
                    cli::index(
                        &args.name,
                        args.rebuild,
                        cli::Dispatch::from_flags(args.use_lambda, args.use_batch),
                        args.workers,
                    )
                    .await?
                }
                Commands::Query(args) => cli::query(&args.name, &args.q, args.limit).await?,
                Commands::Count(args) => cli::count(&args.name, &args.q).await?,
                Commands::Match(args) => cli::r#match(&args.name, &args.q, args.limit).await?,
                Commands::All(args) => cli::all(&args.name, args.arity).await?,
            }

            Ok::<(), anyhow::Error>(())
        })
    })?;
    term.write_line(&format!("All done. Have a nice day!{}", Emoji(" 😃", "")))?;

    Ok(())
}

/// Thin glue between the CLI subcommands and the core library modules.
mod cli {
    use crate::{catalog, err::BioIndexError, indexer, planner};

    #[derive(Debug, Clone, Copy)]
    pub enum Dispatch {
        Local,
        Lambda,
        Batch,
    }

    impl Dispatch {
        pub fn from_flags(use_lambda: bool, use_batch: bool) -> Self {
            if use_lambda {
                Dispatch::Lambda
            } else if use_batch {
                Dispatch::Batch
            } else {
                Dispatch::Local
            }
        }
    }

    pub async fn create(
        name: &str,
        table: &str,
        prefix: &str,
        schema: &str,
    ) -> Result<(), anyhow::Error> {
        let pool = catalog::pool_from_env().await?;
        catalog::create_index(&pool, name, table, prefix, schema).await?;
        tracing::info!("created index {:?}", name);
        Ok(())
    }

    pub async fn list(built_only: bool) -> Result<(), anyhow::Error> {
        let pool = catalog::pool_from_env().await?;
        for index in catalog::list_indexes(&pool, built_only).await? {
            println!(
                "{}\t{}\t{}\tbuilt={}",
                index.name, index.table, index.prefix, index.built
            );
        }
        Ok(())
    }

    pub async fn index(
        name: &str,
        rebuild: bool,
        dispatch: Dispatch,
        workers: usize,
    ) -> Result<(), anyhow::Error> {
        let pool = catalog::pool_from_env().await?;
        let store: std::sync::Arc<dyn crate::blobstore::BlobStore> =
            std::sync::Arc::new(crate::blobstore::S3BlobStore::from_env().await?);
        let dispatcher: Box<dyn indexer::Dispatcher> = match dispatch {
            Dispatch::Local => Box::new(indexer::LocalDispatcher),
            Dispatch::Lambda | Dispatch::Batch => {
                tracing::warn!("remote dispatch requested but not configured; running locally");
                Box::new(indexer::LocalDispatcher)
            }
        };
        indexer::build_index(&pool, &store, dispatcher.as_ref(), name, rebuild, workers).await?;
        Ok(())
    }

    pub async fn query(name: &str, q: &[String], limit: Option<usize>) -> Result<(), anyhow::Error> {
        let config = crate::config::Config::load(&crate::config::NoopSecretsBootstrap).await?;
        let pool = catalog::pool_from_env().await?;
        let store: std::sync::Arc<dyn crate::blobstore::BlobStore> =
            std::sync::Arc::new(crate::blobstore::S3BlobStore::from_env().await?);
        let index = catalog::lookup_by_arity(&pool, name, q.len())
            .await?
            .ok_or_else(|| BioIndexError::BadRequest(format!("no index named {name:?} with arity {}", q.len())))?;
        let mut reader = planner::fetch(&pool, &store, &index, q, None).await?;
        let page = reader.next_page(limit.unwrap_or(config.match_limit)).await?;
        for record in page.records {
            println!("{record}");
        }
        Ok(())
    }

    pub async fn count(name: &str, q: &[String]) -> Result<(), anyhow::Error> {
        let pool = catalog::pool_from_env().await?;
        let store: std::sync::Arc<dyn crate::blobstore::BlobStore> =
            std::sync::Arc::new(crate::blobstore::S3BlobStore::from_env().await?);
        let index = catalog::lookup_by_arity(&pool, name, q.len())
            .await?
            .ok_or_else(|| BioIndexError::BadRequest(format!("no index named {name:?} with arity {}", q.len())))?;
        let n = planner::count(&pool, &store, &index, q).await?;
        println!("{n}");
        Ok(())
    }

    pub async fn r#match(name: &str, q: &[String], limit: Option<usize>) -> Result<(), anyhow::Error> {
        let config = crate::config::Config::load(&crate::config::NoopSecretsBootstrap).await?;
        let pool = catalog::pool_from_env().await?;
        let index = catalog::lookup_any(&pool, name)
            .await?
            .ok_or_else(|| BioIndexError::BadRequest(format!("no index named {name:?}")))?;
        let (keys, _has_more) =
            planner::r#match(&pool, &index, q, limit.unwrap_or(config.match_limit), 0).await?;
        for key in keys {
            println!("{key}");
        }
        Ok(())
    }

    pub async fn all(name: &str, arity: Option<usize>) -> Result<(), anyhow::Error> {
        let config = crate::config::Config::load(&crate::config::NoopSecretsBootstrap).await?;
        let pool = catalog::pool_from_env().await?;
        let store: std::sync::Arc<dyn crate::blobstore::BlobStore> =
            std::sync::Arc::new(crate::blobstore::S3BlobStore::from_env().await?);
        let index = match arity {
            Some(arity) => catalog::lookup_by_arity(&pool, name, arity).await?,
            None => catalog::lookup_any(&pool, name).await?,
        }
        .ok_or_else(|| BioIndexError::BadRequest(format!("no index named {name:?}")))?;
        let mut reader = planner::fetch_all(&store, &index, None).await?;
        let page = reader.next_page(config.match_limit).await?;
        for record in page.records {
            println!("{record}");
        }
        Ok(())
    }
}
