//! CLI entry point for the debrid downloader.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use debrid_core::store::DownloadRepository;
use debrid_core::{
    AllDebridClient, ArchiveProcessor, Database, DownloadFilter, DownloadService, DownloadStore,
    EngineConfig, FileClassifier, HttpTransport, PathValidator, Scheduler, SchedulerHandle,
    SchedulerSettings, TransferExecutor, TransferSettings,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = load_config(&args)?;
    let paths = PathValidator::new(&config.base_dir)
        .with_context(|| format!("cannot use base directory {}", config.base_dir.display()))?;
    if let Some(parent) = config.database_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    let db = Database::new(&config.database_path)
        .await
        .with_context(|| format!("cannot open {}", config.database_path.display()))?;
    let store = DownloadStore::new(db);

    let handle = SchedulerHandle::default();
    let mut service = DownloadService::new(store.clone(), paths.clone(), handle.clone());
    if config.alldebrid_api_key.is_some() {
        let resolver = AllDebridClient::from_config(&config)?;
        service = service.with_resolver(Arc::new(resolver));
    }

    match args.command {
        Command::Run { concurrency } => {
            let mut settings = SchedulerSettings::from(&config);
            if let Some(concurrency) = concurrency {
                settings.max_concurrent = usize::from(concurrency);
            }
            run_worker(&config, store, paths, handle, settings).await?;
        }
        Command::Add { url, dir } => {
            let id = service.enqueue(&url, &dir).await?;
            println!("queued download {id}");
        }
        Command::Submit { links, dir } => {
            let submission = service.submit(&links, dir.as_deref()).await?;
            match &submission.group_id {
                Some(group) => println!(
                    "queued {} downloads as group {group} in {}",
                    submission.download_ids.len(),
                    submission.directory
                ),
                None => println!(
                    "queued download {} in {}",
                    submission.download_ids.first().copied().unwrap_or_default(),
                    submission.directory
                ),
            }
        }
        Command::List {
            status,
            search,
            limit,
            json,
        } => {
            let downloads = service
                .list(&DownloadFilter {
                    status,
                    search,
                    limit,
                })
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&downloads)?);
            } else {
                for download in &downloads {
                    println!(
                        "{:>5}  {:<11}  {:>6.1}%  {}",
                        download.id,
                        download.status(),
                        download.progress,
                        download.filename
                    );
                    if !download.error_message.is_empty() {
                        println!("       {}", download.error_message);
                    }
                }
            }
        }
        Command::Pause { id } => {
            service.pause(id).await?;
            println!("paused download {id}");
        }
        Command::Resume { id } => {
            service.resume(id).await?;
            println!("resumed download {id}");
        }
        Command::Retry { id } => {
            service.retry(id).await?;
            println!("re-queued download {id}");
        }
        Command::Cancel { id } => {
            service.cancel(id).await?;
            println!("cancelled download {id}");
        }
        Command::Delete { id } => {
            service.delete(id).await?;
            println!("deleted download {id}");
        }
        Command::Suggest { filename } => {
            let suggestion = service.suggest_directory(&filename).await?;
            println!("{suggestion}");
        }
        Command::Group { id } => match service.group(&id).await? {
            Some(group) => println!("{}", serde_json::to_string_pretty(&group)?),
            None => anyhow::bail!("group {id} not found"),
        },
        Command::Stats => {
            let counts = service.stats().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => EngineConfig::load_default().context("cannot load default config")?,
    };
    if let Some(db) = &args.db {
        config.database_path.clone_from(db);
    }
    if let Some(base_dir) = &args.base_dir {
        config.base_dir.clone_from(base_dir);
    }
    config.validate()?;
    Ok(config)
}

async fn run_worker(
    config: &EngineConfig,
    store: DownloadStore,
    paths: PathValidator,
    handle: SchedulerHandle,
    settings: SchedulerSettings,
) -> Result<()> {
    let repo: Arc<dyn DownloadRepository> = Arc::new(store.clone());
    let transport = HttpTransport::new(config.connect_timeout())?;
    let executor = TransferExecutor::new(
        Arc::new(transport),
        Arc::clone(&repo),
        paths.clone(),
        TransferSettings::from(config),
    );
    let archive = ArchiveProcessor::new(repo, paths, FileClassifier::from_config(config));
    let scheduler = Scheduler::with_handle(store, executor, archive, settings, handle)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "cannot listen for Ctrl-C");
            return;
        }
        info!("shutdown requested");
        signal.cancel();
    });

    scheduler.run(shutdown).await?;
    Ok(())
}
