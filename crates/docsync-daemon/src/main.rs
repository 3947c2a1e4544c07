//! docsync daemon - background synchronization service
//!
//! Runs every configured sync root until SIGTERM/SIGINT:
//! - one SQLite metadata database per root below `data_dir`
//! - one repository adapter per root
//! - watcher, scheduler and queue consumer per root (see `docsync_sync::root`)
//!
//! With `--once` every root runs a single full synchronization in the
//! foreground and the process exits.

mod directory_repository;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use docsync_cache::{DatabasePool, SqliteIgnoredEntitiesStorage, SqliteMetaDataStorage};
use docsync_core::config::{Config, LoggingConfig, RootConfig};
use docsync_core::ports::IRepository;
use docsync_sync::filesystem::LocalFileSystemAdapter;
use docsync_sync::filter::IgnoredEntitiesCollection;
use docsync_sync::root::{path_matcher, RootStatus, SyncBackend, SyncRoot};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::directory_repository::DirectoryRepository;

#[derive(Debug, Parser)]
#[command(name = "docsyncd", version, about = "Document repository synchronization daemon")]
struct Args {
    /// Configuration file (defaults to $XDG_CONFIG_HOME/docsync/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Synchronize every root once and exit
    #[arg(long)]
    once: bool,
}

// ============================================================================
// DaemonService
// ============================================================================

/// A started sync root and the database it owns
struct RootRuntime {
    sync: SyncRoot,
    pool: DatabasePool,
}

/// Owns every sync root of the process
struct DaemonService {
    roots: Vec<RootRuntime>,
    shutdown: CancellationToken,
}

impl DaemonService {
    /// Opens databases and repositories and assembles every root
    async fn new(config: &Config, shutdown: CancellationToken) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;

        let mut roots = Vec::with_capacity(config.roots.len());
        for root in &config.roots {
            let runtime = open_root(config, root)
                .await
                .with_context(|| format!("Failed to open sync root {}", root.name))?;
            roots.push(runtime);
        }
        Ok(Self { roots, shutdown })
    }

    /// One full synchronization per root
    async fn run_once(&mut self) -> Result<()> {
        let mut failed = 0usize;
        for root in &mut self.roots {
            match root.sync.sync_once().await {
                Ok(events) => info!(root = %root.sync.name(), events, "Root synchronized"),
                Err(e) => {
                    failed += 1;
                    error!(root = %root.sync.name(), error = %e, "Synchronization failed");
                }
            }
        }
        self.close().await;
        anyhow::ensure!(failed == 0, "{failed} root(s) failed to synchronize");
        Ok(())
    }

    /// Starts every root and waits for the shutdown signal
    async fn run(&mut self) -> Result<()> {
        for root in &mut self.roots {
            root.sync.start(self.shutdown.child_token()).await?;
            tokio::spawn(log_status(
                root.sync.name().to_string(),
                root.sync.subscribe_status(),
                self.shutdown.child_token(),
            ));
        }
        info!(roots = self.roots.len(), "All sync roots started");

        self.shutdown.cancelled().await;
        info!("Shutdown signal received");
        for root in &mut self.roots {
            root.sync.shutdown().await;
        }
        self.close().await;
        Ok(())
    }

    async fn close(&self) {
        for root in &self.roots {
            root.pool.close().await;
        }
    }
}

/// Builds the storage, repository and sync root for one configured root
async fn open_root(config: &Config, root: &RootConfig) -> Result<RootRuntime> {
    let matcher = path_matcher(root)?;
    let pool = DatabasePool::new(&root.database_path(&config.data_dir))
        .await
        .context("Failed to open metadata database")?;

    let storage = Arc::new(SqliteMetaDataStorage::new(pool.pool().clone(), matcher));
    let ignored_storage = Arc::new(SqliteIgnoredEntitiesStorage::new(pool.pool().clone()));
    let ignored = Arc::new(IgnoredEntitiesCollection::load(ignored_storage).await?);
    let repository = open_repository(root).await?;

    let backend = SyncBackend {
        repository,
        storage: storage.clone(),
        transmission_storage: storage,
        ignored,
        fs: Arc::new(LocalFileSystemAdapter::new()),
    };
    let sync = SyncRoot::new(root.clone(), &config.ignore, backend)?;
    info!(
        root = %root.name,
        local = %root.local_path.display(),
        remote = %root.remote_path,
        "Sync root ready"
    );
    Ok(RootRuntime { sync, pool })
}

async fn open_repository(root: &RootConfig) -> Result<Arc<dyn IRepository>> {
    match root.repository.kind.as_str() {
        "directory" => Ok(Arc::new(
            DirectoryRepository::open(&root.repository.location).await?,
        )),
        other => anyhow::bail!("Unknown repository kind {other:?}"),
    }
}

/// Logs status transitions of one root
async fn log_status(name: String, mut rx: watch::Receiver<RootStatus>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *rx.borrow_and_update();
                match status {
                    RootStatus::Suspended => {
                        warn!(root = %name, "Repository unreachable, synchronization suspended");
                    }
                    other => info!(root = %name, status = ?other, "Root status"),
                }
            }
        }
    }
}

// ============================================================================
// Start-up helpers
// ============================================================================

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(Config::load_or_default(&Config::default_path())),
    }
}

/// Installs the global subscriber; `RUST_LOG` wins over the configured level
fn init_tracing(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Waits for SIGTERM or SIGINT and cancels `token`
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }
    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    init_tracing(&config.logging);

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!(%problem, "Invalid configuration");
        }
        anyhow::bail!("Configuration has {} error(s)", problems.len());
    }
    if config.roots.is_empty() {
        warn!("No sync roots configured");
    }

    info!(once = args.once, "docsync daemon starting");
    let shutdown = CancellationToken::new();
    let mut service = DaemonService::new(&config, shutdown.clone()).await?;

    let result = if args.once {
        service.run_once().await
    } else {
        tokio::spawn(shutdown_signal(shutdown));
        service.run().await
    };

    match &result {
        Ok(()) => info!("docsync daemon shut down gracefully"),
        Err(e) => error!(error = %e, "docsync daemon exiting with error"),
    }
    result
}
