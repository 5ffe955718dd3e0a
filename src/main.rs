// src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lockstep::Config;
use lockstep::controller::Controller;
use lockstep::db::models::{
    LOCK_NAME, Lock, LockSpec, PackageSnapshot, SourceRef, Transaction, TransactionSpec,
};
use lockstep::db::{LabelSelector, ObjectStore, SqliteStore, StoreExt};
use lockstep::packages::DirectoryFetcher;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "lockstep")]
#[command(author, version, about = "Transactional package installation for cluster extensions", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the object store, the artifact catalog and the empty lock
    Init,
    /// Run the transaction controller until interrupted
    Run,
    /// Request installation of a package
    Install {
        /// Package reference: repository[:version or constraint]
        package: String,
        /// Name for the Package object (default: last repository segment)
        #[arg(long)]
        name: Option<String>,
        /// Failed attempts allowed before the transaction gives up
        #[arg(long)]
        retry_limit: Option<u32>,
    },
    /// Show transactions, or one transaction in detail
    Status {
        name: Option<String>,
    },
    /// Show the installed package set
    Lock,
}

fn open_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening object store at {}", config.db_path.display()))?;
    Ok(Arc::new(store))
}

fn init(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    std::fs::create_dir_all(&config.catalog_dir).with_context(|| {
        format!("creating catalog directory {}", config.catalog_dir.display())
    })?;

    if store.find_object::<LockSpec>(LOCK_NAME)?.is_none() {
        store.create_object(&Lock::new(LOCK_NAME, LockSpec::default()))?;
        info!("Created empty lock");
    }
    println!("Initialized object store at {}", config.db_path.display());
    println!("Artifact catalog: {}", config.catalog_dir.display());
    Ok(())
}

fn run(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let fetcher = Arc::new(DirectoryFetcher::new(&config.catalog_dir));
    let controller = Controller::from_config(store, fetcher, config)?;

    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    runtime.block_on(async move {
        let (stop, shutdown) = tokio::sync::watch::channel(false);
        let running = tokio::spawn(controller.run(shutdown));

        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        info!("Received shutdown signal");
        let _ = stop.send(true);
        running.await.context("controller task failed")?;
        Ok::<(), anyhow::Error>(())
    })
}

fn install(
    config: &Config,
    package: &str,
    name: Option<String>,
    retry_limit: Option<u32>,
) -> Result<()> {
    let source = SourceRef::parse(package)?;
    let package_name = name.unwrap_or_else(|| source.short_name().to_string());
    let snapshot = PackageSnapshot {
        name: package_name.clone(),
        source: source.repository.clone(),
        version: source.version.clone().unwrap_or_default(),
    };

    let mut spec = TransactionSpec::install(snapshot);
    spec.retry_limit = retry_limit.unwrap_or(config.default_retry_limit);

    let id = Uuid::new_v4().simple().to_string();
    let tx_name = format!("install-{}-{}", package_name, &id[..8]);

    let store = open_store(config)?;
    store.create_object(&Transaction::new(&tx_name, spec))?;
    println!("Created transaction {} for {}", tx_name, package);
    Ok(())
}

fn status(config: &Config, name: Option<String>) -> Result<()> {
    let store = open_store(config)?;

    let Some(name) = name else {
        let transactions = store.list_objects::<TransactionSpec>(&LabelSelector::everything())?;
        if transactions.is_empty() {
            println!("No transactions");
            return Ok(());
        }
        for tx in transactions {
            let target = tx
                .spec
                .install
                .as_ref()
                .map(|i| i.package.source.clone())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{}\t{}\t{}\tfailures={}",
                tx.name(),
                tx.status.phase.as_str(),
                target,
                tx.status.failures
            );
        }
        return Ok(());
    };

    let tx = store.get_object::<TransactionSpec>(&name)?;
    println!("Transaction: {}", tx.name());
    println!("  Change: {}", tx.spec.change.as_str());
    if let Some(install) = &tx.spec.install {
        let version = if install.package.version.is_empty() {
            "*"
        } else {
            install.package.version.as_str()
        };
        println!("  Package: {} {}", install.package.source, version);
    }
    println!("  Phase: {}", tx.status.phase.as_str());
    println!("  Failures: {}/{}", tx.status.failures, tx.spec.retry_limit);

    if !tx.status.conditions.is_empty() {
        println!("  Conditions:");
        for condition in &tx.status.conditions {
            let reason = condition
                .reason
                .map(|r| format!(" ({:?})", r))
                .unwrap_or_default();
            let message = condition.message.as_deref().unwrap_or("");
            println!(
                "    {:?}{} {} {}",
                condition.condition_type,
                reason,
                condition.last_transition_time.format("%Y-%m-%d %H:%M:%S"),
                message
            );
        }
    }
    if !tx.status.proposed_lock_packages.is_empty() {
        println!("  Proposed packages:");
        for pkg in &tx.status.proposed_lock_packages {
            println!("    {}", pkg.reference());
        }
    }
    Ok(())
}

fn show_lock(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let Some(lock) = store.find_object::<LockSpec>(LOCK_NAME)? else {
        println!("No lock; run 'lockstep init' first");
        return Ok(());
    };

    if let Some(holder) = lock.holder() {
        println!("Held by transaction {}", holder);
    }
    if lock.spec.packages.is_empty() {
        println!("No packages installed");
        return Ok(());
    }
    for pkg in &lock.spec.packages {
        println!(
            "{}\t{}\t{}",
            pkg.name,
            pkg.package_type.as_str(),
            pkg.reference()
        );
        for dep in &pkg.dependencies {
            println!("  requires {} {}", dep.package, dep.constraints);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_or_default(cli.config.as_deref())?;

    // RUST_LOG wins over the configured filter
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(config.log_filter.as_deref().unwrap_or("info"))
            }),
        )
        .init();

    match cli.command {
        Some(Commands::Init) => init(&config),
        Some(Commands::Run) => run(&config),
        Some(Commands::Install {
            package,
            name,
            retry_limit,
        }) => install(&config, &package, name, retry_limit),
        Some(Commands::Status { name }) => status(&config, name),
        Some(Commands::Lock) => show_lock(&config),
        None => {
            println!("lockstep v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'lockstep --help' for usage information");
            Ok(())
        }
    }
}
