mod cli;
mod config;
mod storage;

use crate::cli::{Command, ConfigCommand};
use clap::Parser;
use color_eyre::Result;
use strongbox_core::storage::{KeyDeletion, PersistableKvStore};
use strongbox_storage::{ClassifiedStore, RotationOptions, RotationReport};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Entry point wiring the CLI to the settings store.
fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = match &cli.config {
        Some(path) => config::load_from_path(path)?,
        None => config::load()?,
    };
    match cli.command {
        Command::Get { key } => {
            let mut store = storage::open_store(&config)?;
            match run_get(&mut store, &key)? {
                Some(value) => println!("{value}"),
                None => color_eyre::eyre::bail!("no setting named {key}"),
            }
        }
        Command::Set { key, value } => run_set(&mut storage::open_store(&config)?, &key, &value)?,
        Command::Remove { key } => {
            if !run_remove(&mut storage::open_store(&config)?, &key)? {
                warn!(key = %key, "no setting to remove");
            }
        }
        Command::List => {
            for key in storage::open_store(&config)?.keys() {
                println!("{key}");
            }
        }
        Command::Rotate { to, keep_previous } => {
            let mut store = storage::open_store(&config)?;
            let report = run_rotate(&mut store, to, keep_previous)?;
            print_rotation(&report);
        }
        Command::DeleteKey => {
            let mut store = storage::open_store(&config)?;
            let container = store.key_container_name().to_string();
            match store.delete_key()? {
                KeyDeletion::Deleted => println!("Deleted key pair {container}"),
                KeyDeletion::AlreadyAbsent => println!("Key pair {container} was already gone"),
            }
        }
        Command::Health => {
            run_store_health(&mut storage::open_store(&config)?)?;
            println!("Storage: ok");
        }
        Command::Config(ConfigCommand::Init) => init_config(&config, cli.config.as_deref())?,
        Command::Version => print_version(),
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("strongbox {}", env!("CARGO_PKG_VERSION"));
}

fn run_get<S: PersistableKvStore>(
    store: &mut ClassifiedStore<S>,
    key: &str,
) -> Result<Option<String>> {
    Ok(store.get(key)?)
}

fn run_set<S: PersistableKvStore>(
    store: &mut ClassifiedStore<S>,
    key: &str,
    value: &str,
) -> Result<()> {
    store.set(key, value)?;
    store.commit()?;
    Ok(())
}

fn run_remove<S: PersistableKvStore>(store: &mut ClassifiedStore<S>, key: &str) -> Result<bool> {
    let removed = store.remove(key)?;
    if removed {
        store.commit()?;
    }
    Ok(removed)
}

fn run_rotate<S: PersistableKvStore>(
    store: &mut ClassifiedStore<S>,
    to: Option<String>,
    keep_previous: bool,
) -> Result<RotationReport> {
    let target = to.unwrap_or_else(|| format!("strongbox-{}", uuid::Uuid::new_v4()));
    let options = RotationOptions {
        delete_previous: !keep_previous,
    };
    let report = store.rotate_key(&target, options)?;
    for warning in &report.warnings {
        warn!("{warning}");
    }
    info!(
        from = %report.previous_container,
        to = %report.container,
        "rotation complete"
    );
    Ok(report)
}

fn print_rotation(report: &RotationReport) {
    println!(
        "Rotated {} settings from {} to {}",
        report.reencrypted, report.previous_container, report.container
    );
    if !report.warnings.is_empty() {
        println!("Previous key pair {} was kept", report.previous_container);
    }
}

/// Runs a quick round trip through the encrypted store.
fn run_store_health<S: PersistableKvStore>(store: &mut ClassifiedStore<S>) -> Result<()> {
    let probe_key = "health:probe";
    let payload = "ok";
    store.set(probe_key, payload)?;
    let round_trip = store.get(probe_key)?;
    store.remove(probe_key)?;
    store.commit()?;

    if round_trip.as_deref() != Some(payload) {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    Ok(())
}

fn init_config(config: &config::Config, path: Option<&std::path::Path>) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config::default_path()?,
    };
    let path = config::write_if_missing(config, &path)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}
