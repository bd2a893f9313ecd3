//! Binary entrypoint for the worldstore CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml` and create the store schema
//! - `status` - areas, record counts and the highest persisted serials
//! - `areas` - list storage areas
//! - `find <area> <name>` - load a root object and print everything inside it
//! - `search <area> <predicate>` - filtered search within an area
//! - `export <file>` / `import <file>` - JSON dumps of the whole store
//! - `backup create|list|verify|restore` - archived snapshots of the store file
//!
//! See the library crate docs for module-level details: `worldstore::`.
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use fs2::FileExt;
use log::info;
use std::path::{Path, PathBuf};

use worldstore::config::Config;
use worldstore::logutil::escape_log;
use worldstore::store::backup::{BackupKind, BackupManager};
use worldstore::store::dump::StoreDump;
use worldstore::store::objects::TypeCatalog;
use worldstore::store::{Serial, World, WorldStore};

#[derive(Parser)]
#[command(name = "worldstore")]
#[command(about = "Inspect and maintain a world server's object store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration (if missing) and create the store
    Init,
    /// Show areas, record counts and serial high-water marks
    Status,
    /// List storage areas
    Areas,
    /// Load a root object by name and print its contents
    Find { area: String, name: String },
    /// Search an area, e.g. `search bank 'Amount > 100 && Name like "%coin"'`
    Search { area: String, predicate: String },
    /// Write every record to a JSON dump
    Export { file: PathBuf },
    /// Bulk-load a JSON dump into the store
    Import { file: PathBuf },
    /// Manage store backups
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
}

#[derive(Subcommand)]
enum BackupAction {
    /// Snapshot the store into a new archive
    Create {
        #[arg(short, long)]
        name: Option<String>,
    },
    /// List archives, newest first
    List,
    /// Re-check an archive's checksum
    Verify { id: String },
    /// Replace the store file with an archive (the server must be stopped)
    Restore { id: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.command {
        Commands::Init => None,
        _ => Some(Config::load(&cli.config)?),
    };
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Init => {
            if Path::new(&cli.config).exists() {
                println!("Config {} already exists, keeping it", cli.config);
            } else {
                Config::create_default(&cli.config)?;
                println!("Wrote default config to {}", cli.config);
            }
            let config = Config::load(&cli.config)?;
            let store = open_store(&config)?;
            match store.path() {
                Some(path) => println!("Store ready at {}", path.display()),
                None => println!("Store is disabled in {}", cli.config),
            }
            store.close()?;
        }
        Commands::Status => {
            let config = loaded(config)?;
            let store = open_store(&config)?;
            let status = store.status()?;
            match &status.path {
                Some(path) => println!("Store: {}", path.display()),
                None => println!("Store: disabled"),
            }
            println!(
                "Records: {} storage, {} pcs, {} pcequip",
                status.storage, status.pcs, status.pcequip
            );
            println!("Areas ({}):", status.areas.len());
            for area in &status.areas {
                println!("  {:<24} {:>8}", area.name, area.records);
            }
            let show = |label: &str, serial: Option<Serial>| match serial {
                Some(s) => println!("  {:<16} {}", label, s),
                None => println!("  {:<16} -", label),
            };
            println!("Highest serials:");
            show("storage items", status.floor.storage_items);
            show("characters", status.floor.characters);
            show("held items", status.floor.held_items);
            show("equipped items", status.floor.equipped_items);
            store.close()?;
        }
        Commands::Areas => {
            let config = loaded(config)?;
            let store = open_store(&config)?;
            for area in store.list_areas()? {
                println!("{}", area);
            }
            store.close()?;
        }
        Commands::Find { area, name } => {
            let config = loaded(config)?;
            let mut store = open_store(&config)?;
            let mut world = World::new(TypeCatalog::new());
            store.boot(&mut world)?;
            match store.load_root(&mut world, &area, &name)? {
                Some(root) => print_tree(&world, root, 0),
                None => println!("No root named '{}' in area '{}'", name, area),
            }
            store.close()?;
        }
        Commands::Search { area, predicate } => {
            let config = loaded(config)?;
            let mut store = open_store(&config)?;
            let mut world = World::new(TypeCatalog::new());
            store.boot(&mut world)?;
            let matches = store.search_area(&mut world, &area, &predicate)?;
            for serial in &matches {
                let name = world.get(*serial).map(|o| o.name().to_string()).unwrap_or_default();
                println!("{}  {}", serial, escape_log(&name));
            }
            println!("{} match(es)", matches.len());
            store.close()?;
        }
        Commands::Export { file } => {
            let config = loaded(config)?;
            let store = open_store(&config)?;
            let dump = store.export_dump()?;
            dump.save(&file)
                .with_context(|| format!("writing dump to {}", file.display()))?;
            println!("Exported {} records to {}", dump.records(), file.display());
            store.close()?;
        }
        Commands::Import { file } => {
            let config = loaded(config)?;
            let dump = StoreDump::load(&file)
                .with_context(|| format!("reading dump from {}", file.display()))?;
            let store = open_store(&config)?;
            if config.backup.before_import && store.is_enabled() {
                let meta = create_backup(&config, &store, Some("before import".to_string()), BackupKind::PreImport)?;
                info!("Pre-import backup {}", meta);
            }
            let report = store.import_dump(&dump)?;
            println!(
                "Imported {} records ({} areas declared, {} skipped, {} orphans discarded) in {} ms",
                report.records(),
                report.areas,
                report.skipped,
                report.orphans_discarded,
                report.elapsed_ms
            );
            store.close()?;
        }
        Commands::Backup { action } => {
            let config = loaded(config)?;
            run_backup(&config, action)?;
        }
    }
    Ok(())
}

fn loaded(config: Option<Config>) -> Result<Config> {
    config.ok_or_else(|| anyhow!("configuration not loaded"))
}

fn open_store(config: &Config) -> Result<WorldStore> {
    WorldStore::from_config(&config.store).with_context(|| {
        format!(
            "opening store at {}",
            config.store.database_path().display()
        )
    })
}

fn print_tree(world: &World, serial: Serial, depth: usize) {
    let name = world.get(serial).map(|o| o.name().to_string()).unwrap_or_default();
    println!("{}{}  {}", "  ".repeat(depth), serial, escape_log(&name));
    for &child in world.contents(serial) {
        print_tree(world, child, depth + 1);
    }
}

fn backup_manager(config: &Config) -> Result<BackupManager> {
    BackupManager::new(PathBuf::from(&config.backup.directory), config.backup.keep)
        .with_context(|| format!("opening backup directory {}", config.backup.directory))
}

/// Snapshot the open store, archive it, then apply retention. Returns the new id.
fn create_backup(config: &Config, store: &WorldStore, name: Option<String>, kind: BackupKind) -> Result<String> {
    let mut manager = backup_manager(config)?;
    let staging = manager.staging_path();
    store.backup_to(&staging)?;
    let result = manager.create_backup(&staging, name, kind);
    if let Err(e) = std::fs::remove_file(&staging) {
        log::warn!("Could not remove backup staging file {}: {}", staging.display(), e);
    }
    let meta = result?;
    let removed = manager.apply_retention_policy()?;
    if !removed.is_empty() {
        info!("Retention removed {} old backup(s)", removed.len());
    }
    Ok(meta.id)
}

fn run_backup(config: &Config, action: BackupAction) -> Result<()> {
    match action {
        BackupAction::Create { name } => {
            let store = open_store(config)?;
            if !store.is_enabled() {
                return Err(anyhow!("store is disabled; nothing to back up"));
            }
            let id = create_backup(config, &store, name, BackupKind::Manual)?;
            println!("Created backup {}", id);
            store.close()?;
        }
        BackupAction::List => {
            let manager = backup_manager(config)?;
            for b in manager.list_backups() {
                println!(
                    "{}  {}  {:>10} bytes  {:?}{}  {}",
                    b.id,
                    b.created_at.format("%Y-%m-%dT%H:%M:%SZ"),
                    b.size_bytes,
                    b.kind,
                    if b.verified { " verified" } else { "" },
                    b.name.unwrap_or_default()
                );
            }
        }
        BackupAction::Verify { id } => {
            let mut manager = backup_manager(config)?;
            if manager.verify_backup(&id)? {
                println!("Backup {} is intact", id);
            } else {
                return Err(anyhow!("backup {} failed checksum verification", id));
            }
        }
        BackupAction::Restore { id } => {
            let manager = backup_manager(config)?;
            let db_path = config.store.database_path();
            // Hold the store's own lock so a running server cannot be overwritten.
            let mut lock_path = db_path.as_os_str().to_owned();
            lock_path.push(".lock");
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let lock = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)?;
            lock.try_lock_exclusive()
                .map_err(|_| anyhow!("store {} is in use", db_path.display()))?;
            manager.restore_backup(&id, &db_path)?;
            println!("Restored backup {} to {}", id, db_path.display());
        }
    }
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let configured = config
        .as_ref()
        .and_then(|cfg| cfg.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    // -v flags raise the configured level, never lower it
    let level = match verbosity {
        0 => configured,
        1 => configured.max(log::LevelFilter::Debug),
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(level);

    let log_file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Echo to the console only when someone is watching it
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
