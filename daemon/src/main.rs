mod config;
mod coordination;
mod event;
mod idle;
mod inspector;
mod launcher;
mod lock;
mod notice;
mod overlay;
mod paths;
mod schedule;
mod supervisor;
#[cfg(test)]
mod testing;
mod watchdog;
mod worker;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{error, info, Instrument};
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigStore, Role};
use crate::coordination::{now_millis, CoordinationStore};
use crate::idle::SystemIdleSource;
use crate::inspector::SystemInspector;
use crate::launcher::ChromeLauncher;
use crate::lock::RoleLock;
use crate::paths::WorkPaths;
use crate::worker::{AudioWorker, Host, SaverWorker, TargetWorker, Worker};

/// Keeps kiosk browser surfaces alive on an unattended PC.
#[derive(Debug, Parser)]
#[command(name = "autowake", version)]
struct Cli {
    /// Working directory holding config, state, logs and browser profiles.
    /// Defaults to $AUTOWAKE_DIR, else C:\AutoWake.
    #[arg(long, global = true, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Supervise one role until Ctrl+C.
    Run {
        #[arg(value_enum)]
        role: Role,
    },
    /// Announce that an interactive window opened (enter) or closed (leave).
    Ui {
        #[arg(value_enum)]
        action: UiAction,
    },
    /// Mark the notice as dismissed.
    DismissNotice,
    /// Print the shared coordination state and worker locks.
    Status,
    /// Write the default config file if there is none.
    InitConfig,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum UiAction {
    Enter,
    Leave,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = dispatch(cli).await {
        error!("{e:#}");
        eprintln!("autowake: {e:#}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let base = WorkPaths::new(cli.work_dir.unwrap_or_else(paths::default_work_dir));
    let mut store = ConfigStore::new(base.config_file());

    if let Command::InitConfig = cli.command {
        init_logging(None)?;
        if config::ensure_exists(store.path())? {
            println!("Wrote default config to {}", store.path().display());
        } else {
            println!("Config already exists at {}", store.path().display());
        }
        return Ok(());
    }

    store.load();
    let paths = effective_paths(base, &store);
    let coordination = CoordinationStore::new(paths.coordination_dir());

    match cli.command {
        Command::Run { role } => {
            init_logging(Some(&paths.log_file()))?;
            run_role(role, paths, store).await
        }
        Command::Ui { action } => {
            init_logging(None)?;
            let count = match action {
                UiAction::Enter => coordination.ui_enter()?,
                UiAction::Leave => coordination.ui_leave()?,
            };
            println!("ui_active_ref_count = {count}");
            Ok(())
        }
        Command::DismissNotice => {
            init_logging(None)?;
            coordination.record_notice_dismissed(now_millis())?;
            println!("Notice dismissed");
            Ok(())
        }
        Command::Status => {
            init_logging(None)?;
            print_status(&paths, &coordination)
        }
        Command::InitConfig => Ok(()),
    }
}

/// A `general.work_dir` holding its own config relocates all state; one
/// without a config is ignored, as the loader ignores it.
fn effective_paths(base: WorkPaths, store: &ConfigStore) -> WorkPaths {
    match store.resolved_path().parent() {
        Some(dir) if dir != base.root() => WorkPaths::new(dir),
        _ => base,
    }
}

async fn run_role(role: Role, paths: WorkPaths, mut store: ConfigStore) -> Result<()> {
    std::fs::create_dir_all(paths.root())
        .with_context(|| format!("Failed to create work directory {}", paths.root().display()))?;
    let _lock = RoleLock::acquire(&paths.lock_file(role), role, lock::is_live_worker)?;

    let config = store.load();
    let launcher = ChromeLauncher::discover(config.general.browser_path.as_deref());
    info!(
        %role,
        version = env!("CARGO_PKG_VERSION"),
        work_dir = %paths.root().display(),
        browser = %launcher.exe().display(),
        "autowake worker starting"
    );
    let host = Host {
        launcher: Rc::new(launcher),
        inspector: Rc::new(SystemInspector::new()),
    };

    let worker: Box<dyn Worker> = match role {
        Role::Audio => Box::new(AudioWorker::new(host, paths, &config)),
        Role::Target => Box::new(TargetWorker::new(host, paths, &config)),
        Role::Saver => Box::new(SaverWorker::new(
            host,
            paths,
            Box::new(SystemIdleSource),
            Instant::now(),
        )),
    };
    worker::run(worker, store)
        .instrument(tracing::info_span!("worker", %role))
        .await;
    info!(%role, "autowake worker stopped");
    Ok(())
}

fn print_status(paths: &WorkPaths, coordination: &CoordinationStore) -> Result<()> {
    let state = coordination.load();
    let text = toml::to_string_pretty(&state).context("Failed to serialize state")?;
    println!("# {}", paths.coordination_dir().display());
    print!("{text}");
    println!();
    for role in [Role::Audio, Role::Target, Role::Saver] {
        match lock::read_owner(&paths.lock_file(role)) {
            Some(pid) if lock::is_live_worker(pid) => println!("{role}: running (pid {pid})"),
            Some(pid) => println!("{role}: stale lock (pid {pid})"),
            None => println!("{role}: not running"),
        }
    }
    Ok(())
}

/// Workers log to `log_file` (they have no console); CLI commands log to
/// stderr. `RUST_LOG` overrides the default `info` filter.
fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_and_global_work_dir() {
        let cli = Cli::try_parse_from(["autowake", "run", "saver", "--work-dir", "/w"]).unwrap();
        assert_eq!(cli.work_dir, Some(PathBuf::from("/w")));
        assert!(matches!(cli.command, Command::Run { role: Role::Saver }));
    }

    #[test]
    fn parses_ui_and_notice_commands() {
        let cli = Cli::try_parse_from(["autowake", "ui", "leave"]).unwrap();
        assert!(matches!(cli.command, Command::Ui { action: UiAction::Leave }));
        let cli = Cli::try_parse_from(["autowake", "dismiss-notice"]).unwrap();
        assert!(matches!(cli.command, Command::DismissNotice));
        assert!(Cli::try_parse_from(["autowake", "run", "printer"]).is_err());
    }

    #[test]
    fn state_follows_config_redirect_only_when_target_has_config() {
        let base = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let base_paths = WorkPaths::new(base.path());
        std::fs::write(
            base_paths.config_file(),
            format!("[general]\nwork_dir = {:?}\n", other.path().display().to_string()),
        )
        .unwrap();

        let mut store = ConfigStore::new(base_paths.config_file());
        store.load();
        assert_eq!(effective_paths(base_paths.clone(), &store).root(), base.path());

        std::fs::write(other.path().join("config.toml"), "").unwrap();
        store.load();
        assert_eq!(effective_paths(base_paths, &store).root(), other.path());
    }
}
