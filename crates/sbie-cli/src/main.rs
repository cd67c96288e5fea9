//! sbie - Sandboxie-Plus portable installation manager
//!
//! ## Commands
//!
//! - `install` / `remove`: full lifecycle of the portable installation
//! - `start`, `status`, `home`: service control and presence checks
//! - `driver`, `service`: single-component registration
//! - `config`: raw configuration queries and edits
//! - `box`: sandbox creation, inspection and process control
//! - `exe`: executable checks

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::debug;

use sbie_core::{
    ConfigKey, ConfigOperation, Orchestrator, Outcome, QueryOptions, SbieSettings,
};

#[derive(Parser)]
#[command(name = "sbie")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Install and drive a portable Sandboxie-Plus", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and results
    #[arg(long, global = true)]
    json: bool,

    /// Directory holding the installation (default: SBIE_BASE_DIR or the
    /// directory of this executable)
    #[arg(long, global = true, env = "SBIE_BASE_DIR")]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download, unpack and register Sandboxie-Plus
    Install {
        /// Retry downloads up to three times
        #[arg(long)]
        retry: bool,
    },

    /// Unregister all components and delete the installation
    Remove,

    /// Start the sandbox service
    Start {
        #[arg(long)]
        retry: bool,
    },

    /// Show presence of install path, driver and service
    Status,

    /// Show the installation root reported by the native layer
    Home,

    /// Kernel driver registration
    Driver {
        #[command(subcommand)]
        action: ComponentAction,
    },

    /// Service registration and control
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },

    /// Configuration queries and edits
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Sandbox management
    Box {
        #[command(subcommand)]
        action: BoxAction,
    },

    /// Run a program in a box without checking its configuration
    Run {
        /// Box name
        #[arg(long = "box", default_value = "DefaultBox")]
        box_name: String,

        /// Program to start
        file: PathBuf,
    },

    /// Executable checks
    Exe {
        #[command(subcommand)]
        action: ExeAction,
    },
}

#[derive(Subcommand)]
enum ComponentAction {
    Install,
    Remove,
}

#[derive(Subcommand)]
enum ServiceAction {
    Install,
    Remove,
    Start {
        #[arg(long)]
        retry: bool,
    },
    Stop {
        #[arg(long)]
        retry: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Read one occurrence of a key
    Get {
        section: String,
        key: ConfigKey,

        /// Occurrence index
        #[arg(short, long, default_value = "0")]
        index: u32,

        /// Query flags, e.g. `skip-global,ignore-templates`
        #[arg(short, long, default_value = "none")]
        options: QueryOptions,
    },

    /// Read every occurrence of a key
    All {
        section: String,
        key: ConfigKey,

        #[arg(short, long, default_value = "none")]
        options: QueryOptions,
    },

    /// Edit a key and reload the configuration
    Edit {
        #[arg(value_enum)]
        operation: EditOperation,
        section: String,
        key: ConfigKey,

        #[arg(default_value = "")]
        value: String,

        /// Configuration password (default: SBIE_CONFIG_PASSWORD)
        #[arg(long)]
        password: Option<String>,
    },

    /// Re-read the persisted configuration
    Reload {
        /// Session to reload (default: current)
        #[arg(long)]
        session: Option<u32>,
    },

    /// Reset GlobalSettings to the global defaults
    Defaults,
}

#[derive(Clone, Copy, ValueEnum)]
enum EditOperation {
    Set,
    Append,
    Insert,
    Delete,
}

impl From<EditOperation> for ConfigOperation {
    fn from(op: EditOperation) -> Self {
        match op {
            EditOperation::Set => ConfigOperation::Overwrite,
            EditOperation::Append => ConfigOperation::Append,
            EditOperation::Insert => ConfigOperation::Insert,
            EditOperation::Delete => ConfigOperation::Delete,
        }
    }
}

#[derive(Subcommand)]
enum BoxAction {
    /// List configured boxes
    List,
    /// Create a box with the default configuration
    Create { name: String },
    /// Reset an existing box to the default configuration
    Defaults { name: String },
    /// Delete a box that has no running processes
    Remove { name: String },
    /// Show a box's own configuration
    Show { name: String },
    /// Show the box root on the host filesystem
    Path { name: String },
    /// List processes running in a box
    Procs { name: String },
    /// Start a program in a box
    Run { name: String, file: PathBuf },
    /// Terminate one process, or all processes of the box
    Kill {
        name: String,
        #[arg(long)]
        pid: Option<u32>,
    },
}

#[derive(Subcommand)]
enum ExeAction {
    /// Check that a file resolves to a regular executable
    Check { file: PathBuf },
    /// Check that a file is a 64-bit image
    Bits { file: PathBuf },
}

#[derive(Serialize)]
struct HomeView {
    nt: String,
    dos: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    sbie_core::telemetry::init_tracing(cli.json, cli.verbose);

    let mut settings = SbieSettings::from_env();
    if let Some(base_dir) = cli.base_dir {
        settings.base_dir = base_dir;
    }
    debug!(base_dir = %settings.base_dir.display(), "settings loaded");

    let orchestrator =
        Orchestrator::system(settings).context("Failed to set up release client")?;
    let out = Printer { json: cli.json };

    let ok = match cli.command {
        Commands::Install { retry } => out.flag(&orchestrator.install(retry).await)?,
        Commands::Remove => out.flag(&orchestrator.remove().await)?,
        Commands::Start { retry } => out.flag(&orchestrator.start_service(retry))?,
        Commands::Status => cmd_status(&orchestrator, &out)?,
        Commands::Home => {
            let home = orchestrator.home_path().map(|h| HomeView {
                nt: h.nt,
                dos: h.dos,
            });
            out.print(&home, |h| format!("{}\n{}", h.dos, h.nt))?
        }
        Commands::Driver { action } => {
            let installer = orchestrator.installer();
            let outcome = match action {
                ComponentAction::Install => installer.install_driver().await,
                ComponentAction::Remove => installer.remove_driver().await,
            };
            out.flag(&outcome)?
        }
        Commands::Service { action } => {
            let installer = orchestrator.installer();
            let outcome = match action {
                ServiceAction::Install => installer.install_service().await,
                ServiceAction::Remove => installer.remove_service().await,
                ServiceAction::Start { retry } => installer.start_service(retry),
                ServiceAction::Stop { retry } => installer.stop_service(retry).await,
            };
            out.flag(&outcome)?
        }
        Commands::Config { action } => cmd_config(&orchestrator, &out, action)?,
        Commands::Box { action } => cmd_box(&orchestrator, &out, action)?,
        Commands::Run { box_name, file } => {
            out.print(&orchestrator.run_boxed(&file, &box_name), |pid| {
                format!("started pid {pid}")
            })?
        }
        Commands::Exe { action } => match action {
            ExeAction::Check { file } => out.flag(&orchestrator.can_execute(&file))?,
            ExeAction::Bits { file } => out.flag(&orchestrator.is_64bit(&file))?,
        },
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn cmd_status(orchestrator: &Orchestrator, out: &Printer) -> Result<bool> {
    let status = orchestrator.status();
    if out.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        for (name, outcome) in [
            ("install path", &status.install_path),
            ("driver", &status.driver),
            ("service", &status.service),
        ] {
            println!("{name:<13} {}", outcome.status());
        }
    }
    Ok(status.install_path.is_ok() && status.driver.is_ok() && status.service.is_ok())
}

fn cmd_config(orchestrator: &Orchestrator, out: &Printer, action: ConfigAction) -> Result<bool> {
    let store = orchestrator.config();
    match action {
        ConfigAction::Get {
            section,
            key,
            index,
            options,
        } => out.print(&store.get(&section, key, index, options), String::clone),
        ConfigAction::All {
            section,
            key,
            options,
        } => out.print(&store.get_all(&section, key, options), |values| {
            values.join("\n")
        }),
        ConfigAction::Edit {
            operation,
            section,
            key,
            value,
            password,
        } => {
            let edited = store.edit(
                operation.into(),
                &section,
                key,
                &value,
                password.as_deref(),
            );
            if !edited.is_ok() {
                return out.flag(&edited);
            }
            out.flag(&store.reload(None))
        }
        ConfigAction::Reload { session } => out.flag(&store.reload(session)),
        ConfigAction::Defaults => {
            let seeded = store.load_global_defaults();
            if !seeded.is_ok() {
                return out.flag(&seeded);
            }
            out.flag(&store.reload(None))
        }
    }
}

fn cmd_box(orchestrator: &Orchestrator, out: &Printer, action: BoxAction) -> Result<bool> {
    let store = orchestrator.config();
    match action {
        BoxAction::List => out.print(&orchestrator.list_boxes(), |names| names.join("\n")),
        BoxAction::Create { name } => {
            let created = orchestrator.sandbox(&name).create();
            if !created.is_ok() {
                return out.flag(&created);
            }
            out.flag(&store.reload(None))
        }
        BoxAction::Defaults { name } => {
            let seeded = orchestrator.sandbox(&name).load_defaults();
            if !seeded.is_ok() {
                return out.flag(&seeded);
            }
            out.flag(&store.reload(None))
        }
        BoxAction::Remove { name } => {
            let removed = orchestrator.sandbox(&name).remove();
            if !removed.is_ok() {
                return out.flag(&removed);
            }
            out.flag(&store.reload(None))
        }
        BoxAction::Show { name } => {
            let Some(configuration) = orchestrator.sandbox(&name).configuration() else {
                println!("{name}: no configuration");
                return Ok(false);
            };
            if out.json {
                println!("{}", serde_json::to_string_pretty(&configuration)?);
            } else {
                for (key, values) in &configuration {
                    for value in values {
                        println!("{key}={value}");
                    }
                }
            }
            Ok(true)
        }
        BoxAction::Path { name } => out.print(&orchestrator.sandbox(&name).path(), String::clone),
        BoxAction::Procs { name } => {
            let processes = orchestrator.sandbox(&name).processes();
            if processes.is_ok() && processes.data().is_none() {
                println!("{name}: no processes");
                return Ok(true);
            }
            out.print(&processes, |list| {
                list.iter()
                    .map(|p| format!("{:>6}  {}  (session {})", p.pid, p.image_name, p.session_id))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        BoxAction::Run { name, file } => out.print(&orchestrator.sandbox(&name).run(&file), |pid| {
            format!("started pid {pid}")
        }),
        BoxAction::Kill { name, pid } => {
            let sandbox = orchestrator.sandbox(&name);
            let killed = match pid {
                Some(pid) => sandbox.kill(pid),
                None => sandbox.kill_all(),
            };
            out.flag(&killed)
        }
    }
}

/// Renders outcomes as text or JSON and reports success.
struct Printer {
    json: bool,
}

impl Printer {
    fn print<T, F>(&self, outcome: &Outcome<T>, render: F) -> Result<bool>
    where
        T: Serialize,
        F: FnOnce(&T) -> String,
    {
        if self.json {
            println!("{}", serde_json::to_string_pretty(outcome)?);
            return Ok(outcome.is_ok());
        }
        if outcome.is_ok() {
            match outcome.data() {
                Some(data) => println!("{}", render(data)),
                None => println!("{}", outcome.status()),
            }
        } else {
            eprintln!("error: {}", outcome.status());
            for record in outcome.errors() {
                eprintln!("  - {record}");
            }
        }
        Ok(outcome.is_ok())
    }

    fn flag(&self, outcome: &Outcome<bool>) -> Result<bool> {
        self.print(outcome, |_| outcome.status().to_string())
    }
}
