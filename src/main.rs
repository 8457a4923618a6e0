//! kubepipe CLI - inventory checks and ad-hoc commands over the pipeline engine

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;

use kubepipe::{
    CommandAction, DefaultConnector, EngineConfig, FixSuggestion, Inventory, PipeError,
    ResultStatus, Runtime, Serial, Task,
};

/// Host cache key the exec command stores stdout under
const STDOUT_KEY: &str = "exec.stdout";

#[derive(Parser)]
#[command(name = "kubepipe")]
#[command(about = "kubepipe - pipeline engine for Kubernetes cluster lifecycle")]
#[command(version)]
struct Cli {
    /// Engine config file (YAML); KUBEPIPE_* env vars override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load an inventory, group roles and print them
    Check {
        /// Path to inventory YAML
        inventory: PathBuf,
    },

    /// Run a shell command on every host of a role
    Exec {
        /// Path to inventory YAML
        inventory: PathBuf,

        /// Role whose hosts run the command
        #[arg(short, long)]
        role: String,

        /// Run hosts concurrently (bounded by the engine concurrency)
        #[arg(short, long)]
        parallel: bool,

        /// Rolling batch size: N hosts or N%
        #[arg(short, long)]
        serial: Option<Serial>,

        /// Run the command through sudo
        #[arg(long)]
        sudo: bool,

        /// Work directory for logs and per-host files
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Command to run
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries command results
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Check { inventory } => check_inventory(&inventory),
        Commands::Exec {
            inventory,
            role,
            parallel,
            serial,
            sudo,
            work_dir,
            command,
        } => {
            exec_command(
                cli.config,
                work_dir,
                &inventory,
                &role,
                parallel,
                serial,
                sudo,
                &command.join(" "),
            )
            .await
        }
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

fn load_config(path: Option<PathBuf>) -> Result<EngineConfig, PipeError> {
    let config = match path {
        Some(p) => EngineConfig::load(p)?,
        None => EngineConfig::default(),
    };
    config.with_env()
}

fn check_inventory(path: &PathBuf) -> Result<(), PipeError> {
    let inventory = Inventory::load(path)?;

    let mut roles: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for host in inventory.hosts() {
        for role in host.roles() {
            roles.entry(role).or_default().push(host.name());
        }
    }

    println!("{} Inventory '{}' is valid", "✓".green(), path.display());
    println!("  Hosts: {}", inventory.hosts().len());
    println!("  Etcd: {:?}", inventory.etcd_type());
    for (role, hosts) in roles {
        println!("  {} {}", format!("{}:", role).cyan(), hosts.join(", "));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn exec_command(
    config: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    inventory_path: &PathBuf,
    role: &str,
    parallel: bool,
    serial: Option<Serial>,
    sudo: bool,
    command: &str,
) -> Result<(), PipeError> {
    let mut config = load_config(config)?;
    if let Some(dir) = work_dir {
        config.work_dir = dir;
    }
    let inventory = Inventory::load(inventory_path)?;

    let runtime = Runtime::builder("exec")
        .inventory(inventory)
        .connector(Arc::new(DefaultConnector::new(config.ssh.clone())))
        .work_dir(config.work_dir.clone())
        .build()?;

    let hosts = runtime.hosts_by_role(role);
    if hosts.is_empty() {
        return Err(PipeError::EmptyRole {
            role: role.to_string(),
        });
    }

    let mut action = CommandAction::new(command).save_as(STDOUT_KEY);
    if sudo {
        action = action.sudo();
    }

    let task_name = format!("exec on {}", role);
    let mut task = Task::remote(task_name.clone(), action)
        .hosts(hosts)
        .parallel(parallel)
        .with_config(&config)
        .ignore_error(true);
    if let Some(serial) = serial {
        task = task.serial(serial);
    }

    let outcome = task.execute(&runtime).await;
    runtime.close().await;
    let result = outcome?;

    for ending in result.results() {
        let host = ending.host.as_str();
        match ending.status {
            ResultStatus::Success => {
                println!("{} {}", "[✓]".green(), host.bold());
                let out = runtime
                    .host(host)
                    .and_then(|h| h.cache().get_must_string(STDOUT_KEY));
                for line in out.iter().flat_map(|o| o.lines()) {
                    println!("    {}", line);
                }
            }
            ResultStatus::Failed => {
                println!("{} {}", "[✗]".red(), host.bold());
                if let Some(err) = &ending.error {
                    println!("    {} {}", "Error:".red(), err);
                }
            }
            ResultStatus::Skipped | ResultStatus::Pending => {
                println!("{} {} ({})", "[-]".dimmed(), host.bold(), ending.status)
            }
        }
    }

    match result.combined_error(&task_name) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
