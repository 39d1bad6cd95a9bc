use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use baton::alert::{AlertAction, AlertCondition, RuleSet};
use baton::config::Config;
use baton::core::{validate, Plan};
use baton::state::SnapshotStore;
use baton::{Error, Result};

/// baton - plan execution orchestrator for agent task graphs
#[derive(Parser, Debug)]
#[command(name = "baton")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    BATON_DEBUG=1   Enable debug logging (alternative to --debug)\n    BATON_LOG       tracing filter directive, e.g. baton=trace")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.baton/baton.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Validate a plan document (.json or .toml)
    Validate { plan: PathBuf },

    /// Print the parallel execution layers of a plan
    Layers { plan: PathBuf },

    /// Alert policy tools
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },

    /// Configuration file tools
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// List saved plan snapshots, or show one
    Snapshots {
        plan_id: Option<String>,

        /// Snapshot directory (defaults to persist_dir from the config)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum PolicyCommand {
    /// Load and merge policy files in order, then print the effective rules
    Check {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ConfigCommand {
    /// Write the default configuration to ~/.baton/baton.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    baton::log::init_with_debug(cli.debug);

    let result = match cli.command {
        Command::Validate { plan } => run_validate(&plan),
        Command::Layers { plan } => run_layers(&plan),
        Command::Policy {
            command: PolicyCommand::Check { files },
        } => run_policy_check(&files),
        Command::Config { command } => run_config(command),
        Command::Snapshots { plan_id, dir } => run_snapshots(plan_id, dir),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_validate(path: &Path) -> Result<()> {
    let plan = Plan::load(path)?;
    let validated = validate(plan)?;
    println!(
        "Plan {} is valid: {} tasks, {} dependencies, {} layers",
        validated.plan_id(),
        validated.task_count(),
        validated.dependency_count(),
        validated.layers().len()
    );
    Ok(())
}

fn run_layers(path: &Path) -> Result<()> {
    let validated = validate(Plan::load(path)?)?;
    for (i, layer) in validated.layers().iter().enumerate() {
        let names: Vec<&str> = layer.iter().map(|t| t.as_str()).collect();
        println!("{:>3}: {}", i, names.join(", "));
    }
    Ok(())
}

fn describe_condition(condition: &AlertCondition) -> String {
    serde_json::to_string(condition).unwrap_or_else(|_| "?".to_string())
}

fn describe_action(action: &AlertAction) -> String {
    match action {
        AlertAction::Log { level, .. } => format!("log ({})", level.as_str()),
        AlertAction::Webhook { url, .. } => format!("webhook {}", url),
    }
}

fn run_policy_check(files: &[PathBuf]) -> Result<()> {
    let rules = RuleSet::load_files(files)?;
    println!("{} effective rules from {} files", rules.len(), files.len());
    for rule in rules.rules() {
        let state = if rule.enabled { "on " } else { "off" };
        println!(
            "  [{}] {:<24} {}  ->  {}",
            state,
            rule.name,
            describe_condition(&rule.condition),
            describe_action(&rule.action)
        );
    }
    Ok(())
}

fn run_config(command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Init { force } => {
            let path = Config::config_path()?;
            if path.exists() && !force {
                return Err(Error::Config(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                )));
            }
            Config::default().save()?;
            println!("Wrote {}", path.display());
        }
        ConfigCommand::Show => {
            print!("{}", toml::to_string_pretty(&Config::load()?)?);
        }
    }
    Ok(())
}

fn run_snapshots(plan_id: Option<String>, dir: Option<PathBuf>) -> Result<()> {
    let dir = match dir {
        Some(dir) => dir,
        None => Config::load()?
            .persist_path()
            .ok_or_else(|| Error::Config("persist_dir is not configured".to_string()))?,
    };
    let store = SnapshotStore::new(dir);

    let Some(plan_id) = plan_id else {
        for id in store.list()? {
            println!("{}", id);
        }
        return Ok(());
    };

    let snapshot = store
        .load(&plan_id)?
        .ok_or_else(|| Error::PlanNotFound(plan_id.clone()))?;
    println!("Plan:   {}", snapshot.plan_id);
    println!("Status: {}", snapshot.status);
    println!("Saved:  {}", snapshot.saved_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    for task in &snapshot.tasks {
        println!(
            "  {:<20} {:<18} agent={} attempts={} retries={}",
            task.task_id.as_str(),
            task.state.status.to_string(),
            task.state.current_agent,
            task.state.attempts.len(),
            task.state.retry_count
        );
        if let Some(reason) = &task.state.skip_reason {
            println!("  {:<20} skipped: {}", "", reason);
        }
        if let Some(err) = &task.state.last_error {
            println!("  {:<20} last error: {}", "", err);
        }
    }
    Ok(())
}
