//! Arena operator CLI.
//!
//! Bootstraps and checks `arena.toml`, and dry-runs an agent script against a
//! single JSON state snapshot under the configured sandbox limits.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use arena::exit_codes;
use arena::io::config::{ArenaConfig, DEFAULT_CONFIG_PATH, load_config, write_config};
use arena::sandbox::{SandboxLimits, SandboxRuntime};
use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(
    name = "arena",
    version,
    about = "Sandboxed maze arena: config and agent dry-runs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config file if missing.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Load the config file and check its limits.
    Validate {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Run one agent decision against a JSON state snapshot.
    Invoke {
        /// Agent script (rhai).
        #[arg(long)]
        agent: PathBuf,
        /// JSON state snapshot handed to the agent.
        #[arg(long)]
        state: PathBuf,
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

fn main() {
    arena::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force, config } => cmd_init(&config, force),
        Command::Validate { config } => cmd_validate(&config),
        Command::Invoke {
            agent,
            state,
            config,
        } => cmd_invoke(&agent, &state, &config),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if !force && path.exists() {
        return Ok(exit_codes::OK);
    }
    write_config(path, &ArenaConfig::default())?;
    Ok(exit_codes::OK)
}

fn cmd_validate(path: &Path) -> Result<i32> {
    if !path.exists() {
        bail!("config not found: {}", path.display());
    }
    load_config(path)?;
    Ok(exit_codes::OK)
}

fn cmd_invoke(agent: &Path, state: &Path, config: &Path) -> Result<i32> {
    let cfg = load_config(config)?;
    let code = fs::read_to_string(agent).with_context(|| format!("read {}", agent.display()))?;
    let snapshot = read_state(state)?;

    let runtime = SandboxRuntime::new(SandboxLimits::from(&cfg.sandbox))?;
    runtime.load(&code, &agent_name(agent))?;
    let action = runtime.invoke_blocking(&snapshot);
    runtime.dispose();

    println!("{}", serde_json::to_string(&action).context("serialize action")?);
    Ok(match action {
        Some(_) => exit_codes::OK,
        None => exit_codes::NO_ACTION,
    })
}

fn read_state(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

/// Agent name shown in logs: the script's file stem.
fn agent_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "agent".to_string())
}
