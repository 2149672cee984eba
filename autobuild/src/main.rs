//! `autobuild`: drive the PLAN → IMPLEMENT → VERIFY pipeline for a project.
//!
//! Every command works against `<root>/.autobuild/`. `run` is the only
//! command that takes the lease; the rest write the state store directly,
//! which is how external start/stop/reset requests reach the engine.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use autobuild::cancel::CancelToken;
use autobuild::chat::run_chat;
use autobuild::core::types::ExecutionState;
use autobuild::engine::{Engine, open_context};
use autobuild::exit_codes;
use autobuild::io::budget::BudgetService;
use autobuild::io::config::load_config;
use autobuild::io::init::{ControlPaths, InitOptions, init_control};
use autobuild::io::lock::LockManager;
use autobuild::io::state_store::StateStore;
use autobuild::logging;
use autobuild::status;

#[derive(Parser)]
#[command(
    name = "autobuild",
    version,
    about = "Autonomous plan/implement/verify engine"
)]
struct Cli {
    /// Project root containing `.autobuild/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Raise log verbosity (-v info, -vv debug). `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.autobuild/` with default config, rules, and intent.
    Init {
        /// Overwrite existing control files.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the engine loop in the foreground.
    Run {
        /// Exit once the state reaches DONE or FAIL.
        #[arg(long)]
        until_terminal: bool,
    },
    /// Write PLAN, restarting a finished or failed run.
    Reset,
    /// Write a state token directly.
    SetState { state: String },
    /// Show state, lease, checkpoint, budget, and open questions.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Discuss the intent; suggestions go to `intent.suggested.md`.
    Chat {
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },
    /// Show token spend, or clear it.
    Budget {
        #[arg(long)]
        reset: bool,
    },
    /// Remove the lease regardless of owner.
    Unlock,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Run { until_terminal } => cmd_run(root, until_terminal),
        Command::Reset => cmd_set_state(root, ExecutionState::Plan),
        Command::SetState { state } => {
            let state: ExecutionState = state.parse()?;
            cmd_set_state(root, state)
        }
        Command::Status { json } => cmd_status(root, json),
        Command::Chat { message } => cmd_chat(root, &message.join(" ")),
        Command::Budget { reset } => cmd_budget(root, reset),
        Command::Unlock => cmd_unlock(root),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_control(root, &InitOptions { force })?;
    println!("initialized {}", paths.control_dir.display());
    println!("edit {} and run `autobuild run`", paths.intent_path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, until_terminal: bool) -> Result<i32> {
    let mut engine = Engine::open(root, CancelToken::new())?;
    let state = engine.run(until_terminal)?;
    println!("state: {state}");
    Ok(match state {
        ExecutionState::Fail => exit_codes::FAILED,
        _ => exit_codes::OK,
    })
}

fn cmd_set_state(root: &Path, state: ExecutionState) -> Result<i32> {
    let paths = ControlPaths::new(root);
    paths.ensure_initialized()?;
    StateStore::new(&paths.state_path).write_external(state)?;
    println!("state: {state}");
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path, json: bool) -> Result<i32> {
    let snapshot = status::collect(root)?;
    if json {
        let text = serde_json::to_string_pretty(&snapshot).context("serialize status")?;
        println!("{text}");
    } else {
        print!("{}", snapshot.render());
    }
    Ok(exit_codes::OK)
}

fn cmd_chat(root: &Path, message: &str) -> Result<i32> {
    let ctx = open_context(root, CancelToken::new())?;
    let outcome = run_chat(&ctx, message)?;
    println!("{}", outcome.response);
    if outcome.suggested_intent_written {
        println!(
            "\nsuggested intent written to {}",
            ctx.paths().suggested_intent_path.display()
        );
    }
    if outcome.questions_added > 0 {
        println!(
            "{} question(s) added to {}",
            outcome.questions_added,
            ctx.paths().questions_path.display()
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_budget(root: &Path, reset: bool) -> Result<i32> {
    let paths = ControlPaths::new(root);
    paths.ensure_initialized()?;
    let config = load_config(&paths.config_path)?;
    let budget = BudgetService::new(&paths.budget_path, config.budget.clone());
    let state = if reset {
        budget.reset_budget()?
    } else {
        budget.load()?
    };
    let used = state.tokens_used;
    println!(
        "tokens: {} of {} (plan {}, code {}, chat {})",
        used.total, config.budget.max_tokens_per_project, used.plan, used.code, used.chat
    );
    println!("cost: ${:.4}", state.cost_by_category.total);
    if budget.is_warning_threshold()? {
        println!("warning: usage is above the configured threshold");
    }
    Ok(exit_codes::OK)
}

fn cmd_unlock(root: &Path) -> Result<i32> {
    let paths = ControlPaths::new(root);
    paths.ensure_initialized()?;
    let config = load_config(&paths.config_path)?;
    let lock = LockManager::new(&paths.lock_path, config.lease_stale());
    if lock.force_clear()? {
        println!("lease cleared");
    } else {
        println!("no lease held");
    }
    Ok(exit_codes::OK)
}
