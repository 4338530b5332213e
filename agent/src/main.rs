//! Autonomous terminal agent.
//!
//! Runs a language model in a loop against the local shell or, given a
//! `user@host[:port]` target, a remote host over SSH. Every action is shown
//! and confirmed unless `--auto-accept` is set. `--ask` only answers
//! questions, and `--init` writes a default configuration file.

use std::path::{Path, PathBuf};

use agent::ask::{AskSession, chat};
use agent::exit_codes;
use agent::io::config::{AgentConfig, load_config, write_config};
use agent::io::model::{CommandBackend, RetryingModel};
use agent::io::operator::{Operator, TerminalOperator};
use agent::io::shell::{LocalShell, Shell, SshShell, SshTarget, detect_host};
use agent::io::web_search::CommandSearch;
use agent::logging;
use agent::session::Agent;
use anyhow::{Context, Result, bail};
use clap::Parser;

const DEFAULT_CONFIG_PATH: &str = ".agent/config.toml";

#[derive(Parser)]
#[command(
    name = "agent",
    version,
    about = "Autonomous terminal agent driven by a language model"
)]
struct Cli {
    /// Remote target as `user@host[:port]`; omit to work on this machine.
    target: Option<SshTarget>,

    /// Path to the TOML configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Goal to work on; read interactively when omitted.
    #[arg(long)]
    goal: Option<String>,

    /// Run every action without asking (disables ask_user).
    #[arg(long)]
    auto_accept: bool,

    /// Upper bound on model turns per instruction.
    #[arg(long)]
    max_steps: Option<u32>,

    /// Save the plan to this file after every change; a saved plan for the
    /// same goal is resumed.
    #[arg(long)]
    plan_file: Option<PathBuf>,

    /// Answer questions without running anything. `--goal` asks a single
    /// question; otherwise questions are read interactively.
    #[arg(long, conflicts_with_all = ["auto_accept", "plan_file", "init"])]
    ask: bool,

    /// Write the default configuration to `--config` and exit.
    #[arg(long)]
    init: bool,
}

fn main() {
    logging::init();
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
    if cli.init {
        return init_config(&cli.config);
    }
    let mut cfg = load_config(&cli.config)?;
    if cli.auto_accept {
        cfg.auto_accept = true;
    }
    if let Some(max_steps) = cli.max_steps {
        cfg.max_steps = max_steps;
    }
    if let Some(plan_file) = cli.plan_file {
        cfg.plan_path = Some(plan_file);
    }
    cfg.validate().context("invalid configuration")?;

    let operator = TerminalOperator::default();
    if cli.ask {
        let target = cli
            .target
            .map_or_else(|| "the local machine".to_string(), |target| target.to_string());
        return run_ask(&cfg, &operator, &target, cli.goal.as_deref());
    }
    let goal = match cli.goal {
        Some(goal) => goal,
        None => operator.read_goal()?,
    };
    if goal.trim().is_empty() {
        bail!("no goal given");
    }

    match cli.target {
        Some(target) => {
            let shell = SshShell::new(target, cfg.output_limit_bytes);
            run_session(&cfg, &shell, &operator, goal.trim())
        }
        None => {
            let shell = LocalShell::new(cfg.output_limit_bytes);
            run_session(&cfg, &shell, &operator, goal.trim())
        }
    }
}

fn run_session<S: Shell>(
    cfg: &AgentConfig,
    shell: &S,
    operator: &TerminalOperator,
    goal: &str,
) -> Result<i32> {
    let backend = CommandBackend::new(
        cfg.model.command.clone(),
        cfg.model.timeout(),
        cfg.model.output_limit_bytes,
    );
    let model = RetryingModel::new(backend.clone(), cfg.model.max_attempts, cfg.model.base_delay());
    let summary_model = RetryingModel::new(
        backend,
        cfg.model.summary_max_attempts,
        cfg.model.base_delay(),
    );

    let search = cfg.web_search.is_enabled().then(|| {
        CommandSearch::new(
            cfg.web_search.command.clone(),
            cfg.web_search.timeout(),
            cfg.web_search.output_limit_bytes,
        )
    });

    operator.status(&format!("Target: {}", shell.describe()));
    let host = detect_host(shell);
    let mut agent = Agent::new(cfg, &model, shell, operator)
        .with_summary_model(&summary_model)
        .with_host_facts(host);
    if let Some(search) = &search {
        agent = agent.with_web_search(search);
    }
    let outcome = agent.run(goal);

    println!("{}", outcome.summary);
    Ok(exit_codes::for_stop(&outcome.stop))
}

fn run_ask(
    cfg: &AgentConfig,
    operator: &TerminalOperator,
    target: &str,
    question: Option<&str>,
) -> Result<i32> {
    let backend = CommandBackend::new(
        cfg.model.command.clone(),
        cfg.model.timeout(),
        cfg.model.output_limit_bytes,
    );
    let model = RetryingModel::new(backend, cfg.model.max_attempts, cfg.model.base_delay());
    let mut session = AskSession::new(&model, cfg.context_limits(), target);

    let Some(question) = question else {
        chat(&mut session, operator)?;
        return Ok(exit_codes::OK);
    };
    match session.answer(question) {
        Some(answer) => {
            println!("{answer}");
            Ok(exit_codes::OK)
        }
        None => {
            println!("Stopped: the model did not respond.");
            Ok(exit_codes::STOPPED)
        }
    }
}

fn init_config(path: &Path) -> Result<i32> {
    if path.exists() {
        bail!("{} already exists; remove it first to write the defaults", path.display());
    }
    write_config(path, &AgentConfig::default())?;
    println!("Wrote the default configuration to {}", path.display());
    Ok(exit_codes::OK)
}
