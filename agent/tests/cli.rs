//! CLI tests for the `agent` binary.
//!
//! Spawns the binary and verifies exit codes for invalid configuration, for
//! a model that never answers, for `--ask` and for `--init`.

use std::fs;
use std::process::Command;

use agent::exit_codes;

fn agent_command(dir: &std::path::Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_agent"));
    cmd.current_dir(dir)
        .env_remove("AGENT_AUTO_ACCEPT")
        .env_remove("AGENT_BLOCK_DANGEROUS")
        .env_remove("AGENT_MAX_STEPS")
        .env_remove("AGENT_MODEL_COMMAND");
    cmd
}

#[test]
fn invalid_config_exits_with_invalid_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("config.toml");
    fs::write(&config, "max_steps = 0\n").expect("write config");

    let output = agent_command(temp.path())
        .arg("--config")
        .arg(&config)
        .args(["--goal", "check disk usage"])
        .output()
        .expect("run agent");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("max_steps must be > 0"));
}

#[test]
fn silent_model_exits_with_stopped_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("config.toml");
    fs::write(
        &config,
        "deep_analysis = false\n\n[model]\ncommand = [\"false\"]\nmax_attempts = 1\nbase_delay_secs = 0\n",
    )
    .expect("write config");
    let plan = temp.path().join("plan.json");

    let output = agent_command(temp.path())
        .arg("--config")
        .arg(&config)
        .args(["--goal", "check disk usage", "--auto-accept", "--plan-file"])
        .arg(&plan)
        .output()
        .expect("run agent");

    assert_eq!(output.status.code(), Some(exit_codes::STOPPED));
    assert!(String::from_utf8_lossy(&output.stdout).contains("the model did not respond"));
    // the default plan is saved before the first model turn
    let saved = agent::io::plan_store::load_plan(&plan).expect("load plan");
    assert_eq!(saved.steps.len(), 4);
}

#[test]
fn ask_mode_prints_the_answer() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("config.toml");
    fs::write(
        &config,
        "[model]\ncommand = [\"sh\", \"-c\", \"cat >/dev/null; echo 'Use df -h.'\"]\nmax_attempts = 1\nbase_delay_secs = 0\n",
    )
    .expect("write config");

    let output = agent_command(temp.path())
        .arg("--config")
        .arg(&config)
        .args(["--ask", "--goal", "how do I check disk usage?"])
        .output()
        .expect("run agent");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "Use df -h.");
}

#[test]
fn init_writes_defaults_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("nested/config.toml");

    let output = agent_command(temp.path())
        .arg("--config")
        .arg(&config)
        .arg("--init")
        .output()
        .expect("run agent");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let written = agent::io::config::load_config(&config).expect("load written config");
    assert_eq!(written, agent::io::config::AgentConfig::default());

    let again = agent_command(temp.path())
        .arg("--config")
        .arg(&config)
        .arg("--init")
        .output()
        .expect("run agent");
    assert_eq!(again.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&again.stderr).contains("already exists"));
}
