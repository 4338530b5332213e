//! End-to-end control loop scenarios driven through scripted doubles.

use agent::core::types::{Role, StepStatus, StopReason};
use agent::io::config::AgentConfig;
use agent::session::Agent;
use agent::test_support::{ScriptedModel, ScriptedOperator, ScriptedShell};
use serde_json::{Value, json};

fn autonomous() -> AgentConfig {
    AgentConfig {
        auto_accept: true,
        deep_analysis: false,
        ..AgentConfig::default()
    }
}

fn assistant_turns<M, S, O>(agent: &Agent<'_, M, S, O>) -> Vec<String>
where
    M: agent::io::model::Model,
    S: agent::io::shell::Shell,
    O: agent::io::operator::Operator,
{
    agent
        .context()
        .transcript()
        .iter()
        .filter(|turn| turn.role == Role::Assistant)
        .map(|turn| turn.content.clone())
        .collect()
}

#[test]
fn bash_action_runs_and_completes_the_matching_step() {
    let cfg = autonomous();
    let model = ScriptedModel::default()
        .with_plan(r#"{"steps": [{"description": "List /tmp", "command": "ls /tmp"}]}"#)
        .with_reply(r#"{"tool":"bash","command":"ls /tmp","explain":"list"}"#)
        .with_reply(r#"{"tool":"finish","summary":"listed /tmp","goal_success":true}"#);
    let shell = ScriptedShell::default().with_output("file1\nfile2", 0);
    let operator = ScriptedOperator::default();
    let mut agent = Agent::new(&cfg, &model, &shell, &operator);

    let outcome = agent.run("list files in /tmp");

    assert_eq!(outcome.stop, StopReason::Finished);
    assert_eq!(shell.commands(), vec!["ls /tmp"]);
    let feedback = &agent.context().transcript()[3];
    assert_eq!(feedback.role, Role::User);
    assert!(feedback.content.starts_with("Command 'ls /tmp' executed with exit code 0:\nfile1\nfile2"));
    assert!(feedback.content.contains("Plan step 1 marked completed."));
    assert_eq!(agent.plan().steps[0].status, StepStatus::Completed);
    assert!(operator.statuses().contains(&"[bash] list".to_string()));
}

#[test]
fn destructive_command_is_rejected_before_execution() {
    let cfg = autonomous();
    let model = ScriptedModel::default()
        .with_plan(r#"{"steps": [{"description": "clean up"}]}"#)
        .with_reply(r#"{"tool":"bash","command":"rm -rf /"}"#)
        .with_silence();
    let shell = ScriptedShell::default();
    let operator = ScriptedOperator::default();
    let mut agent = Agent::new(&cfg, &model, &shell, &operator);

    let outcome = agent.run("free some disk space");

    assert_eq!(outcome.stop, StopReason::NoResponse);
    assert!(shell.commands().is_empty());
    assert!(
        agent
            .context()
            .transcript()
            .iter()
            .any(|turn| turn.role == Role::User
                && turn.content.contains("rejected by the safety validator"))
    );
}

#[test]
fn prose_reply_is_corrected_and_only_the_json_is_stored() {
    let cfg = autonomous();
    let model = ScriptedModel::default()
        .with_plan(r#"{"steps": [{"description": "list", "command": "ls -la"}]}"#)
        .with_reply(" I think ls -la is good")
        .with_reply(r#"{"tool":"bash","command":"ls -la"}"#)
        .with_silence();
    let shell = ScriptedShell::default();
    let operator = ScriptedOperator::default();
    let mut agent = Agent::new(&cfg, &model, &shell, &operator);

    agent.run("list the current directory");

    assert_eq!(shell.commands(), vec!["ls -la"]);
    let stored = assistant_turns(&agent);
    assert_eq!(stored.len(), 1);
    let value: Value = serde_json::from_str(&stored[0]).expect("stored turn is JSON");
    assert_eq!(value, json!({"tool": "bash", "command": "ls -la"}));
    assert!(
        agent
            .context()
            .transcript()
            .iter()
            .all(|turn| !turn.content.contains("I think"))
    );

    let calls = model.agent_calls();
    let correction = &calls[1].user;
    assert!(correction.contains("assistant:  I think ls -la is good"));
    assert!(correction.contains("could not be parsed as JSON"));
}

#[test]
fn finish_with_open_steps_is_refused() {
    let cfg = autonomous();
    let model = ScriptedModel::default()
        .with_plan(r#"{"steps": [{"description": "configure the service"}]}"#)
        .with_reply(r#"{"tool":"finish","summary":"done"}"#)
        .with_silence();
    let shell = ScriptedShell::default();
    let operator = ScriptedOperator::default();
    let mut agent = Agent::new(&cfg, &model, &shell, &operator);

    let outcome = agent.run("configure the service");

    assert_ne!(outcome.stop, StopReason::Finished);
    let last = agent.context().transcript().last().expect("turns");
    assert_eq!(last.role, Role::User);
    assert!(last.content.contains("1 plan step(s) still pending or in progress"));
    assert!(last.content.contains("update_plan_step"));
}

#[test]
fn one_failed_correction_continues_the_loop() {
    let cfg = AgentConfig {
        json_correction_attempts: 1,
        ..autonomous()
    };
    let model = ScriptedModel::default()
        .with_plan(r#"{"steps": [{"description": "check"}]}"#)
        .with_reply("sure, let me check")
        .with_reply("still thinking")
        .with_reply(r#"{"tool":"update_plan_step","step":1,"status":"skipped","result":"nothing to check"}"#)
        .with_reply(r#"{"tool":"finish","summary":"nothing to do"}"#);
    let shell = ScriptedShell::default();
    let operator = ScriptedOperator::default();
    let mut agent = Agent::new(&cfg, &model, &shell, &operator);

    let outcome = agent.run("check things");

    assert_eq!(outcome.stop, StopReason::Finished);
    assert_eq!(outcome.steps_taken, 3);
    assert!(
        agent
            .context()
            .transcript()
            .iter()
            .any(|turn| turn.content.contains("not valid JSON even after 1 correction request(s)"))
    );
    assert_eq!(assistant_turns(&agent).len(), 2);
}

#[test]
fn repeated_parse_failures_stop_the_session() {
    let cfg = AgentConfig {
        json_correction_attempts: 1,
        ..autonomous()
    };
    let mut model = ScriptedModel::default().with_plan(r#"{"steps": [{"description": "x"}]}"#);
    for _ in 0..6 {
        model = model.with_reply("no json here");
    }
    let shell = ScriptedShell::default();
    let operator = ScriptedOperator::default();
    let mut agent = Agent::new(&cfg, &model, &shell, &operator);

    let outcome = agent.run("anything");

    assert_eq!(outcome.stop, StopReason::ParseFailure);
    assert_eq!(outcome.steps_taken, 3);
    assert!(assistant_turns(&agent).is_empty());
}

#[test]
fn remote_connection_failure_stops_the_session() {
    let cfg = autonomous();
    let model = ScriptedModel::default()
        .with_plan(r#"{"steps": [{"description": "check uptime", "command": "uptime"}]}"#)
        .with_reply(r#"{"tool":"bash","command":"uptime"}"#);
    let shell = ScriptedShell::remote()
        .with_output("ssh: connect to host web1 port 22: Connection refused", 255);
    let operator = ScriptedOperator::default();
    let mut agent = Agent::new(&cfg, &model, &shell, &operator);

    let outcome = agent.run("check uptime");

    match &outcome.stop {
        StopReason::ConnectionLost { detail } => assert!(detail.contains("Connection refused")),
        other => panic!("unexpected stop: {other:?}"),
    }
    assert_eq!(agent::exit_codes::for_stop(&outcome.stop), agent::exit_codes::CONNECTION);
    assert!(outcome.summary.contains("SSH connection failed"));
}

#[test]
fn declined_action_without_reason_cancels_the_run() {
    let cfg = AgentConfig {
        deep_analysis: false,
        ..AgentConfig::default()
    };
    let model = ScriptedModel::default()
        .with_plan(r#"{"steps": [{"description": "upgrade"}]}"#)
        .with_reply(r#"{"tool":"bash","command":"apt-get upgrade -y"}"#);
    let shell = ScriptedShell::default();
    let operator = ScriptedOperator::default().with_confirmation(
        agent::io::operator::Confirmation::Declined {
            justification: None,
        },
    );
    let mut agent = Agent::new(&cfg, &model, &shell, &operator);

    let outcome = agent.run("upgrade packages");

    assert_eq!(outcome.stop, StopReason::UserCancelled);
    assert!(shell.commands().is_empty());
}
