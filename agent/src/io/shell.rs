//! Command execution on the local machine or a remote host over SSH.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};
use crate::io::prompt::HostFacts;

/// Printed after every remote command so its exit code survives the SSH hop.
const EXIT_SENTINEL: &str = "__AGENT_EXIT_CODE__:";
const SSH_CONNECT_TIMEOUT_SECS: u64 = 15;
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Phrases ssh prints when the connection itself (not the command) failed.
const CONNECTION_FAILURE_PHRASES: &[&str] = &[
    "connection refused",
    "connection timed out",
    "connection reset",
    "connection closed by",
    "no route to host",
    "could not resolve hostname",
    "network is unreachable",
    "host is down",
    "broken pipe",
    "permission denied (publickey",
    "host key verification failed",
];

/// Result of one shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    /// stdout and stderr combined.
    pub output: String,
    /// Exit code; -1 when the process was killed.
    pub exit_code: i32,
    pub timed_out: bool,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Where commands run.
pub trait Shell {
    fn exec(&self, command: &str, timeout: Duration) -> Result<ShellOutput>;

    /// True when commands run on another host.
    fn is_remote(&self) -> bool {
        false
    }

    /// Short label for logs and prompts (`local`, `root@web1:22`).
    fn describe(&self) -> String;

    /// Copies a local file to `remote_path` on the target host.
    fn upload(&self, _local: &Path, _remote_path: &str) -> Result<()> {
        bail!("{} does not support file upload", self.describe())
    }

    /// Copies `remote_path` on the target host to a local file.
    fn download(&self, _remote_path: &str, _local: &Path) -> Result<()> {
        bail!("{} does not support file download", self.describe())
    }
}

/// Runs commands through `sh -c` on this machine.
#[derive(Debug, Clone)]
pub struct LocalShell {
    output_limit_bytes: usize,
    workdir: Option<PathBuf>,
}

impl LocalShell {
    pub fn new(output_limit_bytes: usize) -> Self {
        Self {
            output_limit_bytes,
            workdir: None,
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

impl Shell for LocalShell {
    #[instrument(skip_all, fields(shell = "local"))]
    fn exec(&self, command: &str, timeout: Duration) -> Result<ShellOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        debug!(command, "running local command");
        let output = run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)
            .with_context(|| format!("run local command `{command}`"))?;
        Ok(ShellOutput {
            output: output.combined_lossy(),
            exit_code: output.exit_code(),
            timed_out: output.timed_out,
        })
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}

/// `user@host[:port]` target of an SSH session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SshTarget {
    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.destination())?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

impl FromStr for SshTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (user, rest) = match s.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => bail!("invalid SSH target '{s}': empty user"),
            None => (None, s),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .with_context(|| format!("invalid SSH port in '{s}'"))?;
                (host, Some(port))
            }
            None => (rest, None),
        };
        if host.is_empty() {
            return Err(anyhow!("invalid SSH target '{s}': empty host"));
        }
        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }
}

/// Runs commands on a remote host with the system `ssh` client.
///
/// Authentication is delegated to ssh (agent, keys, config) in batch mode; a
/// host that needs an interactive password fails fast instead of hanging.
#[derive(Debug, Clone)]
pub struct SshShell {
    target: SshTarget,
    output_limit_bytes: usize,
}

impl SshShell {
    pub fn new(target: SshTarget, output_limit_bytes: usize) -> Self {
        Self {
            target,
            output_limit_bytes,
        }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    fn ssh_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(common_ssh_options());
        if let Some(port) = self.target.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(self.target.destination());
        cmd
    }

    fn scp_command(&self) -> Command {
        let mut cmd = Command::new("scp");
        cmd.args(common_ssh_options());
        if let Some(port) = self.target.port {
            cmd.arg("-P").arg(port.to_string());
        }
        cmd
    }

    fn run_transfer(&self, cmd: Command, what: &str) -> Result<()> {
        let output = run_command_with_timeout(cmd, None, TRANSFER_TIMEOUT, self.output_limit_bytes)
            .with_context(|| format!("run scp for {what}"))?;
        if !output.status.success() {
            bail!(
                "scp {what} failed with exit code {}: {}",
                output.exit_code(),
                output.combined_lossy().trim()
            );
        }
        Ok(())
    }
}

fn common_ssh_options() -> [String; 6] {
    [
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}"),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
    ]
}

impl Shell for SshShell {
    #[instrument(skip_all, fields(shell = "ssh", target = %self.target))]
    fn exec(&self, command: &str, timeout: Duration) -> Result<ShellOutput> {
        let mut cmd = self.ssh_command();
        cmd.arg(remote_script(command));
        debug!(command, "running remote command");
        let output = run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)
            .with_context(|| format!("run remote command `{command}` on {}", self.target))?;
        Ok(remote_output(&output))
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        self.target.to_string()
    }

    fn upload(&self, local: &Path, remote_path: &str) -> Result<()> {
        let mut cmd = self.scp_command();
        cmd.arg(local)
            .arg(format!("{}:{}", self.target.destination(), remote_path));
        self.run_transfer(cmd, &format!("upload to {remote_path}"))
    }

    fn download(&self, remote_path: &str, local: &Path) -> Result<()> {
        let mut cmd = self.scp_command();
        cmd.arg(format!("{}:{}", self.target.destination(), remote_path))
            .arg(local);
        self.run_transfer(cmd, &format!("download of {remote_path}"))
    }
}

/// `command` followed by a line reporting its exit status on stdout.
fn remote_script(command: &str) -> String {
    format!("{command}\necho \"{EXIT_SENTINEL}$?\"")
}

/// Shell result of an ssh run of [`remote_script`]. The sentinel is the last
/// stdout line, so it survives truncation in the kept tail.
fn remote_output(output: &CommandOutput) -> ShellOutput {
    let (stdout, sentinel_code) = strip_exit_sentinel(&output.stdout_lossy());
    // Without the sentinel the remote shell never finished; fall back to
    // ssh's own exit code (255 for connection failures).
    let exit_code = match sentinel_code {
        Some(code) => code,
        None => {
            if !output.timed_out {
                warn!(exit_code = output.exit_code(), "remote exit sentinel missing");
            }
            output.exit_code()
        }
    };
    let mut text = stdout;
    if !output.stderr.is_empty() || output.stderr.omitted > 0 {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&output.stderr_lossy());
    }
    ShellOutput {
        output: text,
        exit_code,
        timed_out: output.timed_out,
    }
}

/// Removes the exit sentinel line and returns the remaining text with the
/// exit code it carried.
pub fn strip_exit_sentinel(text: &str) -> (String, Option<i32>) {
    let Some(idx) = text.rfind(EXIT_SENTINEL) else {
        return (text.to_string(), None);
    };
    let after = &text[idx + EXIT_SENTINEL.len()..];
    let code_text: String = after
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    let code = code_text.parse().ok();
    let rest_start = idx + EXIT_SENTINEL.len() + code_text.len();
    let rest = text[rest_start..].strip_prefix('\n').unwrap_or(&text[rest_start..]);
    let mut cleaned = text[..idx].to_string();
    cleaned.push_str(rest);
    (cleaned, code)
}

/// True when `output` carries one of ssh's connection-failure messages.
pub fn is_connection_failure(output: &str) -> bool {
    let lower = output.to_lowercase();
    CONNECTION_FAILURE_PHRASES
        .iter()
        .any(|phrase| lower.contains(phrase))
}

/// Quotes `value` for safe interpolation into a POSIX shell command.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

const DETECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Collects the distribution name and login user of the target host for the
/// system prompt. Failed lookups leave the fact unknown.
#[instrument(skip_all, fields(target = %shell.describe()))]
pub fn detect_host<S: Shell + ?Sized>(shell: &S) -> HostFacts {
    let distro = host_fact(shell, "cat /etc/os-release").and_then(|text| pretty_name(&text));
    let user = host_fact(shell, "whoami")
        .map(|text| text.trim().to_string())
        .filter(|user| !user.is_empty() && !user.contains(char::is_whitespace));
    debug!(?distro, ?user, "host detected");
    HostFacts { distro, user }
}

fn host_fact<S: Shell + ?Sized>(shell: &S, command: &str) -> Option<String> {
    match shell.exec(command, DETECT_TIMEOUT) {
        Ok(output) if output.success() => Some(output.output),
        Ok(output) => {
            debug!(command, exit_code = output.exit_code, "host lookup failed");
            None
        }
        Err(err) => {
            warn!(command, err = %format!("{err:#}"), "host lookup failed");
            None
        }
    }
}

/// `PRETTY_NAME` from an os-release file.
fn pretty_name(os_release: &str) -> Option<String> {
    os_release
        .lines()
        .find_map(|line| line.trim().strip_prefix("PRETTY_NAME="))
        .map(|value| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ssh_targets() {
        let target: SshTarget = "root@web1:2222".parse().expect("parse");
        assert_eq!(target.user.as_deref(), Some("root"));
        assert_eq!(target.host, "web1");
        assert_eq!(target.port, Some(2222));
        assert_eq!(target.to_string(), "root@web1:2222");

        let bare: SshTarget = "db.internal".parse().expect("parse");
        assert_eq!(bare.user, None);
        assert_eq!(bare.port, None);

        assert!("@host".parse::<SshTarget>().is_err());
        assert!("user@".parse::<SshTarget>().is_err());
        assert!("user@host:http".parse::<SshTarget>().is_err());
    }

    #[test]
    fn strips_the_exit_sentinel() {
        let (text, code) = strip_exit_sentinel("hello\n__AGENT_EXIT_CODE__:3\n");
        assert_eq!(text, "hello\n");
        assert_eq!(code, Some(3));

        let (text, code) = strip_exit_sentinel("ssh: connect to host x port 22: Connection refused\n");
        assert_eq!(code, None);
        assert!(text.contains("Connection refused"));
    }

    fn run_remote_script_locally(command: &str, limit: usize) -> ShellOutput {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(remote_script(command));
        let output =
            run_command_with_timeout(cmd, None, Duration::from_secs(10), limit).expect("run");
        remote_output(&output)
    }

    #[test]
    fn remote_exit_code_survives_truncated_output() {
        let out = run_remote_script_locally("head -c 5000 /dev/zero | tr '\\0' x; false", 1000);
        assert_eq!(out.exit_code, 1);
        assert!(!out.success());
        assert!(out.output.contains("[stdout truncated"));
        assert!(!out.output.contains(EXIT_SENTINEL));
    }

    #[test]
    fn remote_output_keeps_stderr_after_stdout() {
        let out = run_remote_script_locally("echo done; echo warning >&2", 4096);
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.output, "done\nwarning\n");
    }

    #[test]
    fn recognizes_connection_failures() {
        assert!(is_connection_failure(
            "ssh: connect to host 10.0.0.5 port 22: No route to host"
        ));
        assert!(is_connection_failure("Connection closed by 10.0.0.5 port 22"));
        assert!(!is_connection_failure("grep: pattern not found"));
    }

    #[test]
    fn detects_distribution_and_user() {
        use crate::test_support::ScriptedShell;

        let shell = ScriptedShell::default()
            .with_output("NAME=\"Ubuntu\"\nPRETTY_NAME=\"Ubuntu 24.04 LTS\"\n", 0)
            .with_output("deploy\n", 0);
        let facts = detect_host(&shell);
        assert_eq!(facts.distro.as_deref(), Some("Ubuntu 24.04 LTS"));
        assert_eq!(facts.user.as_deref(), Some("deploy"));
        assert_eq!(shell.commands(), vec!["cat /etc/os-release", "whoami"]);

        let failing = ScriptedShell::default()
            .with_output("cat: /etc/os-release: No such file", 1)
            .with_output("", 0);
        assert_eq!(detect_host(&failing), HostFacts::default());
    }

    #[test]
    fn quotes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
    }

    #[test]
    fn local_shell_runs_commands() {
        let temp = tempfile::tempdir().expect("tempdir");
        let shell = LocalShell::new(4096).with_workdir(temp.path());
        let out = shell
            .exec("echo hi && exit 4", Duration::from_secs(10))
            .expect("exec");
        assert_eq!(out.output, "hi\n");
        assert_eq!(out.exit_code, 4);
        assert!(!out.success());
        assert!(!shell.is_remote());
        assert!(shell.upload(temp.path(), "/tmp/x").is_err());
    }
}
