//! Child process execution with timeouts and bounded output.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long readers may take to drain the pipes once the process group is
/// gone.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Share of the output limit reserved for the newest bytes of a stream.
const TAIL_DIVISOR: usize = 4;
/// Tail kept even under small limits, so trailing status lines survive.
const MIN_TAIL_BYTES: usize = 128;

type StreamResult = Result<CapturedStream>;

/// Bytes kept from one output stream: the oldest bytes, the newest bytes,
/// and how many were dropped in between.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStream {
    pub head: Vec<u8>,
    pub tail: Vec<u8>,
    pub omitted: usize,
}

impl CapturedStream {
    pub fn is_empty(&self) -> bool {
        self.head.is_empty() && self.tail.is_empty()
    }

    /// Head and tail joined by a truncation notice naming `stream`.
    pub fn to_lossy(&self, stream: &str) -> String {
        let mut text = String::from_utf8_lossy(&self.head).into_owned();
        if self.omitted > 0 {
            text.push_str(&format!("\n[{stream} truncated {} bytes]\n", self.omitted));
        }
        text.push_str(&String::from_utf8_lossy(&self.tail));
        text
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exit code, or -1 when the process was killed by a signal.
    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    pub fn stdout_lossy(&self) -> String {
        self.stdout.to_lossy("stdout")
    }

    pub fn stderr_lossy(&self) -> String {
        self.stderr.to_lossy("stderr")
    }

    /// stdout followed by stderr, with truncation notices, as one string.
    pub fn combined_lossy(&self) -> String {
        let mut text = self.stdout_lossy();
        if !self.stderr.is_empty() || self.stderr.omitted > 0 {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stderr_lossy());
        }
        text
    }
}

/// Runs a command with a timeout, capturing stdout/stderr without risking pipe
/// deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes`
/// bounds what is kept of each stream: its first bytes plus its last ones,
/// with the middle drained and discarded. The child gets its own process group. When the child outlives
/// `timeout`, or background processes it started still hold its output open
/// at that point, the whole group is killed and the result is reported with
/// `timed_out = true`.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let deadline = Instant::now() + timeout;
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
        // dropping closes the pipe so the child sees EOF
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let readers = [
        spawn_reader(stdout, output_limit_bytes),
        spawn_reader(stderr, output_limit_bytes),
    ];

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing its process group"
            );
            timed_out = true;
            kill_process_group(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    let reader_deadline = if timed_out {
        Instant::now() + READER_GRACE
    } else {
        deadline
    };
    let mut streams = [None, None];
    for (slot, reader) in streams.iter_mut().zip(&readers) {
        *slot = recv_before(reader, reader_deadline)?;
    }
    if streams.iter().any(Option::is_none) && !timed_out {
        warn!(
            timeout_secs = timeout.as_secs(),
            "background processes still hold the command output open, killing its process group"
        );
        timed_out = true;
        kill_process_group(&mut child)?;
        let grace = Instant::now() + READER_GRACE;
        for (slot, reader) in streams.iter_mut().zip(&readers) {
            if slot.is_none() {
                *slot = recv_before(reader, grace)?;
            }
        }
    }
    if streams.iter().any(Option::is_none) {
        warn!("output readers did not finish; returning without their output");
    }

    let [stdout, stderr] = streams;
    let stdout = stdout.unwrap_or_default();
    let stderr = stderr.unwrap_or_default();

    if stdout.omitted > 0 || stderr.omitted > 0 {
        warn!(
            stdout_truncated = stdout.omitted,
            stderr_truncated = stderr.omitted,
            "output truncated"
        );
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> Receiver<StreamResult> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // the receiver is gone when the caller stopped waiting
        let _ = tx.send(read_stream_limited(reader, limit));
    });
    rx
}

/// `Ok(None)` when the reader has not finished by `deadline`.
fn recv_before(
    reader: &Receiver<StreamResult>,
    deadline: Instant,
) -> Result<Option<CapturedStream>> {
    match reader.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(result) => result.map(Some),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("output reader thread panicked")),
    }
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id()).context("process id out of range")?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        // the group may already be gone
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err).context("kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) -> Result<()> {
    match child.kill() {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(err) => Err(err).context("kill command"),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> StreamResult {
    let tail_limit = (limit / TAIL_DIVISOR).max(limit.min(MIN_TAIL_BYTES));
    let head_limit = limit - tail_limit;
    let mut head = Vec::new();
    let mut tail = VecDeque::new();
    let mut omitted = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let keep = n.min(head_limit.saturating_sub(head.len()));
        head.extend_from_slice(&chunk[..keep]);
        tail.extend(&chunk[keep..n]);
        let excess = tail.len().saturating_sub(tail_limit);
        tail.drain(..excess);
        omitted += excess;
    }

    Ok(CapturedStream {
        head,
        tail: tail.into(),
        omitted,
    })
}
