//! Helpers for running child processes with timeouts, cancellation and bounded output.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How often a waiting process checks for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Time a process gets to exit after a terminate signal before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Keeps the most recent `limit` bytes of a growing text stream.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    buf: String,
    limit: usize,
    dropped: usize,
}

impl TailBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, text: &str) {
        self.buf.push_str(text);
        if self.buf.len() <= self.limit {
            return;
        }
        let mut cut = self.buf.len() - self.limit;
        while !self.buf.is_char_boundary(cut) {
            cut += 1;
        }
        self.buf.drain(..cut);
        self.dropped += cut;
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Buffered text, prefixed with a notice when earlier bytes were dropped.
    pub fn render(&self) -> String {
        if self.dropped == 0 {
            return self.buf.clone();
        }
        format!("[{} earlier bytes truncated]\n{}", self.dropped, self.buf)
    }
}

/// Parameters for [`run_process`].
pub struct ProcessRequest<'a> {
    /// Bytes written to stdin before it is closed. `None` attaches `/dev/null`.
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    /// Maximum bytes of combined stdout/stderr kept in memory (most recent wins).
    pub output_limit_bytes: usize,
    /// When set to true, the process is terminated and the result marked aborted.
    pub abort: Option<&'a AtomicBool>,
    /// Called for every stdout/stderr line as it arrives.
    pub on_line: Option<&'a (dyn Fn(&str) + Sync)>,
    /// Drop stderr instead of merging it into the captured output.
    pub discard_stderr: bool,
}

impl<'a> ProcessRequest<'a> {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            stdin: None,
            timeout,
            output_limit_bytes,
            abort: None,
            on_line: None,
            discard_stderr: false,
        }
    }
}

/// Outcome of a finished (or killed) child process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit code, `None` when the process was ended by a signal.
    pub code: Option<i32>,
    /// Combined stdout/stderr, tail-bounded.
    pub output: String,
    pub timed_out: bool,
    pub aborted: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0) && !self.timed_out && !self.aborted
    }
}

/// Spawn `cmd`, stream its combined output, and wait for exit, timeout or abort.
///
/// Output is drained concurrently so the child never blocks on a full pipe. The
/// child runs in its own process group on unix so terminate/kill reach any
/// processes it spawned.
#[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), output_limit_bytes = request.output_limit_bytes))]
pub fn run_process(mut cmd: Command, request: &ProcessRequest<'_>) -> Result<ProcessOutput> {
    if request.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped());
    if request.discard_stderr {
        cmd.stderr(Stdio::null());
    } else {
        cmd.stderr(Stdio::piped());
    }
    isolate_process_group(&mut cmd);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child.stderr.take();
    let stdin = child.stdin.take();
    let collected = Mutex::new(TailBuffer::new(request.output_limit_bytes));

    let (code, timed_out, aborted) = thread::scope(|scope| -> Result<(Option<i32>, bool, bool)> {
        let collected = &collected;
        let on_line = request.on_line;
        scope.spawn(move || read_lines(stdout, collected, on_line));
        if let Some(stderr) = stderr {
            scope.spawn(move || read_lines(stderr, collected, on_line));
        }
        if let (Some(mut pipe), Some(input)) = (stdin, request.stdin) {
            scope.spawn(move || {
                // The pipe is closed when `pipe` drops at the end of this closure.
                if let Err(e) = pipe.write_all(input) {
                    warn!(err = %e, "failed to write child stdin");
                }
            });
        }
        let exit = wait_for_exit(&mut child, request.timeout, request.abort);
        // Readers only finish once every holder of the pipes is gone.
        kill_stragglers(&child);
        exit
    })?;

    let mut output = collected
        .into_inner()
        .map_err(|_| anyhow!("output buffer poisoned"))?;
    if output.dropped() > 0 {
        warn!(dropped = output.dropped(), "output truncated");
    }
    if timed_out {
        output.push(&format!(
            "\n[process timed out after {}s]\n",
            request.timeout.as_secs()
        ));
    }
    if aborted {
        output.push("\n[process aborted]\n");
    }

    debug!(exit_code = ?code, timed_out, aborted, "command finished");
    Ok(ProcessOutput {
        code,
        output: output.render(),
        timed_out,
        aborted,
    })
}

fn wait_for_exit(
    child: &mut Child,
    timeout: Duration,
    abort: Option<&AtomicBool>,
) -> Result<(Option<i32>, bool, bool)> {
    let deadline = Instant::now() + timeout;
    loop {
        if abort.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            warn!("abort requested, terminating child");
            let status = terminate(child)?;
            return Ok((status, false, true));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            kill_group(child);
            let status = child.wait().context("wait command after kill")?;
            return Ok((status.code(), true, false));
        }
        if let Some(status) = child
            .wait_timeout(remaining.min(POLL_INTERVAL))
            .context("wait for command")?
        {
            return Ok((status.code(), false, false));
        }
    }
}

/// Ask the child to exit, then kill it if it ignores the request.
fn terminate(child: &mut Child) -> Result<Option<i32>> {
    if signal_terminate(child)
        && let Some(status) = child
            .wait_timeout(TERMINATE_GRACE)
            .context("wait for terminated command")?
    {
        return Ok(status.code());
    }
    kill_group(child);
    let status = child.wait().context("wait command after kill")?;
    Ok(status.code())
}

fn read_lines<R: Read>(
    reader: R,
    collected: &Mutex<TailBuffer>,
    on_line: Option<&(dyn Fn(&str) + Sync)>,
) {
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&raw);
                if let Some(callback) = on_line {
                    callback(line.trim_end_matches(['\n', '\r']));
                }
                if let Ok(mut buf) = collected.lock() {
                    buf.push(&line);
                }
            }
            Err(e) => {
                warn!(err = %e, "failed to read child output");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn signal_terminate(child: &Child) -> bool {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;
    killpg(Pid::from_raw(child.id() as i32), Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
fn signal_terminate(_child: &Child) -> bool {
    false
}

#[cfg(unix)]
fn kill_group(child: &mut Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;
    if killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL).is_err()
        && let Err(e) = child.kill()
    {
        warn!(err = %e, "failed to kill child");
    }
}

/// SIGKILL anything still running in the exited child's process group.
#[cfg(unix)]
fn kill_stragglers(child: &Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;
    match killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        Ok(()) => debug!("killed processes left behind by child"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(err = %e, "failed to kill leftover processes"),
    }
}

#[cfg(not(unix))]
fn kill_stragglers(_child: &Child) {}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!(err = %e, "failed to kill child");
    }
}
