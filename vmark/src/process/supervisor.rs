//! Supervised execution of external commands.
//!
//! [`ProcessSupervisor::run`] spawns a shell command, streams both output
//! pipes, enforces the total and idle timeouts, and makes sure the child (and
//! anything it started) is gone before returning, whatever the outcome.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::TimeoutKind;
use crate::process::display::{DisplayLine, ProgressDisplay};
use crate::process::lines::LineSplitter;
use crate::process::progress::ProgressPredicate;
use crate::{Error, Result};

const CHUNK_SIZE: usize = 4096;
const EVENT_BUFFER: usize = 256;

/// Default wait between the termination request and the forced kill.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How long readers may keep delivering buffered output after the child exits.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(500);

pub type TimeoutCallback = std::sync::Arc<dyn Fn(TimeoutKind) -> Result<()> + Send + Sync>;
pub type ErrorCallback = std::sync::Arc<dyn Fn(&Error) -> Result<()> + Send + Sync>;
pub type OutputCallback = std::sync::Arc<dyn Fn(&str) -> Result<()> + Send + Sync>;

/// Per-invocation options.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Wall-clock limit from spawn.
    pub total_timeout: Option<Duration>,
    /// Maximum silence across both output streams.
    pub idle_timeout: Option<Duration>,
    /// Keep non-progress lines and return them in [`RunOutput`].
    pub capture_output: bool,
    pub progress: Option<ProgressPredicate>,
    /// Row key on the progress display; progress lines are logged at trace level without one.
    pub display_id: Option<String>,
    pub on_timeout: Option<TimeoutCallback>,
    pub on_error: Option<ErrorCallback>,
    /// Called with every line, progress or not.
    pub on_output: Option<OutputCallback>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("total_timeout", &self.total_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("capture_output", &self.capture_output)
            .field("progress", &self.progress.is_some())
            .field("display_id", &self.display_id)
            .field("cwd", &self.cwd)
            .finish_non_exhaustive()
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_timeout(mut self, limit: Option<Duration>) -> Self {
        self.total_timeout = limit;
        self
    }

    pub fn idle_timeout(mut self, limit: Option<Duration>) -> Self {
        self.idle_timeout = limit;
        self
    }

    pub fn capture(mut self) -> Self {
        self.capture_output = true;
        self
    }

    pub fn progress(mut self, predicate: ProgressPredicate) -> Self {
        self.progress = Some(predicate);
        self
    }

    pub fn display_id(mut self, id: impl Into<String>) -> Self {
        self.display_id = Some(id.into());
        self
    }

    pub fn on_timeout(mut self, callback: TimeoutCallback) -> Self {
        self.on_timeout = Some(callback);
        self
    }

    pub fn on_error(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    pub fn on_output(mut self, callback: OutputCallback) -> Self {
        self.on_output = Some(callback);
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Result of a run that neither timed out nor failed to start.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// `None` when the child was ended by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Last progress line seen on either stream.
    pub last_progress: Option<String>,
    pub elapsed: Duration,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_contains(&self, needle: &str) -> bool {
        self.stdout.as_deref().is_some_and(|s| s.contains(needle))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

enum StreamEvent {
    /// One read's worth of bytes, already split into the lines it completed.
    Chunk {
        stream: OutputStream,
        lines: Vec<String>,
    },
    Eof {
        stream: OutputStream,
        tail: Option<String>,
    },
}

/// Live state of one supervised child.
struct RunningProcess {
    child: Child,
    pid: Option<u32>,
    label: String,
    started: Instant,
    last_stdout: Instant,
    last_stderr: Instant,
    display_line: Option<DisplayLine>,
    captured_stdout: Option<Vec<String>>,
    captured_stderr: Option<Vec<String>>,
    last_progress: Option<String>,
    readers: Vec<AbortOnDropHandle<()>>,
    reaped: bool,
    /// The leader exited while its output pipes were still held open.
    group_lingering: bool,
}

impl RunningProcess {
    fn touch(&mut self, stream: OutputStream) {
        let now = Instant::now();
        match stream {
            OutputStream::Stdout => self.last_stdout = now,
            OutputStream::Stderr => self.last_stderr = now,
        }
    }

    fn last_output(&self) -> Instant {
        self.last_stdout.max(self.last_stderr)
    }

    fn handle_line(&mut self, stream: OutputStream, line: String, options: &RunOptions) {
        if let Some(callback) = &options.on_output {
            invoke_callback("on_output", || callback(&line));
        }

        let is_progress = options.progress.as_ref().is_some_and(|p| p(&line));
        if is_progress {
            match &self.display_line {
                Some(row) => row.write(&line),
                None => trace!(process = %self.label, "{}", line),
            }
            self.last_progress = Some(line);
            return;
        }

        if line.to_lowercase().contains("error") {
            warn!(process = %self.label, stream = stream.as_str(), "{}", line);
        } else {
            debug!(process = %self.label, stream = stream.as_str(), "{}", line);
        }

        let buffer = match stream {
            OutputStream::Stdout => self.captured_stdout.as_mut(),
            OutputStream::Stderr => self.captured_stderr.as_mut(),
        };
        if let Some(buffer) = buffer {
            buffer.push(line);
        }
    }

    /// Apply one reader event; returns `true` when that stream reached EOF.
    fn apply(&mut self, event: StreamEvent, options: &RunOptions) -> bool {
        match event {
            StreamEvent::Chunk { stream, lines } => {
                self.touch(stream);
                for line in lines {
                    self.handle_line(stream, line, options);
                }
                false
            }
            StreamEvent::Eof { stream, tail } => {
                if let Some(line) = tail {
                    self.handle_line(stream, line, options);
                }
                true
            }
        }
    }

    /// Stop readers, then make sure the child is no longer running.
    async fn shutdown(&mut self, grace: Duration) {
        for reader in self.readers.drain(..) {
            reader.abort();
            // cancelled readers report a JoinError, which is expected here
            let _ = reader.await;
        }

        if self.reaped {
            self.kill_lingering_group();
            return;
        }
        match self.child.try_wait() {
            Ok(Some(_)) => {
                self.reaped = true;
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(process = %self.label, error = %e, "Failed to poll child status"),
        }

        let Some(pid) = self.pid else {
            self.reaped = true;
            return;
        };

        if process_utils::request_terminate(pid) {
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(process = %self.label, %status, "Child terminated");
                    self.reaped = true;
                    return;
                }
                Ok(Err(e)) => {
                    warn!(process = %self.label, error = %e, "Failed waiting for child")
                }
                Err(_) => warn!(
                    process = %self.label,
                    grace = ?grace,
                    "Child ignored termination request, killing"
                ),
            }
        }

        process_utils::force_kill(pid);
        match self.child.kill().await {
            Ok(()) => debug!(process = %self.label, "Child killed"),
            Err(e) => error!(process = %self.label, error = %e, "Failed to kill child"),
        }
        self.reaped = true;
    }

    /// Kill group members that outlived a reaped leader.
    fn kill_lingering_group(&mut self) {
        if !self.group_lingering {
            return;
        }
        if let Some(pid) = self.pid
            && process_utils::kill_group(pid)
        {
            warn!(process = %self.label, "Killed processes left behind by exited command");
        }
        self.group_lingering = false;
    }

    fn into_output(mut self, exit_code: Option<i32>) -> RunOutput {
        RunOutput {
            exit_code,
            stdout: self.captured_stdout.take().map(|lines| lines.join("\n")),
            stderr: self.captured_stderr.take().map(|lines| lines.join("\n")),
            last_progress: self.last_progress.take(),
            elapsed: self.started.elapsed(),
        }
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        // Reached without shutdown only when the run future was dropped;
        // kill_on_drop covers the shell, this covers what it spawned.
        if !self.reaped
            && let Some(pid) = self.pid
        {
            process_utils::force_kill(pid);
        } else {
            self.kill_lingering_group();
        }
    }
}

async fn read_stream<R>(mut reader: R, stream: OutputStream, tx: mpsc::Sender<StreamEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let lines = splitter.push(&buf[..n]);
                if tx.send(StreamEvent::Chunk { stream, lines }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(stream = stream.as_str(), error = %e, "Output read failed");
                break;
            }
        }
    }
    let _ = tx
        .send(StreamEvent::Eof {
            stream,
            tail: splitter.finish(),
        })
        .await;
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn invoke_callback(name: &str, f: impl FnOnce() -> Result<()>) {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(callback = name, error = %e, "Callback failed"),
        Err(_) => error!(callback = name, "Callback panicked"),
    }
}

enum Step {
    Event(Option<StreamEvent>),
    Exited(std::io::Result<std::process::ExitStatus>),
    Idle,
}

/// Runs external commands with timeouts and guaranteed teardown.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    display: ProgressDisplay,
    terminate_grace: Duration,
    drain_grace: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(ProgressDisplay::disabled())
    }
}

impl ProcessSupervisor {
    pub fn new(display: ProgressDisplay) -> Self {
        Self {
            display,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn display(&self) -> &ProgressDisplay {
        &self.display
    }

    /// Run `command` through the platform shell.
    ///
    /// Returns the exit code and, when requested, the captured non-progress
    /// output. Timeouts and spawn failures are errors; a non-zero exit is not.
    pub async fn run(&self, command: &str, options: RunOptions) -> Result<RunOutput> {
        let result = self.supervise(command, &options).await;
        if let Err(e) = &result {
            match e {
                Error::Timeout { kind, .. } => {
                    warn!(command, error = %e, "Command timed out");
                    if let Some(callback) = &options.on_timeout {
                        invoke_callback("on_timeout", || callback(*kind));
                    }
                }
                _ => {
                    error!(command, error = %e, "Command failed");
                    if let Some(callback) = &options.on_error {
                        invoke_callback("on_error", || callback(e));
                    }
                }
            }
        }
        result
    }

    async fn supervise(&self, command: &str, options: &RunOptions) -> Result<RunOutput> {
        info!(command, "Running command");

        let mut cmd = process_utils::grouped_shell_command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            command: command.to_string(),
            source,
        })?;
        let started = Instant::now();
        let pid = child.id();

        let label = options
            .display_id
            .clone()
            .or_else(|| pid.map(|p| p.to_string()))
            .unwrap_or_else(|| "child".to_string());

        let display_line = match (&options.display_id, &options.progress) {
            (Some(id), Some(_)) if self.display.is_enabled() => Some(self.display.line(id.clone())),
            _ => None,
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(AbortOnDropHandle::new(tokio::spawn(read_stream(
                stdout,
                OutputStream::Stdout,
                tx,
            ))));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(AbortOnDropHandle::new(tokio::spawn(read_stream(
                stderr,
                OutputStream::Stderr,
                tx,
            ))));
        }
        drop(tx);

        let mut running = RunningProcess {
            child,
            pid,
            label,
            started,
            last_stdout: started,
            last_stderr: started,
            display_line,
            captured_stdout: options.capture_output.then(Vec::new),
            captured_stderr: options.capture_output.then(Vec::new),
            last_progress: None,
            readers,
            reaped: false,
            group_lingering: false,
        };

        let outcome = match options.total_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.drive(&mut running, rx, options)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::timeout(TimeoutKind::Total, limit)),
                }
            }
            None => self.drive(&mut running, rx, options).await,
        };

        running.shutdown(self.terminate_grace).await;
        let exit_code = outcome?;
        let output = running.into_output(exit_code);
        debug!(
            command,
            exit_code = ?output.exit_code,
            elapsed = ?output.elapsed,
            "Command finished"
        );
        Ok(output)
    }

    /// Pump reader events until the child exits or falls silent.
    async fn drive(
        &self,
        running: &mut RunningProcess,
        mut rx: mpsc::Receiver<StreamEvent>,
        options: &RunOptions,
    ) -> Result<Option<i32>> {
        let mut open_streams = running.readers.len();

        let status = loop {
            let idle_deadline = options.idle_timeout.map(|limit| running.last_output() + limit);
            let step = tokio::select! {
                event = rx.recv(), if open_streams > 0 => Step::Event(event),
                status = running.child.wait() => Step::Exited(status),
                _ = sleep_until_opt(idle_deadline) => Step::Idle,
            };
            match step {
                Step::Event(Some(event)) => {
                    if running.apply(event, options) {
                        open_streams -= 1;
                    }
                }
                Step::Event(None) => open_streams = 0,
                Step::Exited(status) => {
                    let status = status.map_err(|e| {
                        Error::Other(format!("Failed to wait for {}: {e}", running.label))
                    })?;
                    running.reaped = true;
                    running.group_lingering = open_streams > 0;
                    break status;
                }
                Step::Idle => {
                    let limit = options.idle_timeout.unwrap_or_default();
                    return Err(Error::timeout(TimeoutKind::Idle, limit));
                }
            }
        };

        let drain_deadline = Instant::now() + self.drain_grace;
        while open_streams > 0 {
            match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                Ok(Some(event)) => {
                    if running.apply(event, options) {
                        open_streams -= 1;
                    }
                }
                Ok(None) => open_streams = 0,
                Err(_) => {
                    debug!(process = %running.label, "Output still open after exit, detaching");
                    break;
                }
            }
        }
        running.group_lingering = open_streams > 0;

        Ok(status.code())
    }
}
