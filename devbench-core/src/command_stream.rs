// Standard library
use std::env;
use std::ffi::{OsStr, OsString};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

// External crates
use crate::error::{Result, VmError};
use duct::{cmd, ReaderHandle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout_at;
use tracing::{debug, warn};

/// Lines buffered between the pipe reader thread and the consumer.
const LINE_BUFFER: usize = 256;

/// Everything needed to launch one external command.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    /// Directory that must be on `PATH` for the command's helper tools.
    pub helper_path: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn helper_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.helper_path = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The command line as a single string, for diagnostics.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    fn base_path(&self) -> OsString {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| OsString::from(v))
            .or_else(|| env::var_os("PATH"))
            .unwrap_or_default()
    }

    /// The `PATH` the child will see.
    pub fn search_path(&self) -> OsString {
        let base = self.base_path();
        match &self.helper_path {
            Some(helper) => search_path_with_helper(&base, helper),
            None => base,
        }
    }
}

/// Prepends `helper` to `base` unless it is already one of its entries.
pub fn search_path_with_helper(base: &OsStr, helper: &Path) -> OsString {
    if env::split_paths(base).any(|entry| entry == helper) {
        return base.to_os_string();
    }

    let mut entries = vec![helper.to_path_buf()];
    entries.extend(env::split_paths(base).filter(|p| !p.as_os_str().is_empty()));
    env::join_paths(entries).unwrap_or_else(|_| base.to_os_string())
}

/// How a streamed command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited { code: i32 },
    /// Terminated by a signal without an exit code.
    Signaled,
    /// The deadline passed; the child was killed.
    TimedOut { after: Duration },
    /// Killed through [`StreamingCommand::kill`].
    Killed,
    /// Reading the output failed.
    Faulted(String),
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ProcessOutcome::Exited { code: 0 })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    TimedOut,
    Killed,
}

enum ReaderExit {
    Finished(Option<i32>),
    Abandoned,
}

/// A running command whose merged stdout/stderr is read line by line.
///
/// Dropping it before [`wait`](Self::wait) completes kills the child.
pub struct StreamingCommand {
    handle: Arc<ReaderHandle>,
    lines: mpsc::Receiver<String>,
    reader: Option<JoinHandle<io::Result<ReaderExit>>>,
    /// Process group led by the child.
    group: Option<u32>,
    deadline: Option<tokio::time::Instant>,
    timeout: Option<Duration>,
    started: Instant,
    stop: Option<Stop>,
    command_line: String,
}

/// Launch `spec` with stderr redirected into stdout and start reading its output.
///
/// Fails with [`VmError::Spawn`] when the program cannot be found or started.
/// Must be called from within a Tokio runtime.
pub fn spawn_streaming(spec: &CommandSpec) -> Result<StreamingCommand> {
    let command_line = spec.command_line();
    let search_path = spec.search_path();
    let cwd = match &spec.current_dir {
        Some(dir) => dir.clone(),
        None => env::current_dir()?,
    };

    let program = which::which_in(&spec.program, Some(&search_path), &cwd).map_err(|e| {
        VmError::Spawn {
            program: spec.program.display().to_string(),
            reason: e.to_string(),
        }
    })?;

    let mut expression = cmd(program, &spec.args).env("PATH", &search_path);
    for (key, value) in spec.env.iter().filter(|(k, _)| k != "PATH") {
        expression = expression.env(key, value);
    }
    if let Some(dir) = &spec.current_dir {
        expression = expression.dir(dir);
    }
    #[cfg(unix)]
    {
        // The child leads a new process group so a kill reaches everything it started.
        expression = expression.before_spawn(|command| {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
            Ok(())
        });
    }

    let handle = expression
        .stderr_to_stdout()
        .stdin_null()
        .unchecked()
        .reader()
        .map_err(|e| VmError::Spawn {
            program: spec.program.display().to_string(),
            reason: e.to_string(),
        })?;
    let handle = Arc::new(handle);

    let group = handle.pids().first().copied();
    debug!("Spawned '{}' (pids {:?})", command_line, handle.pids());

    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    let pipe = Arc::clone(&handle);
    let reader = tokio::task::spawn_blocking(move || read_lines(&pipe, tx));

    Ok(StreamingCommand {
        handle,
        lines: rx,
        reader: Some(reader),
        group,
        deadline: spec.timeout.map(|t| tokio::time::Instant::now() + t),
        timeout: spec.timeout,
        started: Instant::now(),
        stop: None,
        command_line,
    })
}

fn read_lines(handle: &ReaderHandle, tx: mpsc::Sender<String>) -> io::Result<ReaderExit> {
    let mut reader = BufReader::new(handle);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(|c| c == '\n' || c == '\r')
            .to_string();
        if tx.blocking_send(line).is_err() {
            return Ok(ReaderExit::Abandoned);
        }
    }

    // EOF on a duct reader has already reaped the child.
    let code = handle.try_wait()?.and_then(|output| output.status.code());
    Ok(ReaderExit::Finished(code))
}

impl StreamingCommand {
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.handle.pids()
    }

    /// Next line of output, or `None` once the output is closed, the
    /// deadline has passed, or the command was killed.
    pub async fn next_line(&mut self) -> Option<String> {
        if self.stop.is_some() {
            return None;
        }

        match self.deadline {
            None => self.lines.recv().await,
            Some(deadline) => match timeout_at(deadline, self.lines.recv()).await {
                Ok(line) => line,
                Err(_) => {
                    self.terminate(Stop::TimedOut);
                    None
                }
            },
        }
    }

    /// Forcibly terminate the child and everything it started. Lines already read stay valid.
    pub fn kill(&mut self) {
        if self.stop.is_none() {
            self.terminate(Stop::Killed);
        }
    }

    fn terminate(&mut self, reason: Stop) {
        self.stop = Some(reason);
        self.kill_tree();
        // Lines still queued are discarded; the reader thread exits on its next send.
        self.lines.close();
    }

    /// SIGKILL the child's process group, then kill and reap the child itself.
    fn kill_tree(&self) {
        #[cfg(unix)]
        if let Some(group) = self.group {
            use nix::errno::Errno;
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(group as i32), Signal::SIGKILL) {
                if e != Errno::ESRCH {
                    warn!("Failed to kill process group of '{}': {}", self.command_line, e);
                }
            }
        }

        if let Err(e) = self.handle.kill() {
            warn!("Failed to kill '{}': {}", self.command_line, e);
        }
    }

    fn stopped_outcome(&self, reason: Stop) -> ProcessOutcome {
        match reason {
            Stop::TimedOut => ProcessOutcome::TimedOut {
                after: self.timeout.unwrap_or_else(|| self.elapsed()),
            },
            Stop::Killed => ProcessOutcome::Killed,
        }
    }

    /// Wait for the command to finish, discarding any output not yet read.
    ///
    /// Safe to abandon midway and follow with [`kill`](Self::kill).
    pub async fn wait(&mut self) -> ProcessOutcome {
        while self.next_line().await.is_some() {}

        if let Some(reason) = self.stop {
            return self.stopped_outcome(reason);
        }

        let Some(reader) = self.reader.take() else {
            return ProcessOutcome::Faulted("command was already waited on".to_string());
        };

        let joined = match self.deadline {
            None => reader.await,
            Some(deadline) => match timeout_at(deadline, reader).await {
                Ok(joined) => joined,
                Err(_) => {
                    self.terminate(Stop::TimedOut);
                    return self.stopped_outcome(Stop::TimedOut);
                }
            },
        };

        match joined {
            Ok(Ok(ReaderExit::Finished(Some(code)))) => ProcessOutcome::Exited { code },
            Ok(Ok(ReaderExit::Finished(None))) => ProcessOutcome::Signaled,
            Ok(Ok(ReaderExit::Abandoned)) => ProcessOutcome::Killed,
            Ok(Err(e)) => ProcessOutcome::Faulted(format!(
                "error reading output of '{}': {}",
                self.command_line, e
            )),
            Err(e) => ProcessOutcome::Faulted(format!("output reader task failed: {}", e)),
        }
    }
}

impl Drop for StreamingCommand {
    fn drop(&mut self) {
        if self.reader.is_some() && self.stop.is_none() {
            self.kill_tree();
        }
    }
}
