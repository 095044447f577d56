//! Host side of one isolated scan: spawn a transient worker process, send
//! it the request, forward each streamed result as it arrives and bound the
//! whole exchange by a single deadline.
//! Every session gets a fresh process that is discarded afterwards.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::logging::Logger;
use crate::protocol::{decode_line, encode_line, WorkerLine, WorkerRequest, WorkerResultMessage};

pub const WORKER_SUBCOMMAND: &str = "worker";
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// This binary, re-entered in worker mode.
    pub fn current_exe() -> Result<Self, std::io::Error> {
        Ok(Self::new(std::env::current_exe()?, &[WORKER_SUBCOMMAND]))
    }

    pub fn from_config(cfg: &Config) -> Result<Self, std::io::Error> {
        match &cfg.worker_path {
            Some(path) => Ok(Self::new(path.clone(), &[WORKER_SUBCOMMAND])),
            None => Self::current_exe(),
        }
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }
        command
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Spawning,
    Streaming,
    Completed,
    TimedOut,
    Crashed { exit_code: Option<i32> },
    SpawnFailed(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::TimedOut | Self::Crashed { .. } | Self::SpawnFailed(_)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Spawning => write!(f, "spawning"),
            Self::Streaming => write!(f, "streaming"),
            Self::Completed => write!(f, "completed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Crashed {
                exit_code: Some(code),
            } => write!(f, "crashed(exit={code})"),
            Self::Crashed { exit_code: None } => write!(f, "crashed"),
            Self::SpawnFailed(error) => write!(f, "spawn_failed({error})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub state: SessionState,
    /// Sources that reported, in arrival order.
    pub delivered: Vec<String>,
    pub malformed_lines: usize,
    pub elapsed: Duration,
}

impl SessionReport {
    pub fn is_complete(&self) -> bool {
        self.state == SessionState::Completed
    }
}

enum ReaderEvent {
    Line { raw: Vec<u8>, read_at: Instant },
    Eof,
    Failed(std::io::Error),
}

pub struct WorkerSession {
    command: WorkerCommand,
    timeout: Duration,
    logger: Logger,
    state: SessionState,
}

impl WorkerSession {
    pub fn new(command: WorkerCommand, timeout: Duration, logger: Logger) -> Self {
        Self {
            command,
            timeout,
            logger: logger.scoped("worker_session"),
            state: SessionState::NotStarted,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Runs the session to a terminal state. `on_message` is called on this
    /// thread for every non-sentinel result, in arrival order.
    pub fn run<F>(mut self, request: &WorkerRequest, mut on_message: F) -> SessionReport
    where
        F: FnMut(WorkerResultMessage),
    {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut delivered = Vec::new();
        let mut malformed_lines = 0;

        self.transition(SessionState::Spawning);
        let (mut child, rx) = match self.spawn(request) {
            Ok(spawned) => spawned,
            Err(error) => {
                self.transition(SessionState::SpawnFailed(error.to_string()));
                return self.report(delivered, malformed_lines, started);
            }
        };
        self.transition(SessionState::Streaming);

        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            // Past the deadline only lines read in time still count.
            let event = if remaining.is_zero() {
                match rx.try_recv() {
                    Ok(ReaderEvent::Line { read_at, .. }) if read_at > deadline => {
                        break SessionState::TimedOut
                    }
                    Ok(event) => Ok(event),
                    Err(TryRecvError::Empty) => break SessionState::TimedOut,
                    Err(TryRecvError::Disconnected) => Err(RecvTimeoutError::Disconnected),
                }
            } else {
                rx.recv_timeout(remaining)
            };

            match event {
                Ok(ReaderEvent::Line { raw, .. }) => match decode_line(&raw) {
                    Ok(WorkerLine::Result(message)) => {
                        self.logger.debug(format!(
                            "{} reported {} window(s) after {}ms",
                            message.plugin_name,
                            message.windows.len(),
                            started.elapsed().as_millis()
                        ));
                        delivered.push(message.plugin_name.clone());
                        on_message(message);
                    }
                    Ok(WorkerLine::Final) => break SessionState::Completed,
                    Ok(WorkerLine::Blank) => {}
                    Err(error) => {
                        malformed_lines += 1;
                        self.logger.warn(format!(
                            "skipping malformed worker line ({error}): {}",
                            preview(&raw)
                        ));
                    }
                },
                Ok(ReaderEvent::Failed(error)) => {
                    self.logger.warn(format!("worker stdout read failed: {error}"));
                    break self.crashed(&mut child, deadline);
                }
                Ok(ReaderEvent::Eof) | Err(RecvTimeoutError::Disconnected) => {
                    break self.crashed(&mut child, deadline);
                }
                Err(RecvTimeoutError::Timeout) => continue,
            }
        };

        match outcome {
            SessionState::TimedOut => {
                self.logger.warn(format!(
                    "worker exceeded {}ms; killing it ({} source(s) reported)",
                    self.timeout.as_millis(),
                    delivered.len()
                ));
                terminate(&mut child);
            }
            SessionState::Completed => {
                if wait_until(&mut child, deadline).is_none() {
                    self.logger
                        .warn("worker did not exit after sentinel before the deadline; killing it");
                    terminate(&mut child);
                }
            }
            _ => {}
        }

        self.transition(outcome);
        self.report(delivered, malformed_lines, started)
    }

    fn spawn(
        &self,
        request: &WorkerRequest,
    ) -> Result<(Child, Receiver<ReaderEvent>), std::io::Error> {
        let mut child = self.command.to_command().spawn()?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                terminate(&mut child);
                return Err(std::io::Error::other("worker stdout was not captured"));
            }
        };

        let (tx, rx) = mpsc::channel();
        if let Err(error) = spawn_reader(stdout, tx) {
            terminate(&mut child);
            return Err(error);
        }

        let line = match encode_line(request) {
            Ok(line) => line,
            Err(error) => {
                terminate(&mut child);
                return Err(std::io::Error::other(error));
            }
        };
        if let Some(stdin) = child.stdin.take() {
            if let Err(error) = spawn_writer(stdin, line, self.logger.clone()) {
                terminate(&mut child);
                return Err(error);
            }
        }

        Ok((child, rx))
    }

    fn crashed(&self, child: &mut Child, deadline: Instant) -> SessionState {
        let status = wait_until(child, deadline).or_else(|| {
            terminate(child);
            None
        });
        let exit_code = status.and_then(|s| s.code());
        self.logger.warn(format!(
            "worker exited before sentinel (exit code {})",
            exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
        ));
        SessionState::Crashed { exit_code }
    }

    fn transition(&mut self, next: SessionState) {
        self.logger
            .debug(format!("session {} -> {}", self.state, next));
        if let SessionState::SpawnFailed(error) = &next {
            self.logger.error(format!(
                "failed to start worker '{}': {error}",
                self.command.program.display()
            ));
        }
        self.state = next;
    }

    fn report(&self, delivered: Vec<String>, malformed_lines: usize, started: Instant) -> SessionReport {
        SessionReport {
            state: self.state.clone(),
            delivered,
            malformed_lines,
            elapsed: started.elapsed(),
        }
    }
}

/// Sends the request off the session thread so a worker that never reads
/// stdin cannot hold the session past its deadline. Dropping stdin afterwards
/// tells the worker no more input follows.
fn spawn_writer(mut stdin: ChildStdin, line: String, logger: Logger) -> Result<(), std::io::Error> {
    thread::Builder::new()
        .name("worker-stdin".into())
        .spawn(move || {
            let written = stdin
                .write_all(line.as_bytes())
                .and_then(|_| stdin.flush());
            if let Err(error) = written {
                // The reader sees EOF if the worker is gone.
                logger.warn(format!("failed to send request to worker: {error}"));
            }
        })
        .map(|_| ())
}

fn spawn_reader(stdout: ChildStdout, tx: Sender<ReaderEvent>) -> Result<(), std::io::Error> {
    thread::Builder::new()
        .name("worker-stdout".into())
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                let mut line = Vec::new();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => {
                        let _ = tx.send(ReaderEvent::Eof);
                        return;
                    }
                    // A last line without '\n' is a kill-truncated write; it
                    // is forwarded anyway and rejected by the decoder if partial.
                    Ok(_) => {
                        let event = ReaderEvent::Line {
                            raw: line,
                            read_at: Instant::now(),
                        };
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(error) => {
                        let _ = tx.send(ReaderEvent::Failed(error));
                        return;
                    }
                }
            }
        })
        .map(|_| ())
}

fn wait_until(child: &mut Child, deadline: Instant) -> Option<ExitStatus> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(_) => return None,
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        thread::sleep(remaining.min(EXIT_POLL_INTERVAL));
    }
}

fn terminate(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn preview(raw: &[u8]) -> String {
    const MAX: usize = 120;
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end();
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let cut: String = text.chars().take(MAX).collect();
        format!("{cut}...")
    }
}
