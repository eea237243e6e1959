//! Session management
//!
//! A session owns a working directory, a scrollback buffer, command history
//! and at most one attached child process. Output from the child is read
//! on a background thread, interpreted, and appended to the scrollback in
//! the order it was produced.
//!
//! ```text
//!            submit ──► Running(pid) ──► output ... exit ──► Idle
//!   Idle ──┤
//!            secret prompt seen ──► AwaitingSecret ──► send_secret ──► Idle/Running
//! ```

use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::directory;
use super::error::ShellError;
use super::process::{
    self, Backend, ExecutionRequest, OutputPump, ProcessError, ProcessHandle, SpawnSpec,
    SpawnedProcess,
};
use super::prompt;
use super::pty::{PtyPair, PtySize};
use super::scrollback::Scrollback;
use super::term::{self, InterpreterState, StyledSpan};
use crate::config::Config;
use crate::history::{CommandHistory, HistoryEntry};
use crate::notify::Notifier;

/// Session identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// A one-shot command is running with this pid
    Running(u32),
    AwaitingSecret,
}

/// Session events
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Scrollback changed
    Output(SessionId),
    StateChanged(SessionId, SessionState),
    CommandFinished {
        id: SessionId,
        command: String,
        exit_code: Option<i32>,
    },
    /// The long-lived process of an interactive session ended
    ProcessExited {
        id: SessionId,
        exit_code: Option<i32>,
    },
}

/// Everything a session needs from the application that owns it
pub struct SessionContext {
    pub config: Config,
    pub shell: PathBuf,
    pub home: Option<PathBuf>,
    pub notifier: Arc<dyn Notifier>,
    pub events: Sender<SessionEvent>,
}

impl SessionContext {
    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

enum Job {
    Command { command: String, started: Instant },
    Interactive,
}

struct Attached {
    handle: ProcessHandle,
    worker: Option<JoinHandle<()>>,
    interactive: bool,
}

struct SessionInner {
    id: SessionId,
    title: String,
    backend: Backend,
    cwd: PathBuf,
    previous_cwd: Option<PathBuf>,
    scrollback: Scrollback,
    state: SessionState,
    history: CommandHistory,
    attached: Option<Attached>,
    /// Window size for the attached process and every later spawn
    size: PtySize,
    /// Scrollback mark at the last `send_secret`
    secret_ack: u64,
    closing: bool,
}

/// A shell session
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Mutex<SessionInner>>,
    ctx: Arc<SessionContext>,
}

impl Session {
    /// Create a new session
    pub fn new(
        id: SessionId,
        title: String,
        backend: Backend,
        cwd: PathBuf,
        ctx: Arc<SessionContext>,
    ) -> Self {
        let mut inner = SessionInner {
            id,
            title,
            backend,
            cwd,
            previous_cwd: None,
            scrollback: Scrollback::new(ctx.config.scrollback_limit),
            state: SessionState::Idle,
            history: CommandHistory::new(),
            attached: None,
            size: ctx.config.pty_size(),
            secret_ack: 0,
            closing: false,
        };
        inner.write_banner(&ctx);
        Self {
            inner: Arc::new(Mutex::new(inner)),
            ctx,
        }
    }

    /// Start the long-lived process of an interactive session
    ///
    /// Local sessions spawn per command, so this is a no-op for them.
    pub fn start(&self) {
        let mut inner = self.lock();
        if inner.backend.is_remote() && inner.attached.is_none() {
            self.spawn_job(&mut inner, ExecutionRequest::Interactive);
            self.after_append(&mut inner);
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit a command line
    ///
    /// Returns `false` when the command was rejected: empty after trimming,
    /// or the session is not `Idle`.
    pub fn submit(&self, command: &str) -> bool {
        let command = command.trim();
        if command.is_empty() {
            return false;
        }

        let mut inner = self.lock();
        if inner.state != SessionState::Idle || inner.closing {
            debug!(id = %inner.id, state = ?inner.state, "rejecting command while busy");
            return false;
        }
        inner.history.add(command);

        if inner.backend.is_remote() {
            self.submit_remote(&mut inner, command);
        } else if let Some(arg) = directory::parse_cd(command) {
            inner.change_directory(command, arg, &self.ctx);
        } else {
            inner.scrollback.append(&format!("{}\n", command));
            self.spawn_job(&mut inner, ExecutionRequest::Command(command.to_string()));
        }
        self.after_append(&mut inner);
        true
    }

    fn submit_remote(&self, inner: &mut SessionInner, command: &str) {
        if inner.attached.is_none() {
            inner.ensure_line_start();
            inner
                .scrollback
                .append(&format!("Reconnecting to {}...\n", inner.title));
            self.spawn_job(inner, ExecutionRequest::Interactive);
        }
        if let Some(attached) = inner.attached.as_ref() {
            let line = format!("{}\n", command);
            if let Err(e) = attached.handle.write_input(line.as_bytes()) {
                error!(id = %inner.id, "{}", ShellError::from(e));
            }
        }
    }

    /// Allocate a PTY, spawn the child and hand its output to a worker thread
    fn spawn_job(&self, inner: &mut SessionInner, request: ExecutionRequest) {
        let spec = inner.spawn_spec(request.clone(), &self.ctx);
        let spawned = PtyPair::allocate(spec.size)
            .map_err(ShellError::from)
            .and_then(|pty| process::spawn(&spec, pty).map_err(ShellError::from));

        let SpawnedProcess { handle, pump } = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(id = %inner.id, "{}", e);
                inner.ensure_line_start();
                inner.scrollback.append(&format!("{}\n", e));
                if !inner.backend.is_remote() {
                    inner.append_prompt(&self.ctx);
                }
                return;
            }
        };

        let pid = handle.pid();
        let job = match request {
            ExecutionRequest::Command(command) => Job::Command {
                command,
                started: Instant::now(),
            },
            ExecutionRequest::Interactive => Job::Interactive,
        };
        let interactive = matches!(job, Job::Interactive);

        let session = self.clone();
        let worker = thread::Builder::new()
            .name(format!("termshell-session-{}", inner.id))
            .spawn(move || session.run_job(pid, pump, job));

        match worker {
            Ok(worker) => {
                inner.attached = Some(Attached {
                    handle,
                    worker: Some(worker),
                    interactive,
                });
                if !interactive {
                    inner.set_state(SessionState::Running(pid), &self.ctx);
                }
            }
            Err(e) => {
                error!(id = %inner.id, "failed to start output reader: {}", e);
                handle.terminate();
                inner.scrollback.append(&format!("failed to start output reader: {}\n", e));
                if !inner.backend.is_remote() {
                    inner.append_prompt(&self.ctx);
                }
            }
        }
    }

    /// Worker thread body: stream output, then settle the session
    fn run_job(self, pid: u32, pump: OutputPump, job: Job) {
        let mut interpreter = InterpreterState::new();
        let mut produced_output = false;

        let result = pump.wait_with_output(|chunk| {
            let spans = term::interpret(chunk, &mut interpreter);
            if spans.is_empty() {
                return;
            }
            produced_output |= spans.iter().any(|s| !s.text.trim().is_empty());
            self.append_output(spans);
        });

        let tail = term::finish(&mut interpreter);
        self.complete_job(pid, job, result, tail, produced_output);
    }

    fn append_output(&self, spans: Vec<StyledSpan>) {
        let mut inner = self.lock();
        inner.scrollback.append_spans(spans);
        self.after_append(&mut inner);
    }

    fn complete_job(
        &self,
        pid: u32,
        job: Job,
        result: Result<ExitStatus, ProcessError>,
        tail: Vec<StyledSpan>,
        produced_output: bool,
    ) {
        let mut inner = self.lock();
        inner.scrollback.append_spans(tail);

        let status = match result {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(id = %inner.id, pid, "{}", e);
                inner.ensure_line_start();
                inner.scrollback.append(&format!("{}\n", e));
                None
            }
        };
        let exit_code = status.and_then(|s| s.code());
        let success = status.map_or(false, |s| s.success());

        if inner
            .attached
            .as_ref()
            .map_or(false, |a| a.handle.pid() == pid)
        {
            inner.attached = None;
        }
        let closing = inner.closing;
        let id = inner.id;

        let mut notification = None;
        match job {
            Job::Command { command, started } => {
                if !closing {
                    inner.ensure_line_start();
                    if prompt::needs_elevation_hint(&command, success, produced_output) {
                        inner
                            .scrollback
                            .append(&format!("{}\n", prompt::ELEVATION_HINT));
                    }
                    inner.append_prompt(&self.ctx);
                }
                inner.set_state(SessionState::Idle, &self.ctx);
                info!(id = %id, pid, ?exit_code, "command finished");

                if let Some(limit) = self.ctx.config.session.notify_after_secs {
                    if started.elapsed() >= Duration::from_secs(limit) {
                        notification = Some((command.clone(), exit_code));
                    }
                }
                self.ctx.emit(SessionEvent::CommandFinished {
                    id,
                    command,
                    exit_code,
                });
            }
            Job::Interactive => {
                if !closing {
                    inner.ensure_line_start();
                    let message = match exit_code {
                        Some(code) => format!("[process exited with code {}]\n", code),
                        None => "[process exited]\n".to_string(),
                    };
                    inner.scrollback.append(&message);
                }
                inner.set_state(SessionState::Idle, &self.ctx);
                info!(id = %id, pid, ?exit_code, "interactive process exited");
                self.ctx.emit(SessionEvent::ProcessExited { id, exit_code });
            }
        }
        self.after_append(&mut inner);
        drop(inner);

        if let Some((command, exit_code)) = notification {
            let body = match exit_code {
                Some(code) => format!("{} (exit code {})", command, code),
                None => command,
            };
            self.ctx.notifier.notify("Command finished", &body);
        }
    }

    /// Re-run the secret prompt classifier and announce new output
    fn after_append(&self, inner: &mut SessionInner) {
        inner.evaluate_secret_prompt(&self.ctx);
        self.ctx.emit(SessionEvent::Output(inner.id));
    }

    /// Write a secret followed by newline straight to the child
    ///
    /// Only valid while `AwaitingSecret` or `Running`. The secret is never
    /// echoed to the scrollback or recorded in history.
    pub fn send_secret(&self, secret: &str) -> bool {
        let mut inner = self.lock();
        if inner.state == SessionState::Idle {
            debug!(id = %inner.id, "ignoring secret while idle");
            return false;
        }
        let Some(attached) = inner.attached.as_ref() else {
            warn!(id = %inner.id, "no process to send secret to");
            return false;
        };

        let mut buf = Vec::with_capacity(secret.len() + 1);
        buf.extend_from_slice(secret.as_bytes());
        buf.push(b'\n');
        let written = attached.handle.write_input(&buf);
        buf.fill(0);

        let next = if attached.interactive {
            SessionState::Idle
        } else {
            SessionState::Running(attached.handle.pid())
        };

        if let Err(e) = written {
            error!(id = %inner.id, "{}", ShellError::from(e));
            return false;
        }
        inner.secret_ack = inner.scrollback.mark();
        inner.set_state(next, &self.ctx);
        true
    }

    /// Reset the scrollback to banner and prompt
    ///
    /// A running child is left alone; its further output keeps appending.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.scrollback.clear();
        inner.write_banner(&self.ctx);
        self.after_append(&mut inner);
    }

    /// Tear down the attached process
    ///
    /// Signals the child, waits for the worker to stop reading, then drops
    /// the last reference to the PTY master.
    pub fn close(&self) {
        let attached = {
            let mut inner = self.lock();
            inner.closing = true;
            inner.attached.take()
        };

        if let Some(mut attached) = attached {
            info!(pid = attached.handle.pid(), "terminating session process");
            attached.handle.terminate();
            if let Some(worker) = attached.worker.take() {
                if worker.join().is_err() {
                    error!("session worker panicked");
                }
            }
            drop(attached);
        }

        let mut inner = self.lock();
        inner.set_state(SessionState::Idle, &self.ctx);
    }

    /// Change the window size programs in this session see
    ///
    /// Applied to the attached process right away and to every later spawn.
    pub fn resize(&self, size: PtySize) {
        let mut inner = self.lock();
        if inner.size == size {
            return;
        }
        debug!(id = %inner.id, cols = size.cols, rows = size.rows, "resizing session");
        inner.size = size;
        if let Some(attached) = inner.attached.as_ref() {
            if let Err(e) = attached.handle.resize(size) {
                warn!(id = %inner.id, "{}", e);
            }
        }
    }

    pub fn id(&self) -> SessionId {
        self.lock().id
    }

    pub fn title(&self) -> String {
        self.lock().title.clone()
    }

    pub fn set_title(&self, title: impl Into<String>) {
        self.lock().title = title.into();
    }

    pub fn backend(&self) -> Backend {
        self.lock().backend.clone()
    }

    pub fn cwd(&self) -> PathBuf {
        self.lock().cwd.clone()
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Plain text of the scrollback
    pub fn contents(&self) -> String {
        self.lock().scrollback.contents()
    }

    /// Run `f` against the scrollback while no append can interleave
    pub fn with_scrollback<R>(&self, f: impl FnOnce(&Scrollback) -> R) -> R {
        f(&self.lock().scrollback)
    }

    /// Submitted commands, oldest first
    pub fn history(&self) -> Vec<String> {
        self.lock().history.commands()
    }

    /// The last `count` commands, newest first
    pub fn recent_history(&self, count: usize) -> Vec<HistoryEntry> {
        self.lock().history.recent(count).into_iter().cloned().collect()
    }

    /// Commands containing `query`, newest first
    pub fn search_history(&self, query: &str) -> Vec<HistoryEntry> {
        self.lock().history.search(query).into_iter().cloned().collect()
    }

    #[cfg(test)]
    fn master_ref(&self) -> Option<std::sync::Weak<std::fs::File>> {
        self.lock().attached.as_ref().map(|a| a.handle.master_ref())
    }
}

impl SessionInner {
    fn prompt(&self, ctx: &SessionContext) -> String {
        prompt::render_prompt(
            &self.cwd,
            ctx.home.as_deref(),
            &ctx.config.session.prompt_symbol,
        )
    }

    fn append_prompt(&mut self, ctx: &SessionContext) {
        let prompt = self.prompt(ctx);
        self.scrollback.append(&prompt);
    }

    fn ensure_line_start(&mut self) {
        if !self.scrollback.at_line_start() {
            self.scrollback.append("\n");
        }
    }

    fn write_banner(&mut self, ctx: &SessionContext) {
        let banner = &ctx.config.session.banner;
        if !banner.is_empty() {
            self.scrollback.append(&format!("{}\n", banner));
        }
        if self.backend.is_remote() {
            self.scrollback
                .append(&format!("Connecting to {}...\n", self.title));
        } else {
            self.append_prompt(ctx);
        }
    }

    fn set_state(&mut self, state: SessionState, ctx: &SessionContext) {
        if self.state != state {
            debug!(id = %self.id, from = ?self.state, to = ?state, "session state");
            self.state = state;
            ctx.emit(SessionEvent::StateChanged(self.id, state));
        }
    }

    /// Handle `cd` without a child process
    fn change_directory(&mut self, command: &str, arg: &str, ctx: &SessionContext) {
        self.scrollback.append(&format!("{}\n", command));
        match directory::resolve(
            arg,
            &self.cwd,
            ctx.home.as_deref(),
            self.previous_cwd.as_deref(),
        ) {
            Ok(target) => {
                debug!(id = %self.id, cwd = %target.display(), "changed directory");
                let old = std::mem::replace(&mut self.cwd, target);
                self.previous_cwd = Some(old);
            }
            Err(e) => {
                self.scrollback.append(&format!("{}\n", e));
            }
        }
        self.append_prompt(ctx);
    }

    fn spawn_spec(&self, request: ExecutionRequest, ctx: &SessionContext) -> SpawnSpec {
        let config = &ctx.config;
        SpawnSpec {
            backend: self.backend.clone(),
            request,
            shell: ctx.shell.clone(),
            login_shell: config.login_shell,
            ssh_program: config.ssh_path.clone(),
            cwd: self.cwd.clone(),
            size: self.size,
            term: config.terminal.term.clone(),
            color_term: config.terminal.color_term.clone(),
        }
    }

    /// Level-triggered secret prompt classifier over the last line
    fn evaluate_secret_prompt(&mut self, ctx: &SessionContext) {
        let line = self.scrollback.last_line();
        match self.state {
            SessionState::Idle | SessionState::Running(_) => {
                // Only lines that started after the last secret was sent
                let since_ack = self.scrollback.mark().saturating_sub(self.secret_ack);
                let fresh = since_ack > line.chars().count() as u64;
                if fresh && prompt::is_secret_prompt(&line) {
                    info!(id = %self.id, "secret prompt detected");
                    self.set_state(SessionState::AwaitingSecret, ctx);
                }
            }
            SessionState::AwaitingSecret => {
                if line == self.prompt(ctx) {
                    let next = match self.attached.as_ref() {
                        Some(a) if !a.interactive => SessionState::Running(a.handle.pid()),
                        _ => SessionState::Idle,
                    };
                    self.set_state(next, ctx);
                }
            }
        }
    }
}
