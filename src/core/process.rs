//! Process controller
//!
//! Spawns a child (one-shot shell command, bare shell or SSH client) on the
//! slave side of a [`PtyPair`] and splits the result in two:
//!
//! - [`ProcessHandle`]: foreground side, writes input and requests cancellation
//! - [`OutputPump`]: background side, streams output, signals and reaps the child
//!
//! The master is shared between them through one `Arc<File>`; whichever
//! side drops last closes it. The parent's copy of the slave is closed as
//! soon as the child has been spawned.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
#[cfg(test)]
use std::sync::Weak;
use std::thread;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::pty::{PtyPair, PtySize};

/// How long one poll waits before re-checking child exit and cancellation
const POLL_INTERVAL_MS: u16 = 50;

/// Read buffer size for PTY output
const READ_BUFFER_SIZE: usize = 8192;

/// Upper bound on the post-exit drain when something still writes
const DRAIN_LIMIT: Duration = Duration::from_millis(250);

/// Wait per drain poll; a fully closed slave answers at once
const DRAIN_POLL_MS: u16 = 20;

/// Time between SIGTERM to the group and SIGKILL to the child
const KILL_GRACE: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write to PTY: {0}")]
    Write(#[source] io::Error),

    #[error("failed to read from PTY: {0}")]
    Read(#[source] io::Error),

    #[error("failed to wait for process: {0}")]
    Wait(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// What kind of process backs a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    /// Local shell, one child per submitted command
    LocalShell,
    /// SSH client kept alive for the whole session
    RemoteShell {
        host: String,
        user: Option<String>,
        port: Option<u16>,
    },
}

impl Backend {
    /// Parse `[user@]host[:port]`
    pub fn parse_remote(target: &str) -> Option<Self> {
        let (user, rest) = match target.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return None,
            None => (None, target),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, Some(port.parse().ok()?)),
            None => (rest, None),
        };
        if host.is_empty() {
            return None;
        }
        Some(Backend::RemoteShell {
            host: host.to_string(),
            user,
            port,
        })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Backend::RemoteShell { .. })
    }

    /// Inverse of [`Backend::parse_remote`]; `None` for local shells
    pub fn remote_target(&self) -> Option<String> {
        match self {
            Backend::LocalShell => None,
            Backend::RemoteShell { port, .. } => {
                let mut target = self.title();
                if let Some(port) = port {
                    target.push_str(&format!(":{}", port));
                }
                Some(target)
            }
        }
    }

    /// Default display title
    pub fn title(&self) -> String {
        match self {
            Backend::LocalShell => "shell".to_string(),
            Backend::RemoteShell { host, user, .. } => match user {
                Some(user) => format!("{}@{}", user, host),
                None => host.clone(),
            },
        }
    }
}

/// What to run on the PTY
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionRequest {
    /// `shell [-l] -c "<line>"`
    Command(String),
    /// Bare interactive shell, or the SSH client for remote backends
    Interactive,
}

/// Everything needed to build the child's argv and environment
#[derive(Clone, Debug)]
pub struct SpawnSpec {
    pub backend: Backend,
    pub request: ExecutionRequest,
    pub shell: PathBuf,
    pub login_shell: bool,
    pub ssh_program: String,
    pub cwd: PathBuf,
    pub size: PtySize,
    pub term: String,
    pub color_term: String,
}

impl SpawnSpec {
    /// Executable and arguments for this request
    pub fn argv(&self) -> (String, Vec<String>) {
        match (&self.backend, &self.request) {
            (Backend::RemoteShell { host, user, port }, ExecutionRequest::Interactive) => {
                let mut args = Vec::new();
                if let Some(port) = port {
                    args.push("-p".to_string());
                    args.push(port.to_string());
                }
                args.push(match user {
                    Some(user) => format!("{}@{}", user, host),
                    None => host.clone(),
                });
                (self.ssh_program.clone(), args)
            }
            (_, ExecutionRequest::Command(line)) => {
                let mut args = Vec::new();
                if self.login_shell {
                    args.push("-l".to_string());
                }
                args.push("-c".to_string());
                args.push(line.clone());
                (self.shell.display().to_string(), args)
            }
            (Backend::LocalShell, ExecutionRequest::Interactive) => {
                let args = if self.login_shell {
                    vec!["-l".to_string()]
                } else {
                    Vec::new()
                };
                (self.shell.display().to_string(), args)
            }
        }
    }

    /// Variables every child gets on top of the inherited environment
    pub fn env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("TERM", self.term.clone()),
            ("COLORTERM", self.color_term.clone()),
            ("PWD", self.cwd.display().to_string()),
            ("COLUMNS", self.size.cols.to_string()),
            ("LINES", self.size.rows.to_string()),
            ("TERM_PROGRAM", "termshell".to_string()),
            ("TERM_PROGRAM_VERSION", env!("CARGO_PKG_VERSION").to_string()),
            ("TERMSHELL", "1".to_string()),
        ]
    }
}

/// A freshly spawned child, not yet split between threads
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub pump: OutputPump,
}

/// Spawn `spec` on `pty`
///
/// The slave becomes the child's stdin/stdout/stderr and controlling
/// terminal. The parent's slave descriptors are closed before returning.
pub fn spawn(spec: &SpawnSpec, pty: PtyPair) -> Result<SpawnedProcess> {
    let (program, args) = spec.argv();
    let (master, slave) = pty.into_parts();

    let spawn_err = |source: io::Error| ProcessError::Spawn {
        program: program.clone(),
        source,
    };

    let stdin = slave.try_clone().map_err(spawn_err)?;
    let stdout = slave.try_clone().map_err(spawn_err)?;

    let mut command = Command::new(&program);
    command
        .args(&args)
        .current_dir(&spec.cwd)
        .envs(spec.env())
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(slave));

    // SAFETY: the hook runs between fork and exec and only calls
    // async-signal-safe functions (setsid, ioctl).
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(io::Error::from)?;
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(spawn_err)?;
    // Dropping the command closes the parent's copies of the slave
    drop(command);

    info!(pid = child.id(), program = %program, "spawned PTY process");

    let master = Arc::new(master);
    let cancelled = Arc::new(AtomicBool::new(false));

    Ok(SpawnedProcess {
        handle: ProcessHandle {
            pid: child.id(),
            master: Arc::clone(&master),
            cancelled: Arc::clone(&cancelled),
        },
        pump: OutputPump {
            child,
            master,
            cancelled,
        },
    })
}

/// Foreground side of a running child
///
/// Never signals the child itself: only the [`OutputPump`], which owns the
/// unreaped `Child`, does. An unreaped child keeps its pid and process
/// group reserved, so a signal can never reach a recycled pid.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    master: Arc<File>,
    cancelled: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Write keyboard input to the child
    pub fn write_input(&self, bytes: &[u8]) -> Result<()> {
        let mut master = &*self.master;
        master.write_all(bytes).map_err(ProcessError::Write)?;
        master.flush().map_err(ProcessError::Write)
    }

    /// Ask the pump to stop the child's process group and reap it
    pub fn terminate(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Resize the terminal the child sees
    pub fn resize(&self, size: PtySize) -> super::pty::Result<()> {
        super::pty::set_window_size(&*self.master, size)
    }

    /// Observe the master without keeping it open
    #[cfg(test)]
    pub fn master_ref(&self) -> Weak<File> {
        Arc::downgrade(&self.master)
    }
}

/// Background side of a running child
pub struct OutputPump {
    child: Child,
    master: Arc<File>,
    cancelled: Arc<AtomicBool>,
}

impl OutputPump {
    /// Stream output to `on_chunk` until the child is gone, then reap it
    ///
    /// Child exit is checked on every pass, so a background job that keeps
    /// the slave open and busy cannot hold the pump. After exit, buffered
    /// output is drained for at most [`DRAIN_LIMIT`]. On cancellation the
    /// child's group is signalled, then the child is killed and reaped.
    pub fn wait_with_output<F>(mut self, mut on_chunk: F) -> Result<ExitStatus>
    where
        F: FnMut(&[u8]),
    {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let status = loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return self.kill_and_reap();
            }
            if let Some(status) = self.child.try_wait().map_err(ProcessError::Wait)? {
                break status;
            }
            if self.readable(PollTimeout::from(POLL_INTERVAL_MS))? {
                match read_chunk(&self.master, &mut buf)? {
                    Some(n) => on_chunk(&buf[..n]),
                    None => break self.reap()?,
                }
            }
        };

        // The child is gone but its last output can still sit in the
        // master's buffer.
        let deadline = Instant::now() + DRAIN_LIMIT;
        while Instant::now() < deadline && self.readable(PollTimeout::from(DRAIN_POLL_MS))? {
            match read_chunk(&self.master, &mut buf)? {
                Some(n) => on_chunk(&buf[..n]),
                None => break,
            }
        }

        debug!(pid = self.child.id(), ?status, "PTY process finished");
        Ok(status)
    }

    fn readable(&self, timeout: PollTimeout) -> Result<bool> {
        let mut fds = [PollFd::new(self.master.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(fds[0].revents().map_or(false, |r| !r.is_empty())),
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(e) => Err(ProcessError::Read(e.into())),
        }
    }

    /// Wait for a child that closed its side of the PTY
    fn reap(&mut self) -> Result<ExitStatus> {
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return self.kill_and_reap();
            }
            if let Some(status) = self.child.try_wait().map_err(ProcessError::Wait)? {
                return Ok(status);
            }
            thread::sleep(Duration::from_millis(POLL_INTERVAL_MS as u64));
        }
    }

    fn kill_and_reap(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.child.try_wait().map_err(ProcessError::Wait)? {
            return Ok(status);
        }

        // Still unreaped here, so the group id is still ours
        let pgid = Pid::from_raw(self.child.id() as i32);
        for signal in [Signal::SIGHUP, Signal::SIGTERM] {
            if let Err(e) = killpg(pgid, signal) {
                debug!(pid = self.child.id(), ?signal, "killpg failed: {}", e);
                break;
            }
        }

        let deadline = Instant::now() + KILL_GRACE;
        while Instant::now() < deadline {
            if let Some(status) = self.child.try_wait().map_err(ProcessError::Wait)? {
                debug!(pid = self.child.id(), ?status, "PTY process cancelled");
                return Ok(status);
            }
            thread::sleep(Duration::from_millis(10));
        }

        if let Err(e) = self.child.kill() {
            warn!(pid = self.child.id(), "failed to kill child: {}", e);
        }
        let status = self.child.wait().map_err(ProcessError::Wait)?;
        debug!(pid = self.child.id(), ?status, "PTY process killed");
        Ok(status)
    }
}

/// One read from the master; `None` at end of stream
///
/// Linux reports a master whose slave side is fully closed with `EIO`.
fn read_chunk(master: &File, buf: &mut [u8]) -> Result<Option<usize>> {
    let mut reader = master;
    loop {
        match reader.read(buf) {
            Ok(0) => return Ok(None),
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(None),
            Err(e) => return Err(ProcessError::Read(e)),
        }
    }
}

/// Resolve a configured shell path to an absolute one when possible
pub fn resolve_shell(shell: &str) -> PathBuf {
    let path = Path::new(shell);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(shell);
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(request: ExecutionRequest) -> SpawnSpec {
        SpawnSpec {
            backend: Backend::LocalShell,
            request,
            shell: PathBuf::from("/bin/sh"),
            login_shell: false,
            ssh_program: "ssh".to_string(),
            cwd: std::env::temp_dir(),
            size: PtySize::default(),
            term: "xterm-256color".to_string(),
            color_term: "truecolor".to_string(),
        }
    }

    fn run(request: ExecutionRequest) -> (String, ExitStatus) {
        let spec = spec(request);
        let pty = PtyPair::allocate(spec.size).expect("allocate");
        let spawned = spawn(&spec, pty).expect("spawn");
        let mut output = Vec::new();
        let status = spawned
            .pump
            .wait_with_output(|chunk| output.extend_from_slice(chunk))
            .expect("wait");
        (String::from_utf8_lossy(&output).into_owned(), status)
    }

    #[test]
    fn test_command_argv() {
        let mut s = spec(ExecutionRequest::Command("ls -la".to_string()));
        s.login_shell = true;
        let (program, args) = s.argv();
        assert_eq!(program, "/bin/sh");
        assert_eq!(args, vec!["-l", "-c", "ls -la"]);
    }

    #[test]
    fn test_remote_argv() {
        let mut s = spec(ExecutionRequest::Interactive);
        s.backend = Backend::parse_remote("alice@example.com:2222").unwrap();
        let (program, args) = s.argv();
        assert_eq!(program, "ssh");
        assert_eq!(args, vec!["-p", "2222", "alice@example.com"]);
    }

    #[test]
    fn test_parse_remote() {
        assert_eq!(
            Backend::parse_remote("host"),
            Some(Backend::RemoteShell {
                host: "host".to_string(),
                user: None,
                port: None
            })
        );
        assert_eq!(Backend::parse_remote("@host"), None);
        assert_eq!(Backend::parse_remote("u@host:notaport"), None);
        assert_eq!(Backend::parse_remote("u@host").unwrap().title(), "u@host");
        for target in ["host", "u@host", "u@host:2222"] {
            let backend = Backend::parse_remote(target).unwrap();
            assert_eq!(backend.remote_target().as_deref(), Some(target));
        }
        assert_eq!(Backend::LocalShell.remote_target(), None);
    }

    #[test]
    fn test_environment_contract() {
        let env = spec(ExecutionRequest::Interactive).env();
        for key in ["TERM", "COLORTERM", "PWD", "COLUMNS", "LINES"] {
            assert!(env.iter().any(|(k, _)| *k == key), "missing {}", key);
        }
    }

    #[test]
    fn test_output_drained_after_exit() {
        let (output, status) = run(ExecutionRequest::Command(
            "printf 'one\\n'; printf 'two\\n'".to_string(),
        ));
        assert!(status.success());
        assert!(output.contains("one"));
        assert!(output.contains("two"));
    }

    #[test]
    fn test_child_sees_a_terminal() {
        let (output, _) = run(ExecutionRequest::Command(
            "if [ -t 0 ] && [ -t 1 ]; then echo tty; else echo notty; fi; echo $TERM".to_string(),
        ));
        assert!(output.contains("tty"));
        assert!(!output.contains("notty"));
        assert!(output.contains("xterm-256color"));
    }

    #[test]
    fn test_exit_status_reported() {
        let (_, status) = run(ExecutionRequest::Command("exit 3".to_string()));
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn test_spawn_failure() {
        let mut s = spec(ExecutionRequest::Command("true".to_string()));
        s.shell = PathBuf::from("/nonexistent/shell");
        let pty = PtyPair::allocate(s.size).expect("allocate");
        let err = spawn(&s, pty).err().expect("spawn must fail");
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[test]
    fn test_write_input_reaches_child() {
        let spec = spec(ExecutionRequest::Command("read line; echo got:$line".to_string()));
        let pty = PtyPair::allocate(spec.size).expect("allocate");
        let spawned = spawn(&spec, pty).expect("spawn");
        spawned.handle.write_input(b"hello\n").expect("write");
        let mut output = Vec::new();
        let status = spawned
            .pump
            .wait_with_output(|chunk| output.extend_from_slice(chunk))
            .expect("wait");
        assert!(status.success());
        assert!(String::from_utf8_lossy(&output).contains("got:hello"));
    }

    #[test]
    fn test_terminate_releases_master() {
        let spec = spec(ExecutionRequest::Command("sleep 30".to_string()));
        let pty = PtyPair::allocate(spec.size).expect("allocate");
        let SpawnedProcess { handle, pump } = spawn(&spec, pty).expect("spawn");
        let worker = std::thread::spawn(move || pump.wait_with_output(|_| {}));
        handle.terminate();
        let status = worker.join().expect("join").expect("wait");
        assert!(!status.success());
        let master = handle.master_ref();
        drop(handle);
        assert!(master.upgrade().is_none());
    }

    #[test]
    fn test_terminate_only_flags_the_pump() {
        use nix::sys::signal::kill;

        let spec = spec(ExecutionRequest::Command("sleep 30".to_string()));
        let pty = PtyPair::allocate(spec.size).expect("allocate");
        let SpawnedProcess { handle, pump } = spawn(&spec, pty).expect("spawn");
        let pid = Pid::from_raw(handle.pid() as i32);

        handle.terminate();
        // Nothing is signalled until the pump, which holds the unreaped
        // child, acts on the flag
        thread::sleep(Duration::from_millis(100));
        assert!(kill(pid, None).is_ok());

        let status = pump.wait_with_output(|_| {}).expect("wait");
        assert!(!status.success());
        assert!(kill(pid, None).is_err());
    }

    #[test]
    fn test_exit_detected_while_background_job_writes() {
        let started = Instant::now();
        let (output, status) = run(ExecutionRequest::Command(
            "(trap '' HUP; i=0; while [ $i -lt 500 ]; do echo x; sleep 0.01; i=$((i+1)); done) & \
             echo started; exit 3"
                .to_string(),
        ));
        assert_eq!(status.code(), Some(3));
        assert!(output.contains("started"));
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "pump held by background writer for {:?}",
            started.elapsed()
        );
    }
}
