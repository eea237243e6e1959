//! termshell - shell sessions on POSIX pseudo-terminals
//!
//! termshell hosts any number of shell sessions. Local sessions run each
//! command in its own PTY so colored output and `isatty` checks behave as
//! in a real terminal; remote sessions keep one SSH client alive.
//!
//! # Quick Start
//!
//! ```text
//! termshell                      # Local session with $SHELL
//! termshell -s /bin/zsh          # Local session with zsh
//! termshell --ssh deploy@build   # Remote session over SSH
//! ```
//!
//! # Commands
//!
//! | Input | Action |
//! |-------|--------|
//! | :new | Open a local session |
//! | :ssh TARGET | Open a remote session |
//! | :next / :prev | Switch session |
//! | :list | List sessions |
//! | :rename TITLE | Rename the current session |
//! | :clear | Clear scrollback (also Ctrl+L) |
//! | :close | Close the current session |
//! | :quit | Exit (also Ctrl+D on an empty line) |

#[cfg(not(unix))]
compile_error!("termshell needs a POSIX system with pseudo-terminal support");

mod config;
mod core;
mod history;
mod notify;
mod persist;
mod ui;

use std::env;
use std::io::{self, Stdout, Write};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use crossterm::cursor::MoveLeft;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::style::Print;
use crossterm::terminal::{self, Clear, ClearType};
use crossterm::queue;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Config;
use crate::core::manager::SessionManager;
use crate::core::process::Backend;
use crate::core::pty::PtySize;
use crate::core::session::{SessionEvent, SessionId, SessionState};
use crate::notify::LogNotifier;
use crate::history::{unix_now, HistoryEntry};
use crate::persist::SessionStore;
use crate::ui::SpanRenderer;

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Entries `:history` shows without a query
const HISTORY_LISTING: usize = 20;

/// Command line options; they override the config file
#[derive(Debug, Default)]
struct CliOptions {
    shell: Option<String>,
    ssh: Option<String>,
    init_config: bool,
    no_restore: bool,
}

fn print_version() {
    eprintln!("termshell {}", VERSION);
}

fn print_help() {
    eprintln!("termshell {} - shell sessions on pseudo-terminals", VERSION);
    eprintln!();
    eprintln!("Usage: termshell [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -s, --shell <PATH>      Shell for local sessions (default: $SHELL)");
    eprintln!("  --ssh <[user@]host[:port]>");
    eprintln!("                          Open a remote session");
    eprintln!("  --no-restore            Do not reopen saved sessions");
    eprintln!("  --init-config           Write the effective config to ~/.termshell/config.toml");
    eprintln!("  -v, --version           Show version");
    eprintln!("  -h, --help              Show this help");
    eprintln!();
    eprintln!("Session commands:");
    eprintln!("  :new                    Open a local session");
    eprintln!("  :ssh <target>           Open a remote session");
    eprintln!("  :next, :prev            Switch between sessions");
    eprintln!("  :list                   List sessions");
    eprintln!("  :rename <title>         Rename the current session");
    eprintln!("  :history [query]        Show command history");
    eprintln!("  :clear, Ctrl+L          Clear scrollback");
    eprintln!("  :close                  Close the current session");
    eprintln!("  :quit, Ctrl+D           Exit");
    eprintln!();
    eprintln!("Logs go to ~/.termshell/termshell.log; set RUST_LOG=debug for more.");
}

fn parse_args() -> Result<CliOptions, String> {
    let args: Vec<String> = env::args().collect();
    let mut options = CliOptions::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-s" | "--shell" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing shell argument".to_string());
                }
                options.shell = Some(args[i].clone());
            }
            "--ssh" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing ssh target".to_string());
                }
                options.ssh = Some(args[i].clone());
            }
            "--no-restore" => {
                options.no_restore = true;
            }
            "--init-config" => {
                options.init_config = true;
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(options)
}

/// Whether the host terminal advertises 24-bit color
fn host_true_color() -> bool {
    env::var("COLORTERM")
        .map(|v| matches!(v.as_str(), "truecolor" | "24bit"))
        .unwrap_or(false)
}

/// Overwrite a line holding a secret, in place
fn wipe(line: &mut String) {
    let zeros = "\0".repeat(line.len());
    line.replace_range(.., &zeros);
}

/// `:history` line: age and command
fn history_line(entry: &HistoryEntry, now: u64) -> String {
    let age = entry.age_secs(now);
    let age = match age {
        0..=59 => format!("{}s", age),
        60..=3599 => format!("{}m", age / 60),
        3600..=86399 => format!("{}h", age / 3600),
        _ => format!("{}d", age / 86400),
    };
    format!("{:>4}  {}", age, entry.command)
}

/// Log to `~/.termshell/termshell.log`, level from `RUST_LOG`
fn init_logging() {
    let log_path = config::data_dir()
        .map(|dir| dir.join("termshell.log"))
        .unwrap_or_else(|| std::path::PathBuf::from("termshell.log"));

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let options = match parse_args() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    init_logging();
    info!("termshell {} starting", VERSION);

    let mut config = Config::load();
    if options.shell.is_some() {
        config.shell = options.shell.clone();
    }

    if options.init_config {
        config
            .save()
            .map_err(anyhow::Error::msg)
            .context("could not write config")?;
        eprintln!("Wrote ~/.termshell/config.toml");
        return Ok(());
    }

    let remote = match options.ssh.as_deref() {
        Some(target) => Some(
            Backend::parse_remote(target)
                .ok_or_else(|| anyhow::anyhow!("invalid ssh target: {}", target))?,
        ),
        None => None,
    };

    let (tx, rx) = mpsc::channel();
    let manager = SessionManager::new(config, Arc::new(LogNotifier), tx);
    let store = SessionStore::default_location();

    if !options.no_restore {
        if let Some(store) = &store {
            let restored = manager.restore(&store.load());
            info!(count = restored.len(), "restored sessions");
        }
    }
    let active = match remote {
        Some(backend) => manager.open_session(backend),
        None => match manager.session_ids().first() {
            Some(&id) => id,
            None => manager.open_session(Backend::LocalShell),
        },
    };

    let mut app = App {
        manager,
        events: rx,
        store,
        active,
        renderer: SpanRenderer::new()
            .with_crlf(true)
            .with_true_color(host_true_color()),
        input: String::new(),
        history_cursor: None,
        quit: false,
    };

    match terminal::size() {
        Ok((cols, rows)) => app.manager.resize_all(PtySize { cols, rows }),
        Err(e) => warn!("could not read terminal size: {}", e),
    }

    terminal::enable_raw_mode().context("could not enter raw mode")?;
    let _guard = RawModeGuard;
    let result = app.run();

    app.save_sessions();
    app.manager.close_all();
    info!("termshell exiting");
    result
}

/// Leaves raw mode on every exit path
struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

struct App {
    manager: SessionManager,
    events: Receiver<SessionEvent>,
    store: Option<SessionStore>,
    active: SessionId,
    renderer: SpanRenderer,
    /// Line being typed
    input: String,
    /// Position while walking history with Up/Down
    history_cursor: Option<usize>,
    quit: bool,
}

impl App {
    fn run(&mut self) -> anyhow::Result<()> {
        let poll_timeout = Duration::from_millis(20);
        let mut stdout = io::stdout();

        self.renderer.invalidate();
        self.render(&mut stdout)?;

        while !self.quit {
            let mut dirty = false;
            for event in self.events.try_iter() {
                match event {
                    SessionEvent::Output(id) => dirty |= id == self.active,
                    SessionEvent::StateChanged(id, state) => {
                        info!(id = %id, ?state, "state changed");
                    }
                    SessionEvent::CommandFinished { .. } | SessionEvent::ProcessExited { .. } => {}
                }
            }
            if dirty {
                self.render(&mut stdout)?;
            }

            if event::poll(poll_timeout)? {
                match event::read()? {
                    Event::Key(key) if key.kind == KeyEventKind::Press => {
                        self.handle_key(&mut stdout, key)?;
                    }
                    Event::Resize(cols, rows) => {
                        self.manager.resize_all(PtySize { cols, rows });
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn render(&mut self, stdout: &mut Stdout) -> io::Result<()> {
        let session = match self.manager.get(self.active) {
            Ok(session) => session,
            Err(e) => {
                warn!("{}", e);
                return Ok(());
            }
        };
        let renderer = &mut self.renderer;
        session.with_scrollback(|scrollback| renderer.render(stdout, scrollback))
    }

    fn awaiting_secret(&self) -> bool {
        matches!(self.manager.state(self.active), Ok(SessionState::AwaitingSecret))
    }

    fn handle_key(&mut self, stdout: &mut Stdout, key: KeyEvent) -> anyhow::Result<()> {
        let secret = self.awaiting_secret();

        if key.modifiers.contains(KeyModifiers::CONTROL) {
            match key.code {
                KeyCode::Char('d') if self.input.is_empty() => self.quit = true,
                KeyCode::Char('c') => {
                    self.erase_input(stdout, secret)?;
                    self.input.clear();
                }
                KeyCode::Char('l') => {
                    self.erase_input(stdout, secret)?;
                    self.input.clear();
                    self.manager.clear(self.active)?;
                }
                _ => {}
            }
            return Ok(());
        }

        match key.code {
            KeyCode::Char(c) => {
                self.input.push(c);
                if !secret {
                    queue!(stdout, Print(c))?;
                    stdout.flush()?;
                }
            }
            KeyCode::Backspace => {
                if self.input.pop().is_some() && !secret {
                    queue!(stdout, MoveLeft(1), Clear(ClearType::UntilNewLine))?;
                    stdout.flush()?;
                }
            }
            KeyCode::Up | KeyCode::Down if !secret => {
                self.recall_history(stdout, key.code == KeyCode::Up)?;
            }
            KeyCode::Enter => {
                self.erase_input(stdout, secret)?;
                let mut line = std::mem::take(&mut self.input);
                self.history_cursor = None;
                if secret {
                    let delivered = self.manager.send_secret(self.active, &line);
                    wipe(&mut line);
                    if !delivered? {
                        warn!(id = %self.active, "secret was not delivered");
                    }
                } else if let Some(command) = line.trim().strip_prefix(':') {
                    self.meta_command(stdout, command)?;
                } else if !self.manager.submit(self.active, &line)? && !line.trim().is_empty() {
                    self.message(stdout, "busy: wait for the running command to finish")?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Remove the typed line from the screen; the session echoes it itself
    fn erase_input(&self, stdout: &mut Stdout, secret: bool) -> io::Result<()> {
        let width = self.input.chars().count();
        if !secret && width > 0 {
            queue!(stdout, MoveLeft(width as u16), Clear(ClearType::UntilNewLine))?;
            stdout.flush()?;
        }
        Ok(())
    }

    fn recall_history(&mut self, stdout: &mut Stdout, older: bool) -> anyhow::Result<()> {
        let history = self.manager.history(self.active)?;
        if history.is_empty() {
            return Ok(());
        }
        let next = match (self.history_cursor, older) {
            (None, true) => Some(history.len() - 1),
            (None, false) => None,
            (Some(i), true) => Some(i.saturating_sub(1)),
            (Some(i), false) if i + 1 < history.len() => Some(i + 1),
            (Some(_), false) => None,
        };
        self.erase_input(stdout, false)?;
        self.history_cursor = next;
        self.input = next.map(|i| history[i].clone()).unwrap_or_default();
        queue!(stdout, Print(&self.input))?;
        stdout.flush()?;
        Ok(())
    }

    fn meta_command(&mut self, stdout: &mut Stdout, command: &str) -> anyhow::Result<()> {
        let (name, arg) = match command.split_once(' ') {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };
        match name {
            "new" => {
                let id = self.manager.open_session(Backend::LocalShell);
                self.switch_to(stdout, id)?;
            }
            "ssh" => match Backend::parse_remote(arg) {
                Some(backend) => {
                    let id = self.manager.open_session(backend);
                    self.switch_to(stdout, id)?;
                }
                None => self.message(stdout, "usage: :ssh [user@]host[:port]")?,
            },
            "next" | "prev" => {
                let ids = self.manager.session_ids();
                if let Some(pos) = ids.iter().position(|&id| id == self.active) {
                    let len = ids.len();
                    let target = if name == "next" {
                        ids[(pos + 1) % len]
                    } else {
                        ids[(pos + len - 1) % len]
                    };
                    self.switch_to(stdout, target)?;
                }
            }
            "list" => {
                let lines: Vec<String> = self
                    .manager
                    .records()
                    .iter()
                    .map(|r| {
                        let marker = if r.id == self.active { '*' } else { ' ' };
                        let cwd = self
                            .manager
                            .current_directory(r.id)
                            .map(|p| p.display().to_string())
                            .unwrap_or_default();
                        format!("{} {} {}  {}", marker, r.id, r.title, cwd)
                    })
                    .collect();
                self.message(stdout, &lines.join("\r\n"))?;
            }
            "rename" if !arg.is_empty() => {
                self.manager.rename(self.active, arg)?;
                self.save_sessions();
            }
            "history" => {
                let session = self.manager.get(self.active)?;
                let entries = if arg.is_empty() {
                    session.recent_history(HISTORY_LISTING)
                } else {
                    session.search_history(arg)
                };
                let now = unix_now();
                let lines: Vec<String> =
                    entries.iter().rev().map(|e| history_line(e, now)).collect();
                self.message(stdout, &lines.join("\r\n"))?;
            }
            "clear" => self.manager.clear(self.active)?,
            "close" => {
                self.manager.close_session(self.active)?;
                let next = match self.manager.session_ids().first() {
                    Some(&id) => id,
                    None => self.manager.open_session(Backend::LocalShell),
                };
                self.switch_to(stdout, next)?;
            }
            "quit" | "exit" => self.quit = true,
            _ => self.message(stdout, &format!("unknown command :{}", command))?,
        }
        Ok(())
    }

    fn switch_to(&mut self, stdout: &mut Stdout, id: SessionId) -> io::Result<()> {
        info!(id = %id, "switching session");
        self.active = id;
        self.renderer.invalidate();
        self.save_sessions();
        self.render(stdout)
    }

    /// Host-side message, not part of any scrollback
    fn message(&mut self, stdout: &mut Stdout, text: &str) -> io::Result<()> {
        if !text.is_empty() {
            queue!(stdout, Print("\r\n"), Print(text), Print("\r\n"))?;
        }
        // Repeat the standing prompt below the message
        if let Ok(session) = self.manager.get(self.active) {
            let prompt = session.with_scrollback(|scrollback| scrollback.last_line());
            queue!(stdout, Print(prompt))?;
        }
        stdout.flush()
    }

    fn save_sessions(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.manager.records()) {
                error!("{}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wipe_zeroes_in_place() {
        let mut line = String::from("hunter2 ü");
        let ptr = line.as_ptr();
        let len = line.len();

        wipe(&mut line);

        assert_eq!(line.len(), len);
        assert_eq!(line.as_ptr(), ptr);
        assert!(line.bytes().all(|b| b == 0));
    }

    #[test]
    fn test_history_line_shows_age() {
        let entry = HistoryEntry {
            command: "make test".to_string(),
            timestamp: 1_000,
        };
        assert_eq!(history_line(&entry, 1_030), " 30s  make test");
        assert_eq!(history_line(&entry, 1_000 + 7_200), "  2h  make test");
        assert_eq!(history_line(&entry, 0), "  0s  make test");
    }
}
