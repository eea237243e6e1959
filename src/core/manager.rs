//! Session collection
//!
//! Owns every open [`Session`] in display order and hands out identifiers.
//! Dependencies are injected through [`SessionManager::new`]; there is no
//! global registry.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use super::error::{Result, ShellError};
use super::process::Backend;
use super::pty::PtySize;
use super::session::{Session, SessionContext, SessionEvent, SessionId, SessionState};
use crate::config::{home_dir, Config};
use crate::notify::Notifier;
use crate::persist::SessionRecord;

pub struct SessionManager {
    sessions: Mutex<Vec<Session>>,
    next_id: AtomicU64,
    ctx: Arc<SessionContext>,
}

impl SessionManager {
    pub fn new(config: Config, notifier: Arc<dyn Notifier>, events: Sender<SessionEvent>) -> Self {
        let shell = config.shell_path();
        info!(shell = %shell.display(), "session manager ready");
        Self {
            sessions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            ctx: Arc::new(SessionContext {
                config,
                shell,
                home: home_dir(),
                notifier,
                events,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a session titled after its backend
    pub fn open_session(&self, backend: Backend) -> SessionId {
        let title = backend.title();
        self.open_with_title(backend, title)
    }

    pub fn open_with_title(&self, backend: Backend, title: String) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.insert(id, title, backend)
    }

    fn insert(&self, id: SessionId, title: String, backend: Backend) -> SessionId {
        let session = Session::new(id, title, backend, self.initial_cwd(), Arc::clone(&self.ctx));
        session.start();
        info!(id = %id, title = %session.title(), "opened session");
        self.lock().push(session);
        id
    }

    /// Home if it exists, else the process working directory
    fn initial_cwd(&self) -> PathBuf {
        self.ctx
            .home
            .clone()
            .filter(|home| home.is_dir())
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    /// Remove a session and tear down its process
    pub fn close_session(&self, id: SessionId) -> Result<()> {
        let session = {
            let mut sessions = self.lock();
            let index = sessions
                .iter()
                .position(|s| s.id() == id)
                .ok_or(ShellError::UnknownSession(id))?;
            sessions.remove(index)
        };
        // Outside the collection lock: close joins the worker thread
        session.close();
        info!(id = %id, "closed session");
        Ok(())
    }

    /// Close every session
    pub fn close_all(&self) {
        let sessions = std::mem::take(&mut *self.lock());
        for session in sessions {
            session.close();
        }
    }

    pub fn get(&self, id: SessionId) -> Result<Session> {
        self.lock()
            .iter()
            .find(|s| s.id() == id)
            .cloned()
            .ok_or(ShellError::UnknownSession(id))
    }

    pub fn submit(&self, id: SessionId, command: &str) -> Result<bool> {
        Ok(self.get(id)?.submit(command))
    }

    pub fn send_secret(&self, id: SessionId, secret: &str) -> Result<bool> {
        Ok(self.get(id)?.send_secret(secret))
    }

    /// Plain text of the session's scrollback
    #[allow(dead_code)]
    pub fn read_scrollback(&self, id: SessionId) -> Result<String> {
        Ok(self.get(id)?.contents())
    }

    pub fn current_directory(&self, id: SessionId) -> Result<PathBuf> {
        Ok(self.get(id)?.cwd())
    }

    pub fn state(&self, id: SessionId) -> Result<SessionState> {
        Ok(self.get(id)?.state())
    }

    pub fn clear(&self, id: SessionId) -> Result<()> {
        self.get(id)?.clear();
        Ok(())
    }

    /// Apply a new host window size to every session
    pub fn resize_all(&self, size: PtySize) {
        for session in self.lock().iter() {
            session.resize(size);
        }
    }

    pub fn history(&self, id: SessionId) -> Result<Vec<String>> {
        Ok(self.get(id)?.history())
    }

    pub fn rename(&self, id: SessionId, title: &str) -> Result<()> {
        self.get(id)?.set_title(title);
        Ok(())
    }

    /// Ids in display order
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.lock().iter().map(Session::id).collect()
    }

    /// Snapshot for persistence
    pub fn records(&self) -> Vec<SessionRecord> {
        self.lock()
            .iter()
            .map(|s| SessionRecord {
                id: s.id(),
                title: s.title(),
                remote: s.backend().remote_target(),
            })
            .collect()
    }

    /// Recreate saved sessions with empty scrollback
    ///
    /// Records whose id is already open, or whose remote target no longer
    /// parses, are skipped. Fresh ids continue after the largest restored.
    pub fn restore(&self, records: &[SessionRecord]) -> Vec<SessionId> {
        let mut restored = Vec::new();
        for record in records {
            if self.get(record.id).is_ok() {
                warn!(id = %record.id, "session already open, not restoring");
                continue;
            }
            let backend = match record.remote.as_deref() {
                None => Backend::LocalShell,
                Some(target) => match Backend::parse_remote(target) {
                    Some(backend) => backend,
                    None => {
                        warn!(id = %record.id, remote = target, "invalid remote target, not restoring");
                        continue;
                    }
                },
            };
            self.next_id.fetch_max(record.id.0 + 1, Ordering::SeqCst);
            restored.push(self.insert(record.id, record.title.clone(), backend));
        }
        restored
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
