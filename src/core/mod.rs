//! Core shell session components.
//!
//! - **pty**: POSIX pseudo-terminal allocation
//! - **process**: child spawning on a PTY, output pump, cancellation
//! - **term**: escape sequence interpreter producing styled spans
//! - **scrollback**: bounded span buffer
//! - **session**: per-session state machine
//! - **manager**: the collection of open sessions
//!
//! # Architecture
//!
//! ```text
//! SessionManager
//! └── Session (one per tab)
//!     ├── Scrollback (styled spans, capped)
//!     ├── CommandHistory
//!     └── attached process
//!         ├── ProcessHandle (input, resize, cancel)
//!         └── OutputPump (signals, reaps) ──► interpret ──► Scrollback
//! ```

pub mod directory;
pub mod error;
pub mod manager;
pub mod process;
pub mod prompt;
pub mod pty;
pub mod scrollback;
pub mod session;
pub mod term;
