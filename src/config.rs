//! Configuration for termshell.
//!
//! Settings are read from `~/.termshell/config.toml`; every key is optional
//! and falls back to its default:
//!
//! ```toml
//! # Shell used for commands (default: $SHELL, then /bin/sh)
//! shell = "/bin/zsh"
//! # Run commands as `shell -l -c ...`
//! login_shell = true
//! # SSH client used for remote sessions
//! ssh_path = "ssh"
//! # Scrollback capacity in characters
//! scrollback_limit = 50000
//!
//! [terminal]
//! columns = 120
//! rows = 40
//! term = "xterm-256color"
//! color_term = "truecolor"
//!
//! [session]
//! banner = "termshell"
//! prompt_symbol = "$"
//! # Notify when a command running longer than this finishes
//! notify_after_secs = 10
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::pty::PtySize;
use crate::core::scrollback::DEFAULT_SCROLLBACK_LIMIT;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shell executable; `None` means `$SHELL` or `/bin/sh`
    pub shell: Option<String>,
    pub login_shell: bool,
    pub ssh_path: String,
    pub scrollback_limit: usize,
    pub terminal: TerminalConfig,
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            login_shell: true,
            ssh_path: "ssh".to_string(),
            scrollback_limit: DEFAULT_SCROLLBACK_LIMIT,
            terminal: TerminalConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// What children are told about their terminal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub columns: u16,
    pub rows: u16,
    pub term: String,
    pub color_term: String,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            columns: 120,
            rows: 40,
            term: "xterm-256color".to_string(),
            color_term: "truecolor".to_string(),
        }
    }
}

/// Session presentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub banner: String,
    pub prompt_symbol: String,
    pub notify_after_secs: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            banner: format!("termshell {}", env!("CARGO_PKG_VERSION")),
            prompt_symbol: "$".to_string(),
            notify_after_secs: Some(10),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load() -> Self {
        match Self::get_config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load from `path`, falling back to defaults on any problem
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => match Self::from_toml(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Ignoring invalid config {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Could not read config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<(), String> {
        if let Some(path) = Self::get_config_path() {
            let content = toml::to_string_pretty(self)
                .map_err(|e| format!("Failed to serialize config: {}", e))?;
            fs::write(&path, content).map_err(|e| format!("Failed to write config: {}", e))?;
            Ok(())
        } else {
            Err("Could not determine config path".to_string())
        }
    }

    fn get_config_path() -> Option<PathBuf> {
        data_dir().map(|dir| dir.join("config.toml"))
    }

    /// Shell to run commands with
    pub fn shell_path(&self) -> PathBuf {
        let shell = self
            .shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string());
        crate::core::process::resolve_shell(&shell)
    }

    pub fn pty_size(&self) -> PtySize {
        PtySize {
            cols: self.terminal.columns,
            rows: self.terminal.rows,
        }
    }
}

/// `~/.termshell`, created on first use
pub fn data_dir() -> Option<PathBuf> {
    let dir = home_dir()?.join(".termshell");
    if !dir.exists() {
        let _ = fs::create_dir_all(&dir);
    }
    Some(dir)
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn test_partial_override() {
        let config = Config::from_toml(
            r#"
            shell = "/bin/bash"
            scrollback_limit = 1000

            [terminal]
            columns = 100

            [session]
            prompt_symbol = "%"
            "#,
        )
        .unwrap();
        assert_eq!(config.shell.as_deref(), Some("/bin/bash"));
        assert_eq!(config.scrollback_limit, 1000);
        assert_eq!(config.terminal.columns, 100);
        assert_eq!(config.terminal.rows, 40);
        assert_eq!(config.session.prompt_symbol, "%");
        assert!(config.login_shell);
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "scrollback_limit = \"lots\"").unwrap();
        assert_eq!(Config::load_from(&path), Config::default());
    }

    #[test]
    fn test_explicit_shell_path() {
        let config = Config {
            shell: Some("/bin/sh".to_string()),
            ..Config::default()
        };
        assert_eq!(config.shell_path(), PathBuf::from("/bin/sh"));
    }
}
