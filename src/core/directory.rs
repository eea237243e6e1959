//! Built-in `cd` handling
//!
//! `cd` never reaches a child process: the target is resolved against the
//! session's working directory and checked on the local filesystem.

use std::fs;
use std::path::{Component, Path, PathBuf};

use super::error::{Result, ShellError};

/// Argument of a `cd` command line, `None` if it is not one
///
/// A bare `cd` yields an empty argument.
pub fn parse_cd(command: &str) -> Option<&str> {
    let trimmed = command.trim();
    if trimmed == "cd" {
        return Some("");
    }
    trimmed.strip_prefix("cd ").map(str::trim)
}

/// Resolve and validate a `cd` argument
///
/// Supports `~`, `~/...`, `-` (previous directory), absolute and relative
/// paths. The result is lexically normalized, so `..` never escapes `/`.
pub fn resolve(
    arg: &str,
    cwd: &Path,
    home: Option<&Path>,
    previous: Option<&Path>,
) -> Result<PathBuf> {
    let arg = unquote(arg);

    let target = if arg.is_empty() || arg == "~" {
        home.map(Path::to_path_buf)
            .ok_or_else(|| invalid(arg, "HOME not set"))?
    } else if arg == "-" {
        previous
            .map(Path::to_path_buf)
            .ok_or_else(|| invalid(arg, "no previous directory"))?
    } else if let Some(rest) = arg.strip_prefix("~/") {
        home.map(|h| h.join(rest))
            .ok_or_else(|| invalid(arg, "HOME not set"))?
    } else {
        let path = Path::new(arg);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        }
    };

    let target = normalize(&target);
    match fs::metadata(&target) {
        Ok(meta) if meta.is_dir() => Ok(target),
        Ok(_) => Err(invalid_path(target, "not a directory")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(invalid_path(target, "no such file or directory"))
        }
        Err(e) => Err(invalid_path(target, &e.to_string())),
    }
}

/// Collapse `.` and `..` without touching the filesystem
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if out.parent().is_some() {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push("/");
    }
    out
}

fn unquote(arg: &str) -> &str {
    for quote in ['"', '\''] {
        if arg.len() >= 2 && arg.starts_with(quote) && arg.ends_with(quote) {
            return &arg[1..arg.len() - 1];
        }
    }
    arg
}

fn invalid(arg: &str, reason: &str) -> ShellError {
    invalid_path(PathBuf::from(arg), reason)
}

fn invalid_path(path: PathBuf, reason: &str) -> ShellError {
    ShellError::DirectoryInvalid {
        path,
        reason: reason.to_string(),
    }
}
