//! Prompt rendering and output heuristics
//!
//! Both heuristics here look at plain text only and know nothing about
//! sessions, so they can be re-evaluated after any scrollback mutation.

use std::path::Path;

/// Keywords that mark a credential prompt, matched case-insensitively
const SECRET_KEYWORDS: &[&str] = &[
    "password",
    "passphrase",
    "passcode",
    "enter pin",
    "pin for",
    "verification code",
];

/// Prefixes of commands that ask for elevated privileges
const ELEVATION_PREFIXES: &[&str] = &["sudo ", "doas "];

pub const ELEVATION_HINT: &str = "Elevated commands need a fully interactive terminal to ask for a password. \
Run them in a terminal application, or configure passwordless access for this command.";

/// Working directory as shown in the prompt, with `$HOME` folded to `~`
pub fn display_dir(cwd: &Path, home: Option<&Path>) -> String {
    if let Some(home) = home {
        if cwd == home {
            return "~".to_string();
        }
        if let Ok(rest) = cwd.strip_prefix(home) {
            return format!("~/{}", rest.display());
        }
    }
    cwd.display().to_string()
}

/// Prompt line written after every command
pub fn render_prompt(cwd: &Path, home: Option<&Path>, symbol: &str) -> String {
    format!("{} {} ", display_dir(cwd, home), symbol)
}

/// Does this line look like a request for a password or similar secret?
pub fn is_secret_prompt(line: &str) -> bool {
    let line = line.trim_end();
    if !line.ends_with(':') {
        return false;
    }
    let lower = line.to_lowercase();
    SECRET_KEYWORDS.iter().any(|k| lower.contains(k))
}

pub fn is_elevated(command: &str) -> bool {
    let command = command.trim_start();
    ELEVATION_PREFIXES.iter().any(|p| command.starts_with(p))
}

/// Best-effort guess that an elevation prompt failed without a word
///
/// A command that legitimately prints nothing and fails would trigger it
/// too; the hint is advisory.
pub fn needs_elevation_hint(command: &str, success: bool, produced_output: bool) -> bool {
    is_elevated(command) && !success && !produced_output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_dir() {
        let home = Path::new("/home/u");
        assert_eq!(display_dir(Path::new("/home/u"), Some(home)), "~");
        assert_eq!(display_dir(Path::new("/home/u/src"), Some(home)), "~/src");
        assert_eq!(display_dir(Path::new("/tmp"), Some(home)), "/tmp");
        assert_eq!(display_dir(Path::new("/tmp"), None), "/tmp");
    }

    #[test]
    fn test_render_prompt() {
        assert_eq!(render_prompt(Path::new("/tmp"), None, "$"), "/tmp $ ");
    }

    #[test]
    fn test_secret_prompts() {
        assert!(is_secret_prompt("[sudo] password for u:"));
        assert!(is_secret_prompt("Password: "));
        assert!(is_secret_prompt("Enter passphrase for key '/home/u/.ssh/id_ed25519':"));
        assert!(is_secret_prompt("u@host's PASSWORD:"));
        assert!(!is_secret_prompt("password changed successfully"));
        assert!(!is_secret_prompt("Name:"));
    }

    #[test]
    fn test_elevation() {
        assert!(is_elevated("sudo ls"));
        assert!(is_elevated("  doas reboot"));
        assert!(!is_elevated("sudoku"));
    }

    #[test]
    fn test_elevation_hint() {
        assert!(needs_elevation_hint("sudo apt update", false, false));
        assert!(!needs_elevation_hint("sudo apt update", true, false));
        assert!(!needs_elevation_hint("sudo apt update", false, true));
        assert!(!needs_elevation_hint("false", false, false));
    }
}
