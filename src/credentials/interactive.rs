//! Terminal prompts for SSH passwords and destructive confirmations.
//!
//! The credential store only talks to the [`PasswordPrompt`] trait so the
//! engine can run headless (and tests can script answers). [`TerminalPrompt`]
//! is the dialoguer-backed implementation used by the CLI.
//!
//! An empty password counts as a cancel. When stdin is not a terminal no
//! prompt is shown and every question is answered "no".

use std::fmt;
use std::io::IsTerminal;

use colored::Colorize;
use dialoguer::{Confirm, Password, theme::ColorfulTheme};

// =============================================================================
// Prompt trait
// =============================================================================

/// Source of interactively supplied secrets.
pub trait PasswordPrompt: Send + Sync {
    /// Ask for the password of `user@host`. `None` means the operator
    /// declined or no terminal is available.
    fn ask_password(&self, host: &str, user: &str) -> Result<Option<String>, InteractiveError>;

    /// Ask whether a freshly entered password should be remembered.
    fn confirm_store(&self, host: &str, user: &str) -> Result<bool, InteractiveError>;
}

/// Never prompts. Used for non-interactive runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrompt;

impl PasswordPrompt for NoPrompt {
    fn ask_password(&self, _host: &str, _user: &str) -> Result<Option<String>, InteractiveError> {
        Ok(None)
    }

    fn confirm_store(&self, _host: &str, _user: &str) -> Result<bool, InteractiveError> {
        Ok(false)
    }
}

/// dialoguer prompts on the controlling terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

impl TerminalPrompt {
    fn interactive() -> bool {
        std::io::stdin().is_terminal() && std::io::stderr().is_terminal()
    }
}

impl PasswordPrompt for TerminalPrompt {
    fn ask_password(&self, host: &str, user: &str) -> Result<Option<String>, InteractiveError> {
        if !Self::interactive() {
            tracing::debug!(host, "no terminal; skipping password prompt");
            return Ok(None);
        }

        let password = Password::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Password for {}", format!("{user}@{host}").cyan()))
            .allow_empty_password(true)
            .interact()
            .map_err(|e| InteractiveError::IoError(e.to_string()))?;

        Ok(if password.is_empty() {
            None
        } else {
            Some(password)
        })
    }

    fn confirm_store(&self, host: &str, user: &str) -> Result<bool, InteractiveError> {
        if !Self::interactive() {
            return Ok(false);
        }
        confirm_action(&format!("Remember the password for {user}@{host}?"), false)
    }
}

// =============================================================================
// Confirmation Prompts
// =============================================================================

/// Ask for confirmation before a destructive operation. Escape counts as a
/// cancel.
pub fn confirm_action(message: &str, default: bool) -> Result<bool, InteractiveError> {
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(message)
        .default(default)
        .interact_opt()
        .map_err(|e| InteractiveError::IoError(e.to_string()))?
        .ok_or(InteractiveError::Cancelled)
}

/// Ask for confirmation with a short explanation printed first.
pub fn confirm_with_details(
    action: &str,
    details: &[&str],
    default: bool,
) -> Result<bool, InteractiveError> {
    eprintln!();
    eprintln!("{}", action.bold());
    for detail in details {
        eprintln!("  • {}", detail);
    }
    eprintln!();

    confirm_action("Proceed?", default)
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from interactive prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractiveError {
    /// User cancelled the prompt
    Cancelled,
    /// IO error during prompt
    IoError(String),
}

impl fmt::Display for InteractiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InteractiveError::Cancelled => write!(f, "Operation cancelled by user"),
            InteractiveError::IoError(msg) => write!(f, "IO error: {}", msg),
        }
    }
}

impl std::error::Error for InteractiveError {}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interactive_error_display() {
        let cancelled = InteractiveError::Cancelled;
        let io_error = InteractiveError::IoError("test error".into());

        assert!(cancelled.to_string().contains("cancelled"));
        assert!(io_error.to_string().contains("test error"));
    }

    #[test]
    fn test_no_prompt_declines() {
        assert_eq!(NoPrompt.ask_password("h", "u").unwrap(), None);
        assert!(!NoPrompt.confirm_store("h", "u").unwrap());
    }
}
