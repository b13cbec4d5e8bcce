//! Stored SSH passwords and the prompt that fills them in.

pub mod interactive;
pub mod store;

pub use interactive::{
    InteractiveError, NoPrompt, PasswordPrompt, TerminalPrompt, confirm_action,
    confirm_with_details,
};
pub use store::{CredentialStore, FileSecretBackend, MemorySecretBackend, SecretBackend, SecretError};
