//! Cached SSH passwords keyed by `user@host`.
//!
//! The store is consulted before prompting. Storage sits behind
//! [`SecretBackend`]; the CLI uses a JSON file readable only by the owner,
//! tests use memory.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use super::interactive::{InteractiveError, NoPrompt, PasswordPrompt};

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("failed to access secret store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("secret store {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("password prompt failed: {0}")]
    Prompt(#[from] InteractiveError),
}

/// Key/value storage for secrets.
pub trait SecretBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SecretError>;
    fn set(&self, key: &str, secret: &str) -> Result<(), SecretError>;
    /// Returns whether an entry was removed.
    fn delete(&self, key: &str) -> Result<bool, SecretError>;
}

#[derive(Debug, Default)]
pub struct MemorySecretBackend {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemorySecretBackend {
    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SecretBackend for MemorySecretBackend {
    fn get(&self, key: &str) -> Result<Option<String>, SecretError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, secret: &str) -> Result<(), SecretError> {
        self.entries().insert(key.to_string(), secret.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, SecretError> {
        Ok(self.entries().remove(key).is_some())
    }
}

/// JSON object on disk, rewritten atomically with mode 0600.
#[derive(Debug)]
pub struct FileSecretBackend {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSecretBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> SecretError {
        SecretError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn load(&self) -> Result<BTreeMap<String, String>, SecretError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(self.io_err(e)),
        };
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|source| SecretError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> Result<(), SecretError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;

        let json = serde_json::to_vec_pretty(entries).map_err(|source| SecretError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| self.io_err(e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))
                .map_err(|e| self.io_err(e))?;
        }
        tmp.write_all(&json).map_err(|e| self.io_err(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_err(e.error))?;
        Ok(())
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SecretBackend for FileSecretBackend {
    fn get(&self, key: &str) -> Result<Option<String>, SecretError> {
        let _guard = self.guard();
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, secret: &str) -> Result<(), SecretError> {
        let _guard = self.guard();
        let mut entries = self.load()?;
        entries.insert(key.to_string(), secret.to_string());
        self.save(&entries)
    }

    fn delete(&self, key: &str) -> Result<bool, SecretError> {
        let _guard = self.guard();
        let mut entries = self.load()?;
        if entries.remove(key).is_none() {
            return Ok(false);
        }
        self.save(&entries)?;
        Ok(true)
    }
}

/// Password cache plus the prompt used when the cache misses.
pub struct CredentialStore {
    backend: Box<dyn SecretBackend>,
    prompt: Box<dyn PasswordPrompt>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}

impl CredentialStore {
    pub fn new(
        backend: impl SecretBackend + 'static,
        prompt: impl PasswordPrompt + 'static,
    ) -> Self {
        Self {
            backend: Box::new(backend),
            prompt: Box::new(prompt),
        }
    }

    /// Memory-backed, never prompts.
    pub fn in_memory() -> Self {
        Self::new(MemorySecretBackend::default(), NoPrompt)
    }

    pub fn key(host: &str, user: &str) -> String {
        format!("{user}@{host}")
    }

    pub fn get(&self, host: &str, user: &str) -> Result<Option<String>, SecretError> {
        self.backend.get(&Self::key(host, user))
    }

    pub fn set(&self, host: &str, user: &str, password: &str) -> Result<(), SecretError> {
        self.backend.set(&Self::key(host, user), password)?;
        tracing::info!(host, user, "stored password");
        Ok(())
    }

    pub fn delete(&self, host: &str, user: &str) -> Result<bool, SecretError> {
        let removed = self.backend.delete(&Self::key(host, user))?;
        if removed {
            tracing::info!(host, user, "deleted stored password");
        }
        Ok(removed)
    }

    pub fn has(&self, host: &str, user: &str) -> Result<bool, SecretError> {
        Ok(self.get(host, user)?.is_some())
    }

    /// Ask for a password and offer to keep it. `None` means the operator
    /// cancelled; callers must treat that as "no credentials", not as an
    /// empty password. A failed save still returns the password.
    pub fn prompt_and_optionally_store(
        &self,
        host: &str,
        user: &str,
    ) -> Result<Option<String>, SecretError> {
        let Some(password) = self.prompt.ask_password(host, user)? else {
            tracing::info!(host, user, "password prompt cancelled");
            return Ok(None);
        };

        match self.prompt.confirm_store(host, user) {
            Ok(true) => {
                if let Err(e) = self.set(host, user, &password) {
                    tracing::warn!(host, user, error = %e, "could not store password");
                }
            }
            Ok(false) | Err(InteractiveError::Cancelled) => {}
            Err(e) => tracing::warn!(host, user, error = %e, "store confirmation failed"),
        }
        Ok(Some(password))
    }
}
