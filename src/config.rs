//! Profiles and engine settings.
//!
//! Settings live in `~/.config/rmsync/config.toml` (or the platform
//! equivalent) and are consumed read-only:
//!
//! ```toml
//! auto_start = "app"
//!
//! [engine]
//! quiet_window_ms = 200
//! max_retries = 3
//!
//! [[profiles]]
//! alias = "app"
//! remote_user = "deploy"
//! remote_host = "prod.example.com"
//! remote_dir = "/var/www/app"
//! local_dir = "/home/me/app"
//! exclude = [".git", "node_modules"]
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "RMSYNC_CONFIG";

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Errors from loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Profile is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid SSH port {0}: must be between 1 and 65535")]
    InvalidPort(u16),

    #[error("Field '{field}' must not start with '-': {value}")]
    LeadingDash { field: &'static str, value: String },

    #[error("Local directory does not exist: {0}")]
    LocalDirMissing(PathBuf),

    #[error("Local path is not a directory: {0}")]
    LocalDirNotADirectory(PathBuf),

    #[error("Local directory is not readable: {path}: {source}")]
    LocalDirUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Direction '{0}' is not supported for live sync; use `rmsync pull` instead")]
    UnsupportedDirection(SyncDirection),

    #[error("Duplicate profile alias '{0}'")]
    DuplicateAlias(String),

    #[error("auto_start refers to unknown profile '{0}'")]
    UnknownAutoStart(String),

    #[error("No profile named '{0}'")]
    UnknownProfile(String),

    #[error("Could not determine a configuration directory for this platform")]
    NoConfigDir,
}

/// Which way changes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    #[default]
    LocalToRemote,
    RemoteToLocal,
    Bidirectional,
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalToRemote => write!(f, "local_to_remote"),
            Self::RemoteToLocal => write!(f, "remote_to_local"),
            Self::Bidirectional => write!(f, "bidirectional"),
        }
    }
}

/// Conflict policy. Local always wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    LocalWins,
}

/// One local/remote directory pairing.
///
/// Profiles are values: the orchestrator holds a clone for the lifetime of a
/// session and updates go through the `with_*` builders, which return a new
/// profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub alias: String,
    pub remote_user: String,
    pub remote_host: String,
    pub remote_dir: String,
    pub local_dir: PathBuf,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// Private key passed to ssh with `-i`; default key locations are used
    /// when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub direction: SyncDirection,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl Profile {
    pub fn new(
        alias: impl Into<String>,
        remote_user: impl Into<String>,
        remote_host: impl Into<String>,
        remote_dir: impl Into<String>,
        local_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            alias: alias.into(),
            remote_user: remote_user.into(),
            remote_host: remote_host.into(),
            remote_dir: remote_dir.into(),
            local_dir: local_dir.into(),
            ssh_port: DEFAULT_SSH_PORT,
            identity_file: None,
            direction: SyncDirection::default(),
            conflict_policy: ConflictPolicy::default(),
            exclude: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    pub fn with_exclude<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    /// `user@host`, as used by ssh and rsync.
    pub fn destination_host(&self) -> String {
        format!("{}@{}", self.remote_user, self.remote_host)
    }

    /// Field-level checks that need no filesystem access.
    pub fn validate_fields(&self) -> Result<(), ConfigError> {
        let required: [(&'static str, &str); 4] = [
            ("alias", &self.alias),
            ("remote_user", &self.remote_user),
            ("remote_host", &self.remote_host),
            ("remote_dir", &self.remote_dir),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(name));
            }
        }
        if self.local_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("local_dir"));
        }
        // These end up as transfer and ssh arguments.
        let local_dir = self.local_dir.to_string_lossy();
        for (field, value) in [
            ("remote_user", self.remote_user.as_str()),
            ("remote_host", self.remote_host.as_str()),
            ("local_dir", local_dir.as_ref()),
        ] {
            if value.trim_start().starts_with('-') {
                return Err(ConfigError::LeadingDash {
                    field,
                    value: value.to_string(),
                });
            }
        }
        if self.ssh_port == 0 {
            return Err(ConfigError::InvalidPort(self.ssh_port));
        }
        if self.direction == SyncDirection::RemoteToLocal {
            return Err(ConfigError::UnsupportedDirection(self.direction));
        }
        Ok(())
    }

    /// Full validation: fields plus local directory existence and readability.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_fields()?;

        let metadata = match fs::metadata(&self.local_dir) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::LocalDirMissing(self.local_dir.clone()));
            }
            Err(source) => {
                return Err(ConfigError::LocalDirUnreadable {
                    path: self.local_dir.clone(),
                    source,
                });
            }
        };
        if !metadata.is_dir() {
            return Err(ConfigError::LocalDirNotADirectory(self.local_dir.clone()));
        }
        fs::read_dir(&self.local_dir).map_err(|source| ConfigError::LocalDirUnreadable {
            path: self.local_dir.clone(),
            source,
        })?;

        if self.direction == SyncDirection::Bidirectional {
            tracing::warn!(
                alias = %self.alias,
                "bidirectional live sync is not implemented; mirroring local to remote only"
            );
        }
        Ok(())
    }
}

/// Tuning knobs for the orchestrator, aggregator and executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub quiet_window_ms: u64,
    pub max_retries: u32,
    pub recovery_delay_ms: u64,
    pub transfer_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub connect_attempts: u32,
    pub connect_retry_delay_ms: u64,
    pub kill_grace_ms: u64,
    pub watch_program: String,
    pub transfer_program: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            quiet_window_ms: 200,
            max_retries: 3,
            recovery_delay_ms: 5_000,
            transfer_timeout_secs: 300,
            connect_timeout_secs: 10,
            connect_attempts: 3,
            connect_retry_delay_ms: 1_000,
            kill_grace_ms: 2_000,
            watch_program: "inotifywait".into(),
            transfer_program: "rsync".into(),
        }
    }
}

impl EngineSettings {
    pub fn quiet_window(&self) -> Duration {
        Duration::from_millis(self.quiet_window_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Everything read from the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_start: Option<String>,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

impl Settings {
    /// Default config file path for this platform.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("", "", "rmsync")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Resolve the config path: explicit argument, then `RMSYNC_CONFIG`, then
    /// the platform default.
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV)
            && !path.trim().is_empty()
        {
            return Ok(PathBuf::from(path));
        }
        Self::default_path()
    }

    /// Load and validate settings. A missing file yields empty settings.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found; using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Cross-profile checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for profile in &self.profiles {
            if !seen.insert(profile.alias.as_str()) {
                return Err(ConfigError::DuplicateAlias(profile.alias.clone()));
            }
        }
        if let Some(alias) = &self.auto_start
            && !seen.contains(alias.as_str())
        {
            return Err(ConfigError::UnknownAutoStart(alias.clone()));
        }
        Ok(())
    }

    pub fn profile(&self, alias: &str) -> Result<&Profile, ConfigError> {
        self.profiles
            .iter()
            .find(|p| p.alias == alias)
            .ok_or_else(|| ConfigError::UnknownProfile(alias.to_string()))
    }

    pub fn auto_start_profile(&self) -> Option<&Profile> {
        let alias = self.auto_start.as_deref()?;
        self.profiles.iter().find(|p| p.alias == alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(local: &Path) -> Profile {
        Profile::new("app", "deploy", "prod.example.com", "/var/www/app", local)
    }

    #[test]
    fn test_parse_minimal_profile_defaults() {
        let settings = Settings::from_toml(
            r#"
[[profiles]]
alias = "app"
remote_user = "deploy"
remote_host = "prod.example.com"
remote_dir = "/var/www/app"
local_dir = "/tmp/app"
"#,
        )
        .unwrap();

        let profile = &settings.profiles[0];
        assert_eq!(profile.ssh_port, 22);
        assert_eq!(profile.direction, SyncDirection::LocalToRemote);
        assert_eq!(profile.conflict_policy, ConflictPolicy::LocalWins);
        assert!(profile.exclude.is_empty());
        assert!(settings.auto_start.is_none());
        assert_eq!(settings.engine, EngineSettings::default());
    }

    #[test]
    fn test_parse_engine_overrides() {
        let settings = Settings::from_toml(
            r#"
[engine]
quiet_window_ms = 50
max_retries = 5
"#,
        )
        .unwrap();
        assert_eq!(settings.engine.quiet_window_ms, 50);
        assert_eq!(settings.engine.max_retries, 5);
        assert_eq!(settings.engine.recovery_delay_ms, 5_000);
    }

    #[test]
    fn test_port_out_of_range_rejected_by_parser() {
        let result = Settings::from_toml(
            r#"
[[profiles]]
alias = "app"
remote_user = "deploy"
remote_host = "h"
remote_dir = "/r"
local_dir = "/l"
ssh_port = 70000
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_fields() {
        let tmp = TempDir::new().unwrap();
        assert!(sample(tmp.path()).validate_fields().is_ok());

        let mut missing = sample(tmp.path());
        missing.remote_host = "  ".into();
        assert!(matches!(
            missing.validate_fields(),
            Err(ConfigError::MissingField("remote_host"))
        ));

        let zero_port = sample(tmp.path()).with_port(0);
        assert!(matches!(
            zero_port.validate_fields(),
            Err(ConfigError::InvalidPort(0))
        ));

        for (field, profile) in [
            ("remote_user", Profile::new("app", "-n", "h", "/r", tmp.path())),
            ("remote_host", Profile::new("app", "deploy", "-oProxyCommand=x", "/r", tmp.path())),
            ("local_dir", Profile::new("app", "deploy", "h", "/r", "--delete-after")),
        ] {
            match profile.validate_fields() {
                Err(ConfigError::LeadingDash { field: rejected, .. }) => assert_eq!(rejected, field),
                other => panic!("expected {field} to be rejected, got {other:?}"),
            }
        }
        assert!(
            Profile::new("app", "deploy", "h", "/-r", tmp.path())
                .validate_fields()
                .is_ok()
        );

        let pull_only = sample(tmp.path()).with_direction(SyncDirection::RemoteToLocal);
        assert!(matches!(
            pull_only.validate_fields(),
            Err(ConfigError::UnsupportedDirection(_))
        ));
    }

    #[test]
    fn test_validate_local_dir() {
        let tmp = TempDir::new().unwrap();
        assert!(sample(tmp.path()).validate().is_ok());

        let missing = sample(&tmp.path().join("nope"));
        assert!(matches!(
            missing.validate(),
            Err(ConfigError::LocalDirMissing(_))
        ));

        let file = tmp.path().join("file.txt");
        fs::write(&file, "x").unwrap();
        assert!(matches!(
            sample(&file).validate(),
            Err(ConfigError::LocalDirNotADirectory(_))
        ));
    }

    #[test]
    fn test_settings_validation() {
        let tmp = TempDir::new().unwrap();
        let mut settings = Settings {
            profiles: vec![sample(tmp.path()), sample(tmp.path())],
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::DuplicateAlias(_))
        ));

        settings.profiles.pop();
        settings.auto_start = Some("other".into());
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::UnknownAutoStart(_))
        ));

        settings.auto_start = Some("app".into());
        assert!(settings.validate().is_ok());
        assert_eq!(settings.auto_start_profile().unwrap().alias, "app");
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings::load(&tmp.path().join("config.toml")).unwrap();
        assert!(settings.profiles.is_empty());
    }

    #[test]
    fn test_profile_lookup() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings {
            profiles: vec![sample(tmp.path())],
            ..Default::default()
        };
        assert!(settings.profile("app").is_ok());
        assert!(matches!(
            settings.profile("missing"),
            Err(ConfigError::UnknownProfile(_))
        ));
    }

    #[test]
    #[serial_test::serial]
    fn test_resolve_path_precedence() {
        let explicit = Path::new("/etc/rmsync/explicit.toml");
        // SAFETY: serialized with every other test touching the environment.
        unsafe { std::env::set_var(CONFIG_ENV, "/tmp/from-env.toml") };
        assert_eq!(Settings::resolve_path(Some(explicit)).unwrap(), explicit);
        assert_eq!(
            Settings::resolve_path(None).unwrap(),
            PathBuf::from("/tmp/from-env.toml")
        );

        unsafe { std::env::set_var(CONFIG_ENV, "  ") };
        let fallback = Settings::resolve_path(None);
        unsafe { std::env::remove_var(CONFIG_ENV) };
        if let Ok(path) = fallback {
            assert!(path.ends_with("config.toml"));
        }
    }

    #[test]
    fn test_destination_host() {
        let profile = Profile::new("a", "deploy", "prod.example.com", "/r", "/l");
        assert_eq!(profile.destination_host(), "deploy@prod.example.com");
    }
}
