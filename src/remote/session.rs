//! Remote session probing over SSH.
//!
//! Used before the first transfer and during recovery to answer three
//! questions: can we log in, does the remote directory exist, can we write
//! to it. Every call opens its own session; nothing is kept alive between
//! probes.

use std::fmt;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use directories::BaseDirs;
use ssh2::Session;
use thiserror::Error;

use crate::config::Profile;

/// Keys tried, in order, when the profile names no identity file.
pub const DEFAULT_KEY_NAMES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa", "id_dsa"];

/// Errors from opening or using a remote session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Could not resolve host {0}")]
    Resolve(String),

    #[error("SSH connection failed: {0}")]
    Connect(String),

    #[error("Connection timed out after {0} seconds")]
    Timeout(u64),

    #[error("SSH handshake failed: {0}")]
    Handshake(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("No usable SSH key found (tried {0})")]
    NoKeys(String),

    #[error("Remote command failed: {0}")]
    Command(String),
}

impl RemoteError {
    /// Credential problems, as opposed to reachability problems.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication(_) | Self::NoKeys(_))
    }
}

/// How to authenticate a session.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    Password(String),
    KeyFile(PathBuf),
    DefaultKeys,
}

impl Auth {
    /// Password if one was supplied, else the profile's key, else the
    /// default key list.
    pub fn for_profile(profile: &Profile, password: Option<String>) -> Self {
        match (password, &profile.identity_file) {
            (Some(password), _) => Self::Password(password),
            (None, Some(key)) => Self::KeyFile(key.clone()),
            (None, None) => Self::DefaultKeys,
        }
    }

    /// The password to hand to the transfer tool, if any.
    pub fn password(&self) -> Option<&str> {
        match self {
            Self::Password(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => write!(f, "Password(<redacted>)"),
            Self::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            Self::DefaultKeys => write!(f, "DefaultKeys"),
        }
    }
}

/// Result of a connectivity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTest {
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<RemoteError>,
}

impl ConnectionTest {
    pub fn ok(latency_ms: u64) -> Self {
        Self {
            success: true,
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    pub fn failed(error: RemoteError) -> Self {
        Self {
            success: false,
            latency_ms: None,
            error: Some(error),
        }
    }
}

/// Output of a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Set when the command never ran because the session failed.
    pub error: Option<RemoteError>,
}

impl CommandOutput {
    pub fn from_exit(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            success: exit_code == 0,
            stdout,
            stderr,
            exit_code,
            error: None,
        }
    }

    pub fn session_failed(error: RemoteError) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: error.to_string(),
            exit_code: -1,
            error: Some(error),
        }
    }
}

/// Result of [`RemoteShell::validate_setup`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupValidation {
    pub connected: bool,
    pub remote_directory_exists: bool,
    pub has_write_permission: bool,
    pub errors: Vec<String>,
}

impl SetupValidation {
    pub fn is_ok(&self) -> bool {
        self.connected && self.remote_directory_exists && self.has_write_permission
    }
}

/// Blocking remote-session operations. The orchestrator calls these from
/// `spawn_blocking`.
pub trait RemoteShell: Send + Sync + 'static {
    fn test_connection(&self, profile: &Profile, auth: &Auth) -> ConnectionTest;

    fn execute(&self, profile: &Profile, auth: &Auth, command: &str) -> CommandOutput;

    /// Connectivity, then directory existence, then a write probe. Stops at
    /// the first failed step.
    fn validate_setup(&self, profile: &Profile, auth: &Auth) -> SetupValidation {
        let mut result = SetupValidation::default();
        let remote_dir = profile.remote_dir.trim_end_matches('/');
        let remote_dir = if remote_dir.is_empty() { "/" } else { remote_dir };

        let test = self.test_connection(profile, auth);
        if !test.success {
            let error = test
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "connection failed".to_string());
            result.errors.push(error);
            return result;
        }
        result.connected = true;

        let quoted_dir = shell_words::quote(remote_dir);
        let exists = self.execute(profile, auth, &format!("test -d {quoted_dir}"));
        if !exists.success {
            result.errors.push(match exists.error {
                Some(e) => e.to_string(),
                None => format!("Remote directory does not exist: {remote_dir}"),
            });
            return result;
        }
        result.remote_directory_exists = true;

        let marker = format!("{}/{}", remote_dir.trim_end_matches('/'), write_marker_name());
        let quoted_marker = shell_words::quote(&marker);
        let probe = self.execute(
            profile,
            auth,
            &format!("touch {quoted_marker} && rm -f {quoted_marker}"),
        );
        if !probe.success {
            let detail = probe.stderr.trim();
            result.errors.push(if detail.is_empty() {
                format!("No write permission in remote directory: {remote_dir}")
            } else {
                format!("No write permission in remote directory: {remote_dir}: {detail}")
            });
            return result;
        }
        result.has_write_permission = true;
        result
    }
}

/// Unique marker file name for the write probe.
pub fn write_marker_name() -> String {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!(".rmsync-write-test-{}-{}", std::process::id(), nanos)
}

/// [`RemoteShell`] over libssh2.
#[derive(Debug, Clone)]
pub struct SshRemote {
    connect_timeout: Duration,
    ssh_dir: Option<PathBuf>,
}

impl Default for SshRemote {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl SshRemote {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ssh_dir: BaseDirs::new().map(|dirs| dirs.home_dir().join(".ssh")),
        }
    }

    /// Look for default keys somewhere other than `~/.ssh`.
    pub fn with_ssh_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ssh_dir = Some(dir.into());
        self
    }

    /// Default key paths that exist on disk, in preference order.
    pub fn default_keys(&self) -> Vec<PathBuf> {
        let Some(dir) = &self.ssh_dir else {
            return Vec::new();
        };
        DEFAULT_KEY_NAMES
            .iter()
            .map(|name| dir.join(name))
            .filter(|path| path.is_file())
            .collect()
    }

    fn open(&self, profile: &Profile, auth: &Auth) -> Result<Session, RemoteError> {
        let timeout_secs = self.connect_timeout.as_secs();
        let addr = (profile.remote_host.as_str(), profile.ssh_port)
            .to_socket_addrs()
            .map_err(|e| RemoteError::Resolve(format!("{}: {e}", profile.remote_host)))?
            .next()
            .ok_or_else(|| RemoteError::Resolve(profile.remote_host.clone()))?;

        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                RemoteError::Timeout(timeout_secs)
            } else {
                RemoteError::Connect(format!("{addr}: {e}"))
            }
        })?;

        let mut session = Session::new().map_err(|e| RemoteError::Handshake(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(self.connect_timeout.as_millis()).unwrap_or(u32::MAX));
        session
            .handshake()
            .map_err(|e| RemoteError::Handshake(e.to_string()))?;

        self.authenticate(&session, profile, auth)?;
        Ok(session)
    }

    fn authenticate(&self, session: &Session, profile: &Profile, auth: &Auth) -> Result<(), RemoteError> {
        let user = profile.remote_user.as_str();
        match auth {
            Auth::Password(password) => session
                .userauth_password(user, password)
                .map_err(|e| RemoteError::Authentication(e.to_string()))?,
            Auth::KeyFile(key) => try_key(session, user, key)?,
            Auth::DefaultKeys => {
                let keys = self.default_keys();
                if keys.is_empty() {
                    return Err(RemoteError::NoKeys(DEFAULT_KEY_NAMES.join(", ")));
                }
                let mut last_error = None;
                for key in &keys {
                    match try_key(session, user, key) {
                        Ok(()) => {
                            last_error = None;
                            break;
                        }
                        Err(e) => {
                            tracing::debug!(key = %key.display(), error = %e, "key rejected");
                            last_error = Some(e);
                        }
                    }
                }
                if let Some(e) = last_error {
                    return Err(e);
                }
            }
        }

        if session.authenticated() {
            Ok(())
        } else {
            Err(RemoteError::Authentication(format!(
                "server did not accept credentials for {user}"
            )))
        }
    }
}

fn try_key(session: &Session, user: &str, key: &Path) -> Result<(), RemoteError> {
    session
        .userauth_pubkey_file(user, None, key, None)
        .map_err(|e| RemoteError::Authentication(format!("{}: {e}", key.display())))
}

impl RemoteShell for SshRemote {
    fn test_connection(&self, profile: &Profile, auth: &Auth) -> ConnectionTest {
        let start = Instant::now();
        match self.open(profile, auth) {
            Ok(_session) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                tracing::debug!(host = %profile.remote_host, latency_ms, "connection test passed");
                ConnectionTest::ok(latency_ms)
            }
            Err(e) => {
                tracing::warn!(host = %profile.remote_host, error = %e, "connection test failed");
                ConnectionTest::failed(e)
            }
        }
    }

    fn execute(&self, profile: &Profile, auth: &Auth, command: &str) -> CommandOutput {
        let session = match self.open(profile, auth) {
            Ok(s) => s,
            Err(e) => return CommandOutput::session_failed(e),
        };

        let run = || -> Result<CommandOutput, RemoteError> {
            let ssh_err = |e: ssh2::Error| RemoteError::Command(e.to_string());
            let mut channel = session.channel_session().map_err(ssh_err)?;
            channel.exec(command).map_err(ssh_err)?;

            session.set_blocking(false);
            let drained = drain_streams(&mut channel.stream(0), &mut channel.stderr());
            session.set_blocking(true);
            let (stdout, stderr) =
                drained.map_err(|e| RemoteError::Command(format!("reading output: {e}")))?;

            channel.wait_close().map_err(ssh_err)?;
            let exit_code = channel.exit_status().map_err(ssh_err)?;
            Ok(CommandOutput::from_exit(
                exit_code,
                String::from_utf8_lossy(&stdout).into_owned(),
                String::from_utf8_lossy(&stderr).into_owned(),
            ))
        };

        match run() {
            Ok(output) => {
                tracing::debug!(host = %profile.remote_host, command, exit_code = output.exit_code, "remote command finished");
                output
            }
            Err(e) => CommandOutput::session_failed(e),
        }
    }
}

/// Read two non-blocking streams to EOF, alternating between them so a
/// chatty stderr cannot stall stdout behind a full window.
fn drain_streams(stdout: &mut impl Read, stderr: &mut impl Read) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let (mut out_done, mut err_done) = (false, false);
    let mut buf = [0u8; 8192];

    while !(out_done && err_done) {
        let mut progressed = false;
        for (stream, sink, done) in [
            (&mut *stdout as &mut dyn Read, &mut out, &mut out_done),
            (&mut *stderr as &mut dyn Read, &mut err, &mut err_done),
        ] {
            if *done {
                continue;
            }
            match stream.read(&mut buf) {
                Ok(0) => *done = true,
                Ok(n) => {
                    sink.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if !progressed && !(out_done && err_done) {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
    Ok((out, err))
}
