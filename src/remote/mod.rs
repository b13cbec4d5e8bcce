//! Remote session probes run outside of transfers: connectivity, directory
//! existence and write permission.

pub mod session;

pub use session::{
    Auth, CommandOutput, ConnectionTest, DEFAULT_KEY_NAMES, RemoteError, RemoteShell,
    SetupValidation, SshRemote, write_marker_name,
};
