//! Single instance lock using a Unix socket.
//!
//! Two bridges driving the same coordinator radio would fight over it, so the
//! lock is keyed by the radio's device path. The OS removes the socket when
//! the process dies, so a crash never leaves a stale lock behind.

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstanceLockError {
    #[error("another bridge is already driving {0}")]
    AlreadyRunning(String),

    #[error("failed to acquire instance lock: {0}")]
    Io(#[from] io::Error),
}

/// Held for as long as the bridge runs. Dropping it removes the socket file.
pub struct InstanceLock {
    _listener: UnixListener,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock for a coordinator device path under the runtime directory.
    pub fn acquire(device_path: &str) -> Result<Self, InstanceLockError> {
        Self::acquire_in(&runtime_dir(), device_path)
    }

    /// Acquire the lock with the socket placed in `dir`.
    pub fn acquire_in(dir: &Path, device_path: &str) -> Result<Self, InstanceLockError> {
        let path = Self::socket_path(dir, device_path);

        // A socket nobody listens on belongs to a killed process.
        if path.exists() {
            match UnixStream::connect(&path) {
                Ok(_) => return Err(InstanceLockError::AlreadyRunning(device_path.to_string())),
                Err(_) => {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        match UnixListener::bind(&path) {
            Ok(listener) => Ok(Self {
                _listener: listener,
                path,
            }),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                Err(InstanceLockError::AlreadyRunning(device_path.to_string()))
            }
            Err(e) => Err(InstanceLockError::Io(e)),
        }
    }

    /// Socket path for a device path, e.g. `/dev/ttyACM0` -> `zigbee-mqtt-bridge-dev-ttyACM0.sock`.
    pub fn socket_path(dir: &Path, device_path: &str) -> PathBuf {
        let slug: String = device_path
            .trim_start_matches('/')
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        dir.join(format!("zigbee-mqtt-bridge-{}.sock", slug))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `XDG_RUNTIME_DIR` if set (cleaned on logout), `/tmp` otherwise.
fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
