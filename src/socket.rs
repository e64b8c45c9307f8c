//! Listening-socket setup and socket path conventions.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Environment variable through which a spawned session finds its server.
pub const SOCKET_ENV_VAR: &str = "MONOMUX_SOCKET";
/// Environment variable naming the session a process runs inside.
pub const SESSION_ENV_VAR: &str = "MONOMUX_SESSION";

/// Compute the default Unix socket path for this user.
pub fn default_socket_path() -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/tmp/monomux-{}", whoami()));
    PathBuf::from(runtime_dir).join("monomux").join("server.sock")
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Whether a live server currently answers on `path`.
pub fn probe(path: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(path).is_ok()
}

/// Wait for a server to start answering on `path`, polling with backoff.
/// Replaces guessing a fixed startup delay.
pub fn wait_until_ready(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut delay = Duration::from_millis(10);
    loop {
        if probe(path) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(delay);
        delay = (delay * 2).min(Duration::from_millis(200));
    }
}

/// Bind the server's listening socket.
///
/// If the path exists, a connect probe decides between failing (a live
/// server answers) and unlinking a stale file. The socket is created
/// non-blocking with permissions restricted to the owning user.
pub fn bind(path: &Path) -> io::Result<mio::net::UnixListener> {
    if path.exists() {
        if probe(path) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("another server is already listening on {}", path.display()),
            ));
        }
        // Socket exists but nothing answers: stale, safe to remove.
        tracing::info!(path = %path.display(), "removing stale socket file");
        std::fs::remove_file(path)?;
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = mio::net::UnixListener::bind(path)?;

    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %path.display(), "server socket listening");
    Ok(listener)
}

/// Remove the socket file, ignoring a file that is already gone.
pub fn unlink(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), ?e, "failed to remove socket file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn bind_creates_socket_with_owner_permissions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("server.sock");
        let _listener = bind(&path).unwrap();
        assert!(path.exists());

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn bind_replaces_stale_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.sock");
        {
            let _stale = bind(&path).unwrap();
            // Listener dropped: the file stays behind but nothing answers.
        }
        assert!(path.exists());
        let _fresh = bind(&path).unwrap();
    }

    #[test]
    fn bind_refuses_live_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.sock");
        let _live = bind(&path).unwrap();

        // The listener is alive, so connects succeed and a second bind
        // must refuse.
        let err = bind(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn probe_reflects_listener_presence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.sock");
        assert!(!probe(&path));
        let _listener = bind(&path).unwrap();
        assert!(probe(&path));
    }

    #[test]
    fn unlink_tolerates_missing_file() {
        let dir = TempDir::new().unwrap();
        unlink(&dir.path().join("absent.sock"));
    }
}
