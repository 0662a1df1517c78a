use std::path::PathBuf;
use std::time::Duration;

/// Environment variables read by the supervisor and exported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvVar {
    Socket,
    Pidfile,
    PollTimeoutMs,
    StopTimeoutSecs,
    ConnectTimeoutMs,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::Socket => "APPVISOR_SOCKET",
            EnvVar::Pidfile => "APPVISOR_PIDFILE",
            EnvVar::PollTimeoutMs => "APPVISOR_POLL_TIMEOUT_MS",
            EnvVar::StopTimeoutSecs => "APPVISOR_STOP_TIMEOUT_SECS",
            EnvVar::ConnectTimeoutMs => "APPVISOR_CONNECT_TIMEOUT_MS",
        }
    }
}

const APP_SUBDIR: &str = "appvisor";
const SOCKET_FILE: &str = "appvisor.sock";
const PID_FILE: &str = "app.pid";
const FALLBACK_DATA_DIR: &str = "~/.local/share";
const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

fn env_opt(var: EnvVar) -> Option<String> {
    std::env::var(var.as_str())
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_u64(var: EnvVar) -> Option<u64> {
    let raw = env_opt(var)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={:?}", var.as_str(), raw);
            None
        }
    }
}

/// Control socket path ($APPVISOR_SOCKET or <temp dir>/appvisor.sock)
pub fn socket_path() -> PathBuf {
    let path = env_opt(EnvVar::Socket)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join(SOCKET_FILE));
    tracing::trace!(path = %path.display(), "Control socket path");
    path
}

/// Application pidfile path ($APPVISOR_PIDFILE or ~/.local/share/appvisor/app.pid)
pub fn pidfile_path() -> PathBuf {
    let path = env_opt(EnvVar::Pidfile)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR))
                .join(APP_SUBDIR)
                .join(PID_FILE)
        });
    tracing::trace!(path = %path.display(), "Application pidfile path");
    path
}

/// Command queue poll timeout ($APPVISOR_POLL_TIMEOUT_MS or 1000)
pub fn poll_timeout() -> Duration {
    let ms = env_u64(EnvVar::PollTimeoutMs).unwrap_or(DEFAULT_POLL_TIMEOUT_MS);
    tracing::trace!(ms, "Poll timeout");
    Duration::from_millis(ms)
}

/// Graceful stop timeout ($APPVISOR_STOP_TIMEOUT_SECS or 10)
pub fn stop_timeout() -> Duration {
    let secs = env_u64(EnvVar::StopTimeoutSecs).unwrap_or(DEFAULT_STOP_TIMEOUT_SECS);
    tracing::trace!(secs, "Stop timeout");
    Duration::from_secs(secs)
}

/// Control socket connect timeout ($APPVISOR_CONNECT_TIMEOUT_MS or 5000)
pub fn connect_timeout() -> Duration {
    let ms = env_u64(EnvVar::ConnectTimeoutMs).unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
    tracing::trace!(ms, "Connect timeout");
    Duration::from_millis(ms)
}
