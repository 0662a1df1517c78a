use super::controllable::{Controllable, ControlledProcess};
use super::{send_signal, Signal};
use crate::clienv::EnvVar;
use crate::error::{Error, Result};
use crate::events::{EventSink, SupervisorEvent};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How long the child gets to exit on its own once a stop is requested.
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Runs the supervised program as a child with inherited stdio.
///
/// Stopping goes through two independent paths: `on_stop` interrupts the PID
/// recorded in the pidfile, and `main` escalates against its direct child.
pub struct ApplicationProcess {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    pidfile: PathBuf,
    exit_grace: Duration,
    kill_grace: Duration,
    child_pid: AtomicU32,
    exit_status: Mutex<Option<ExitStatus>>,
    events: Arc<dyn EventSink>,
}

impl ApplicationProcess {
    pub fn new(
        program: impl Into<String>,
        pidfile: impl Into<PathBuf>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            pidfile: pidfile.into(),
            exit_grace: DEFAULT_EXIT_GRACE,
            kill_grace: super::DEFAULT_KILL_GRACE,
            child_pid: AtomicU32::new(0),
            exit_status: Mutex::new(None),
            events,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// PID of the running child, if any.
    pub fn child_pid(&self) -> Option<u32> {
        match self.child_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Exit code of the finished child. Signal deaths map to `128 + signal`.
    pub fn exit_code(&self) -> Option<i32> {
        let status = lock_status(&self.exit_status)?;
        status.code().or_else(|| {
            use std::os::unix::process::ExitStatusExt;
            status.signal().map(|sig| 128 + sig)
        })
    }

    /// True when the finished child was killed by a signal.
    pub fn terminated_by_signal(&self) -> bool {
        use std::os::unix::process::ExitStatusExt;
        lock_status(&self.exit_status).is_some_and(|status| status.signal().is_some())
    }

    fn spawn(&self) -> Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(EnvVar::Pidfile.as_str(), &self.pidfile)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd.spawn().map_err(|source| Error::Spawn {
            program: self.program.clone(),
            source,
        })
    }

    async fn shutdown_child(&self, child: &mut Child) -> Result<ExitStatus> {
        if let Ok(status) = tokio::time::timeout(self.exit_grace, child.wait()).await {
            return Ok(status?);
        }

        if let Some(pid) = child.id() {
            info!("Application (PID {}) still running, sending SIGTERM", pid);
            send_signal(pid, Signal::Terminate);
        }
        if let Ok(status) = tokio::time::timeout(self.kill_grace, child.wait()).await {
            return Ok(status?);
        }

        warn!("Application did not terminate within {:?}, killing", self.kill_grace);
        child.kill().await?;
        Ok(child.wait().await?)
    }

    fn signal_child(&self, signal: Signal) {
        if let Some(pid) = self.child_pid() {
            send_signal(pid, signal);
        }
    }
}

impl Controllable for ApplicationProcess {
    fn name(&self) -> &str {
        "application"
    }

    async fn main(&self, ctx: ControlledProcess) -> Result<()> {
        let mut child = self.spawn()?;
        let pid = child.id().unwrap_or(0);
        self.child_pid.store(pid, Ordering::SeqCst);
        info!("Started `{}` with PID {}", self.program, pid);
        self.events
            .post(SupervisorEvent::ApplicationStarted { pid });

        let status = tokio::select! {
            status = child.wait() => status.map_err(Error::from),
            _ = ctx.stopped() => {
                debug!("Stop requested, shutting down application (PID {})", pid);
                self.shutdown_child(&mut child).await
            }
        };

        self.child_pid.store(0, Ordering::SeqCst);
        let status = status?;
        info!("Application (PID {}) exited: {}", pid, status);
        *self
            .exit_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(status);
        Ok(())
    }

    fn on_stop(&self) {
        match read_pidfile(&self.pidfile) {
            Some(pid) => {
                debug!("Interrupting application PID {} from pidfile", pid);
                send_signal(pid, Signal::Interrupt);
            }
            None => debug!(
                "No usable pidfile at {}, relying on direct child shutdown",
                self.pidfile.display()
            ),
        }
    }

    fn on_terminate(&self) {
        self.signal_child(Signal::Terminate);
    }

    fn on_kill(&self) {
        self.signal_child(Signal::Kill);
    }
}

fn lock_status(status: &Mutex<Option<ExitStatus>>) -> Option<ExitStatus> {
    *status.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Parse a pidfile. Missing, empty or garbage files yield `None`.
pub fn read_pidfile(path: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    content.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;

    fn sink() -> Arc<RecordingSink> {
        Arc::new(RecordingSink::new())
    }

    #[test]
    fn test_read_pidfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.pid");

        assert_eq!(read_pidfile(&path), None);

        std::fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pidfile(&path), Some(4242));

        std::fs::write(&path, "not a pid").unwrap();
        assert_eq!(read_pidfile(&path), None);

        std::fs::write(&path, "0").unwrap();
        assert_eq!(read_pidfile(&path), None);
    }

    #[test]
    fn test_on_stop_without_pidfile_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let app = ApplicationProcess::new("true", dir.path().join("missing.pid"), sink());
        Controllable::on_stop(&app);
        assert_eq!(app.child_pid(), None);
    }

    #[tokio::test]
    async fn test_records_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let events = sink();
        let app = Arc::new(
            ApplicationProcess::new("/bin/sh", dir.path().join("app.pid"), events.clone())
                .args(["-c", "exit 3"]),
        );
        let process = ControlledProcess::new(Arc::clone(&app));
        process.start();

        tokio::time::timeout(Duration::from_secs(10), process.exited())
            .await
            .unwrap();
        assert_eq!(app.exit_code(), Some(3));
        assert!(!app.terminated_by_signal());
        assert_eq!(app.child_pid(), None);
        assert!(matches!(
            events.events().first(),
            Some(SupervisorEvent::ApplicationStarted { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_interrupts_pidfile_owner() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("app.pid");
        let app = Arc::new(
            ApplicationProcess::new("/bin/sh", &pidfile, sink())
                .args(["-c", "echo $$ > \"$APPVISOR_PIDFILE\"; exec sleep 30"])
                .exit_grace(Duration::from_secs(5)),
        );
        let process = ControlledProcess::new(Arc::clone(&app));
        process.start();

        for _ in 0..100 {
            if read_pidfile(&pidfile).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(read_pidfile(&pidfile), app.child_pid());

        process.stop(Duration::from_secs(10)).await;
        assert!(process.has_exited());
        assert_eq!(app.exit_code(), Some(128 + libc::SIGINT));
        assert!(app.terminated_by_signal());
    }

    #[tokio::test]
    async fn test_stop_escalates_without_pidfile() {
        let dir = tempfile::tempdir().unwrap();
        let app = Arc::new(
            ApplicationProcess::new("sleep", dir.path().join("none.pid"), sink())
                .args(["30"])
                .exit_grace(Duration::from_millis(100)),
        );
        let process = ControlledProcess::new(Arc::clone(&app));
        process.start();

        for _ in 0..100 {
            if app.child_pid().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        process.stop(Duration::from_secs(10)).await;
        assert!(process.has_exited());
        assert_eq!(app.exit_code(), Some(128 + libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_spawn_failure_ends_process() {
        let dir = tempfile::tempdir().unwrap();
        let app = Arc::new(ApplicationProcess::new(
            "/nonexistent/appvisor-test-binary",
            dir.path().join("app.pid"),
            sink(),
        ));
        let process = ControlledProcess::new(Arc::clone(&app));
        process.start();

        process.wait_stop(Duration::from_secs(5)).await.unwrap();
        assert!(process.has_exited());
        assert_eq!(app.exit_code(), None);
    }

    #[tokio::test]
    async fn test_stop_after_exit_leaves_pidfile_owner_alone() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("app.pid");
        let mut bystander = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let bystander_pid = bystander.id().unwrap();

        let app = Arc::new(
            ApplicationProcess::new("/bin/sh", &pidfile, sink())
                .args(["-c", "echo \"$BYSTANDER_PID\" > \"$APPVISOR_PIDFILE\"; exit 0"])
                .env("BYSTANDER_PID", bystander_pid.to_string()),
        );
        let process = ControlledProcess::new(Arc::clone(&app));
        process.start();
        tokio::time::timeout(Duration::from_secs(10), process.exited())
            .await
            .unwrap();
        assert_eq!(app.exit_code(), Some(0));
        assert_eq!(read_pidfile(&pidfile), Some(bystander_pid));

        process.stop(Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(bystander.try_wait().unwrap().is_none());

        bystander.kill().await.unwrap();
    }
}
