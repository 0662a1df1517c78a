use crate::clienv::{self, EnvVar};
use crate::control::{Command, CommandStream, CommandTarget};
use crate::error::Result;
use crate::events::{EventSink, SupervisorEvent, TracingSink};
use crate::process::{ApplicationProcess, ControlledProcess, DEFAULT_KILL_GRACE};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct SupervisorConfig {
    pub socket_path: PathBuf,
    pub pidfile_path: PathBuf,
    /// How long each listener iteration waits for a command.
    pub poll_timeout: Duration,
    /// How long a stopped application gets before it is terminated.
    pub stop_timeout: Duration,
    pub kill_grace: Duration,
    /// Connect timeout for clients writing to the control socket.
    pub connect_timeout: Duration,
    pub program: String,
    pub args: Vec<String>,
}

impl SupervisorConfig {
    /// Config for `program` with every other field resolved from the environment.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            socket_path: clienv::socket_path(),
            pidfile_path: clienv::pidfile_path(),
            poll_timeout: clienv::poll_timeout(),
            stop_timeout: clienv::stop_timeout(),
            kill_grace: DEFAULT_KILL_GRACE,
            connect_timeout: clienv::connect_timeout(),
            program: program.into(),
            args: Vec::new(),
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

    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn pidfile_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.pidfile_path = path.into();
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Supervises one application at a time and serves the control socket.
///
/// Each decoded command runs on its own task with the runner as target, so a
/// slow stop never blocks the next read.
pub struct ApplicationRunner {
    config: SupervisorConfig,
    events: Arc<dyn EventSink>,
    current: Mutex<Option<ControlledProcess>>,
    stop_requested: AtomicBool,
}

impl ApplicationRunner {
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_event_sink(config, Arc::new(TracingSink))
    }

    pub fn with_event_sink(config: SupervisorConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            events,
            current: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Handle to the application process currently supervised, if any.
    pub fn current_process(&self) -> Option<ControlledProcess> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current(&self, process: Option<ControlledProcess>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = process;
    }

    /// Stop the application for good.
    pub async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        match self.current_process() {
            Some(process) => process.stop(self.config.stop_timeout).await,
            None => debug!("Stop requested with no application running"),
        }
    }

    /// Stop for good without waiting: abort the application and kill its child.
    pub fn kill(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        match self.current_process() {
            Some(process) => {
                warn!("Killing application");
                process.abort();
            }
            None => debug!("Kill requested with no application running"),
        }
    }

    /// Stop the application and start a fresh one.
    pub async fn restart(&self) {
        match self.current_process() {
            Some(process) => {
                process.mark_for_restart();
                process.stop(self.config.stop_timeout).await;
            }
            None => warn!("Restart requested with no application running"),
        }
    }

    /// Supervise until the application exits without a pending restart.
    ///
    /// Returns the exit code of the last application run.
    pub async fn run(self: &Arc<Self>) -> Result<Option<i32>> {
        info!("Supervisor starting for `{}`", self.config.program);

        let mut stream = CommandStream::new(&self.config.socket_path)
            .with_connect_timeout(self.config.connect_timeout);
        stream.open().await?;

        let outcome = self.supervise(&mut stream).await;

        stream.close().await;
        self.events.post(SupervisorEvent::SupervisorStopped);
        outcome
    }

    async fn supervise(self: &Arc<Self>, stream: &mut CommandStream) -> Result<Option<i32>> {
        loop {
            let app = Arc::new(
                ApplicationProcess::new(
                    self.config.program.clone(),
                    self.config.pidfile_path.clone(),
                    Arc::clone(&self.events),
                )
                .args(self.config.args.iter().cloned())
                .env(
                    EnvVar::Socket.as_str(),
                    self.config.socket_path.display().to_string(),
                )
                .kill_grace(self.config.kill_grace),
            );
            let process = ControlledProcess::with_kill_grace(Arc::clone(&app), self.config.kill_grace);
            self.set_current(Some(process.clone()));

            if self.stop_requested.load(Ordering::SeqCst) {
                process.stop(self.config.stop_timeout).await;
            } else {
                process.start();
                self.listen(stream, &process).await;
            }

            process.stop(self.config.stop_timeout).await;
            self.set_current(None);

            let code = app.exit_code();
            self.events.post(SupervisorEvent::ApplicationExited { code });
            let stop_requested = self.stop_requested.load(Ordering::SeqCst);

            if process.should_restart() && !stop_requested {
                info!("Restarting application");
                self.events.post(SupervisorEvent::RestartScheduled);
                continue;
            }

            // A signal death we asked for is a clean shutdown.
            if stop_requested && (code.is_none() || app.terminated_by_signal()) {
                return Ok(Some(0));
            }
            return Ok(code);
        }
    }

    async fn listen(self: &Arc<Self>, stream: &mut CommandStream, process: &ControlledProcess) {
        while process.is_alive() {
            let cmd = tokio::select! {
                cmd = stream.read(self.config.poll_timeout) => cmd,
                _ = process.exited() => break,
            };
            if let Some(cmd) = cmd {
                self.dispatch(cmd);
            }
        }
        debug!("Listener loop finished");
    }

    fn dispatch(self: &Arc<Self>, cmd: Command) {
        self.events.post(SupervisorEvent::CommandReceived {
            name: cmd.name().to_string(),
        });
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            debug!("Executing {}", cmd);
            cmd.execute(runner.as_ref()).await;
        });
    }
}

impl CommandTarget for ApplicationRunner {
    async fn stop(&self) {
        ApplicationRunner::stop(self).await
    }

    async fn restart(&self) {
        ApplicationRunner::restart(self).await
    }
}

/// Translate SIGINT/SIGTERM delivered to the supervisor into a stop.
///
/// The first signal starts a graceful stop. Any later one kills the
/// application right away.
pub fn forward_signals(runner: Arc<ApplicationRunner>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        let mut received = 0usize;
        loop {
            tokio::select! {
                Some(()) = sigterm.recv() => info!("Received SIGTERM"),
                Some(()) = sigint.recv() => info!("Received SIGINT"),
                else => break,
            }
            received += 1;
            if received == 1 {
                let runner = Arc::clone(&runner);
                tokio::spawn(async move { runner.stop().await });
            } else {
                runner.kill();
            }
        }
    });
    Ok(())
}
