use crate::error::{Error, Result};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Time allowed between each escalation step after the stop timeout expires.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

tokio::task_local! {
    static CURRENT_PROCESS: u64;
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A unit of work supervised by a [`ControlledProcess`].
///
/// `main` must watch [`ControlledProcess::should_stop`] (or await
/// [`ControlledProcess::stopped`]) and return promptly once it flips.
pub trait Controllable: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn main(&self, ctx: ControlledProcess) -> impl Future<Output = Result<()>> + Send;

    /// Called once, right after the stop flag is raised.
    fn on_stop(&self) {}

    /// Called when `main` did not return within the stop timeout.
    fn on_terminate(&self) {}

    /// Called right before the task is aborted.
    fn on_kill(&self) {}
}

trait Hooks: Send + Sync {
    fn on_stop(&self);
    fn on_terminate(&self);
    fn on_kill(&self);
}

impl<W: Controllable> Hooks for W {
    fn on_stop(&self) {
        Controllable::on_stop(self)
    }

    fn on_terminate(&self) {
        Controllable::on_terminate(self)
    }

    fn on_kill(&self) {
        Controllable::on_kill(self)
    }
}

type MainFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type Launcher = Box<dyn FnOnce(ControlledProcess) -> MainFuture + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Running,
    StopRequested,
    Terminating,
    Killed,
    Exited,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Running => "running",
            LifecycleState::StopRequested => "stop-requested",
            LifecycleState::Terminating => "terminating",
            LifecycleState::Killed => "killed",
            LifecycleState::Exited => "exited",
        }
    }
}

struct Core {
    id: u64,
    name: String,
    hooks: Arc<dyn Hooks>,
    launcher: Mutex<Option<Launcher>>,
    task: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<LifecycleState>,
    stop_tx: watch::Sender<bool>,
    exit_tx: watch::Sender<bool>,
    restart: AtomicBool,
    teardown: AtomicBool,
    kill_grace: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Core {
    fn set_state(&self, next: LifecycleState) {
        let mut state = lock(&self.state);
        match *state {
            LifecycleState::Exited | LifecycleState::Killed => {}
            _ => *state = next,
        }
    }

    fn mark_exited(&self) {
        {
            let mut state = lock(&self.state);
            if *state != LifecycleState::Killed {
                *state = LifecycleState::Exited;
            }
        }
        self.stop_tx.send_replace(true);
        self.exit_tx.send_replace(true);
    }
}

/// Raises the stop and exit flags however the task ends: normal return,
/// error, panic or abort.
struct ExitGuard(Arc<Core>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.mark_exited();
    }
}

/// Lifecycle handle for a [`Controllable`] running on its own task.
///
/// Cloning yields another handle to the same unit. `main` receives one, so
/// a unit can stop itself.
#[derive(Clone)]
pub struct ControlledProcess {
    core: Arc<Core>,
}

impl ControlledProcess {
    pub fn new<W: Controllable>(worker: Arc<W>) -> Self {
        Self::with_kill_grace(worker, DEFAULT_KILL_GRACE)
    }

    pub fn with_kill_grace<W: Controllable>(worker: Arc<W>, kill_grace: Duration) -> Self {
        let name = worker.name().to_string();
        let runner = Arc::clone(&worker);
        let launcher: Launcher = Box::new(move |ctx| -> MainFuture {
            Box::pin(async move { runner.main(ctx).await })
        });
        let (stop_tx, _) = watch::channel(false);
        let (exit_tx, _) = watch::channel(false);

        Self {
            core: Arc::new(Core {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                name,
                hooks: worker,
                launcher: Mutex::new(Some(launcher)),
                task: Mutex::new(None),
                state: Mutex::new(LifecycleState::Created),
                stop_tx,
                exit_tx,
                restart: AtomicBool::new(false),
                teardown: AtomicBool::new(false),
                kill_grace,
            }),
        }
    }

    /// Unique identity of this unit within the supervisor.
    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.core.state)
    }

    pub fn should_stop(&self) -> bool {
        *self.core.stop_tx.borrow()
    }

    pub fn should_restart(&self) -> bool {
        self.core.restart.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        *self.core.exit_tx.borrow()
    }

    /// Started and not yet exited.
    pub fn is_alive(&self) -> bool {
        !matches!(self.state(), LifecycleState::Created) && !self.has_exited()
    }

    /// Request a restart after the next stop completes. Stops nothing by itself.
    pub fn mark_for_restart(&self) {
        debug!(process = %self.core.name, "Marked for restart");
        self.core.restart.store(true, Ordering::SeqCst);
    }

    /// Spawn `main` on its own task. Starting twice is a no-op.
    pub fn start(&self) {
        let Some(launcher) = lock(&self.core.launcher).take() else {
            warn!(process = %self.core.name, "Process already started");
            return;
        };

        self.core.set_state(LifecycleState::Running);
        self.core.restart.store(false, Ordering::SeqCst);
        let main = launcher(self.clone());
        let core = Arc::clone(&self.core);

        let handle = tokio::spawn(CURRENT_PROCESS.scope(core.id, async move {
            let _guard = ExitGuard(Arc::clone(&core));
            debug!(process = %core.name, "Process main entered");

            match main.await {
                Ok(()) => debug!(process = %core.name, "Process main returned"),
                Err(e) => error!(process = %core.name, "Process main failed: {}", e),
            }
        }));

        *lock(&self.core.task) = Some(handle);
        info!(process = %self.core.name, "Process started");
    }

    /// Resolves once the stop flag is raised.
    pub async fn stopped(&self) {
        let mut rx = self.core.stop_tx.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Resolves once the task has finished. Pair with a timeout.
    pub async fn exited(&self) {
        let mut rx = self.core.exit_tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Wait for the stop flag and then for the task to finish.
    ///
    /// From inside this unit's own `main` it returns as soon as the flag is
    /// set, since waiting for its own exit could never complete.
    pub async fn wait_stop(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        tokio::time::timeout_at(deadline, self.stopped())
            .await
            .map_err(|_| Error::timeout("wait_stop", timeout))?;

        if self.is_current() {
            return Ok(());
        }

        tokio::time::timeout_at(deadline, self.exited())
            .await
            .map_err(|_| Error::timeout("wait_stop", timeout))
    }

    /// Stop the unit, escalating until it is gone.
    ///
    /// Raise the stop flag and run `on_stop`, wait up to `timeout`, then run
    /// `on_terminate` and wait the kill grace, then run `on_kill` and abort
    /// the task. Only the first call performs the sequence; later calls wait
    /// for it to finish. Called from inside `main` it only raises the flag.
    /// A unit that already exited on its own is left alone: no hook runs.
    pub async fn stop(&self, timeout: Duration) {
        let current = self.is_current();

        if self.core.teardown.swap(true, Ordering::SeqCst) {
            if !current {
                let bound = timeout + self.core.kill_grace * 2;
                let _ = tokio::time::timeout(bound, self.exited()).await;
            }
            return;
        }

        if self.has_exited() {
            debug!(process = %self.core.name, "Process already exited, nothing to stop");
            return;
        }

        info!(process = %self.core.name, "Stopping process");
        self.core.set_state(LifecycleState::StopRequested);
        self.core.stop_tx.send_replace(true);
        self.core.hooks.on_stop();

        if lock(&self.core.launcher).take().is_some() {
            debug!(process = %self.core.name, "Process stopped before it was started");
            self.core.mark_exited();
            return;
        }

        if current {
            debug!(process = %self.core.name, "Stop requested from within the process");
            return;
        }

        match self.wait_stop(timeout).await {
            Ok(()) => return,
            Err(e) => warn!(process = %self.core.name, "{}, terminating", e),
        }

        self.core.set_state(LifecycleState::Terminating);
        self.core.hooks.on_terminate();
        if tokio::time::timeout(self.core.kill_grace, self.exited())
            .await
            .is_ok()
        {
            return;
        }

        warn!(
            process = %self.core.name,
            "Process did not terminate within {:?}, killing",
            self.core.kill_grace
        );
        self.core.hooks.on_kill();
        self.abort();
        let _ = tokio::time::timeout(self.core.kill_grace, self.exited()).await;
    }

    /// Abort the task immediately, skipping every hook.
    pub fn abort(&self) {
        self.core.set_state(LifecycleState::Killed);
        if let Some(handle) = lock(&self.core.task).as_ref() {
            handle.abort();
        }
    }

    /// True when called from inside this unit's own `main`.
    fn is_current(&self) -> bool {
        CURRENT_PROCESS
            .try_with(|id| *id == self.core.id)
            .unwrap_or(false)
    }
}

impl fmt::Debug for ControlledProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlledProcess")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("state", &self.state())
            .finish()
    }
}
