//! Thread-safe [`Job`] manager.
//!
//! Every job runs as a separate subprocess wrapped by the re-exec
//! supervisor (see [`crate::spawn`]), resource limited through a per-job
//! cgroup v2 and placed in fresh mount, PID, user, and UTS namespaces.
//! This is not a full sandbox: the host rootfs stays visible, only `/proc`
//! is private, and the hostname is forced to `sandbox`.
//!
//! Lock order is table lock, then per-context lock, then buffer lock —
//! never the other way around, and never across a blocking await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::BytesMut;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::buffer::{NotifyingBuffer, OutputReader};
use crate::error::{Error, Result};
use crate::job::{Job, JobState};
use crate::spawn::{Launcher, CANNOT_EXECUTE};

/// How long a stopped job gets to exit after SIGTERM before SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Full execution context for one job. Once a job is started this is the
/// source of truth for its state.
struct ExecContext {
    /// Mutable job fields, guarded by this context's own lock.
    job: Mutex<Job>,
    /// Merged stdout/stderr of the subprocess.
    output: NotifyingBuffer,
    /// One-shot cancel handle for the supervisor's stop path. Taken on the
    /// first stop so a second stop can never signal a second time.
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// Whether a stop was requested; decides `Stopped` over
    /// `Completed`/`Failed` at terminal-transition time.
    stopped: AtomicBool,
    /// Publishes state changes for [`Executor::wait`].
    state_tx: watch::Sender<JobState>,
}

impl ExecContext {
    fn snapshot(&self) -> Job {
        self.job.lock().unwrap().clone()
    }

    /// Terminal bookkeeping: end time, exit code, derived state, and the
    /// buffer close all happen under the context lock so no observer can
    /// see a closed buffer with a non-terminal job or vice versa.
    fn finish(&self, exit_code: i32) {
        let mut job = self.job.lock().unwrap();
        if job.state.is_terminal() {
            return;
        }
        job.end = Some(SystemTime::now());
        job.exit_code = exit_code;
        job.state = if self.stopped.load(Ordering::SeqCst) {
            JobState::Stopped
        } else if exit_code == 0 {
            JobState::Completed
        } else {
            JobState::Failed
        };
        self.output.close();

        let state = job.state;
        info!(id = %job.id, exit_code, %state, "job terminated");
        drop(job);
        let _ = self.state_tx.send(state);
    }
}

/// Binds jobs to running subprocesses and keeps their state consistent
/// across concurrent callers. Cheap to clone; all clones share one job
/// table.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

struct Inner {
    contexts: Mutex<HashMap<Uuid, Arc<ExecContext>>>,
    launcher: Launcher,
}

impl Executor {
    /// An executor that sandboxes jobs under `cgroup_root`.
    pub fn new(cgroup_root: impl Into<std::path::PathBuf>, isolate_network: bool) -> Self {
        Self::with_launcher(Launcher::Sandboxed {
            cgroup_root: cgroup_root.into(),
            isolate_network,
        })
    }

    pub fn with_launcher(launcher: Launcher) -> Self {
        Self {
            inner: Arc::new(Inner {
                contexts: Mutex::new(HashMap::new()),
                launcher,
            }),
        }
    }

    /// Starts `job` and returns an updated copy.
    ///
    /// Starting an id that is already running is a no-op returning the
    /// current view; an id in a terminal state fails with
    /// [`Error::InvalidState`]. The spawn happens under the table lock, so
    /// two concurrent starts of one id yield exactly one subprocess.
    ///
    /// A spawn failure is not reported as an error: the job transitions to
    /// `Failed` with exit code 127 and that terminal view is returned.
    pub fn start(&self, mut job: Job) -> Result<Job> {
        let mut contexts = self.inner.contexts.lock().unwrap();

        if let Some(ctx) = contexts.get(&job.id) {
            let existing = ctx.snapshot();
            if existing.is_running() {
                debug!(id = %existing.id, "job is already running");
                return Ok(existing);
            }
            warn!(id = %existing.id, state = %existing.state, "start called on terminated job");
            return Err(Error::InvalidState(existing.state));
        }

        job.start = Some(SystemTime::now());
        job.state = JobState::Running;

        let (stop_tx, stop_rx) = oneshot::channel();
        let (state_tx, _) = watch::channel(JobState::Running);
        let ctx = Arc::new(ExecContext {
            job: Mutex::new(job.clone()),
            output: NotifyingBuffer::new(),
            stop_tx: Mutex::new(Some(stop_tx)),
            stopped: AtomicBool::new(false),
            state_tx,
        });
        contexts.insert(job.id, Arc::clone(&ctx));

        let mut command = self.inner.launcher.command(&job);
        match command.spawn() {
            Ok(child) => {
                info!(
                    owner = %job.owner,
                    id = %job.id,
                    command = %job.command,
                    args = ?job.args,
                    "job started"
                );
                tokio::spawn(supervise(Arc::clone(&ctx), child, stop_rx));
            }
            Err(err) => {
                error!(id = %job.id, command = %job.command, %err, "job failed to start");
                ctx.finish(CANNOT_EXECUTE);
            }
        }

        Ok(ctx.snapshot())
    }

    /// Requests termination of a running job: SIGTERM immediately, SIGKILL
    /// after a 5 s grace period. Returns as soon as the cancellation is
    /// issued; use [`Executor::wait`] to observe the terminal state.
    pub fn stop(&self, id: Uuid) -> Result<()> {
        let ctx = self.get(id)?;

        let job = ctx.job.lock().unwrap();
        if !job.is_running() {
            return Err(Error::InvalidState(job.state));
        }
        let sender = ctx.stop_tx.lock().unwrap().take().ok_or(Error::CannotStop)?;
        ctx.stopped.store(true, Ordering::SeqCst);
        // the supervisor may have just reaped the child; the terminal
        // transition then wins and the send lands nowhere
        let _ = sender.send(());
        Ok(())
    }

    /// Returns a copy of the job for `id`.
    pub fn lookup(&self, id: Uuid) -> Result<Job> {
        Ok(self.get(id)?.snapshot())
    }

    /// Whether the job for `id` is running, or `None` if it does not exist.
    pub fn running(&self, id: Uuid) -> Option<bool> {
        self.get(id).ok().map(|ctx| ctx.snapshot().is_running())
    }

    /// Opens a reader over the job's merged stdout/stderr, starting at the
    /// first byte. Reading is permitted in any job state.
    pub fn open_reader(&self, id: Uuid) -> Result<OutputReader> {
        Ok(self.get(id)?.output.reader())
    }

    /// Blocks until the job for `id` reaches a terminal state, then returns
    /// the final job.
    pub async fn wait(&self, id: Uuid) -> Result<Job> {
        let ctx = self.get(id)?;
        let mut rx = ctx.state_tx.subscribe();
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        Ok(ctx.snapshot())
    }

    /// Requests a stop for every running job. Only for process shutdown.
    pub fn shutdown(&self) {
        let contexts: Vec<Arc<ExecContext>> = {
            let contexts = self.inner.contexts.lock().unwrap();
            contexts.values().cloned().collect()
        };
        for ctx in contexts {
            let job = ctx.job.lock().unwrap();
            if !job.is_running() {
                continue;
            }
            if let Some(sender) = ctx.stop_tx.lock().unwrap().take() {
                ctx.stopped.store(true, Ordering::SeqCst);
                let _ = sender.send(());
            }
        }
    }

    fn get(&self, id: Uuid) -> Result<Arc<ExecContext>> {
        self.inner
            .contexts
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }
}

/// Per-job supervisor task, exactly one per started job: pumps the child's
/// output into the buffer, waits for it to exit (terminating it on a stop
/// request), and performs the terminal bookkeeping.
async fn supervise(ctx: Arc<ExecContext>, mut child: Child, stop_rx: oneshot::Receiver<()>) {
    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(stdout, ctx.output.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(stderr, ctx.output.clone())));
    }

    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop_rx => {
            // SIGTERM the wrapper, not the supervisor task: the wrapper must
            // stay reapable so the exit status still reaches us here.
            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!("job ignored SIGTERM, killing");
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        }
    };

    // Drain the pipes completely before the terminal transition closes the
    // buffer; a reader that sees end-of-stream has seen every byte.
    for handle in pumps {
        let _ = handle.await;
    }

    let exit_code = match status {
        Ok(status) => status.code().unwrap_or_else(|| {
            use std::os::unix::process::ExitStatusExt;
            status.signal().map(|s| 128 + s).unwrap_or(-1)
        }),
        Err(err) => {
            error!(%err, "wait failed on job process");
            -1
        }
    };
    ctx.finish(exit_code);
}

/// Copies one stdio pipe into the shared output buffer until EOF.
async fn pump(mut src: impl AsyncRead + Unpin, output: NotifyingBuffer) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match src.read_buf(&mut buf).await {
            Ok(n) if n > 0 => {
                if output.write(&buf.split()).is_err() {
                    break;
                }
            }
            _ => break,
        }
    }
}
