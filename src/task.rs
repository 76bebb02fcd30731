//! Task runners: a dedicated thread draining posted closures
//!
//! The pipeline has two thread roles. The I/O runner owns capture buffers
//! and per-frame delivery; the main runner owns registration bookkeeping
//! and client callbacks. Each runner is a named thread driving its own
//! current-thread tokio runtime, so posted closures run in order and
//! delayed ones wait on the runtime's timer.

use crate::error::{Error, Result};

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    RunAt(Instant, Task),
    Quit,
}

struct RunnerInner {
    name: String,
    tx: UnboundedSender<Message>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for RunnerInner {
    fn drop(&mut self) {
        // The last handle may be dropped on the runner thread itself, so
        // never join here.
        let _ = self.tx.send(Message::Quit);
    }
}

/// Handle to a task-running thread. Cheap to clone.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl TaskRunner {
    /// Spawn a runner thread and wait for its runtime to come up
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                runtime.block_on(run_loop(thread_name, rx));
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Internal(format!("runner '{name}' exited during startup")))??;
        tracing::debug!("Task runner '{}' started", name);

        Ok(Self {
            inner: Arc::new(RunnerInner {
                name,
                tx,
                thread_id: handle.thread().id(),
                handle: Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue `task`; returns false once the runner has shut down
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.inner.tx.send(Message::Run(Box::new(task))).is_ok()
    }

    /// Queue `task` to run no earlier than `delay` from now
    pub fn post_delayed(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> bool {
        let due = Instant::now() + delay;
        self.inner
            .tx
            .send(Message::RunAt(due, Box::new(task)))
            .is_ok()
    }

    pub fn runs_tasks_on_current_thread(&self) -> bool {
        std::thread::current().id() == self.inner.thread_id
    }

    /// Block until every task posted before this call has run.
    ///
    /// Delayed tasks that are not yet due are not waited for.
    pub fn sync(&self) {
        if self.runs_tasks_on_current_thread() {
            tracing::error!("sync() called on runner '{}' itself", self.inner.name);
            debug_assert!(false, "TaskRunner::sync would deadlock");
            return;
        }
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        if self.post(move || {
            let _ = done_tx.send(());
        }) {
            // A dead runner drops the task, which disconnects the channel
            let _ = done_rx.recv();
        }
    }

    /// Stop the thread after the tasks already queued and join it
    pub fn shutdown(&self) -> Result<()> {
        if self.runs_tasks_on_current_thread() {
            return Err(Error::InvalidState(format!(
                "runner '{}' cannot join itself",
                self.inner.name
            )));
        }
        let _ = self.inner.tx.send(Message::Quit);
        if let Some(handle) = self.inner.handle.lock().take() {
            handle
                .join()
                .map_err(|_| Error::Internal(format!("runner '{}' panicked", self.inner.name)))?;
        }
        Ok(())
    }
}

fn report_panic(name: &str, result: std::result::Result<(), JoinError>) {
    let Err(e) = result else {
        return;
    };
    if !e.is_panic() {
        return;
    }
    let panic = e.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!("Task on runner '{}' panicked: {}", name, message);
}

async fn run_loop(name: String, mut rx: UnboundedReceiver<Message>) {
    // Immediate tasks are spawned in arrival order and the current-thread
    // scheduler polls them in that order
    let mut immediate = JoinSet::new();
    let mut delayed = JoinSet::new();

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(Message::Run(task)) => {
                    immediate.spawn(async move { task() });
                }
                Some(Message::RunAt(due, task)) => {
                    delayed.spawn(async move {
                        tokio::time::sleep_until(due).await;
                        task()
                    });
                }
                Some(Message::Quit) | None => break,
            },
            Some(result) = immediate.join_next() => report_panic(&name, result),
            Some(result) = delayed.join_next() => report_panic(&name, result),
        }
    }

    // Work queued before the quit still runs; timers not yet due are dropped
    delayed.abort_all();
    while let Some(result) = immediate.join_next().await {
        report_panic(&name, result);
    }

    tracing::debug!("Task runner '{}' stopped", name);
}

/// The two runners every pipeline component is built against
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// Owns capture buffers and per-frame delivery
    pub io: TaskRunner,
    /// Owns registration bookkeeping and client callbacks
    pub main: TaskRunner,
}

impl PipelineContext {
    pub fn new() -> Result<Self> {
        Ok(Self {
            io: TaskRunner::spawn("trackfeed-io")?,
            main: TaskRunner::spawn("trackfeed-main")?,
        })
    }

    /// Wait until both runners have drained what is queued right now
    pub fn sync(&self) {
        self.io.sync();
        self.main.sync();
        // Callbacks run on main may have posted more I/O work
        self.io.sync();
        self.main.sync();
    }

    pub fn shutdown(&self) -> Result<()> {
        self.io.shutdown()?;
        self.main.shutdown()
    }
}
