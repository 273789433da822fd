//! Single-threaded cooperative event loops
//!
//! A [`Selector`] owns one OS thread that runs a current-thread tokio runtime
//! and executes posted closures one at a time, in the order they were posted.
//! Every piece of loop-private state in the crate is touched only from
//! closures running on its owning selector; other threads hand work over
//! with [`Selector::run_in_select_loop`].
//!
//! ```text
//!   media selector                          net selector
//!  ┌──────────────────┐  run_in_select_loop ┌──────────────────┐
//!  │ elements, tags,  │ ──────────────────► │ socket writes,   │
//!  │ request state    │ ◄────────────────── │ client lifetime  │
//!  └──────────────────┘                     └──────────────────┘
//! ```

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::callback::Closure;
use crate::error::Result;

enum Task {
    Run(Closure),
    Stop,
}

/// A single-threaded event loop
pub struct Selector {
    name: String,
    tx: mpsc::UnboundedSender<Task>,
    handle: Handle,
    thread_id: ThreadId,
    thread: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl Selector {
    /// Start a new selector thread
    pub fn spawn(name: impl Into<String>) -> Result<Arc<Self>> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();

        let loop_name = name.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(task) = rx.recv().await {
                        match task {
                            Task::Run(job) => job(),
                            Task::Stop => break,
                        }
                    }
                });
                tracing::debug!(selector = %loop_name, "Selector loop exited");
            })?;

        let thread_id = thread.thread().id();
        tracing::debug!(selector = %name, "Selector started");

        Ok(Arc::new(Self {
            name,
            tx,
            handle,
            thread_id,
            thread: Mutex::new(Some(thread)),
            started_at: Instant::now(),
        }))
    }

    /// Selector name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the calling thread is this selector's thread
    pub fn is_in_select_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Post a closure to run on the loop
    ///
    /// Closures posted from the same thread run in posting order. Returns
    /// false if the loop has already exited.
    pub fn run_in_select_loop<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Task::Run(Box::new(f))).is_ok()
    }

    /// Post a closure to run on the loop after `delay`
    ///
    /// Aborting the returned handle before it fires cancels the closure.
    pub fn run_after<F>(&self, delay: Duration, f: F) -> AbortHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self.tx.clone();
        self.handle
            .spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Task::Run(Box::new(f)));
            })
            .abort_handle()
    }

    /// Run `f` on the loop and wait for its result
    ///
    /// Runs inline when called from the loop itself. Returns `None` if the
    /// loop exited before running `f`.
    pub fn run_and_wait<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_in_select_thread() {
            return Some(f());
        }
        let (tx, rx) = std_mpsc::channel();
        if !self.run_in_select_loop(move || {
            let _ = tx.send(f());
        }) {
            return None;
        }
        rx.recv().ok()
    }

    /// Milliseconds since the selector started
    pub fn now_ms(&self) -> i64 {
        self.started_at.elapsed().as_millis() as i64
    }

    /// Ask the loop to exit once the already-posted closures have run
    pub fn stop(&self) {
        let _ = self.tx.send(Task::Stop);
    }

    /// Stop the loop and wait for its thread to finish
    ///
    /// A no-op when called from the loop itself.
    pub fn stop_and_join(&self) {
        self.stop();
        if self.is_in_select_thread() {
            return;
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::error!(selector = %self.name, "Selector thread panicked");
            }
        }
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        let _ = self.tx.send(Task::Stop);
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector").field("name", &self.name).finish()
    }
}
