//! Render Service Queue
//!
//! Device uploads must happen on exactly one thread. The [`RenderService`]
//! is a job queue bound to that thread: any task can enqueue a closure, and
//! the bound thread drains the queue between frames (or inline, while a
//! synchronous build is being driven).
//!
//! Binding is first-come: the first thread that drives the queue owns it for
//! the lifetime of the service. Calls that would touch the queue from a
//! different thread fail with [`KilnError::WrongThread`] instead of silently
//! corrupting the single-thread contract.

use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;

use crate::errors::{KilnError, Result};

type RenderJob = Box<dyn FnOnce() + Send + 'static>;

/// Job queue owned by the render thread.
pub struct RenderService {
    tx: flume::Sender<RenderJob>,
    rx: flume::Receiver<RenderJob>,
    bound: Mutex<Option<ThreadId>>,
}

impl RenderService {
    pub(crate) fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            bound: Mutex::new(None),
        }
    }

    /// Claims the service for the calling thread.
    ///
    /// The first caller wins and later calls from the same thread are no-ops.
    /// A call from any other thread afterwards is a contract violation.
    pub fn bind_current_thread(&self) -> Result<()> {
        let current = thread::current().id();
        let mut bound = self.bound.lock();
        match *bound {
            None => {
                *bound = Some(current);
                log::debug!("render service bound to {current:?}");
                Ok(())
            }
            Some(owner) if owner == current => Ok(()),
            Some(owner) => Err(KilnError::WrongThread(format!(
                "render service is owned by {owner:?}, called from {current:?}"
            ))),
        }
    }

    /// Whether the calling thread is the bound render thread.
    #[must_use]
    pub fn is_render_thread(&self) -> bool {
        *self.bound.lock() == Some(thread::current().id())
    }

    /// Enqueues a job for the render thread. Any thread.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        // Both channel ends live inside self, so send cannot fail.
        let _ = self.tx.send(Box::new(job));
    }

    /// Runs `f` in the render domain and returns its result.
    ///
    /// Inline when called on the bound thread; otherwise the closure is
    /// queued and the caller suspends until the render thread has run it.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_render_thread() {
            return Ok(f());
        }
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.submit(move || {
            let _ = reply_tx.send(f());
        });
        reply_rx
            .recv_async()
            .await
            .map_err(|_| KilnError::ServiceStopped("render job dropped before it ran".into()))
    }

    /// Executes every currently queued job and returns how many ran.
    /// Must be called on the bound thread.
    pub fn pump(&self) -> usize {
        debug_assert!(self.is_render_thread(), "pump called off the render thread");
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Waits up to `timeout` for one job and executes it. Returns whether a
    /// job ran. Must be called on the bound thread.
    pub(crate) fn pump_one(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(job) => {
                job();
                true
            }
            Err(_) => false,
        }
    }

    /// Number of jobs currently waiting.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}
