//! Two-Domain Task Scheduler
//!
//! Resource builds are plain futures that hop between two execution domains:
//!
//! - the **worker domain**, a thread pool for CPU and file work (shader
//!   compilation, image decoding, disk cache reads);
//! - the **render domain**, a single bound thread that owns the device
//!   context (see [`RenderService`]).
//!
//! A build expresses a hop by awaiting [`Dispatcher::offload`] for worker
//! sections and [`RenderService::run`] for device sections. With
//! [`Launch::Sync`] nothing leaves the calling thread: offloads run inline
//! and the render queue is driven by [`TaskScheduler::execute_sync`] until
//! the build completes.
//!
//! Build futures capture a [`Dispatcher`], which is deliberately non-owning:
//! it holds a runtime [`Handle`](tokio::runtime::Handle), never the runtime
//! itself, so in-flight builds cannot keep the worker pool alive.

pub mod render;

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::task::noop_waker;
use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::errors::Result;

pub use render::RenderService;

/// Where a build executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Launch {
    /// Everything runs inline on the calling thread. The creating call
    /// drives the render queue itself and returns with the build complete.
    Sync,
    /// Worker sections run on the pool, device sections are queued to the
    /// render thread and completed by driver ticks.
    #[default]
    Async,
}

/// Boxed build body, driven inline for `Sync` or spawned for `Async`.
pub type BuildFuture = BoxFuture<'static, ()>;

/// Cheap, non-owning handle pair that build futures capture.
#[derive(Clone)]
pub struct Dispatcher {
    render: Arc<RenderService>,
    workers: tokio::runtime::Handle,
}

impl Dispatcher {
    /// The render-domain queue.
    #[inline]
    #[must_use]
    pub fn render(&self) -> &RenderService {
        &self.render
    }

    /// Moves `f` to the domain selected by `launch`: inline for `Sync`, the
    /// worker pool for `Async`.
    pub async fn offload<T, F>(&self, launch: Launch, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        match launch {
            Launch::Sync => Ok(f()),
            Launch::Async => Ok(self.workers.spawn_blocking(f).await?),
        }
    }
}

/// Owns the worker pool and the render service.
pub struct TaskScheduler {
    render: Arc<RenderService>,
    workers: tokio::runtime::Runtime,
    aborts: Mutex<Vec<AbortHandle>>,
}

impl TaskScheduler {
    /// Builds a scheduler with `worker_threads` pool threads.
    pub fn new(worker_threads: usize) -> Result<Self> {
        let workers = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("kiln-worker")
            .build()?;
        Ok(Self {
            render: Arc::new(RenderService::new()),
            workers,
            aborts: Mutex::new(Vec::new()),
        })
    }

    /// The render-domain queue.
    #[inline]
    #[must_use]
    pub fn render(&self) -> &RenderService {
        &self.render
    }

    /// Handles for build futures to capture.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            render: Arc::clone(&self.render),
            workers: self.workers.handle().clone(),
        }
    }

    /// Spawns a detached build on the worker pool.
    pub fn spawn(&self, build: BuildFuture) {
        let handle = self.workers.spawn(build);
        let mut aborts = self.aborts.lock();
        aborts.push(handle.abort_handle());
        if aborts.len() > 64 {
            aborts.retain(|a| !a.is_finished());
        }
    }

    /// Aborts every spawned build that has not finished yet. Dropped build
    /// bodies resolve their resources as failed through their load guards.
    pub fn abort_spawned(&self) {
        let mut aborts = self.aborts.lock();
        for abort in aborts.drain(..) {
            abort.abort();
        }
    }

    /// Drives `fut` to completion on the calling thread, executing render
    /// jobs as they become ready. Binds the render service to the calling
    /// thread and fails fast if another thread already owns it.
    ///
    /// The poll loop never parks indefinitely: when the future is pending
    /// and the queue is empty it waits a short interval for new jobs, so
    /// completions signalled from worker threads are picked up promptly.
    pub fn execute_sync<T>(&self, fut: impl Future<Output = T>) -> Result<T> {
        self.render.bind_current_thread()?;
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut fut = pin!(fut);
        loop {
            if let Poll::Ready(value) = fut.as_mut().poll(&mut cx) {
                return Ok(value);
            }
            if self.render.pump() == 0 {
                self.render.pump_one(Duration::from_micros(200));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_offload_sync_runs_inline() {
        let scheduler = TaskScheduler::new(1).unwrap();
        let here = thread::current().id();
        let dispatcher = scheduler.dispatcher();
        let ran_on = scheduler
            .execute_sync(dispatcher.offload(Launch::Sync, || thread::current().id()))
            .unwrap()
            .unwrap();
        assert_eq!(ran_on, here);
    }

    #[test]
    fn test_offload_async_runs_on_worker_pool() {
        let scheduler = TaskScheduler::new(2).unwrap();
        let here = thread::current().id();
        let dispatcher = scheduler.dispatcher();
        let ran_on = scheduler
            .execute_sync(dispatcher.offload(Launch::Async, || thread::current().id()))
            .unwrap()
            .unwrap();
        assert_ne!(ran_on, here);
    }

    #[test]
    fn test_execute_sync_pumps_render_hops() {
        let scheduler = TaskScheduler::new(1).unwrap();
        let dispatcher = scheduler.dispatcher();

        // Worker section, then a device section that must land back on the
        // thread driving execute_sync.
        let driver = thread::current().id();
        let body = async move {
            let n = dispatcher.offload(Launch::Async, || 21).await.unwrap();
            dispatcher.render().run(move || (n * 2, thread::current().id())).await.unwrap()
        };
        let (value, upload_thread) = scheduler.execute_sync(body).unwrap();
        assert_eq!(value, 42);
        assert_eq!(upload_thread, driver);
    }

    #[test]
    fn test_spawned_build_completes() {
        let scheduler = TaskScheduler::new(1).unwrap();
        let (done_tx, done_rx) = flume::bounded(1);
        scheduler.spawn(Box::pin(async move {
            let _ = done_tx.send(5);
        }));
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 5);
    }
}
