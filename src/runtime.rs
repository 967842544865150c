//! The process runtime: one event loop on a dedicated worker thread,
//! bridging blocking and non-blocking call sites.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::container::{make_container, Container, ContainerScope};
use crate::lifetime::Lifetime;

type SyncTask = Box<dyn FnOnce() + Send>;

struct RuntimeInner {
    rt: Mutex<Option<tokio::runtime::Runtime>>,
    counter: Mutex<u32>,
    sync_ctx: AtomicBool,
    tasks_tx: Mutex<mpsc::Sender<SyncTask>>,
    tasks_rx: Mutex<mpsc::Receiver<SyncTask>>,
    container: Arc<Container>,
}

static GLOBAL: Lazy<Runtime> = Lazy::new(Runtime::new);

/// Process-lifetime runtime owning the event loop and the runtime-scoped
/// container ladder.
///
/// `start`/`stop` are reference counted: the loop starts on the first
/// start and shuts down on the last stop. [`Runtime::enter`] additionally
/// opens the process container scope and tears it down on drop.
///
/// The loop accepts both sync callers ([`Runtime::invoke_sync`] drives a
/// future to completion while pumping a queue of sync tasks scheduled by
/// the loop onto the calling thread) and async callers
/// ([`Runtime::invoke_async`] dispatches blocking work to a blocking
/// thread, unless a sync pump is active, in which case the work runs on
/// the pumping thread).
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// A fresh runtime with its own container ladder down to the RUNTIME
    /// rung.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            inner: Arc::new(RuntimeInner {
                rt: Mutex::new(None),
                counter: Mutex::new(0),
                sync_ctx: AtomicBool::new(false),
                tasks_tx: Mutex::new(tx),
                tasks_rx: Mutex::new(rx),
                container: make_container(Vec::new(), Some(Lifetime::Runtime)),
            }),
        }
    }

    /// The process-wide runtime instance.
    pub fn global() -> &'static Runtime {
        &GLOBAL
    }

    /// The runtime-lifetime container.
    pub fn container(&self) -> &Arc<Container> {
        &self.inner.container
    }

    pub fn active(&self) -> bool {
        self.inner.rt.lock().unwrap().is_some()
    }

    /// Start the loop; counted, only the first call spawns the worker.
    pub fn start(&self) {
        let mut counter = self.inner.counter.lock().unwrap();
        if *counter == 0 {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("modulith-runtime")
                .enable_all()
                .build()
                .expect("event loop construction");
            *self.inner.rt.lock().unwrap() = Some(rt);
            tracing::info!("runtime started");
        }
        *counter += 1;
    }

    /// Stop the loop; counted, only the last call shuts the worker down.
    pub fn stop(&self) {
        let mut counter = self.inner.counter.lock().unwrap();
        if *counter == 1 {
            if let Some(rt) = self.inner.rt.lock().unwrap().take() {
                rt.shutdown_timeout(Duration::from_secs(1));
            }
            tracing::info!("runtime stopped");
        }
        *counter = counter.saturating_sub(1);
    }

    /// Start the loop and enter the process container scope; the returned
    /// guard reverses both.
    pub fn enter(&self) -> RuntimeScope {
        self.start();
        RuntimeScope {
            scope: Some(self.inner.container.scope()),
            runtime: self.clone(),
        }
    }

    fn handle(&self) -> Option<tokio::runtime::Handle> {
        self.inner.rt.lock().unwrap().as_ref().map(|rt| rt.handle().clone())
    }

    /// Drive `future` to completion from a blocking thread.
    ///
    /// While the loop works on the future, this thread drains the sync
    /// task queue so that async code can hand work back via
    /// [`invoke_async`](Self::invoke_async) without deadlocking.
    pub fn invoke_sync<F>(&self, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let started_here = !self.active();
        if started_here {
            self.start();
        }
        let handle = self.handle().expect("runtime active");

        let (tx, rx) = mpsc::channel();
        handle.spawn(async move {
            let _ = tx.send(future.await);
        });
        let result = self.pump_until(rx);

        if started_here {
            self.stop();
        }
        result
    }

    fn pump_until<R>(&self, rx: mpsc::Receiver<R>) -> R {
        self.inner.sync_ctx.store(true, Ordering::SeqCst);
        let result = loop {
            while let Ok(task) = self.inner.tasks_rx.lock().unwrap().try_recv() {
                task();
            }
            match rx.recv_timeout(Duration::from_micros(100)) {
                Ok(result) => break result,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("runtime task dropped its result")
                }
            }
        };
        self.inner.sync_ctx.store(false, Ordering::SeqCst);
        // tasks enqueued between completion and the flag flip
        while let Ok(task) = self.inner.tasks_rx.lock().unwrap().try_recv() {
            task();
        }
        result
    }

    /// Run blocking `f` from async code: on a blocking thread normally, on
    /// the pumping thread when a sync bridge is active.
    pub async fn invoke_async<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.inner.sync_ctx.load(Ordering::SeqCst) {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let task: SyncTask = Box::new(move || {
                let _ = tx.send(f());
            });
            let _ = self.inner.tasks_tx.lock().unwrap().send(task);
            rx.await.expect("sync pump dropped the task")
        } else {
            match tokio::task::spawn_blocking(f).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => panic!("blocking task failed: {e}"),
            }
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard for an entered runtime: holds the process container scope and the
/// start refcount.
pub struct RuntimeScope {
    scope: Option<ContainerScope>,
    runtime: Runtime,
}

impl RuntimeScope {
    pub fn container(&self) -> &Arc<Container> {
        self.runtime.container()
    }
}

impl Drop for RuntimeScope {
    fn drop(&mut self) {
        self.scope.take();
        self.runtime.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_stop_is_refcounted() {
        let rt = Runtime::new();
        assert!(!rt.active());
        rt.start();
        rt.start();
        rt.stop();
        assert!(rt.active());
        rt.stop();
        assert!(!rt.active());
    }

    #[test]
    fn invoke_sync_drives_futures() {
        let rt = Runtime::new();
        let out = rt.invoke_sync(async { 2 + 2 });
        assert_eq!(out, 4);
        assert!(!rt.active());
    }

    #[test]
    fn invoke_async_round_trips_through_the_pump() {
        let rt = Runtime::new();
        let inner = rt.clone();
        let out = rt.invoke_sync(async move {
            // sync work scheduled from async code lands on the pumping thread
            inner.invoke_async(|| 21 * 2).await
        });
        assert_eq!(out, 42);
    }

    #[test]
    fn enter_opens_and_closes_the_container_scope() {
        let rt = Runtime::new();
        {
            let scope = rt.enter();
            assert!(rt.active());
            assert!(scope.container().get::<Container>().is_some());
        }
        assert!(!rt.active());
        assert!(rt.container().get::<Container>().is_none());
    }
}
