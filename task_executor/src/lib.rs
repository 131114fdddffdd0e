//! A tokio [`Handle`] wrapper that propagates the calling thread's logging
//! destination into every task it spawns, so engine-thread work that fans
//! out across a tokio runtime still attributes log lines to the right Req.
//!
//! Every background thread in §5 (RPC receive threads, the heartbeat thread,
//! the CRC thread pool, per-backend worker threads) goes through this
//! wrapper rather than touching `tokio::spawn` directly.

use std::future::Future;
use std::sync::Arc;

use futures::future::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{JoinError, JoinHandle};

fn future_with_logging_context<F: Future>(future: F) -> impl Future<Output = F::Output> {
    let destination = logging::get_destination();
    logging::scope_task_destination(destination, future)
}

/// Either "borrowed" (wraps a `Handle` produced by someone else's `Runtime`,
/// e.g. a `#[tokio::main]`) or "owned" (holds its own `Runtime`, torn down
/// when the last clone drops). Mirrors the two lifecycles the engine needs:
/// the CLI's top-level runtime, and test harnesses that spin up their own.
#[derive(Clone)]
pub struct Executor {
    runtime: Arc<Mutex<Option<Runtime>>>,
    handle: Handle,
}

impl Executor {
    /// Wraps the `Handle` of whatever runtime is currently entered.
    pub fn new() -> Executor {
        Executor {
            runtime: Arc::new(Mutex::new(None)),
            handle: Handle::current(),
        }
    }

    /// Builds and owns a fresh multi-threaded runtime.
    pub fn new_owned(worker_threads: usize) -> Result<Executor, String> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .enable_all()
            .build()
            .map_err(|e| format!("failed to start the tokio runtime: {e}"))?;
        let handle = runtime.handle().clone();
        Ok(Executor {
            runtime: Arc::new(Mutex::new(Some(runtime))),
            handle,
        })
    }

    /// A clone that is disconnected from this Executor's shutdown lifecycle.
    pub fn to_borrowed(&self) -> Executor {
        Executor {
            runtime: Arc::new(Mutex::new(None)),
            handle: self.handle.clone(),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn enter<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = self.handle.enter();
        f()
    }

    /// Spawns `future` as a new task, recovering join errors (panics,
    /// cancellation) via `rescue`.
    pub fn spawn<O, F>(&self, future: F, rescue: impl FnOnce(JoinError) -> O + Send + 'static) -> impl Future<Output = O>
    where
        O: Send + 'static,
        F: Future<Output = O> + Send + 'static,
    {
        self.native_spawn(future).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue(e),
        })
    }

    pub fn native_spawn<O, F>(&self, future: F) -> JoinHandle<O>
    where
        O: Send + 'static,
        F: Future<Output = O> + Send + 'static,
    {
        self.handle.spawn(future_with_logging_context(future))
    }

    /// Runs `future` to completion on this executor, blocking the calling
    /// thread. Used only from something that resembles a main function.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future_with_logging_context(future))
    }

    pub fn spawn_blocking<F, R>(&self, f: F, rescue: impl FnOnce(JoinError) -> R + Send + 'static) -> impl Future<Output = R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let destination = logging::get_destination();
        let handle = self.handle.clone();
        handle
            .spawn_blocking(move || logging::scope_sync_destination(destination, f))
            .map(|res| match res {
                Ok(r) => r,
                Err(e) => rescue(e),
            })
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}
