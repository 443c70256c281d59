//! The bus thread (C2): owns the session-bus connection and a dedicated
//! worker thread that runs its own [`reactor::Loop`], the same
//! cross-thread-task-over-`calloop::channel` pattern the teacher uses to
//! bridge its screenshot/introspect D-Bus interfaces back onto its main
//! loop (`src/dbus/mod.rs`), just run in the other direction: callers on
//! any thread enqueue async work, the worker thread is where it actually
//! runs against the bus.
//!
//! Futures submitted here are driven by `calloop`'s own executor source
//! (the `executor`/`futures-io` features the teacher already depends on),
//! not a separate async runtime.

use std::future::Future;
use std::pin::Pin;
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use calloop::channel as calloop_channel;
use calloop::futures::executor;
use calloop::LoopHandle;

use crate::reactor::Loop;

/// A unit of bus-thread work, run synchronously on the worker thread as soon
/// as it is received (so it may register additional sources on `handle`,
/// e.g. the supervisor's request socket), then polled to completion by the
/// futures executor.
pub type Task = Box<
    dyn FnOnce(zbus::Connection, LoopHandle<'static, ()>) -> Pin<Box<dyn Future<Output = ()>>>
        + Send,
>;

/// `Created -> Running <-> Paused -> Shutdown`, matching the teacher-adjacent
/// upstream's bus-thread lifecycle exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Created,
    Running,
    Paused,
    Shutdown,
}

struct Worker {
    task_tx: calloop_channel::Sender<Task>,
    join_handle: JoinHandle<()>,
}

/// Serialises concurrent `fork()` attempts so a pause/resume pair around
/// the kernel `fork` is atomic per process.
pub fn fork_mutex() -> &'static Mutex<()> {
    static FORK_MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
    FORK_MUTEX.get_or_init(|| Mutex::new(()))
}

/// Owns the session-bus connection and the dedicated thread all bus
/// operations are serialised onto.
pub struct BusThread {
    connection: zbus::Connection,
    state: Mutex<State>,
    worker: Mutex<Option<Worker>>,
}

impl BusThread {
    /// Wraps an already-connected bus connection and starts the worker
    /// thread immediately.
    pub fn new(connection: zbus::Connection) -> anyhow::Result<Self> {
        let bus_thread = Self {
            connection,
            state: Mutex::new(State::Created),
            worker: Mutex::new(None),
        };
        bus_thread.start()?;
        Ok(bus_thread)
    }

    fn start(&self) -> anyhow::Result<()> {
        let (task_tx, task_rx) = calloop_channel::channel::<Task>();
        let connection = self.connection.clone();

        let join_handle = thread::Builder::new()
            .name("zypak bus thread".to_owned())
            .spawn(move || Self::run(connection, task_rx))?;

        *self.worker.lock().unwrap() = Some(Worker {
            task_tx,
            join_handle,
        });
        *self.state.lock().unwrap() = State::Running;
        Ok(())
    }

    fn run(connection: zbus::Connection, task_rx: calloop_channel::Channel<Task>) {
        let mut reactor = match Loop::create() {
            Ok(reactor) => reactor,
            Err(err) => {
                crate::logging::fatal(format_args!("bus thread: failed to create event loop: {err}"));
                return;
            }
        };

        let (executor, scheduler) = match executor::<()>() {
            Ok(pair) => pair,
            Err(err) => {
                crate::logging::fatal(format_args!("bus thread: failed to create executor: {err}"));
                return;
            }
        };

        if reactor
            .handle()
            .insert_source(executor, |(), _, ()| ())
            .is_err()
        {
            crate::logging::fatal("bus thread: failed to register futures executor");
            return;
        }

        let task_connection = connection.clone();
        let task_handle = reactor.handle();
        let inserted = reactor.handle().insert_source(task_rx, move |event, _, ()| {
            if let calloop_channel::Event::Msg(task) = event {
                let future = task(task_connection.clone(), task_handle.clone());
                // Futures here are not `Send`; this runs on the bus thread only.
                let _ = scheduler.schedule(future);
            }
        });
        if inserted.is_err() {
            crate::logging::fatal("bus thread: failed to register task channel");
            return;
        }

        loop {
            match reactor.wait(Some(Duration::from_secs(1))) {
                crate::reactor::WaitResult::Error => break,
                _ => {
                    if reactor.dispatch() == crate::reactor::DispatchResult::Exit {
                        break;
                    }
                }
            }
        }
    }

    /// Enqueues `task` on the worker thread and returns immediately. Used
    /// by every public mutating entrypoint that talks to the bus
    /// asynchronously.
    pub fn post(&self, task: Task) {
        let worker = self.worker.lock().unwrap();
        if let Some(worker) = worker.as_ref() {
            if worker.task_tx.send(task).is_err() {
                tracing::warn!("bus thread task queue is closed; dropping task");
            }
        } else {
            tracing::warn!("bus thread is paused or shut down; dropping task");
        }
    }

    /// Posts `make_future` to the worker thread and blocks the caller until
    /// it completes, returning its result. This is the supervisor's
    /// "blocking call" primitive: async + wait on a single-shot channel.
    pub fn call_blocking<T, F>(&self, make_future: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(zbus::Connection) -> Pin<Box<dyn Future<Output = T>>> + Send + 'static,
    {
        let (tx, rx): (SyncSender<T>, _) = sync_channel(1);
        self.post(Box::new(move |connection, _handle| {
            let future = make_future(connection);
            Box::pin(async move {
                let result = future.await;
                let _ = tx.send(result);
            })
        }));
        rx.recv()
            .map_err(|_| anyhow::anyhow!("bus thread dropped the reply channel"))
    }

    /// Stops the worker thread, joinable, but keeps the bus connection
    /// alive. Used to cross a `fork()` safely (threads do not survive a
    /// `fork`, so any copied worker thread in the child would be in an
    /// inconsistent state).
    pub fn pause(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state != State::Running {
            return Ok(());
        }

        if let Some(worker) = self.worker.lock().unwrap().take() {
            drop(worker.task_tx);
            worker
                .join_handle
                .join()
                .map_err(|_| anyhow::anyhow!("bus thread panicked"))?;
        }

        *state = State::Paused;
        Ok(())
    }

    /// Restarts the worker thread after [`pause`](Self::pause).
    pub fn resume(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state != State::Paused {
            return Ok(());
        }
        drop(state);
        self.start()?;
        Ok(())
    }

    /// Tears the bus thread down permanently. The connection is closed
    /// *after* the worker thread's event loop, so any teardown callback
    /// that touches the loop still finds it alive.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == State::Shutdown {
            return;
        }

        if let Some(worker) = self.worker.lock().unwrap().take() {
            drop(worker.task_tx);
            let _ = worker.join_handle.join();
        }

        *state = State::Shutdown;
    }

    /// Whether the worker thread is currently running.
    pub fn is_running(&self) -> bool {
        *self.state.lock().unwrap() == State::Running
    }
}

impl Drop for BusThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_mutex_is_a_single_process_wide_instance() {
        let a = fork_mutex() as *const _;
        let b = fork_mutex() as *const _;
        assert_eq!(a, b);
    }
}
