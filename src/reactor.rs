//! The single-threaded reactor (C1): a thin, spec-shaped façade over
//! `calloop`, the same event-loop crate the teacher compositor is built on.
//!
//! `calloop::EventLoop` already gives us the epoll multiplexing, timers,
//! and idle/ping sources; what this module adds is the handle/lifecycle
//! contract the broker and supervisor are written against: reference-counted
//! [`SourceRef`]s that the loop itself keeps one "floating" reference to,
//! destroy callbacks, and a single [`Events`] bitmask instead of calloop's
//! raw `Readiness`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd as StdOwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use calloop::generic::Generic;
use calloop::ping::{self, Ping};
use calloop::timer::{TimeoutAction, Timer};
pub use calloop::LoopHandle;
use calloop::{Interest, Mode, PostAction, RegistrationToken};

use zypak_ipc::OwnedFd;

/// Which direction(s) of traffic a handler is interested in on an FD source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Events {
    bits: u8,
}

impl Events {
    /// No interest (used only internally; registering with this is a bug).
    pub const NONE: Events = Events { bits: 0 };
    /// Readable.
    pub const READ: Events = Events { bits: 1 << 0 };
    /// Writable.
    pub const WRITE: Events = Events { bits: 1 << 1 };
    /// An error or hangup was reported for this source.
    pub const ERROR: Events = Events { bits: 1 << 2 };

    /// Union of two event sets.
    pub const fn or(self, other: Events) -> Events {
        Events {
            bits: self.bits | other.bits,
        }
    }

    /// Whether `self` includes everything in `other`.
    pub fn contains(self, other: Events) -> bool {
        self.bits & other.bits == other.bits
    }

    fn from_readiness(readiness: calloop::Readiness) -> Events {
        let mut events = Events::NONE;
        if readiness.readable {
            events = events.or(Events::READ);
        }
        if readiness.writable {
            events = events.or(Events::WRITE);
        }
        if readiness.error {
            events = events.or(Events::ERROR);
        }
        events
    }

    fn interest(self) -> Interest {
        Interest {
            readable: self.contains(Events::READ),
            writable: self.contains(Events::WRITE),
        }
    }
}

/// The lifecycle state of one registration in the loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    /// Fires repeatedly until explicitly disabled.
    ActiveForever,
    /// Fires once, then transitions to `Disabled` automatically.
    ActiveOnce,
    /// Will not fire again.
    Disabled,
}

struct SourceCell {
    token: RefCell<Option<RegistrationToken>>,
    handle: LoopHandle<'static, ()>,
    state: RefCell<SourceState>,
    on_destroy: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl Drop for SourceCell {
    fn drop(&mut self) {
        for handler in self.on_destroy.borrow_mut().drain(..) {
            handler();
        }
    }
}

/// A handle to one registration in the [`Loop`].
///
/// All `SourceRef`s are "floating": the loop itself keeps one clone alive
/// for as long as the source is enabled, so a caller may drop every handle
/// it holds without the source being torn down. Call [`disable`](Self::disable)
/// to actually remove it.
#[derive(Clone)]
pub struct SourceRef {
    cell: Rc<SourceCell>,
}

impl SourceRef {
    fn new(handle: LoopHandle<'static, ()>, token: RegistrationToken, once: bool) -> Self {
        Self {
            cell: Rc::new(SourceCell {
                token: RefCell::new(Some(token)),
                handle,
                state: RefCell::new(if once {
                    SourceState::ActiveOnce
                } else {
                    SourceState::ActiveForever
                }),
                on_destroy: RefCell::new(Vec::new()),
            }),
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SourceState {
        *self.cell.state.borrow()
    }

    /// Marks a one-shot source as fired; called by the loop right before
    /// running its handler.
    fn mark_fired_once(&self) {
        if *self.cell.state.borrow() == SourceState::ActiveOnce {
            *self.cell.state.borrow_mut() = SourceState::Disabled;
        }
    }

    /// Removes this source from the loop and drops the loop's floating
    /// reference to it. Destroy callbacks run once the last [`SourceRef`]
    /// (this one or any clone) is dropped.
    pub fn disable(&self) {
        if let Some(token) = self.cell.token.borrow_mut().take() {
            self.cell.handle.remove(token);
        }
        *self.cell.state.borrow_mut() = SourceState::Disabled;
    }

    /// Registers a callback to run exactly once, when this source's last
    /// reference is dropped.
    pub fn add_destroy_handler(&self, handler: impl FnOnce() + 'static) {
        self.cell.on_destroy.borrow_mut().push(Box::new(handler));
    }
}

/// A [`SourceRef`] that can be re-armed from any thread via [`trigger`](Self::trigger).
#[derive(Clone)]
pub struct TriggerRef {
    source: SourceRef,
    ping: Ping,
}

impl TriggerRef {
    /// Arranges for this trigger's handler to run on the next loop
    /// iteration. Safe to call from any thread, including while the loop
    /// is blocked in [`Loop::wait`].
    pub fn trigger(&self) {
        self.ping.ping();
    }

    /// The underlying source, e.g. to call [`SourceRef::disable`].
    pub fn source(&self) -> &SourceRef {
        &self.source
    }
}

/// Outcome of [`Loop::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// Events are ready; call [`Loop::dispatch`] next.
    Ready,
    /// Nothing was ready within the timeout; not an error.
    Idle,
    /// The underlying poll failed.
    Error,
}

/// Outcome of [`Loop::dispatch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchResult {
    /// Dispatch succeeded; call [`Loop::wait`] again.
    Continue,
    /// [`Loop::exit`] was called during this dispatch; stop looping.
    Exit,
    /// A handler or the underlying dispatch failed unrecoverably.
    Error,
}

/// The status an exited loop leaves behind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// Clean, successful termination.
    Success,
    /// Termination due to a failure.
    Failure,
}

/// A non-owning wrapper so [`Loop::add_fd`] can register a descriptor the
/// loop does not take ownership of.
struct BorrowedFdSource(RawFd);

impl AsFd for BorrowedFdSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.0) }
    }
}

/// Watches `fd` on a loop owned by another thread, given only its
/// [`LoopHandle`] (`calloop::LoopHandle` is `Send + Sync`; inserting through
/// it queues the registration for the loop's next iteration). This is how
/// the supervisor (C4) attaches its request socket to the bus thread's (C2)
/// loop from outside, mirroring `bus->loop()->Acquire()->AddFd(...)`.
pub fn watch_fd(
    handle: &LoopHandle<'static, ()>,
    fd: RawFd,
    events: Events,
    handler: impl FnMut(SourceRef, Events) + 'static,
) -> io::Result<SourceRef> {
    watch_fd_source(
        handle,
        Generic::new(BorrowedFdSource(fd), events.interest(), Mode::Level),
        handler,
    )
}

/// Schedules `handler` to run once, after at least `ms` milliseconds, given
/// only a [`LoopHandle`] rather than the owning [`Loop`] itself — lets a
/// handler already running on the loop (e.g. the broker's reap timer chain)
/// re-arm a timer on itself without borrowing the `Loop` it's inside of.
pub fn schedule_timer_ms(
    handle: &LoopHandle<'static, ()>,
    ms: u64,
    mut handler: impl FnMut(SourceRef) + 'static,
) -> io::Result<SourceRef> {
    let handle = handle.clone();
    let source_slot: Rc<RefCell<Option<SourceRef>>> = Rc::new(RefCell::new(None));
    let slot_for_cb = Rc::clone(&source_slot);

    let token = handle
        .insert_source(Timer::from_duration(Duration::from_millis(ms)), move |_, _, ()| {
            if let Some(source) = slot_for_cb.borrow().clone() {
                source.mark_fired_once();
                handler(source);
            }
            TimeoutAction::Drop
        })
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    let source = SourceRef::new(handle, token, true);
    *source_slot.borrow_mut() = Some(source.clone());
    Ok(source)
}

fn watch_fd_source<F: AsFd + 'static>(
    handle: &LoopHandle<'static, ()>,
    generic: Generic<F>,
    mut handler: impl FnMut(SourceRef, Events) + 'static,
) -> io::Result<SourceRef> {
    let handle = handle.clone();
    let source_slot: Rc<RefCell<Option<SourceRef>>> = Rc::new(RefCell::new(None));
    let slot_for_cb = Rc::clone(&source_slot);

    let token = handle
        .insert_source(generic, move |readiness, _, ()| {
            if let Some(source) = slot_for_cb.borrow().clone() {
                handler(source, Events::from_readiness(readiness));
            }
            Ok(PostAction::Continue)
        })
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    Ok(SourceRef::new(handle, token, false))
}

/// A cloneable capability to request [`Loop`] termination from inside one
/// of its own handlers, without that handler needing to borrow the `Loop`
/// itself (its FD/timer/task callbacks already run through calloop's own
/// borrow of the loop).
#[derive(Clone)]
pub struct ExitHandle {
    exit_status: Rc<RefCell<Option<ExitStatus>>>,
    signal: calloop::LoopSignal,
}

impl ExitHandle {
    /// Requests the loop stop after the current dispatch, same as
    /// [`Loop::exit`].
    pub fn exit(&self, status: ExitStatus) {
        *self.exit_status.borrow_mut() = Some(status);
        self.signal.stop();
    }
}

/// The single-threaded reactor: I/O sources, timers, one-shot tasks, and
/// re-armable triggers, all dispatched from whichever thread owns it.
pub struct Loop {
    event_loop: calloop::EventLoop<'static, ()>,
    exit_status: Rc<RefCell<Option<ExitStatus>>>,
}

impl Loop {
    /// Constructs a new reactor.
    pub fn create() -> io::Result<Self> {
        let event_loop = calloop::EventLoop::try_new()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        Ok(Self {
            event_loop,
            exit_status: Rc::new(RefCell::new(None)),
        })
    }

    /// A handle that can be used to register sources from callbacks running
    /// on this same loop.
    pub fn handle(&self) -> LoopHandle<'static, ()> {
        self.event_loop.handle()
    }

    /// Schedules `handler` to run once, on the next iteration.
    pub fn add_task(&self, mut handler: impl FnMut(SourceRef) + 'static) -> io::Result<SourceRef> {
        let handle = self.handle();
        let source_slot: Rc<RefCell<Option<SourceRef>>> = Rc::new(RefCell::new(None));
        let slot_for_cb = Rc::clone(&source_slot);

        let token = handle
            .insert_source(Timer::immediate(), move |_deadline, _, ()| {
                if let Some(source) = slot_for_cb.borrow().clone() {
                    source.mark_fired_once();
                    handler(source);
                }
                TimeoutAction::Drop
            })
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

        let source = SourceRef::new(handle, token, true);
        *source_slot.borrow_mut() = Some(source.clone());
        Ok(source)
    }

    /// Registers a re-armable trigger; initially it will not fire until
    /// [`TriggerRef::trigger`] is called.
    pub fn add_trigger(&self, mut handler: impl FnMut(SourceRef) + 'static) -> io::Result<TriggerRef> {
        let handle = self.handle();
        let (ping, ping_source) =
            ping::make_ping().map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

        let source_slot: Rc<RefCell<Option<SourceRef>>> = Rc::new(RefCell::new(None));
        let slot_for_cb = Rc::clone(&source_slot);

        let token = handle
            .insert_source(ping_source, move |(), _, ()| {
                if let Some(source) = slot_for_cb.borrow().clone() {
                    handler(source);
                }
            })
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

        let source = SourceRef::new(handle, token, false);
        *source_slot.borrow_mut() = Some(source.clone());
        Ok(TriggerRef { source, ping })
    }

    /// Schedules `handler` to run once, after at least `ms` milliseconds.
    /// Coarse accuracy is acceptable (spec tolerates ~50ms slack).
    pub fn add_timer_ms(
        &self,
        ms: u64,
        handler: impl FnMut(SourceRef) + 'static,
    ) -> io::Result<SourceRef> {
        schedule_timer_ms(&self.handle(), ms, handler)
    }

    /// Watches `fd` without taking ownership of it; the loop never closes it.
    pub fn add_fd(
        &self,
        fd: RawFd,
        events: Events,
        handler: impl FnMut(SourceRef, Events) + 'static,
    ) -> io::Result<SourceRef> {
        watch_fd_source(
            &self.handle(),
            Generic::new(BorrowedFdSource(fd), events.interest(), Mode::Level),
            handler,
        )
    }

    /// Watches `fd`, taking ownership of it; the loop closes it when the
    /// source is disabled and dropped.
    pub fn take_fd(
        &self,
        fd: OwnedFd,
        events: Events,
        handler: impl FnMut(SourceRef, Events) + 'static,
    ) -> io::Result<SourceRef> {
        let std_owned: StdOwnedFd = fd.into();
        watch_fd_source(
            &self.handle(),
            Generic::new(std_owned, events.interest(), Mode::Level),
            handler,
        )
    }

    /// Blocks until something is ready, the wait times out, or the loop
    /// hits an error. `timeout: None` blocks indefinitely.
    pub fn wait(&mut self, timeout: Option<Duration>) -> WaitResult {
        match self.event_loop.dispatch(timeout, &mut ()) {
            Ok(()) => {
                if self.exit_status.borrow().is_some() {
                    WaitResult::Ready
                } else {
                    WaitResult::Idle
                }
            }
            Err(_) => WaitResult::Error,
        }
    }

    /// Runs any handlers calloop's own `dispatch` already invoked during
    /// [`wait`](Self::wait). calloop folds wait+dispatch into one call, so
    /// this only resolves the exit/continue verdict.
    pub fn dispatch(&mut self) -> DispatchResult {
        match *self.exit_status.borrow() {
            Some(ExitStatus::Success) | Some(ExitStatus::Failure) => DispatchResult::Exit,
            None => DispatchResult::Continue,
        }
    }

    /// Requests the loop stop after the current dispatch.
    pub fn exit(&self, status: ExitStatus) {
        *self.exit_status.borrow_mut() = Some(status);
        self.event_loop.get_signal().stop();
    }

    /// A cloneable handle that can request termination from inside a
    /// handler this same loop is running, e.g. when an I/O source observes
    /// its peer close cleanly.
    pub fn exit_handle(&self) -> ExitHandle {
        ExitHandle {
            exit_status: Rc::clone(&self.exit_status),
            signal: self.event_loop.get_signal(),
        }
    }

    /// The status passed to [`exit`](Self::exit). Panics if the loop has
    /// not exited yet, mirroring the teacher's own "not allowed before
    /// Exit" contract.
    pub fn exit_status(&self) -> ExitStatus {
        self.exit_status
            .borrow()
            .expect("exit_status() called before exit()")
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn task_fires_once() {
        let mut reactor = Loop::create().unwrap();
        let count = Rc::new(Cell::new(0));
        let count2 = Rc::clone(&count);
        reactor
            .add_task(move |_| {
                count2.set(count2.get() + 1);
            })
            .unwrap();

        reactor.wait(Some(Duration::from_millis(100)));
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn trigger_fires_after_ping() {
        let mut reactor = Loop::create().unwrap();
        let fired = Rc::new(Cell::new(false));
        let fired2 = Rc::clone(&fired);
        let trigger = reactor
            .add_trigger(move |_| {
                fired2.set(true);
            })
            .unwrap();

        trigger.trigger();
        reactor.wait(Some(Duration::from_millis(100)));
        assert!(fired.get());
    }

    #[test]
    fn exit_status_reflects_requested_status() {
        let reactor = Loop::create().unwrap();
        reactor.exit(ExitStatus::Success);
        assert_eq!(reactor.exit_status(), ExitStatus::Success);
    }
}
