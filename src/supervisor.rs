//! The spawn-strategy supervisor (C4): the process-wide object that turns
//! a stub's private `SPAWN`/`EXIT` protocol (`zypak_ipc::supervisor_wire`)
//! into portal `Spawn`/`SpawnSignal` calls, and tracks the resulting
//! external/internal PIDs until a caller asks for, or the portal reports,
//! their exit status.
//!
//! Grounded in `preload/host/spawn_strategy/supervisor.{h,cc}`. The
//! request-socket/bus-thread dance (registering a raw fd from outside the
//! thread that owns its loop) mirrors `InitAndAttachToBusThread`.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};

use nix::fcntl::{open, OFlag};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::stat::Mode;
use nix::unistd::dup2;

use zypak_ipc::supervisor_wire::{self, ExitNotification, SpawnReply, SpawnRequest};
use zypak_ipc::{
    ByteReader, CredSocket, ExternalPid, FdAssignment, FdMap, GuardedValue, InternalPid, Notify,
    OwnedFd, SandboxFlags, SpawnFlags, StubPid,
};

use crate::bus_thread::BusThread;
use crate::env;
use crate::portal::{Portal, SpawnCall, SpawnEvent};
use crate::reactor::{self, Events};

/// Spawn flags a stub may legally request.
const ALLOWED_SPAWN_FLAGS: SpawnFlags = SpawnFlags::EXPOSE_PIDS
    .union(SpawnFlags::EMIT_SPAWN_STARTED)
    .union(SpawnFlags::NO_NETWORK)
    .union(SpawnFlags::SANDBOX)
    .union(SpawnFlags::WATCH_BUS);

/// Sandbox flags a stub may legally request alongside [`SpawnFlags::SANDBOX`].
const ALLOWED_SANDBOX_FLAGS: SandboxFlags = SandboxFlags::SHARE_GPU;

/// Well-known descriptor a stub process finds its request channel on
/// (`kZypakSupervisorFd`).
pub const REQUEST_FD: RawFd = 235;

const RECV_BUF_LEN: usize = 12 * 1024;

/// What the supervisor has learned about one in-flight or exited spawn.
struct StubPidData {
    external: Option<ExternalPid>,
    internal: Option<InternalPid>,
    /// `Some(raw_wstatus)` once the portal has reported this pid exited.
    exit_status: Option<i32>,
    /// The stub's own socket half: spawn acks and the eventual `EXIT\0`
    /// reply are written here.
    notify_exit: CredSocket,
}

#[derive(Default)]
struct State {
    by_stub: HashMap<i32, StubPidData>,
    external_to_stub: HashMap<i32, i32>,
}

/// Outcome of an exit-status query: the `{Ok, NotFound, TryLater}` contract
/// for `GetExitStatus`/`WaitForExitStatus`.
pub enum ExitStatusResult {
    /// The process has exited; this is its raw `wstatus`.
    Ok(i32),
    /// No stub is tracked under that pid.
    NotFound,
    /// The stub is tracked but has not exited yet.
    TryLater,
}

/// Outcome of [`Supervisor::send_signal`].
pub enum SignalResult {
    /// The signal was delivered.
    Ok,
    /// No stub is tracked under that pid.
    NotFound,
    /// The portal refused the `SpawnSignal` call.
    Failed,
}

/// The process-wide spawn-strategy supervisor.
pub struct Supervisor {
    bus: Arc<BusThread>,
    portal: Portal<'static>,
    state: GuardedValue<State>,
    request_socket: CredSocket,
    /// The single globally configured "widevine" path stubs may ask to
    /// have exposed read-only, if any (`ZYPAK_EXPOSE_WIDEVINE_PATH`).
    widevine_path: Option<String>,
}

impl Supervisor {
    /// Creates the request socket pair, `dup2`s its child half onto
    /// [`REQUEST_FD`], attaches the supervisor half to `bus`'s loop, and
    /// attaches the portal proxy. Call once per process, before any child
    /// is forked, so every fork inherits [`REQUEST_FD`] already open.
    pub fn attach(bus: Arc<BusThread>) -> anyhow::Result<Arc<Supervisor>> {
        let (supervisor_raw, child_raw) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::empty(),
        )?;

        let request_socket =
            CredSocket::from_owned(unsafe { OwnedFd::from_raw_fd(supervisor_raw) });
        request_socket.enable_receive_credentials()?;

        dup2(child_raw, REQUEST_FD)?;
        // The pre-dup2 descriptor is redundant once REQUEST_FD refers to
        // the same open file description; close it via the owning wrapper.
        drop(unsafe { OwnedFd::from_raw_fd(child_raw) });

        let portal = bus
            .call_blocking(|connection| {
                Box::pin(async move { Portal::attach(&connection).await })
            })
            .map_err(|err| anyhow::anyhow!("supervisor: bus thread call failed: {err}"))??;

        let request_fd = request_socket.as_raw_fd();

        let supervisor = Arc::new_cyclic(|weak: &Weak<Supervisor>| {
            Self::start_background_tasks(&bus, Weak::clone(weak), request_fd);

            Supervisor {
                bus,
                portal,
                state: GuardedValue::new(State::default()),
                request_socket,
                widevine_path: env::get(env::ZYPAK_EXPOSE_WIDEVINE_PATH),
            }
        });

        Ok(supervisor)
    }

    /// Posts the two long-lived bus-thread tasks every supervisor needs:
    /// watching [`REQUEST_FD`]'s peer half for spawn requests, and draining
    /// the portal's `SpawnStarted`/`SpawnExited` signal stream forever.
    fn start_background_tasks(bus: &Arc<BusThread>, weak: Weak<Supervisor>, request_fd: RawFd) {
        let watch_weak = weak.clone();
        bus.post(Box::new(move |_connection, loop_handle| {
            Box::pin(async move {
                let handler_weak = watch_weak;
                let registered =
                    reactor::watch_fd(&loop_handle, request_fd, Events::READ, move |_source, _events| {
                        if let Some(supervisor) = handler_weak.upgrade() {
                            supervisor.handle_spawn_request();
                        }
                    });
                if let Err(err) = registered {
                    crate::logging::fatal(format_args!(
                        "supervisor: failed to watch request fd: {err}"
                    ));
                }
            })
        }));

        let events_weak = weak;
        bus.post(Box::new(move |_connection, _loop_handle| {
            Box::pin(async move {
                loop {
                    let Some(supervisor) = events_weak.upgrade() else {
                        return;
                    };
                    let portal = &supervisor.portal;
                    match portal.next_event().await {
                        Ok(SpawnEvent::Started {
                            external_pid,
                            internal_pid,
                        }) => supervisor.handle_spawn_started(external_pid, internal_pid),
                        Ok(SpawnEvent::Exited {
                            external_pid,
                            exit_status,
                        }) => supervisor.handle_spawn_exited(external_pid, exit_status),
                        Err(err) => {
                            tracing::warn!("supervisor: portal event stream error: {err}");
                            return;
                        }
                    }
                }
            })
        }));
    }

    /// Reads one spawn request off [`REQUEST_FD`]'s peer half, synchronously
    /// (a readiness callback on the bus thread's own loop), then hands the
    /// async portal call off to a posted task.
    fn handle_spawn_request(self: &Arc<Self>) {
        let mut buf = [0u8; RECV_BUF_LEN];
        let received = match self.request_socket.recv(&mut buf) {
            Ok(received) => received,
            Err(err) => {
                tracing::warn!("supervisor: failed to read spawn request: {err}");
                return;
            }
        };

        let Some(stub_pid) = received.pid else {
            tracing::warn!("supervisor: spawn request missing peer credentials; ignoring");
            return;
        };

        let mut fds = received.fds.into_iter();
        let Some(notify_fd) = fds.next() else {
            tracing::warn!("supervisor: spawn request from pid {stub_pid} missing reply fd; ignoring");
            return;
        };
        let forwarded: Vec<OwnedFd> = fds.collect();

        let mut reader = ByteReader::new(&buf[..received.len]);
        let request = match supervisor_wire::read_spawn_request(&mut reader) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!("supervisor: malformed spawn request from pid {stub_pid}: {err}");
                return;
            }
        };

        self.fulfill_spawn_request(StubPid(stub_pid), request, notify_fd, forwarded);
    }

    fn fulfill_spawn_request(
        self: &Arc<Self>,
        stub: StubPid,
        request: SpawnRequest,
        notify_fd: OwnedFd,
        forwarded: Vec<OwnedFd>,
    ) {
        {
            let mut state = self.state.acquire(Notify::None);
            state.by_stub.insert(
                stub.0,
                StubPidData {
                    external: None,
                    internal: None,
                    exit_status: None,
                    notify_exit: CredSocket::from_owned(notify_fd),
                },
            );
        }

        let supervisor = Arc::clone(self);
        self.bus.post(Box::new(move |_connection, _loop_handle| {
            Box::pin(async move { supervisor.spawn_via_portal(stub, request, forwarded).await })
        }));
    }

    /// Rejects flag combinations or exposed paths a stub has no business
    /// requesting before any portal call is made.
    fn validate_spawn_request(&self, request: &SpawnRequest) -> Result<(), String> {
        if !ALLOWED_SPAWN_FLAGS.contains(request.spawn_flags) {
            return Err(format!(
                "spawn flags {:?} are not a subset of the allowed set",
                request.spawn_flags
            ));
        }
        if !ALLOWED_SANDBOX_FLAGS.contains(request.sandbox_flags) {
            return Err(format!(
                "sandbox flags {:?} are not a subset of the allowed set",
                request.sandbox_flags
            ));
        }
        if !env::truthy(env::ZYPAK_DISABLE_SANDBOX) && !request.spawn_flags.contains(SpawnFlags::SANDBOX) {
            return Err("global sandbox is enabled but this request did not set Sandbox".to_owned());
        }
        match request.exposed_paths.as_slice() {
            [] => Ok(()),
            [only] if self.widevine_path.as_deref() == Some(only.as_str()) => Ok(()),
            other => Err(format!(
                "exposed paths {other:?} do not match the configured widevine path"
            )),
        }
    }

    /// Opens the configured widevine path `O_PATH|O_NOFOLLOW`, if the
    /// request asked for it, for forwarding as `sandbox-expose-fd-ro`.
    fn open_exposed_paths(&self, request: &SpawnRequest) -> anyhow::Result<Vec<std::os::fd::OwnedFd>> {
        if request.exposed_paths.is_empty() {
            return Ok(Vec::new());
        }
        let path = &request.exposed_paths[0];
        let raw = open(path.as_str(), OFlag::O_PATH | OFlag::O_NOFOLLOW, Mode::empty())
            .map_err(|err| anyhow::anyhow!("failed to open exposed path {path}: {err}"))?;
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(vec![owned.into()])
    }

    async fn spawn_via_portal(
        self: Arc<Self>,
        stub: StubPid,
        request: SpawnRequest,
        forwarded: Vec<OwnedFd>,
    ) {
        if let Err(reason) = self.validate_spawn_request(&request) {
            tracing::warn!("supervisor: rejecting spawn request from stub {stub}: {reason}");
            self.fail_spawn(stub);
            return;
        }

        let mut forwarded: HashMap<usize, OwnedFd> = forwarded.into_iter().enumerate().collect();

        let mut fd_map = FdMap::new();
        for entry in &request.fds {
            let Some(source) = forwarded.remove(&entry.ancillary_index) else {
                tracing::warn!(
                    "supervisor: spawn request for stub {} named fd index {} with no matching ancillary fd",
                    stub,
                    entry.ancillary_index
                );
                self.fail_spawn(stub);
                return;
            };
            if fd_map
                .push(FdAssignment::new(source, entry.target_fd))
                .is_err()
            {
                tracing::warn!("supervisor: stub {stub} sent a duplicate fd assignment");
                self.fail_spawn(stub);
                return;
            }
        }

        let sandbox_expose_ro = match self.open_exposed_paths(&request) {
            Ok(fds) => fds,
            Err(err) => {
                tracing::warn!("supervisor: stub {stub}: {err}");
                self.fail_spawn(stub);
                return;
            }
        };

        let call = SpawnCall {
            cwd: Vec::new(),
            argv: request.argv,
            fds: fd_map,
            env: request.env,
            flags: request.spawn_flags,
            sandbox_flags: request.sandbox_flags,
            sandbox_expose_ro,
        };

        match self.portal.spawn(call).await {
            Ok(external_pid) => {
                let mut state = self.state.acquire(Notify::All);
                state
                    .external_to_stub
                    .insert(external_pid as i32, stub.0);
                if let Some(data) = state.by_stub.get_mut(&stub.0) {
                    data.external = Some(ExternalPid(external_pid as i32));
                    let reply = supervisor_wire::write_spawn_reply(SpawnReply::Ok(external_pid as i32));
                    if let Err(err) = data.notify_exit.send(&reply, &[]) {
                        tracing::warn!("supervisor: failed to ack spawn for stub {stub}: {err}");
                    }
                }
            }
            Err(err) => {
                tracing::warn!("supervisor: portal Spawn failed for stub {stub}: {err}");
                drop(err);
                self.fail_spawn(stub);
            }
        }
    }

    fn fail_spawn(&self, stub: StubPid) {
        let mut state = self.state.acquire(Notify::All);
        if let Some(data) = state.by_stub.get_mut(&stub.0) {
            let reply = supervisor_wire::write_spawn_reply(SpawnReply::Failed);
            let _ = data.notify_exit.send(&reply, &[]);
        }
    }

    /// `HandleSpawnStarted`: sets the internal pid once known. A started
    /// event for an external pid the supervisor is not tracking is logged
    /// and ignored, not treated as an error.
    fn handle_spawn_started(&self, external_pid: u32, internal_pid: u32) {
        let mut state = self.state.acquire(Notify::All);
        let Some(&stub) = state.external_to_stub.get(&(external_pid as i32)) else {
            tracing::warn!("supervisor: SpawnStarted for untracked external pid {external_pid}");
            return;
        };
        if let Some(data) = state.by_stub.get_mut(&stub) {
            data.internal = Some(InternalPid(internal_pid as i32));
        }
    }

    /// `HandleSpawnExited`: records the raw exit status. Reaping (closing
    /// out the table entry) only happens later, when a caller actually
    /// collects the status via [`get_exit_status`](Self::get_exit_status)
    /// or [`wait_for_exit_status`](Self::wait_for_exit_status).
    fn handle_spawn_exited(&self, external_pid: u32, exit_status: u32) {
        let mut state = self.state.acquire(Notify::All);
        let Some(&stub) = state.external_to_stub.get(&(external_pid as i32)) else {
            tracing::warn!("supervisor: SpawnExited for untracked external pid {external_pid}");
            return;
        };
        if let Some(data) = state.by_stub.get_mut(&stub) {
            data.exit_status = Some(exit_status as i32);
            let notification = ExitNotification {
                external_pid: external_pid as i32,
                raw_wstatus: exit_status as i32,
            };
            let bytes = supervisor_wire::write_exit_notification(notification);
            if let Err(err) = data.notify_exit.send(&bytes, &[]) {
                // The stub never learns it may exit on its own; force it,
                // matching spec.md §4.4's reaping contract.
                tracing::warn!(
                    "supervisor: failed to notify stub {stub} of exit ({err}); sending SIGKILL"
                );
                let _ =
                    nix::sys::signal::kill(nix::unistd::Pid::from_raw(stub.0), nix::sys::signal::Signal::SIGKILL);
            }
        }
    }

    /// Removes a stub's table entry, after joining the underlying stub
    /// process with `waitpid` so it does not linger as a zombie (spec.md
    /// §4.4's reaping contract). Called once a caller has collected a
    /// final exit status and has no further use for the entry.
    fn reap(&self, stub: StubPid) {
        let mut state = self.state.acquire(Notify::None);
        if let Some(data) = state.by_stub.remove(&stub.0) {
            if let Some(external) = data.external {
                state.external_to_stub.remove(&external.0);
            }
        }
        drop(state);
        let _ = nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(stub.0), None);
    }

    /// Non-blocking exit-status query, keyed by the local stub pid the
    /// broker tracks as its "child".
    pub fn get_exit_status(&self, stub: StubPid) -> ExitStatusResult {
        let mut state = self.state.acquire(Notify::None);
        let Some(data) = state.by_stub.get(&stub.0) else {
            return ExitStatusResult::NotFound;
        };
        match data.exit_status {
            Some(raw) => {
                drop(state);
                self.reap(stub);
                ExitStatusResult::Ok(raw)
            }
            None => ExitStatusResult::TryLater,
        }
    }

    /// Blocks until `stub`'s exit status is known, or returns immediately
    /// with [`ExitStatusResult::NotFound`] if it was never tracked.
    pub fn wait_for_exit_status(&self, stub: StubPid) -> ExitStatusResult {
        if !self.state.acquire(Notify::None).by_stub.contains_key(&stub.0) {
            return ExitStatusResult::NotFound;
        }
        let guard = self
            .state
            .acquire_when(|state| match state.by_stub.get(&stub.0) {
                Some(data) => data.exit_status.is_some(),
                None => true,
            });
        let raw = guard.by_stub.get(&stub.0).and_then(|data| data.exit_status);
        drop(guard);
        match raw {
            Some(raw) => {
                self.reap(stub);
                ExitStatusResult::Ok(raw)
            }
            None => ExitStatusResult::NotFound,
        }
    }

    /// Blocks until the portal has reported an internal pid for `stub`,
    /// returning `None` if the stub is not tracked.
    pub fn find_internal_pid_blocking(&self, stub: StubPid) -> Option<InternalPid> {
        if !self.state.acquire(Notify::None).by_stub.contains_key(&stub.0) {
            return None;
        }
        let guard = self
            .state
            .acquire_when(|state| match state.by_stub.get(&stub.0) {
                Some(data) => data.internal.is_some(),
                None => true,
            });
        guard.by_stub.get(&stub.0).and_then(|data| data.internal)
    }

    /// Sends a signal to the external process tracked under `stub`, via the
    /// portal's `SpawnSignal` method.
    pub fn send_signal(&self, stub: StubPid, signal: i32, allow_to_kill: bool) -> SignalResult {
        let external = {
            let state = self.state.acquire(Notify::None);
            match state.by_stub.get(&stub.0).and_then(|data| data.external) {
                Some(external) => external,
                None => return SignalResult::NotFound,
            }
        };

        let result = self.bus.call_blocking(move |connection| {
            Box::pin(async move {
                let portal = match Portal::attach(&connection).await {
                    Ok(portal) => portal,
                    Err(err) => return Err(err),
                };
                portal
                    .spawn_signal(external.0 as u32, signal as u32, allow_to_kill)
                    .await
            })
        });

        match result {
            Ok(Ok(())) => SignalResult::Ok,
            _ => SignalResult::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_spawn_flags_excludes_clear_env_and_latest() {
        assert!(!ALLOWED_SPAWN_FLAGS.contains(SpawnFlags::CLEAR_ENV));
        assert!(!ALLOWED_SPAWN_FLAGS.contains(SpawnFlags::SPAWN_LATEST));
        assert!(ALLOWED_SPAWN_FLAGS.contains(SpawnFlags::SANDBOX));
        assert!(ALLOWED_SPAWN_FLAGS.contains(SpawnFlags::WATCH_BUS));
    }

    #[test]
    fn allowed_sandbox_flags_is_share_gpu_only() {
        assert_eq!(ALLOWED_SANDBOX_FLAGS, SandboxFlags::SHARE_GPU);
        assert!(!ALLOWED_SANDBOX_FLAGS.contains(SandboxFlags::SHARE_DISPLAY));
    }
}
