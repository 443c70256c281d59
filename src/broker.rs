//! The Zygote broker (C5): speaks the engine's own Zygote wire protocol
//! (`zypak_ipc::zygote_wire`) on [`ZYGOTE_HOST_FD`], forking children
//! through whichever [`BrokerStrategy`] [`crate::strategy::probe`] picked,
//! and answering `Reap`/`GetTerminationStatus`/`SandboxStatus` queries
//! about them.
//!
//! Grounded in `sandbox/zygote/zygote.cc` (the dispatch loop),
//! `sandbox/mimic_strategy/fork.cc` + `mimic_launcher_delegate.cc` (the
//! mimic path), `sandbox/spawn_strategy/spawn_launcher_delegate.cc` +
//! `run.cc` (the spawn-strategy stub client), and `sandbox/zygote/reap.cc`
//! (the reap timer loop).

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use zypak_ipc::zygote_wire::{self, CommandTag, TerminationStatusTag};
use zypak_ipc::{
    ByteReader, CredSocket, FdAssignment, FdMap, OwnedFd, SandboxStatusFlags, StubPid, WireError,
};

use crate::bus_thread::BusThread;
use crate::env;
use crate::launcher::{Delegate, Flags, Launcher};
use crate::reactor::{schedule_timer_ms, Events, ExitHandle, ExitStatus, Loop, LoopHandle};
use crate::supervisor::{ExitStatusResult, Supervisor};

/// How long `Reap(pid)` waits for a natural exit before sending `SIGKILL`
/// and rescheduling itself (spec.md §4.5, §8 scenario 4).
const REAP_TIMEOUT_MS: u64 = 2000;

/// The fixed descriptor the Zygote host speaks its wire protocol on.
pub const ZYGOTE_HOST_FD: RawFd = 3;
/// The fixed descriptor synthesized into every forked child's FD map, for
/// the child's own sandbox-service IPC.
pub const SANDBOX_SERVICE_FD: RawFd = 4;
/// One-way handshake a mimic-strategy child writes on its pid-oracle
/// socket right before exec, confirming it survived the fork.
pub const CHILD_PING: &[u8] = b"CHILD_PING";

const RECV_BUF_LEN: usize = zygote_wire::MAX_FRAME_LEN;

/// Which strategy the broker forks children through, decided once per
/// process by [`crate::strategy::probe`].
pub enum BrokerStrategy {
    /// Local `fork()` plus a `flatpak-spawn` re-exec.
    Mimic,
    /// Route through the spawn-strategy supervisor and the portal.
    Spawn(Arc<Supervisor>),
}

/// Tracks whether a mimic-strategy child has already been sent `SIGKILL`
/// by the reap timer loop (`reap.cc`'s `sent_sigkill_`: sent at most once).
#[derive(Default)]
struct ReapState {
    sent_sigkill: bool,
}

/// The Zygote broker: owns [`ZYGOTE_HOST_FD`] and answers every command on
/// it per [`BrokerStrategy`].
pub struct Broker {
    host_socket: CredSocket,
    strategy: BrokerStrategy,
    bus: Arc<BusThread>,
    reap_state: HashMap<i32, ReapState>,
    exit_handle: Option<ExitHandle>,
    reactor_handle: Option<LoopHandle<'static, ()>>,
    self_weak: Weak<RefCell<Broker>>,
}

impl Broker {
    /// Wraps the inherited Zygote host socket and picks a strategy. `bus` is
    /// paused around every fork this broker performs (spec.md §5, §8
    /// scenario 6), regardless of which strategy is active.
    pub fn new(strategy: BrokerStrategy, bus: Arc<BusThread>) -> Self {
        Self {
            host_socket: CredSocket::from_owned(unsafe { OwnedFd::from_raw_fd(ZYGOTE_HOST_FD) }),
            strategy,
            bus,
            reap_state: HashMap::new(),
            exit_handle: None,
            reactor_handle: None,
            self_weak: Weak::new(),
        }
    }

    /// Registers the Zygote host socket on `reactor`, dispatching every
    /// frame it delivers until the loop exits (cleanly, once the Zygote
    /// host closes its end, or fatally on an unrecoverable error).
    pub fn attach(broker: Rc<RefCell<Broker>>, reactor: &Loop) -> std::io::Result<()> {
        {
            let mut inner = broker.borrow_mut();
            inner.exit_handle = Some(reactor.exit_handle());
            inner.reactor_handle = Some(reactor.handle());
            inner.self_weak = Rc::downgrade(&broker);
        }
        let fd = broker.borrow().host_socket.as_raw_fd();
        reactor.add_fd(fd, Events::READ, move |_source, _events| {
            broker.borrow_mut().on_readable();
        })?;
        Ok(())
    }

    /// Schedules the next `waitpid(WNOHANG)` check for `pid`, `delay_ms`
    /// from now (`reap.cc`'s own timer-driven reap loop).
    fn schedule_reap_check(&self, pid: i32, delay_ms: u64) {
        let Some(handle) = self.reactor_handle.clone() else {
            return;
        };
        let self_weak = self.self_weak.clone();
        let result = schedule_timer_ms(&handle, delay_ms, move |_source| {
            if let Some(broker) = self_weak.upgrade() {
                broker.borrow_mut().on_reap_timer(pid);
            }
        });
        if let Err(err) = result {
            tracing::warn!("broker: failed to schedule reap timer for pid {pid}: {err}");
        }
    }

    /// Fires `REAP_TIMEOUT_MS` after a `Reap(pid)` request (and again after
    /// every subsequent `SIGKILL`, until the child is actually collected):
    /// checks for a natural exit, escalates to `SIGKILL` exactly once, and
    /// keeps rescheduling itself until `waitpid` confirms the child is gone.
    fn on_reap_timer(&mut self, pid: i32) {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                let already_killed = self
                    .reap_state
                    .get(&pid)
                    .map(|state| state.sent_sigkill)
                    .unwrap_or(false);
                if !already_killed {
                    let _ =
                        nix::sys::signal::kill(Pid::from_raw(pid), nix::sys::signal::Signal::SIGKILL);
                    if let Some(state) = self.reap_state.get_mut(&pid) {
                        state.sent_sigkill = true;
                    }
                }
                self.schedule_reap_check(pid, REAP_TIMEOUT_MS);
            }
            _ => {
                // Exited, signalled, or no longer a child of ours either
                // way: the reap is complete and the entry is retired.
                self.reap_state.remove(&pid);
            }
        }
    }

    fn on_readable(&mut self) {
        let mut buf = [0u8; RECV_BUF_LEN];
        let received = match self.host_socket.recv(&mut buf) {
            Ok(received) => received,
            Err(err) => {
                self.fatal_exit(format_args!("broker: failed to read zygote host fd: {err}"));
                return;
            }
        };

        if received.len == 0 {
            info!("broker: zygote host closed its end of the socket; exiting cleanly");
            if let Some(handle) = &self.exit_handle {
                handle.exit(ExitStatus::Success);
            }
            return;
        }

        let (tag, mut reader) = match zygote_wire::read_command_tag(&buf[..received.len]) {
            Ok(parsed) => parsed,
            Err(err @ WireError::UnknownCommandTag(_)) => {
                // An out-of-range enum in a received message is a fatal
                // internal error, not a transient one (spec.md §7).
                self.fatal_exit(format_args!(
                    "broker: out-of-range command tag from zygote host: {err}"
                ));
                return;
            }
            Err(err) => {
                tracing::warn!("broker: malformed frame from zygote host: {err}");
                return;
            }
        };

        let result = match tag {
            CommandTag::Fork => self.handle_fork(&mut reader, received.fds),
            CommandTag::Reap => self.handle_reap(&mut reader),
            CommandTag::GetTerminationStatus => self.handle_termination_status(&mut reader),
            CommandTag::SandboxStatus => self.handle_sandbox_status(),
            CommandTag::ForkRealPID => {
                tracing::warn!("broker: unexpected unsolicited ForkRealPID frame");
                Ok(())
            }
        };

        if let Err(err) = result {
            if is_fatal_wire_error(&err) {
                // An out-of-range enum, or an unexpected FD count with a
                // Fork command, is fatal internal (spec.md §7): logged and
                // aborted, not merely warned about.
                self.fatal_exit(format_args!("broker: fatal error handling {tag:?}: {err}"));
            } else {
                tracing::warn!("broker: error handling {tag:?}: {err}");
            }
        }
    }

    /// Logs `message` as a fatal diagnostic and requests the reactor exit
    /// with failure, matching spec.md §7's "Fatal internal: logged and
    /// abort" contract.
    fn fatal_exit(&self, message: std::fmt::Arguments<'_>) {
        crate::logging::fatal(message);
        if let Some(handle) = &self.exit_handle {
            handle.exit(ExitStatus::Failure);
        }
    }

    fn handle_fork(
        &mut self,
        reader: &mut ByteReader<'_>,
        ancillary_fds: Vec<OwnedFd>,
    ) -> anyhow::Result<()> {
        let request = zygote_wire::read_fork_request(reader, ancillary_fds.len())?;

        let mut fds = ancillary_fds.into_iter();
        let pid_oracle = fds
            .next()
            .ok_or_else(|| anyhow::anyhow!("fork request missing pid-oracle fd"))?;
        let keyed: Vec<OwnedFd> = fds.collect();

        let mut fd_map = FdMap::new();
        for (key, source) in request.fd_keys.iter().zip(keyed) {
            fd_map.push(FdAssignment::new(source, key + 3))?;
        }
        let sandbox_service_dup = unistd::dup(SANDBOX_SERVICE_FD)?;
        fd_map.push(FdAssignment::new(
            unsafe { OwnedFd::from_raw_fd(sandbox_service_dup) },
            SANDBOX_SERVICE_FD,
        ))?;

        // The Zygote host's own argv[0] (`/proc/self/exe`) is meaningless
        // once re-exec'd through this broker; rewrite it to the real
        // caller binary (SPEC_FULL.md §2, `fork.cc`'s `SpawnZygoteChild`).
        let mut argv = request.argv;
        if let Some(first) = argv.first_mut() {
            if let Ok(real_exe) = std::fs::read_link(format!("/proc/{}/exe", unistd::getppid())) {
                *first = real_exe.to_string_lossy().into_owned();
            }
        }

        let child_pid = match &self.strategy {
            BrokerStrategy::Mimic => Launcher::new(&MimicDelegate { bus: &self.bus })
                .run(Some(&request.process_type), argv, fd_map)?,
            BrokerStrategy::Spawn(_) => Launcher::new(&SpawnDelegate { bus: &self.bus })
                .run(Some(&request.process_type), argv, fd_map)?,
        };

        if matches!(self.strategy, BrokerStrategy::Mimic) {
            let pid_oracle_socket = CredSocket::from_owned(pid_oracle);
            let mut ping_buf = [0u8; 16];
            match pid_oracle_socket.recv(&mut ping_buf) {
                Ok(received) if &ping_buf[..received.len] == CHILD_PING => {}
                _ => {
                    tracing::warn!("broker: child {child_pid} did not confirm via CHILD_PING");
                }
            }
        }

        self.host_socket
            .send(&zygote_wire::write_fork_reply(child_pid, ""), &[])?;

        // The Zygote host confirms the pid it observed with its own
        // `waitpid`-visible child; a mismatch or missing confirmation means
        // the fork is unusable to it, so the broker kills the real child
        // rather than leave an orphan neither side tracks.
        let mut confirm_buf = [0u8; RECV_BUF_LEN];
        let confirmed = match self.host_socket.recv(&mut confirm_buf) {
            Ok(received) => zygote_wire::read_command_tag(&confirm_buf[..received.len])
                .ok()
                .filter(|(tag, _)| *tag == CommandTag::ForkRealPID)
                .and_then(|(_, mut r)| zygote_wire::read_fork_real_pid(&mut r).ok()),
            Err(_) => None,
        };

        if confirmed != Some(child_pid) {
            tracing::warn!("broker: no ForkRealPID confirmation for child {child_pid}; killing it");
            let _ = nix::sys::signal::kill(Pid::from_raw(child_pid), nix::sys::signal::Signal::SIGKILL);
        }

        Ok(())
    }

    fn handle_reap(&mut self, reader: &mut ByteReader<'_>) -> anyhow::Result<()> {
        let pid = zygote_wire::read_reap_request(reader)?;

        match &self.strategy {
            BrokerStrategy::Mimic => {
                self.reap_state.entry(pid).or_default();
                self.schedule_reap_check(pid, REAP_TIMEOUT_MS);
            }
            BrokerStrategy::Spawn(supervisor) => {
                // The supervisor already reaps lazily the first time a
                // caller collects the exit status; nothing to schedule here.
                let _ = supervisor.get_exit_status(StubPid(pid));
            }
        }
        Ok(())
    }

    fn handle_termination_status(&mut self, reader: &mut ByteReader<'_>) -> anyhow::Result<()> {
        let request = zygote_wire::read_termination_status_request(reader)?;

        let (tag, raw_wstatus) = match &self.strategy {
            BrokerStrategy::Mimic => {
                let flag = if request.known_dead {
                    None
                } else {
                    Some(WaitPidFlag::WNOHANG)
                };
                match waitpid(Pid::from_raw(request.pid), flag) {
                    Ok(status) => {
                        let raw = wait_status_to_raw(&status);
                        (classify_wstatus(raw), raw)
                    }
                    Err(_) if !request.known_dead => (TerminationStatusTag::Running, 0),
                    Err(_) => (TerminationStatusTag::Crashed, -1),
                }
            }
            BrokerStrategy::Spawn(supervisor) => {
                let result = if request.known_dead {
                    supervisor.wait_for_exit_status(StubPid(request.pid))
                } else {
                    supervisor.get_exit_status(StubPid(request.pid))
                };
                match result {
                    ExitStatusResult::Ok(raw) => (classify_wstatus(raw), raw),
                    ExitStatusResult::TryLater => (TerminationStatusTag::Running, 0),
                    ExitStatusResult::NotFound => (TerminationStatusTag::Crashed, -1),
                }
            }
        };

        self.host_socket
            .send(&zygote_wire::write_termination_status_reply(tag, raw_wstatus), &[])?;
        Ok(())
    }

    fn handle_sandbox_status(&mut self) -> anyhow::Result<()> {
        let flags = probe_sandbox_status();
        self.host_socket
            .send(&zygote_wire::write_sandbox_status_reply(flags), &[])?;
        Ok(())
    }
}

/// Whether `err` is one of the wire-protocol violations spec.md §7
/// classifies as fatal internal (out-of-range enum, unexpected FD count
/// with a Fork command), as opposed to an ordinary I/O or logic failure
/// that a `tracing::warn!` and continuing is enough to handle.
fn is_fatal_wire_error(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<WireError>(),
        Some(WireError::FdCountMismatch { .. } | WireError::UnknownCommandTag(_))
    )
}

/// Maps a terminating signal number to its wire tag (spec.md §4.5:
/// `SIGINT`/`SIGKILL`/`SIGTERM` are `Killed`, anything else is `Crashed`).
fn classify_signal(signal: i32) -> TerminationStatusTag {
    match signal {
        libc::SIGINT | libc::SIGKILL | libc::SIGTERM => TerminationStatusTag::Killed,
        _ => TerminationStatusTag::Crashed,
    }
}

/// Converts a raw `wstatus` into the wire's `TerminationStatusTag`.
///
/// Exit codes above 128 are themselves a shell-style encoding of "killed by
/// signal `code - 128`" (spec.md §4.5), so they get re-mapped through
/// [`classify_signal`] rather than treated as a merely abnormal exit.
fn classify_wstatus(raw_wstatus: i32) -> TerminationStatusTag {
    if libc::WIFEXITED(raw_wstatus) {
        let code = libc::WEXITSTATUS(raw_wstatus);
        if code == 0 {
            TerminationStatusTag::Normal
        } else if code > 128 {
            classify_signal(code - 128)
        } else {
            TerminationStatusTag::Abnormal
        }
    } else if libc::WIFSIGNALED(raw_wstatus) {
        classify_signal(libc::WTERMSIG(raw_wstatus))
    } else {
        TerminationStatusTag::Running
    }
}

fn wait_status_to_raw(status: &nix::sys::wait::WaitStatus) -> i32 {
    use nix::sys::wait::WaitStatus::*;
    match *status {
        Exited(_, code) => (code & 0xff) << 8,
        Signaled(_, signal, _) => signal as i32,
        _ => 0,
    }
}

/// `SandboxStatus`: a best-effort probe of which hardening this process
/// actually runs under, read straight from `/proc/self`.
fn probe_sandbox_status() -> SandboxStatusFlags {
    let mut flags = SandboxStatusFlags::empty();

    if differs_from_init("pid") {
        flags |= SandboxStatusFlags::PID_NS;
    }
    if differs_from_init("net") {
        flags |= SandboxStatusFlags::NET_NS;
    }
    if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
        for line in status.lines() {
            if let Some(value) = line.strip_prefix("Seccomp:") {
                if value.trim() != "0" {
                    flags |= SandboxStatusFlags::BPF;
                }
            }
        }
    }

    flags
}

fn differs_from_init(namespace: &str) -> bool {
    let self_ns = std::fs::read_link(format!("/proc/self/ns/{namespace}"));
    let init_ns = std::fs::read_link(format!("/proc/1/ns/{namespace}"));
    matches!((self_ns, init_ns), (Ok(a), Ok(b)) if a != b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wstatus_exited(code: i32) -> i32 {
        (code & 0xff) << 8
    }

    fn wstatus_signaled(signal: i32) -> i32 {
        signal
    }

    #[test]
    fn exited_zero_is_normal() {
        assert_eq!(classify_wstatus(wstatus_exited(0)), TerminationStatusTag::Normal);
    }

    #[test]
    fn exited_nonzero_is_abnormal() {
        assert_eq!(classify_wstatus(wstatus_exited(13)), TerminationStatusTag::Abnormal);
    }

    #[test]
    fn signaled_sigsegv_is_crashed() {
        assert_eq!(
            classify_wstatus(wstatus_signaled(libc::SIGSEGV)),
            TerminationStatusTag::Crashed
        );
    }

    #[test]
    fn signaled_sigint_sigkill_sigterm_are_killed() {
        for signal in [libc::SIGINT, libc::SIGKILL, libc::SIGTERM] {
            assert_eq!(classify_wstatus(wstatus_signaled(signal)), TerminationStatusTag::Killed);
        }
    }

    #[test]
    fn exit_code_above_128_is_remapped_to_a_signal() {
        // spec.md §8 scenario 5: exit code 137 means "killed by signal 9".
        assert_eq!(classify_wstatus(wstatus_exited(137)), TerminationStatusTag::Killed);
    }

    #[test]
    fn neither_exited_nor_signaled_is_running() {
        // A raw wstatus with neither WIFEXITED nor WIFSIGNALED set (e.g. a
        // stopped-child notification) has no terminal classification yet.
        assert_eq!(classify_wstatus(0x7f), TerminationStatusTag::Running);
    }

    #[test]
    fn fd_count_mismatch_and_unknown_command_tag_are_fatal() {
        let fd_count_mismatch = anyhow::Error::new(WireError::FdCountMismatch {
            declared: 1,
            delivered: 0,
        });
        let unknown_tag = anyhow::Error::new(WireError::UnknownCommandTag(0xff));
        assert!(is_fatal_wire_error(&fd_count_mismatch));
        assert!(is_fatal_wire_error(&unknown_tag));
    }

    #[test]
    fn other_errors_are_not_fatal() {
        let err = anyhow::anyhow!("fork request missing pid-oracle fd");
        assert!(!is_fatal_wire_error(&err));
    }
}

/// Pauses `bus` before the kernel `fork()`, serialised through the
/// process-wide [`crate::bus_thread::fork_mutex`] so two concurrent forks
/// can never interleave their pause/resume pairs, and resumes it in the
/// parent afterwards. The child gets the bus fully shut down instead of
/// resumed: a forked child never runs bus-thread code (spec.md §5, §8
/// scenario 6).
fn fork_around_bus(bus: &Arc<BusThread>) -> anyhow::Result<ForkResult> {
    let _guard = crate::bus_thread::fork_mutex()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    bus.pause()?;
    let result = unsafe { unistd::fork() };
    match &result {
        Ok(ForkResult::Parent { .. }) => bus.resume()?,
        Ok(ForkResult::Child) => bus.shutdown(),
        Err(_) => bus.resume()?,
    }
    Ok(result?)
}

/// The mimic-strategy [`Delegate`]: re-execs through `flatpak-spawn`,
/// grounded in `mimic_launcher_delegate.cc`.
struct MimicDelegate<'a> {
    bus: &'a Arc<BusThread>,
}

impl Delegate for MimicDelegate<'_> {
    fn spawn(
        &self,
        command: Vec<String>,
        fd_map: &FdMap,
        env: Vec<(String, String)>,
        flags: Flags,
    ) -> anyhow::Result<i32> {
        let mut argv = vec!["flatpak-spawn".to_owned()];
        if flags.contains(Flags::WATCH_BUS) {
            argv.push("--watch-bus".to_owned());
        }
        if !flags.contains(Flags::ALLOW_NETWORK) {
            argv.push("--no-network".to_owned());
        }
        // `--sandbox` is only passed when GPU access is *not* allowed, even
        // though sandboxing is requested independently of GPU access far
        // more often than not. Preserved as-is rather than "fixed".
        if !flags.contains(Flags::ALLOW_GPU) && flags.contains(Flags::SANDBOX) {
            argv.push("--sandbox".to_owned());
        }
        for (name, value) in &env {
            argv.push(format!("--env={name}={value}"));
        }
        for assignment in fd_map.iter() {
            argv.push(format!("--forward-fd={}", assignment.serialize()));
        }
        argv.extend(command);

        match fork_around_bus(self.bus)? {
            ForkResult::Parent { child } => Ok(child.as_raw()),
            ForkResult::Child => {
                let _ = unistd::chdir("/");
                let c_argv: Vec<CString> = argv
                    .iter()
                    .map(|arg| CString::new(arg.as_str()).unwrap_or_default())
                    .collect();
                let _ = unistd::execvp(&c_argv[0], &c_argv);
                std::process::exit(127);
            }
        }
    }
}

/// The spawn-strategy [`Delegate`]: forks a short-lived local stub that
/// speaks the supervisor's private `SPAWN\0`/`EXIT\0` protocol on
/// [`crate::supervisor::REQUEST_FD`], grounded in
/// `spawn_strategy/spawn_launcher_delegate.cc` + `run.cc`.
struct SpawnDelegate<'a> {
    bus: &'a Arc<BusThread>,
}

impl Delegate for SpawnDelegate<'_> {
    fn spawn(
        &self,
        command: Vec<String>,
        fd_map: &FdMap,
        env: Vec<(String, String)>,
        flags: Flags,
    ) -> anyhow::Result<i32> {
        match fork_around_bus(self.bus)? {
            ForkResult::Parent { child } => Ok(child.as_raw()),
            ForkResult::Child => {
                if let Err(err) = run_spawn_stub(command, fd_map, env, flags) {
                    crate::logging::fatal(format_args!("spawn stub: {err}"));
                    std::process::exit(1);
                }
                std::process::exit(0);
            }
        }
    }
}

fn run_spawn_stub(
    argv: Vec<String>,
    fd_map: &FdMap,
    env: Vec<(String, String)>,
    flags: Flags,
) -> anyhow::Result<()> {
    use zypak_ipc::supervisor_wire::{self, SpawnFdEntry, SpawnReply};
    use zypak_ipc::{SandboxFlags, SpawnFlags};

    let (local_raw, remote_raw) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::empty(),
    )?;
    let local = CredSocket::from_owned(unsafe { OwnedFd::from_raw_fd(local_raw) });
    let remote = unsafe { OwnedFd::from_raw_fd(remote_raw) };

    let mut spawn_flags = SpawnFlags::EXPOSE_PIDS | SpawnFlags::EMIT_SPAWN_STARTED;
    if flags.contains(Flags::WATCH_BUS) {
        spawn_flags |= SpawnFlags::WATCH_BUS;
    }
    if flags.contains(Flags::SANDBOX) {
        spawn_flags |= SpawnFlags::SANDBOX;
    }
    if !flags.contains(Flags::ALLOW_NETWORK) {
        spawn_flags |= SpawnFlags::NO_NETWORK;
    }

    let mut sandbox_flags = SandboxFlags::empty();
    if flags.contains(Flags::ALLOW_GPU) {
        sandbox_flags |= SandboxFlags::SHARE_GPU;
    }

    let entries: Vec<SpawnFdEntry> = fd_map
        .iter()
        .enumerate()
        .map(|(index, assignment)| SpawnFdEntry {
            ancillary_index: index,
            target_fd: assignment.target(),
        })
        .collect();
    let forwarded: Vec<RawFd> = fd_map.iter().map(|assignment| assignment.source()).collect();

    let exposed_paths = env::get(env::ZYPAK_EXPOSE_WIDEVINE_PATH)
        .into_iter()
        .collect();

    let request = supervisor_wire::SpawnRequest {
        argv,
        env,
        exposed_paths,
        fds: entries,
        spawn_flags,
        sandbox_flags,
    };
    let body = supervisor_wire::write_spawn_request(&request);

    let request_socket = CredSocket::from_owned(unsafe {
        OwnedFd::from_raw_fd(crate::supervisor::REQUEST_FD)
    });
    let mut ancillary = vec![remote.as_raw_fd()];
    ancillary.extend(forwarded);
    request_socket.send(&body, &ancillary)?;
    drop(remote);

    let mut buf = [0u8; RECV_BUF_LEN];
    let received = local.recv(&mut buf)?;
    let mut reader = ByteReader::new(&buf[..received.len]);
    match supervisor_wire::read_spawn_reply(&mut reader)? {
        SpawnReply::Ok(_) => {}
        SpawnReply::TryLater | SpawnReply::Failed => {
            anyhow::bail!("supervisor rejected spawn request");
        }
    }

    loop {
        let received = local.recv(&mut buf)?;
        let mut reader = ByteReader::new(&buf[..received.len]);
        if let Ok(notification) = supervisor_wire::read_exit_notification(&mut reader) {
            let code = classify_wstatus(notification.raw_wstatus);
            std::process::exit(matches!(code, TerminationStatusTag::Normal) as i32);
        }
    }
}
