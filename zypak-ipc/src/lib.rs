//! Low-level primitives and wire types shared between the `zypak-sandbox`
//! broker/supervisor and anything that speaks its wire protocols.
//!
//! This crate has no event-loop or D-Bus dependency: it only knows how to
//! encode/decode bytes and manage file descriptors. The broker loop, bus
//! thread, and portal client that actually move these bytes over sockets
//! and the session bus live in the `zypak-sandbox` binary crate.
#![warn(missing_docs)]

mod error;
mod fd;
mod guarded;
mod pid;
mod rw;
mod socket;

pub mod supervisor_wire;
pub mod zygote_wire;

pub use error::WireError;
pub use fd::{FdAssignment, FdMap, OwnedFd};
pub use guarded::{Guarded, GuardedValue, Notify};
pub use pid::{ExternalPid, InternalPid, StubPid};
pub use rw::{ByteReader, ByteWriter};
pub use socket::{retry_eintr, CredSocket, RecvResult, EINTR_RETRY_LIMIT};

use bitflags::bitflags;

bitflags! {
    /// Flags passed to the portal's `Spawn` method, and the wire
    /// representation the supervisor protocol uses for the same bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SpawnFlags: u32 {
        /// Clear the spawned process's environment before applying `env`.
        const CLEAR_ENV = 1 << 0;
        /// Spawn the latest revision of the calling Flatpak.
        const SPAWN_LATEST = 1 << 1;
        /// Run the spawned process inside a sandbox.
        const SANDBOX = 1 << 2;
        /// Deny the spawned process network access.
        const NO_NETWORK = 1 << 3;
        /// Terminate the spawned process if the caller disappears from the bus.
        const WATCH_BUS = 1 << 4;
        /// Ask the portal to report the spawned process's PIDs.
        const EXPOSE_PIDS = 1 << 5;
        /// Ask the portal to emit `SpawnStarted` for this spawn.
        const EMIT_SPAWN_STARTED = 1 << 6;
    }
}

bitflags! {
    /// Sandbox flags forwarded to the portal alongside a `Spawn` call.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SandboxFlags: u32 {
        /// Share the caller's display with the sandboxed process.
        const SHARE_DISPLAY = 1 << 0;
        /// Share the caller's sound server with the sandboxed process.
        const SHARE_SOUND = 1 << 1;
        /// Share the caller's GPU with the sandboxed process.
        const SHARE_GPU = 1 << 2;
        /// Share the caller's session bus with the sandboxed process.
        const SESSION_BUS = 1 << 3;
        /// Share the caller's accessibility bus with the sandboxed process.
        const A11Y_BUS = 1 << 4;
    }
}

bitflags! {
    /// Capability bitmask reported by the `SandboxStatus` zygote command.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SandboxStatusFlags: u32 {
        /// The legacy setuid sandbox is engaged.
        const SUID = 1 << 0;
        /// The process runs in its own PID namespace.
        const PID_NS = 1 << 1;
        /// The process runs in its own network namespace.
        const NET_NS = 1 << 2;
        /// A seccomp-bpf filter is engaged.
        const BPF = 1 << 3;
        /// The seccomp-bpf filter is thread-synchronized (TSYNC).
        const BPF_TSYNC = 1 << 4;
    }
}
