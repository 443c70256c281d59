//! Typed-ish facade over `org.freedesktop.portal.Flatpak` (C3): the Spawn
//! and SpawnSignal methods, and the SpawnStarted/SpawnExited signals, the
//! supervisor drives every external process through. Grounded directly in
//! `dbus/flatpak_portal_proxy.h`'s `FlatpakPortalProxy`, built the way the
//! teacher talks to portals — a raw [`zbus::Proxy`] plus `.call()`/
//! `.receive_signal()`, not the `dbus_proxy` derive macro (see
//! `src/dbus/freedesktop_portal_settings.rs`).

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd as StdOwnedFd, RawFd};
use std::sync::Mutex;

use futures_util::StreamExt;
use zbus::zvariant::{self, Fd, Value};

use zypak_ipc::{FdMap, SandboxFlags as WireSandboxFlags, SpawnFlags as WireSpawnFlags};

const SERVICE: &str = "org.freedesktop.portal.Flatpak";
const PATH: &str = "/org/freedesktop/portal/Flatpak";
const INTERFACE: &str = "org.freedesktop.portal.Flatpak";

/// `kSupports_ExposePids`: set in the portal's `version` >= 4 `supports`
/// property when pid namespaces are exposed to the caller.
pub const SUPPORTS_EXPOSE_PIDS: u32 = 1 << 0;

/// The minimum portal version the spawn strategy requires, matching
/// `determine_strategy.cc`'s `kRequiredVersion`.
pub const REQUIRED_VERSION: u32 = 4;

/// Everything [`Portal::spawn`] needs to build one `Spawn` call.
pub struct SpawnCall {
    pub cwd: Vec<u8>,
    pub argv: Vec<String>,
    pub fds: FdMap,
    pub env: Vec<(String, String)>,
    pub flags: WireSpawnFlags,
    pub sandbox_flags: WireSandboxFlags,
    pub sandbox_expose_ro: Vec<StdOwnedFd>,
}

/// `SpawnStartedMessage` / `SpawnExitedMessage` from `flatpak_portal_proxy.h`,
/// folded into one enum since the supervisor handles both the same way:
/// look the stub up by external pid and update its state.
#[derive(Debug, Clone, Copy)]
pub enum SpawnEvent {
    Started { external_pid: u32, internal_pid: u32 },
    Exited { external_pid: u32, exit_status: u32 },
}

pub struct Portal<'a> {
    proxy: zbus::Proxy<'a>,
    /// Lazily-subscribed, then held for the proxy's lifetime: re-subscribing
    /// on every [`next_event`](Self::next_event) call would open a window
    /// between dropping the old match rule and installing the new one where
    /// a `SpawnStarted`/`SpawnExited` signal could be missed entirely.
    ///
    /// A `std::sync::Mutex` rather than a `RefCell` so `Portal` (and, by
    /// extension, `Supervisor`, which owns one) stays `Sync` and can be
    /// moved into the bus thread's `Send` task closures; this is only ever
    /// touched from the bus thread itself, so the lock is never contended.
    signals: Mutex<Option<(zbus::SignalStream<'a>, zbus::SignalStream<'a>)>>,
}

impl<'a> Portal<'a> {
    pub async fn attach(connection: &zbus::Connection) -> zbus::Result<Portal<'static>> {
        let proxy = zbus::Proxy::new(connection, SERVICE, PATH, INTERFACE).await?;
        Ok(Portal {
            proxy,
            signals: Mutex::new(None),
        })
    }

    pub async fn version(&self) -> zbus::Result<u32> {
        self.proxy.get_property("version").await
    }

    pub async fn supports(&self) -> zbus::Result<u32> {
        self.proxy.get_property("supports").await
    }

    pub async fn spawn(&self, call: SpawnCall) -> zbus::Result<u32> {
        let argv: Vec<&[u8]> = call.argv.iter().map(|arg| arg.as_bytes()).collect();
        let envs: HashMap<&str, &str> = call
            .env
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();

        let mut fds: HashMap<u32, Fd<'_>> = HashMap::new();
        for assignment in call.fds.iter() {
            fds.insert(assignment.target() as u32, Fd::from(assignment.source()));
        }

        let mut options: HashMap<&str, Value<'_>> = HashMap::new();
        options.insert("sandbox-flags", Value::from(call.sandbox_flags.bits()));
        if !call.sandbox_expose_ro.is_empty() {
            let exposed: Vec<Fd<'_>> = call
                .sandbox_expose_ro
                .iter()
                .map(|fd| Fd::from(fd.as_raw_fd() as RawFd))
                .collect();
            options.insert("sandbox-expose-fd-ro", Value::from(exposed));
        }

        self.proxy
            .call(
                "Spawn",
                &(&call.cwd, argv, fds, envs, call.flags.bits(), options),
            )
            .await
    }

    pub async fn spawn_signal(&self, pid: u32, signal: u32, allow_to_kill: bool) -> zbus::Result<()> {
        self.proxy
            .call("SpawnSignal", &(pid, signal, allow_to_kill))
            .await
    }

    /// Merges the two signals into one, as the supervisor only ever wants
    /// "something happened to an external pid" (`supervisor.cc`'s
    /// `HandleSpawnStarted` / `HandleSpawnExited` both just look the pid up
    /// in the same table). The match rules are installed once, the first
    /// time this is called, and kept alive across calls.
    pub async fn next_event(&self) -> zbus::Result<SpawnEvent> {
        let needs_subscribe = self.signals.lock().unwrap_or_else(|e| e.into_inner()).is_none();
        if needs_subscribe {
            let started = self.proxy.receive_signal("SpawnStarted").await?;
            let exited = self.proxy.receive_signal("SpawnExited").await?;
            *self.signals.lock().unwrap_or_else(|e| e.into_inner()) = Some((started, exited));
        }

        use futures_util::future::{select, Either};
        loop {
            let mut guard = self.signals.lock().unwrap_or_else(|e| e.into_inner());
            let (started, exited) = guard.as_mut().expect("initialised above");
            match select(started.next(), exited.next()).await {
                Either::Left((Some(signal), _)) => {
                    let (external_pid, internal_pid) =
                        signal.body().deserialize::<(u32, u32)>()?;
                    return Ok(SpawnEvent::Started {
                        external_pid,
                        internal_pid,
                    });
                }
                Either::Right((Some(signal), _)) => {
                    let (external_pid, exit_status) =
                        signal.body().deserialize::<(u32, u32)>()?;
                    return Ok(SpawnEvent::Exited {
                        external_pid,
                        exit_status,
                    });
                }
                Either::Left((None, _)) | Either::Right((None, _)) => {
                    return Err(zvariant::Error::Message(
                        "portal signal stream closed".to_owned(),
                    )
                    .into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_version_and_supports_bit_are_stable() {
        assert_eq!(REQUIRED_VERSION, 4);
        assert_eq!(SUPPORTS_EXPOSE_PIDS, 1);
    }
}
