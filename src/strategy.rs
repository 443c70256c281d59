//! Zygote strategy probe (C7): decides, once per process, whether Zygote
//! forks should go through the mimic strategy (local `fork()` +
//! `flatpak-spawn`) or the spawn strategy (routed through the container
//! portal via the [`supervisor`](crate::supervisor)).
//!
//! Grounded in `helper/determine_strategy.cc`.

use std::fs;
use std::sync::Arc;

use zypak_ipc::{SandboxFlags, SpawnFlags};

use crate::bus_thread::BusThread;
use crate::env;
use crate::portal::{Portal, SpawnCall, SpawnEvent};

/// Which strategy forks should use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Local `fork()` plus a `flatpak-spawn` re-exec.
    Mimic,
    /// Route through the spawn-strategy supervisor and the portal.
    Spawn,
}

/// Reads `/.flatpak-info`'s `[Context]` `devices` key, returning whether it
/// grants `all` (the portal's `ExposePids` support is only trustworthy
/// inside a sandbox that already has full device access, per
/// `IsDeviceAllPermissionGranted`).
fn device_all_permission_granted() -> bool {
    let Ok(contents) = fs::read_to_string("/.flatpak-info") else {
        return false;
    };

    let mut in_context = false;
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_context = line == "[Context]";
            continue;
        }
        if !in_context {
            continue;
        }
        if let Some(value) = line.strip_prefix("devices=") {
            return value.split(';').any(|item| item == "all");
        }
    }
    false
}

/// `CheckRequiredPortalFeatures`: the portal must be at least
/// [`crate::portal::REQUIRED_VERSION`] and report `ExposePids` support.
async fn portal_supports_spawn_strategy(portal: &Portal<'static>) -> bool {
    let version = match portal.version().await {
        Ok(version) => version,
        Err(err) => {
            tracing::warn!("strategy probe: failed to read portal version: {err}");
            return false;
        }
    };
    if version < crate::portal::REQUIRED_VERSION {
        return false;
    }

    match portal.supports().await {
        Ok(supports) => supports & crate::portal::SUPPORTS_EXPOSE_PIDS != 0,
        Err(err) => {
            tracing::warn!("strategy probe: failed to read portal supports bitmask: {err}");
            false
        }
    }
}

/// `IsExposePidsBroken`: spawns a canary `/bin/true` with `ExposePids` and
/// blocks for its exit status; a non-zero exit is treated as evidence the
/// portal's PID-exposure is broken on this host.
async fn canary_spawn_is_broken(portal: &Portal<'static>) -> bool {
    let call = SpawnCall {
        cwd: b"/".to_vec(),
        argv: vec!["/bin/true".to_owned()],
        fds: zypak_ipc::FdMap::new(),
        env: Vec::new(),
        flags: SpawnFlags::SANDBOX | SpawnFlags::EXPOSE_PIDS | SpawnFlags::WATCH_BUS,
        sandbox_flags: SandboxFlags::empty(),
        sandbox_expose_ro: Vec::new(),
    };

    let external_pid = match portal.spawn(call).await {
        Ok(pid) => pid,
        Err(err) => {
            tracing::warn!("strategy probe: canary spawn failed: {err}");
            return true;
        }
    };

    loop {
        match portal.next_event().await {
            Ok(SpawnEvent::Exited {
                external_pid: exited,
                exit_status,
            }) if exited == external_pid => return exit_status != 0,
            Ok(_) => continue,
            Err(err) => {
                tracing::warn!("strategy probe: canary event stream error: {err}");
                return true;
            }
        }
    }
}

/// `DetermineZygoteStrategy`: if [`env::ZYPAK_ZYGOTE_STRATEGY_SPAWN`] is
/// already set, honors it verbatim and returns without touching the bus.
/// Otherwise probes the portal and the canary spawn, then sets the
/// environment variable to the decided value as its side-effecting output
/// — callers read the decision back via [`env::truthy`] on the same name,
/// matching the original's "decision lives in the environment" contract.
pub fn probe(bus: &Arc<BusThread>) -> anyhow::Result<Strategy> {
    if let Some(forced) = env::get(env::ZYPAK_ZYGOTE_STRATEGY_SPAWN) {
        let forced_spawn = !["", "0", "false"].contains(&forced.as_str());
        return Ok(if forced_spawn {
            Strategy::Spawn
        } else {
            Strategy::Mimic
        });
    }

    let use_spawn = bus.call_blocking(|connection| {
        Box::pin(async move {
            let portal = match Portal::attach(&connection).await {
                Ok(portal) => portal,
                Err(err) => {
                    tracing::warn!("strategy probe: failed to attach portal: {err}");
                    return false;
                }
            };

            if !portal_supports_spawn_strategy(&portal).await {
                return false;
            }
            // The canary only runs (and can only disqualify ExposePids) when
            // the manifest grants devices=all; otherwise steps 2-3 passing
            // is already sufficient (spec.md §4.7 step 4-5).
            if device_all_permission_granted() && canary_spawn_is_broken(&portal).await {
                return false;
            }
            true
        })
    })?;

    std::env::set_var(
        env::ZYPAK_ZYGOTE_STRATEGY_SPAWN,
        if use_spawn { "1" } else { "0" },
    );

    Ok(if use_spawn {
        Strategy::Spawn
    } else {
        Strategy::Mimic
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_strategy_is_honored_verbatim() {
        std::env::set_var(env::ZYPAK_ZYGOTE_STRATEGY_SPAWN, "1");
        let forced = env::get(env::ZYPAK_ZYGOTE_STRATEGY_SPAWN).unwrap();
        assert_ne!(forced, "0");
        std::env::remove_var(env::ZYPAK_ZYGOTE_STRATEGY_SPAWN);
    }

    #[test]
    fn missing_flatpak_info_means_permission_not_granted() {
        assert!(!device_all_permission_granted());
    }
}
