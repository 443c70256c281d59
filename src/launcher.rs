//! Launcher policy (C6): turns a child command plus FD map into a decided
//! set of flags, an environment, and a helper-wrapper argv, then hands the
//! actual spawning off to a strategy-specific [`Delegate`].
//!
//! Grounded in `sandbox/launcher.{h,cc}` and the two delegates
//! (`sandbox/mimic_strategy/mimic_launcher_delegate.cc`,
//! `sandbox/spawn_strategy/spawn_launcher_delegate.cc`): the policy of
//! *what* flags and env a child gets is shared, only *how* the process
//! actually comes into being differs by strategy.

use bitflags::bitflags;

use zypak_ipc::FdMap;

use crate::env;

bitflags! {
    /// Decided launch policy for one child, independent of strategy.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Flags: u32 {
        /// Share the GPU with the sandboxed child.
        const ALLOW_GPU = 1 << 0;
        /// Permit network access.
        const ALLOW_NETWORK = 1 << 1;
        /// Run the child inside a sandbox.
        const SANDBOX = 1 << 2;
        /// Terminate the child if this process disappears from the bus.
        const WATCH_BUS = 1 << 3;
    }
}

/// What a [`Delegate`] needs to actually bring a child into being.
pub trait Delegate {
    /// Spawns `command` (the fully assembled argv, helper wrapper
    /// included), with `fd_map` describing which descriptors the child
    /// should inherit and under what numbers, `env` as additional
    /// environment variables, and the decided [`Flags`].
    ///
    /// Returns the PID the caller should track: the real child PID under
    /// the mimic strategy, or the local stub PID under the spawn strategy.
    fn spawn(
        &self,
        command: Vec<String>,
        fd_map: &FdMap,
        env: Vec<(String, String)>,
        flags: Flags,
    ) -> anyhow::Result<i32>;
}

/// Whether tracing was requested for `child_type`, per `ZYPAK_STRACE`'s
/// `all` / `host` / `child` / `child:<types,...>` grammar (spec.md §6).
pub fn should_trace_child(child_type: &str) -> bool {
    match env::get(env::ZYPAK_STRACE) {
        None => false,
        Some(value) if value == "all" || value == "child" => true,
        Some(value) => match value.strip_prefix("child:") {
            Some(types) => types.split(',').any(|t| t == child_type),
            None => false,
        },
    }
}

/// Builds the `strace -f [-e <filter>] [-v -s1024 -k]` prefix, if tracing
/// was requested for this child type.
fn strace_prefix(child_type: &str) -> Vec<String> {
    if !should_trace_child(child_type) {
        return Vec::new();
    }

    let mut prefix = vec!["strace".to_owned(), "-f".to_owned()];
    if let Some(filter) = env::get(env::ZYPAK_STRACE_FILTER) {
        prefix.push("-e".to_owned());
        prefix.push(filter);
    }
    if env::truthy(env::ZYPAK_STRACE_NO_LINE_LIMIT) {
        prefix.push("-v".to_owned());
        prefix.push("-s1024".to_owned());
        prefix.push("-k".to_owned());
    }
    prefix
}

/// Pure policy over a command and FD map (C6): decides [`Flags`], builds
/// the environment and helper-wrapper argv, and delegates the actual
/// spawn to a strategy-specific [`Delegate`].
pub struct Launcher<'d> {
    delegate: &'d dyn Delegate,
}

impl<'d> Launcher<'d> {
    /// Builds a launcher that spawns through `delegate`.
    pub fn new(delegate: &'d dyn Delegate) -> Self {
        Self { delegate }
    }

    /// Runs `argv` (the engine's own command for this child, `argv[0]`
    /// already resolved) through the decided policy and the delegate.
    /// `child_type` is the `--type=` value extracted from `argv`, if any.
    pub fn run(
        &self,
        child_type: Option<&str>,
        argv: Vec<String>,
        fd_map: FdMap,
    ) -> anyhow::Result<i32> {
        let mut flags = Flags::WATCH_BUS;

        let is_gpu = child_type == Some("gpu-process");
        if is_gpu || env::truthy(env::ZYPAK_ALLOW_GPU) {
            flags |= Flags::ALLOW_GPU;
        }
        if env::truthy(env::ZYPAK_ALLOW_NETWORK) {
            flags |= Flags::ALLOW_NETWORK;
        }
        if !env::truthy(env::ZYPAK_DISABLE_SANDBOX) {
            flags |= Flags::SANDBOX;
        }

        let bindir = env::require(env::ZYPAK_BIN)?;
        let libdir = env::require(env::ZYPAK_LIB)?;

        let mut child_env = vec![
            (env::ZYPAK_BIN.to_owned(), bindir.clone()),
            (env::ZYPAK_LIB.to_owned(), libdir.clone()),
        ];
        if env::truthy(env::ZYPAK_DEBUG) {
            child_env.push((env::ZYPAK_DEBUG.to_owned(), "1".to_owned()));
        }
        child_env.push(("SBX_CHROME_API_PRV".to_owned(), "1".to_owned()));
        child_env.push(("SBX_PID_NS".to_owned(), "1".to_owned()));
        child_env.push(("SBX_NET_NS".to_owned(), "1".to_owned()));

        let mut command = strace_prefix(child_type.unwrap_or(""));

        let helper_path = format!("{bindir}/zypak-helper");
        command.push(helper_path);
        command.push("child".to_owned());
        for assignment in fd_map.iter() {
            command.push(assignment.serialize());
        }
        command.push("-".to_owned());
        command.extend(argv);

        self.delegate.spawn(command, &fd_map, child_env, flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strace_child_matches_all() {
        std::env::set_var(env::ZYPAK_STRACE, "all");
        assert!(should_trace_child("renderer"));
        std::env::remove_var(env::ZYPAK_STRACE);
    }

    #[test]
    fn strace_child_list_is_exact_match() {
        std::env::set_var(env::ZYPAK_STRACE, "child:renderer,gpu-process");
        assert!(should_trace_child("gpu-process"));
        assert!(!should_trace_child("utility"));
        std::env::remove_var(env::ZYPAK_STRACE);
    }

    #[test]
    fn strace_host_does_not_trace_children() {
        std::env::set_var(env::ZYPAK_STRACE, "host");
        assert!(!should_trace_child("renderer"));
        std::env::remove_var(env::ZYPAK_STRACE);
    }
}
