//! The single place that reads environment variables recognised by the
//! broker. Grounds every `std::env::var` call in one module so the truthy
//! parsing rule stays consistent everywhere it is used.

use std::env;

/// `ZYPAK_BIN`: directory containing helper binaries.
pub const ZYPAK_BIN: &str = "ZYPAK_BIN";
/// `ZYPAK_LIB`: directory containing preload libraries.
pub const ZYPAK_LIB: &str = "ZYPAK_LIB";
/// `ZYPAK_ZYGOTE_STRATEGY_SPAWN`: force or probe the zygote strategy.
pub const ZYPAK_ZYGOTE_STRATEGY_SPAWN: &str = "ZYPAK_ZYGOTE_STRATEGY_SPAWN";
/// `ZYPAK_DEBUG`: enable debug logging.
pub const ZYPAK_DEBUG: &str = "ZYPAK_DEBUG";
/// `ZYPAK_STRACE`: `all` / `host` / `child` / `child:<types,...>`.
pub const ZYPAK_STRACE: &str = "ZYPAK_STRACE";
/// `ZYPAK_STRACE_FILTER`: `-e` expression forwarded to strace.
pub const ZYPAK_STRACE_FILTER: &str = "ZYPAK_STRACE_FILTER";
/// `ZYPAK_STRACE_NO_LINE_LIMIT`: if truthy, pass `-v -s1024 -k` to strace.
pub const ZYPAK_STRACE_NO_LINE_LIMIT: &str = "ZYPAK_STRACE_NO_LINE_LIMIT";
/// `ZYPAK_DISABLE_SANDBOX`: if truthy, drop the `Sandbox` flag.
pub const ZYPAK_DISABLE_SANDBOX: &str = "ZYPAK_DISABLE_SANDBOX";
/// `ZYPAK_ALLOW_GPU`: if truthy, always set `ShareGpu`.
pub const ZYPAK_ALLOW_GPU: &str = "ZYPAK_ALLOW_GPU";
/// `ZYPAK_SANDBOX_FILENAME`: override the "chrome-sandbox" basename.
pub const ZYPAK_SANDBOX_FILENAME: &str = "ZYPAK_SANDBOX_FILENAME";
/// `ZYPAK_EXPOSE_WIDEVINE_PATH`: single path exposed read-only into every sandbox.
pub const ZYPAK_EXPOSE_WIDEVINE_PATH: &str = "ZYPAK_EXPOSE_WIDEVINE_PATH";
/// `ZYPAK_LD_PRELOAD`: user-supplied preload, prepended to zypak's own.
pub const ZYPAK_LD_PRELOAD: &str = "ZYPAK_LD_PRELOAD";
/// `ZYPAK_SPAWN_LATEST_ON_REEXEC`: if truthy, use portal `SpawnLatest` on self-reexec.
pub const ZYPAK_SPAWN_LATEST_ON_REEXEC: &str = "ZYPAK_SPAWN_LATEST_ON_REEXEC";
/// `ZYPAK_CEF_LIBRARY_PATH`: additional close-override library location.
pub const ZYPAK_CEF_LIBRARY_PATH: &str = "ZYPAK_CEF_LIBRARY_PATH";
/// `ZYPAK_ALLOW_NETWORK`: if truthy, keeps network access in the
/// mimic-strategy `flatpak-spawn` invocation and clears `NoNetwork` on the
/// spawn-strategy path.
pub const ZYPAK_ALLOW_NETWORK: &str = "ZYPAK_ALLOW_NETWORK";

/// Values considered falsy: unset is handled separately by each accessor.
const FALSY: [&str; 3] = ["", "0", "false"];

/// Reads `name` and applies the truthy rule: not in `{"", "0", "false"}`.
/// Unset counts as falsy.
pub fn truthy(name: &str) -> bool {
    match env::var(name) {
        Ok(value) => !FALSY.contains(&value.as_str()),
        Err(_) => false,
    }
}

/// Reads `name`, returning `None` if unset (the "honour verbatim if set"
/// cases, like `ZYPAK_ZYGOTE_STRATEGY_SPAWN`, need the raw truthy/falsy
/// distinction rather than a bare bool).
pub fn get(name: &str) -> Option<String> {
    env::var(name).ok()
}

/// The `Env::Test(name, default)` contract: unset yields `default`;
/// otherwise the normal truthy rule applies.
pub fn test(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => !FALSY.contains(&value.as_str()),
        Err(_) => default,
    }
}

/// Required string variable; callers treat a missing value as a fatal
/// external error.
pub fn require(name: &str) -> anyhow::Result<String> {
    env::var(name).map_err(|_| anyhow::anyhow!("required environment variable {name} is not set"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_rejects_known_falsy_values() {
        for value in ["", "0", "false"] {
            std::env::set_var("ZYPAK_TEST_TRUTHY", value);
            assert!(!truthy("ZYPAK_TEST_TRUTHY"), "value {value:?} should be falsy");
        }
        std::env::remove_var("ZYPAK_TEST_TRUTHY");
    }

    #[test]
    fn truthy_accepts_anything_else() {
        std::env::set_var("ZYPAK_TEST_TRUTHY_2", "1");
        assert!(truthy("ZYPAK_TEST_TRUTHY_2"));
        std::env::remove_var("ZYPAK_TEST_TRUTHY_2");
    }

    #[test]
    fn test_falls_back_to_default_when_unset() {
        std::env::remove_var("ZYPAK_TEST_DEFAULT");
        assert!(test("ZYPAK_TEST_DEFAULT", true));
        assert!(!test("ZYPAK_TEST_DEFAULT", false));
    }
}
