//! Purpose: Import the user's login-shell environment into this process.
//! Exports: `import_login_environment`.
//! Role: GUI hosts on macOS inherit a bare launchd environment, so mdBook preprocessors
//! and renderers installed through cargo/homebrew would not be on `PATH`.
//! Invariants: Tries `zsh` then `bash`; the first shell yielding any variable wins.
//! Invariants: `PATH` always ends up set, falling back to appending `~/.cargo/bin`.
//! Invariants: Called at most once per process (guarded by the runtime constructor).

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

const PATH_ENV: &str = "PATH";
const LOGIN_SHELLS: [&str; 2] = ["zsh", "bash"];

pub(crate) fn import_login_environment() {
    let Some(home) = login_home() else {
        debug!("no home directory, leaving environment untouched");
        return;
    };

    let mut environment = HashMap::new();
    for shell in LOGIN_SHELLS {
        match login_shell_env(shell) {
            Ok(output) => {
                if parse_environment(&output, &mut environment) {
                    break;
                }
            }
            Err(err) => info!("couldn't load the {shell} login environment: {err}"),
        }
    }

    if !environment.contains_key(PATH_ENV) {
        let path = fallback_path(std::env::var_os(PATH_ENV), &home);
        environment.insert(PATH_ENV.to_string(), path.to_string_lossy().into_owned());
    }

    for (key, value) in environment {
        debug!("setting environment: {key}={value}");
        // SAFETY: runs once per process from the runtime constructor; watcher and server
        // threads never read the environment and hosts must not touch it concurrently.
        unsafe { std::env::set_var(key, value) };
    }
}

/// Falls back to the passwd entry when `HOME` is unset, as it is for some launchers.
fn login_home() -> Option<PathBuf> {
    dirs::home_dir()
}

fn login_shell_env(shell: &str) -> Result<String, String> {
    let output = Command::new(shell)
        .args(["-l", "-c", "printenv"])
        .output()
        .map_err(|err| err.to_string())?;
    String::from_utf8(output.stdout).map_err(|err| err.to_string())
}

/// Returns whether at least one `KEY=VALUE` line was found.
fn parse_environment(output: &str, environment: &mut HashMap<String, String>) -> bool {
    let mut found = false;
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        // continuation lines of multi-line values are not variables
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            continue;
        }
        found = true;
        environment.insert(key.to_string(), value.to_string());
    }
    found
}

fn fallback_path(current: Option<OsString>, home: &Path) -> OsString {
    let cargo_bin = home.join(".cargo").join("bin");
    let Some(current) = current else {
        return cargo_bin.into_os_string();
    };
    let paths = std::env::split_paths(&current).chain(std::iter::once(cargo_bin.clone()));
    std::env::join_paths(paths).unwrap_or_else(|_| cargo_bin.into_os_string())
}
