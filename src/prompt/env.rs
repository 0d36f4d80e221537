//! Environment assembly for the executor's child process (spec 4.3).

use std::collections::HashMap;
use std::path::Path;

use crate::credentials::{is_sensitive_var_name, Credentials};

/// Build the environment map passed to the LLM subprocess.
///
/// `restricted`: when true, only PATH/HOME plus `declared_vars` (resolved
/// from `credentials`) are included; when false, the full parent
/// environment is included as a base, with `declared_vars` layered on top.
///
/// `strip_sensitive`: when true (heartbeat shell-commands, scheduled-job
/// `command` subprocesses), any variable whose name matches a sensitive
/// marker is removed regardless of mode.
///
/// `DEFERRED_DIR` is always injected pointing at `deferred_dir`.
pub fn assemble_environment(
    restricted: bool,
    declared_vars: &[String],
    credentials: &Credentials,
    strip_sensitive: bool,
    deferred_dir: &Path,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = if restricted {
        let mut base = HashMap::new();
        if let Ok(path) = std::env::var("PATH") {
            base.insert("PATH".to_owned(), path);
        }
        if let Ok(home) = std::env::var("HOME") {
            base.insert("HOME".to_owned(), home);
        }
        base
    } else {
        std::env::vars().collect()
    };

    for name in declared_vars {
        if let Some(value) = credentials.get(name) {
            env.insert(name.clone(), value.to_owned());
        }
    }

    if strip_sensitive {
        env.retain(|name, _| !is_sensitive_var_name(name));
    }

    env.insert(
        "DEFERRED_DIR".to_owned(),
        deferred_dir.display().to_string(),
    );

    env
}
