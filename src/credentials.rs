//! Runtime credential loading (ambient stack, spec 4.10) and the
//! helper-script pattern for third-party tokens (spec 4.3).

use std::collections::BTreeMap;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::Context;

/// Runtime credentials loaded from the `.env` file at startup.
///
/// Never reread from the environment after startup except for the
/// per-invocation stripping/injection performed by the prompt assembler
/// (spec 4.3).
#[derive(Clone, Default)]
pub struct Credentials {
    vars: BTreeMap<String, String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("keys", &self.vars.keys().collect::<Vec<_>>())
            .field("values", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    /// Returns a credential value for a key, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Returns a required credential or an error when missing.
    ///
    /// # Errors
    ///
    /// Returns an error when the key does not exist in loaded credentials.
    pub fn require(&self, key: &str) -> anyhow::Result<String> {
        self.vars
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing required credential: {key}"))
    }
}

/// Load credentials from a specific `.env` path.
///
/// # Errors
///
/// Returns an error if the file does not exist or parsing fails.
pub fn load_credentials(path: &Path) -> anyhow::Result<Credentials> {
    if !path.exists() {
        return Ok(Credentials::default());
    }
    let mut vars = BTreeMap::new();
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("failed to read credentials at {}", path.display()))?;
    for item in iter {
        let (key, value) = item.with_context(|| {
            format!(
                "failed to parse key-value entry in credentials file {}",
                path.display()
            )
        })?;
        vars.insert(key, value);
    }
    Ok(Credentials { vars })
}

/// Variable-name substrings that mark an environment variable as sensitive
/// (spec 4.3: always stripped for heartbeat shell-commands and scheduled-job
/// `command` subprocesses).
pub const SENSITIVE_NAME_MARKERS: &[&str] = &[
    "PASSWORD",
    "SECRET",
    "TOKEN",
    "API_KEY",
    "PRIVATE_KEY",
    "APP_PASSWORD",
    "NC_PASS",
];

/// Whether an environment variable name matches one of the sensitive markers.
pub fn is_sensitive_var_name(name: &str) -> bool {
    let upper = name.to_uppercase();
    SENSITIVE_NAME_MARKERS
        .iter()
        .any(|marker| upper.contains(marker))
}

/// Writes a helper script that resolves a third-party secret internally and
/// emits credentials only on demand, so the secret itself is never placed in
/// the child process's environment (spec 4.3).
///
/// The script is a tiny shell wrapper: it reads `secret_value` from its own
/// embedded copy (written with `0o700` permissions, owner-only) and prints it
/// to stdout when invoked with no arguments. Callers in the child's sandbox
/// invoke the script by path instead of reading an environment variable.
///
/// # Errors
///
/// Returns an error if the script cannot be written or its permissions
/// cannot be set to owner-only.
pub fn write_credential_helper_script(
    dir: &Path,
    script_name: &str,
    secret_value: &str,
) -> anyhow::Result<std::path::PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create helper script dir {}", dir.display()))?;
    let path = dir.join(script_name);

    let escaped = secret_value.replace('\'', "'\\''");
    let body = format!("#!/bin/sh\nprintf '%s' '{escaped}'\n");

    let mut file = std::fs::File::create(&path)
        .with_context(|| format!("failed to create helper script {}", path.display()))?;
    file.write_all(body.as_bytes())
        .with_context(|| format!("failed to write helper script {}", path.display()))?;

    let mut perms = file
        .metadata()
        .with_context(|| format!("failed to stat helper script {}", path.display()))?
        .permissions();
    perms.set_mode(0o700);
    std::fs::set_permissions(&path, perms)
        .with_context(|| format!("failed to chmod helper script {}", path.display()))?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_markers_match_case_insensitively() {
        assert!(is_sensitive_var_name("GITHUB_TOKEN"));
        assert!(is_sensitive_var_name("nc_pass"));
        assert!(is_sensitive_var_name("DB_PASSWORD"));
        assert!(!is_sensitive_var_name("PATH"));
        assert!(!is_sensitive_var_name("HOME"));
    }

    #[test]
    fn helper_script_is_owner_only_and_emits_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_credential_helper_script(dir.path(), "gh-token.sh", "s3cr3t").unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("s3cr3t"));
    }
}
