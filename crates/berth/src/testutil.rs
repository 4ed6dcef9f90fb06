//! Shared test fixtures: fake external binaries.
//!
//! Production code resolves every external tool through a `BERTH_<NAME>_BIN`
//! override (see `berth_process::resolve_program`), so tests drop a shell
//! script into a temp dir and point the override at it. Scripts log their
//! argv to `<dir>/<name>.log` so assertions can check what was invoked.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Writes an executable `#!/bin/sh` script and returns its path.
pub fn fake_bin(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let script = format!("#!/bin/sh\n{body}\n");
    std::fs::write(&path, script).expect("write fake bin");
    let mut perms = std::fs::metadata(&path).expect("meta").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path
}

/// A fake tool that records its arguments and exits 0.
pub fn logging_bin(dir: &Path, name: &str) -> PathBuf {
    let log = dir.join(format!("{name}.log"));
    fake_bin(
        dir,
        name,
        &format!("echo \"$@\" >> '{}'\nexit 0", log.display()),
    )
}

/// Lines logged by a [`logging_bin`], one invocation per line.
pub fn logged_calls(dir: &Path, name: &str) -> Vec<String> {
    let log = dir.join(format!("{name}.log"));
    match std::fs::read_to_string(log) {
        Ok(content) => content.lines().map(str::to_string).collect(),
        Err(_) => Vec::new(),
    }
}

/// Env var name `resolve_program` consults for a tool.
pub fn bin_env(name: &str) -> String {
    format!(
        "BERTH_{}_BIN",
        name.to_uppercase().replace('-', "_").replace('.', "_")
    )
}
