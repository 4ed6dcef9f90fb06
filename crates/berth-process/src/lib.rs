//! External command execution for berth.
//!
//! Every OS side effect in the control plane (user management, systemd,
//! quota, git, package installs) goes through [`CommandSpec`], which carries
//! an explicit timeout (no subprocess may block a provisioning thread
//! forever), optional stdin, and an optional run-as user for commands that
//! must execute inside the workspace account rather than as the service
//! user.
//!
//! Binary paths resolve through `BERTH_<NAME>_BIN` environment overrides so
//! tests can substitute fake tools without touching the host.
//!
//! # Example
//!
//! ```no_run
//! use berth_process::CommandSpec;
//!
//! let out = CommandSpec::new("git")
//!     .args(["clone", "git@github.com:acme/app.git", "/home/acme_x/app"])
//!     .timeout(std::time::Duration::from_secs(300))
//!     .run()
//!     .expect("spawn git");
//! assert_eq!(out.exit_code, 0);
//! ```

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default timeout applied when the caller does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Resolves a tool's binary path, honoring the `BERTH_<NAME>_BIN` override.
///
/// The override name is the program's base name, uppercased, with `-`
/// mapped to `_` (`code-server` → `BERTH_CODE_SERVER_BIN`).
pub fn resolve_program(program: &str) -> String {
    let base = program.rsplit('/').next().unwrap_or(program);
    let key = format!(
        "BERTH_{}_BIN",
        base.to_uppercase().replace('-', "_").replace('.', "_")
    );
    std::env::var(&key).unwrap_or_else(|_| program.to_string())
}

/// Captured output of a finished (or killed) command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code, or -1 when the process was killed or had no code.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// True when the deadline elapsed and the child was killed.
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Last `n` lines of stderr, for error messages and audit records.
    pub fn stderr_tail(&self, n: usize) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

/// Builder for one external command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    stdin: Option<String>,
    run_as: Option<String>,
    timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: BTreeMap::new(),
            stdin: None,
            run_as: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Feeds the given string to the child's stdin and closes it.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Runs the command as the given Linux user via `su - <user> -c <cmd>`.
    /// The command line is shell-quoted as a single string, so the program
    /// and args must not rely on exotic quoting.
    pub fn run_as(mut self, user: impl Into<String>) -> Self {
        self.run_as = Some(user.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Spawns the command and waits for it under the configured deadline.
    pub fn run(self) -> Result<CommandOutput> {
        let start = Instant::now();
        let (program, args) = self.effective_command();

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if self.stdin.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        for (k, v) in &self.env {
            command.env(k, v);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn command: {program}"))?;

        if let Some(input) = &self.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                // A dead child is reported by the wait loop, not here.
                let _ = pipe.write_all(input.as_bytes());
            }
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            match child
                .try_wait()
                .with_context(|| format!("failed to poll command: {program}"))?
            {
                Some(status) => {
                    return Ok(CommandOutput {
                        exit_code: status.code().unwrap_or(-1),
                        stdout: read_pipe(child.stdout.take()),
                        stderr: read_pipe(child.stderr.take()),
                        timed_out: false,
                        duration: start.elapsed(),
                    });
                }
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();

                        let mut stderr = read_pipe(child.stderr.take());
                        stderr.push_str(&format!(
                            "\n{} timed out after {}",
                            program,
                            humantime::format_duration(self.timeout)
                        ));

                        return Ok(CommandOutput {
                            exit_code: -1,
                            stdout: read_pipe(child.stdout.take()),
                            stderr,
                            timed_out: true,
                            duration: start.elapsed(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
            }
        }
    }

    /// The final `(program, args)` after binary override and `su` wrapping.
    fn effective_command(&self) -> (String, Vec<String>) {
        let resolved = resolve_program(&self.program);
        match &self.run_as {
            None => (resolved, self.args.clone()),
            Some(user) => {
                let mut line = shell_quote(&resolved);
                for arg in &self.args {
                    line.push(' ');
                    line.push_str(&shell_quote(arg));
                }
                (
                    resolve_program("su"),
                    vec!["-".to_string(), user.clone(), "-c".to_string(), line],
                )
            }
        }
    }
}

/// Single-quote a token for `sh -c`, escaping embedded quotes.
fn shell_quote(token: &str) -> String {
    if !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,".contains(c))
    {
        return token.to_string();
    }
    format!("'{}'", token.replace('\'', r"'\''"))
}

fn read_pipe<R: Read>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).to_string()
}
