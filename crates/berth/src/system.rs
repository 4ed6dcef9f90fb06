//! Host-level plumbing: Linux accounts, the code-server systemd template
//! unit with per-instance drop-ins, disk quota, journal access, and process
//! statistics.
//!
//! Every binary resolves through a `BERTH_<NAME>_BIN` override
//! (`berth_process::resolve_program`), which is how the test suite swaps the
//! real tools for fakes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use berth_process::{CommandOutput, CommandSpec};
use berth_types::{CoreError, CoreResult};

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(60);

/// Contents of the shared `code-server@.service` template unit. The
/// per-instance drop-in supplies `PORT`.
const CODE_SERVER_TEMPLATE_UNIT: &str = "\
[Unit]
Description=code-server for workspace %i
After=network.target

[Service]
Type=simple
User=%i
WorkingDirectory=/home/%i
ExecStart=/usr/bin/code-server --bind-addr 127.0.0.1:${PORT} --auth none .
Restart=always
RestartSec=10
StandardOutput=append:/home/%i/code-server.log
StandardError=append:/home/%i/code-server.log
NoNewPrivileges=true
PrivateTmp=true
ProtectSystem=strict
ProtectHome=false
ReadWritePaths=/home/%i

[Install]
WantedBy=multi-user.target
";

/// Aggregated `ps` statistics for one Linux user.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessStats {
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub process_count: u32,
}

/// Parsed `systemctl show` facts for one unit.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub active: bool,
    pub active_enter: Option<DateTime<Utc>>,
}

impl ServiceStatus {
    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> u64 {
        match self.active_enter {
            Some(since) if self.active => (now - since).num_seconds().max(0) as u64,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SystemManager {
    base_dir: String,
    unit_dir: PathBuf,
}

impl SystemManager {
    pub fn new(base_dir: impl Into<String>, unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            unit_dir: unit_dir.into(),
        }
    }

    pub fn home_directory(&self, username: &str) -> String {
        format!("{}/{}", self.base_dir.trim_end_matches('/'), username)
    }

    /// `useradd -m` with a bash shell, then `chpasswd` over stdin.
    pub fn create_linux_user(&self, username: &str, password: &str) -> CoreResult<()> {
        checked(
            CommandSpec::new("useradd")
                .args(["-m", "-s", "/bin/bash", "-d"])
                .arg(self.home_directory(username))
                .arg(username)
                .timeout(SYSTEMCTL_TIMEOUT),
            "useradd",
        )?;
        checked(
            CommandSpec::new("chpasswd")
                .stdin(format!("{username}:{password}\n"))
                .timeout(SYSTEMCTL_TIMEOUT),
            "chpasswd",
        )?;
        info!(username, "linux user created");
        Ok(())
    }

    /// `userdel -r`. Exit code 6 (no such user) is tolerated so deprovision
    /// stays idempotent.
    pub fn delete_linux_user(&self, username: &str) -> CoreResult<()> {
        let out = CommandSpec::new("userdel")
            .args(["-r", username])
            .timeout(SYSTEMCTL_TIMEOUT)
            .run()
            .map_err(CoreError::Other)?;
        if out.success() || out.exit_code == 6 {
            Ok(())
        } else {
            Err(command_error("userdel", &out))
        }
    }

    /// Per-user code-server config. Auth is `none`: the reverse proxy's
    /// forward-auth is the only gate.
    pub fn write_code_server_config(&self, username: &str, port: u16) -> CoreResult<PathBuf> {
        let config_dir = PathBuf::from(self.home_directory(username)).join(".config/code-server");
        std::fs::create_dir_all(&config_dir).map_err(|e| {
            CoreError::Other(anyhow::anyhow!("failed to create {}: {e}", config_dir.display()))
        })?;
        let config_path = config_dir.join("config.yaml");
        let content = format!("bind-addr: 127.0.0.1:{port}\nauth: none\ncert: false\n");
        std::fs::write(&config_path, content).map_err(|e| {
            CoreError::Other(anyhow::anyhow!("failed to write {}: {e}", config_path.display()))
        })?;
        Ok(config_path)
    }

    /// Installs the shared template unit if it is not present yet.
    pub fn ensure_template_unit(&self) -> CoreResult<PathBuf> {
        let path = self.unit_dir.join("code-server@.service");
        if !path.exists() {
            std::fs::create_dir_all(&self.unit_dir).map_err(|e| {
                CoreError::Other(anyhow::anyhow!(
                    "failed to create {}: {e}",
                    self.unit_dir.display()
                ))
            })?;
            std::fs::write(&path, CODE_SERVER_TEMPLATE_UNIT).map_err(|e| {
                CoreError::Other(anyhow::anyhow!("failed to write {}: {e}", path.display()))
            })?;
            info!(unit = %path.display(), "installed code-server template unit");
        }
        Ok(path)
    }

    fn dropin_dir(&self, username: &str) -> PathBuf {
        self.unit_dir
            .join(format!("code-server@{username}.service.d"))
    }

    /// Per-instance drop-in carrying the workspace port.
    pub fn write_port_dropin(&self, username: &str, port: u16) -> CoreResult<PathBuf> {
        let dir = self.dropin_dir(username);
        std::fs::create_dir_all(&dir).map_err(|e| {
            CoreError::Other(anyhow::anyhow!("failed to create {}: {e}", dir.display()))
        })?;
        let path = dir.join("override.conf");
        std::fs::write(&path, format!("[Service]\nEnvironment=\"PORT={port}\"\n")).map_err(
            |e| CoreError::Other(anyhow::anyhow!("failed to write {}: {e}", path.display())),
        )?;
        Ok(path)
    }

    /// Removes the instance drop-in directory; the shared template unit
    /// stays for the other workspaces.
    pub fn remove_port_dropin(&self, username: &str) -> CoreResult<()> {
        match std::fs::remove_dir_all(self.dropin_dir(username)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Other(anyhow::anyhow!(
                "failed to remove drop-in for {username}: {e}"
            ))),
        }
    }

    pub fn daemon_reload(&self) -> CoreResult<()> {
        checked(systemctl(&["daemon-reload"]), "systemctl").map(|_| ())
    }

    pub fn enable_service(&self, unit: &str) -> CoreResult<()> {
        checked(systemctl(&["enable", unit]), "systemctl").map(|_| ())
    }

    pub fn start_service(&self, unit: &str) -> CoreResult<()> {
        checked(systemctl(&["start", unit]), "systemctl").map(|_| ())
    }

    pub fn stop_service(&self, unit: &str) -> CoreResult<()> {
        checked(systemctl(&["stop", unit]), "systemctl").map(|_| ())
    }

    pub fn restart_service(&self, unit: &str) -> CoreResult<()> {
        checked(systemctl(&["restart", unit]), "systemctl").map(|_| ())
    }

    /// Best-effort stop + disable used by cleanup paths.
    pub fn silence_service(&self, unit: &str) {
        let _ = systemctl(&["stop", unit]).run();
        let _ = systemctl(&["disable", unit]).run();
    }

    /// `ActiveState` / `ActiveEnterTimestamp` from `systemctl show`.
    pub fn service_status(&self, unit: &str) -> CoreResult<ServiceStatus> {
        let out = checked(
            systemctl(&[
                "show",
                unit,
                "--property=ActiveEnterTimestamp,ActiveState",
            ]),
            "systemctl",
        )?;

        let mut active = false;
        let mut active_enter = None;
        for line in out.stdout.lines() {
            if let Some(state) = line.strip_prefix("ActiveState=") {
                active = state.trim() == "active";
            } else if let Some(stamp) = line.strip_prefix("ActiveEnterTimestamp=") {
                active_enter = parse_systemd_timestamp(stamp.trim());
            }
        }
        Ok(ServiceStatus { active, active_enter })
    }

    /// Last `lines` journal entries for a unit.
    pub fn journal_tail(
        &self,
        unit: &str,
        lines: u32,
        since: Option<&str>,
    ) -> CoreResult<String> {
        let mut spec = CommandSpec::new("journalctl")
            .args(["-u", unit, "-n"])
            .arg(lines.to_string())
            .arg("--no-pager")
            .timeout(SYSTEMCTL_TIMEOUT);
        if let Some(since) = since {
            spec = spec.args(["--since", since]);
        }
        let out = checked(spec, "journalctl")?;
        Ok(out.stdout)
    }

    /// `setquota` soft=hard=GB. Failure is logged, never fatal — hosts
    /// without quota support still provision.
    pub fn set_disk_quota(&self, username: &str, quota_gb: u32) {
        let kb = (quota_gb as u64) * 1024 * 1024;
        let out = CommandSpec::new("setquota")
            .args(["-u", username])
            .args([kb.to_string(), kb.to_string()])
            .args(["0", "0", "-a"])
            .timeout(SYSTEMCTL_TIMEOUT)
            .run();
        match out {
            Ok(out) if out.success() => {
                info!(username, quota_gb, "disk quota set");
            }
            Ok(out) => warn!(username, stderr = %out.stderr_tail(2), "setquota failed"),
            Err(err) => warn!(username, %err, "setquota could not run"),
        }
    }

    /// Aggregates `ps aux` rows owned by the user.
    pub fn user_process_stats(&self, username: &str) -> CoreResult<ProcessStats> {
        let out = checked(
            CommandSpec::new("ps").arg("aux").timeout(Duration::from_secs(10)),
            "ps",
        )?;
        Ok(parse_ps_aux(&out.stdout, username))
    }

    /// MemTotal from /proc/meminfo, for memory-percent derivation.
    pub fn total_memory_mb(&self) -> Option<u64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
                return Some(kb / 1024);
            }
        }
        None
    }
}

fn systemctl(args: &[&str]) -> CommandSpec {
    CommandSpec::new("systemctl")
        .args(args.iter().copied())
        .timeout(SYSTEMCTL_TIMEOUT)
}

fn checked(spec: CommandSpec, program: &str) -> CoreResult<CommandOutput> {
    let out = spec.run().map_err(CoreError::Other)?;
    if out.success() {
        Ok(out)
    } else {
        Err(command_error(program, &out))
    }
}

fn command_error(program: &str, out: &CommandOutput) -> CoreError {
    CoreError::CommandFailed {
        program: program.to_string(),
        exit_code: if out.timed_out { None } else { Some(out.exit_code) },
        stderr_tail: out.stderr_tail(5),
    }
}

/// systemd prints `Wed 2025-10-29 10:00:00 UTC`; an inactive unit prints an
/// empty value or `n/a`.
fn parse_systemd_timestamp(stamp: &str) -> Option<DateTime<Utc>> {
    if stamp.is_empty() || stamp == "n/a" {
        return None;
    }
    let without_tz = stamp.rsplit_once(' ').map(|(head, _tz)| head).unwrap_or(stamp);
    NaiveDateTime::parse_from_str(without_tz, "%a %Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// `ps aux` columns: USER PID %CPU %MEM VSZ RSS ...
fn parse_ps_aux(output: &str, username: &str) -> ProcessStats {
    let mut stats = ProcessStats::default();
    for line in output.lines() {
        if line.starts_with("USER") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 6 || parts[0] != username {
            continue;
        }
        let (Ok(cpu), Ok(rss_kb)) = (parts[2].parse::<f64>(), parts[5].parse::<u64>()) else {
            continue;
        };
        stats.cpu_percent += cpu;
        stats.memory_mb += rss_kb / 1024;
        stats.process_count += 1;
    }
    stats.cpu_percent = (stats.cpu_percent * 100.0).round() / 100.0;
    stats
}

/// The systemd instance name for a workspace user.
pub fn service_unit(username: &str) -> String {
    format!("code-server@{username}.service")
}
