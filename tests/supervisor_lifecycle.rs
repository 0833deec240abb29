#![cfg(unix)]

//! End-to-end supervisor lifecycle tests against stub tunnel binaries.

use serial_test::serial;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use utw::config::{ConfigSnapshot, GlobalSpec, InstanceSpec};
use utw::platform;
use utw::supervisor::{SupervisorOptions, TunnelSupervisor};

fn write_stub(dir: &Path, name: &str, script: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, script).expect("write stub binary");
    let mut perms = fs::metadata(&path).expect("stub metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod stub");
    path
}

fn supervisor_with_binary(dir: &TempDir, binary: &str) -> TunnelSupervisor {
    TunnelSupervisor::new(SupervisorOptions {
        binary: binary.to_string(),
        log_path: dir.path().join("tunnel.log"),
        grace: Duration::from_millis(500),
        // Point the reconciler at a missing tool so tests never touch the
        // host firewall; cleanup degrades to a warning.
        iptables: dir
            .path()
            .join("no-such-iptables")
            .display()
            .to_string(),
    })
}

fn enabled_server(alias: &str) -> InstanceSpec {
    InstanceSpec {
        enabled: true,
        alias: alias.to_string(),
        ..InstanceSpec::default()
    }
}

fn snapshot(servers: Vec<InstanceSpec>, clients: Vec<InstanceSpec>) -> ConfigSnapshot {
    ConfigSnapshot {
        global: GlobalSpec {
            enabled: true,
            ..GlobalSpec::default()
        },
        servers,
        clients,
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    condition()
}

const LONG_RUNNING_STUB: &str = "#!/bin/sh\necho tunnel ready\nexec sleep 30\n";

#[test]
#[serial]
fn globally_disabled_starts_nothing() {
    let dir = TempDir::new().unwrap();
    let stub = write_stub(dir.path(), "udp2raw-stub", LONG_RUNNING_STUB);
    let supervisor = supervisor_with_binary(&dir, &stub.display().to_string());

    let mut snap = snapshot(vec![enabled_server("srv")], vec![]);
    snap.global.enabled = false;
    supervisor.start_all(&snap);

    assert!(supervisor.status().is_empty());
    let logs = supervisor.get_logs(10);
    assert_eq!(logs.len(), 1);
    assert!(logs[0].contains("Service is globally disabled."));
}

#[test]
#[serial]
fn disabled_instance_is_never_spawned() {
    let dir = TempDir::new().unwrap();
    let stub = write_stub(dir.path(), "udp2raw-stub", LONG_RUNNING_STUB);
    let supervisor = supervisor_with_binary(&dir, &stub.display().to_string());

    let mut disabled = enabled_server("off");
    disabled.enabled = false;
    supervisor.start_all(&snapshot(
        vec![disabled, enabled_server("on")],
        vec![],
    ));

    let status = supervisor.status();
    assert_eq!(status.len(), 1);
    // Disabled entries keep their list position: the enabled one is #1.
    assert_eq!(status[0].id, "server_1");
    assert!(status[0].running);

    supervisor.stop_all();
}

#[test]
#[serial]
fn start_stop_lifecycle_captures_output() {
    let dir = TempDir::new().unwrap();
    let stub = write_stub(dir.path(), "udp2raw-stub", LONG_RUNNING_STUB);
    let supervisor = supervisor_with_binary(&dir, &stub.display().to_string());

    supervisor.start_all(&snapshot(vec![enabled_server("wg-srv")], vec![]));

    let status = supervisor.status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].id, "server_0");
    assert!(status[0].running);
    assert!(status[0].pid.is_some());

    assert!(wait_until(Duration::from_secs(5), || {
        supervisor
            .get_logs(50)
            .iter()
            .any(|line| line.contains("[wg-srv] tunnel ready"))
    }));

    supervisor.stop_all();
    assert!(supervisor.status().is_empty());
    assert!(supervisor
        .get_logs(50)
        .iter()
        .any(|line| line.contains("Stopped server_0") || line.contains("Killed server_0")));
}

#[test]
#[serial]
fn stop_all_twice_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let stub = write_stub(dir.path(), "udp2raw-stub", LONG_RUNNING_STUB);
    let supervisor = supervisor_with_binary(&dir, &stub.display().to_string());

    supervisor.start_all(&snapshot(vec![enabled_server("srv")], vec![]));
    supervisor.stop_all();
    supervisor.stop_all();

    assert!(supervisor.status().is_empty());
    let stopping_lines = supervisor
        .get_logs(100)
        .iter()
        .filter(|line| line.contains("Stopping all tunnels"))
        .count();
    assert_eq!(stopping_lines, 1);
}

#[test]
#[serial]
fn crashed_child_reports_exit_code() {
    let dir = TempDir::new().unwrap();
    let stub = write_stub(dir.path(), "udp2raw-stub", "#!/bin/sh\necho boom\nexit 7\n");
    let supervisor = supervisor_with_binary(&dir, &stub.display().to_string());

    supervisor.start_all(&snapshot(vec![enabled_server("flappy")], vec![]));

    assert!(wait_until(Duration::from_secs(5), || {
        supervisor
            .get_logs(50)
            .iter()
            .any(|line| line.contains("[flappy] process exited with code 7"))
    }));
    let status = supervisor.status();
    assert_eq!(status.len(), 1);
    assert!(!status[0].running);
    assert_eq!(status[0].pid, None);

    supervisor.stop_all();
}

#[test]
#[serial]
fn externally_killed_child_reports_not_running() {
    let dir = TempDir::new().unwrap();
    let stub = write_stub(dir.path(), "udp2raw-stub", LONG_RUNNING_STUB);
    let supervisor = supervisor_with_binary(&dir, &stub.display().to_string());

    supervisor.start_all(&snapshot(vec![enabled_server("victim")], vec![]));
    let pid = supervisor.status()[0].pid.expect("pid of running tunnel");

    let killed = Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .expect("run kill");
    assert!(killed.success());

    assert!(wait_until(Duration::from_secs(5), || {
        let status = supervisor.status();
        status.len() == 1 && !status[0].running && status[0].pid.is_none()
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        !platform::process_alive(pid)
    }));

    supervisor.stop_all();
}

#[test]
#[serial]
fn missing_binary_is_logged_not_fatal() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor_with_binary(&dir, "utw-test-no-such-binary");

    supervisor.start_all(&snapshot(
        vec![enabled_server("a"), enabled_server("b")],
        vec![],
    ));

    assert!(supervisor.status().is_empty());
    let logs = supervisor.get_logs(50);
    let failures = logs
        .iter()
        .filter(|line| line.contains("Failed to start server"))
        .count();
    // Both instances report independently.
    assert_eq!(failures, 2);
}

#[test]
#[serial]
fn clear_logs_drops_pre_clear_records() {
    let dir = TempDir::new().unwrap();
    let stub = write_stub(dir.path(), "udp2raw-stub", LONG_RUNNING_STUB);
    let supervisor = supervisor_with_binary(&dir, &stub.display().to_string());

    supervisor.start_all(&snapshot(vec![enabled_server("srv")], vec![]));
    supervisor.stop_all();
    assert!(!supervisor.get_logs(50).is_empty());

    supervisor.clear_logs();

    let logs = supervisor.get_logs(50);
    assert_eq!(logs.len(), 1);
    assert!(logs[0].contains("Log cleared"));
    assert!(!logs.iter().any(|line| line.contains("Starting")));
}

#[test]
#[serial]
fn servers_start_before_clients() {
    let dir = TempDir::new().unwrap();
    let stub = write_stub(dir.path(), "udp2raw-stub", LONG_RUNNING_STUB);
    let supervisor = supervisor_with_binary(&dir, &stub.display().to_string());

    supervisor.start_all(&snapshot(
        vec![enabled_server("srv")],
        vec![InstanceSpec {
            enabled: true,
            alias: "cli".to_string(),
            ..InstanceSpec::default()
        }],
    ));

    let status = supervisor.status();
    assert_eq!(status.len(), 2);
    assert_eq!(status[0].id, "client_0");
    assert_eq!(status[1].id, "server_0");

    let logs = supervisor.get_logs(50);
    let server_start = logs
        .iter()
        .position(|line| line.contains("Starting server_0"))
        .expect("server start record");
    let client_start = logs
        .iter()
        .position(|line| line.contains("Starting client_0"))
        .expect("client start record");
    assert!(server_start < client_start);

    supervisor.stop_all();
}
