//! Tunnel process supervision.
//!
//! The supervisor owns the live process table and is the only component
//! allowed to mutate it. A full stop always precedes a full start, so a
//! new generation of tunnels never races an old one for ports or
//! firewall chains.

use crate::command::build_tunnel_args;
use crate::config::{ConfigSnapshot, GlobalSpec, InstanceSpec, Role, TUNNEL_BIN};
use crate::error::WardenError;
use crate::firewall::{FirewallReconciler, FIREWALL_TAG};
use crate::log_sink::LogSink;
use crate::platform;
use crate::pump::OutputPump;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Time a process gets between SIGTERM and SIGKILL.
const DEFAULT_GRACE: Duration = Duration::from_secs(2);
/// Poll interval while waiting out the grace window.
const GRACE_POLL: Duration = Duration::from_millis(50);

/// One supervised tunnel process. The table holds the owning handle;
/// pumps only get a weak reference for draining.
struct ManagedProcess {
    key: String,
    alias: String,
    child: Arc<Mutex<Child>>,
    started_at: DateTime<Utc>,
}

/// Liveness snapshot for one tracked process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelStatus {
    pub id: String,
    pub running: bool,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Tunnel binary name resolved through PATH, or an absolute path.
    pub binary: String,
    pub log_path: PathBuf,
    pub grace: Duration,
    /// Packet filter tool used by the reconciler.
    pub iptables: String,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            binary: TUNNEL_BIN.to_string(),
            log_path: default_log_path(),
            grace: DEFAULT_GRACE,
            iptables: "iptables".to_string(),
        }
    }
}

/// Runtime data (logs) goes under the system temp directory.
pub fn default_log_path() -> PathBuf {
    std::env::temp_dir().join(".utw").join("tunnel.log")
}

pub struct TunnelSupervisor {
    binary: String,
    grace: Duration,
    table: Mutex<HashMap<String, ManagedProcess>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    /// Raised at the start of `stop_all`, observed by every pump, cleared
    /// once all pumps have joined.
    stopping: Arc<AtomicBool>,
    sink: Arc<LogSink>,
    firewall: FirewallReconciler,
}

impl TunnelSupervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        Self {
            binary: options.binary,
            grace: options.grace,
            table: Mutex::new(HashMap::new()),
            pumps: Mutex::new(Vec::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            sink: Arc::new(LogSink::new(options.log_path)),
            firewall: FirewallReconciler::new(options.iptables, FIREWALL_TAG),
        }
    }

    /// Stops whatever is tracked, then starts every enabled instance from
    /// the snapshot, servers first, in list order. The stop runs even when
    /// nothing is tracked so leftover firewall state from a previous
    /// supervisor is cleaned before any port is bound. Instances are
    /// independent: one failed start never aborts the remaining ones.
    pub fn start_all(&self, snapshot: &ConfigSnapshot) {
        self.stop_all();

        if !snapshot.global.enabled {
            self.sink.system("Service is globally disabled.");
            return;
        }

        for (index, spec) in snapshot.servers.iter().enumerate() {
            if spec.enabled {
                self.start_instance(Role::Server, index, spec, &snapshot.global);
            }
        }
        for (index, spec) in snapshot.clients.iter().enumerate() {
            if spec.enabled {
                self.start_instance(Role::Client, index, spec, &snapshot.global);
            }
        }
    }

    /// Terminates every tracked process (graceful, then forced), clears
    /// the table, reconciles the firewall exactly once, and waits for all
    /// pumps to finish draining. Idempotent.
    pub fn stop_all(&self) {
        self.stopping.store(true, Ordering::SeqCst);

        let entries: Vec<ManagedProcess> = {
            let mut table = self.table.lock();
            table.drain().map(|(_, entry)| entry).collect()
        };
        if !entries.is_empty() {
            self.sink.system("Stopping all tunnels...");
        }
        for entry in entries {
            self.terminate(entry);
        }

        // Exactly once per stop cycle, even when the table was empty.
        self.firewall.reconcile();

        let pumps: Vec<JoinHandle<()>> = self.pumps.lock().drain(..).collect();
        for handle in pumps {
            let _ = handle.join();
        }

        self.stopping.store(false, Ordering::SeqCst);
    }

    /// Non-blocking liveness snapshot of the process table, sorted by id.
    pub fn status(&self) -> Vec<TunnelStatus> {
        let table = self.table.lock();
        let mut statuses: Vec<TunnelStatus> = table
            .values()
            .map(|entry| {
                let mut child = entry.child.lock();
                let running = matches!(child.try_wait(), Ok(None));
                TunnelStatus {
                    id: entry.key.clone(),
                    running,
                    pid: if running { Some(child.id()) } else { None },
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Most recent `n` log lines, oldest first.
    pub fn get_logs(&self, n: usize) -> Vec<String> {
        self.sink.tail(n)
    }

    pub fn clear_logs(&self) {
        self.sink.clear();
    }

    fn start_instance(&self, role: Role, index: usize, spec: &InstanceSpec, global: &GlobalSpec) {
        let key = format!("{}_{}", role.as_str(), index);
        if let Err(err) = self.spawn_instance(role, &key, spec, global) {
            error!(key = %key, "{err}");
            self.sink.system(&format!(
                "Failed to start {} #{} ({}): {}",
                role.as_str(),
                index + 1,
                spec.alias,
                err
            ));
        }
    }

    fn spawn_instance(
        &self,
        role: Role,
        key: &str,
        spec: &InstanceSpec,
        global: &GlobalSpec,
    ) -> Result<(), WardenError> {
        let spawn_err = |source: std::io::Error| WardenError::Spawn {
            alias: spec.alias.clone(),
            source,
        };

        let binary = which::which(&self.binary)
            .map_err(|_| WardenError::BinaryNotFound(self.binary.clone()))?;
        let args = build_tunnel_args(role, spec, global);

        self.sink.system(&format!(
            "Starting {} ({}): {} {}",
            key,
            spec.alias,
            self.binary,
            args.join(" ")
        ));

        // Both child streams share one pipe so the pump observes a single
        // arrival-ordered stream.
        let (reader, writer) = std::io::pipe().map_err(spawn_err)?;
        let writer_err = writer.try_clone().map_err(spawn_err)?;

        let mut command = Command::new(&binary);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(writer_err));
        platform::prepare_command(&mut command).map_err(spawn_err)?;

        let child = command.spawn().map_err(spawn_err)?;
        let pid = child.id();
        info!(key = %key, pid, "tunnel started");

        if let Err(err) = platform::set_nonblocking(&reader) {
            // The pump still terminates on pipe EOF, just less promptly.
            tracing::warn!(key = %key, "pipe left in blocking mode: {err}");
        }

        let child = Arc::new(Mutex::new(child));
        let entry = ManagedProcess {
            key: key.to_string(),
            alias: spec.alias.clone(),
            child: Arc::clone(&child),
            started_at: Utc::now(),
        };

        match OutputPump::spawn(
            key,
            spec.alias.clone(),
            reader,
            Arc::downgrade(&child),
            Arc::clone(&self.sink),
            Arc::clone(&self.stopping),
        ) {
            Ok(handle) => self.pumps.lock().push(handle),
            Err(err) => tracing::warn!(key = %key, "output pump not started: {err}"),
        }

        self.table.lock().insert(key.to_string(), entry);
        Ok(())
    }

    /// SIGTERM, bounded grace, then SIGKILL. The child lock is released
    /// between poll iterations so status queries and pumps stay live.
    fn terminate(&self, entry: ManagedProcess) {
        let pid = {
            let mut child = entry.child.lock();
            if let Ok(Some(_)) = child.try_wait() {
                self.sink
                    .system(&format!("{} ({}) had already exited", entry.key, entry.alias));
                return;
            }
            child.id()
        };

        platform::send_sigterm(pid);

        let deadline = Instant::now() + self.grace;
        loop {
            {
                let mut child = entry.child.lock();
                if let Ok(Some(_)) = child.try_wait() {
                    let uptime = (Utc::now() - entry.started_at).num_seconds();
                    self.sink.system(&format!(
                        "Stopped {} ({}) after {}s",
                        entry.key, entry.alias, uptime
                    ));
                    return;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(GRACE_POLL);
        }

        let mut child = entry.child.lock();
        if child.kill().is_ok() {
            let _ = child.wait();
        }
        self.sink.system(&format!(
            "Killed {} ({}) after {}ms grace",
            entry.key,
            entry.alias,
            self.grace.as_millis()
        ));
    }
}
